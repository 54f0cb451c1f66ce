//! Controller loop - periodically converges the provider on the desired state
//!
//! Every tick reads the desired state, validates it and runs one sync cycle
//! under a deadline. Transient failures are retried with backoff inside the
//! cycle; anything else is recorded and left for the next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cluster::{ClusterManager, SyncContext, SyncReport};
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::server::AppState;
use crate::state::ClusterStateSource;

/// Configuration for the controller loop
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Time between the starts of two cycles
    pub resync_interval: Duration,
    /// Budget for one cycle, retries included
    pub cycle_deadline: Duration,
    pub retry: RetryConfig,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self::from(&ControllerConfig::default())
    }
}

impl From<&ControllerConfig> for ControllerOptions {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            resync_interval: config.resync_interval(),
            cycle_deadline: config.cycle_deadline(),
            retry: config.retry_config(),
        }
    }
}

/// Run one cycle: read, validate and sync, retrying transient failures until
/// the cycle deadline passes or `cancel` fires.
pub async fn run_cycle(
    manager: &ClusterManager,
    source: &dyn ClusterStateSource,
    options: &ControllerOptions,
    cancel: &CancellationToken,
) -> Result<SyncReport> {
    let ctx = &SyncContext::new(cancel.child_token(), options.cycle_deadline);

    retry_with_backoff(
        &options.retry,
        "sync",
        |e: &Error| e.is_transient() && ctx.checkpoint("retry").is_ok(),
        move || async move {
            let desired = source
                .desired_state()
                .await
                .map_err(|e| Error::State(e.to_string()))?;
            desired.validate()?;
            manager.sync(&desired, ctx).await
        },
    )
    .await
}

/// Spawn the controller as a background task. Cancel the returned token to
/// stop it; an in-flight cycle stops at its next step boundary.
pub fn spawn_controller(
    manager: Arc<ClusterManager>,
    source: Arc<dyn ClusterStateSource>,
    state: AppState,
    options: ControllerOptions,
) -> (CancellationToken, JoinHandle<()>) {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let handle = tokio::spawn(async move {
        let mut ticker = interval(options.resync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Controller started, syncing every {}s",
            options.resync_interval.as_secs()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match run_cycle(&manager, source.as_ref(), &options, &token).await {
                        Ok(report) => {
                            debug!("Cycle finished at {}", report.finished_at);
                            state.record_success(report).await;
                        }
                        Err(Error::Cancelled(step)) => {
                            info!("Cycle cancelled before {}", step);
                            state.record_failure(format!("cancelled before {}", step)).await;
                        }
                        Err(e) => {
                            error!("Sync cycle failed: {}", e);
                            state.record_failure(e.to_string()).await;
                        }
                    }
                }
                _ = token.cancelled() => {
                    info!("Controller shutting down");
                    break;
                }
            }
        }
    });

    (cancel, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::fake::{Call, FakeCloud};
    use crate::cloud::{CloudError, ResourceKind};
    use crate::cluster::{DesiredState, IngressSpec, ManagerOptions, RoutingRule};
    use crate::state::StaticStateSource;

    fn manager(cloud: &Arc<FakeCloud>) -> Arc<ClusterManager> {
        Arc::new(ClusterManager::new(
            cloud.clone(),
            ManagerOptions {
                cluster_name: "uid1".into(),
                zone: "zone-a".into(),
                default_backend_port: None,
                health_check_path: "/".into(),
            },
        ))
    }

    fn options(max_attempts: u32) -> ControllerOptions {
        ControllerOptions {
            resync_interval: Duration::from_millis(20),
            cycle_deadline: Duration::from_secs(10),
            retry: RetryConfig {
                max_attempts,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_multiplier: 2.0,
            },
        }
    }

    fn desired() -> DesiredState {
        DesiredState {
            nodes: ["n1".to_string()].into_iter().collect(),
            ingresses: vec![IngressSpec {
                name: "default/foo".into(),
                rules: vec![RoutingRule {
                    host: "foo.bar.com".into(),
                    path: "/foo".into(),
                    port: 80,
                }],
                default_port: None,
                ip: None,
                static_ip: false,
            }],
        }
    }

    #[test]
    fn test_options_from_config() {
        let config = ControllerConfig::default();
        let opts = ControllerOptions::from(&config);
        assert_eq!(opts.resync_interval, config.resync_interval());
        assert_eq!(opts.retry.max_attempts, config.retry.max_attempts);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let cloud = Arc::new(FakeCloud::new());
        cloud.fail_next(
            |c| matches!(c, Call::Create { kind: ResourceKind::BackendService, .. }),
            CloudError::api(503, "backendError", "try again"),
        );
        let mgr = manager(&cloud);
        let source = StaticStateSource::new(desired());

        let report = run_cycle(&mgr, &source, &options(3), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.backends, vec!["k8s-be-80--uid1"]);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let cloud = Arc::new(FakeCloud::new());
        cloud.fail_next(
            |c| matches!(c, Call::Create { kind: ResourceKind::BackendService, .. }),
            CloudError::api(403, "forbidden", "no"),
        );
        let mgr = manager(&cloud);
        let source = StaticStateSource::new(desired());

        let err = run_cycle(&mgr, &source, &options(3), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.cloud_error().is_some_and(|e| e.is_http_code(403)));
        let creates = cloud
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Create { kind: ResourceKind::BackendService, .. }))
            .count();
        assert_eq!(creates, 1);
    }

    #[tokio::test]
    async fn test_invalid_desired_state_makes_no_calls() {
        let cloud = Arc::new(FakeCloud::new());
        let mgr = manager(&cloud);
        let mut bad = desired();
        bad.ingresses[0].rules[0].port = 0;
        let source = StaticStateSource::new(bad);

        let err = run_cycle(&mgr, &source, &options(3), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::State(_)));
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_cycle() {
        let cloud = Arc::new(FakeCloud::new());
        let mgr = manager(&cloud);
        let source = StaticStateSource::new(desired());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = run_cycle(&mgr, &source, &options(3), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_spawned_controller_records_cycles() {
        let cloud = Arc::new(FakeCloud::new());
        let mgr = manager(&cloud);
        let state = AppState::new(mgr.clone());
        let source: Arc<dyn ClusterStateSource> = Arc::new(StaticStateSource::new(desired()));

        let (cancel, handle) = spawn_controller(mgr, source, state.clone(), options(1));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        let snap = state.snapshot().await;
        assert!(snap.cycles >= 1);
        assert_eq!(snap.failures, 0);
        assert_eq!(cloud.members("k8s-ig--uid1", "zone-a"), vec!["n1"]);
    }
}
