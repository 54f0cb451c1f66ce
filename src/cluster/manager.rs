//! Cluster Manager
//!
//! Owns one of each pool and runs a sync cycle in strict dependency order:
//! node membership, backends (with their health checks), backend GC, URL map
//! building, load balancers, load balancer GC. A failed step aborts the rest
//! of the cycle and leaves applied mutations in place; the next cycle picks
//! up from whatever state the provider is in.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::context::SyncContext;
use super::desired::DesiredState;
use crate::backends::{BackendHealth, BackendPool, GcReport};
use crate::cloud::Cloud;
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::healthchecks::HealthCheckPool;
use crate::instances::{MembershipDelta, NodePool};
use crate::loadbalancers::{LoadBalancer, LoadBalancerPool, LoadBalancerStatus};
use crate::utils::Namer;

/// Settings the manager needs from the controller configuration
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub cluster_name: String,
    pub zone: String,
    pub default_backend_port: Option<u16>,
    pub health_check_path: String,
}

impl From<&ControllerConfig> for ManagerOptions {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            cluster_name: config.cluster_name.clone(),
            zone: config.zone.clone(),
            default_backend_port: config.default_backend_port,
            health_check_path: config.health_check_path.clone(),
        }
    }
}

/// What one sync cycle did
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub membership: MembershipDelta,
    /// Backend services the cycle ensured, by name
    pub backends: Vec<String>,
    pub backend_gc: GcReport,
    pub load_balancers: Vec<LoadBalancerStatus>,
    pub load_balancer_gc: GcReport,
}

impl SyncReport {
    /// Text dump of every load balancer's routes
    pub fn url_map_dump(&self) -> String {
        self.load_balancers
            .iter()
            .map(|lb| format!("# {}\n{}", lb.name, lb.routes))
            .collect()
    }
}

pub struct ClusterManager {
    namer: Namer,
    node_pool: Arc<NodePool>,
    backend_pool: Arc<BackendPool>,
    lb_pool: LoadBalancerPool,
    default_backend_port: Option<u16>,
    /// Held for the whole of a cycle; cycles never overlap
    cycle_lock: Mutex<()>,
}

/// Log a failed step with its context and pass the error through.
fn logged<T>(step: &str, result: Result<T>) -> Result<T> {
    if let Err(ref e) = result {
        match e {
            Error::Cloud {
                pool,
                operation,
                kind,
                resource,
                source,
            } => error!(
                step = step,
                pool = %pool,
                operation = operation,
                kind = %kind,
                resource = %resource,
                error = %source,
                "Sync step failed"
            ),
            other => error!(step = step, error = %other, "Sync step failed"),
        }
    }
    result
}

impl ClusterManager {
    pub fn new<C: Cloud + 'static>(cloud: Arc<C>, options: ManagerOptions) -> Self {
        let namer = Namer::new(options.cluster_name);
        let node_pool = Arc::new(NodePool::new(cloud.clone(), namer.clone(), options.zone));
        let health_checks =
            HealthCheckPool::new(cloud.clone(), namer.clone(), options.health_check_path);
        let backend_pool = Arc::new(BackendPool::new(
            cloud.clone(),
            health_checks,
            node_pool.clone(),
            namer.clone(),
        ));
        let lb_pool = LoadBalancerPool::new(cloud, backend_pool.clone(), namer.clone());
        Self {
            namer,
            node_pool,
            backend_pool,
            lb_pool,
            default_backend_port: options.default_backend_port,
            cycle_lock: Mutex::new(()),
        }
    }

    pub fn namer(&self) -> &Namer {
        &self.namer
    }

    pub fn node_pool(&self) -> &NodePool {
        &self.node_pool
    }

    pub fn backend_pool(&self) -> &BackendPool {
        &self.backend_pool
    }

    pub fn load_balancer_pool(&self) -> &LoadBalancerPool {
        &self.lb_pool
    }

    /// Run one sync cycle against `desired`.
    pub async fn sync(&self, desired: &DesiredState, ctx: &SyncContext) -> Result<SyncReport> {
        let _cycle = self.cycle_lock.lock().await;
        let started_at = Utc::now();
        let default_port = self.default_backend_port;

        ctx.checkpoint("node sync")?;
        let membership = logged("node sync", self.node_pool.sync(&desired.nodes).await)?;

        ctx.checkpoint("backend sync")?;
        let ports = desired.service_ports(default_port);
        let backends = logged("backend sync", self.backend_pool.sync(&ports).await)?;

        ctx.checkpoint("backend gc")?;
        let mut backend_gc = logged("backend gc", self.backend_pool.gc(&ports).await)?;

        ctx.checkpoint("url map build")?;
        let specs = logged("url map build", desired.load_balancer_specs(default_port))?;

        ctx.checkpoint("load balancer sync")?;
        let load_balancers = logged("load balancer sync", self.lb_pool.sync(&specs).await)?;

        ctx.checkpoint("load balancer gc")?;
        let load_balancer_gc = logged(
            "load balancer gc",
            self.lb_pool.gc(&self.lb_pool.names(&specs)).await,
        )?;

        // Backends that were still routed to before LB GC can go now
        if backend_gc.has_deferred() {
            ctx.checkpoint("deferred backend gc")?;
            let retried = logged("deferred backend gc", self.backend_pool.gc(&ports).await)?;
            backend_gc.deferred = retried.deferred;
            backend_gc.deleted.extend(retried.deleted);
            if backend_gc.has_deferred() {
                warn!("Backend deletes still deferred: {:?}", backend_gc.deferred);
            }
        }

        let report = SyncReport {
            started_at,
            finished_at: Utc::now(),
            membership,
            backends: backends.into_iter().map(|b| b.name).collect(),
            backend_gc,
            load_balancers,
            load_balancer_gc,
        };
        info!(
            "Sync complete: {} node(s), {} backend(s), {} load balancer(s)",
            desired.nodes.len(),
            report.backends.len(),
            report.load_balancers.len()
        );
        Ok(report)
    }

    /// Delete every load balancer, backend and health check this cluster
    /// owns, then the instance group.
    pub async fn shutdown(&self, ctx: &SyncContext) -> Result<GcReport> {
        let _cycle = self.cycle_lock.lock().await;
        info!("Deleting all cluster load-balancing resources");
        let no_lbs: BTreeSet<String> = BTreeSet::new();
        let no_ports: BTreeSet<u16> = BTreeSet::new();

        ctx.checkpoint("load balancer gc")?;
        let mut report = logged("load balancer gc", self.lb_pool.gc(&no_lbs).await)?;

        ctx.checkpoint("backend gc")?;
        report.merge(logged("backend gc", self.backend_pool.gc(&no_ports).await)?);

        ctx.checkpoint("instance group delete")?;
        let ig = self.node_pool.group_name();
        match self.node_pool.delete_instance_group(&ig).await {
            Ok(()) => report.deleted.push(ig),
            Err(e) if e.is_not_found() => {}
            Err(e) if e.is_in_use() => {
                warn!("Instance group {} still in use: {}", ig, e);
                report.deferred.push(ig);
            }
            Err(e) => return logged("instance group delete", Err(e)),
        }
        Ok(report)
    }

    /// Group health behind the backend for `port`
    pub async fn backend_status(&self, port: u16) -> Result<BackendHealth> {
        self.backend_pool.status(port).await
    }

    /// Observed resources of load balancer `lb_name`
    pub async fn load_balancer(&self, lb_name: &str) -> Result<LoadBalancer> {
        self.lb_pool.get(lb_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::fake::{Call, FakeCloud};
    use crate::cloud::ResourceKind;
    use crate::cluster::desired::{IngressSpec, RoutingRule};

    fn manager(cloud: &Arc<FakeCloud>, default_backend_port: Option<u16>) -> ClusterManager {
        ClusterManager::new(
            cloud.clone(),
            ManagerOptions {
                cluster_name: "uid1".into(),
                zone: "zone-a".into(),
                default_backend_port,
                health_check_path: "/".into(),
            },
        )
    }

    fn desired(nodes: &[&str], ports: &[u16]) -> DesiredState {
        DesiredState {
            nodes: nodes.iter().map(|s| s.to_string()).collect(),
            ingresses: vec![IngressSpec {
                name: "default/foo".into(),
                rules: ports
                    .iter()
                    .map(|p| RoutingRule {
                        host: format!("h{}.com", p),
                        path: "/".into(),
                        port: *p,
                    })
                    .collect(),
                default_port: None,
                ip: None,
                static_ip: false,
            }],
        }
    }

    #[tokio::test]
    async fn test_sync_report() {
        let cloud = Arc::new(FakeCloud::new());
        let mgr = manager(&cloud, Some(30000));
        let report = mgr
            .sync(&desired(&["n1"], &[80]), &SyncContext::unbounded())
            .await
            .unwrap();
        assert_eq!(report.membership.added, vec!["n1"]);
        assert_eq!(report.backends, vec!["k8s-be-80--uid1", "k8s-be-30000--uid1"]);
        assert_eq!(report.load_balancers.len(), 1);
        assert!(report.url_map_dump().contains("# default-foo--uid1"));
        assert!(report.finished_at >= report.started_at);
    }

    #[tokio::test]
    async fn test_removed_port_is_collected_after_url_map_moves() {
        let cloud = Arc::new(FakeCloud::new());
        let mgr = manager(&cloud, None);
        let ctx = SyncContext::unbounded();
        mgr.sync(&desired(&["n1"], &[80, 81]), &ctx).await.unwrap();

        // port 81 is still routed to when backend GC first runs
        let report = mgr.sync(&desired(&["n1"], &[80]), &ctx).await.unwrap();
        assert!(report.backend_gc.deferred.is_empty());
        assert!(report
            .backend_gc
            .deleted
            .contains(&"k8s-be-81--uid1".to_string()));
        assert_eq!(
            cloud.names(ResourceKind::BackendService),
            vec!["k8s-be-80--uid1"]
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_start_makes_no_calls() {
        let cloud = Arc::new(FakeCloud::new());
        let mgr = manager(&cloud, None);
        let ctx = SyncContext::unbounded();
        ctx.cancel_token().cancel();

        let err = mgr.sync(&desired(&["n1"], &[80]), &ctx).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_removes_everything() {
        let cloud = Arc::new(FakeCloud::new());
        let mgr = manager(&cloud, None);
        let ctx = SyncContext::unbounded();
        mgr.sync(&desired(&["n1", "n2"], &[80, 443]), &ctx)
            .await
            .unwrap();

        let report = mgr.shutdown(&ctx).await.unwrap();
        assert!(report.deferred.is_empty());
        for kind in [
            ResourceKind::ForwardingRule,
            ResourceKind::TargetProxy,
            ResourceKind::UrlMap,
            ResourceKind::BackendService,
            ResourceKind::HealthCheck,
            ResourceKind::InstanceGroup,
        ] {
            assert!(cloud.names(kind).is_empty(), "{} left behind", kind);
        }
        assert!(matches!(
            cloud.mutations().last(),
            Some(Call::Delete { kind: ResourceKind::InstanceGroup, .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_twice_is_clean() {
        let cloud = Arc::new(FakeCloud::new());
        let mgr = manager(&cloud, None);
        let ctx = SyncContext::unbounded();
        mgr.sync(&desired(&["n1"], &[80]), &ctx).await.unwrap();
        mgr.shutdown(&ctx).await.unwrap();
        let again = mgr.shutdown(&ctx).await.unwrap();
        assert!(again.deleted.is_empty());
    }
}
