//! Backend Pool
//!
//! One backend service per service port, bound to the cluster instance group
//! and to the port's health check. Sync creates missing backends and repairs
//! drifted bindings; GC removes backends (and then their health checks) for
//! ports no longer desired.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cloud::{
    Backend, BackendRef, BackendServices, BackendService, HealthStatus, InstanceGroup, NamedPort,
    ResourceKind,
};
use crate::error::{Error, Pool, Result};
use crate::healthchecks::HealthCheckPool;
use crate::instances::NodePool;
use crate::utils::Namer;

pub const BACKEND_PROTOCOL: &str = "HTTP";

const KIND: ResourceKind = ResourceKind::BackendService;

/// Outcome of a garbage collection pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    /// Resources removed (or found already gone)
    pub deleted: Vec<String>,
    /// Resources still referenced by another resource; retried later
    pub deferred: Vec<String>,
}

impl GcReport {
    pub fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    pub fn merge(&mut self, other: GcReport) {
        self.deleted.extend(other.deleted);
        self.deferred.extend(other.deferred);
    }
}

/// Group health as reported through one backend service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendHealth {
    pub backend: String,
    pub port: u16,
    pub instances: Vec<HealthStatus>,
}

impl BackendHealth {
    pub fn all_healthy(&self) -> bool {
        self.instances.iter().all(|s| s.health_state == "HEALTHY")
    }
}

enum Deletion {
    Deleted,
    Deferred,
}

pub struct BackendPool {
    cloud: Arc<dyn BackendServices>,
    health_checks: HealthCheckPool,
    node_pool: Arc<NodePool>,
    namer: Namer,
}

impl BackendPool {
    pub fn new(
        cloud: Arc<dyn BackendServices>,
        health_checks: HealthCheckPool,
        node_pool: Arc<NodePool>,
        namer: Namer,
    ) -> Self {
        Self {
            cloud,
            health_checks,
            node_pool,
            namer,
        }
    }

    pub fn health_checks(&self) -> &HealthCheckPool {
        &self.health_checks
    }

    /// Backend service for `port`; NotFound if it does not exist.
    pub async fn get(&self, port: u16) -> Result<BackendService> {
        let name = self.namer.be_name(port);
        self.cloud
            .get_backend_service(&name)
            .await
            .map_err(|e| Error::cloud(Pool::Backends, "get", KIND, name, e))
    }

    /// Weak reference to the backend for `port`, for URL map building
    pub async fn get_ref(&self, port: u16) -> Result<BackendRef> {
        self.get(port).await.map(|be| BackendRef::from(&be))
    }

    /// Backend services whose names this cluster's namer produced
    pub async fn list_owned(&self) -> Result<Vec<BackendService>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|be| self.namer.be_port(&be.name).is_some())
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<BackendService>> {
        self.cloud
            .list_backend_services()
            .await
            .map_err(|e| Error::cloud(Pool::Backends, "list", KIND, "*", e))
    }

    /// Ensure a correctly bound backend exists for every port in `ports`.
    pub async fn sync(&self, ports: &BTreeSet<u16>) -> Result<Vec<BackendRef>> {
        let mut refs = Vec::with_capacity(ports.len());
        for &port in ports {
            refs.push(self.sync_port(port).await?);
        }
        Ok(refs)
    }

    async fn sync_port(&self, port: u16) -> Result<BackendRef> {
        let ig_name = self.node_pool.group_name();
        let (ig, named_port) = self.node_pool.add_instance_group(&ig_name, port).await?;

        let existing = match self.get(port).await {
            Ok(be) => Some(be),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let hc = self.health_checks.ensure(port, existing.is_some()).await?;

        let existing = match existing {
            Some(be) => be,
            None => match self.create(port, &ig, &named_port, &hc.self_link).await {
                Ok(be) => return Ok(BackendRef::from(&be)),
                Err(e) if e.cloud_error().is_some_and(|c| c.is_conflict()) => {
                    debug!("Backend for port {} appeared concurrently", port);
                    self.get(port).await?
                }
                Err(e) => return Err(e),
            },
        };

        let desired = bind(existing.clone(), &ig, &named_port, &hc.self_link);
        if same_bindings(&existing, &desired) {
            debug!("Backend {} up to date", existing.name);
        } else {
            self.update(&desired).await?;
        }
        Ok(BackendRef::from(&existing))
    }

    async fn create(
        &self,
        port: u16,
        ig: &InstanceGroup,
        named_port: &NamedPort,
        hc_link: &str,
    ) -> Result<BackendService> {
        let base = BackendService {
            name: self.namer.be_name(port),
            protocol: BACKEND_PROTOCOL.to_string(),
            port,
            ..Default::default()
        };
        let be = bind(base, ig, named_port, hc_link);
        info!("Creating backend service {} for port {}", be.name, port);
        self.cloud
            .create_backend_service(&be)
            .await
            .map_err(|e| Error::cloud(Pool::Backends, "create", KIND, &be.name, e))
    }

    async fn update(&self, be: &BackendService) -> Result<()> {
        info!("Updating bindings of backend service {}", be.name);
        self.cloud
            .update_backend_service(be)
            .await
            .map_err(|e| Error::cloud(Pool::Backends, "update", KIND, &be.name, e))
    }

    /// Delete backend service `name`. NotFound is returned to the caller.
    pub async fn delete(&self, name: &str) -> Result<()> {
        info!("Deleting backend service {}", name);
        self.cloud
            .delete_backend_service(name)
            .await
            .map_err(|e| Error::cloud(Pool::Backends, "delete", KIND, name, e))
    }

    /// Delete every owned backend whose port is not in `ports`, then every
    /// owned health check no remaining backend references.
    pub async fn gc(&self, ports: &BTreeSet<u16>) -> Result<GcReport> {
        let keep: BTreeSet<String> = ports.iter().map(|p| self.namer.be_name(*p)).collect();
        let mut report = GcReport::default();

        for be in self.list_owned().await? {
            if keep.contains(&be.name) {
                continue;
            }
            let outcome = tolerate(self.delete(&be.name).await, &be.name)?;
            record(&mut report, outcome, be.name);
        }

        let referenced: BTreeSet<String> = self
            .list_all()
            .await?
            .into_iter()
            .flat_map(|be| be.health_checks)
            .collect();
        for hc in self.health_checks.list_owned().await? {
            if keep.contains(&hc.name) || referenced.contains(&hc.self_link) {
                continue;
            }
            let outcome = tolerate(self.health_checks.delete(&hc.name).await, &hc.name)?;
            record(&mut report, outcome, hc.name);
        }

        if !report.deleted.is_empty() || report.has_deferred() {
            info!(
                "Backend GC deleted {:?}, deferred {:?}",
                report.deleted, report.deferred
            );
        }
        Ok(report)
    }

    /// Health of every instance behind the backend for `port`.
    pub async fn status(&self, port: u16) -> Result<BackendHealth> {
        let be = self.get(port).await?;
        let mut instances = Vec::new();
        for backend in &be.backends {
            let statuses = self
                .cloud
                .get_health(&be.name, &backend.group)
                .await
                .map_err(|e| Error::cloud(Pool::Backends, "get health", KIND, &be.name, e))?;
            instances.extend(statuses);
        }
        Ok(BackendHealth {
            backend: be.name,
            port,
            instances,
        })
    }
}

/// Point `be` at the instance group and health check it should use.
fn bind(mut be: BackendService, ig: &InstanceGroup, named_port: &NamedPort, hc_link: &str) -> BackendService {
    be.port_name = named_port.name.clone();
    be.backends = vec![Backend {
        group: ig.self_link.clone(),
    }];
    be.health_checks = vec![hc_link.to_string()];
    be
}

fn same_bindings(a: &BackendService, b: &BackendService) -> bool {
    a.backends == b.backends && a.health_checks == b.health_checks && a.port_name == b.port_name
}

/// Map a delete result onto GC outcomes: NotFound counts as deleted, in-use
/// is deferred, anything else is an error.
fn tolerate(result: Result<()>, name: &str) -> Result<Deletion> {
    match result {
        Ok(()) => Ok(Deletion::Deleted),
        Err(e) if e.is_not_found() => {
            warn!("{} already deleted", name);
            Ok(Deletion::Deleted)
        }
        Err(e) if e.is_in_use() => {
            warn!("{} still in use, deferring delete: {}", name, e);
            Ok(Deletion::Deferred)
        }
        Err(e) => Err(e),
    }
}

fn record(report: &mut GcReport, outcome: Deletion, name: String) {
    match outcome {
        Deletion::Deleted => report.deleted.push(name),
        Deletion::Deferred => report.deferred.push(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::fake::{Call, FakeCloud};
    use crate::cloud::{CloudError, LoadBalancers, UrlMapResource};

    const ZONE: &str = "zone-a";

    fn ports(p: &[u16]) -> BTreeSet<u16> {
        p.iter().copied().collect()
    }

    fn pool(cloud: &Arc<FakeCloud>) -> BackendPool {
        let namer = Namer::new("uid1");
        let node_pool = Arc::new(NodePool::new(cloud.clone(), namer.clone(), ZONE));
        let hcs = HealthCheckPool::new(cloud.clone(), namer.clone(), "/");
        BackendPool::new(cloud.clone(), hcs, node_pool, namer)
    }

    #[tokio::test]
    async fn test_sync_creates_bound_backend() {
        let cloud = Arc::new(FakeCloud::new());
        let backends = pool(&cloud);

        let refs = backends.sync(&ports(&[80])).await.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "k8s-be-80--uid1");

        let be = backends.get(80).await.unwrap();
        let hc = backends.health_checks().get("k8s-be-80--uid1").await.unwrap();
        assert_eq!(be.protocol, BACKEND_PROTOCOL);
        assert_eq!(be.health_checks, vec![hc.self_link]);
        assert_eq!(be.backends.len(), 1);
        assert!(be.backends[0].group.ends_with("/instanceGroups/k8s-ig--uid1"));
    }

    #[tokio::test]
    async fn test_sync_twice_is_noop() {
        let cloud = Arc::new(FakeCloud::new());
        let backends = pool(&cloud);
        backends.sync(&ports(&[80, 443])).await.unwrap();

        cloud.clear_calls();
        backends.sync(&ports(&[80, 443])).await.unwrap();
        assert!(cloud.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_sync_repairs_drifted_bindings() {
        let cloud = Arc::new(FakeCloud::new());
        let backends = pool(&cloud);
        backends.sync(&ports(&[80])).await.unwrap();

        let mut be = backends.get(80).await.unwrap();
        be.backends.clear();
        cloud.update_backend_service(&be).await.unwrap();

        cloud.clear_calls();
        backends.sync(&ports(&[80])).await.unwrap();
        assert_eq!(
            cloud.mutations(),
            vec![Call::Update {
                kind: KIND,
                name: "k8s-be-80--uid1".to_string()
            }]
        );
        assert_eq!(backends.get(80).await.unwrap().backends.len(), 1);
    }

    #[tokio::test]
    async fn test_gc_deletes_backend_then_health_check() {
        let cloud = Arc::new(FakeCloud::new());
        let backends = pool(&cloud);
        backends.sync(&ports(&[80, 443])).await.unwrap();

        let report = backends.gc(&ports(&[443])).await.unwrap();
        assert_eq!(report.deleted, vec!["k8s-be-80--uid1", "k8s-be-80--uid1"]);
        assert!(!report.has_deferred());

        assert!(backends.get(80).await.unwrap_err().is_not_found());
        assert!(backends.get(443).await.is_ok());
        assert_eq!(
            cloud.names(ResourceKind::HealthCheck),
            vec!["k8s-be-443--uid1"]
        );
        let deletes: Vec<_> = cloud
            .mutations()
            .into_iter()
            .filter(|c| matches!(c, Call::Delete { .. }))
            .map(|c| c.kind())
            .collect();
        assert_eq!(deletes, vec![ResourceKind::BackendService, ResourceKind::HealthCheck]);
    }

    #[tokio::test]
    async fn test_gc_tolerates_already_deleted_health_check() {
        let cloud = Arc::new(FakeCloud::new());
        let backends = pool(&cloud);
        backends.sync(&ports(&[80, 443])).await.unwrap();
        cloud.fail_next(
            |c| matches!(c, Call::Delete { kind: ResourceKind::HealthCheck, .. }),
            CloudError::not_found(ResourceKind::HealthCheck, "k8s-be-80--uid1"),
        );

        let report = backends.gc(&ports(&[443])).await.unwrap();
        assert_eq!(report.deleted.len(), 2);
    }

    #[tokio::test]
    async fn test_gc_leaves_foreign_backends() {
        let cloud = Arc::new(FakeCloud::new());
        backends_for(&cloud, "other").sync(&ports(&[80])).await.unwrap();
        let ours = pool(&cloud);
        ours.sync(&ports(&[81])).await.unwrap();

        let report = ours.gc(&BTreeSet::new()).await.unwrap();
        assert_eq!(report.deleted, vec!["k8s-be-81--uid1", "k8s-be-81--uid1"]);
        assert_eq!(
            cloud.names(ResourceKind::BackendService),
            vec!["k8s-be-80--other"]
        );
    }

    fn backends_for(cloud: &Arc<FakeCloud>, cluster: &str) -> BackendPool {
        let namer = Namer::new(cluster);
        let node_pool = Arc::new(NodePool::new(cloud.clone(), namer.clone(), ZONE));
        let hcs = HealthCheckPool::new(cloud.clone(), namer.clone(), "/");
        BackendPool::new(cloud.clone(), hcs, node_pool, namer)
    }

    #[tokio::test]
    async fn test_gc_defers_backend_in_use() {
        let cloud = Arc::new(FakeCloud::new());
        let backends = pool(&cloud);
        let refs = backends.sync(&ports(&[80])).await.unwrap();
        cloud
            .create_url_map(&UrlMapResource {
                name: "k8s-um-lb".to_string(),
                default_service: refs[0].self_link.clone(),
                ..Default::default()
            })
            .await
            .unwrap();

        let report = backends.gc(&BTreeSet::new()).await.unwrap();
        assert_eq!(report.deferred, vec!["k8s-be-80--uid1"]);
        assert!(report.deleted.is_empty());
        assert!(backends.get(80).await.is_ok());
    }

    #[tokio::test]
    async fn test_status_reports_member_health() {
        let cloud = Arc::new(FakeCloud::new());
        let backends = pool(&cloud);
        backends.sync(&ports(&[80])).await.unwrap();
        backends
            .node_pool
            .sync(&["n1".to_string(), "n2".to_string()].into_iter().collect())
            .await
            .unwrap();

        let health = backends.status(80).await.unwrap();
        assert_eq!(health.backend, "k8s-be-80--uid1");
        assert_eq!(health.instances.len(), 2);
        assert!(health.all_healthy());
    }

    #[tokio::test]
    async fn test_status_of_missing_backend_is_error() {
        let cloud = Arc::new(FakeCloud::new());
        let err = pool(&cloud).status(8080).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_sync_failure_leaves_partial_state() {
        let cloud = Arc::new(FakeCloud::new());
        let backends = pool(&cloud);
        cloud.fail_next(
            |c| matches!(c, Call::Create { kind: ResourceKind::BackendService, .. }),
            CloudError::api(503, "backendError", "unavailable"),
        );

        let err = backends.sync(&ports(&[80])).await.unwrap_err();
        assert!(err.is_transient());
        // the health check stays; the next sync only creates the backend
        assert_eq!(cloud.names(ResourceKind::HealthCheck).len(), 1);

        cloud.clear_calls();
        backends.sync(&ports(&[80])).await.unwrap();
        assert_eq!(
            cloud.mutations(),
            vec![Call::Create {
                kind: KIND,
                name: "k8s-be-80--uid1".to_string()
            }]
        );
    }
}
