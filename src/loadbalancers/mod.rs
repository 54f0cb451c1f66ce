//! Load Balancer Pool
//!
//! An L7 load balancer is the chain forwarding rule -> target proxy -> URL map
//! -> backend services, plus an optional reserved static IP. Sync walks the
//! chain from the URL map outward and repairs each edge that points at the
//! wrong resource; teardown walks it in the opposite direction.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backends::{BackendPool, GcReport};
use crate::cloud::{
    ignore_not_found, Address, BackendRef, CloudError, ForwardingRule, HostRule, LoadBalancers,
    PathMatcher, PathRule, ResourceKind, TargetHttpProxy, UrlMapResource,
};
use crate::error::{Error, Pool, Result};
use crate::utils::{compare_links, Namer, UrlMap};

/// Port range of every HTTP forwarding rule
pub const DEFAULT_PORT_RANGE: &str = "80-80";

pub const IP_PROTOCOL: &str = "TCP";

/// A load balancer the cluster wants, before backend resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerSpec {
    /// Logical key, e.g. `namespace/ingress`
    pub key: String,
    /// Routes to service ports, including the default backend entry
    pub url_map: UrlMap<u16>,
    /// Requested external IP; ephemeral when absent
    pub ip: Option<String>,
    /// Promote the forwarding rule IP to a reserved static IP
    pub static_ip: bool,
}

/// Ownership record stored in a URL map's description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlMapOwner {
    pub cluster: String,
    pub load_balancer: String,
}

impl UrlMapOwner {
    pub fn describe(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn parse(description: &str) -> Option<Self> {
        serde_json::from_str(description).ok()
    }
}

/// Converged state of one load balancer after sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadBalancerStatus {
    pub name: String,
    pub url_map: String,
    pub target_proxy: String,
    pub forwarding_rule: String,
    pub ip: String,
    pub static_ip: Option<String>,
    /// Human-readable dump of the resolved routes
    pub routes: String,
}

/// Observed resources of one load balancer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancer {
    pub name: String,
    pub url_map: UrlMapResource,
    pub target_proxy: Option<TargetHttpProxy>,
    pub forwarding_rule: Option<ForwardingRule>,
    pub static_ip: Option<Address>,
}

impl LoadBalancer {
    pub fn ip(&self) -> Option<&str> {
        self.forwarding_rule.as_ref().map(|fr| fr.ip_address.as_str())
    }
}

/// Build the provider URL map for resolved routes.
///
/// Every host gets its own path matcher whose default is the load balancer
/// default; paths whose backend could not be resolved are left out.
pub fn build_url_map(
    namer: &Namer,
    name: &str,
    description: String,
    default: &BackendRef,
    routes: &UrlMap<BackendRef>,
) -> UrlMapResource {
    let mut host_rules = Vec::new();
    let mut path_matchers = Vec::new();
    for (host, paths) in routes.hosts() {
        let matcher = namer.path_matcher_name(host);
        host_rules.push(HostRule {
            hosts: vec![host.to_string()],
            path_matcher: matcher.clone(),
        });
        path_matchers.push(PathMatcher {
            name: matcher,
            default_service: default.self_link.clone(),
            path_rules: paths
                .iter()
                .filter_map(|(path, be)| {
                    be.as_ref().map(|be| PathRule {
                        paths: vec![path.clone()],
                        service: be.self_link.clone(),
                    })
                })
                .collect(),
        });
    }
    UrlMapResource {
        name: name.to_string(),
        description,
        default_service: default.self_link.clone(),
        host_rules,
        path_matchers,
        ..Default::default()
    }
}

fn err(operation: &'static str, kind: ResourceKind, name: &str, e: CloudError) -> Error {
    Error::cloud(Pool::LoadBalancers, operation, kind, name, e)
}

/// NotFound on delete means already gone.
fn tolerate_missing(result: std::result::Result<(), CloudError>, kind: ResourceKind, name: &str) -> std::result::Result<(), CloudError> {
    match result {
        Err(e) if e.is_not_found() => {
            debug!("{} {} already deleted", kind, name);
            Ok(())
        }
        other => other,
    }
}

pub struct LoadBalancerPool {
    cloud: Arc<dyn LoadBalancers>,
    backends: Arc<BackendPool>,
    namer: Namer,
}

impl LoadBalancerPool {
    pub fn new(cloud: Arc<dyn LoadBalancers>, backends: Arc<BackendPool>, namer: Namer) -> Self {
        Self {
            cloud,
            backends,
            namer,
        }
    }

    /// Converge every load balancer in `specs`.
    pub async fn sync(&self, specs: &[LoadBalancerSpec]) -> Result<Vec<LoadBalancerStatus>> {
        let mut statuses = Vec::with_capacity(specs.len());
        for spec in specs {
            statuses.push(self.sync_one(spec).await?);
        }
        Ok(statuses)
    }

    async fn sync_one(&self, spec: &LoadBalancerSpec) -> Result<LoadBalancerStatus> {
        let lb_name = self.namer.lb_name(&spec.key);
        let mut routes = self.resolve(spec).await?;
        let dump = routes.to_string();
        let default = routes.get_default_backend().ok_or_else(|| {
            Error::invariant(format!("load balancer {} has no default backend", spec.key))
        })?;

        let owner = UrlMapOwner {
            cluster: self.namer.cluster_name.clone(),
            load_balancer: lb_name.clone(),
        };
        let desired = build_url_map(
            &self.namer,
            &self.namer.url_map_name(&lb_name),
            owner.describe(),
            &default,
            &routes,
        );

        let url_map = self.check_url_map(desired).await?;
        let proxy = self.check_proxy(&lb_name, &url_map).await?;
        let reserved = if spec.static_ip {
            self.get_static_ip(&lb_name).await?
        } else {
            None
        };
        let ip = spec
            .ip
            .clone()
            .or_else(|| reserved.as_ref().map(|a| a.address.clone()));
        let rule = self.check_forwarding_rule(&lb_name, &proxy, ip.as_deref()).await?;
        let static_ip = match (spec.static_ip, reserved) {
            (false, _) => None,
            (true, Some(addr)) => Some(addr.address),
            (true, None) => Some(self.check_static_ip(&lb_name, &rule).await?),
        };

        Ok(LoadBalancerStatus {
            name: lb_name,
            url_map: url_map.name,
            target_proxy: proxy.name,
            forwarding_rule: rule.name,
            ip: rule.ip_address,
            static_ip,
            routes: dump,
        })
    }

    /// Swap every service port for a reference to its backend service.
    async fn resolve(&self, spec: &LoadBalancerSpec) -> Result<UrlMap<BackendRef>> {
        let ports: BTreeSet<u16> = spec.url_map.backends().copied().collect();
        let mut resolved = BTreeMap::new();
        for port in ports {
            let be = match self.backends.get_ref(port).await {
                Ok(be) => be,
                Err(e) if e.is_not_found() => {
                    return Err(Error::invariant(format!(
                        "load balancer {} references port {} which has no backend",
                        spec.key, port
                    )))
                }
                Err(e) => return Err(e),
            };
            resolved.insert(port, be);
        }
        spec.url_map.try_map(|port| {
            resolved
                .get(port)
                .cloned()
                .ok_or_else(|| Error::invariant(format!("port {} was not resolved", port)))
        })
    }

    async fn check_url_map(&self, desired: UrlMapResource) -> Result<UrlMapResource> {
        let kind = ResourceKind::UrlMap;
        let existing = ignore_not_found(self.cloud.get_url_map(&desired.name).await)
            .map_err(|e| err("get", kind, &desired.name, e))?;
        let existing = match existing {
            Some(existing) => existing,
            None => {
                info!("Creating url map {}", desired.name);
                match self.cloud.create_url_map(&desired).await {
                    Ok(created) => return Ok(created),
                    Err(e) if e.is_conflict() => {
                        debug!("Url map {} appeared concurrently", desired.name);
                        self.cloud
                            .get_url_map(&desired.name)
                            .await
                            .map_err(|e| err("get", kind, &desired.name, e))?
                    }
                    Err(e) => return Err(err("create", kind, &desired.name, e)),
                }
            }
        };

        if existing.same_routes(&desired) && existing.description == desired.description {
            debug!("Url map {} up to date", existing.name);
            return Ok(existing);
        }
        info!("Updating url map {}", desired.name);
        let update = UrlMapResource {
            self_link: existing.self_link,
            fingerprint: existing.fingerprint,
            ..desired
        };
        self.cloud
            .update_url_map(&update)
            .await
            .map_err(|e| err("update", kind, &update.name, e))
    }

    async fn check_proxy(&self, lb_name: &str, url_map: &UrlMapResource) -> Result<TargetHttpProxy> {
        let kind = ResourceKind::TargetProxy;
        let name = self.namer.target_proxy_name(lb_name);
        let existing = ignore_not_found(self.cloud.get_target_http_proxy(&name).await)
            .map_err(|e| err("get", kind, &name, e))?;
        let proxy = match existing {
            Some(proxy) => proxy,
            None => {
                info!("Creating target proxy {}", name);
                match self
                    .cloud
                    .create_target_http_proxy(&name, &url_map.self_link)
                    .await
                {
                    Ok(created) => return Ok(created),
                    Err(e) if e.is_conflict() => {
                        debug!("Target proxy {} appeared concurrently", name);
                        self.cloud
                            .get_target_http_proxy(&name)
                            .await
                            .map_err(|e| err("get", kind, &name, e))?
                    }
                    Err(e) => return Err(err("create", kind, &name, e)),
                }
            }
        };

        if compare_links(&proxy.url_map, &url_map.self_link) {
            debug!("Target proxy {} up to date", name);
            return Ok(proxy);
        }
        info!(
            "Pointing target proxy {} at url map {} (was {})",
            name, url_map.name, proxy.url_map
        );
        self.cloud
            .set_url_map_for_target_http_proxy(&proxy, &url_map.self_link)
            .await
            .map_err(|e| err("set url map", kind, &name, e))?;
        Ok(TargetHttpProxy {
            url_map: url_map.self_link.clone(),
            ..proxy
        })
    }

    async fn check_forwarding_rule(
        &self,
        lb_name: &str,
        proxy: &TargetHttpProxy,
        ip: Option<&str>,
    ) -> Result<ForwardingRule> {
        let kind = ResourceKind::ForwardingRule;
        let name = self.namer.forwarding_rule_name(lb_name);
        let existing = ignore_not_found(self.cloud.get_global_forwarding_rule(&name).await)
            .map_err(|e| err("get", kind, &name, e))?;
        let rule = match existing {
            Some(rule) => rule,
            None => match self.create_forwarding_rule(&name, proxy, ip).await {
                Ok(created) => return Ok(created),
                Err(e) if e.is_conflict() => {
                    debug!("Forwarding rule {} appeared concurrently", name);
                    self.cloud
                        .get_global_forwarding_rule(&name)
                        .await
                        .map_err(|e| err("get", kind, &name, e))?
                }
                Err(e) => return Err(err("create", kind, &name, e)),
            },
        };

        let ip_differs = ip.is_some_and(|ip| ip != rule.ip_address);
        if ip_differs || rule.port_range != DEFAULT_PORT_RANGE {
            info!(
                "Recreating forwarding rule {} (ip {} -> {:?}, ports {})",
                name, rule.ip_address, ip, rule.port_range
            );
            self.delete_forwarding_rule(&name).await?;
            return self
                .create_forwarding_rule(&name, proxy, ip)
                .await
                .map_err(|e| err("create", kind, &name, e));
        }

        if compare_links(&rule.target, &proxy.self_link) {
            debug!("Forwarding rule {} up to date", name);
            return Ok(rule);
        }
        info!("Pointing forwarding rule {} at proxy {}", name, proxy.name);
        self.cloud
            .set_proxy_for_global_forwarding_rule(&rule, &proxy.self_link)
            .await
            .map_err(|e| err("set target", kind, &name, e))?;
        Ok(ForwardingRule {
            target: proxy.self_link.clone(),
            ..rule
        })
    }

    async fn create_forwarding_rule(
        &self,
        name: &str,
        proxy: &TargetHttpProxy,
        ip: Option<&str>,
    ) -> std::result::Result<ForwardingRule, CloudError> {
        info!("Creating forwarding rule {} -> {}", name, proxy.name);
        let rule = ForwardingRule {
            name: name.to_string(),
            ip_address: ip.unwrap_or_default().to_string(),
            ip_protocol: IP_PROTOCOL.to_string(),
            port_range: DEFAULT_PORT_RANGE.to_string(),
            target: proxy.self_link.clone(),
            ..Default::default()
        };
        self.cloud.create_global_forwarding_rule(&rule).await
    }

    async fn get_static_ip(&self, lb_name: &str) -> Result<Option<Address>> {
        let name = self.namer.static_ip_name(lb_name);
        ignore_not_found(self.cloud.get_global_static_ip(&name).await)
            .map_err(|e| err("get", ResourceKind::StaticIp, &name, e))
    }

    /// Reserve the forwarding rule's IP under the load balancer's name.
    async fn check_static_ip(&self, lb_name: &str, rule: &ForwardingRule) -> Result<String> {
        let name = self.namer.static_ip_name(lb_name);
        info!("Reserving static ip {} for {}", rule.ip_address, name);
        match self
            .cloud
            .reserve_global_static_ip(&name, &rule.ip_address)
            .await
        {
            Ok(addr) => Ok(addr.address),
            Err(e) if e.is_conflict() || e.is_http_code(400) => {
                warn!("Static ip {} already reserved: {}", name, e);
                Ok(rule.ip_address.clone())
            }
            Err(e) => Err(err("reserve", ResourceKind::StaticIp, &name, e)),
        }
    }

    async fn delete_forwarding_rule(&self, name: &str) -> Result<()> {
        let kind = ResourceKind::ForwardingRule;
        tolerate_missing(self.cloud.delete_global_forwarding_rule(name).await, kind, name)
            .map_err(|e| err("delete", kind, name, e))
    }

    /// Observed resources of load balancer `lb_name`; NotFound if its URL map
    /// does not exist.
    pub async fn get(&self, lb_name: &str) -> Result<LoadBalancer> {
        let um_name = self.namer.url_map_name(lb_name);
        let url_map = self
            .cloud
            .get_url_map(&um_name)
            .await
            .map_err(|e| err("get", ResourceKind::UrlMap, &um_name, e))?;

        let tp_name = self.namer.target_proxy_name(lb_name);
        let target_proxy = ignore_not_found(self.cloud.get_target_http_proxy(&tp_name).await)
            .map_err(|e| err("get", ResourceKind::TargetProxy, &tp_name, e))?;
        let fr_name = self.namer.forwarding_rule_name(lb_name);
        let forwarding_rule =
            ignore_not_found(self.cloud.get_global_forwarding_rule(&fr_name).await)
                .map_err(|e| err("get", ResourceKind::ForwardingRule, &fr_name, e))?;
        let static_ip = self.get_static_ip(lb_name).await?;

        Ok(LoadBalancer {
            name: lb_name.to_string(),
            url_map,
            target_proxy,
            forwarding_rule,
            static_ip,
        })
    }

    /// Tear down load balancer `lb_name`: forwarding rule, static IP, target
    /// proxy, then URL map. Parts already gone are skipped.
    pub async fn delete(&self, lb_name: &str) -> Result<()> {
        info!("Deleting load balancer {}", lb_name);
        self.delete_forwarding_rule(&self.namer.forwarding_rule_name(lb_name))
            .await?;

        let ip = self.namer.static_ip_name(lb_name);
        tolerate_missing(
            self.cloud.delete_global_static_ip(&ip).await,
            ResourceKind::StaticIp,
            &ip,
        )
        .map_err(|e| err("delete", ResourceKind::StaticIp, &ip, e))?;

        let tp = self.namer.target_proxy_name(lb_name);
        tolerate_missing(
            self.cloud.delete_target_http_proxy(&tp).await,
            ResourceKind::TargetProxy,
            &tp,
        )
        .map_err(|e| err("delete", ResourceKind::TargetProxy, &tp, e))?;

        let um = self.namer.url_map_name(lb_name);
        tolerate_missing(self.cloud.delete_url_map(&um).await, ResourceKind::UrlMap, &um)
            .map_err(|e| err("delete", ResourceKind::UrlMap, &um, e))
    }

    /// Names of the load balancers this cluster owns, recovered from URL map
    /// descriptions
    pub async fn list_owned(&self) -> Result<Vec<String>> {
        let maps = self
            .cloud
            .list_url_maps()
            .await
            .map_err(|e| err("list", ResourceKind::UrlMap, "*", e))?;
        Ok(maps
            .iter()
            .filter_map(|um| UrlMapOwner::parse(&um.description))
            .filter(|owner| owner.cluster == self.namer.cluster_name)
            .map(|owner| owner.load_balancer)
            .collect())
    }

    /// Delete every owned load balancer not named in `keep`.
    pub async fn gc(&self, keep: &BTreeSet<String>) -> Result<GcReport> {
        let mut report = GcReport::default();
        for lb_name in self.list_owned().await? {
            if keep.contains(&lb_name) {
                continue;
            }
            match self.delete(&lb_name).await {
                Ok(()) => report.deleted.push(lb_name),
                Err(e) if e.is_in_use() => {
                    warn!("Load balancer {} still in use, deferring: {}", lb_name, e);
                    report.deferred.push(lb_name);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    /// Load balancer names for `specs`
    pub fn names(&self, specs: &[LoadBalancerSpec]) -> BTreeSet<String> {
        specs.iter().map(|s| self.namer.lb_name(&s.key)).collect()
    }
}
