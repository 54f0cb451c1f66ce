//! In-memory provider
//!
//! [`FakeCloud`] implements every capability set against plain maps, records
//! each call as a [`Call`], and enforces the provider rules the pools rely on:
//! duplicate creates are rejected with 409, deletes of missing resources with
//! 404, deletes of still-referenced resources with 400 in-use, and creates that
//! point at missing resources with 404. Failures can be injected per call.
//!
//! Used by the test suite and by `glbc --fake-cloud` for dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    Address, BackendService, BackendServices, CloudError, CloudResult, ForwardingRule,
    HealthChecks, HealthStatus, HttpHealthCheck, InstanceGroup, InstanceGroups, LoadBalancers,
    NamedPort, ResourceKind, TargetHttpProxy, UrlMapResource,
};

/// Prefix of every self link handed out by the fake
pub const FAKE_LINK_PREFIX: &str = "https://compute.fake/v1/projects/fake-project";

/// One recorded provider call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Get { kind: ResourceKind, name: String },
    List { kind: ResourceKind },
    Create { kind: ResourceKind, name: String },
    Update { kind: ResourceKind, name: String },
    Delete { kind: ResourceKind, name: String },
    ListInstances { group: String },
    AddInstances { group: String, instances: Vec<String> },
    RemoveInstances { group: String, instances: Vec<String> },
    GetHealth { backend: String },
}

impl Call {
    /// True for calls that change provider state
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::Create { .. }
                | Self::Update { .. }
                | Self::Delete { .. }
                | Self::AddInstances { .. }
                | Self::RemoveInstances { .. }
        )
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Get { kind, .. }
            | Self::List { kind }
            | Self::Create { kind, .. }
            | Self::Update { kind, .. }
            | Self::Delete { kind, .. } => *kind,
            Self::ListInstances { .. } | Self::AddInstances { .. } | Self::RemoveInstances { .. } => {
                ResourceKind::InstanceGroup
            }
            Self::GetHealth { .. } => ResourceKind::BackendService,
        }
    }
}

type CallMatcher = Box<dyn Fn(&Call) -> bool + Send>;

#[derive(Default)]
struct FakeState {
    backend_services: BTreeMap<String, BackendService>,
    health_checks: BTreeMap<String, HttpHealthCheck>,
    /// (zone, name) -> group and its members
    instance_groups: BTreeMap<(String, String), (InstanceGroup, BTreeSet<String>)>,
    url_maps: BTreeMap<String, UrlMapResource>,
    target_proxies: BTreeMap<String, TargetHttpProxy>,
    forwarding_rules: BTreeMap<String, ForwardingRule>,
    addresses: BTreeMap<String, Address>,
    calls: Vec<Call>,
    failures: Vec<(CallMatcher, CloudError)>,
    next_ip: u32,
    generation: u64,
}

impl FakeState {
    /// Record `call`, failing it if an injected failure matches.
    fn record(&mut self, call: Call) -> CloudResult<()> {
        let injected = self.failures.iter().position(|(matches, _)| matches(&call));
        self.calls.push(call);
        match injected {
            Some(idx) => Err(self.failures.remove(idx).1),
            None => Ok(()),
        }
    }

    fn fingerprint(&mut self) -> Option<String> {
        self.generation += 1;
        Some(format!("fp-{}", self.generation))
    }

    fn group_by_link(&self, link: &str) -> Option<&(InstanceGroup, BTreeSet<String>)> {
        self.instance_groups.values().find(|(ig, _)| ig.self_link == link)
    }

    fn url_map_services(um: &UrlMapResource) -> impl Iterator<Item = &String> {
        std::iter::once(&um.default_service).chain(um.path_matchers.iter().flat_map(|pm| {
            std::iter::once(&pm.default_service).chain(pm.path_rules.iter().map(|pr| &pr.service))
        }))
    }

    fn backend_user(&self, link: &str) -> Option<String> {
        self.url_maps
            .values()
            .find(|um| Self::url_map_services(um).any(|s| s == link))
            .map(|um| um.name.clone())
    }

    fn backend_exists(&self, link: &str) -> bool {
        self.backend_services.values().any(|be| be.self_link == link)
    }
}

/// In-memory provider shared by all capability sets
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<FakeState>,
}

fn global_link(collection: &str, name: &str) -> String {
    format!("{}/global/{}/{}", FAKE_LINK_PREFIX, collection, name)
}

fn zonal_link(zone: &str, collection: &str, name: &str) -> String {
    format!("{}/zones/{}/{}/{}", FAKE_LINK_PREFIX, zone, collection, name)
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Test inspection helpers
    // =========================================================================

    /// Every call recorded so far
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Recorded calls that changed provider state
    pub fn mutations(&self) -> Vec<Call> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.is_mutation())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Fail the next call matching `matches` with `err`
    pub fn fail_next(&self, matches: impl Fn(&Call) -> bool + Send + 'static, err: CloudError) {
        self.lock().failures.push((Box::new(matches), err));
    }

    /// Names of every stored resource of `kind`, sorted
    pub fn names(&self, kind: ResourceKind) -> Vec<String> {
        let st = self.lock();
        match kind {
            ResourceKind::BackendService => st.backend_services.keys().cloned().collect(),
            ResourceKind::HealthCheck => st.health_checks.keys().cloned().collect(),
            ResourceKind::InstanceGroup => {
                st.instance_groups.keys().map(|(_, n)| n.clone()).collect()
            }
            ResourceKind::UrlMap => st.url_maps.keys().cloned().collect(),
            ResourceKind::TargetProxy => st.target_proxies.keys().cloned().collect(),
            ResourceKind::ForwardingRule => st.forwarding_rules.keys().cloned().collect(),
            ResourceKind::StaticIp => st.addresses.keys().cloned().collect(),
        }
    }

    /// Members of an instance group, sorted; empty if the group is absent
    pub fn members(&self, group: &str, zone: &str) -> Vec<String> {
        self.lock()
            .instance_groups
            .get(&(zone.to_string(), group.to_string()))
            .map(|(_, m)| m.iter().cloned().collect())
            .unwrap_or_default()
    }
}

// ============================================================================
// Backend services
// ============================================================================

#[async_trait]
impl BackendServices for FakeCloud {
    async fn get_backend_service(&self, name: &str) -> CloudResult<BackendService> {
        let kind = ResourceKind::BackendService;
        let mut st = self.lock();
        st.record(Call::Get { kind, name: name.to_string() })?;
        st.backend_services
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::not_found(kind, name))
    }

    async fn create_backend_service(&self, be: &BackendService) -> CloudResult<BackendService> {
        let kind = ResourceKind::BackendService;
        let mut st = self.lock();
        st.record(Call::Create { kind, name: be.name.clone() })?;
        if st.backend_services.contains_key(&be.name) {
            return Err(CloudError::already_exists(kind, &be.name));
        }
        for hc in &be.health_checks {
            if !st.health_checks.values().any(|h| &h.self_link == hc) {
                return Err(CloudError::not_found(ResourceKind::HealthCheck, hc));
            }
        }
        for backend in &be.backends {
            if st.group_by_link(&backend.group).is_none() {
                return Err(CloudError::not_found(ResourceKind::InstanceGroup, &backend.group));
            }
        }
        let mut created = be.clone();
        created.self_link = global_link("backendServices", &be.name);
        created.fingerprint = st.fingerprint();
        st.backend_services.insert(be.name.clone(), created.clone());
        Ok(created)
    }

    async fn update_backend_service(&self, be: &BackendService) -> CloudResult<()> {
        let kind = ResourceKind::BackendService;
        let mut st = self.lock();
        st.record(Call::Update { kind, name: be.name.clone() })?;
        let fingerprint = st.fingerprint();
        let existing = st
            .backend_services
            .get_mut(&be.name)
            .ok_or_else(|| CloudError::not_found(kind, &be.name))?;
        let self_link = existing.self_link.clone();
        *existing = BackendService {
            self_link,
            fingerprint,
            ..be.clone()
        };
        Ok(())
    }

    async fn delete_backend_service(&self, name: &str) -> CloudResult<()> {
        let kind = ResourceKind::BackendService;
        let mut st = self.lock();
        st.record(Call::Delete { kind, name: name.to_string() })?;
        let link = st
            .backend_services
            .get(name)
            .map(|be| be.self_link.clone())
            .ok_or_else(|| CloudError::not_found(kind, name))?;
        if let Some(user) = st.backend_user(&link) {
            return Err(CloudError::in_use(kind, name, &user));
        }
        st.backend_services.remove(name);
        Ok(())
    }

    async fn list_backend_services(&self) -> CloudResult<Vec<BackendService>> {
        let mut st = self.lock();
        st.record(Call::List { kind: ResourceKind::BackendService })?;
        Ok(st.backend_services.values().cloned().collect())
    }

    async fn get_health(&self, name: &str, group_link: &str) -> CloudResult<Vec<HealthStatus>> {
        let mut st = self.lock();
        st.record(Call::GetHealth { backend: name.to_string() })?;
        let be = st
            .backend_services
            .get(name)
            .ok_or_else(|| CloudError::not_found(ResourceKind::BackendService, name))?;
        let (ig, members) = st
            .group_by_link(group_link)
            .ok_or_else(|| CloudError::not_found(ResourceKind::InstanceGroup, group_link))?;
        Ok(members
            .iter()
            .map(|m| HealthStatus {
                instance: zonal_link(&ig.zone, "instances", m),
                ip_address: String::new(),
                port: be.port,
                health_state: "HEALTHY".to_string(),
            })
            .collect())
    }
}

// ============================================================================
// Health checks
// ============================================================================

#[async_trait]
impl HealthChecks for FakeCloud {
    async fn get_http_health_check(&self, name: &str) -> CloudResult<HttpHealthCheck> {
        let kind = ResourceKind::HealthCheck;
        let mut st = self.lock();
        st.record(Call::Get { kind, name: name.to_string() })?;
        st.health_checks
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::not_found(kind, name))
    }

    async fn create_http_health_check(
        &self,
        hc: &HttpHealthCheck,
    ) -> CloudResult<HttpHealthCheck> {
        let kind = ResourceKind::HealthCheck;
        let mut st = self.lock();
        st.record(Call::Create { kind, name: hc.name.clone() })?;
        if st.health_checks.contains_key(&hc.name) {
            return Err(CloudError::already_exists(kind, &hc.name));
        }
        let mut created = hc.clone();
        created.self_link = global_link("httpHealthChecks", &hc.name);
        st.health_checks.insert(hc.name.clone(), created.clone());
        Ok(created)
    }

    async fn delete_http_health_check(&self, name: &str) -> CloudResult<()> {
        let kind = ResourceKind::HealthCheck;
        let mut st = self.lock();
        st.record(Call::Delete { kind, name: name.to_string() })?;
        let link = st
            .health_checks
            .get(name)
            .map(|hc| hc.self_link.clone())
            .ok_or_else(|| CloudError::not_found(kind, name))?;
        if let Some(be) = st
            .backend_services
            .values()
            .find(|be| be.health_checks.contains(&link))
        {
            return Err(CloudError::in_use(kind, name, &be.name));
        }
        st.health_checks.remove(name);
        Ok(())
    }

    async fn list_http_health_checks(&self) -> CloudResult<Vec<HttpHealthCheck>> {
        let mut st = self.lock();
        st.record(Call::List { kind: ResourceKind::HealthCheck })?;
        Ok(st.health_checks.values().cloned().collect())
    }
}

// ============================================================================
// Instance groups
// ============================================================================

#[async_trait]
impl InstanceGroups for FakeCloud {
    async fn get_instance_group(&self, name: &str, zone: &str) -> CloudResult<InstanceGroup> {
        let kind = ResourceKind::InstanceGroup;
        let mut st = self.lock();
        st.record(Call::Get { kind, name: name.to_string() })?;
        st.instance_groups
            .get(&(zone.to_string(), name.to_string()))
            .map(|(ig, _)| ig.clone())
            .ok_or_else(|| CloudError::not_found(kind, name))
    }

    async fn create_instance_group(&self, name: &str, zone: &str) -> CloudResult<InstanceGroup> {
        let kind = ResourceKind::InstanceGroup;
        let mut st = self.lock();
        st.record(Call::Create { kind, name: name.to_string() })?;
        let key = (zone.to_string(), name.to_string());
        if st.instance_groups.contains_key(&key) {
            return Err(CloudError::already_exists(kind, name));
        }
        let ig = InstanceGroup {
            name: name.to_string(),
            self_link: zonal_link(zone, "instanceGroups", name),
            zone: zone.to_string(),
            named_ports: Vec::new(),
            fingerprint: st.fingerprint(),
        };
        st.instance_groups.insert(key, (ig.clone(), BTreeSet::new()));
        Ok(ig)
    }

    async fn delete_instance_group(&self, name: &str, zone: &str) -> CloudResult<()> {
        let kind = ResourceKind::InstanceGroup;
        let mut st = self.lock();
        st.record(Call::Delete { kind, name: name.to_string() })?;
        let key = (zone.to_string(), name.to_string());
        let link = st
            .instance_groups
            .get(&key)
            .map(|(ig, _)| ig.self_link.clone())
            .ok_or_else(|| CloudError::not_found(kind, name))?;
        if let Some(be) = st
            .backend_services
            .values()
            .find(|be| be.backends.iter().any(|b| b.group == link))
        {
            return Err(CloudError::in_use(kind, name, &be.name));
        }
        st.instance_groups.remove(&key);
        Ok(())
    }

    async fn list_instance_groups(&self, zone: &str) -> CloudResult<Vec<InstanceGroup>> {
        let mut st = self.lock();
        st.record(Call::List { kind: ResourceKind::InstanceGroup })?;
        Ok(st
            .instance_groups
            .iter()
            .filter(|((z, _), _)| z == zone)
            .map(|(_, (ig, _))| ig.clone())
            .collect())
    }

    async fn list_instances(&self, name: &str, zone: &str) -> CloudResult<Vec<String>> {
        let mut st = self.lock();
        st.record(Call::ListInstances { group: name.to_string() })?;
        st.instance_groups
            .get(&(zone.to_string(), name.to_string()))
            .map(|(_, members)| members.iter().cloned().collect())
            .ok_or_else(|| CloudError::not_found(ResourceKind::InstanceGroup, name))
    }

    async fn add_instances(&self, name: &str, zone: &str, instances: &[String]) -> CloudResult<()> {
        let mut st = self.lock();
        st.record(Call::AddInstances {
            group: name.to_string(),
            instances: instances.to_vec(),
        })?;
        let (_, members) = st
            .instance_groups
            .get_mut(&(zone.to_string(), name.to_string()))
            .ok_or_else(|| CloudError::not_found(ResourceKind::InstanceGroup, name))?;
        members.extend(instances.iter().cloned());
        Ok(())
    }

    async fn remove_instances(
        &self,
        name: &str,
        zone: &str,
        instances: &[String],
    ) -> CloudResult<()> {
        let mut st = self.lock();
        st.record(Call::RemoveInstances {
            group: name.to_string(),
            instances: instances.to_vec(),
        })?;
        let (_, members) = st
            .instance_groups
            .get_mut(&(zone.to_string(), name.to_string()))
            .ok_or_else(|| CloudError::not_found(ResourceKind::InstanceGroup, name))?;
        for instance in instances {
            members.remove(instance);
        }
        Ok(())
    }

    async fn set_named_ports(
        &self,
        group: &InstanceGroup,
        ports: &[NamedPort],
    ) -> CloudResult<InstanceGroup> {
        let kind = ResourceKind::InstanceGroup;
        let mut st = self.lock();
        st.record(Call::Update { kind, name: group.name.clone() })?;
        let fingerprint = st.fingerprint();
        let (ig, _) = st
            .instance_groups
            .get_mut(&(group.zone.clone(), group.name.clone()))
            .ok_or_else(|| CloudError::not_found(kind, &group.name))?;
        ig.named_ports = ports.to_vec();
        ig.fingerprint = fingerprint;
        Ok(ig.clone())
    }
}

// ============================================================================
// URL maps, proxies, forwarding rules, static IPs
// ============================================================================

#[async_trait]
impl LoadBalancers for FakeCloud {
    async fn get_url_map(&self, name: &str) -> CloudResult<UrlMapResource> {
        let kind = ResourceKind::UrlMap;
        let mut st = self.lock();
        st.record(Call::Get { kind, name: name.to_string() })?;
        st.url_maps
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::not_found(kind, name))
    }

    async fn create_url_map(&self, um: &UrlMapResource) -> CloudResult<UrlMapResource> {
        let kind = ResourceKind::UrlMap;
        let mut st = self.lock();
        st.record(Call::Create { kind, name: um.name.clone() })?;
        if st.url_maps.contains_key(&um.name) {
            return Err(CloudError::already_exists(kind, &um.name));
        }
        if let Some(missing) = FakeState::url_map_services(um).find(|s| !st.backend_exists(s)) {
            return Err(CloudError::not_found(ResourceKind::BackendService, missing));
        }
        let mut created = um.clone();
        created.self_link = global_link("urlMaps", &um.name);
        created.fingerprint = st.fingerprint();
        st.url_maps.insert(um.name.clone(), created.clone());
        Ok(created)
    }

    async fn update_url_map(&self, um: &UrlMapResource) -> CloudResult<UrlMapResource> {
        let kind = ResourceKind::UrlMap;
        let mut st = self.lock();
        st.record(Call::Update { kind, name: um.name.clone() })?;
        if let Some(missing) = FakeState::url_map_services(um).find(|s| !st.backend_exists(s)) {
            return Err(CloudError::not_found(ResourceKind::BackendService, missing));
        }
        let fingerprint = st.fingerprint();
        let existing = st
            .url_maps
            .get_mut(&um.name)
            .ok_or_else(|| CloudError::not_found(kind, &um.name))?;
        if um.fingerprint.is_some() && um.fingerprint != existing.fingerprint {
            return Err(CloudError::api(
                412,
                "conditionNotMet",
                format!("fingerprint mismatch for url map {}", um.name),
            ));
        }
        let self_link = existing.self_link.clone();
        *existing = UrlMapResource {
            self_link,
            fingerprint,
            ..um.clone()
        };
        Ok(existing.clone())
    }

    async fn delete_url_map(&self, name: &str) -> CloudResult<()> {
        let kind = ResourceKind::UrlMap;
        let mut st = self.lock();
        st.record(Call::Delete { kind, name: name.to_string() })?;
        let link = st
            .url_maps
            .get(name)
            .map(|um| um.self_link.clone())
            .ok_or_else(|| CloudError::not_found(kind, name))?;
        if let Some(tp) = st.target_proxies.values().find(|tp| tp.url_map == link) {
            return Err(CloudError::in_use(kind, name, &tp.name));
        }
        st.url_maps.remove(name);
        Ok(())
    }

    async fn list_url_maps(&self) -> CloudResult<Vec<UrlMapResource>> {
        let mut st = self.lock();
        st.record(Call::List { kind: ResourceKind::UrlMap })?;
        Ok(st.url_maps.values().cloned().collect())
    }

    async fn get_target_http_proxy(&self, name: &str) -> CloudResult<TargetHttpProxy> {
        let kind = ResourceKind::TargetProxy;
        let mut st = self.lock();
        st.record(Call::Get { kind, name: name.to_string() })?;
        st.target_proxies
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::not_found(kind, name))
    }

    async fn create_target_http_proxy(
        &self,
        name: &str,
        url_map_link: &str,
    ) -> CloudResult<TargetHttpProxy> {
        let kind = ResourceKind::TargetProxy;
        let mut st = self.lock();
        st.record(Call::Create { kind, name: name.to_string() })?;
        if st.target_proxies.contains_key(name) {
            return Err(CloudError::already_exists(kind, name));
        }
        if !st.url_maps.values().any(|um| um.self_link == url_map_link) {
            return Err(CloudError::not_found(ResourceKind::UrlMap, url_map_link));
        }
        let proxy = TargetHttpProxy {
            name: name.to_string(),
            self_link: global_link("targetHttpProxies", name),
            url_map: url_map_link.to_string(),
        };
        st.target_proxies.insert(name.to_string(), proxy.clone());
        Ok(proxy)
    }

    async fn set_url_map_for_target_http_proxy(
        &self,
        proxy: &TargetHttpProxy,
        url_map_link: &str,
    ) -> CloudResult<()> {
        let kind = ResourceKind::TargetProxy;
        let mut st = self.lock();
        st.record(Call::Update { kind, name: proxy.name.clone() })?;
        if !st.url_maps.values().any(|um| um.self_link == url_map_link) {
            return Err(CloudError::not_found(ResourceKind::UrlMap, url_map_link));
        }
        let existing = st
            .target_proxies
            .get_mut(&proxy.name)
            .ok_or_else(|| CloudError::not_found(kind, &proxy.name))?;
        existing.url_map = url_map_link.to_string();
        Ok(())
    }

    async fn delete_target_http_proxy(&self, name: &str) -> CloudResult<()> {
        let kind = ResourceKind::TargetProxy;
        let mut st = self.lock();
        st.record(Call::Delete { kind, name: name.to_string() })?;
        let link = st
            .target_proxies
            .get(name)
            .map(|tp| tp.self_link.clone())
            .ok_or_else(|| CloudError::not_found(kind, name))?;
        if let Some(fw) = st.forwarding_rules.values().find(|fw| fw.target == link) {
            return Err(CloudError::in_use(kind, name, &fw.name));
        }
        st.target_proxies.remove(name);
        Ok(())
    }

    async fn get_global_forwarding_rule(&self, name: &str) -> CloudResult<ForwardingRule> {
        let kind = ResourceKind::ForwardingRule;
        let mut st = self.lock();
        st.record(Call::Get { kind, name: name.to_string() })?;
        st.forwarding_rules
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::not_found(kind, name))
    }

    async fn create_global_forwarding_rule(
        &self,
        rule: &ForwardingRule,
    ) -> CloudResult<ForwardingRule> {
        let kind = ResourceKind::ForwardingRule;
        let mut st = self.lock();
        st.record(Call::Create { kind, name: rule.name.clone() })?;
        if st.forwarding_rules.contains_key(&rule.name) {
            return Err(CloudError::already_exists(kind, &rule.name));
        }
        if !st.target_proxies.values().any(|tp| tp.self_link == rule.target) {
            return Err(CloudError::not_found(ResourceKind::TargetProxy, &rule.target));
        }
        let mut created = rule.clone();
        created.self_link = global_link("forwardingRules", &rule.name);
        if created.ip_address.is_empty() {
            st.next_ip += 1;
            created.ip_address = format!("34.120.0.{}", st.next_ip);
        }
        st.forwarding_rules.insert(rule.name.clone(), created.clone());
        Ok(created)
    }

    async fn set_proxy_for_global_forwarding_rule(
        &self,
        rule: &ForwardingRule,
        proxy_link: &str,
    ) -> CloudResult<()> {
        let kind = ResourceKind::ForwardingRule;
        let mut st = self.lock();
        st.record(Call::Update { kind, name: rule.name.clone() })?;
        if !st.target_proxies.values().any(|tp| tp.self_link == proxy_link) {
            return Err(CloudError::not_found(ResourceKind::TargetProxy, proxy_link));
        }
        let existing = st
            .forwarding_rules
            .get_mut(&rule.name)
            .ok_or_else(|| CloudError::not_found(kind, &rule.name))?;
        existing.target = proxy_link.to_string();
        Ok(())
    }

    async fn delete_global_forwarding_rule(&self, name: &str) -> CloudResult<()> {
        let kind = ResourceKind::ForwardingRule;
        let mut st = self.lock();
        st.record(Call::Delete { kind, name: name.to_string() })?;
        st.forwarding_rules
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found(kind, name))
    }

    async fn get_global_static_ip(&self, name: &str) -> CloudResult<Address> {
        let kind = ResourceKind::StaticIp;
        let mut st = self.lock();
        st.record(Call::Get { kind, name: name.to_string() })?;
        st.addresses
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::not_found(kind, name))
    }

    async fn reserve_global_static_ip(&self, name: &str, ip: &str) -> CloudResult<Address> {
        let kind = ResourceKind::StaticIp;
        let mut st = self.lock();
        st.record(Call::Create { kind, name: name.to_string() })?;
        if st.addresses.contains_key(name) {
            return Err(CloudError::already_exists(kind, name));
        }
        let address = Address {
            name: name.to_string(),
            self_link: global_link("addresses", name),
            address: ip.to_string(),
            status: "IN_USE".to_string(),
        };
        st.addresses.insert(name.to_string(), address.clone());
        Ok(address)
    }

    async fn delete_global_static_ip(&self, name: &str) -> CloudResult<()> {
        let kind = ResourceKind::StaticIp;
        let mut st = self.lock();
        st.record(Call::Delete { kind, name: name.to_string() })?;
        st.addresses
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found(kind, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::Backend;

    fn health_check(name: &str) -> HttpHealthCheck {
        HttpHealthCheck {
            name: name.to_string(),
            port: 80,
            request_path: "/".to_string(),
            check_interval_sec: 1,
            timeout_sec: 1,
            healthy_threshold: 1,
            unhealthy_threshold: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_duplicate_create_is_rejected() {
        let cloud = FakeCloud::new();
        cloud.create_http_health_check(&health_check("hc")).await.unwrap();
        let err = cloud
            .create_http_health_check(&health_check("hc"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let cloud = FakeCloud::new();
        let err = cloud.delete_http_health_check("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_referenced_health_check_cannot_be_deleted() {
        let cloud = FakeCloud::new();
        let hc = cloud.create_http_health_check(&health_check("hc")).await.unwrap();
        let ig = cloud.create_instance_group("ig", "zone-a").await.unwrap();
        cloud
            .create_backend_service(&BackendService {
                name: "be".to_string(),
                protocol: "HTTP".to_string(),
                port: 80,
                port_name: "port80".to_string(),
                backends: vec![Backend { group: ig.self_link.clone() }],
                health_checks: vec![hc.self_link.clone()],
                ..Default::default()
            })
            .await
            .unwrap();

        let err = cloud.delete_http_health_check("hc").await.unwrap_err();
        assert!(err.is_in_use());

        cloud.delete_backend_service("be").await.unwrap();
        cloud.delete_http_health_check("hc").await.unwrap();
    }

    #[tokio::test]
    async fn test_membership_calls_are_recorded() {
        let cloud = FakeCloud::new();
        cloud.create_instance_group("ig", "zone-a").await.unwrap();
        cloud
            .add_instances("ig", "zone-a", &["n1".to_string(), "n2".to_string()])
            .await
            .unwrap();
        cloud
            .remove_instances("ig", "zone-a", &["n1".to_string()])
            .await
            .unwrap();

        assert_eq!(cloud.members("ig", "zone-a"), vec!["n2"]);
        assert_eq!(
            cloud.mutations(),
            vec![
                Call::Create { kind: ResourceKind::InstanceGroup, name: "ig".to_string() },
                Call::AddInstances {
                    group: "ig".to_string(),
                    instances: vec!["n1".to_string(), "n2".to_string()],
                },
                Call::RemoveInstances {
                    group: "ig".to_string(),
                    instances: vec!["n1".to_string()],
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let cloud = FakeCloud::new();
        cloud.fail_next(
            |c| matches!(c, Call::Create { kind: ResourceKind::HealthCheck, .. }),
            CloudError::api(503, "backendError", "unavailable"),
        );
        let err = cloud
            .create_http_health_check(&health_check("hc"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(503));
        assert!(cloud.create_http_health_check(&health_check("hc")).await.is_ok());
    }

    #[tokio::test]
    async fn test_forwarding_rule_requires_existing_proxy() {
        let cloud = FakeCloud::new();
        let err = cloud
            .create_global_forwarding_rule(&ForwardingRule {
                name: "fw".to_string(),
                target: "missing".to_string(),
                port_range: "80-80".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(cloud.names(ResourceKind::ForwardingRule).is_empty());
    }
}
