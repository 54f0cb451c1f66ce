//! Provider resource shapes
//!
//! Only the fields the controller reads or writes are modelled. Field names
//! follow the compute API's JSON (camelCase) so the REST client can use these
//! types directly as request and response bodies.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A port on an instance group addressed by name from backend services
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedPort {
    pub name: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroup {
    pub name: String,
    #[serde(default)]
    pub self_link: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub zone: String,
    #[serde(default)]
    pub named_ports: Vec<NamedPort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl InstanceGroup {
    pub fn named_port(&self, port: u16) -> Option<&NamedPort> {
        self.named_ports.iter().find(|np| np.port == port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpHealthCheck {
    pub name: String,
    #[serde(default)]
    pub self_link: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub port: u16,
    pub request_path: String,
    /// How often to probe
    pub check_interval_sec: u32,
    /// How long to wait before declaring a probe failed
    pub timeout_sec: u32,
    /// Consecutive passes before an instance is healthy
    pub healthy_threshold: u32,
    /// Consecutive failures before an instance is unhealthy
    pub unhealthy_threshold: u32,
}

impl HttpHealthCheck {
    /// True when the probe parameters (not the identity) match.
    pub fn same_probe(&self, other: &HttpHealthCheck) -> bool {
        self.port == other.port
            && self.request_path == other.request_path
            && self.check_interval_sec == other.check_interval_sec
            && self.timeout_sec == other.timeout_sec
            && self.healthy_threshold == other.healthy_threshold
            && self.unhealthy_threshold == other.unhealthy_threshold
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    /// Self link of the instance group serving this backend
    pub group: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendService {
    pub name: String,
    #[serde(default)]
    pub self_link: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub protocol: String,
    pub port: u16,
    pub port_name: String,
    #[serde(default)]
    pub backends: Vec<Backend>,
    #[serde(default)]
    pub health_checks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// Weak, name-based reference to a backend service resolved in this cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRef {
    pub name: String,
    pub self_link: String,
}

impl From<&BackendService> for BackendRef {
    fn from(be: &BackendService) -> Self {
        Self {
            name: be.name.clone(),
            self_link: be.self_link.clone(),
        }
    }
}

impl fmt::Display for BackendRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Health of one instance as seen by a backend service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    #[serde(default)]
    pub instance: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub health_state: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRule {
    pub hosts: Vec<String>,
    pub path_matcher: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRule {
    pub paths: Vec<String>,
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathMatcher {
    pub name: String,
    pub default_service: String,
    #[serde(default)]
    pub path_rules: Vec<PathRule>,
}

/// The provider URL map resource (as opposed to [`crate::utils::UrlMap`])
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlMapResource {
    pub name: String,
    #[serde(default)]
    pub self_link: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub default_service: String,
    #[serde(default)]
    pub host_rules: Vec<HostRule>,
    #[serde(default)]
    pub path_matchers: Vec<PathMatcher>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl UrlMapResource {
    /// True when routing content matches; identity and fingerprint are ignored.
    pub fn same_routes(&self, other: &UrlMapResource) -> bool {
        self.default_service == other.default_service
            && self.host_rules == other.host_rules
            && self.path_matchers == other.path_matchers
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetHttpProxy {
    pub name: String,
    #[serde(default)]
    pub self_link: String,
    pub url_map: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingRule {
    pub name: String,
    #[serde(default)]
    pub self_link: String,
    #[serde(default, rename = "IPAddress", skip_serializing_if = "String::is_empty")]
    pub ip_address: String,
    #[serde(default, rename = "IPProtocol")]
    pub ip_protocol: String,
    pub port_range: String,
    pub target: String,
}

/// A reserved global static IP
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    pub name: String,
    #[serde(default)]
    pub self_link: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
}
