//! Cloud provider capability sets
//!
//! Each resource kind the controller manages is reached through a small async
//! trait. The production implementation ([`gce::ComputeClient`]) talks to the
//! compute REST API; [`fake::FakeCloud`] keeps everything in memory and records
//! every call. Pools receive `Arc<dyn Trait>` handles, so the two are swapped at
//! composition time.

pub mod fake;
pub mod gce;
pub mod types;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use types::{
    Address, Backend, BackendRef, BackendService, ForwardingRule, HealthStatus, HostRule,
    HttpHealthCheck, InstanceGroup, NamedPort, PathMatcher, PathRule, TargetHttpProxy,
    UrlMapResource,
};

/// Reason the compute API attaches to deletes of referenced resources
pub const REASON_RESOURCE_IN_USE: &str = "resourceInUseByAnotherResource";

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by provider calls
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloudError {
    #[error("API error: {status} {reason}: {message}")]
    Api {
        status: u16,
        reason: String,
        message: String,
    },

    #[error("HTTP error: {0}")]
    Transport(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("JSON parse error: {0}")]
    Parse(String),

    #[error("Operation {name} failed: {message}")]
    Operation { name: String, message: String },
}

impl CloudError {
    pub fn api(status: u16, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn not_found(kind: ResourceKind, name: &str) -> Self {
        Self::api(404, "notFound", format!("{} {} was not found", kind, name))
    }

    pub fn already_exists(kind: ResourceKind, name: &str) -> Self {
        Self::api(409, "alreadyExists", format!("{} {} already exists", kind, name))
    }

    pub fn in_use(kind: ResourceKind, name: &str, user: &str) -> Self {
        Self::api(
            400,
            REASON_RESOURCE_IN_USE,
            format!("{} {} is already being used by {}", kind, name, user),
        )
    }

    /// HTTP status, if the provider answered
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_http_code(&self, code: u16) -> bool {
        self.status() == Some(code)
    }

    pub fn is_not_found(&self) -> bool {
        self.is_http_code(404)
    }

    pub fn is_conflict(&self) -> bool {
        self.is_http_code(409)
    }

    /// The resource is still referenced by another resource
    pub fn is_in_use(&self) -> bool {
        matches!(self, Self::Api { status: 400, reason, .. } if reason == REASON_RESOURCE_IN_USE)
    }

    /// Worth retrying on a later attempt: server errors, throttling and
    /// failures that never reached the provider.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Parse(_) | Self::Operation { .. } => false,
        }
    }
}

pub type CloudResult<T> = Result<T, CloudError>;

/// Resource kinds, used for error messages and call records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    BackendService,
    HealthCheck,
    InstanceGroup,
    UrlMap,
    TargetProxy,
    ForwardingRule,
    StaticIp,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BackendService => "backend service",
            Self::HealthCheck => "health check",
            Self::InstanceGroup => "instance group",
            Self::UrlMap => "url map",
            Self::TargetProxy => "target proxy",
            Self::ForwardingRule => "forwarding rule",
            Self::StaticIp => "static ip",
        };
        f.write_str(s)
    }
}

// ============================================================================
// SBIO: Traits for abstraction (allows faking the provider in tests)
// ============================================================================

#[async_trait]
pub trait BackendServices: Send + Sync {
    async fn get_backend_service(&self, name: &str) -> CloudResult<BackendService>;
    async fn create_backend_service(&self, be: &BackendService) -> CloudResult<BackendService>;
    async fn update_backend_service(&self, be: &BackendService) -> CloudResult<()>;
    async fn delete_backend_service(&self, name: &str) -> CloudResult<()>;
    async fn list_backend_services(&self) -> CloudResult<Vec<BackendService>>;
    /// Health of every member of `group_link` as seen by backend `name`
    async fn get_health(&self, name: &str, group_link: &str) -> CloudResult<Vec<HealthStatus>>;
}

#[async_trait]
pub trait HealthChecks: Send + Sync {
    async fn get_http_health_check(&self, name: &str) -> CloudResult<HttpHealthCheck>;
    async fn create_http_health_check(&self, hc: &HttpHealthCheck)
        -> CloudResult<HttpHealthCheck>;
    async fn delete_http_health_check(&self, name: &str) -> CloudResult<()>;
    async fn list_http_health_checks(&self) -> CloudResult<Vec<HttpHealthCheck>>;
}

/// Zone-qualified instance group calls. Instance arguments and results are
/// bare instance names; implementations translate to and from links.
#[async_trait]
pub trait InstanceGroups: Send + Sync {
    async fn get_instance_group(&self, name: &str, zone: &str) -> CloudResult<InstanceGroup>;
    async fn create_instance_group(&self, name: &str, zone: &str) -> CloudResult<InstanceGroup>;
    async fn delete_instance_group(&self, name: &str, zone: &str) -> CloudResult<()>;
    async fn list_instance_groups(&self, zone: &str) -> CloudResult<Vec<InstanceGroup>>;
    async fn list_instances(&self, name: &str, zone: &str) -> CloudResult<Vec<String>>;
    async fn add_instances(&self, name: &str, zone: &str, instances: &[String]) -> CloudResult<()>;
    async fn remove_instances(&self, name: &str, zone: &str, instances: &[String])
        -> CloudResult<()>;
    /// Replace the group's named ports with `ports`
    async fn set_named_ports(
        &self,
        group: &InstanceGroup,
        ports: &[NamedPort],
    ) -> CloudResult<InstanceGroup>;
}

/// The global L7 resources: URL maps, target proxies, forwarding rules and
/// static IPs.
#[async_trait]
pub trait LoadBalancers: Send + Sync {
    async fn get_url_map(&self, name: &str) -> CloudResult<UrlMapResource>;
    async fn create_url_map(&self, um: &UrlMapResource) -> CloudResult<UrlMapResource>;
    async fn update_url_map(&self, um: &UrlMapResource) -> CloudResult<UrlMapResource>;
    async fn delete_url_map(&self, name: &str) -> CloudResult<()>;
    async fn list_url_maps(&self) -> CloudResult<Vec<UrlMapResource>>;

    async fn get_target_http_proxy(&self, name: &str) -> CloudResult<TargetHttpProxy>;
    async fn create_target_http_proxy(&self, name: &str, url_map_link: &str)
        -> CloudResult<TargetHttpProxy>;
    async fn set_url_map_for_target_http_proxy(
        &self,
        proxy: &TargetHttpProxy,
        url_map_link: &str,
    ) -> CloudResult<()>;
    async fn delete_target_http_proxy(&self, name: &str) -> CloudResult<()>;

    async fn get_global_forwarding_rule(&self, name: &str) -> CloudResult<ForwardingRule>;
    async fn create_global_forwarding_rule(&self, rule: &ForwardingRule)
        -> CloudResult<ForwardingRule>;
    async fn set_proxy_for_global_forwarding_rule(
        &self,
        rule: &ForwardingRule,
        proxy_link: &str,
    ) -> CloudResult<()>;
    async fn delete_global_forwarding_rule(&self, name: &str) -> CloudResult<()>;

    async fn get_global_static_ip(&self, name: &str) -> CloudResult<Address>;
    async fn reserve_global_static_ip(&self, name: &str, ip: &str) -> CloudResult<Address>;
    async fn delete_global_static_ip(&self, name: &str) -> CloudResult<()>;
}

/// Everything the cluster manager needs from one provider
pub trait Cloud: BackendServices + HealthChecks + InstanceGroups + LoadBalancers {}

impl<T> Cloud for T where T: BackendServices + HealthChecks + InstanceGroups + LoadBalancers {}

/// Map a NotFound result to `Ok(None)`, leaving other errors untouched.
///
/// Used on get-before-create paths where absence means "needs creation".
pub fn ignore_not_found<T>(result: CloudResult<T>) -> CloudResult<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let nf = CloudError::not_found(ResourceKind::UrlMap, "um");
        assert!(nf.is_not_found());
        assert!(!nf.is_transient());

        let conflict = CloudError::already_exists(ResourceKind::HealthCheck, "hc");
        assert!(conflict.is_conflict());

        let in_use = CloudError::in_use(ResourceKind::HealthCheck, "hc", "be");
        assert!(in_use.is_in_use());
        assert!(in_use.is_http_code(400));

        assert!(CloudError::api(503, "backendError", "try later").is_transient());
        assert!(CloudError::api(429, "rateLimitExceeded", "slow down").is_transient());
        assert!(CloudError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!CloudError::api(400, "invalid", "bad name").is_transient());
        assert_eq!(CloudError::Transport("reset".into()).status(), None);
    }

    #[test]
    fn test_ignore_not_found() {
        let absent: CloudResult<u8> = Err(CloudError::not_found(ResourceKind::StaticIp, "ip"));
        assert_eq!(ignore_not_found(absent), Ok(None));
        assert_eq!(ignore_not_found(Ok(1)), Ok(Some(1)));

        let failed: CloudResult<u8> = Err(CloudError::api(500, "backendError", "boom"));
        assert!(ignore_not_found(failed).is_err());
    }

    #[test]
    fn test_error_display_carries_status() {
        let err = CloudError::api(404, "notFound", "gone");
        assert_eq!(err.to_string(), "API error: 404 notFound: gone");
    }
}
