//! Provider-legal resource naming
//!
//! Every resource this controller writes is named from a logical key (a
//! service port, a load balancer key or the cluster itself). Names are pure
//! functions of the key and the cluster name, so the same key always maps to
//! the same provider resource across restarts.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cloud::NamedPort;

/// Prefix for backend services and their health checks.
/// Backends are shared across load balancers, so the name carries no lb key.
pub const BACKEND_PREFIX: &str = "k8s-be";

/// Prefix for the cluster instance group
pub const INSTANCE_GROUP_PREFIX: &str = "k8s-ig";

/// Prefix for URL maps
pub const URL_MAP_PREFIX: &str = "k8s-um";

/// Prefix for target HTTP proxies
pub const TARGET_PROXY_PREFIX: &str = "k8s-tp";

/// Prefix for forwarding rules and the static IPs reserved for them
pub const FORWARDING_RULE_PREFIX: &str = "k8s-fw";

/// Prefix for URL map path matchers
pub const HOST_RULE_PREFIX: &str = "host";

/// Separates a resource name from the cluster name suffix
pub const CLUSTER_NAME_DELIMITER: &str = "--";

/// Appended to truncated names so they never end in `-`
pub const ALPHANUMERIC_FILLER: char = '0';

/// Maximum length of any generated name
pub const NAME_LEN_LIMIT: usize = 62;

/// Derives provider resource names for one cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namer {
    /// Cluster name suffixed to every generated name. Empty means no suffix.
    pub cluster_name: String,
}

impl Namer {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
        }
    }

    /// Name of the backend service (and health check) for a service port.
    pub fn be_name(&self, port: u16) -> String {
        let base = format!("{}-{}", BACKEND_PREFIX, port);
        self.truncate(&self.with_cluster_suffix(base))
    }

    /// Name of a load balancer derived from its key, e.g. `namespace/ingress`.
    ///
    /// A key that already ends with this cluster's suffix is not suffixed
    /// again, so `lb_name(lb_name(k)) == lb_name(k)`.
    pub fn lb_name(&self, key: &str) -> String {
        let scrubbed = key.replace('/', "-");
        let already_suffixed = key
            .rsplit(CLUSTER_NAME_DELIMITER)
            .next()
            .is_some_and(|last| last == self.cluster_name);

        if self.cluster_name.is_empty() || already_suffixed {
            return self.truncate(&scrubbed);
        }
        self.truncate(&format!(
            "{}{}{}",
            scrubbed, CLUSTER_NAME_DELIMITER, self.cluster_name
        ))
    }

    /// Name of the cluster instance group.
    pub fn ig_name(&self) -> String {
        self.truncate(&self.with_cluster_suffix(INSTANCE_GROUP_PREFIX.to_string()))
    }

    /// Named port registered on the instance group for a service port.
    pub fn named_port(&self, port: u16) -> NamedPort {
        NamedPort {
            name: self.be_name(port),
            port,
        }
    }

    pub fn url_map_name(&self, lb_name: &str) -> String {
        self.truncate(&format!("{}-{}", URL_MAP_PREFIX, lb_name))
    }

    pub fn target_proxy_name(&self, lb_name: &str) -> String {
        self.truncate(&format!("{}-{}", TARGET_PROXY_PREFIX, lb_name))
    }

    pub fn forwarding_rule_name(&self, lb_name: &str) -> String {
        self.truncate(&format!("{}-{}", FORWARDING_RULE_PREFIX, lb_name))
    }

    /// Static IPs share the forwarding rule name; they are a different kind.
    pub fn static_ip_name(&self, lb_name: &str) -> String {
        self.forwarding_rule_name(lb_name)
    }

    /// Path matcher name for a hostname. Hostnames may be wildcards, matcher
    /// names may not, so the host is hashed.
    pub fn path_matcher_name(&self, host: &str) -> String {
        let digest = format!("{:x}", Sha256::digest(host.as_bytes()));
        format!("{}{}", HOST_RULE_PREFIX, &digest[..32])
    }

    /// Recover the service port from a backend or health check name.
    ///
    /// Returns `None` unless `name` is exactly what [`Namer::be_name`] produces
    /// for some port under this cluster name, which makes it safe to use as an
    /// ownership test before deleting anything.
    pub fn be_port(&self, name: &str) -> Option<u16> {
        let rest = name.strip_prefix(BACKEND_PREFIX)?.strip_prefix('-')?;
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        let port: u16 = digits.parse().ok()?;
        (self.be_name(port) == name).then_some(port)
    }

    /// Cut a name to [`NAME_LEN_LIMIT`], forcing an alphanumeric last character.
    pub fn truncate(&self, name: &str) -> String {
        truncate(name)
    }

    fn with_cluster_suffix(&self, base: String) -> String {
        if self.cluster_name.is_empty() {
            base
        } else {
            format!("{}{}{}", base, CLUSTER_NAME_DELIMITER, self.cluster_name)
        }
    }
}

/// Cut a name to [`NAME_LEN_LIMIT`] characters.
///
/// Names within the limit are returned unchanged. Longer names keep their first
/// `NAME_LEN_LIMIT - 1` characters followed by [`ALPHANUMERIC_FILLER`].
pub fn truncate(name: &str) -> String {
    if name.chars().count() <= NAME_LEN_LIMIT {
        return name.to_string();
    }
    let mut truncated: String = name.chars().take(NAME_LEN_LIMIT - 1).collect();
    truncated.push(ALPHANUMERIC_FILLER);
    truncated
}
