//! Desired state handed to the cluster manager each cycle

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::loadbalancers::LoadBalancerSpec;
use crate::utils::UrlMap;

/// One host/path -> service port route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Empty means any host
    #[serde(default)]
    pub host: String,
    /// Empty means any path
    #[serde(default)]
    pub path: String,
    pub port: u16,
}

/// Routing intent of one ingress; becomes one load balancer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressSpec {
    /// Logical key, e.g. `namespace/name`
    pub name: String,
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
    /// Port serving requests no rule matches
    #[serde(default)]
    pub default_port: Option<u16>,
    /// Requested external IP
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub static_ip: bool,
}

impl IngressSpec {
    /// Routes of this ingress, without a default entry
    pub fn url_map(&self) -> UrlMap<u16> {
        let mut url_map = UrlMap::new();
        for rule in &self.rules {
            url_map.put_path(&rule.host, &rule.path, rule.port);
        }
        url_map
    }

    /// Default port: the ingress's own, else the cluster default, else the
    /// port of the first route in host/path order.
    pub fn effective_default(&self, cluster_default: Option<u16>) -> Option<u16> {
        self.default_port.or(cluster_default).or_else(|| {
            self.url_map()
                .hosts()
                .next()
                .and_then(|(_, paths)| paths.values().next().copied().flatten())
        })
    }
}

/// Live nodes plus every ingress
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    #[serde(default)]
    pub nodes: BTreeSet<String>,
    #[serde(default)]
    pub ingresses: Vec<IngressSpec>,
}

impl DesiredState {
    /// Every service port that needs a backend. The cluster default counts
    /// only while some ingress exists.
    pub fn service_ports(&self, cluster_default: Option<u16>) -> BTreeSet<u16> {
        let mut ports: BTreeSet<u16> = self
            .ingresses
            .iter()
            .flat_map(|ing| ing.rules.iter().map(|r| r.port).chain(ing.default_port))
            .collect();
        if !self.ingresses.is_empty() {
            ports.extend(cluster_default);
        }
        ports
    }

    /// One load balancer per ingress, each URL map carrying its default.
    pub fn load_balancer_specs(&self, cluster_default: Option<u16>) -> Result<Vec<LoadBalancerSpec>> {
        let mut seen = HashSet::new();
        let mut specs = Vec::with_capacity(self.ingresses.len());
        for ing in &self.ingresses {
            if !seen.insert(ing.name.as_str()) {
                return Err(Error::invariant(format!("duplicate ingress {}", ing.name)));
            }
            let default = ing.effective_default(cluster_default).ok_or_else(|| {
                Error::invariant(format!(
                    "ingress {} has no rules and no default backend",
                    ing.name
                ))
            })?;
            let mut url_map = ing.url_map();
            url_map.put_default_backend(default);
            specs.push(LoadBalancerSpec {
                key: ing.name.clone(),
                url_map,
                ip: ing.ip.clone(),
                static_ip: ing.static_ip,
            });
        }
        Ok(specs)
    }

    /// Reject port 0 and empty ingress names.
    pub fn validate(&self) -> Result<()> {
        for ing in &self.ingresses {
            if ing.name.is_empty() {
                return Err(Error::State("ingress with an empty name".into()));
            }
            let zero_port = ing.rules.iter().any(|r| r.port == 0) || ing.default_port == Some(0);
            if zero_port {
                return Err(Error::State(format!("ingress {} uses port 0", ing.name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(host: &str, path: &str, port: u16) -> RoutingRule {
        RoutingRule {
            host: host.into(),
            path: path.into(),
            port,
        }
    }

    fn ingress(name: &str, rules: Vec<RoutingRule>, default_port: Option<u16>) -> IngressSpec {
        IngressSpec {
            name: name.into(),
            rules,
            default_port,
            ip: None,
            static_ip: false,
        }
    }

    #[test]
    fn test_service_ports() {
        let desired = DesiredState {
            nodes: BTreeSet::new(),
            ingresses: vec![
                ingress("a", vec![rule("x", "/", 80), rule("y", "/", 81)], Some(90)),
                ingress("b", vec![rule("z", "/", 80)], None),
            ],
        };
        let ports: Vec<u16> = desired.service_ports(Some(30000)).into_iter().collect();
        assert_eq!(ports, vec![80, 81, 90, 30000]);
    }

    #[test]
    fn test_cluster_default_needs_an_ingress() {
        assert!(DesiredState::default().service_ports(Some(30000)).is_empty());
    }

    #[test]
    fn test_default_falls_back_to_first_rule() {
        let ing = ingress("a", vec![rule("b.com", "/y", 81), rule("a.com", "/x", 80)], None);
        assert_eq!(ing.effective_default(None), Some(80));
        assert_eq!(ing.effective_default(Some(30000)), Some(30000));

        let own = ingress("a", vec![rule("a.com", "/x", 80)], Some(8080));
        assert_eq!(own.effective_default(Some(30000)), Some(8080));
    }

    #[test]
    fn test_specs_carry_default_entry() {
        let desired = DesiredState {
            nodes: BTreeSet::new(),
            ingresses: vec![ingress("ns/foo", vec![rule("foo.bar.com", "/foo", 80)], None)],
        };
        let mut specs = desired.load_balancer_specs(None).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].key, "ns/foo");
        assert_eq!(specs[0].url_map.get_default_backend(), Some(80));
    }

    #[test]
    fn test_ingress_without_any_backend_is_invariant_violation() {
        let desired = DesiredState {
            nodes: BTreeSet::new(),
            ingresses: vec![ingress("ns/empty", vec![], None)],
        };
        assert!(matches!(
            desired.load_balancer_specs(None),
            Err(Error::InvariantViolation(_))
        ));
        assert!(desired.load_balancer_specs(Some(30000)).is_ok());
    }

    #[test]
    fn test_duplicate_ingress_rejected() {
        let desired = DesiredState {
            nodes: BTreeSet::new(),
            ingresses: vec![
                ingress("ns/a", vec![], Some(80)),
                ingress("ns/a", vec![], Some(81)),
            ],
        };
        assert!(desired.load_balancer_specs(None).is_err());
    }

    #[test]
    fn test_validate_rejects_port_zero() {
        let desired = DesiredState {
            nodes: BTreeSet::new(),
            ingresses: vec![ingress("ns/a", vec![rule("", "", 0)], None)],
        };
        assert!(matches!(desired.validate(), Err(Error::State(_))));
    }

    #[test]
    fn test_deserialize_yaml() {
        let yaml = r#"
nodes: [n1, n2]
ingresses:
  - name: default/foo
    rules:
      - host: foo.bar.com
        path: /foo
        port: 80
"#;
        let desired: DesiredState = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(desired.nodes.len(), 2);
        assert_eq!(desired.ingresses[0].rules[0].port, 80);
        assert!(!desired.ingresses[0].static_ip);
    }
}
