//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use std::convert::Infallible;

use crate::backends::{BackendHealth, GcReport};
use crate::cloud::BackendService;
use crate::cluster::SyncReport;
use crate::loadbalancers::{LoadBalancer, LoadBalancerSpec};
use crate::utils::{link_name, Namer};

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No resources found.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate().take(widths.len()) {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let mut output = String::new();
    let mut push_row = |cells: Vec<String>| {
        let line: Vec<String> = cells
            .iter()
            .enumerate()
            .map(|(i, cell)| match widths.get(i) {
                Some(w) => format!("{:width$}", cell, width = *w),
                None => cell.clone(),
            })
            .collect();
        output.push_str(line.join("   ").trim_end());
        output.push('\n');
    };

    push_row(headers.iter().map(|h| h.to_uppercase()).collect());
    for row in rows {
        push_row(row);
    }
    output
}

fn or_none(items: &[String]) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(", ")
    }
}

// ============================================================================
// Sync display
// ============================================================================

/// Format the outcome of one sync cycle
pub fn format_sync_report(report: &SyncReport) -> String {
    let mut output = String::new();
    let elapsed = report.finished_at - report.started_at;

    output.push_str(&format!(
        "Sync finished in {}ms\n\n",
        elapsed.num_milliseconds()
    ));
    output.push_str(&format!(
        "Instances added:   {}\n",
        or_none(&report.membership.added)
    ));
    output.push_str(&format!(
        "Instances removed: {}\n",
        or_none(&report.membership.removed)
    ));
    output.push_str(&format!("Backends:          {}\n", or_none(&report.backends)));
    output.push_str(&format_gc("Backend GC", &report.backend_gc));
    output.push_str(&format_gc("Load balancer GC", &report.load_balancer_gc));
    output.push('\n');

    let rows = report
        .load_balancers
        .iter()
        .map(|lb| {
            vec![
                lb.name.clone(),
                lb.ip.clone(),
                lb.static_ip.clone().unwrap_or_else(|| "-".to_string()),
                lb.url_map.clone(),
            ]
        })
        .collect();
    output.push_str(&format_table(&["name", "ip", "static ip", "url map"], rows));

    if !report.load_balancers.is_empty() {
        output.push('\n');
        output.push_str(&report.url_map_dump());
    }
    output
}

fn format_gc(label: &str, gc: &GcReport) -> String {
    let mut line = format!("{}: deleted {}", label, or_none(&gc.deleted));
    if gc.has_deferred() {
        line.push_str(&format!(", deferred {}", gc.deferred.join(", ")));
    }
    line.push('\n');
    line
}

/// Format the load balancers a desired state would produce, with service
/// ports shown as the backend names they resolve to.
pub fn format_plan(specs: &[LoadBalancerSpec], namer: &Namer) -> String {
    if specs.is_empty() {
        return "No load balancers requested.\n".to_string();
    }

    let mut output = String::new();
    for spec in specs {
        let lb_name = namer.lb_name(&spec.key);
        output.push_str(&format!("Load balancer {} ({})\n", lb_name, spec.key));
        output.push_str(&format!("  URL map: {}\n", namer.url_map_name(&lb_name)));
        match (&spec.ip, spec.static_ip) {
            (Some(ip), _) => output.push_str(&format!("  IP: {}\n", ip)),
            (None, true) => output.push_str("  IP: ephemeral, promoted to static\n"),
            (None, false) => output.push_str("  IP: ephemeral\n"),
        }
        let named = match spec
            .url_map
            .try_map(|port| Ok::<_, Infallible>(namer.be_name(*port)))
        {
            Ok(named) => named,
            Err(never) => match never {},
        };
        for line in named.to_string().lines() {
            output.push_str(&format!("  {}\n", line));
        }
    }
    output
}

// ============================================================================
// Resource display
// ============================================================================

/// Format backend services as a table
pub fn format_backend_list(backends: &[BackendService]) -> String {
    let rows = backends
        .iter()
        .map(|be| {
            vec![
                be.name.clone(),
                be.port.to_string(),
                be.backends
                    .iter()
                    .map(|b| link_name(&b.group).to_string())
                    .collect::<Vec<_>>()
                    .join(","),
                be.health_checks
                    .iter()
                    .map(|hc| link_name(hc).to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            ]
        })
        .collect();
    format_table(&["name", "port", "groups", "health checks"], rows)
}

/// Format observed load balancers as a table
pub fn format_load_balancer_list(lbs: &[LoadBalancer]) -> String {
    let rows = lbs
        .iter()
        .map(|lb| {
            vec![
                lb.name.clone(),
                lb.ip().unwrap_or("-").to_string(),
                lb.target_proxy
                    .as_ref()
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| "-".to_string()),
                lb.forwarding_rule
                    .as_ref()
                    .map(|fr| fr.name.clone())
                    .unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();
    format_table(&["name", "ip", "target proxy", "forwarding rule"], rows)
}

/// Format per-instance health behind one backend
pub fn format_backend_health(health: &BackendHealth) -> String {
    let mut output = format!("Backend {} (port {})\n", health.backend, health.port);
    let rows = health
        .instances
        .iter()
        .map(|s| {
            vec![
                link_name(&s.instance).to_string(),
                s.ip_address.clone(),
                s.health_state.clone(),
            ]
        })
        .collect();
    output.push_str(&format_table(&["instance", "ip", "state"], rows));
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::HealthStatus;
    use crate::cluster::{DesiredState, IngressSpec, RoutingRule};

    #[test]
    fn test_format_table() {
        let headers = &["name", "port"];
        let rows = vec![
            vec!["k8s-be-80--uid1".to_string(), "80".to_string()],
            vec!["k8s-be-443--uid1".to_string(), "443".to_string()],
        ];

        let output = format_table(headers, rows);
        assert!(output.starts_with("NAME"));
        assert!(output.contains("k8s-be-443--uid1   443"));
    }

    #[test]
    fn test_format_table_empty() {
        let output = format_table(&["NAME"], vec![]);
        assert!(output.contains("No resources found"));
    }

    #[test]
    fn test_format_plan() {
        let desired = DesiredState {
            nodes: Default::default(),
            ingresses: vec![IngressSpec {
                name: "default/foo".into(),
                rules: vec![RoutingRule {
                    host: "foo.bar.com".into(),
                    path: "/foo".into(),
                    port: 80,
                }],
                default_port: None,
                ip: None,
                static_ip: true,
            }],
        };
        let namer = Namer::new("uid1");
        let specs = desired.load_balancer_specs(None).unwrap();

        let output = format_plan(&specs, &namer);
        assert!(output.contains("Load balancer default-foo--uid1 (default/foo)"));
        assert!(output.contains("promoted to static"));
        assert!(output.contains("/foo: k8s-be-80--uid1"));
    }

    #[test]
    fn test_format_plan_empty() {
        assert!(format_plan(&[], &Namer::new("uid1")).contains("No load balancers"));
    }

    #[test]
    fn test_format_backend_health() {
        let health = BackendHealth {
            backend: "k8s-be-80--uid1".into(),
            port: 80,
            instances: vec![HealthStatus {
                instance: "https://example/zones/zone-a/instances/n1".into(),
                ip_address: "10.0.0.1".into(),
                port: 80,
                health_state: "HEALTHY".into(),
            }],
        };
        let output = format_backend_health(&health);
        assert!(output.contains("Backend k8s-be-80--uid1 (port 80)"));
        assert!(output.contains("n1"));
        assert!(output.contains("HEALTHY"));
    }
}
