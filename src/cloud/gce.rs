//! Compute REST client
//!
//! Implements every capability set against the compute v1 API. Mutations
//! return a provider operation; the client blocks on it with the `wait`
//! endpoint before returning, so callers observe the resource as created.
//! Every mutation carries a fresh `requestId` so a retried insert is
//! deduplicated by the provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, trace, warn};

use super::{
    Address, BackendService, BackendServices, CloudError, CloudResult, ForwardingRule,
    HealthChecks, HealthStatus, HttpHealthCheck, InstanceGroup, InstanceGroups, LoadBalancers,
    NamedPort, TargetHttpProxy, UrlMapResource, REASON_RESOURCE_IN_USE,
};
use crate::config::ControllerConfig;
use crate::utils::link_name;

/// Wait calls issued for one operation before it counts as timed out.
/// Each call blocks server-side for up to the request timeout.
pub const MAX_OPERATION_WAITS: u32 = 10;

// ============================================================================
// Wire structures (pure, no I/O)
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPage<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InstanceWithStatus {
    instance: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupHealth {
    #[serde(default)]
    health_status: Vec<HealthStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Operation {
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    zone: Option<String>,
    #[serde(default)]
    error: Option<OperationErrors>,
}

#[derive(Debug, Clone, Deserialize)]
struct OperationErrors {
    #[serde(default)]
    errors: Vec<OperationError>,
}

#[derive(Debug, Clone, Deserialize)]
struct OperationError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorReason>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorReason {
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InstanceReference {
    instance: String,
}

/// Build a [`CloudError`] from a non-success response body.
pub(crate) fn parse_api_error(status: u16, body: &str) -> CloudError {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => {
            let reason = parsed
                .error
                .errors
                .first()
                .map(|e| e.reason.clone())
                .unwrap_or_default();
            CloudError::api(status, reason, parsed.error.message)
        }
        Err(_) => CloudError::api(status, "", body.trim()),
    }
}

/// Translate the errors of a finished operation, if any.
///
/// Some failures only surface once the operation completes; the well-known
/// codes are mapped back onto HTTP-style errors so callers classify them the
/// same way as synchronous failures.
pub(crate) fn operation_error(op: &Operation) -> Option<CloudError> {
    let first = op.error.as_ref()?.errors.first()?;
    let err = match first.code.as_str() {
        "RESOURCE_NOT_FOUND" => CloudError::api(404, "notFound", first.message.clone()),
        "RESOURCE_ALREADY_EXISTS" => CloudError::api(409, "alreadyExists", first.message.clone()),
        "RESOURCE_IN_USE_BY_ANOTHER_RESOURCE" => {
            CloudError::api(400, REASON_RESOURCE_IN_USE, first.message.clone())
        }
        _ => CloudError::Operation {
            name: op.name.clone(),
            message: format!("{}: {}", first.code, first.message),
        },
    };
    Some(err)
}

// ============================================================================
// SBIO: I/O implementation (real HTTP client)
// ============================================================================

#[derive(Clone)]
pub struct ComputeClient {
    client: reqwest::Client,
    /// `{endpoint}/compute/v1/projects/{project}`
    base_url: String,
    access_token: Option<String>,
    call_timeout: Duration,
}

impl ComputeClient {
    pub fn new(
        endpoint: &str,
        project: &str,
        access_token: Option<String>,
        call_timeout: Duration,
    ) -> CloudResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|e| CloudError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: format!(
                "{}/compute/v1/projects/{}",
                endpoint.trim_end_matches('/'),
                project
            ),
            access_token,
            call_timeout,
        })
    }

    /// Build a client from configuration, reading the bearer token from the
    /// configured environment variable.
    pub fn from_config(config: &ControllerConfig) -> CloudResult<Self> {
        let token = std::env::var(&config.access_token_env).ok();
        if token.is_none() {
            debug!(
                "{} is not set, calling the compute API without a bearer token",
                config.access_token_env
            );
        }
        Self::new(
            &config.compute_endpoint,
            &config.project,
            token,
            Duration::from_secs(config.call_timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn global_url(&self, collection: &str) -> String {
        format!("{}/global/{}", self.base_url, collection)
    }

    fn zone_url(&self, zone: &str, collection: &str) -> String {
        format!("{}/zones/{}/{}", self.base_url, zone, collection)
    }

    fn instance_url(&self, zone: &str, name: &str) -> String {
        self.zone_url(zone, &format!("instances/{}", name))
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let req = self.client.request(method, url);
        match self.access_token {
            Some(ref token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> CloudResult<T> {
        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                CloudError::Timeout(self.call_timeout)
            } else {
                CloudError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(parse_api_error(status.as_u16(), &text));
        }

        response
            .json()
            .await
            .map_err(|e| CloudError::Parse(e.to_string()))
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> CloudResult<T> {
        trace!("GET {}", url);
        self.send(self.request(Method::GET, url)).await
    }

    /// Fetch every page of a list call.
    async fn list_all<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> CloudResult<Vec<T>> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut req = self.request(method.clone(), url);
            if let Some(ref token) = page_token {
                req = req.query(&[("pageToken", token)]);
            }
            if let Some(ref body) = body {
                req = req.json(body);
            }
            let page: ListPage<T> = self.send(req).await?;
            items.extend(page.items);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(items),
            }
        }
    }

    /// Issue a mutation and block until its operation is done.
    async fn mutate<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> CloudResult<()> {
        let request_id = uuid::Uuid::new_v4().to_string();
        debug!("{} {} (request {})", method, url, request_id);
        let mut req = self
            .request(method, url)
            .query(&[("requestId", request_id.as_str())]);
        if let Some(body) = body {
            req = req.json(body);
        }
        let op: Operation = self.send(req).await?;
        self.wait_for(op).await
    }

    async fn wait_for(&self, mut op: Operation) -> CloudResult<()> {
        let mut waits = 0;
        while op.status != "DONE" {
            if waits == MAX_OPERATION_WAITS {
                warn!(
                    "Operation {} still {} after {} waits",
                    op.name, op.status, waits
                );
                return Err(CloudError::Timeout(self.call_timeout * MAX_OPERATION_WAITS));
            }
            waits += 1;
            let url = match op.zone {
                Some(ref zone) => format!(
                    "{}/{}/wait",
                    self.zone_url(link_name(zone), "operations"),
                    op.name
                ),
                None => format!("{}/{}/wait", self.global_url("operations"), op.name),
            };
            trace!("waiting on operation {}", op.name);
            op = self.send(self.request(Method::POST, &url)).await?;
        }
        match operation_error(&op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Capability sets
// ============================================================================

#[async_trait]
impl BackendServices for ComputeClient {
    async fn get_backend_service(&self, name: &str) -> CloudResult<BackendService> {
        self.get(&format!("{}/{}", self.global_url("backendServices"), name))
            .await
    }

    async fn create_backend_service(&self, be: &BackendService) -> CloudResult<BackendService> {
        self.mutate(Method::POST, &self.global_url("backendServices"), Some(be))
            .await?;
        self.get_backend_service(&be.name).await
    }

    async fn update_backend_service(&self, be: &BackendService) -> CloudResult<()> {
        let url = format!("{}/{}", self.global_url("backendServices"), be.name);
        self.mutate(Method::PUT, &url, Some(be)).await
    }

    async fn delete_backend_service(&self, name: &str) -> CloudResult<()> {
        let url = format!("{}/{}", self.global_url("backendServices"), name);
        self.mutate::<()>(Method::DELETE, &url, None).await
    }

    async fn list_backend_services(&self) -> CloudResult<Vec<BackendService>> {
        self.list_all(Method::GET, &self.global_url("backendServices"), None)
            .await
    }

    async fn get_health(&self, name: &str, group_link: &str) -> CloudResult<Vec<HealthStatus>> {
        let url = format!("{}/{}/getHealth", self.global_url("backendServices"), name);
        let req = self
            .request(Method::POST, &url)
            .json(&json!({ "group": group_link }));
        let health: GroupHealth = self.send(req).await?;
        Ok(health.health_status)
    }
}

#[async_trait]
impl HealthChecks for ComputeClient {
    async fn get_http_health_check(&self, name: &str) -> CloudResult<HttpHealthCheck> {
        self.get(&format!("{}/{}", self.global_url("httpHealthChecks"), name))
            .await
    }

    async fn create_http_health_check(
        &self,
        hc: &HttpHealthCheck,
    ) -> CloudResult<HttpHealthCheck> {
        self.mutate(Method::POST, &self.global_url("httpHealthChecks"), Some(hc))
            .await?;
        self.get_http_health_check(&hc.name).await
    }

    async fn delete_http_health_check(&self, name: &str) -> CloudResult<()> {
        let url = format!("{}/{}", self.global_url("httpHealthChecks"), name);
        self.mutate::<()>(Method::DELETE, &url, None).await
    }

    async fn list_http_health_checks(&self) -> CloudResult<Vec<HttpHealthCheck>> {
        self.list_all(Method::GET, &self.global_url("httpHealthChecks"), None)
            .await
    }
}

#[async_trait]
impl InstanceGroups for ComputeClient {
    async fn get_instance_group(&self, name: &str, zone: &str) -> CloudResult<InstanceGroup> {
        self.get(&format!("{}/{}", self.zone_url(zone, "instanceGroups"), name))
            .await
    }

    async fn create_instance_group(&self, name: &str, zone: &str) -> CloudResult<InstanceGroup> {
        let body = json!({ "name": name });
        self.mutate(Method::POST, &self.zone_url(zone, "instanceGroups"), Some(&body))
            .await?;
        self.get_instance_group(name, zone).await
    }

    async fn delete_instance_group(&self, name: &str, zone: &str) -> CloudResult<()> {
        let url = format!("{}/{}", self.zone_url(zone, "instanceGroups"), name);
        self.mutate::<()>(Method::DELETE, &url, None).await
    }

    async fn list_instance_groups(&self, zone: &str) -> CloudResult<Vec<InstanceGroup>> {
        self.list_all(Method::GET, &self.zone_url(zone, "instanceGroups"), None)
            .await
    }

    async fn list_instances(&self, name: &str, zone: &str) -> CloudResult<Vec<String>> {
        let url = format!(
            "{}/{}/listInstances",
            self.zone_url(zone, "instanceGroups"),
            name
        );
        let members: Vec<InstanceWithStatus> = self
            .list_all(Method::POST, &url, Some(json!({ "instanceState": "ALL" })))
            .await?;
        Ok(members
            .into_iter()
            .map(|m| link_name(&m.instance).to_string())
            .collect())
    }

    async fn add_instances(&self, name: &str, zone: &str, instances: &[String]) -> CloudResult<()> {
        let url = format!(
            "{}/{}/addInstances",
            self.zone_url(zone, "instanceGroups"),
            name
        );
        let refs: Vec<InstanceReference> = instances
            .iter()
            .map(|i| InstanceReference {
                instance: self.instance_url(zone, i),
            })
            .collect();
        self.mutate(Method::POST, &url, Some(&json!({ "instances": refs })))
            .await
    }

    async fn remove_instances(
        &self,
        name: &str,
        zone: &str,
        instances: &[String],
    ) -> CloudResult<()> {
        let url = format!(
            "{}/{}/removeInstances",
            self.zone_url(zone, "instanceGroups"),
            name
        );
        let refs: Vec<InstanceReference> = instances
            .iter()
            .map(|i| InstanceReference {
                instance: self.instance_url(zone, i),
            })
            .collect();
        self.mutate(Method::POST, &url, Some(&json!({ "instances": refs })))
            .await
    }

    async fn set_named_ports(
        &self,
        group: &InstanceGroup,
        ports: &[NamedPort],
    ) -> CloudResult<InstanceGroup> {
        let url = format!(
            "{}/{}/setNamedPorts",
            self.zone_url(link_name(&group.zone), "instanceGroups"),
            group.name
        );
        let body = json!({ "namedPorts": ports, "fingerprint": group.fingerprint });
        self.mutate(Method::POST, &url, Some(&body)).await?;
        self.get_instance_group(&group.name, link_name(&group.zone))
            .await
    }
}

#[async_trait]
impl LoadBalancers for ComputeClient {
    async fn get_url_map(&self, name: &str) -> CloudResult<UrlMapResource> {
        self.get(&format!("{}/{}", self.global_url("urlMaps"), name))
            .await
    }

    async fn create_url_map(&self, um: &UrlMapResource) -> CloudResult<UrlMapResource> {
        self.mutate(Method::POST, &self.global_url("urlMaps"), Some(um))
            .await?;
        self.get_url_map(&um.name).await
    }

    async fn update_url_map(&self, um: &UrlMapResource) -> CloudResult<UrlMapResource> {
        let url = format!("{}/{}", self.global_url("urlMaps"), um.name);
        self.mutate(Method::PUT, &url, Some(um)).await?;
        self.get_url_map(&um.name).await
    }

    async fn delete_url_map(&self, name: &str) -> CloudResult<()> {
        let url = format!("{}/{}", self.global_url("urlMaps"), name);
        self.mutate::<()>(Method::DELETE, &url, None).await
    }

    async fn list_url_maps(&self) -> CloudResult<Vec<UrlMapResource>> {
        self.list_all(Method::GET, &self.global_url("urlMaps"), None)
            .await
    }

    async fn get_target_http_proxy(&self, name: &str) -> CloudResult<TargetHttpProxy> {
        self.get(&format!("{}/{}", self.global_url("targetHttpProxies"), name))
            .await
    }

    async fn create_target_http_proxy(
        &self,
        name: &str,
        url_map_link: &str,
    ) -> CloudResult<TargetHttpProxy> {
        let body = json!({ "name": name, "urlMap": url_map_link });
        self.mutate(Method::POST, &self.global_url("targetHttpProxies"), Some(&body))
            .await?;
        self.get_target_http_proxy(name).await
    }

    async fn set_url_map_for_target_http_proxy(
        &self,
        proxy: &TargetHttpProxy,
        url_map_link: &str,
    ) -> CloudResult<()> {
        // setUrlMap lives outside the global collection path
        let url = format!(
            "{}/targetHttpProxies/{}/setUrlMap",
            self.base_url, proxy.name
        );
        self.mutate(Method::POST, &url, Some(&json!({ "urlMap": url_map_link })))
            .await
    }

    async fn delete_target_http_proxy(&self, name: &str) -> CloudResult<()> {
        let url = format!("{}/{}", self.global_url("targetHttpProxies"), name);
        self.mutate::<()>(Method::DELETE, &url, None).await
    }

    async fn get_global_forwarding_rule(&self, name: &str) -> CloudResult<ForwardingRule> {
        self.get(&format!("{}/{}", self.global_url("forwardingRules"), name))
            .await
    }

    async fn create_global_forwarding_rule(
        &self,
        rule: &ForwardingRule,
    ) -> CloudResult<ForwardingRule> {
        self.mutate(Method::POST, &self.global_url("forwardingRules"), Some(rule))
            .await?;
        self.get_global_forwarding_rule(&rule.name).await
    }

    async fn set_proxy_for_global_forwarding_rule(
        &self,
        rule: &ForwardingRule,
        proxy_link: &str,
    ) -> CloudResult<()> {
        let url = format!(
            "{}/{}/setTarget",
            self.global_url("forwardingRules"),
            rule.name
        );
        self.mutate(Method::POST, &url, Some(&json!({ "target": proxy_link })))
            .await
    }

    async fn delete_global_forwarding_rule(&self, name: &str) -> CloudResult<()> {
        let url = format!("{}/{}", self.global_url("forwardingRules"), name);
        self.mutate::<()>(Method::DELETE, &url, None).await
    }

    async fn get_global_static_ip(&self, name: &str) -> CloudResult<Address> {
        self.get(&format!("{}/{}", self.global_url("addresses"), name))
            .await
    }

    async fn reserve_global_static_ip(&self, name: &str, ip: &str) -> CloudResult<Address> {
        let body = if ip.is_empty() {
            json!({ "name": name })
        } else {
            json!({ "name": name, "address": ip })
        };
        self.mutate(Method::POST, &self.global_url("addresses"), Some(&body))
            .await?;
        self.get_global_static_ip(name).await
    }

    async fn delete_global_static_ip(&self, name: &str) -> CloudResult<()> {
        let url = format!("{}/{}", self.global_url("addresses"), name);
        self.mutate::<()>(Method::DELETE, &url, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_api_error_with_reason() {
        let body = r#"{
            "error": {
                "code": 400,
                "message": "The health check resource 'k8s-be-80' is already being used",
                "errors": [{ "reason": "resourceInUseByAnotherResource", "domain": "global" }]
            }
        }"#;
        let err = parse_api_error(400, body);
        assert!(err.is_in_use());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_parse_api_error_falls_back_to_text() {
        let err = parse_api_error(502, "bad gateway\n");
        assert_eq!(err, CloudError::api(502, "", "bad gateway"));
        assert!(err.is_transient());
    }

    #[test]
    fn test_operation_error_mapping() {
        let op: Operation = serde_json::from_str(
            r#"{
                "name": "operation-123",
                "status": "DONE",
                "error": { "errors": [{ "code": "RESOURCE_NOT_FOUND", "message": "gone" }] }
            }"#,
        )
        .unwrap();
        assert!(operation_error(&op).unwrap().is_not_found());

        let op: Operation = serde_json::from_str(
            r#"{
                "name": "operation-456",
                "status": "DONE",
                "error": { "errors": [{ "code": "QUOTA_EXCEEDED", "message": "no room" }] }
            }"#,
        )
        .unwrap();
        assert!(matches!(
            operation_error(&op),
            Some(CloudError::Operation { ref name, .. }) if name == "operation-456"
        ));

        let done: Operation =
            serde_json::from_str(r#"{ "name": "operation-789", "status": "DONE" }"#).unwrap();
        assert!(operation_error(&done).is_none());
    }

    #[test]
    fn test_list_page_without_items() {
        let page: ListPage<BackendService> = serde_json::from_str(r#"{ "id": "x" }"#).unwrap();
        assert!(page.items.is_empty());
        assert!(page.next_page_token.is_none());
    }

    #[test]
    fn test_urls() {
        let client = ComputeClient::new(
            "https://compute.googleapis.com/",
            "proj",
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            client.base_url(),
            "https://compute.googleapis.com/compute/v1/projects/proj"
        );
        assert_eq!(
            client.instance_url("us-central1-b", "n1"),
            "https://compute.googleapis.com/compute/v1/projects/proj/zones/us-central1-b/instances/n1"
        );
    }

    #[test]
    fn test_forwarding_rule_wire_names() {
        let rule = ForwardingRule {
            name: "k8s-fw-lb".to_string(),
            ip_address: "1.2.3.4".to_string(),
            ip_protocol: "TCP".to_string(),
            port_range: "80-80".to_string(),
            target: "proxy".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_string(&rule).unwrap();
        assert!(json.contains("\"IPAddress\":\"1.2.3.4\""));
        assert!(json.contains("\"portRange\":\"80-80\""));
    }
}
