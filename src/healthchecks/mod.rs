//! Health Check Pool
//!
//! One HTTP health check per backend port, named like the backend itself.
//! Health checks are never patched: a check whose probe drifted is recreated,
//! and only while no backend references it yet.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cloud::{HealthChecks, HttpHealthCheck, ResourceKind};
use crate::error::{Error, Pool, Result};
use crate::utils::Namer;

pub const DEFAULT_CHECK_INTERVAL_SEC: u32 = 1;
pub const DEFAULT_TIMEOUT_SEC: u32 = 1;
pub const DEFAULT_HEALTHY_THRESHOLD: u32 = 1;
pub const DEFAULT_UNHEALTHY_THRESHOLD: u32 = 10;
pub const DEFAULT_DESCRIPTION: &str = "Default kubernetes L7 Loadbalancing health check.";

const KIND: ResourceKind = ResourceKind::HealthCheck;

pub struct HealthCheckPool {
    cloud: Arc<dyn HealthChecks>,
    namer: Namer,
    request_path: String,
}

impl HealthCheckPool {
    pub fn new(cloud: Arc<dyn HealthChecks>, namer: Namer, request_path: impl Into<String>) -> Self {
        Self {
            cloud,
            namer,
            request_path: request_path.into(),
        }
    }

    /// The health check a backend on `port` should use
    pub fn desired(&self, port: u16) -> HttpHealthCheck {
        HttpHealthCheck {
            name: self.namer.be_name(port),
            self_link: String::new(),
            description: DEFAULT_DESCRIPTION.to_string(),
            port,
            request_path: self.request_path.clone(),
            check_interval_sec: DEFAULT_CHECK_INTERVAL_SEC,
            timeout_sec: DEFAULT_TIMEOUT_SEC,
            healthy_threshold: DEFAULT_HEALTHY_THRESHOLD,
            unhealthy_threshold: DEFAULT_UNHEALTHY_THRESHOLD,
        }
    }

    pub async fn get(&self, name: &str) -> Result<HttpHealthCheck> {
        self.cloud
            .get_http_health_check(name)
            .await
            .map_err(|e| Error::cloud(Pool::HealthChecks, "get", KIND, name, e))
    }

    /// Create a health check. Not an upsert: the provider rejects duplicates.
    pub async fn create(&self, hc: &HttpHealthCheck) -> Result<HttpHealthCheck> {
        info!("Creating health check {} (port {})", hc.name, hc.port);
        self.cloud
            .create_http_health_check(hc)
            .await
            .map_err(|e| Error::cloud(Pool::HealthChecks, "create", KIND, &hc.name, e))
    }

    /// Delete a health check. NotFound is returned to the caller.
    pub async fn delete(&self, name: &str) -> Result<()> {
        info!("Deleting health check {}", name);
        self.cloud
            .delete_http_health_check(name)
            .await
            .map_err(|e| Error::cloud(Pool::HealthChecks, "delete", KIND, name, e))
    }

    /// Health checks whose names this cluster's namer produced
    pub async fn list_owned(&self) -> Result<Vec<HttpHealthCheck>> {
        let all = self
            .cloud
            .list_http_health_checks()
            .await
            .map_err(|e| Error::cloud(Pool::HealthChecks, "list", KIND, "*", e))?;
        Ok(all
            .into_iter()
            .filter(|hc| self.namer.be_port(&hc.name).is_some())
            .collect())
    }

    /// Get-or-create the health check for `port`.
    ///
    /// `in_use` says whether a backend already references the check; a drifted
    /// check is only recreated when it is not.
    pub async fn ensure(&self, port: u16, in_use: bool) -> Result<HttpHealthCheck> {
        let desired = self.desired(port);
        let existing = match self.get(&desired.name).await {
            Ok(hc) => hc,
            Err(e) if e.is_not_found() => return self.create_or_adopt(&desired).await,
            Err(e) => return Err(e),
        };

        if existing.same_probe(&desired) {
            debug!("Health check {} up to date", existing.name);
            return Ok(existing);
        }
        if in_use {
            warn!(
                "Health check {} differs from the desired probe but is in use, leaving it",
                existing.name
            );
            return Ok(existing);
        }

        info!("Recreating drifted health check {}", existing.name);
        match self.delete(&existing.name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.create_or_adopt(&desired).await
    }

    /// Create, treating a lost create race as converged.
    async fn create_or_adopt(&self, desired: &HttpHealthCheck) -> Result<HttpHealthCheck> {
        match self.create(desired).await {
            Err(e) if e.cloud_error().is_some_and(|c| c.is_conflict()) => {
                debug!("Health check {} appeared concurrently", desired.name);
                self.get(&desired.name).await
            }
            other => other,
        }
    }
}
