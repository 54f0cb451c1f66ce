use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::cluster::{ClusterManager, SyncReport};

/// Outcome of the controller's cycles so far
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    pub cycles: u64,
    pub failures: u64,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_report: Option<SyncReport>,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ClusterManager>,
    pub status: Arc<RwLock<SyncStatus>>,
}

impl AppState {
    pub fn new(manager: Arc<ClusterManager>) -> Self {
        Self {
            manager,
            status: Arc::new(RwLock::new(SyncStatus::default())),
        }
    }

    /// Record a successful cycle
    pub async fn record_success(&self, report: SyncReport) {
        let mut status = self.status.write().await;
        status.cycles += 1;
        status.last_attempt = Some(report.finished_at);
        status.last_error = None;
        status.last_report = Some(report);
    }

    /// Record a failed cycle; the last good report is kept
    pub async fn record_failure(&self, error: String) {
        let mut status = self.status.write().await;
        status.cycles += 1;
        status.failures += 1;
        status.last_attempt = Some(Utc::now());
        status.last_error = Some(error);
    }

    pub async fn snapshot(&self) -> SyncStatus {
        self.status.read().await.clone()
    }
}
