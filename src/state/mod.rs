//! Cluster State Source
//!
//! Supplies the live node set and routing rules. Watching the cluster is
//! somebody else's job; the controller only asks for the current desired
//! state at the start of every cycle.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::cluster::DesiredState;
use crate::config::parse_document;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

// ============================================================================
// SBIO: Trait for abstraction
// ============================================================================

#[async_trait]
pub trait ClusterStateSource: Send + Sync {
    async fn desired_state(&self) -> Result<DesiredState, StateError>;
}

// ============================================================================
// SBIO: I/O implementation (file re-read every cycle)
// ============================================================================

/// Desired state read from a YAML or JSON file on every call, so edits are
/// picked up on the next cycle.
pub struct FileStateSource {
    path: PathBuf,
}

impl FileStateSource {
    pub fn new(path: impl AsRef<str>) -> Self {
        let expanded = shellexpand::tilde(path.as_ref());
        Self {
            path: PathBuf::from(expanded.as_ref()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ClusterStateSource for FileStateSource {
    async fn desired_state(&self) -> Result<DesiredState, StateError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| StateError::Io {
                path: self.path.clone(),
                source,
            })?;
        parse_document(&self.path, &content).map_err(|message| StateError::Parse {
            path: self.path.clone(),
            message,
        })
    }
}

/// Desired state held in memory and replaced with [`StaticStateSource::set`]
#[derive(Default)]
pub struct StaticStateSource {
    state: RwLock<DesiredState>,
}

impl StaticStateSource {
    pub fn new(state: DesiredState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    pub async fn set(&self, state: DesiredState) {
        *self.state.write().await = state;
    }
}

#[async_trait]
impl ClusterStateSource for StaticStateSource {
    async fn desired_state(&self) -> Result<DesiredState, StateError> {
        Ok(self.state.read().await.clone())
    }
}
