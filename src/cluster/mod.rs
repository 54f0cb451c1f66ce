//! Cluster-level reconciliation
//!
//! [`ClusterManager`] drives the pools through one sync cycle per call. The
//! desired state it consumes and the per-cycle deadline/cancellation context
//! live next to it.

pub mod context;
pub mod desired;
pub mod manager;

pub use context::SyncContext;
pub use desired::{DesiredState, IngressSpec, RoutingRule};
pub use manager::{ClusterManager, ManagerOptions, SyncReport};
