//! glbc - reconciles ingress routing rules against cloud L7 load balancers
//!
//! One [`cluster::ClusterManager`] owns a pool per resource family (instance
//! groups, health checks, backend services, load balancers) and converges the
//! provider on a [`cluster::DesiredState`] in dependency order. The
//! [`controller`] runs that sync periodically and the [`server`] exposes its
//! outcome.

pub mod backends;
pub mod cli;
pub mod cloud;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod error;
pub mod healthchecks;
pub mod instances;
pub mod loadbalancers;
pub mod retry;
pub mod server;
pub mod state;
pub mod utils;

pub use error::{Error, Result};
