//! Instance Group Pool (Node Pool)
//!
//! Keeps the cluster instance group's membership equal to the live node set
//! and registers named ports for backend services. The pool manages groups in
//! a single zone; instance arguments are bare node names.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::cloud::{InstanceGroup, InstanceGroups, NamedPort, ResourceKind};
use crate::error::{Error, Pool, Result};
use crate::utils::Namer;

const KIND: ResourceKind = ResourceKind::InstanceGroup;

/// Membership changes applied by one [`NodePool::sync`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MembershipDelta {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl MembershipDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Nodes in `desired` but not `current`, and in `current` but not `desired`.
pub fn membership_delta(current: &BTreeSet<String>, desired: &BTreeSet<String>) -> MembershipDelta {
    MembershipDelta {
        added: desired.difference(current).cloned().collect(),
        removed: current.difference(desired).cloned().collect(),
    }
}

pub struct NodePool {
    cloud: Arc<dyn InstanceGroups>,
    namer: Namer,
    zone: String,
}

impl NodePool {
    pub fn new(cloud: Arc<dyn InstanceGroups>, namer: Namer, zone: impl Into<String>) -> Self {
        Self {
            cloud,
            namer,
            zone: zone.into(),
        }
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// Name of the instance group this pool keeps in sync
    pub fn group_name(&self) -> String {
        self.namer.ig_name()
    }

    fn err(&self, operation: &'static str, name: &str, e: crate::cloud::CloudError) -> Error {
        Error::cloud(Pool::NodePool, operation, KIND, name, e)
    }

    pub async fn get(&self, name: &str) -> Result<InstanceGroup> {
        self.cloud
            .get_instance_group(name, &self.zone)
            .await
            .map_err(|e| self.err("get", name, e))
    }

    /// Get the group, creating it if absent.
    pub async fn ensure_group(&self, name: &str) -> Result<InstanceGroup> {
        match self.get(name).await {
            Ok(ig) => return Ok(ig),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        info!("Creating instance group {} in {}", name, self.zone);
        match self.cloud.create_instance_group(name, &self.zone).await {
            Ok(ig) => Ok(ig),
            Err(e) if e.is_conflict() => self.get(name).await,
            Err(e) => Err(self.err("create", name, e)),
        }
    }

    /// Get-or-create group `name` and register `port` as a named port on it.
    /// Registering an already registered port is a no-op.
    pub async fn add_instance_group(&self, name: &str, port: u16) -> Result<(InstanceGroup, NamedPort)> {
        let ig = self.ensure_group(name).await?;
        if let Some(existing) = ig.named_port(port) {
            debug!("Instance group {} already has named port {}", name, existing.name);
            let existing = existing.clone();
            return Ok((ig, existing));
        }

        let named_port = self.namer.named_port(port);
        let mut ports = ig.named_ports.clone();
        ports.push(named_port.clone());
        info!(
            "Adding named port {}:{} to instance group {}",
            named_port.name, port, name
        );
        let ig = self
            .cloud
            .set_named_ports(&ig, &ports)
            .await
            .map_err(|e| self.err("set named ports", name, e))?;
        Ok((ig, named_port))
    }

    /// Delete group `name`. NotFound is returned to the caller.
    pub async fn delete_instance_group(&self, name: &str) -> Result<()> {
        info!("Deleting instance group {} in {}", name, self.zone);
        self.cloud
            .delete_instance_group(name, &self.zone)
            .await
            .map_err(|e| self.err("delete", name, e))
    }

    /// Current members of group `name`
    pub async fn members(&self, name: &str) -> Result<BTreeSet<String>> {
        let members = self
            .cloud
            .list_instances(name, &self.zone)
            .await
            .map_err(|e| self.err("list instances", name, e))?;
        Ok(members.into_iter().collect())
    }

    /// Add `nodes` to group `name`, skipping those already members.
    pub async fn add(&self, name: &str, nodes: &[String]) -> Result<Vec<String>> {
        let current = self.members(name).await?;
        let missing: Vec<String> = nodes
            .iter()
            .filter(|n| !current.contains(*n))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        self.add_batch(name, &missing).await?;
        Ok(missing)
    }

    /// Remove `nodes` from group `name`, skipping those not members.
    pub async fn remove(&self, name: &str, nodes: &[String]) -> Result<Vec<String>> {
        let current = self.members(name).await?;
        let present: Vec<String> = nodes
            .iter()
            .filter(|n| current.contains(*n))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        self.remove_batch(name, &present).await?;
        Ok(present)
    }

    /// Make the cluster group's membership exactly `nodes`, with at most one
    /// add call and one remove call.
    pub async fn sync(&self, nodes: &BTreeSet<String>) -> Result<MembershipDelta> {
        let name = self.group_name();
        self.ensure_group(&name).await?;
        let current = self.members(&name).await?;
        let delta = membership_delta(&current, nodes);
        if delta.is_empty() {
            debug!("Instance group {} membership up to date", name);
            return Ok(delta);
        }
        self.add_batch(&name, &delta.added).await?;
        self.remove_batch(&name, &delta.removed).await?;
        Ok(delta)
    }

    async fn add_batch(&self, name: &str, nodes: &[String]) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        info!("Adding {:?} to instance group {}", nodes, name);
        self.cloud
            .add_instances(name, &self.zone, nodes)
            .await
            .map_err(|e| self.err("add instances", name, e))
    }

    async fn remove_batch(&self, name: &str, nodes: &[String]) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        info!("Removing {:?} from instance group {}", nodes, name);
        self.cloud
            .remove_instances(name, &self.zone, nodes)
            .await
            .map_err(|e| self.err("remove instances", name, e))
    }
}
