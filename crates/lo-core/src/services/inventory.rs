//! Host inventory: registration and bookkeeping of remote hosts. No remote calls.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::error::{OrchestratorError, Result};
use crate::models::{Host, HostCredential, HostId, NodeId, Topology};

/// Register a host, or return the existing id when the address is already known.
pub fn register_host(
    topology: &mut Topology,
    address: &str,
    credential: HostCredential,
    root_dir: &str,
    agency: &str,
) -> Result<HostId> {
    let address = address.trim();
    if address.is_empty() {
        return Err(OrchestratorError::Validation("host address is empty".into()));
    }
    if let Some(existing) = topology.host_by_address(address) {
        return Ok(existing.id);
    }
    let id = topology.next_host_id;
    topology.next_host_id += 1;
    topology.hosts.insert(
        id,
        Host::new(
            id,
            address.to_string(),
            credential,
            root_dir.to_string(),
            agency.to_string(),
        ),
    );
    tracing::info!(host_id = id, host = address, agency, "registered host");
    Ok(id)
}

pub fn list_hosts(topology: &Topology) -> Vec<Host> {
    topology.hosts.values().cloned().collect()
}

pub fn mark_unreachable(topology: &mut Topology, host_id: HostId) -> Result<()> {
    set_reachable(topology, host_id, false)
}

pub fn set_reachable(topology: &mut Topology, host_id: HostId, reachable: bool) -> Result<()> {
    let host = topology
        .hosts
        .get_mut(&host_id)
        .ok_or_else(|| OrchestratorError::HostNotFound(host_id.to_string()))?;
    if host.reachable != reachable {
        tracing::warn!(host = %host.address, reachable, "host reachability changed");
    }
    host.reachable = reachable;
    host.last_probed_at = Some(Utc::now());
    Ok(())
}

/// Remove a host record. Fails with `HostInUse` while live nodes reference it,
/// unless `cascade` is set, in which case those node records are retired too.
pub fn remove_host(topology: &mut Topology, host_id: HostId, cascade: bool) -> Result<Vec<NodeId>> {
    let host = topology.host(host_id)?;
    let referencing: Vec<NodeId> = topology
        .nodes_on_host(host_id)
        .into_iter()
        .map(|n| n.node_id.clone())
        .collect();

    if !referencing.is_empty() && !cascade {
        return Err(OrchestratorError::HostInUse {
            host: host.address.clone(),
            nodes: referencing.len(),
        });
    }
    for id in &referencing {
        topology.retire_node(id);
    }
    if let Some(host) = topology.hosts.remove(&host_id) {
        tracing::info!(host = %host.address, cascaded = referencing.len(), "removed host");
    }
    Ok(referencing)
}

/// Distinct agency tags with the number of hosts carrying each.
pub fn list_agencies(topology: &Topology) -> BTreeMap<String, usize> {
    let mut agencies = BTreeMap::new();
    for host in topology.hosts.values() {
        *agencies.entry(host.agency.clone()).or_insert(0) += 1;
    }
    agencies
}
