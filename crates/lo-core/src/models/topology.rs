use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::chain::Chain;
use super::host::{Host, HostId};
use super::node::{Node, NodeId};
use crate::error::{OrchestratorError, Result};

/// Persisted cluster model: every chain, host and node record the orchestrator owns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    #[serde(default)]
    pub chains: BTreeMap<String, Chain>,
    #[serde(default)]
    pub hosts: BTreeMap<HostId, Host>,
    #[serde(default)]
    pub nodes: BTreeMap<NodeId, Node>,
    /// Identities of deleted nodes; never handed out again.
    #[serde(default)]
    pub retired_node_ids: BTreeSet<NodeId>,
    #[serde(default)]
    pub next_host_id: HostId,
}

impl Topology {
    pub fn chain(&self, name: &str) -> Result<&Chain> {
        self.chains
            .get(name)
            .ok_or_else(|| OrchestratorError::ChainNotFound(name.to_string()))
    }

    pub fn chain_mut(&mut self, name: &str) -> Result<&mut Chain> {
        self.chains
            .get_mut(name)
            .ok_or_else(|| OrchestratorError::ChainNotFound(name.to_string()))
    }

    pub fn node(&self, id: &NodeId) -> Result<&Node> {
        self.nodes
            .get(id)
            .ok_or_else(|| OrchestratorError::NodeNotFound(id.to_string()))
    }

    pub fn node_mut(&mut self, id: &NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NodeNotFound(id.to_string()))
    }

    pub fn host(&self, id: HostId) -> Result<&Host> {
        self.hosts
            .get(&id)
            .ok_or_else(|| OrchestratorError::HostNotFound(id.to_string()))
    }

    pub fn host_by_address(&self, address: &str) -> Option<&Host> {
        self.hosts.values().find(|h| h.address == address)
    }

    /// Live nodes of a chain ordered by host then slot, the rollout order.
    pub fn nodes_of_chain(&self, chain: &str) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self
            .nodes
            .values()
            .filter(|n| n.chain_name == chain && n.status.is_live())
            .collect();
        nodes.sort_by_key(|n| (n.host_id, n.slot));
        nodes
    }

    pub fn nodes_on_host(&self, host_id: HostId) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|n| n.host_id == host_id && n.status.is_live())
            .collect()
    }

    pub fn is_known_node_id(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id) || self.retired_node_ids.contains(id)
    }

    /// Drop a node record, keeping its identity reserved.
    pub fn retire_node(&mut self, id: &NodeId) -> Option<Node> {
        let node = self.nodes.remove(id)?;
        self.retired_node_ids.insert(id.clone());
        Some(node)
    }
}
