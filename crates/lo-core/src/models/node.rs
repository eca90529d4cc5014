use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::host::HostId;

pub type GroupId = u32;

/// Immutable node identity, assigned once by the allocator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Length in hex characters of every generated identity.
    pub const LEN: usize = 64;

    pub fn generate() -> Self {
        let high = uuid::Uuid::new_v4().simple().to_string();
        let low = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{high}{low}"))
    }

    /// Accept an identity read back from storage or a node layout.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.len() == Self::LEN && raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self(raw.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum NodeStatus {
    Pending,
    Installed,
    Running,
    Stopped,
    Deleted,
}

impl NodeStatus {
    pub fn is_live(self) -> bool {
        self != NodeStatus::Deleted
    }

    pub fn can_transition_to(self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        matches!(
            (self, next),
            (Pending, Installed)
                | (Installed, Running)
                | (Running, Stopped)
                | (Stopped, Running)
                | (Pending | Installed | Stopped, Deleted)
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "PENDING",
            Self::Installed => "INSTALLED",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Deleted => "DELETED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct PortTriple {
    pub jsonrpc: u16,
    pub channel: u16,
    pub p2p: u16,
}

impl PortTriple {
    pub fn as_array(&self) -> [u16; 3] {
        [self.jsonrpc, self.channel, self.p2p]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub node_id: NodeId,
    pub chain_name: String,
    pub host_id: HostId,
    pub slot: u16,
    pub ports: PortTriple,
    pub group_ids: BTreeSet<GroupId>,
    pub status: NodeStatus,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    pub fn dir_name(&self) -> String {
        format!("node{}", self.slot)
    }
}
