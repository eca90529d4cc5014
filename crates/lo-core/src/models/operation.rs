use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::node::NodeId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    Deploy,
    AddNodes,
    Upgrade,
    StartChain,
    StopChain,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Deploy => "deploy",
            Self::AddNodes => "add-nodes",
            Self::Upgrade => "upgrade",
            Self::StartChain => "start-chain",
            Self::StopChain => "stop-chain",
        };
        f.write_str(label)
    }
}

/// Book-keeping for one chain-level long-running action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentOperation {
    pub chain_name: String,
    pub kind: OperationKind,
    pub started_at: DateTime<Utc>,
    pub total_units: u32,
    pub completed_units: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<OperationOutcome>,
    /// Process running the operation.
    #[serde(default)]
    pub owner_pid: u32,
}

impl DeploymentOperation {
    pub fn new(chain_name: String, kind: OperationKind, total_units: u32) -> Self {
        Self {
            chain_name,
            kind,
            started_at: Utc::now(),
            total_units,
            completed_units: 0,
            outcome: None,
            owner_pid: std::process::id(),
        }
    }

    pub fn percent(&self) -> u8 {
        if self.outcome.is_some() || self.total_units == 0 {
            return 100;
        }
        let done = self.completed_units.min(self.total_units) as u64;
        (done * 100 / self.total_units as u64) as u8
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum OperationOutcome {
    Succeeded,
    PartiallySucceeded,
    Halted,
    Failed,
}

/// What happened to one node during a fan-out operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum NodeOutcome {
    Succeeded,
    Failed { kind: String, message: String },
    NotAttempted,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResult {
    pub node_id: NodeId,
    pub host: String,
    pub slot: u16,
    pub outcome: NodeOutcome,
}

/// Itemized per-node result of a chain-level operation, enough to retry just the failed units.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationReport {
    pub chain_name: String,
    pub kind: OperationKind,
    pub results: Vec<NodeResult>,
    /// A sequential rollout stopped at a failure and awaits an operator.
    #[serde(default)]
    pub halted: bool,
}

impl OperationReport {
    pub fn new(chain_name: &str, kind: OperationKind) -> Self {
        Self {
            chain_name: chain_name.to_string(),
            kind,
            results: Vec::new(),
            halted: false,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, NodeOutcome::Succeeded))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, NodeOutcome::Failed { .. }))
    }

    pub fn not_attempted(&self) -> usize {
        self.count(|o| matches!(o, NodeOutcome::NotAttempted))
    }

    pub fn outcome(&self) -> OperationOutcome {
        if self.halted {
            OperationOutcome::Halted
        } else if self.failed() == 0 && self.not_attempted() == 0 {
            OperationOutcome::Succeeded
        } else if self.succeeded() == 0 {
            OperationOutcome::Failed
        } else {
            OperationOutcome::PartiallySucceeded
        }
    }

    pub fn failed_nodes(&self) -> impl Iterator<Item = &NodeResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, NodeOutcome::Failed { .. }))
    }

    fn count(&self, pred: impl Fn(&NodeOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }
}
