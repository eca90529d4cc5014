use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::inventory;
use super::lifecycle::ChainManager;
use super::node_config::NodeConfig;
use super::remote::{parse_group_list, RemoteCommand};
use crate::error::{OrchestratorError, Result};
use crate::models::{ChainStatus, GroupId, Host, Node, NodeStatus};

/// What one reconciliation pass over a chain saw and changed.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    pub chain_name: String,
    /// Another pass was already running, or the chain is not `RUNNING`.
    pub skipped: bool,
    pub hosts_probed: usize,
    pub hosts_unreachable: usize,
    pub nodes_checked: usize,
    pub nodes_updated: usize,
    pub layout_errors: usize,
}

/// Corrects recorded group membership and host reachability from live state.
/// Never changes chain or node lifecycle status.
#[derive(Clone)]
pub struct Reconciler {
    manager: ChainManager,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

struct FlightGuard {
    chain_name: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.chain_name);
    }
}

impl Reconciler {
    pub fn new(manager: ChainManager) -> Self {
        Self {
            manager,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn claim(&self, chain_name: &str) -> Option<FlightGuard> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(chain_name.to_string()) {
            return None;
        }
        Some(FlightGuard {
            chain_name: chain_name.to_string(),
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    pub async fn run_once(&self, chain_name: &str) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary {
            chain_name: chain_name.to_string(),
            ..ReconcileSummary::default()
        };
        let Some(_flight) = self.claim(chain_name) else {
            tracing::debug!(chain = chain_name, "reconcile already running, skipped");
            summary.skipped = true;
            return Ok(summary);
        };

        self.manager.load_state().await?;
        let topology = self.manager.snapshot().await;
        if topology.chain(chain_name)?.status != ChainStatus::Running {
            summary.skipped = true;
            return Ok(summary);
        }
        let nodes = topology.nodes_of_chain(chain_name);

        let host_ids: BTreeSet<_> = nodes.iter().map(|n| n.host_id).collect();
        let mut reachable = HashSet::new();
        for host_id in host_ids {
            let host = topology.host(host_id)?;
            let up = self.manager.executor().probe(host).await;
            self.manager
                .commit(|t| inventory::set_reachable(t, host_id, up))
                .await?;
            summary.hosts_probed += 1;
            if up {
                reachable.insert(host_id);
            } else {
                summary.hosts_unreachable += 1;
            }
        }

        for node in nodes
            .into_iter()
            .filter(|n| n.status == NodeStatus::Running && reachable.contains(&n.host_id))
        {
            let host = topology.host(node.host_id)?;
            summary.nodes_checked += 1;

            let staged = self.manager.generator().staged_node_dir(host, node);
            if let Err(err) = NodeConfig::read(&staged) {
                tracing::warn!(chain = chain_name, node_id = %node.node_id.short(), error = %err, "staged layout unreadable");
                summary.layout_errors += 1;
            }

            let live = match self.live_groups(host, node).await {
                Ok(live) => live,
                Err(err) => {
                    tracing::warn!(chain = chain_name, host = %host.address, node_id = %node.node_id.short(), error = %err, "group query failed");
                    continue;
                }
            };
            if live == node.group_ids {
                continue;
            }

            let recorded = &node.group_ids;
            let updated = self
                .manager
                .commit(|t| {
                    let Ok(current) = t.node_mut(&node.node_id) else {
                        return Ok(false);
                    };
                    // Someone else changed it since the snapshot; leave it for the next pass.
                    if &current.group_ids != recorded {
                        return Ok(false);
                    }
                    current.group_ids = live.clone();
                    current.updated_at = Utc::now();
                    Ok(true)
                })
                .await?;
            if updated {
                tracing::info!(
                    chain = chain_name,
                    node_id = %node.node_id.short(),
                    recorded = ?recorded,
                    live = ?live,
                    "group membership corrected"
                );
                summary.nodes_updated += 1;
            }
        }
        Ok(summary)
    }

    /// One pass over every `RUNNING` chain. Failures are logged per chain.
    pub async fn run_all(&self) -> Vec<ReconcileSummary> {
        // Other processes may have deployed or removed chains since the last pass.
        if let Err(err) = self.manager.load_state().await {
            tracing::warn!(error = %err, "could not reload topology, skipping pass");
            return Vec::new();
        }
        let chains: Vec<String> = self
            .manager
            .snapshot()
            .await
            .chains
            .values()
            .filter(|c| c.status == ChainStatus::Running)
            .map(|c| c.name.clone())
            .collect();
        let mut summaries = Vec::with_capacity(chains.len());
        for chain in chains {
            match self.run_once(&chain).await {
                Ok(summary) => summaries.push(summary),
                Err(err) => tracing::warn!(%chain, error = %err, "reconcile failed"),
            }
        }
        summaries
    }

    /// Run [`Self::run_all`] every `period` until `cancel` fires.
    pub fn spawn(self, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let summaries = self.run_all().await;
                        tracing::debug!(chains = summaries.len(), "reconcile tick");
                    }
                }
            }
            tracing::info!("reconciler stopped");
        })
    }

    async fn live_groups(&self, host: &Host, node: &Node) -> Result<BTreeSet<GroupId>> {
        let output = self
            .manager
            .executor()
            .run(
                host,
                &RemoteCommand::QueryGroups {
                    jsonrpc_port: node.ports.jsonrpc,
                },
            )
            .await?;
        parse_group_list(&output.stdout)
            .map(|groups| groups.into_iter().collect())
            .map_err(|e| OrchestratorError::RemoteExec {
                host: host.address.clone(),
                reason: e.to_string(),
            })
    }
}
