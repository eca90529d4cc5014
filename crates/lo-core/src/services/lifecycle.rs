//! Chain and node lifecycle: the single write path into the topology.
//!
//! Every mutation goes through [`ChainManager::commit`], which takes the store
//! lock, re-reads the persisted topology, applies the change to it, persists it,
//! and only then publishes it. Other `lo` processes sharing the state directory
//! therefore never lose each other's writes. Remote calls never run while the
//! topology lock is held.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, LazyLock, Mutex};

use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use tokio::sync::{OwnedMutexGuard, RwLock};

use super::allocator::{Allocation, PortAllocator};
use super::executor::{fan_out_by_host, DeploymentExecutor, NodeAction, RetryPolicy};
use super::inventory;
use super::ipconf::{self, HostSpec};
use super::node_config::{ConfigGenerator, NodeConfig};
use super::progress::ProgressTracker;
use super::remote::{RemoteCommand, RemoteExecutor};
use super::state::TopologyStore;
use crate::error::{OrchestratorError, Result};
use crate::models::{
    Chain, ChainStatus, EncryptType, GroupId, Host, HostCredential, HostId, ImageType, Node,
    NodeId, NodeOutcome, NodeResult, NodeStatus, OperationKind, OperationOutcome,
    OperationReport, OrchestratorConfig, Topology,
};

static CHAIN_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").unwrap());

/// Parameters of a chain deployment. Unset optionals fall back to the config.
#[derive(Debug, Clone, Default)]
pub struct DeployRequest {
    pub chain_name: String,
    /// `IP:COUNT AGENCY GROUPS` entries.
    pub host_list: Vec<String>,
    pub version: String,
    pub sign_service_address: Option<String>,
    pub root_dir: Option<String>,
    pub image_type: Option<ImageType>,
    pub encrypt_type: Option<EncryptType>,
}

impl DeployRequest {
    fn validate(&self) -> Result<Vec<HostSpec>> {
        if !CHAIN_NAME_RE.is_match(&self.chain_name) {
            return Err(OrchestratorError::Validation(format!(
                "invalid chain name '{}'",
                self.chain_name
            )));
        }
        validate_version(&self.version)?;
        ipconf::parse(&self.host_list)
    }
}

/// A chain record together with its live nodes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainDetail {
    #[serde(flatten)]
    pub chain: Chain,
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDeletion {
    pub node_id: NodeId,
    pub host_removed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agency_removed: Option<String>,
}

type NodeLocks = Mutex<HashMap<NodeId, Arc<tokio::sync::Mutex<()>>>>;

/// Owns the topology and drives every lifecycle transition.
#[derive(Clone)]
pub struct ChainManager {
    config: Arc<OrchestratorConfig>,
    topology: Arc<RwLock<Topology>>,
    store: Arc<TopologyStore>,
    executor: Arc<DeploymentExecutor>,
    generator: Arc<ConfigGenerator>,
    allocator: Arc<PortAllocator>,
    progress: Arc<ProgressTracker>,
    node_locks: Arc<NodeLocks>,
}

impl ChainManager {
    /// `base_dir` anchors the relative staging and state directories of `config`.
    pub fn new(config: OrchestratorConfig, base_dir: &Path, remote: Arc<dyn RemoteExecutor>) -> Self {
        let executor = DeploymentExecutor::new(
            remote,
            RetryPolicy::from(&config.retry),
            config.action_timeout(),
            config.docker_image.clone(),
        );
        let state_dir = base_dir.join(&config.state_dir);
        Self {
            store: Arc::new(TopologyStore::new(&state_dir)),
            progress: Arc::new(ProgressTracker::new(state_dir.join("operations"))),
            generator: Arc::new(ConfigGenerator::new(base_dir.join(&config.staging_dir))),
            allocator: Arc::new(PortAllocator::new(config.ports.clone())),
            executor: Arc::new(executor),
            topology: Arc::new(RwLock::new(Topology::default())),
            node_locks: Arc::new(Mutex::new(HashMap::new())),
            config: Arc::new(config),
        }
    }

    /// Replace the in-memory topology with the persisted one.
    pub async fn load_state(&self) -> Result<()> {
        let loaded = self.store.load().await?;
        tracing::debug!(
            chains = loaded.chains.len(),
            hosts = loaded.hosts.len(),
            nodes = loaded.nodes.len(),
            "loaded topology"
        );
        *self.topology.write().await = loaded;
        Ok(())
    }

    pub async fn snapshot(&self) -> Topology {
        self.topology.read().await.clone()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub(crate) fn executor(&self) -> &DeploymentExecutor {
        &self.executor
    }

    pub(crate) fn generator(&self) -> &ConfigGenerator {
        &self.generator
    }

    /// Apply `change` to the latest persisted topology, persist it, then make it
    /// current. A failed change or save leaves the persisted topology untouched.
    pub(crate) async fn commit<R>(
        &self,
        change: impl FnOnce(&mut Topology) -> Result<R>,
    ) -> Result<R> {
        let mut topology = self.topology.write().await;
        let _store_lock = self.store.lock().await?;
        let latest = self.store.load().await?;
        let mut draft = latest.clone();
        let out = match change(&mut draft) {
            Ok(out) => out,
            Err(err) => {
                *topology = latest;
                return Err(err);
            }
        };
        self.store.save(&draft).await?;
        *topology = draft;
        Ok(out)
    }

    pub async fn get_chain(&self, name: &str) -> Result<ChainDetail> {
        let topology = self.topology.read().await;
        let chain = topology.chain(name)?.clone();
        let nodes = topology.nodes_of_chain(name).into_iter().cloned().collect();
        Ok(ChainDetail { chain, nodes })
    }

    pub async fn list_hosts(&self) -> Vec<Host> {
        inventory::list_hosts(&*self.topology.read().await)
    }

    pub async fn list_agencies(&self) -> BTreeMap<String, usize> {
        inventory::list_agencies(&*self.topology.read().await)
    }

    /// Percent complete of the chain's in-flight operation; 100 when idle.
    pub fn progress(&self, chain_name: &str) -> u8 {
        self.progress.progress(chain_name)
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn deploy_type(&self) -> &'static str {
        self.executor.mode()
    }

    pub async fn register_host(&self, address: &str, agency: &str, root_dir: Option<&str>) -> Result<HostId> {
        let root_dir = root_dir.unwrap_or(&self.config.root_dir_on_host);
        let credential = self.credential();
        self.commit(|topology| inventory::register_host(topology, address, credential, root_dir, agency))
            .await
    }

    /// Flag a host as unreachable; the next reconciliation pass may clear it.
    pub async fn mark_unreachable(&self, host_id: HostId) -> Result<()> {
        self.commit(|topology| inventory::mark_unreachable(topology, host_id))
            .await
    }

    pub async fn remove_host(&self, host_id: HostId, cascade: bool) -> Result<Vec<NodeId>> {
        self.commit(|topology| inventory::remove_host(topology, host_id, cascade))
            .await
    }

    /// Allocate, publish, install and start every node of a new chain.
    ///
    /// Best effort across nodes: the chain ends `RUNNING` when at least one node
    /// runs, and `STOPPED` with [`OrchestratorError::DeploymentFailed`] otherwise.
    pub async fn deploy_chain(&self, request: DeployRequest) -> Result<OperationReport> {
        let specs = request.validate()?;
        let name = request.chain_name.clone();
        if self.topology.read().await.chains.contains_key(&name) {
            return Err(OrchestratorError::ChainAlreadyExists(name));
        }
        let total = specs.iter().map(|s| u32::from(s.node_count)).sum();

        self.tracked(&name, OperationKind::Deploy, total, async {
            let (chain, planned) = self
                .commit(|topology| {
                    if topology.chains.contains_key(&name) {
                        return Err(OrchestratorError::ChainAlreadyExists(name.clone()));
                    }
                    let mut chain = Chain::new(
                        name.clone(),
                        self.config.chain_id,
                        request.encrypt_type.unwrap_or(self.config.encrypt_type),
                        request.version.trim().to_string(),
                        request
                            .root_dir
                            .clone()
                            .unwrap_or_else(|| self.config.root_dir_on_host.clone()),
                        request
                            .sign_service_address
                            .clone()
                            .unwrap_or_else(|| self.config.sign_service_address.clone()),
                        request.image_type.unwrap_or(self.config.image_type),
                    );
                    transition_chain(&mut chain, ChainStatus::Deploying)?;
                    topology.chains.insert(name.clone(), chain.clone());
                    let planned = self.allocate_nodes(topology, &chain, &specs)?;
                    Ok((chain, planned))
                })
                .await?;
            tracing::info!(chain = %name, nodes = planned.len(), "deploying chain");

            let report = self
                .provision(&chain, planned, OperationKind::Deploy, true)
                .await?;

            let reached_running = report.succeeded() > 0;
            self.commit(|topology| {
                let chain = topology.chain_mut(&name)?;
                let next = if reached_running {
                    ChainStatus::Running
                } else {
                    ChainStatus::Stopped
                };
                transition_chain(chain, next)
            })
            .await?;

            if !reached_running {
                return Err(OrchestratorError::DeploymentFailed {
                    chain: name.clone(),
                    operation: OperationKind::Deploy.to_string(),
                });
            }
            Ok(report)
        })
        .await
    }

    /// Allocate and install extra nodes; they stay `INSTALLED` until started.
    pub async fn add_nodes(&self, chain_name: &str, host_list: &[String]) -> Result<OperationReport> {
        let specs = ipconf::parse(host_list)?;
        self.topology.read().await.chain(chain_name)?;
        let total = specs.iter().map(|s| u32::from(s.node_count)).sum();

        self.tracked(chain_name, OperationKind::AddNodes, total, async {
            let (chain, planned) = self
                .commit(|topology| {
                    let chain = topology.chain(chain_name)?.clone();
                    if !matches!(chain.status, ChainStatus::Running | ChainStatus::Stopped) {
                        return Err(OrchestratorError::status_conflict(
                            format!("chain {chain_name}"),
                            "RUNNING or STOPPED",
                            chain.status,
                        ));
                    }
                    let planned = self.allocate_nodes(topology, &chain, &specs)?;
                    Ok((chain, planned))
                })
                .await?;

            let report = self
                .provision(&chain, planned, OperationKind::AddNodes, false)
                .await?;
            if report.succeeded() == 0 {
                return Err(OrchestratorError::DeploymentFailed {
                    chain: chain_name.to_string(),
                    operation: OperationKind::AddNodes.to_string(),
                });
            }
            Ok(report)
        })
        .await
    }

    /// Roll `version` out node by node: stop, upgrade, restart.
    ///
    /// The rollout halts at the first failure and leaves the chain `UPGRADING`;
    /// calling again with the same version resumes, skipping upgraded nodes.
    pub async fn upgrade_chain(&self, chain_name: &str, version: &str) -> Result<OperationReport> {
        let version = version.trim();
        validate_version(version)?;
        let total = {
            let topology = self.topology.read().await;
            topology.chain(chain_name)?;
            topology.nodes_of_chain(chain_name).len() as u32
        };

        self.tracked(chain_name, OperationKind::Upgrade, total, async {
            let (chain, targets) = self
                .commit(|topology| {
                    let chain = topology.chain_mut(chain_name)?;
                    match (chain.status, chain.upgrade_target.as_deref()) {
                        (ChainStatus::Upgrading, Some(target)) if target == version => {
                            tracing::info!(chain = chain_name, version, "resuming upgrade");
                        }
                        (ChainStatus::Upgrading, target) => {
                            return Err(OrchestratorError::status_conflict(
                                format!("chain {chain_name}"),
                                format!("UPGRADING to {version}"),
                                format!("UPGRADING to {}", target.unwrap_or("?")),
                            ));
                        }
                        (ChainStatus::Running, _) if chain.version == version => {
                            return Err(OrchestratorError::Validation(format!(
                                "chain '{chain_name}' already runs {version}"
                            )));
                        }
                        _ => {
                            transition_chain(chain, ChainStatus::Upgrading)?;
                            chain.upgrade_target = Some(version.to_string());
                        }
                    }
                    let chain = chain.clone();
                    let view: &Topology = topology;
                    let targets = with_hosts(view, view.nodes_of_chain(chain_name))?;
                    Ok((chain, targets))
                })
                .await?;

            let mut report = OperationReport::new(chain_name, OperationKind::Upgrade);
            let mut halted = false;
            for (node, host) in targets {
                let outcome = if halted {
                    NodeOutcome::NotAttempted
                } else if node.version == version || node.status == NodeStatus::Pending {
                    // Pending nodes pick up the target version when installed.
                    NodeOutcome::Skipped
                } else {
                    match self.upgrade_node(&chain, &host, &node).await {
                        Ok(()) => NodeOutcome::Succeeded,
                        Err(err) => {
                            tracing::warn!(
                                chain = chain_name,
                                host = %host.address,
                                node_id = %node.node_id.short(),
                                error = %err,
                                "upgrade halted"
                            );
                            halted = true;
                            failure(&err)
                        }
                    }
                };
                if outcome != NodeOutcome::NotAttempted {
                    self.progress.complete_unit(chain_name);
                }
                report.results.push(node_result(&node, &host, outcome));
            }

            report.halted = halted;
            if halted {
                if report.succeeded() == 0 {
                    return Err(OrchestratorError::DeploymentFailed {
                        chain: chain_name.to_string(),
                        operation: OperationKind::Upgrade.to_string(),
                    });
                }
                return Ok(report);
            }

            self.commit(|topology| {
                let chain = topology.chain_mut(chain_name)?;
                transition_chain(chain, ChainStatus::Running)?;
                chain.version = version.to_string();
                chain.upgrade_target = None;
                Ok(())
            })
            .await?;
            tracing::info!(chain = chain_name, version, "upgrade complete");
            Ok(report)
        })
        .await
    }

    /// Start every installed or stopped node of the chain.
    pub async fn start_chain(&self, chain_name: &str) -> Result<OperationReport> {
        let (chain, targets) = {
            let topology = self.topology.read().await;
            let chain = topology.chain(chain_name)?.clone();
            if !matches!(chain.status, ChainStatus::Running | ChainStatus::Stopped) {
                return Err(OrchestratorError::status_conflict(
                    format!("chain {chain_name}"),
                    "RUNNING or STOPPED",
                    chain.status,
                ));
            }
            let nodes = topology
                .nodes_of_chain(chain_name)
                .into_iter()
                .filter(|n| matches!(n.status, NodeStatus::Installed | NodeStatus::Stopped))
                .collect();
            (chain, with_hosts(&topology, nodes)?)
        };
        let total = targets.len() as u32;

        self.tracked(chain_name, OperationKind::StartChain, total, async {
            let report = self
                .fan_out_action(&chain, targets, OperationKind::StartChain, NodeAction::Start, NodeStatus::Running)
                .await;
            self.commit(|topology| {
                let running = count_running(topology, chain_name);
                let chain = topology.chain_mut(chain_name)?;
                if running > 0 && chain.status == ChainStatus::Stopped {
                    transition_chain(chain, ChainStatus::Running)?;
                }
                Ok(())
            })
            .await?;
            if total > 0 && report.succeeded() == 0 {
                return Err(OrchestratorError::DeploymentFailed {
                    chain: chain_name.to_string(),
                    operation: OperationKind::StartChain.to_string(),
                });
            }
            Ok(report)
        })
        .await
    }

    /// Stop every running node of the chain.
    pub async fn stop_chain(&self, chain_name: &str) -> Result<OperationReport> {
        let (chain, targets) = {
            let topology = self.topology.read().await;
            let chain = topology.chain(chain_name)?.clone();
            if chain.status != ChainStatus::Running {
                return Err(OrchestratorError::status_conflict(
                    format!("chain {chain_name}"),
                    ChainStatus::Running,
                    chain.status,
                ));
            }
            let nodes = topology
                .nodes_of_chain(chain_name)
                .into_iter()
                .filter(|n| n.status == NodeStatus::Running)
                .collect();
            (chain, with_hosts(&topology, nodes)?)
        };
        let total = targets.len() as u32;

        self.tracked(chain_name, OperationKind::StopChain, total, async {
            let report = self
                .fan_out_action(&chain, targets, OperationKind::StopChain, NodeAction::Stop, NodeStatus::Stopped)
                .await;
            self.commit(|topology| {
                let running = count_running(topology, chain_name);
                let chain = topology.chain_mut(chain_name)?;
                if running == 0 && chain.status == ChainStatus::Running {
                    transition_chain(chain, ChainStatus::Stopped)?;
                }
                Ok(())
            })
            .await?;
            if total > 0 && report.succeeded() == 0 {
                return Err(OrchestratorError::DeploymentFailed {
                    chain: chain_name.to_string(),
                    operation: OperationKind::StopChain.to_string(),
                });
            }
            Ok(report)
        })
        .await
    }

    /// Remove a chain whose nodes are all deleted. Fails with
    /// [`OrchestratorError::ChainHasLiveNodes`] before touching anything otherwise.
    pub async fn delete_chain(&self, chain_name: &str) -> Result<()> {
        if let Some(op) = self.progress.current(chain_name) {
            return Err(OrchestratorError::status_conflict(
                format!("chain {chain_name}"),
                "no operation in flight",
                format!("{} in flight", op.kind),
            ));
        }
        let (chain, hosts) = self
            .commit(|topology| {
                let live = topology.nodes_of_chain(chain_name).len();
                if live > 0 {
                    return Err(OrchestratorError::ChainHasLiveNodes {
                        chain: chain_name.to_string(),
                        nodes: live,
                    });
                }
                let hosts: Vec<Host> = topology.hosts.values().cloned().collect();
                let chain = topology.chain_mut(chain_name)?;
                if chain.status != ChainStatus::Deleting {
                    transition_chain(chain, ChainStatus::Deleting)?;
                }
                Ok((chain.clone(), hosts))
            })
            .await?;

        for host in hosts.iter().filter(|h| h.reachable) {
            let command = RemoteCommand::RemoveChainDir {
                chain_dir: chain.chain_dir_on(&host.root_dir),
            };
            self.executor.run(host, &command).await?;
        }
        for host in hosts.iter().filter(|h| !h.reachable) {
            tracing::warn!(chain = chain_name, host = %host.address, "skipping unreachable host during chain removal");
        }
        remove_dir_if_present(&self.generator.staged_chain_dir(chain_name)).await?;

        self.commit(|topology| {
            let chain = topology.chain_mut(chain_name)?;
            transition_chain(chain, ChainStatus::Deleted)?;
            topology.chains.remove(chain_name);
            Ok(())
        })
        .await?;
        tracing::info!(chain = chain_name, "chain deleted");
        Ok(())
    }

    /// Start a node whose status must still be `expected`.
    pub async fn start_node(&self, node_id: &NodeId, expected: NodeStatus) -> Result<Node> {
        let _guard = self.lock_node(node_id)?;
        let (chain, host, node) = self.node_context(node_id).await?;
        if node.status != expected {
            return Err(OrchestratorError::status_conflict(
                node_target(node_id),
                expected,
                node.status,
            ));
        }
        if !node.status.can_transition_to(NodeStatus::Running) {
            return Err(OrchestratorError::status_conflict(
                node_target(node_id),
                "INSTALLED or STOPPED",
                node.status,
            ));
        }
        if !matches!(
            chain.status,
            ChainStatus::Running | ChainStatus::Stopped | ChainStatus::Upgrading
        ) {
            return Err(OrchestratorError::status_conflict(
                format!("chain {}", chain.name),
                "RUNNING or STOPPED",
                chain.status,
            ));
        }

        self.executor
            .execute(NodeAction::Start, &chain, &host, &node)
            .await?;
        self.commit(|topology| {
            let node = topology.node_mut(node_id)?;
            transition_node(node, NodeStatus::Running)?;
            let node = node.clone();
            let chain = topology.chain_mut(&node.chain_name)?;
            if chain.status == ChainStatus::Stopped {
                transition_chain(chain, ChainStatus::Running)?;
            }
            Ok(node)
        })
        .await
    }

    pub async fn stop_node(&self, node_id: &NodeId) -> Result<Node> {
        let _guard = self.lock_node(node_id)?;
        let (chain, host, node) = self.node_context(node_id).await?;
        if node.status != NodeStatus::Running {
            return Err(OrchestratorError::status_conflict(
                node_target(node_id),
                NodeStatus::Running,
                node.status,
            ));
        }

        self.executor
            .execute(NodeAction::Stop, &chain, &host, &node)
            .await?;
        self.commit(|topology| {
            let node = topology.node_mut(node_id)?;
            transition_node(node, NodeStatus::Stopped)?;
            let node = node.clone();
            let running = count_running(topology, &node.chain_name);
            let chain = topology.chain_mut(&node.chain_name)?;
            if running == 0 && chain.status == ChainStatus::Running {
                transition_chain(chain, ChainStatus::Stopped)?;
            }
            Ok(node)
        })
        .await
    }

    /// Publish and install a node left `PENDING` by a failed deploy or add.
    pub async fn install_node(&self, node_id: &NodeId) -> Result<Node> {
        let _guard = self.lock_node(node_id)?;
        let (chain, host, node) = self.node_context(node_id).await?;
        if node.status != NodeStatus::Pending {
            return Err(OrchestratorError::status_conflict(
                node_target(node_id),
                NodeStatus::Pending,
                node.status,
            ));
        }
        let target = chain
            .upgrade_target
            .clone()
            .unwrap_or_else(|| chain.version.clone());
        let node = if node.version == target {
            node
        } else {
            self.commit(|topology| {
                let node = topology.node_mut(node_id)?;
                node.version = target;
                node.updated_at = Utc::now();
                Ok(node.clone())
            })
            .await?
        };
        self.publish_chain_material(&chain, &host).await?;
        self.install(&chain, &host, &node, false).await?;
        self.node_context(node_id).await.map(|(_, _, node)| node)
    }

    /// Remove a node that is not running, then drop its record. Optionally drops
    /// the host once orphaned, and reports the agency as gone when no host carries it.
    pub async fn delete_node(
        &self,
        node_id: &NodeId,
        delete_host: bool,
        delete_agency: bool,
    ) -> Result<NodeDeletion> {
        let guard = self.lock_node(node_id)?;
        let (chain, host, node) = self.node_context(node_id).await?;
        if !node.status.can_transition_to(NodeStatus::Deleted) {
            return Err(OrchestratorError::status_conflict(
                node_target(node_id),
                NodeStatus::Stopped,
                node.status,
            ));
        }

        self.executor
            .execute(NodeAction::Remove, &chain, &host, &node)
            .await?;
        remove_dir_if_present(&self.generator.staged_node_dir(&host, &node)).await?;

        let deletion = self
            .commit(|topology| {
                transition_node(topology.node_mut(node_id)?, NodeStatus::Deleted)?;
                topology.retire_node(node_id);

                let mut host_removed = false;
                if delete_host && topology.nodes_on_host(host.id).is_empty() {
                    inventory::remove_host(topology, host.id, false)?;
                    host_removed = true;
                }
                let agency_removed = (delete_agency
                    && !topology.hosts.values().any(|h| h.agency == host.agency))
                .then(|| host.agency.clone());
                Ok(NodeDeletion {
                    node_id: node_id.clone(),
                    host_removed,
                    agency_removed,
                })
            })
            .await?;
        drop(guard);
        self.node_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(node_id);
        tracing::info!(
            chain = %chain.name,
            node_id = %node_id.short(),
            host_removed = deletion.host_removed,
            "node deleted"
        );
        Ok(deletion)
    }

    async fn tracked<F>(&self, chain_name: &str, kind: OperationKind, total: u32, work: F) -> Result<OperationReport>
    where
        F: Future<Output = Result<OperationReport>>,
    {
        self.progress.begin(chain_name, kind, total)?;
        let result = work.await;
        let outcome = match &result {
            Ok(report) => report.outcome(),
            Err(_) => OperationOutcome::Failed,
        };
        self.progress.finish(chain_name, outcome);
        result
    }

    fn credential(&self) -> HostCredential {
        HostCredential {
            user: self.config.ssh.user.clone(),
            port: self.config.ssh.port,
            identity_file: self.config.ssh.identity_file.clone(),
        }
    }

    /// Register hosts and insert `PENDING` node records for every host spec.
    fn allocate_nodes(&self, topology: &mut Topology, chain: &Chain, specs: &[HostSpec]) -> Result<Vec<(Node, Host)>> {
        let mut planned = Vec::new();
        for spec in specs {
            let host_id = inventory::register_host(
                topology,
                &spec.address,
                self.credential(),
                &chain.root_dir,
                &spec.agency,
            )?;
            let host = topology.host(host_id)?.clone();
            for _ in 0..spec.node_count {
                let allocation = {
                    let existing = topology.nodes_on_host(host_id);
                    self.allocator
                        .allocate(&host, &existing, |id| topology.is_known_node_id(id))?
                };
                let now = Utc::now();
                let node = Node {
                    node_id: allocation.node_id,
                    chain_name: chain.name.clone(),
                    host_id,
                    slot: allocation.slot,
                    ports: allocation.ports,
                    group_ids: spec.group_ids.clone(),
                    status: NodeStatus::Pending,
                    version: chain.version.clone(),
                    created_at: now,
                    updated_at: now,
                };
                topology.nodes.insert(node.node_id.clone(), node.clone());
                planned.push((node, host.clone()));
            }
        }
        Ok(planned)
    }

    /// Publish, install and optionally start every planned node, hosts in
    /// parallel. Shared chain material is republished ahead of each node.
    async fn provision(
        &self,
        chain: &Chain,
        planned: Vec<(Node, Host)>,
        kind: OperationKind,
        start: bool,
    ) -> Result<OperationReport> {
        let group_ids = self.chain_groups(&chain.name).await;
        self.generator.generate_chain_material(chain, &group_ids)?;

        let manager = self.clone();
        let shared_chain = Arc::new(chain.clone());
        let results = fan_out_by_host(batches_by_host(planned), move |(node, host): (Node, Host)| {
            let manager = manager.clone();
            let chain = Arc::clone(&shared_chain);
            async move {
                let outcome = match manager.provision_node(&chain, &host, &node, start).await {
                    Ok(()) => NodeOutcome::Succeeded,
                    Err(err) => {
                        tracing::warn!(
                            chain = %chain.name,
                            host = %host.address,
                            node_id = %node.node_id.short(),
                            error = %err,
                            "node provisioning failed"
                        );
                        failure(&err)
                    }
                };
                manager.progress.complete_unit(&chain.name);
                node_result(&node, &host, outcome)
            }
        })
        .await;

        let mut report = OperationReport::new(&chain.name, kind);
        report.results = results;
        sort_results(&mut report.results);
        tracing::info!(
            chain = %chain.name,
            %kind,
            succeeded = report.succeeded(),
            failed = report.failed(),
            "provisioning finished"
        );
        Ok(report)
    }

    async fn provision_node(&self, chain: &Chain, host: &Host, node: &Node, start: bool) -> Result<()> {
        let _guard = self.lock_node(&node.node_id)?;
        self.publish_chain_material(chain, host).await?;
        self.install(chain, host, node, start).await
    }

    async fn publish_chain_material(&self, chain: &Chain, host: &Host) -> Result<()> {
        let group_ids = self.chain_groups(&chain.name).await;
        let material = self.generator.generate_chain_material(chain, &group_ids)?;
        self.generator.publish(&self.executor, host, &material).await
    }

    async fn install(&self, chain: &Chain, host: &Host, node: &Node, start: bool) -> Result<()> {
        let artifact = self
            .generator
            .generate(chain, &Allocation::of(node), &node.group_ids)?;
        self.generator.publish(&self.executor, host, &artifact).await?;
        self.executor
            .execute(NodeAction::Install, chain, host, node)
            .await?;
        let node = self.set_node_status(&node.node_id, NodeStatus::Installed).await?;
        if start {
            self.executor
                .execute(NodeAction::Start, chain, host, &node)
                .await?;
            self.set_node_status(&node.node_id, NodeStatus::Running).await?;
        }
        Ok(())
    }

    async fn fan_out_action(
        &self,
        chain: &Chain,
        targets: Vec<(Node, Host)>,
        kind: OperationKind,
        action: NodeAction,
        next: NodeStatus,
    ) -> OperationReport {
        let manager = self.clone();
        let shared_chain = Arc::new(chain.clone());
        let results = fan_out_by_host(batches_by_host(targets), move |(node, host): (Node, Host)| {
            let manager = manager.clone();
            let chain = Arc::clone(&shared_chain);
            async move {
                let outcome = match manager.apply_action(&chain, &host, &node, action, next).await {
                    Ok(()) => NodeOutcome::Succeeded,
                    Err(err) => {
                        tracing::warn!(
                            chain = %chain.name,
                            host = %host.address,
                            node_id = %node.node_id.short(),
                            %action,
                            error = %err,
                            "node action failed"
                        );
                        failure(&err)
                    }
                };
                manager.progress.complete_unit(&chain.name);
                node_result(&node, &host, outcome)
            }
        })
        .await;
        let mut report = OperationReport::new(&chain.name, kind);
        report.results = results;
        sort_results(&mut report.results);
        report
    }

    async fn apply_action(&self, chain: &Chain, host: &Host, node: &Node, action: NodeAction, next: NodeStatus) -> Result<()> {
        let _guard = self.lock_node(&node.node_id)?;
        self.executor.execute(action, chain, host, node).await?;
        self.set_node_status(&node.node_id, next).await?;
        Ok(())
    }

    async fn upgrade_node(&self, chain: &Chain, host: &Host, node: &Node) -> Result<()> {
        let _guard = self.lock_node(&node.node_id)?;
        self.verify_staged_layout(host, node)?;

        // Nodes stopped by an earlier halted rollout come back up too.
        let restart = matches!(node.status, NodeStatus::Running | NodeStatus::Stopped);
        if node.status == NodeStatus::Running {
            self.executor
                .execute(NodeAction::Stop, chain, host, node)
                .await?;
            self.set_node_status(&node.node_id, NodeStatus::Stopped).await?;
        }
        self.executor
            .execute(NodeAction::Upgrade, chain, host, node)
            .await?;
        let target = chain.upgrade_target.clone().unwrap_or_else(|| chain.version.clone());
        let node = self
            .commit(|topology| {
                let node = topology.node_mut(&node.node_id)?;
                node.version = target;
                node.updated_at = Utc::now();
                Ok(node.clone())
            })
            .await?;
        if restart {
            self.executor
                .execute(NodeAction::Start, chain, host, &node)
                .await?;
            self.set_node_status(&node.node_id, NodeStatus::Running).await?;
        }
        tracing::info!(chain = %chain.name, node_id = %node.node_id.short(), version = %node.version, "node upgraded");
        Ok(())
    }

    /// The staged artifact must still describe the node on record.
    fn verify_staged_layout(&self, host: &Host, node: &Node) -> Result<()> {
        let dir = self.generator.staged_node_dir(host, node);
        let staged = NodeConfig::read(&dir)?;
        if staged.node_id != node.node_id || staged.slot != node.slot || staged.ports != node.ports {
            return Err(OrchestratorError::PortParse {
                path: dir.display().to_string(),
                reason: format!(
                    "staged layout describes {} slot {} but record has {} slot {}",
                    staged.node_id.short(),
                    staged.slot,
                    node.node_id.short(),
                    node.slot
                ),
            });
        }
        Ok(())
    }

    async fn chain_groups(&self, chain_name: &str) -> BTreeSet<GroupId> {
        self.topology
            .read()
            .await
            .nodes_of_chain(chain_name)
            .iter()
            .flat_map(|n| n.group_ids.iter().copied())
            .collect()
    }

    async fn node_context(&self, node_id: &NodeId) -> Result<(Chain, Host, Node)> {
        let topology = self.topology.read().await;
        let node = topology.node(node_id)?.clone();
        let chain = topology.chain(&node.chain_name)?.clone();
        let host = topology.host(node.host_id)?.clone();
        Ok((chain, host, node))
    }

    async fn set_node_status(&self, node_id: &NodeId, next: NodeStatus) -> Result<Node> {
        self.commit(|topology| {
            let node = topology.node_mut(node_id)?;
            transition_node(node, next)?;
            Ok(node.clone())
        })
        .await
    }

    /// At most one transition per node at a time; a second caller gets a conflict.
    fn lock_node(&self, node_id: &NodeId) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.node_locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(node_id.clone()).or_default())
        };
        lock.try_lock_owned().map_err(|_| {
            OrchestratorError::status_conflict(node_target(node_id), "idle", "operation in flight")
        })
    }
}

fn validate_version(version: &str) -> Result<()> {
    let version = version.trim();
    if version.is_empty() || version.chars().any(char::is_whitespace) {
        return Err(OrchestratorError::Validation(format!(
            "invalid version tag '{version}'"
        )));
    }
    Ok(())
}

fn transition_chain(chain: &mut Chain, next: ChainStatus) -> Result<()> {
    if !chain.status.can_transition_to(next) {
        return Err(OrchestratorError::status_conflict(
            format!("chain {}", chain.name),
            format!("a status leading to {next}"),
            chain.status,
        ));
    }
    tracing::debug!(chain = %chain.name, from = %chain.status, to = %next, "chain transition");
    chain.status = next;
    chain.updated_at = Utc::now();
    Ok(())
}

fn transition_node(node: &mut Node, next: NodeStatus) -> Result<()> {
    if !node.status.can_transition_to(next) {
        return Err(OrchestratorError::status_conflict(
            node_target(&node.node_id),
            format!("a status leading to {next}"),
            node.status,
        ));
    }
    node.status = next;
    node.updated_at = Utc::now();
    Ok(())
}

fn node_target(node_id: &NodeId) -> String {
    format!("node {}", node_id.short())
}

fn count_running(topology: &Topology, chain_name: &str) -> usize {
    topology
        .nodes_of_chain(chain_name)
        .iter()
        .filter(|n| n.status == NodeStatus::Running)
        .count()
}

fn with_hosts(topology: &Topology, nodes: Vec<&Node>) -> Result<Vec<(Node, Host)>> {
    nodes
        .into_iter()
        .map(|n| Ok((n.clone(), topology.host(n.host_id)?.clone())))
        .collect()
}

fn batches_by_host(units: Vec<(Node, Host)>) -> Vec<(String, Vec<(Node, Host)>)> {
    let mut batches: BTreeMap<String, Vec<(Node, Host)>> = BTreeMap::new();
    for (node, host) in units {
        batches
            .entry(host.address.clone())
            .or_default()
            .push((node, host));
    }
    batches.into_iter().collect()
}

fn sort_results(results: &mut [NodeResult]) {
    results.sort_by(|a, b| a.host.cmp(&b.host).then(a.slot.cmp(&b.slot)));
}

fn failure(err: &OrchestratorError) -> NodeOutcome {
    NodeOutcome::Failed {
        kind: err.kind().to_string(),
        message: err.to_string(),
    }
}

fn node_result(node: &Node, host: &Host, outcome: NodeOutcome) -> NodeResult {
    NodeResult {
        node_id: node.node_id.clone(),
        host: host.address.clone(),
        slot: node.slot,
        outcome,
    }
}

async fn remove_dir_if_present(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
