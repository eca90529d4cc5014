use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use lo_core::models::{ApiResponse, EncryptType, ImageType, NodeId, NodeStatus, OrchestratorConfig};
use lo_core::services::config_loader;
use lo_core::services::fake::FakeExecutor;
use lo_core::services::lifecycle::{ChainManager, DeployRequest};
use lo_core::services::node_config::NodeConfig;
use lo_core::services::reconcile::Reconciler;
use lo_core::services::remote::RemoteExecutor;
use lo_core::services::ssh::SshExecutor;
use lo_core::OrchestratorError;

#[derive(Debug, Parser)]
#[command(name = "lo", about = "Deploy and operate ledger chains across hosts")]
pub struct Cli {
    /// Directory holding `.lo-orchestrator.yaml`; relative state paths resolve against it.
    #[arg(long, global = true, default_value = ".")]
    config_dir: PathBuf,
    /// Run against an in-memory executor and a separate dry-run state.
    #[arg(long, global = true)]
    dry_run: bool,
    /// Write logs to this file instead of stderr.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
    #[arg(long, global = true)]
    pub debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Read back a staged node directory
    InspectNode { dir: PathBuf },
    #[command(flatten)]
    Managed(ManagedCommand),
}

/// Commands that act on the persisted topology.
#[derive(Debug, Subcommand)]
enum ManagedCommand {
    /// Deploy a new chain onto the listed hosts
    Deploy(DeployArgs),
    /// Add nodes to an existing chain; they are left installed, not started
    AddNodes(HostListArgs),
    /// Install a node left pending by a failed deploy
    InstallNode { node_id: String },
    StartNode {
        node_id: String,
        /// Status the node must currently have
        #[arg(long, value_enum)]
        expected: ExpectedStatus,
    },
    StopNode { node_id: String },
    DeleteNode {
        node_id: String,
        #[arg(long)]
        delete_host: bool,
        #[arg(long)]
        delete_agency: bool,
    },
    /// Roll a new version out node by node
    Upgrade {
        #[arg(long)]
        chain: String,
        #[arg(long)]
        version: String,
    },
    Progress { chain: String },
    Chain { chain: String },
    StartChain { chain: String },
    StopChain { chain: String },
    DeleteChain { chain: String },
    Hosts,
    AddHost {
        address: String,
        #[arg(long)]
        agency: String,
        #[arg(long)]
        root_dir: Option<String>,
    },
    /// Flag a host as unreachable until a reconciliation pass reaches it
    MarkUnreachable { host_id: u32 },
    RemoveHost {
        host_id: u32,
        /// Also drop the records of nodes on the host
        #[arg(long)]
        cascade: bool,
    },
    Agencies,
    DeployType,
    /// Correct group membership and reachability from live state
    Reconcile {
        /// Single pass instead of running until interrupted
        #[arg(long)]
        once: bool,
        #[arg(long)]
        chain: Option<String>,
    },
}

#[derive(Debug, Args)]
struct HostListSource {
    /// Host entry `IP:COUNT AGENCY GROUPS`; repeatable
    #[arg(long = "host")]
    hosts: Vec<String>,
    /// File with one host entry per line
    #[arg(long)]
    host_file: Option<PathBuf>,
}

impl HostListSource {
    fn lines(&self) -> lo_core::Result<Vec<String>> {
        let mut lines = self.hosts.clone();
        if let Some(path) = &self.host_file {
            lines.extend(std::fs::read_to_string(path)?.lines().map(str::to_string));
        }
        Ok(lines)
    }
}

#[derive(Debug, Args)]
struct HostListArgs {
    #[arg(long)]
    chain: String,
    #[command(flatten)]
    hosts: HostListSource,
}

#[derive(Debug, Args)]
struct DeployArgs {
    #[arg(long)]
    chain: String,
    #[arg(long)]
    version: String,
    #[command(flatten)]
    hosts: HostListSource,
    #[arg(long)]
    sign_service_address: Option<String>,
    #[arg(long)]
    root_dir: Option<String>,
    #[arg(long, value_enum)]
    image_type: Option<ImageArg>,
    #[arg(long, value_enum)]
    encrypt_type: Option<EncryptArg>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExpectedStatus {
    Installed,
    Stopped,
}

impl From<ExpectedStatus> for NodeStatus {
    fn from(status: ExpectedStatus) -> Self {
        match status {
            ExpectedStatus::Installed => NodeStatus::Installed,
            ExpectedStatus::Stopped => NodeStatus::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ImageArg {
    Pull,
    Manual,
}

impl From<ImageArg> for ImageType {
    fn from(arg: ImageArg) -> Self {
        match arg {
            ImageArg::Pull => ImageType::Pull,
            ImageArg::Manual => ImageType::Manual,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EncryptArg {
    Standard,
    Guomi,
}

impl From<EncryptArg> for EncryptType {
    fn from(arg: EncryptArg) -> Self {
        match arg {
            EncryptArg::Standard => EncryptType::Standard,
            EncryptArg::Guomi => EncryptType::Guomi,
        }
    }
}

impl Cli {
    pub async fn run(self) -> color_eyre::Result<ExitCode> {
        let Cli {
            config_dir,
            dry_run,
            command,
            ..
        } = self;
        match command {
            Command::InspectNode { dir } => respond(NodeConfig::read(&dir).map(|c| {
                serde_json::json!({
                    "nodeId": c.node_id,
                    "slot": c.slot,
                    "ports": c.ports,
                    "groupIds": c.group_ids,
                })
            })),
            Command::Managed(command) => {
                let manager = open_manager(&config_dir, dry_run).await?;
                dispatch(manager, command).await
            }
        }
    }
}

async fn open_manager(config_dir: &Path, dry_run: bool) -> color_eyre::Result<ChainManager> {
    let mut config = match config_loader::load(config_dir) {
        Ok(config) => config,
        Err(OrchestratorError::ConfigNotFound(path)) => {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            OrchestratorConfig::default()
        }
        Err(err) => return Err(err.into()),
    };

    let remote: Arc<dyn RemoteExecutor> = if dry_run {
        config.state_dir = config.state_dir.join("dry-run");
        config.staging_dir = config.staging_dir.join("dry-run");
        Arc::new(FakeExecutor::new())
    } else {
        let control_dir = config_dir.join(&config.state_dir).join("ssh");
        Arc::new(SshExecutor::new(config.ssh.clone(), control_dir))
    };
    tracing::debug!(mode = remote.mode(), config_dir = %config_dir.display(), "opening topology");

    let manager = ChainManager::new(config, config_dir, remote);
    manager.load_state().await?;
    Ok(manager)
}

async fn dispatch(manager: ChainManager, command: ManagedCommand) -> color_eyre::Result<ExitCode> {
    match command {
        ManagedCommand::Deploy(args) => {
            let request = args.hosts.lines().map(|host_list| DeployRequest {
                chain_name: args.chain,
                host_list,
                version: args.version,
                sign_service_address: args.sign_service_address,
                root_dir: args.root_dir,
                image_type: args.image_type.map(Into::into),
                encrypt_type: args.encrypt_type.map(Into::into),
            });
            match request {
                Ok(request) => respond(manager.deploy_chain(request).await),
                Err(err) => respond::<()>(Err(err)),
            }
        }
        ManagedCommand::AddNodes(args) => match args.hosts.lines() {
            Ok(lines) => respond(manager.add_nodes(&args.chain, &lines).await),
            Err(err) => respond::<()>(Err(err)),
        },
        ManagedCommand::InstallNode { node_id } => match parse_node_id(&node_id) {
            Ok(id) => respond(manager.install_node(&id).await),
            Err(err) => respond::<()>(Err(err)),
        },
        ManagedCommand::StartNode { node_id, expected } => match parse_node_id(&node_id) {
            Ok(id) => respond(manager.start_node(&id, expected.into()).await),
            Err(err) => respond::<()>(Err(err)),
        },
        ManagedCommand::StopNode { node_id } => match parse_node_id(&node_id) {
            Ok(id) => respond(manager.stop_node(&id).await),
            Err(err) => respond::<()>(Err(err)),
        },
        ManagedCommand::DeleteNode {
            node_id,
            delete_host,
            delete_agency,
        } => match parse_node_id(&node_id) {
            Ok(id) => respond(manager.delete_node(&id, delete_host, delete_agency).await),
            Err(err) => respond::<()>(Err(err)),
        },
        ManagedCommand::Upgrade { chain, version } => respond(manager.upgrade_chain(&chain, &version).await),
        ManagedCommand::Progress { chain } => respond(Ok(manager.progress(&chain))),
        ManagedCommand::Chain { chain } => respond(manager.get_chain(&chain).await),
        ManagedCommand::StartChain { chain } => respond(manager.start_chain(&chain).await),
        ManagedCommand::StopChain { chain } => respond(manager.stop_chain(&chain).await),
        ManagedCommand::DeleteChain { chain } => respond(manager.delete_chain(&chain).await),
        ManagedCommand::Hosts => respond(Ok(manager.list_hosts().await)),
        ManagedCommand::AddHost {
            address,
            agency,
            root_dir,
        } => respond(
            manager
                .register_host(&address, &agency, root_dir.as_deref())
                .await,
        ),
        ManagedCommand::MarkUnreachable { host_id } => respond(manager.mark_unreachable(host_id).await),
        ManagedCommand::RemoveHost { host_id, cascade } => respond(manager.remove_host(host_id, cascade).await),
        ManagedCommand::Agencies => respond(Ok(manager.list_agencies().await)),
        ManagedCommand::DeployType => respond(Ok(manager.deploy_type())),
        ManagedCommand::Reconcile { once, chain } => reconcile(manager, once, chain).await,
    }
}

fn parse_node_id(raw: &str) -> lo_core::Result<NodeId> {
    NodeId::parse(raw).ok_or_else(|| {
        OrchestratorError::Validation(format!("'{raw}' is not a {}-character node id", NodeId::LEN))
    })
}

async fn reconcile(manager: ChainManager, once: bool, chain: Option<String>) -> color_eyre::Result<ExitCode> {
    let reconciler = Reconciler::new(manager.clone());
    if once {
        return match chain {
            Some(chain) => respond(reconciler.run_once(&chain).await),
            None => respond(Ok(reconciler.run_all().await)),
        };
    }

    let period = manager.config().reconcile_interval();
    let cancel = CancellationToken::new();
    let handle = reconciler.spawn(period, cancel.clone());
    tracing::info!(period_secs = period.as_secs(), "reconciler running, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    cancel.cancel();
    handle.await?;
    Ok(ExitCode::SUCCESS)
}

/// Print the structured result and map it to the process exit code.
fn respond<T: Serialize>(result: lo_core::Result<T>) -> color_eyre::Result<ExitCode> {
    let response = ApiResponse::from(result);
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(if response.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn deploy_collects_repeated_hosts() {
        let cli = Cli::parse_from([
            "lo",
            "deploy",
            "--chain",
            "c",
            "--version",
            "v1",
            "--host",
            "10.0.0.1:1 a 1",
            "--host",
            "10.0.0.2:1 b 1",
            "--image-type",
            "manual",
        ]);
        let Command::Managed(ManagedCommand::Deploy(args)) = cli.command else {
            panic!("expected deploy");
        };
        assert_eq!(args.hosts.lines().unwrap().len(), 2);
        assert!(matches!(args.image_type, Some(ImageArg::Manual)));
    }

    #[test]
    fn host_file_lines_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("ipconf");
        std::fs::write(&file, "# hosts\n10.0.0.3:2 c 1,2\n").unwrap();
        let source = HostListSource {
            hosts: vec!["10.0.0.1:1 a 1".into()],
            host_file: Some(file),
        };
        assert_eq!(
            source.lines().unwrap(),
            vec!["10.0.0.1:1 a 1", "# hosts", "10.0.0.3:2 c 1,2"]
        );
    }

    #[test]
    fn node_ids_are_validated() {
        assert!(parse_node_id("short").is_err());
        let id = NodeId::generate();
        assert_eq!(parse_node_id(id.as_str()).unwrap(), id);
    }

    #[tokio::test]
    async fn dry_run_deploy_persists_separately() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::parse_from([
            "lo",
            "--dry-run",
            "--config-dir",
            dir.path().to_str().unwrap(),
            "deploy",
            "--chain",
            "c",
            "--version",
            "v1",
            "--host",
            "10.0.0.1:1 a 1",
        ]);
        assert_eq!(cli.run().await.unwrap(), ExitCode::SUCCESS);
        assert!(dir.path().join(".lo/state/dry-run/topology.json").exists());
        assert!(!dir.path().join(".lo/state/topology.json").exists());
    }

    #[test]
    fn inspect_node_is_parsed_apart_from_managed_commands() {
        let cli = Cli::parse_from(["lo", "inspect-node", "/tmp/node0"]);
        assert!(matches!(cli.command, Command::InspectNode { .. }));
        let cli = Cli::parse_from(["lo", "mark-unreachable", "3"]);
        assert!(matches!(
            cli.command,
            Command::Managed(ManagedCommand::MarkUnreachable { host_id: 3 })
        ));
    }
}
