use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::models::{EncryptType, Host};

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// The channel to the host could not be established or dropped mid-call.
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("exit {exit_code}: {stderr}")]
    Command { exit_code: i32, stderr: String },

    #[error("local i/o: {0}")]
    Io(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Connect(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Container and paths a node's provisioning commands operate on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub container: String,
    pub chain_dir: String,
    pub node_dir: String,
    pub image: String,
    pub version: String,
    pub pull: bool,
    pub encrypt_type: EncryptType,
}

impl ContainerSpec {
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Install,
    Start,
    Stop,
    Remove,
    Upgrade,
    QueryGroups,
    Probe,
    RemoveChainDir,
}

/// Provisioning and inspection commands understood by every executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    Install(ContainerSpec),
    Start { container: String },
    Stop { container: String },
    Remove { container: String, node_dir: String },
    Upgrade(ContainerSpec),
    QueryGroups { jsonrpc_port: u16 },
    Probe,
    RemoveChainDir { chain_dir: String },
}

impl RemoteCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Install(_) => CommandKind::Install,
            Self::Start { .. } => CommandKind::Start,
            Self::Stop { .. } => CommandKind::Stop,
            Self::Remove { .. } => CommandKind::Remove,
            Self::Upgrade(_) => CommandKind::Upgrade,
            Self::QueryGroups { .. } => CommandKind::QueryGroups,
            Self::Probe => CommandKind::Probe,
            Self::RemoveChainDir { .. } => CommandKind::RemoveChainDir,
        }
    }

    pub fn container(&self) -> Option<&str> {
        match self {
            Self::Install(spec) | Self::Upgrade(spec) => Some(&spec.container),
            Self::Start { container } | Self::Stop { container } | Self::Remove { container, .. } => {
                Some(container)
            }
            _ => None,
        }
    }

    /// Shell rendering used by executors that run commands through a shell.
    pub fn to_shell(&self) -> String {
        match self {
            Self::Install(spec) => {
                let mut steps = vec![format!("mkdir -p {}", shell_quote(&spec.node_dir))];
                if spec.pull {
                    steps.push(format!("docker pull {}", shell_quote(&spec.image_ref())));
                }
                steps.push(format!(
                    "docker run --rm -v {chain}:/work {image} gen-node-cert --scheme {scheme} --ca-dir /work/chain --node-dir /work/{node}",
                    chain = shell_quote(&spec.chain_dir),
                    image = shell_quote(&spec.image_ref()),
                    scheme = spec.encrypt_type.as_flag(),
                    node = shell_quote(node_dir_name(&spec.node_dir)),
                ));
                steps.push(create_container(spec));
                steps.join(" && ")
            }
            Self::Upgrade(spec) => {
                let mut steps = Vec::new();
                if spec.pull {
                    steps.push(format!("docker pull {}", shell_quote(&spec.image_ref())));
                }
                steps.push(format!("docker rm -f {}", shell_quote(&spec.container)));
                steps.push(create_container(spec));
                steps.join(" && ")
            }
            Self::Start { container } => format!("docker start {}", shell_quote(container)),
            Self::Stop { container } => format!("docker stop {}", shell_quote(container)),
            Self::Remove {
                container,
                node_dir,
            } => format!(
                "docker rm -f {} && rm -rf {}",
                shell_quote(container),
                shell_quote(node_dir)
            ),
            Self::QueryGroups { jsonrpc_port } => format!(
                "curl -s -X POST -H 'Content-Type: application/json' \
                 -d '{{\"jsonrpc\":\"2.0\",\"method\":\"getGroupList\",\"params\":[],\"id\":1}}' \
                 http://127.0.0.1:{jsonrpc_port}"
            ),
            Self::Probe => "true".to_string(),
            Self::RemoveChainDir { chain_dir } => format!("rm -rf {}", shell_quote(chain_dir)),
        }
    }
}

fn create_container(spec: &ContainerSpec) -> String {
    format!(
        "docker create --name {name} --network host -v {node}:/data -v {chain}/chain:/chain {image} -c /data/config.ini",
        name = shell_quote(&spec.container),
        node = shell_quote(&spec.node_dir),
        chain = shell_quote(&spec.chain_dir),
        image = shell_quote(&spec.image_ref()),
    )
}

fn node_dir_name(node_dir: &str) -> &str {
    node_dir.rsplit('/').next().unwrap_or(node_dir)
}

/// Single-quote for POSIX shells.
pub fn shell_quote(raw: &str) -> String {
    if !raw.is_empty()
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./:@=".contains(&b))
    {
        return raw.to_string();
    }
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Parse a `getGroupList` JSON-RPC response into group ids.
pub fn parse_group_list(stdout: &str) -> Result<Vec<u32>, RemoteError> {
    let value: serde_json::Value = serde_json::from_str(stdout.trim())
        .map_err(|e| RemoteError::Io(format!("bad getGroupList response: {e}")))?;
    let entries = value
        .get("result")
        .and_then(|r| r.as_array())
        .ok_or_else(|| RemoteError::Io("getGroupList response has no result array".into()))?;
    entries
        .iter()
        .map(|entry| match entry {
            serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        })
        .map(|g| g.ok_or_else(|| RemoteError::Io(format!("bad group id in {entries:?}"))))
        .collect()
}

/// Opens scoped sessions to hosts.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Short name of the execution mode, reported as the deploy type.
    fn mode(&self) -> &'static str;

    async fn open(&self, host: &Host) -> Result<Box<dyn RemoteSession>, RemoteError>;
}

/// A live channel to one host. Dropping it releases the channel.
#[async_trait]
pub trait RemoteSession: Send {
    async fn run(&mut self, command: &RemoteCommand) -> Result<ExecutionOutput, RemoteError>;

    /// Copy the contents of `local_dir` into `remote_dir`, creating it if needed.
    async fn upload(&mut self, local_dir: &Path, remote_dir: &str) -> Result<(), RemoteError>;
}
