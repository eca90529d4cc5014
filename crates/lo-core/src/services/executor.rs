use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::sleep;

use super::remote::{
    ContainerSpec, ExecutionOutput, RemoteCommand, RemoteError, RemoteExecutor,
};
use crate::error::{OrchestratorError, Result};
use crate::models::{Chain, Host, ImageType, Node, RetrySettings};

/// Provisioning actions applied to a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAction {
    Install,
    Start,
    Stop,
    Remove,
    Upgrade,
}

impl fmt::Display for NodeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Install => "install",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Remove => "remove",
            Self::Upgrade => "upgrade",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        let base_delay = Duration::from_millis(settings.base_delay_ms);
        Self {
            max_attempts: settings.max_attempts,
            base_delay,
            max_delay: Duration::from_millis(settings.max_delay_ms).max(base_delay),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, retries_used: u32) -> Duration {
        let base_ms = self.base_delay.as_millis();
        if base_ms == 0 {
            return Duration::ZERO;
        }
        let max_ms = self.max_delay.as_millis().max(base_ms);
        let multiplier = 1u128 << retries_used.min(20);
        let backoff_ms = base_ms.saturating_mul(multiplier).min(max_ms);
        Duration::from_millis(u64::try_from(backoff_ms).unwrap_or(u64::MAX))
    }
}

enum Step<'a> {
    Run(&'a RemoteCommand),
    Upload { local: &'a Path, remote: &'a str },
}

impl Step<'_> {
    fn label(&self) -> String {
        match self {
            Step::Run(command) => format!("{:?}", command.kind()),
            Step::Upload { remote, .. } => format!("upload {remote}"),
        }
    }
}

/// Runs provisioning commands against hosts with bounded retry and timeout.
pub struct DeploymentExecutor {
    remote: Arc<dyn RemoteExecutor>,
    retry: RetryPolicy,
    action_timeout: Duration,
    docker_image: String,
}

impl DeploymentExecutor {
    pub fn new(
        remote: Arc<dyn RemoteExecutor>,
        retry: RetryPolicy,
        action_timeout: Duration,
        docker_image: String,
    ) -> Self {
        Self {
            remote,
            retry,
            action_timeout,
            docker_image,
        }
    }

    pub fn mode(&self) -> &'static str {
        self.remote.mode()
    }

    /// Build the container spec for `node`, targeting `version`.
    pub fn container_spec(&self, chain: &Chain, host: &Host, node: &Node, version: &str) -> ContainerSpec {
        let chain_dir = chain.chain_dir_on(&host.root_dir);
        ContainerSpec {
            container: format!("{}-{}", chain.name, node.dir_name()),
            node_dir: format!("{chain_dir}/{}", node.dir_name()),
            chain_dir,
            image: self.docker_image.clone(),
            version: version.to_string(),
            pull: chain.image_type == ImageType::Pull,
            encrypt_type: chain.encrypt_type,
        }
    }

    pub fn command_for(&self, action: NodeAction, chain: &Chain, host: &Host, node: &Node) -> RemoteCommand {
        let spec = self.container_spec(chain, host, node, &node.version);
        match action {
            NodeAction::Install => RemoteCommand::Install(spec),
            NodeAction::Start => RemoteCommand::Start {
                container: spec.container,
            },
            NodeAction::Stop => RemoteCommand::Stop {
                container: spec.container,
            },
            NodeAction::Remove => RemoteCommand::Remove {
                container: spec.container,
                node_dir: spec.node_dir,
            },
            NodeAction::Upgrade => {
                let target = chain.upgrade_target.as_deref().unwrap_or(&chain.version);
                RemoteCommand::Upgrade(self.container_spec(chain, host, node, target))
            }
        }
    }

    /// Apply `action` to `node`. Non-zero exits are reported, never retried.
    pub async fn execute(
        &self,
        action: NodeAction,
        chain: &Chain,
        host: &Host,
        node: &Node,
    ) -> Result<ExecutionOutput> {
        let command = self.command_for(action, chain, host, node);
        tracing::info!(
            chain = %chain.name,
            host = %host.address,
            node_id = %node.node_id.short(),
            %action,
            "executing node action"
        );
        self.run(host, &command).await
    }

    pub async fn run(&self, host: &Host, command: &RemoteCommand) -> Result<ExecutionOutput> {
        self.run_step(host, Step::Run(command))
            .await
            .map_err(|e| OrchestratorError::RemoteExec {
                host: host.address.clone(),
                reason: e.to_string(),
            })
    }

    pub async fn upload(&self, host: &Host, local: &Path, remote: &str) -> Result<()> {
        self.run_step(host, Step::Upload { local, remote })
            .await
            .map(|_| ())
            .map_err(|e| OrchestratorError::RemoteWrite {
                host: host.address.clone(),
                reason: e.to_string(),
            })
    }

    /// Whether a session can be opened and a no-op command run on `host`.
    pub async fn probe(&self, host: &Host) -> bool {
        self.attempt(host, &Step::Run(&RemoteCommand::Probe))
            .await
            .is_ok()
    }

    async fn run_step(&self, host: &Host, step: Step<'_>) -> std::result::Result<ExecutionOutput, RemoteError> {
        let mut retries_used: u32 = 0;
        loop {
            let err = match self.attempt(host, &step).await {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };
            if !err.is_transient() || retries_used >= self.retry.max_attempts {
                tracing::warn!(
                    host = %host.address,
                    step = %step.label(),
                    attempts = retries_used + 1,
                    error = %err,
                    "remote step failed"
                );
                return Err(err);
            }
            let delay = self.retry.backoff(retries_used);
            retries_used += 1;
            tracing::warn!(
                host = %host.address,
                step = %step.label(),
                attempt = retries_used,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after transient failure"
            );
            if !delay.is_zero() {
                sleep(delay).await;
            }
        }
    }

    /// One attempt in its own session; the session is dropped on every path out.
    async fn attempt(&self, host: &Host, step: &Step<'_>) -> std::result::Result<ExecutionOutput, RemoteError> {
        let mut session = self.remote.open(host).await?;
        let work = async {
            match step {
                Step::Run(command) => session.run(command).await,
                Step::Upload { local, remote } => session
                    .upload(local, remote)
                    .await
                    .map(|_| ExecutionOutput::default()),
            }
        };
        match tokio::time::timeout(self.action_timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(self.action_timeout)),
        }
    }
}

/// Run `work` for every unit, hosts in parallel and units of one host in order.
pub async fn fan_out_by_host<T, R, F, Fut>(batches: Vec<(String, Vec<T>)>, work: F) -> Vec<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let work = Arc::new(work);
    let mut set = JoinSet::new();
    for (host, units) in batches {
        let work = Arc::clone(&work);
        set.spawn(async move {
            tracing::debug!(%host, units = units.len(), "host batch started");
            let mut results = Vec::with_capacity(units.len());
            for unit in units {
                results.push(work(unit).await);
            }
            results
        });
    }
    let mut all = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(results) => all.extend(results),
            Err(e) => tracing::error!(error = %e, "host batch task aborted"),
        }
    }
    all
}
