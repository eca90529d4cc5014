use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use super::remote::{ExecutionOutput, RemoteCommand, RemoteError, RemoteExecutor, RemoteSession};
use crate::models::{Host, SshSettings};

/// ssh reserves exit status 255 for its own (connection-level) failures.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Runs commands on hosts over ssh, one ControlMaster connection per session.
pub struct SshExecutor {
    settings: SshSettings,
    control_dir: PathBuf,
}

impl SshExecutor {
    pub fn new(settings: SshSettings, control_dir: PathBuf) -> Self {
        Self {
            settings,
            control_dir,
        }
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.connect_timeout_secs.max(1))
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    fn mode(&self) -> &'static str {
        "ssh"
    }

    async fn open(&self, host: &Host) -> Result<Box<dyn RemoteSession>, RemoteError> {
        tokio::fs::create_dir_all(&self.control_dir)
            .await
            .map_err(|e| RemoteError::Io(format!("create control dir: {e}")))?;
        let control_path = self.control_dir.join(format!(
            "{}-{}-{}.sock",
            host.address,
            host.credential.port,
            uuid::Uuid::new_v4().simple()
        ));

        let mut cmd = Command::new("ssh");
        cmd.args(base_args(host, &control_path, self.connect_timeout()))
            .args(["-M", "-N"])
            .arg(host.ssh_target())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut master = cmd
            .spawn()
            .map_err(|e| RemoteError::Connect(format!("failed to spawn ssh: {e}")))?;

        // The master is usable once its control socket appears.
        let deadline = tokio::time::Instant::now() + self.connect_timeout();
        while !control_path.exists() {
            if let Ok(Some(status)) = master.try_wait() {
                return Err(RemoteError::Connect(format!(
                    "ssh to {} exited with {status}",
                    host.address
                )));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RemoteError::Connect(format!(
                    "ssh to {} not ready within {:?}",
                    host.address,
                    self.connect_timeout()
                )));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        tracing::debug!(host = %host.address, "opened ssh session");
        Ok(Box::new(SshSession {
            host: host.clone(),
            control_path,
            connect_timeout: self.connect_timeout(),
            _master: master,
        }))
    }
}

fn base_args(host: &Host, control_path: &Path, connect_timeout: Duration) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", connect_timeout.as_secs()),
        "-o".to_string(),
        format!("ControlPath={}", control_path.display()),
        "-p".to_string(),
        host.credential.port.to_string(),
    ];
    if let Some(identity) = &host.credential.identity_file {
        args.push("-i".to_string());
        args.push(identity.clone());
    }
    args
}

struct SshSession {
    host: Host,
    control_path: PathBuf,
    connect_timeout: Duration,
    /// Killed on drop, which tears the connection down.
    _master: Child,
}

impl SshSession {
    async fn ssh(&self, remote_command: &str) -> Result<ExecutionOutput, RemoteError> {
        let output = Command::new("ssh")
            .args(base_args(&self.host, &self.control_path, self.connect_timeout))
            .arg(self.host.ssh_target())
            .arg(remote_command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RemoteError::Connect(format!("failed to run ssh: {e}")))?;
        classify(output)
    }
}

fn classify(output: std::process::Output) -> Result<ExecutionOutput, RemoteError> {
    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    match exit_code {
        0 => Ok(ExecutionOutput {
            exit_code,
            stdout,
            stderr,
        }),
        SSH_CONNECTION_FAILURE => Err(RemoteError::Connect(stderr)),
        _ => Err(RemoteError::Command { exit_code, stderr }),
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn run(&mut self, command: &RemoteCommand) -> Result<ExecutionOutput, RemoteError> {
        let shell = command.to_shell();
        tracing::debug!(host = %self.host.address, command = %shell, "ssh exec");
        self.ssh(&shell).await
    }

    async fn upload(&mut self, local_dir: &Path, remote_dir: &str) -> Result<(), RemoteError> {
        self.ssh(&format!("mkdir -p {}", super::remote::shell_quote(remote_dir)))
            .await?;

        let mut cmd = Command::new("scp");
        cmd.args([
            "-r",
            "-o",
            "BatchMode=yes",
            "-o",
            &format!("ControlPath={}", self.control_path.display()),
            "-P",
            &self.host.credential.port.to_string(),
        ]);
        if let Some(identity) = &self.host.credential.identity_file {
            cmd.args(["-i", identity]);
        }
        let output = cmd
            .arg(format!("{}/.", local_dir.display()))
            .arg(format!("{}:{remote_dir}", self.host.ssh_target()))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RemoteError::Connect(format!("failed to run scp: {e}")))?;
        classify(output).map(|_| ())
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.control_path);
    }
}
