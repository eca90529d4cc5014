//! In-memory [`RemoteExecutor`] used by tests and `--dry-run`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::remote::{
    CommandKind, ExecutionOutput, RemoteCommand, RemoteError, RemoteExecutor, RemoteSession,
};
use crate::models::{GroupId, Host};

#[derive(Debug, Clone)]
struct CommandFailure {
    host: String,
    kind: CommandKind,
    container: Option<String>,
}

/// Files copied by one upload, keyed by path relative to the uploaded directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedUpload {
    pub host: String,
    pub remote_dir: String,
    pub files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
struct FakeState {
    unreachable: HashSet<String>,
    connect_failures: HashMap<String, u32>,
    command_failures: Vec<CommandFailure>,
    upload_failures: HashSet<String>,
    live_groups: HashMap<(String, u16), BTreeSet<GroupId>>,
    command_delay: Option<Duration>,
    commands: Vec<(String, RemoteCommand)>,
    uploads: Vec<RecordedUpload>,
    open_sessions: usize,
    opened_total: usize,
}

/// Scriptable executor: every behaviour is keyed by host address.
#[derive(Clone, Default)]
pub struct FakeExecutor {
    state: Arc<Mutex<FakeState>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        let mut state = self.state();
        if unreachable {
            state.unreachable.insert(host.to_string());
        } else {
            state.unreachable.remove(host);
        }
    }

    /// The next `times` session opens to `host` fail with a connection error.
    pub fn fail_connect(&self, host: &str, times: u32) {
        self.state().connect_failures.insert(host.to_string(), times);
    }

    /// Every `kind` command on `host` (optionally only for `container`) exits non-zero.
    pub fn fail_command(&self, host: &str, kind: CommandKind, container: Option<&str>) {
        self.state().command_failures.push(CommandFailure {
            host: host.to_string(),
            kind,
            container: container.map(str::to_string),
        });
    }

    pub fn clear_command_failures(&self) {
        self.state().command_failures.clear();
    }

    pub fn fail_uploads(&self, host: &str) {
        self.state().upload_failures.insert(host.to_string());
    }

    pub fn set_live_groups(&self, host: &str, jsonrpc_port: u16, groups: BTreeSet<GroupId>) {
        self.state()
            .live_groups
            .insert((host.to_string(), jsonrpc_port), groups);
    }

    pub fn set_command_delay(&self, delay: Duration) {
        self.state().command_delay = Some(delay);
    }

    pub fn commands(&self) -> Vec<(String, RemoteCommand)> {
        self.state().commands.clone()
    }

    pub fn commands_of(&self, kind: CommandKind) -> Vec<(String, RemoteCommand)> {
        self.commands()
            .into_iter()
            .filter(|(_, c)| c.kind() == kind)
            .collect()
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.state().uploads.clone()
    }

    pub fn open_sessions(&self) -> usize {
        self.state().open_sessions
    }

    pub fn sessions_opened(&self) -> usize {
        self.state().opened_total
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    fn mode(&self) -> &'static str {
        "fake"
    }

    async fn open(&self, host: &Host) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let mut state = self.state();
        if state.unreachable.contains(&host.address) {
            return Err(RemoteError::Connect(format!("{} unreachable", host.address)));
        }
        if let Some(remaining) = state.connect_failures.get_mut(&host.address) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RemoteError::Connect(format!(
                    "{} refused connection",
                    host.address
                )));
            }
        }
        state.open_sessions += 1;
        state.opened_total += 1;
        Ok(Box::new(FakeSession {
            host: host.address.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeSession {
    host: String,
    state: Arc<Mutex<FakeState>>,
}

impl FakeSession {
    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn run(&mut self, command: &RemoteCommand) -> Result<ExecutionOutput, RemoteError> {
        let delay = self.state().command_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.commands.push((self.host.clone(), command.clone()));

        let failing = state.command_failures.iter().any(|f| {
            f.host == self.host
                && f.kind == command.kind()
                && f.container.as_deref().map_or(true, |c| Some(c) == command.container())
        });
        if failing {
            return Err(RemoteError::Command {
                exit_code: 1,
                stderr: format!("scripted {:?} failure", command.kind()),
            });
        }

        match command {
            RemoteCommand::QueryGroups { jsonrpc_port } => {
                let groups = state
                    .live_groups
                    .get(&(self.host.clone(), *jsonrpc_port))
                    .ok_or_else(|| RemoteError::Command {
                        exit_code: 7,
                        stderr: format!("no listener on port {jsonrpc_port}"),
                    })?;
                let result: Vec<String> = groups.iter().map(|g| g.to_string()).collect();
                Ok(ExecutionOutput {
                    exit_code: 0,
                    stdout: serde_json::json!({"id": 1, "jsonrpc": "2.0", "result": result})
                        .to_string(),
                    stderr: String::new(),
                })
            }
            _ => Ok(ExecutionOutput::default()),
        }
    }

    async fn upload(&mut self, local_dir: &Path, remote_dir: &str) -> Result<(), RemoteError> {
        if self.state().upload_failures.contains(&self.host) {
            return Err(RemoteError::Command {
                exit_code: 1,
                stderr: format!("scripted upload failure to {remote_dir}"),
            });
        }
        let mut files = BTreeMap::new();
        collect_files(local_dir, local_dir, &mut files)
            .map_err(|e| RemoteError::Io(e.to_string()))?;
        self.state().uploads.push(RecordedUpload {
            host: self.host.clone(),
            remote_dir: remote_dir.to_string(),
            files,
        });
        Ok(())
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.state().open_sessions -= 1;
    }
}

fn collect_files(
    root: &Path,
    dir: &Path,
    files: &mut BTreeMap<String, Vec<u8>>,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(root, &path, files)?;
        } else {
            let relative = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            files.insert(relative, std::fs::read(&path)?);
        }
    }
    Ok(())
}
