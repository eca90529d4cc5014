use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{OrchestratorError, Result};
use crate::models::{DeploymentOperation, OperationKind, OperationOutcome};

/// Tracks the one in-flight chain-level operation per chain.
///
/// Each operation is mirrored to `<dir>/<chain>.json` so other processes sharing
/// the state directory can read its progress and see that it is in flight.
pub struct ProgressTracker {
    dir: PathBuf,
    active: Mutex<HashMap<String, DeploymentOperation>>,
}

impl ProgressTracker {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            active: Mutex::new(HashMap::new()),
        }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, DeploymentOperation>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start tracking. Fails if the chain already has an operation in flight,
    /// here or in another process.
    pub fn begin(&self, chain: &str, kind: OperationKind, total_units: u32) -> Result<()> {
        let mut active = self.active();
        if let Some(current) = active.get(chain).cloned().or_else(|| self.read_in_flight(chain)) {
            return Err(OrchestratorError::status_conflict(
                format!("chain {chain}"),
                "no operation in flight",
                format!("{} in flight", current.kind),
            ));
        }
        let op = DeploymentOperation::new(chain.to_string(), kind, total_units);
        self.persist(&op)?;
        active.insert(chain.to_string(), op);
        tracing::info!(chain, %kind, total_units, "operation started");
        Ok(())
    }

    pub fn complete_unit(&self, chain: &str) {
        let mut active = self.active();
        let Some(op) = active.get_mut(chain) else {
            return;
        };
        op.completed_units = (op.completed_units + 1).min(op.total_units);
        if let Err(err) = self.persist(op) {
            tracing::warn!(chain, error = %err, "could not record progress");
        }
    }

    /// Close the operation and keep it on disk as the chain's last finished one.
    pub fn finish(&self, chain: &str, outcome: OperationOutcome) {
        let Some(mut op) = self.active().remove(chain) else {
            return;
        };
        op.outcome = Some(outcome);
        tracing::info!(chain, kind = %op.kind, ?outcome, completed = op.completed_units, total = op.total_units, "operation finished");
        if let Err(err) = self.persist(&op) {
            tracing::warn!(chain, error = %err, "could not record finished operation");
        }
    }

    /// Percent complete of the in-flight operation; 100 when nothing is in flight.
    pub fn progress(&self, chain: &str) -> u8 {
        self.current(chain).map_or(100, |op| op.percent())
    }

    pub fn current(&self, chain: &str) -> Option<DeploymentOperation> {
        self.active()
            .get(chain)
            .cloned()
            .or_else(|| self.read_in_flight(chain))
    }

    pub fn last_finished(&self, chain: &str) -> Option<DeploymentOperation> {
        self.read(chain).filter(|op| op.outcome.is_some())
    }

    /// An unfinished record whose owning process is still alive.
    fn read_in_flight(&self, chain: &str) -> Option<DeploymentOperation> {
        let op = self.read(chain).filter(|op| op.outcome.is_none())?;
        if !process_alive(op.owner_pid) {
            tracing::warn!(chain, pid = op.owner_pid, kind = %op.kind, "ignoring operation abandoned by a dead process");
            return None;
        }
        Some(op)
    }

    fn read(&self, chain: &str) -> Option<DeploymentOperation> {
        let path = self.path_for(chain)?;
        let json = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&json) {
            Ok(op) => Some(op),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "unreadable operation record");
                None
            }
        }
    }

    fn persist(&self, op: &DeploymentOperation) -> Result<()> {
        let Some(path) = self.path_for(&op.chain_name) else {
            return Ok(());
        };
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            OrchestratorError::Persistence(format!("failed to create operations dir: {e}"))
        })?;
        let json = serde_json::to_string_pretty(op)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .and_then(|()| std::fs::rename(&tmp, &path))
            .map_err(|e| OrchestratorError::Persistence(format!("failed to write operation record: {e}")))
    }

    /// Chain names that could escape the directory are tracked in memory only.
    fn path_for(&self, chain: &str) -> Option<PathBuf> {
        let plain = !chain.is_empty()
            && !chain.starts_with('.')
            && Path::new(chain).components().count() == 1
            && !chain.contains(['/', '\\']);
        plain.then(|| self.dir.join(format!("{chain}.json")))
    }
}

fn process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    #[cfg(unix)]
    {
        if unsafe { libc::kill(pid as i32, 0) } == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(dir: &Path) -> ProgressTracker {
        ProgressTracker::new(dir.join("operations"))
    }

    #[test]
    fn idle_chain_reports_complete() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(tracker(dir.path()).progress("nothing"), 100);
    }

    #[test]
    fn progress_is_monotonic_and_closes_at_100() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path());
        tracker.begin("c", OperationKind::Deploy, 3).unwrap();
        let mut last = tracker.progress("c");
        assert_eq!(last, 0);
        for _ in 0..5 {
            tracker.complete_unit("c");
            let now = tracker.progress("c");
            assert!(now >= last);
            last = now;
        }
        assert_eq!(last, 100);
        tracker.finish("c", OperationOutcome::Succeeded);
        assert_eq!(tracker.progress("c"), 100);
        assert!(tracker.current("c").is_none());
        let archived = tracker.last_finished("c").unwrap();
        assert_eq!(archived.completed_units, 3);
        assert_eq!(archived.outcome, Some(OperationOutcome::Succeeded));
    }

    #[test]
    fn second_operation_on_same_chain_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path());
        tracker.begin("c", OperationKind::Upgrade, 4).unwrap();
        assert!(matches!(
            tracker.begin("c", OperationKind::Deploy, 1),
            Err(OrchestratorError::StatusConflict { .. })
        ));
        tracker.begin("other", OperationKind::Deploy, 1).unwrap();
    }

    #[test]
    fn another_tracker_on_the_same_dir_sees_the_operation() {
        let dir = tempfile::tempdir().unwrap();
        let running = tracker(dir.path());
        let observer = tracker(dir.path());

        running.begin("c", OperationKind::Deploy, 4).unwrap();
        running.complete_unit("c");
        assert_eq!(observer.progress("c"), 25);
        assert!(matches!(
            observer.begin("c", OperationKind::Upgrade, 1),
            Err(OrchestratorError::StatusConflict { .. })
        ));

        running.finish("c", OperationOutcome::Succeeded);
        assert_eq!(observer.progress("c"), 100);
        assert_eq!(
            observer.last_finished("c").unwrap().outcome,
            Some(OperationOutcome::Succeeded)
        );
        observer.begin("c", OperationKind::Upgrade, 1).unwrap();
    }

    #[test]
    fn record_left_by_a_dead_process_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path());
        let mut abandoned = DeploymentOperation::new("c".into(), OperationKind::Deploy, 2);
        abandoned.owner_pid = 0;
        tracker.persist(&abandoned).unwrap();

        assert_eq!(tracker.progress("c"), 100);
        tracker.begin("c", OperationKind::Deploy, 1).unwrap();
    }

    #[test]
    fn unsafe_chain_names_stay_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path());
        tracker.begin("../escape", OperationKind::Deploy, 1).unwrap();
        assert_eq!(tracker.progress("../escape"), 0);
        assert!(!dir.path().join("escape.json").exists());
        assert!(!dir.path().join("operations").exists());
    }
}
