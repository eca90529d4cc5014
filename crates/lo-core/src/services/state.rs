use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{OrchestratorError, Result};
use crate::models::Topology;

const LOCK_RETRY: Duration = Duration::from_millis(10);

pub struct TopologyStore {
    state_file_path: PathBuf,
    lock_file_path: PathBuf,
}

/// Exclusive hold on the state directory, shared by every `lo` process.
/// Released when dropped.
pub struct StoreLock {
    _file: File,
}

impl TopologyStore {
    pub fn new(state_directory: &Path) -> Self {
        Self {
            state_file_path: state_directory.join("topology.json"),
            lock_file_path: state_directory.join("topology.lock"),
        }
    }

    /// Wait for the advisory lock next to the state file.
    pub async fn lock(&self) -> Result<StoreLock> {
        if let Some(parent) = self.lock_file_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                OrchestratorError::Persistence(format!("failed to create state dir: {e}"))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_file_path)
            .map_err(|e| OrchestratorError::Persistence(format!("failed to open lock file: {e}")))?;
        loop {
            if try_lock_exclusive(&file)? {
                return Ok(StoreLock { _file: file });
            }
            tokio::time::sleep(LOCK_RETRY).await;
        }
    }

    pub async fn load(&self) -> Result<Topology> {
        if !self.state_file_path.exists() {
            return Ok(Topology::default());
        }
        let json = tokio::fs::read_to_string(&self.state_file_path)
            .await
            .map_err(|e| OrchestratorError::Persistence(format!("failed to read state file: {e}")))?;
        let topology: Topology = serde_json::from_str(&json)
            .map_err(|e| OrchestratorError::Persistence(format!("corrupt state file: {e}")))?;
        Ok(topology)
    }

    /// Write through a temp file so a crash never leaves a truncated state file.
    pub async fn save(&self, topology: &Topology) -> Result<()> {
        if let Some(parent) = self.state_file_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                OrchestratorError::Persistence(format!("failed to create state dir: {e}"))
            })?;
        }
        let json = serde_json::to_string_pretty(topology)?;
        let tmp = self.state_file_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| OrchestratorError::Persistence(format!("failed to write state file: {e}")))?;
        tokio::fs::rename(&tmp, &self.state_file_path)
            .await
            .map_err(|e| OrchestratorError::Persistence(format!("failed to replace state file: {e}")))?;
        Ok(())
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> Result<bool> {
    use std::os::unix::io::AsRawFd;

    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(OrchestratorError::Persistence(format!("failed to lock state dir: {err}")))
    }
}

// Only in-process ordering is enforced elsewhere.
#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> Result<bool> {
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::Utc;

    use super::*;
    use crate::models::{
        Chain, EncryptType, Host, HostCredential, ImageType, Node, NodeId, NodeStatus, PortTriple,
    };

    fn test_topology() -> Topology {
        let mut topology = Topology::default();
        let chain = Chain::new(
            "default_chain".into(),
            1,
            EncryptType::Standard,
            "v2.7.2".into(),
            "/opt/fisco".into(),
            "127.0.0.1:5004".into(),
            ImageType::Pull,
        );
        topology.chains.insert(chain.name.clone(), chain);
        topology.hosts.insert(
            0,
            Host::new(
                0,
                "10.0.0.1".into(),
                HostCredential::default(),
                "/opt/fisco".into(),
                "agencyA".into(),
            ),
        );
        let node_id = NodeId::generate();
        topology.nodes.insert(
            node_id.clone(),
            Node {
                node_id,
                chain_name: "default_chain".into(),
                host_id: 0,
                slot: 0,
                ports: PortTriple {
                    jsonrpc: 8545,
                    channel: 20200,
                    p2p: 30300,
                },
                group_ids: BTreeSet::from([1]),
                status: NodeStatus::Running,
                version: "v2.7.2".into(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        );
        topology.next_host_id = 1;
        topology
    }

    #[tokio::test]
    async fn round_trip_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = TopologyStore::new(dir.path());

        let topology = test_topology();
        store.save(&topology).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.chains.len(), 1);
        assert_eq!(loaded.hosts[&0].address, "10.0.0.1");
        let node = loaded.nodes.values().next().unwrap();
        assert_eq!(node.ports.channel, 20200);
        assert_eq!(loaded.next_host_id, 1);
    }

    #[tokio::test]
    async fn load_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = TopologyStore::new(dir.path());
        let loaded = store.load().await.unwrap();
        assert!(loaded.chains.is_empty());
        assert!(loaded.nodes.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("topology.json"), "{not json")
            .await
            .unwrap();
        let store = TopologyStore::new(dir.path());
        assert!(matches!(
            store.load().await,
            Err(OrchestratorError::Persistence(_))
        ));
    }

    #[tokio::test]
    async fn state_uses_camel_case() {
        let dir = tempfile::tempdir().unwrap();
        let store = TopologyStore::new(dir.path());
        store.save(&test_topology()).await.unwrap();

        let json = tokio::fs::read_to_string(dir.path().join("topology.json"))
            .await
            .unwrap();
        assert!(json.contains("\"chainName\""));
        assert!(json.contains("\"groupIds\""));
        assert!(json.contains("\"signServiceAddress\""));
        assert!(!json.contains("\"chain_name\""));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn lock_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let first = TopologyStore::new(dir.path());
        let second = TopologyStore::new(dir.path());

        let held = first.lock().await.unwrap();
        let waiting = tokio::time::timeout(Duration::from_millis(50), second.lock()).await;
        assert!(waiting.is_err());
        drop(held);
        tokio::time::timeout(Duration::from_secs(2), second.lock())
            .await
            .unwrap()
            .unwrap();
    }
}
