use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ChainStatus {
    Uninitialized,
    Deploying,
    Running,
    Upgrading,
    Stopped,
    Deleting,
    Deleted,
}

impl ChainStatus {
    /// Whether the lifecycle graph has an edge from `self` to `next`.
    pub fn can_transition_to(self, next: ChainStatus) -> bool {
        use ChainStatus::*;
        matches!(
            (self, next),
            (Uninitialized, Deploying)
                | (Deploying, Running)
                | (Deploying, Stopped)
                | (Running, Stopped)
                | (Stopped, Running)
                | (Running, Upgrading)
                | (Upgrading, Running)
                | (Running, Deleting)
                | (Stopped, Deleting)
                | (Deleting, Deleted)
        )
    }
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Deploying => "DEPLOYING",
            Self::Running => "RUNNING",
            Self::Upgrading => "UPGRADING",
            Self::Stopped => "STOPPED",
            Self::Deleting => "DELETING",
            Self::Deleted => "DELETED",
        };
        f.write_str(label)
    }
}

/// Cryptographic scheme the chain's nodes are built with.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EncryptType {
    #[default]
    Standard,
    Guomi,
}

impl EncryptType {
    pub fn as_flag(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Guomi => "guomi",
        }
    }
}

/// How node images reach a host: pulled from a registry, or preloaded by the operator.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ImageType {
    #[default]
    Pull,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chain {
    pub name: String,
    pub chain_id: u32,
    pub encrypt_type: EncryptType,
    pub version: String,
    pub root_dir: String,
    pub sign_service_address: String,
    pub image_type: ImageType,
    pub status: ChainStatus,
    /// Version an in-flight or halted upgrade is rolling out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_target: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chain {
    pub fn new(
        name: String,
        chain_id: u32,
        encrypt_type: EncryptType,
        version: String,
        root_dir: String,
        sign_service_address: String,
        image_type: ImageType,
    ) -> Self {
        let now = Utc::now();
        Self {
            name,
            chain_id,
            encrypt_type,
            version,
            root_dir,
            sign_service_address,
            image_type,
            status: ChainStatus::Uninitialized,
            upgrade_target: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Directory under a host root holding this chain's shared material and node dirs.
    pub fn chain_dir_on(&self, host_root: &str) -> String {
        format!("{}/{}", host_root.trim_end_matches('/'), self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deploy_path_is_legal() {
        use ChainStatus::*;
        assert!(Uninitialized.can_transition_to(Deploying));
        assert!(Deploying.can_transition_to(Running));
        assert!(Running.can_transition_to(Upgrading));
        assert!(Upgrading.can_transition_to(Running));
        assert!(Stopped.can_transition_to(Deleting));
        assert!(Deleting.can_transition_to(Deleted));
    }

    #[test]
    fn illegal_edges_are_rejected() {
        use ChainStatus::*;
        assert!(!Running.can_transition_to(Deploying));
        assert!(!Upgrading.can_transition_to(Stopped));
        assert!(!Deleted.can_transition_to(Running));
        assert!(!Uninitialized.can_transition_to(Running));
    }

    #[test]
    fn chain_dir_trims_trailing_slash() {
        let chain = Chain::new(
            "default_chain".into(),
            1,
            EncryptType::Standard,
            "v2.7.2".into(),
            "/opt/fisco/".into(),
            "127.0.0.1:5004".into(),
            ImageType::Pull,
        );
        assert_eq!(chain.chain_dir_on(&chain.root_dir), "/opt/fisco/default_chain");
        assert_eq!(chain.status, ChainStatus::Uninitialized);
    }
}
