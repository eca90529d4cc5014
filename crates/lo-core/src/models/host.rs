use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type HostId = u32;

/// How the orchestrator authenticates its remote-execution channel to a host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HostCredential {
    pub user: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,
}

impl Default for HostCredential {
    fn default() -> Self {
        Self {
            user: "root".into(),
            port: 22,
            identity_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub id: HostId,
    pub address: String,
    pub credential: HostCredential,
    pub root_dir: String,
    pub agency: String,
    pub reachable: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probed_at: Option<DateTime<Utc>>,
}

impl Host {
    pub fn new(
        id: HostId,
        address: String,
        credential: HostCredential,
        root_dir: String,
        agency: String,
    ) -> Self {
        Self {
            id,
            address,
            credential,
            root_dir,
            agency,
            reachable: true,
            created_at: Utc::now(),
            last_probed_at: None,
        }
    }

    /// `user@address` target understood by ssh/scp.
    pub fn ssh_target(&self) -> String {
        format!("{}@{}", self.credential.user, self.address)
    }
}
