use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use super::chain::{EncryptType, ImageType};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub root_dir_on_host: String,
    pub staging_dir: PathBuf,
    pub state_dir: PathBuf,
    pub sign_service_address: String,
    pub chain_id: u32,
    pub encrypt_type: EncryptType,
    pub image_type: ImageType,
    pub docker_image: String,
    pub ports: PortPlan,
    pub ssh: SshSettings,
    pub retry: RetrySettings,
    pub action_timeout_secs: u64,
    pub reconcile_interval_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            root_dir_on_host: "/opt/fisco".into(),
            staging_dir: PathBuf::from(".lo/staging"),
            state_dir: PathBuf::from(".lo/state"),
            sign_service_address: "127.0.0.1:5004".into(),
            chain_id: 1,
            encrypt_type: EncryptType::Standard,
            image_type: ImageType::Pull,
            docker_image: "fiscoorg/fisco-webase".into(),
            ports: PortPlan::default(),
            ssh: SshSettings::default(),
            retry: RetrySettings::default(),
            action_timeout_secs: 120,
            reconcile_interval_secs: 30,
        }
    }
}

impl OrchestratorConfig {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }
}

/// Base port per category plus the per-slot stride.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortPlan {
    pub jsonrpc_base: u16,
    pub channel_base: u16,
    pub p2p_base: u16,
    pub stride: u16,
    pub max_slots_per_host: u16,
}

impl Default for PortPlan {
    fn default() -> Self {
        Self {
            jsonrpc_base: 8545,
            channel_base: 20200,
            p2p_base: 30300,
            stride: 1,
            max_slots_per_host: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub user: String,
    pub port: u16,
    pub identity_file: Option<String>,
    pub connect_timeout_secs: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: "root".into(),
            port: 22,
            identity_file: None,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the first attempt for transient connectivity failures.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}
