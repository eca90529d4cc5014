// Each test binary compiles this module independently and uses a different
// subset of helpers, so unused-function warnings are expected.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use lo_core::models::{OrchestratorConfig, RetrySettings};
use lo_core::services::fake::FakeExecutor;
use lo_core::services::lifecycle::{ChainManager, DeployRequest};

/// A manager over `dir` with retries that never sleep.
pub fn manager(fake: &FakeExecutor, dir: &Path) -> ChainManager {
    let config = OrchestratorConfig {
        retry: RetrySettings {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        },
        ..OrchestratorConfig::default()
    };
    ChainManager::new(config, dir, Arc::new(fake.clone()))
}

pub fn deploy_request(chain: &str, hosts: &[&str]) -> DeployRequest {
    DeployRequest {
        chain_name: chain.into(),
        host_list: hosts.iter().map(|h| h.to_string()).collect(),
        version: "v2.9.0".into(),
        ..DeployRequest::default()
    }
}
