use std::path::Path;

use crate::error::{OrchestratorError, Result};
use crate::models::{OrchestratorConfig, PortPlan};

pub const CONFIG_FILENAME: &str = ".lo-orchestrator.yaml";

/// Load and validate `.lo-orchestrator.yaml` from `dir`.
pub fn load(dir: &Path) -> Result<OrchestratorConfig> {
    let config_path = dir.join(CONFIG_FILENAME);
    if !config_path.exists() {
        return Err(OrchestratorError::ConfigNotFound(config_path));
    }
    let contents = std::fs::read_to_string(&config_path)?;
    parse(&contents)
}

pub fn parse(contents: &str) -> Result<OrchestratorConfig> {
    let config: OrchestratorConfig = serde_yaml::from_str(contents)
        .map_err(|e| OrchestratorError::InvalidConfig(e.to_string()))?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &OrchestratorConfig) -> Result<()> {
    if config.root_dir_on_host.trim().is_empty() {
        return Err(OrchestratorError::InvalidConfig(
            "root_dir_on_host is required".into(),
        ));
    }
    validate_port_plan(&config.ports)
}

/// Every category's port range must fit in u16 and stay clear of the others.
fn validate_port_plan(plan: &PortPlan) -> Result<()> {
    if plan.stride == 0 || plan.max_slots_per_host == 0 {
        return Err(OrchestratorError::InvalidConfig(
            "ports.stride and ports.max_slots_per_host must be positive".into(),
        ));
    }
    let span = (plan.max_slots_per_host as u32 - 1) * plan.stride as u32;
    let mut ranges = [
        ("jsonrpc", plan.jsonrpc_base as u32),
        ("channel", plan.channel_base as u32),
        ("p2p", plan.p2p_base as u32),
    ]
    .map(|(name, base)| (name, base, base + span));
    ranges.sort_by_key(|r| r.1);

    for (name, _, last) in &ranges {
        if *last > u16::MAX as u32 {
            return Err(OrchestratorError::InvalidConfig(format!(
                "{name} ports overflow at slot {}",
                plan.max_slots_per_host - 1
            )));
        }
    }
    for pair in ranges.windows(2) {
        let (lo_name, _, lo_last) = pair[0];
        let (hi_name, hi_base, _) = pair[1];
        if lo_last >= hi_base {
            return Err(OrchestratorError::InvalidConfig(format!(
                "{lo_name} port range overlaps {hi_name} port range"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use crate::models::{EncryptType, ImageType};

    #[test]
    fn parse_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
root_dir_on_host: /data/chains
sign_service_address: 10.0.0.9:5004
encrypt_type: guomi
image_type: manual
ports:
  jsonrpc_base: 8545
  channel_base: 20200
  p2p_base: 30300
  stride: 2
  max_slots_per_host: 50
retry:
  max_attempts: 5
ssh:
  user: deploy
  port: 2222
reconcile_interval_secs: 60
"#;
        fs::write(dir.path().join(CONFIG_FILENAME), yaml).unwrap();
        let config = load(dir.path()).unwrap();
        assert_eq!(config.root_dir_on_host, "/data/chains");
        assert_eq!(config.encrypt_type, EncryptType::Guomi);
        assert_eq!(config.image_type, ImageType::Manual);
        assert_eq!(config.ports.stride, 2);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 200);
        assert_eq!(config.ssh.user, "deploy");
        assert_eq!(config.reconcile_interval_secs, 60);
    }

    #[test]
    fn parse_minimal_config() {
        let config = parse("root_dir_on_host: /opt/fisco\n").unwrap();
        assert_eq!(config.ports.jsonrpc_base, 8545);
        assert_eq!(config.ports.max_slots_per_host, 100);
        assert_eq!(config.chain_id, 1);
    }

    #[test]
    fn missing_config_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load(dir.path()),
            Err(OrchestratorError::ConfigNotFound(_))
        ));
    }

    #[test]
    fn overlapping_port_ranges_are_rejected() {
        let yaml = "ports:\n  jsonrpc_base: 20000\n  channel_base: 20050\n  p2p_base: 30300\n";
        let err = parse(yaml).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidConfig(m) if m.contains("overlaps")));
    }

    #[test]
    fn overflowing_port_range_is_rejected() {
        let yaml = "ports:\n  p2p_base: 65500\n";
        assert!(matches!(
            parse(yaml),
            Err(OrchestratorError::InvalidConfig(_))
        ));
    }
}
