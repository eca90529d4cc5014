//! Per-node configuration artifacts and the on-host layout they follow.
//!
//! Layout under `<host root>/<chain>/`:
//!
//! ```text
//! chain/chain.json            chain descriptor shared by every node
//! chain/group.<g>.genesis     one genesis file per consensus group
//! node<slot>/node.json        typed manifest (schema, identity, slot, ports, groups)
//! node<slot>/config.ini       ledger process configuration (ports, chain refs)
//! node<slot>/conf/node.nodeid identity
//! node<slot>/conf/groups      group membership, one id per line
//! ```
//!
//! `node.json` is the read-back contract: [`NodeConfig::read`] recovers the
//! identity, slot and ports from it and cross-checks the directory name and
//! identity file.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::allocator::Allocation;
use super::executor::DeploymentExecutor;
use crate::error::{OrchestratorError, Result};
use crate::models::{Chain, EncryptType, GroupId, Host, Node, NodeId, PortTriple};

pub const LAYOUT_SCHEMA_VERSION: u32 = 1;
pub const CHAIN_MATERIAL_DIR: &str = "chain";
pub const MANIFEST_FILE: &str = "node.json";
pub const IDENTITY_FILE: &str = "conf/node.nodeid";
pub const GROUPS_FILE: &str = "conf/groups";
pub const LEDGER_CONFIG_FILE: &str = "config.ini";

static NODE_DIR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^node(\d+)$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeManifest {
    pub schema: u32,
    pub chain_name: String,
    pub node_id: NodeId,
    pub slot: u16,
    pub ports: PortTriple,
    pub group_ids: BTreeSet<GroupId>,
}

/// One file of an artifact, path relative to the artifact's root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFile {
    pub path: String,
    pub contents: Vec<u8>,
}

impl ArtifactFile {
    fn text(path: impl Into<String>, contents: String) -> Self {
        Self {
            path: path.into(),
            contents: contents.into_bytes(),
        }
    }
}

/// A set of files destined for one directory on a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigArtifact {
    pub chain_name: String,
    /// Directory name under the chain directory, e.g. `node0` or `chain`.
    pub dir_name: String,
    pub files: Vec<ArtifactFile>,
}

impl ConfigArtifact {
    pub fn file(&self, path: &str) -> Option<&ArtifactFile> {
        self.files.iter().find(|f| f.path == path)
    }

    /// Local staging directory for this artifact.
    pub fn staging_path(&self, staging_root: &Path, host: &Host) -> PathBuf {
        staging_root
            .join(&self.chain_name)
            .join(&host.address)
            .join(&self.dir_name)
    }

    /// Destination directory on the host.
    pub fn remote_path(&self, host: &Host) -> String {
        format!(
            "{}/{}/{}",
            host.root_dir.trim_end_matches('/'),
            self.chain_name,
            self.dir_name
        )
    }
}

/// Identity, slot, ports and groups recovered from a published node directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub slot: u16,
    pub ports: PortTriple,
    pub group_ids: BTreeSet<GroupId>,
}

impl NodeConfig {
    pub fn read(node_dir: &Path) -> Result<NodeConfig> {
        let parse_err = |reason: String| OrchestratorError::PortParse {
            path: node_dir.display().to_string(),
            reason,
        };

        let dir_name = node_dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| parse_err("node directory has no name".into()))?;
        let slot: u16 = NODE_DIR_RE
            .captures(dir_name)
            .and_then(|c| c[1].parse().ok())
            .ok_or_else(|| parse_err(format!("'{dir_name}' is not a node<slot> directory")))?;

        let manifest_raw = std::fs::read_to_string(node_dir.join(MANIFEST_FILE))
            .map_err(|e| parse_err(format!("reading {MANIFEST_FILE}: {e}")))?;
        let manifest: NodeManifest = serde_json::from_str(&manifest_raw)
            .map_err(|e| parse_err(format!("decoding {MANIFEST_FILE}: {e}")))?;
        if manifest.schema != LAYOUT_SCHEMA_VERSION {
            return Err(parse_err(format!(
                "unsupported layout schema {}",
                manifest.schema
            )));
        }
        if manifest.slot != slot {
            return Err(parse_err(format!(
                "manifest slot {} does not match directory slot {slot}",
                manifest.slot
            )));
        }

        let identity = std::fs::read_to_string(node_dir.join(IDENTITY_FILE))
            .map_err(|e| parse_err(format!("reading {IDENTITY_FILE}: {e}")))?;
        if NodeId::parse(&identity).as_ref() != Some(&manifest.node_id) {
            return Err(parse_err("identity file disagrees with manifest".into()));
        }

        Ok(NodeConfig {
            node_id: manifest.node_id,
            slot,
            ports: manifest.ports,
            group_ids: manifest.group_ids,
        })
    }
}

/// Renders artifacts, stages them locally, and publishes them to hosts.
pub struct ConfigGenerator {
    staging_dir: PathBuf,
}

impl ConfigGenerator {
    pub fn new(staging_dir: PathBuf) -> Self {
        Self { staging_dir }
    }

    /// Where `node`'s artifact is staged for `host`; what [`NodeConfig::read`] reads back.
    pub fn staged_node_dir(&self, host: &Host, node: &Node) -> PathBuf {
        self.staging_dir
            .join(&node.chain_name)
            .join(&host.address)
            .join(node.dir_name())
    }

    pub fn staged_chain_dir(&self, chain_name: &str) -> PathBuf {
        self.staging_dir.join(chain_name)
    }

    /// Chain-level shared material, rendered once per chain.
    pub fn generate_chain_material(
        &self,
        chain: &Chain,
        group_ids: &BTreeSet<GroupId>,
    ) -> Result<ConfigArtifact> {
        if group_ids.is_empty() {
            return Err(OrchestratorError::Validation(format!(
                "chain '{}' has no groups",
                chain.name
            )));
        }
        let descriptor = serde_json::json!({
            "schema": LAYOUT_SCHEMA_VERSION,
            "chainName": chain.name,
            "chainId": chain.chain_id,
            "encryptType": chain.encrypt_type,
            "signServiceAddress": chain.sign_service_address,
        });
        let mut files = vec![ArtifactFile::text(
            "chain.json",
            serde_json::to_string_pretty(&descriptor)? + "\n",
        )];
        for group in group_ids {
            files.push(ArtifactFile::text(
                format!("group.{group}.genesis"),
                render_genesis(chain, *group),
            ));
        }
        Ok(ConfigArtifact {
            chain_name: chain.name.clone(),
            dir_name: CHAIN_MATERIAL_DIR.into(),
            files,
        })
    }

    pub fn generate(
        &self,
        chain: &Chain,
        allocation: &Allocation,
        group_ids: &BTreeSet<GroupId>,
    ) -> Result<ConfigArtifact> {
        let manifest = NodeManifest {
            schema: LAYOUT_SCHEMA_VERSION,
            chain_name: chain.name.clone(),
            node_id: allocation.node_id.clone(),
            slot: allocation.slot,
            ports: allocation.ports,
            group_ids: group_ids.clone(),
        };
        validate_manifest(&manifest)?;

        let groups: String = group_ids.iter().map(|g| format!("{g}\n")).collect();
        let files = vec![
            ArtifactFile::text(IDENTITY_FILE, format!("{}\n", manifest.node_id)),
            ArtifactFile::text(GROUPS_FILE, groups),
            ArtifactFile::text(LEDGER_CONFIG_FILE, render_ledger_config(chain, &manifest)),
            ArtifactFile::text(
                MANIFEST_FILE,
                serde_json::to_string_pretty(&manifest)? + "\n",
            ),
        ];
        Ok(ConfigArtifact {
            chain_name: chain.name.clone(),
            dir_name: format!("node{}", allocation.slot),
            files,
        })
    }

    /// Write the artifact under the staging directory, replacing stale files.
    pub async fn stage(&self, host: &Host, artifact: &ConfigArtifact) -> Result<PathBuf> {
        let dir = artifact.staging_path(&self.staging_dir, host);
        for file in &artifact.files {
            let path = dir.join(&file.path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &file.contents).await?;
        }
        Ok(dir)
    }

    /// Stage locally, then copy onto the host. Safe to repeat after a partial failure.
    pub async fn publish(
        &self,
        executor: &DeploymentExecutor,
        host: &Host,
        artifact: &ConfigArtifact,
    ) -> Result<()> {
        let local = self
            .stage(host, artifact)
            .await
            .map_err(|e| OrchestratorError::RemoteWrite {
                host: host.address.clone(),
                reason: format!("staging {}: {e}", artifact.dir_name),
            })?;
        executor
            .upload(host, &local, &artifact.remote_path(host))
            .await?;
        tracing::debug!(host = %host.address, chain = %artifact.chain_name, dir = %artifact.dir_name, "published config");
        Ok(())
    }
}

fn validate_manifest(manifest: &NodeManifest) -> Result<()> {
    let ports = manifest.ports.as_array();
    if ports[0] == ports[1] || ports[1] == ports[2] || ports[0] == ports[2] {
        return Err(OrchestratorError::Validation(format!(
            "node {} has colliding ports {ports:?}",
            manifest.node_id.short()
        )));
    }
    if manifest.group_ids.is_empty() {
        return Err(OrchestratorError::Validation(format!(
            "node {} joins no group",
            manifest.node_id.short()
        )));
    }
    Ok(())
}

fn render_genesis(chain: &Chain, group: GroupId) -> String {
    format!(
        "[consensus]\n    consensus_type=pbft\n    max_trans_num=1000\n\
         [state]\n    type=storage\n\
         [tx]\n    gas_limit=300000000\n\
         [group]\n    id={group}\n    timestamp={}\n\
         [evm]\n    enable_free_storage=false\n",
        chain.created_at.timestamp_millis()
    )
}

fn render_ledger_config(chain: &Chain, manifest: &NodeManifest) -> String {
    let (sm_crypto, ca_cert) = match chain.encrypt_type {
        EncryptType::Standard => ("false", "ca.crt"),
        EncryptType::Guomi => ("true", "gmca.crt"),
    };
    format!(
        "[rpc]\n    channel_listen_ip=0.0.0.0\n    channel_listen_port={channel}\n    \
         jsonrpc_listen_ip=127.0.0.1\n    jsonrpc_listen_port={jsonrpc}\n\
         [p2p]\n    listen_ip=0.0.0.0\n    listen_port={p2p}\n\
         [chain]\n    id={chain_id}\n    sm_crypto={sm_crypto}\n\
         [group]\n    group_data_path=data/\n    group_config_path=../{material}/\n\
         [network_security]\n    data_path=conf/\n    key=node.key\n    cert=node.crt\n    \
         ca_cert=../{material}/{ca_cert}\n",
        channel = manifest.ports.channel,
        jsonrpc = manifest.ports.jsonrpc,
        p2p = manifest.ports.p2p,
        chain_id = chain.chain_id,
        material = CHAIN_MATERIAL_DIR,
    )
}
