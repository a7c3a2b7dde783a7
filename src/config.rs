//! # Configuration Management
//!
//! This module handles a node's TOML configuration:
//! - Node identity (the namespace its files are stored under)
//! - Listen address and bootstrap peers
//! - The network-wide encryption key
//! - Tuning knobs for the transport and the control loop
//!
//! Every node of one network must carry the same `encryption_key`; it is what
//! lets a receiver decrypt a replicated stream.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crypto::{self, KEY_LEN};
use crate::tcp::DEFAULT_RPC_BUFFER;

/// Main configuration structure for a DistVault node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    pub listen_addr: String,
    pub storage_root: PathBuf,
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,
    /// Hex encoded 32 byte key
    pub encryption_key: String,
    #[serde(default = "default_rpc_buffer")]
    pub rpc_buffer: usize,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// Stop the control loop on the first message handling error
    #[serde(default)]
    pub fail_fast: bool,

    #[serde(skip)]
    pub config_file_path: PathBuf,
}

fn default_rpc_buffer() -> usize {
    DEFAULT_RPC_BUFFER
}

fn default_fetch_timeout_ms() -> u64 {
    5_000
}

impl NodeConfig {
    /// Fresh configuration with a new node id and encryption key.
    pub fn new(listen_addr: impl Into<String>) -> Self {
        let listen_addr = listen_addr.into();
        let storage_root = PathBuf::from(format!("{}_network", listen_addr.replace(':', "")));

        Self {
            node_id: crypto::generate_id(),
            listen_addr,
            storage_root,
            bootstrap_nodes: Vec::new(),
            encryption_key: hex::encode(crypto::new_encryption_key()),
            rpc_buffer: default_rpc_buffer(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            fail_fast: false,
            config_file_path: PathBuf::new(),
        }
    }

    /// Create a new configuration and write it to `path`.
    pub async fn init(path: &Path, listen_addr: impl Into<String>) -> Result<Self> {
        if path.exists() {
            anyhow::bail!("Configuration already exists at {}", path.display());
        }

        let mut config = Self::new(listen_addr);
        config.config_file_path = path.to_path_buf();
        config.save().await?;

        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("No configuration at {}. Run 'distvault init' first.", path.display());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let mut config: NodeConfig = toml::from_str(&content)?;
        config.config_file_path = path.to_path_buf();
        config.encryption_key_bytes()?;

        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_file_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(&self.config_file_path, content).await?;
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    pub fn encryption_key_bytes(&self) -> Result<Vec<u8>> {
        let key = hex::decode(&self.encryption_key)
            .map_err(|e| anyhow!("Invalid encryption key encoding: {}", e))?;
        if key.len() != KEY_LEN {
            anyhow::bail!("Encryption key must be {} bytes, got {}", KEY_LEN, key.len());
        }
        Ok(key)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}
