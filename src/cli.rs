//! # Command Line Interface
//!
//! This module provides the command-line interface for DistVault.
//!
//! ## Commands
//!
//! - `init` - Write a node configuration with a fresh identity and network key
//! - `serve` - Run the node until interrupted
//! - `put` - Store a file on the network
//! - `get` - Fetch a file from local disk or the network

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::crypto::KEY_LEN;
use crate::server::{make_server, FileServer};

/// How long `put` and `get` wait for bootstrap peers to connect
const PEER_WAIT: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "distvault")]
#[command(about = "A peer-to-peer encrypted file storage network")]
#[command(version)]
pub struct Cli {
    /// Path to the node configuration
    #[arg(short, long, global = true, default_value = "distvault.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a new node configuration
    Init {
        /// Address to listen on, `host:port` or `:port`
        #[arg(short, long, default_value = ":3000")]
        listen: String,
        /// Peers to dial on startup (repeatable)
        #[arg(short, long)]
        bootstrap: Vec<String>,
        /// Hex network key shared with the other nodes; generated when omitted
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Run the node until Ctrl-C
    Serve,

    /// Store a file and replicate it to connected peers
    Put {
        /// Key to store the file under
        key: String,
        /// File to upload
        file: PathBuf,
    },

    /// Fetch a file by key
    Get {
        key: String,
        /// Write to this path instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

pub async fn init(path: &Path, listen: String, bootstrap: Vec<String>, key: Option<String>) -> Result<()> {
    let mut config = NodeConfig::init(path, listen).await?;

    let mut dirty = !bootstrap.is_empty();
    config.bootstrap_nodes = bootstrap;
    if let Some(key) = key {
        config.encryption_key = key.to_lowercase();
        config
            .encryption_key_bytes()
            .with_context(|| format!("--key must be {} hex encoded bytes", KEY_LEN))?;
        dirty = true;
    }
    if dirty {
        config.save().await?;
    }

    info!("Configuration initialized at: {}", config.config_path().display());

    println!("{} DistVault node initialized", "✔".green());
    println!("Node ID:      {}", config.node_id);
    println!("Listen:       {}", config.listen_addr);
    println!("Storage root: {}", config.storage_root.display());
    println!("Network key:  {}", config.encryption_key.dimmed());
    Ok(())
}

pub async fn serve(path: &Path) -> Result<()> {
    let config = NodeConfig::load(path).await?;
    let server = Arc::new(make_server(&config)?);
    server.listen().await?;

    println!("{} serving on {} (node {})", "DistVault".bold(), server.addr(), short_id(server.id()));

    let node = server.clone();
    let control = tokio::spawn(async move { node.run().await });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    server.stop();

    control.await??;
    Ok(())
}

pub async fn put(path: &Path, key: &str, file: &Path) -> Result<()> {
    let config = NodeConfig::load(path).await?;
    let mut source = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("Failed to open {}", file.display()))?;

    let (server, control) = connect(config).await?;
    let result = server.store_data(key, &mut source).await;
    let peers = server.peer_count();
    shutdown(&server, control).await?;
    result?;

    println!("{} stored {} on local disk and {} peer(s)", "✔".green(), key.bold(), peers);
    Ok(())
}

pub async fn get(path: &Path, key: &str, output: Option<PathBuf>) -> Result<()> {
    let config = NodeConfig::load(path).await?;

    let (server, control) = connect(config).await?;
    let result = copy_out(&server, key, output.as_deref()).await;
    shutdown(&server, control).await?;
    let size = result?;

    if let Some(output) = output {
        println!("{} wrote {} bytes to {}", "✔".green(), size, output.display());
    }
    Ok(())
}

async fn copy_out(server: &FileServer, key: &str, output: Option<&Path>) -> Result<u64> {
    let (_, mut file) = server.get(key).await?;

    let n = match output {
        Some(path) => {
            let mut dst = tokio::fs::File::create(path).await?;
            let n = tokio::io::copy(&mut file, &mut dst).await?;
            dst.flush().await?;
            n
        }
        None => {
            let mut stdout = tokio::io::stdout();
            let n = tokio::io::copy(&mut file, &mut stdout).await?;
            stdout.flush().await?;
            n
        }
    };
    Ok(n)
}

/// Start a short-lived node on an ephemeral port and give the bootstrap peers
/// a moment to connect.
async fn connect(mut config: NodeConfig) -> Result<(Arc<FileServer>, JoinHandle<Result<()>>)> {
    config.listen_addr = "127.0.0.1:0".to_string();
    let expected = config.bootstrap_nodes.iter().filter(|addr| !addr.is_empty()).count();

    let server = Arc::new(make_server(&config)?);
    server.listen().await?;

    let node = server.clone();
    let control = tokio::spawn(async move { node.run().await });

    let deadline = tokio::time::Instant::now() + PEER_WAIT;
    while server.peer_count() < expected && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if server.peer_count() < expected {
        warn!("Only {} of {} bootstrap peers connected", server.peer_count(), expected);
    }

    Ok((server, control))
}

async fn shutdown(server: &FileServer, control: JoinHandle<Result<()>>) -> Result<()> {
    server.stop();
    control.await?
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_put() {
        let cli = Cli::try_parse_from(["distvault", "-c", "node.toml", "put", "picture.jpg", "/tmp/pic"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("node.toml"));
        match cli.command {
            Commands::Put { key, file } => {
                assert_eq!(key, "picture.jpg");
                assert_eq!(file, PathBuf::from("/tmp/pic"));
            }
            _ => panic!("expected put"),
        }
    }

    #[test]
    fn test_parse_init_defaults() {
        let cli = Cli::try_parse_from(["distvault", "init", "-b", ":3000", "-b", ":4000"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("distvault.toml"));
        match cli.command {
            Commands::Init { listen, bootstrap, key } => {
                assert_eq!(listen, ":3000");
                assert_eq!(bootstrap, vec![":3000".to_string(), ":4000".to_string()]);
                assert!(key.is_none());
            }
            _ => panic!("expected init"),
        }
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("abcdef0123456789"), "abcdef012345");
        assert_eq!(short_id("abc"), "abc");
    }

    #[tokio::test]
    async fn test_init_with_shared_key() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("node.toml");
        let key = hex::encode([7u8; KEY_LEN]);

        init(&path, ":5000".to_string(), vec![":3000".to_string()], Some(key.clone()))
            .await
            .unwrap();

        let config = NodeConfig::load(&path).await.unwrap();
        assert_eq!(config.encryption_key, key);
        assert_eq!(config.bootstrap_nodes, vec![":3000".to_string()]);
    }

    #[tokio::test]
    async fn test_init_rejects_bad_key() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("node.toml");
        assert!(init(&path, ":5000".to_string(), Vec::new(), Some("abcd".to_string())).await.is_err());
    }
}
