//! # DistVault
//!
//! A peer-to-peer encrypted file storage network built in Rust.
//!
//! Independent nodes form a mesh over TCP. Any node can store a file locally
//! and replicate it to every connected peer, and any node can fetch a file
//! from its own disk or, transparently, from a peer that holds it. Data in
//! flight is encrypted with AES-256-CTR under a key shared by the network.
//!
//! ## Core Modules
//!
//! - [`crypto`] - Stream cipher and identity generation
//! - [`storage`] - Content-addressable on-disk store
//! - [`p2p`] - Transport, peer, handshake and decoder abstractions
//! - [`tcp`] - TCP implementation of the transport
//! - [`message`] - Control messages exchanged between nodes
//! - [`server`] - Replication protocol
//! - [`config`] - Node configuration
//! - [`cli`] - Command-line interface
//!
//! ## Quick Start
//!
//! ```bash
//! # First node
//! distvault -c a.toml init --listen :3000
//!
//! # Second node, sharing the first node's network key
//! distvault -c b.toml init --listen :4000 --bootstrap :3000 --key <hex key>
//!
//! distvault -c a.toml serve
//! distvault -c b.toml put picture.jpg ./picture.jpg
//! ```

pub mod cli;
pub mod config;
pub mod crypto;
pub mod message;
pub mod p2p;
pub mod server;
pub mod storage;
pub mod tcp;

pub use config::NodeConfig;
pub use server::{make_server, FileServer, ServerOpts};
pub use storage::{Store, StoreOptions};
