//! # File Server
//!
//! The replication layer. A [`FileServer`] owns a [`Store`], a [`Transport`]
//! and the set of connected peers, and runs the control loop that reacts to
//! inbound messages.
//!
//! ## Protocol
//!
//! - **Store**: the file is written locally, then every peer receives a
//!   `StoreFile` control frame immediately followed by a stream frame carrying
//!   the encrypted bytes. Both are written while holding the peer's writer, so
//!   nothing can interleave between them.
//! - **Receive**: a `StoreFile` message is remembered as the pending transfer
//!   of its sender. The stream notification that follows on the same
//!   connection pulls exactly `size` bytes, decrypts them into the store and
//!   releases the parked read loop.
//! - **Fetch**: a node missing a file broadcasts `GetFile`; any peer holding it
//!   answers with the same `StoreFile` + stream sequence.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use distvault::config::NodeConfig;
//! use distvault::server::make_server;
//! use std::sync::Arc;
//!
//! async fn run_node() -> anyhow::Result<()> {
//!     let mut config = NodeConfig::new(":4000");
//!     config.bootstrap_nodes.push(":3000".to_string());
//!
//!     let server = Arc::new(make_server(&config)?);
//!     let node = server.clone();
//!     tokio::spawn(async move { node.start().await });
//!
//!     server.store_data("picture.jpg", &mut &b"my big data file here"[..]).await?;
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::crypto::{self, IV_LEN, KEY_LEN};
use crate::message::Message;
use crate::p2p::{Peer, Rpc, Transport, TransportError, INCOMING_STREAM};
use crate::storage::{cas_path_transform, PathTransform, Store, StoreOptions};
use crate::tcp::{OnPeer, OnPeerClosed, TcpTransport, TcpTransportOpts};

type PeerMap = Arc<Mutex<HashMap<String, Arc<dyn Peer>>>>;

pub struct ServerOpts {
    /// Namespace of this node's own files; generated when empty
    pub id: String,
    /// Network-wide key for data in flight
    pub enc_key: Vec<u8>,
    pub storage_root: PathBuf,
    pub path_transform: PathTransform,
    pub transport: Arc<dyn Transport>,
    pub bootstrap_nodes: Vec<String>,
    /// How long [`FileServer::get`] waits for a peer to answer
    pub fetch_timeout: Duration,
    /// Stop the control loop on the first handling error
    pub fail_fast: bool,
}

/// A transfer announced by `StoreFile`, waiting for its stream.
#[derive(Debug, Clone)]
struct PendingTransfer {
    id: String,
    key: String,
    size: u64,
}

pub struct FileServer {
    id: String,
    enc_key: Vec<u8>,
    transport: Arc<dyn Transport>,
    bootstrap_nodes: Vec<String>,
    fetch_timeout: Duration,
    fail_fast: bool,
    store: Store,
    peers: PeerMap,
    pending_transfers: Mutex<HashMap<String, PendingTransfer>>,
    pending_fetches: Mutex<HashMap<String, Vec<oneshot::Sender<()>>>>,
    quit_tx: watch::Sender<bool>,
}

impl FileServer {
    pub fn new(opts: ServerOpts) -> Result<Self> {
        if opts.enc_key.len() != KEY_LEN {
            anyhow::bail!("Encryption key must be {} bytes, got {}", KEY_LEN, opts.enc_key.len());
        }

        let id = if opts.id.is_empty() { crypto::generate_id() } else { opts.id };
        let store = Store::new(StoreOptions {
            root: opts.storage_root,
            path_transform: opts.path_transform,
        });
        let (quit_tx, _) = watch::channel(false);

        Ok(Self {
            id,
            enc_key: opts.enc_key,
            transport: opts.transport,
            bootstrap_nodes: opts.bootstrap_nodes,
            fetch_timeout: opts.fetch_timeout,
            fail_fast: opts.fail_fast,
            store,
            peers: Arc::new(Mutex::new(HashMap::new())),
            pending_transfers: Mutex::new(HashMap::new()),
            pending_fetches: Mutex::new(HashMap::new()),
            quit_tx,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn addr(&self) -> String {
        self.transport.addr()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Callback registering newly connected peers in the peer set.
    pub fn peer_registrar(&self) -> OnPeer {
        let peers = self.peers.clone();
        Arc::new(move |peer: Arc<dyn Peer>| -> Result<(), TransportError> {
            let addr = peer.remote_addr();
            peers.lock().insert(addr.to_string(), peer);
            info!("Connected with remote {}", addr);
            Ok(())
        })
    }

    /// Callback removing peers whose connection has ended.
    pub fn peer_remover(&self) -> OnPeerClosed {
        let peers = self.peers.clone();
        Arc::new(move |addr: SocketAddr| {
            if peers.lock().remove(&addr.to_string()).is_some() {
                info!("Disconnected from remote {}", addr);
            }
        })
    }

    /// Store a file locally, then replicate it to every connected peer.
    ///
    /// Peers are served one after the other; the first failure aborts the
    /// broadcast.
    pub async fn store_data<R>(&self, key: &str, reader: &mut R) -> Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut file_buffer = Vec::new();
        reader.read_to_end(&mut file_buffer).await?;

        let size = self.store.write(&self.id, key, &mut file_buffer.as_slice()).await?;
        info!("[{}] stored {} ({} bytes) on local disk", self.addr(), key, size);

        let frame = Message::StoreFile {
            id: self.id.clone(),
            key: key.to_string(),
            size: size + IV_LEN as u64,
        }
        .to_frame()?;

        for peer in self.peer_list() {
            let mut writer = peer.writer().await;
            writer.write_all(&frame).await?;
            writer.write_all(&[INCOMING_STREAM]).await?;
            let n = crypto::copy_encrypt(&self.enc_key, &mut file_buffer.as_slice(), &mut writer).await?;
            writer.flush().await?;

            info!("[{}] sent {} bytes to {}", self.addr(), n, peer.remote_addr());
        }

        Ok(())
    }

    /// Open `key`, fetching it from the network if it is not on local disk.
    pub async fn get(&self, key: &str) -> Result<(u64, File)> {
        if self.store.has(&self.id, key).await? {
            info!("[{}] serving file ({}) from local disk", self.addr(), key);
            return Ok(self.store.read(&self.id, key).await?);
        }

        info!("[{}] don't have file ({}) locally, fetching from network", self.addr(), key);

        let peers = self.peer_list();
        if peers.is_empty() {
            anyhow::bail!("File ({}) not found locally and no peers are connected", key);
        }

        let (tx, rx) = oneshot::channel();
        self.pending_fetches.lock().entry(key.to_string()).or_default().push(tx);

        let frame = Message::GetFile {
            id: self.id.clone(),
            key: key.to_string(),
        }
        .to_frame()?;

        let outcome = match self.broadcast(&peers, &frame).await {
            Ok(()) => timeout(self.fetch_timeout, rx).await,
            Err(e) => {
                drop(rx);
                self.prune_fetch_waiters(key);
                return Err(e);
            }
        };

        match outcome {
            Ok(Ok(())) => Ok(self.store.read(&self.id, key).await?),
            Ok(Err(_)) => Err(anyhow!("Fetch of ({}) was abandoned", key)),
            Err(_) => {
                self.prune_fetch_waiters(key);
                Err(anyhow!("Timed out fetching ({}) from {} peers", key, peers.len()))
            }
        }
    }

    pub async fn has_local(&self, key: &str) -> Result<bool> {
        Ok(self.store.has(&self.id, key).await?)
    }

    pub async fn delete_local(&self, key: &str) -> Result<()> {
        Ok(self.store.delete(&self.id, key).await?)
    }

    /// Listen, dial bootstrap peers, then run the control loop until stopped.
    pub async fn start(&self) -> Result<()> {
        self.listen().await?;
        self.run().await
    }

    /// Start accepting connections and dial the bootstrap peers.
    pub async fn listen(&self) -> Result<()> {
        self.transport.listen_and_accept().await?;
        self.bootstrap();
        Ok(())
    }

    pub fn stop(&self) {
        self.quit_tx.send_replace(true);
    }

    /// Control loop. Returns once [`FileServer::stop`] is called.
    pub async fn run(&self) -> Result<()> {
        let mut rpcs = self.transport.consume()?;
        let mut quit = self.quit_tx.subscribe();

        let result = if *quit.borrow_and_update() {
            Ok(())
        } else {
            loop {
                tokio::select! {
                    _ = quit.changed() => break Ok(()),
                    rpc = rpcs.recv() => {
                        let Some(rpc) = rpc else { break Ok(()) };
                        if let Err(e) = self.handle_rpc(rpc).await {
                            if self.fail_fast {
                                error!("[{}] stopping on message error: {}", self.addr(), e);
                                break Err(e);
                            }
                            warn!("[{}] failed to handle message: {}", self.addr(), e);
                        }
                    }
                }
            }
        };

        info!("[{}] file server stopped", self.addr());
        self.transport.close()?;
        result
    }

    fn bootstrap(&self) {
        for addr in self.bootstrap_nodes.iter().filter(|addr| !addr.is_empty()) {
            let transport = self.transport.clone();
            let addr = addr.clone();
            tokio::spawn(async move {
                info!("Attempting to connect with remote {}", addr);
                if let Err(e) = transport.dial(&addr).await {
                    warn!("Dial error ({}): {}", addr, e);
                }
            });
        }
    }

    async fn handle_rpc(&self, rpc: Rpc) -> Result<()> {
        if rpc.stream {
            return self.handle_incoming_stream(&rpc.from).await;
        }

        let msg = Message::decode(&rpc.payload)?;
        debug!("[{}] received {:?} from {}", self.addr(), msg, rpc.from);

        match msg {
            Message::StoreFile { id, key, size } => self.handle_store_file(&rpc.from, id, key, size),
            Message::GetFile { id, key } => self.handle_get_file(&rpc.from, id, key).await,
        }
    }

    fn handle_store_file(&self, from: &str, id: String, key: String, size: u64) -> Result<()> {
        self.find_peer(from)?;

        let previous = self.pending_transfers.lock().insert(from.to_string(), PendingTransfer { id, key, size });
        if let Some(previous) = previous {
            warn!("[{}] transfer of ({}) from {} never started", self.addr(), previous.key, from);
        }
        Ok(())
    }

    async fn handle_incoming_stream(&self, from: &str) -> Result<()> {
        let peer = self.find_peer(from)?;

        let transfer = self.pending_transfers.lock().remove(from);
        let Some(transfer) = transfer else {
            peer.close_stream();
            anyhow::bail!("Unexpected stream from ({}) without a preceding StoreFile", from);
        };

        let mut stream = peer.stream(transfer.size).await;
        let written = self
            .store
            .write_decrypt(&transfer.id, &self.enc_key, &transfer.key, &mut stream)
            .await;
        if written.is_err() {
            // keep the connection framed: whatever is left belongs to this transfer
            let _ = tokio::io::copy(&mut stream, &mut tokio::io::sink()).await;
        }
        drop(stream);
        peer.close_stream();

        let n = match written {
            Ok(n) => n,
            Err(e) => {
                if let Err(discard_err) = self.store.discard(&transfer.id, &transfer.key).await {
                    debug!("[{}] nothing to discard for ({}): {}", self.addr(), transfer.key, discard_err);
                }
                return Err(e.into());
            }
        };
        info!("[{}] written ({}) {} bytes to disk", self.addr(), transfer.key, n);

        if transfer.id == self.id {
            self.notify_fetch_waiters(&transfer.key);
        }
        Ok(())
    }

    async fn handle_get_file(&self, from: &str, id: String, key: String) -> Result<()> {
        if !self.store.has(&id, &key).await? {
            warn!("[{}] need to serve file ({}) but it does not exist on disk", self.addr(), key);
            return Ok(());
        }

        let peer = self.find_peer(from)?;
        let (size, mut file) = self.store.read(&id, &key).await?;
        info!("[{}] serving file ({}) over the network", self.addr(), key);

        let frame = Message::StoreFile {
            id,
            key,
            size: size + IV_LEN as u64,
        }
        .to_frame()?;

        let mut writer = peer.writer().await;
        writer.write_all(&frame).await?;
        writer.write_all(&[INCOMING_STREAM]).await?;
        let n = crypto::copy_encrypt(&self.enc_key, &mut file, &mut writer).await?;
        writer.flush().await?;

        info!("[{}] written {} bytes over the network to {}", self.addr(), n, from);
        Ok(())
    }

    async fn broadcast(&self, peers: &[Arc<dyn Peer>], frame: &[u8]) -> Result<()> {
        for peer in peers {
            peer.send(frame).await?;
        }
        Ok(())
    }

    fn find_peer(&self, addr: &str) -> Result<Arc<dyn Peer>> {
        self.peers
            .lock()
            .get(addr)
            .cloned()
            .ok_or_else(|| anyhow!("Peer ({}) could not be found in the peer list", addr))
    }

    fn peer_list(&self) -> Vec<Arc<dyn Peer>> {
        self.peers.lock().values().cloned().collect()
    }

    fn notify_fetch_waiters(&self, key: &str) {
        let waiters = self.pending_fetches.lock().remove(key);
        for waiter in waiters.into_iter().flatten() {
            let _ = waiter.send(());
        }
    }

    fn prune_fetch_waiters(&self, key: &str) {
        let mut fetches = self.pending_fetches.lock();
        if let Some(waiters) = fetches.get_mut(key) {
            waiters.retain(|waiter| !waiter.is_closed());
            if waiters.is_empty() {
                fetches.remove(key);
            }
        }
    }
}

/// Wire a [`TcpTransport`] and a [`FileServer`] together from a configuration.
pub fn make_server(config: &NodeConfig) -> Result<FileServer> {
    let transport = TcpTransport::new(TcpTransportOpts {
        rpc_buffer: config.rpc_buffer,
        ..TcpTransportOpts::new(config.listen_addr.clone())
    });

    let server = FileServer::new(ServerOpts {
        id: config.node_id.clone(),
        enc_key: config.encryption_key_bytes()?,
        storage_root: config.storage_root.clone(),
        path_transform: Arc::new(cas_path_transform),
        transport: Arc::new(transport.clone()),
        bootstrap_nodes: config.bootstrap_nodes.clone(),
        fetch_timeout: config.fetch_timeout(),
        fail_fast: config.fail_fast,
    })?;

    transport.set_on_peer(server.peer_registrar());
    transport.set_on_peer_closed(server.peer_remover());

    Ok(server)
}
