//! # TCP Transport
//!
//! [`Transport`] implementation over plain TCP sockets.
//!
//! Every connection runs through the same steps: handshake, registration via
//! the `on_peer` callback, then a read loop that decodes one frame at a time.
//! Control frames go to the inbound channel. A stream frame parks the loop
//! until the replication layer has pulled the raw bytes and calls
//! [`Peer::close_stream`]. The park has no timeout.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::p2p::{DefaultDecoder, Decoder, Frame, Handshake, NopHandshake, Peer, Rpc, Transport, TransportError};

/// Default capacity of the inbound message channel
pub const DEFAULT_RPC_BUFFER: usize = 1024;

/// Called once a connection has passed the handshake. An error drops it.
pub type OnPeer = Arc<dyn Fn(Arc<dyn Peer>) -> Result<(), TransportError> + Send + Sync>;

/// Called when a registered connection's read loop has ended.
pub type OnPeerClosed = Arc<dyn Fn(SocketAddr) + Send + Sync>;

/// Remote node over an established TCP connection
pub struct TcpPeer {
    remote_addr: SocketAddr,
    // dialed => true, accepted => false
    outbound: bool,
    reader: Arc<tokio::sync::Mutex<BufReader<OwnedReadHalf>>>,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    stream_gate: Mutex<Option<oneshot::Sender<()>>>,
}

impl TcpPeer {
    pub fn new(conn: TcpStream, remote_addr: SocketAddr, outbound: bool) -> Self {
        let (read_half, write_half) = conn.into_split();
        Self {
            remote_addr,
            outbound,
            reader: Arc::new(tokio::sync::Mutex::new(BufReader::new(read_half))),
            writer: Arc::new(tokio::sync::Mutex::new(write_half)),
            stream_gate: Mutex::new(None),
        }
    }

    fn park(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *self.stream_gate.lock() = Some(tx);
        rx
    }

    async fn shutdown(&self) {
        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!("Error shutting down connection to {}: {}", self.remote_addr, e);
        }
    }
}

#[async_trait]
impl Peer for TcpPeer {
    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn is_outbound(&self) -> bool {
        self.outbound
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn writer(&self) -> Box<dyn AsyncWrite + Send + Unpin> {
        Box::new(GuardedWriter(self.writer.clone().lock_owned().await))
    }

    async fn stream(&self, size: u64) -> Box<dyn AsyncRead + Send + Unpin> {
        Box::new(GuardedReader(self.reader.clone().lock_owned().await).take(size))
    }

    fn close_stream(&self) {
        match self.stream_gate.lock().take() {
            Some(gate) => {
                let _ = gate.send(());
            }
            None => warn!("[{}] close_stream called without a parked stream", self.remote_addr),
        }
    }
}

struct GuardedReader(OwnedMutexGuard<BufReader<OwnedReadHalf>>);

impl AsyncRead for GuardedReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().0).poll_read(cx, buf)
    }
}

struct GuardedWriter(OwnedMutexGuard<OwnedWriteHalf>);

impl AsyncWrite for GuardedWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().0).poll_shutdown(cx)
    }
}

#[derive(Clone)]
pub struct TcpTransportOpts {
    /// `host:port`, or Go-style `:port` to bind every interface
    pub listen_addr: String,
    pub handshake: Arc<dyn Handshake>,
    pub decoder: Arc<dyn Decoder>,
    pub on_peer: Option<OnPeer>,
    pub on_peer_closed: Option<OnPeerClosed>,
    pub rpc_buffer: usize,
}

impl TcpTransportOpts {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            handshake: Arc::new(NopHandshake),
            decoder: Arc::new(DefaultDecoder),
            on_peer: None,
            on_peer_closed: None,
            rpc_buffer: DEFAULT_RPC_BUFFER,
        }
    }
}

#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<Inner>,
}

struct Inner {
    listen_addr: String,
    handshake: Arc<dyn Handshake>,
    decoder: Arc<dyn Decoder>,
    on_peer: RwLock<Option<OnPeer>>,
    on_peer_closed: RwLock<Option<OnPeerClosed>>,
    local_addr: RwLock<Option<SocketAddr>>,
    rpc_tx: mpsc::Sender<Rpc>,
    rpc_rx: Mutex<Option<mpsc::Receiver<Rpc>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl TcpTransport {
    pub fn new(opts: TcpTransportOpts) -> Self {
        let (rpc_tx, rpc_rx) = mpsc::channel(opts.rpc_buffer.max(1));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                listen_addr: opts.listen_addr,
                handshake: opts.handshake,
                decoder: opts.decoder,
                on_peer: RwLock::new(opts.on_peer),
                on_peer_closed: RwLock::new(opts.on_peer_closed),
                local_addr: RwLock::new(None),
                rpc_tx,
                rpc_rx: Mutex::new(Some(rpc_rx)),
                shutdown_tx,
            }),
        }
    }

    pub fn set_on_peer(&self, on_peer: OnPeer) {
        *self.inner.on_peer.write() = Some(on_peer);
    }

    pub fn set_on_peer_closed(&self, on_peer_closed: OnPeerClosed) {
        *self.inner.on_peer_closed.write() = Some(on_peer_closed);
    }

    /// Address actually bound by [`Transport::listen_and_accept`].
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.read()
    }

    fn is_closed(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    async fn accept_loop(self, listener: TcpListener) {
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        if *shutdown.borrow_and_update() {
            return;
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                result = listener.accept() => match result {
                    Ok((conn, addr)) => {
                        debug!("New incoming connection from {}", addr);
                        let transport = self.clone();
                        tokio::spawn(async move { transport.handle_conn(conn, false).await });
                    }
                    Err(e) => warn!("TCP accept error: {}", e),
                },
            }
        }
    }

    async fn handle_conn(self, conn: TcpStream, outbound: bool) {
        let remote_addr = match conn.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Dropping connection without a peer address: {}", e);
                return;
            }
        };
        let peer = Arc::new(TcpPeer::new(conn, remote_addr, outbound));

        if let Err(e) = self.inner.handshake.handshake(peer.as_ref()).await {
            warn!("Dropping peer connection {}: {}", remote_addr, e);
            return;
        }

        let on_peer = self.inner.on_peer.read().clone();
        if let Some(on_peer) = on_peer {
            let registered: Arc<dyn Peer> = peer.clone();
            if let Err(e) = on_peer(registered) {
                warn!("Dropping peer connection {}: {}", remote_addr, e);
                return;
            }
        }

        match self.read_loop(&peer).await {
            Ok(()) => debug!("Read loop for {} stopped", remote_addr),
            Err(TransportError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("Connection closed by {}", remote_addr)
            }
            Err(e) => warn!("Dropping peer connection {}: {}", remote_addr, e),
        }

        let on_peer_closed = self.inner.on_peer_closed.read().clone();
        if let Some(on_peer_closed) = on_peer_closed {
            on_peer_closed(remote_addr);
        }
        peer.shutdown().await;
    }

    async fn read_loop(&self, peer: &TcpPeer) -> Result<(), TransportError> {
        let from = peer.remote_addr.to_string();
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        if *shutdown.borrow_and_update() {
            return Ok(());
        }

        loop {
            let frame = {
                let mut reader = peer.reader.lock().await;
                tokio::select! {
                    _ = shutdown.changed() => return Ok(()),
                    frame = self.inner.decoder.decode(&mut *reader) => frame?,
                }
            };

            match frame {
                Frame::Message(payload) => {
                    let rpc = Rpc { from: from.clone(), payload, stream: false };
                    if !self.deliver(rpc, &mut shutdown).await {
                        return Ok(());
                    }
                }
                Frame::Stream => {
                    // the gate must be armed before anyone can learn about the stream
                    let released = peer.park();
                    let rpc = Rpc { from: from.clone(), payload: Vec::new(), stream: true };
                    if !self.deliver(rpc, &mut shutdown).await {
                        return Ok(());
                    }

                    debug!("[{}] incoming stream, waiting...", from);
                    tokio::select! {
                        _ = shutdown.changed() => return Ok(()),
                        _ = released => {}
                    }
                    debug!("[{}] stream closed, resuming read loop", from);
                }
            }
        }
    }

    /// Push onto the inbound channel, blocking while it is full.
    async fn deliver(&self, rpc: Rpc, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = shutdown.changed() => false,
            sent = self.inner.rpc_tx.send(rpc) => sent.is_ok(),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn addr(&self) -> String {
        match self.local_addr() {
            Some(addr) => addr.to_string(),
            None => self.inner.listen_addr.clone(),
        }
    }

    async fn dial(&self, addr: &str) -> Result<(), TransportError> {
        let conn = TcpStream::connect(dial_addr(addr)).await?;

        let transport = self.clone();
        tokio::spawn(async move { transport.handle_conn(conn, true).await });
        Ok(())
    }

    async fn listen_and_accept(&self) -> Result<(), TransportError> {
        let listener = TcpListener::bind(bind_addr(&self.inner.listen_addr)).await?;
        let local_addr = listener.local_addr()?;
        *self.inner.local_addr.write() = Some(local_addr);

        tokio::spawn(self.clone().accept_loop(listener));

        info!("TCP transport listening on {}", local_addr);
        Ok(())
    }

    fn consume(&self) -> Result<mpsc::Receiver<Rpc>, TransportError> {
        self.inner.rpc_rx.lock().take().ok_or(TransportError::AlreadyConsumed)
    }

    fn close(&self) -> Result<(), TransportError> {
        if !self.is_closed() {
            self.inner.shutdown_tx.send_replace(true);
            info!("TCP transport {} closed", self.addr());
        }
        Ok(())
    }
}

fn bind_addr(addr: &str) -> String {
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{}", port),
        None => addr.to_string(),
    }
}

fn dial_addr(addr: &str) -> String {
    match addr.strip_prefix(':') {
        Some(port) => format!("127.0.0.1:{}", port),
        None => addr.to_string(),
    }
}
