//! # Transport Abstraction
//!
//! This module defines what the replication layer needs from a network:
//! - [`Peer`]: one live connection to a remote node
//! - [`Transport`]: something that dials, accepts and yields classified messages
//! - [`Handshake`]: a pre-condition run on every new connection
//! - [`Decoder`]: turns the wire into [`Frame`]s
//!
//! ## Wire Framing
//!
//! Every unit on a connection starts with one type byte:
//!
//! - `0x1` ([`INCOMING_MESSAGE`]): a `u32` big-endian length, then the payload
//! - `0x2` ([`INCOMING_STREAM`]): no payload; raw bytes of a transfer follow and
//!   are read by the replication layer, not by the decoder
//!
//! The TCP implementation lives in [`crate::tcp`]; anything implementing these
//! traits can replace it without touching [`crate::server`].

use async_trait::async_trait;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;

pub const INCOMING_MESSAGE: u8 = 0x1;
pub const INCOMING_STREAM: u8 = 0x2;

/// Largest control payload the default decoder accepts
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),
    #[error("peer rejected: {0}")]
    PeerRejected(String),
    #[error("unknown frame type {0:#04x}")]
    UnknownFrame(u8),
    #[error("message of {0} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit")]
    MessageTooLarge(usize),
    #[error("inbound message channel already consumed")]
    AlreadyConsumed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A classified inbound frame, tagged with the sender's address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rpc {
    pub from: String,
    pub payload: Vec<u8>,
    /// Set when a raw stream follows; the sender's read loop is parked until
    /// [`Peer::close_stream`] is called
    pub stream: bool,
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message(Vec<u8>),
    Stream,
}

/// A remote node reachable over an established connection.
#[async_trait]
pub trait Peer: Send + Sync {
    fn remote_addr(&self) -> SocketAddr;

    /// `true` if we dialed, `false` if we accepted.
    fn is_outbound(&self) -> bool;

    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Exclusive writer, held for multi-part sends that must not interleave.
    async fn writer(&self) -> Box<dyn AsyncWrite + Send + Unpin>;

    /// Read exactly the next `size` bytes off the connection. Only meaningful
    /// while the read loop is parked on a stream frame.
    async fn stream(&self, size: u64) -> Box<dyn AsyncRead + Send + Unpin>;

    /// Release a read loop parked on a stream frame.
    fn close_stream(&self);
}

/// Handles communication between nodes (TCP, UDP, websockets, ...).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bound address once listening, the configured one before that.
    fn addr(&self) -> String;

    async fn dial(&self, addr: &str) -> Result<(), TransportError>;

    async fn listen_and_accept(&self) -> Result<(), TransportError>;

    /// Hand out the receiving end of the inbound channel. Can be taken once.
    fn consume(&self) -> Result<mpsc::Receiver<Rpc>, TransportError>;

    fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Handshake: Send + Sync {
    async fn handshake(&self, peer: &dyn Peer) -> Result<(), TransportError>;
}

/// Accepts every connection.
pub struct NopHandshake;

#[async_trait]
impl Handshake for NopHandshake {
    async fn handshake(&self, _peer: &dyn Peer) -> Result<(), TransportError> {
        Ok(())
    }
}

#[async_trait]
pub trait Decoder: Send + Sync {
    async fn decode(&self, reader: &mut (dyn AsyncRead + Unpin + Send)) -> Result<Frame, TransportError>;
}

/// Length-prefixed framing described in the module docs.
pub struct DefaultDecoder;

#[async_trait]
impl Decoder for DefaultDecoder {
    async fn decode(&self, reader: &mut (dyn AsyncRead + Unpin + Send)) -> Result<Frame, TransportError> {
        let kind = reader.read_u8().await?;
        match kind {
            INCOMING_STREAM => Ok(Frame::Stream),
            INCOMING_MESSAGE => {
                let len = reader.read_u32().await? as usize;
                if len > MAX_MESSAGE_SIZE {
                    return Err(TransportError::MessageTooLarge(len));
                }
                let mut payload = vec![0u8; len];
                reader.read_exact(&mut payload).await?;
                Ok(Frame::Message(payload))
            }
            other => Err(TransportError::UnknownFrame(other)),
        }
    }
}

/// Build a control frame around `payload`.
pub fn encode_message(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 5);
    frame.push(INCOMING_MESSAGE);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}
