//! # Transport Layer
//!
//! Reliable, ordered, connection-oriented delivery of opaque byte buffers.
//!
//! ## Design
//!
//! The lockstep endpoints only see the two traits below. Addresses are used
//! as opaque per-peer keys and never interpreted.
//!
//! - [`tcp`]: length-prefixed frames over TCP, one reader thread per socket
//! - [`memory`]: in-process channels, with hooks to break links in tests

mod framing;
pub mod memory;
pub mod tcp;

pub use framing::{read_frame, write_frame, FRAME_HEADER_SIZE};
pub use memory::{MemoryClientTransport, MemoryNetwork, MemoryServerTransport};
pub use tcp::{TcpClientTransport, TcpServerTransport};

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::TransportResult;

/// Event delivered by a [`ServerTransport`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peer opened a session.
    Connected(SocketAddr),
    /// A peer's session ended, for any reason.
    Disconnected(SocketAddr),
    /// A peer sent a buffer.
    Received(SocketAddr, Vec<u8>),
}

/// Event delivered by a [`ClientTransport`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    /// The arbiter sent a buffer.
    Received(Vec<u8>),
    /// The session ended.
    Disconnected,
}

/// Accepting side of the transport, shared by the arbiter's network and
/// timer loops.
pub trait ServerTransport: Send + Sync + 'static {
    /// Waits up to `timeout` for the next event.
    ///
    /// Returns [`crate::TransportError::Closed`] once the transport is shut
    /// down.
    fn poll(&self, timeout: Duration) -> TransportResult<Option<TransportEvent>>;

    /// Sends one buffer to a peer.
    fn send(&self, peer: SocketAddr, bytes: &[u8]) -> TransportResult<()>;

    /// Closes a peer's session. A [`TransportEvent::Disconnected`] follows.
    fn disconnect(&self, peer: SocketAddr);

    /// Closes every session and stops accepting new ones.
    fn shutdown(&self);
}

/// Connecting side of the transport, owned by the client's network loop.
pub trait ClientTransport: Send + 'static {
    /// Opens a session to the arbiter, closing any previous one.
    fn connect(&mut self) -> TransportResult<()>;

    /// Waits up to `timeout` for the next event.
    fn poll(&mut self, timeout: Duration) -> TransportResult<Option<LinkEvent>>;

    /// Sends one buffer to the arbiter.
    fn send(&mut self, bytes: &[u8]) -> TransportResult<()>;

    /// Closes the session, if any.
    fn disconnect(&mut self);

    /// Returns true while a session is open.
    fn is_connected(&self) -> bool;
}
