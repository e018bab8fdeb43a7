//! # Networking Error Types
//!
//! Errors raised by transports, configuration loading and the lockstep
//! endpoints.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use lockstep_core::{CodecError, JitterError};
use thiserror::Error;

/// Errors raised by a transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// No session is open.
    #[error("not connected")]
    NotConnected,

    /// The remote side refused the session.
    #[error("connection refused: {0}")]
    Refused(String),

    /// The peer is not (or no longer) connected.
    #[error("unknown peer: {0}")]
    UnknownPeer(SocketAddr),

    /// A frame exceeds the configured maximum packet size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Frame size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The transport has been shut down.
    #[error("transport closed")]
    Closed,

    /// Underlying socket error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// Configuration file is not valid TOML for this schema.
    #[error("invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised by the lockstep client and arbiter.
#[derive(Error, Debug)]
pub enum NetError {
    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Packet could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Jitter estimator rejected its input.
    #[error("jitter estimator: {0}")]
    Jitter(#[from] JitterError),

    /// Configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A command can never fit in one ack.
    #[error("command {kind} needs {needed} bytes, ack limit is {limit}")]
    CommandTooLarge {
        /// Command kind.
        kind: u16,
        /// Bytes an ack carrying only this command would need.
        needed: usize,
        /// Configured `max_packet_size`.
        limit: usize,
    },

    /// The endpoint was already started.
    #[error("already running")]
    AlreadyRunning,

    /// A worker thread could not be spawned.
    #[error("cannot spawn {name} thread: {source}")]
    Spawn {
        /// Thread name.
        name: &'static str,
        /// Underlying error.
        source: io::Error,
    },
}

/// Result type for lockstep endpoint operations.
pub type NetResult<T> = Result<T, NetError>;
