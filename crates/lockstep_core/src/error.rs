//! # Core Error Types
//!
//! All errors that can occur while encoding, decoding or estimating jitter.

use thiserror::Error;

/// Errors produced by the wire codec.
///
/// Any of these aborts the packet being processed; callers never receive a
/// partially decoded packet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A write would run past the end of the buffer.
    #[error("buffer overflow: need {needed} bytes at offset {offset}, capacity {capacity}")]
    Overflow {
        /// Bytes the field needed.
        needed: usize,
        /// Offset the write started at.
        offset: usize,
        /// Total buffer capacity.
        capacity: usize,
    },

    /// A read would run past the end of the buffer.
    #[error("truncated buffer: need {needed} bytes at offset {offset}, length {len}")]
    Truncated {
        /// Bytes the field needed.
        needed: usize,
        /// Offset the read started at.
        offset: usize,
        /// Total buffer length.
        len: usize,
    },

    /// The packet discriminator byte is not a known packet kind.
    #[error("unknown packet kind: {0}")]
    UnknownPacketKind(u8),

    /// The installed parser does not know this command kind.
    #[error("unknown command kind: {0}")]
    UnknownCommand(u16),

    /// The parser consumed a different number of bytes than the header announced.
    #[error("command {kind} payload mismatch: header says {declared} bytes, parser consumed {consumed}")]
    PayloadMismatch {
        /// Command kind being decoded.
        kind: u16,
        /// Payload length from the command header.
        declared: usize,
        /// Bytes the parser actually consumed.
        consumed: usize,
    },

    /// A command payload does not fit the 16-bit length field.
    #[error("command payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// A packet holds more commands than the 16-bit count field allows.
    #[error("too many commands in one packet: {0}")]
    TooManyCommands(usize),

    /// Bytes remain after the last announced command.
    #[error("{0} trailing bytes after last command")]
    TrailingBytes(usize),

    /// The parser rejected the payload bytes.
    #[error("malformed payload for command {kind}: {reason}")]
    MalformedPayload {
        /// Command kind being decoded.
        kind: u16,
        /// Parser supplied reason.
        reason: String,
    },
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors produced by the jitter estimator.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum JitterError {
    /// Smoothing factor outside the open interval (0, 1).
    #[error("smoothing factor must be in (0, 1), got {0}")]
    InvalidAlpha(f64),

    /// Timestamps must be strictly increasing.
    #[error("non-monotonic timestamp: {current} ns after {previous} ns")]
    NonMonotonic {
        /// Last accepted timestamp.
        previous: u64,
        /// Rejected timestamp.
        current: u64,
    },
}
