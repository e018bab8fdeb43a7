//! # LOCKSTEP Core
//!
//! Wire format and timing model shared by the lockstep client and arbiter.
//!
//! ## Contents
//!
//! - **Protocol**: bounded field codec, [`Command`], [`ServerTick`],
//!   [`ClientAck`] and the [`Packet`] envelope
//! - **Jitter**: [`JitterCalculator`], the exponential moving average that
//!   sizes the client's tick buffer
//! - **Clock**: [`MonotonicClock`], nanosecond timestamps for packets
//!
//! Nothing in this crate performs I/O or spawns threads.
//!
//! ## Example
//!
//! ```rust
//! use lockstep_core::{Command, OpaqueParser, OpaquePayload, Packet, ServerTick};
//!
//! let mut tick = ServerTick::new(1, 100_000_000, 42);
//! tick.commands.push(Command::new(3, None, OpaquePayload(vec![1, 2])));
//!
//! let bytes = Packet::from(tick.clone()).encode_to_vec(64 * 1024).unwrap();
//! assert_eq!(Packet::decode(&bytes, &OpaqueParser).unwrap(), Packet::Tick(tick));
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod clock;
pub mod error;
pub mod jitter;
pub mod protocol;

pub use clock::MonotonicClock;
pub use error::{CodecError, CodecResult, JitterError};
pub use jitter::JitterCalculator;
pub use protocol::{
    ClientAck, Command, CommandKind, CommandParser, CommandPayload, CommandRegistry, EntityId,
    OpaqueParser, OpaquePayload, Packet, PacketKind, ServerTick, WireReader, WireWriter,
};

/// Default tick period: 100 ms (10 Hz).
pub const DEFAULT_TICK_PERIOD_NS: u64 = 100_000_000;

/// Default jitter smoothing factor.
pub const DEFAULT_JITTER_ALPHA: f64 = 0.1;

/// Default maximum packet size: 64 KiB.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 64 * 1024;
