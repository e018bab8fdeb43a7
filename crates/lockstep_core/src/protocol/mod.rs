//! # Lockstep Protocol
//!
//! Binary packet definitions for the lockstep exchange.
//!
//! ## Packet Flow
//!
//! ```text
//! CLIENT                              ARBITER
//!   |                                    |
//!   |--- ClientAck(frame N, cmds) ------>|  <- waits for every live client
//!   |                                    |
//!   |<-- ServerTick(frame N+1, merged) --|
//!   |                                    |
//! ```
//!
//! ## Design Philosophy
//!
//! - Fixed-width native-endian fields, no versioning
//! - Explicit command count per packet, explicit length per command
//! - Payloads decoded by a parser installed per instance
//! - Packets are immutable values; no locks travel with them

mod codec;
mod command;
mod packets;

pub use codec::{read_field, write_field, WireReader, WireWriter};
pub use command::{
    Command, CommandHeader, CommandKind, CommandParser, CommandPayload, CommandRegistry,
    EntityId, OpaqueParser, OpaquePayload,
};
pub use packets::{AckHeader, ClientAck, Packet, PacketKind, ServerTick, TickHeader};
