//! # Packet Definitions
//!
//! The two packets of the lockstep protocol.
//!
//! ## Packet Structure
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Kind (1)                                                     │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Header (32): frame + three u64 fields, kind specific         │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Command count (2)                                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Commands (header + payload, back to back)                    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The explicit command count means a truncated packet is reported as
//! truncated instead of being mistaken for a shorter command list.

use bytemuck::{Pod, Zeroable};

use super::codec::{WireReader, WireWriter};
use super::command::{Command, CommandParser};
use crate::error::{CodecError, CodecResult};

/// Types of packets in the protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    /// Server -> Client: authoritative tick with merged commands.
    Tick = 1,
    /// Client -> Server: acknowledgement carrying local commands.
    Ack = 2,
}

impl TryFrom<u8> for PacketKind {
    type Error = CodecError;

    fn try_from(value: u8) -> CodecResult<Self> {
        match value {
            1 => Ok(Self::Tick),
            2 => Ok(Self::Ack),
            other => Err(CodecError::UnknownPacketKind(other)),
        }
    }
}

/// Fixed part of a [`ServerTick`].
///
/// Size: 32 bytes
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct TickHeader {
    /// Frame number.
    pub frame: u64,
    /// Server tick period in nanoseconds.
    pub tick_period_ns: u64,
    /// Server clock when the tick was produced.
    pub server_timestamp_ns: u64,
    /// Arbiter-measured latency to the receiving client.
    pub ping_ns: u64,
}

/// Fixed part of a [`ClientAck`].
///
/// Size: 32 bytes
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct AckHeader {
    /// Frame of the tick being acknowledged.
    pub frame: u64,
    /// Client clock when the ack was sent.
    pub client_timestamp_ns: u64,
    /// Server timestamp echoed from the acknowledged tick.
    pub server_timestamp_ns: u64,
    /// Client jitter estimate in nanoseconds.
    pub jitter_ns: u64,
}

/// Authoritative tick broadcast by the arbiter.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServerTick {
    /// Frame number, +1 per tick.
    pub frame: u64,
    /// Server tick period in nanoseconds.
    pub tick_period_ns: u64,
    /// Server clock when the tick was produced.
    pub server_timestamp_ns: u64,
    /// Arbiter-measured latency to the receiving client.
    pub ping_ns: u64,
    /// Merged commands of every client, in arrival order.
    pub commands: Vec<Command>,
}

impl ServerTick {
    /// Creates an empty tick.
    #[must_use]
    pub const fn new(frame: u64, tick_period_ns: u64, server_timestamp_ns: u64) -> Self {
        Self {
            frame,
            tick_period_ns,
            server_timestamp_ns,
            ping_ns: 0,
            commands: Vec::new(),
        }
    }

    /// Returns a copy addressed to one client, carrying its ping.
    ///
    /// Commands are shared with `self`, not deep-copied.
    #[must_use]
    pub fn with_ping(&self, ping_ns: u64) -> Self {
        Self {
            ping_ns,
            ..self.clone()
        }
    }

    /// Number of bytes the body occupies on the wire (kind byte excluded).
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        std::mem::size_of::<TickHeader>() + commands_len(&self.commands)
    }

    /// Writes header and commands.
    pub fn write_to(&self, writer: &mut WireWriter<'_>) -> CodecResult<()> {
        writer.write_pod(&TickHeader {
            frame: self.frame,
            tick_period_ns: self.tick_period_ns,
            server_timestamp_ns: self.server_timestamp_ns,
            ping_ns: self.ping_ns,
        })?;
        write_commands(writer, &self.commands)
    }

    /// Reads header and commands.
    pub fn read_from(reader: &mut WireReader<'_>, parser: &dyn CommandParser) -> CodecResult<Self> {
        let header: TickHeader = reader.read_pod()?;
        let commands = read_commands(reader, parser)?;
        Ok(Self {
            frame: header.frame,
            tick_period_ns: header.tick_period_ns,
            server_timestamp_ns: header.server_timestamp_ns,
            ping_ns: header.ping_ns,
            commands,
        })
    }
}

/// Client acknowledgement of a tick.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientAck {
    /// Frame of the tick being acknowledged.
    pub frame: u64,
    /// Client clock when the ack was sent.
    pub client_timestamp_ns: u64,
    /// Server timestamp echoed from the acknowledged tick.
    pub server_timestamp_ns: u64,
    /// Client jitter estimate in nanoseconds.
    pub jitter_ns: u64,
    /// Commands generated locally since the previous ack.
    pub commands: Vec<Command>,
}

impl ClientAck {
    /// Number of bytes the body occupies on the wire (kind byte excluded).
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        std::mem::size_of::<AckHeader>() + commands_len(&self.commands)
    }

    /// Writes header and commands.
    pub fn write_to(&self, writer: &mut WireWriter<'_>) -> CodecResult<()> {
        writer.write_pod(&AckHeader {
            frame: self.frame,
            client_timestamp_ns: self.client_timestamp_ns,
            server_timestamp_ns: self.server_timestamp_ns,
            jitter_ns: self.jitter_ns,
        })?;
        write_commands(writer, &self.commands)
    }

    /// Reads header and commands.
    pub fn read_from(reader: &mut WireReader<'_>, parser: &dyn CommandParser) -> CodecResult<Self> {
        let header: AckHeader = reader.read_pod()?;
        let commands = read_commands(reader, parser)?;
        Ok(Self {
            frame: header.frame,
            client_timestamp_ns: header.client_timestamp_ns,
            server_timestamp_ns: header.server_timestamp_ns,
            jitter_ns: header.jitter_ns,
            commands,
        })
    }
}

/// Any packet of the protocol.
#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    /// Server -> Client tick.
    Tick(ServerTick),
    /// Client -> Server acknowledgement.
    Ack(ClientAck),
}

impl Packet {
    /// Smallest valid packet: kind, header and an empty command list.
    pub const MIN_SIZE: usize = 1 + 32 + 2;

    /// Returns the packet kind.
    #[must_use]
    pub const fn kind(&self) -> PacketKind {
        match self {
            Self::Tick(_) => PacketKind::Tick,
            Self::Ack(_) => PacketKind::Ack,
        }
    }

    /// Returns the frame number.
    #[must_use]
    pub const fn frame(&self) -> u64 {
        match self {
            Self::Tick(tick) => tick.frame,
            Self::Ack(ack) => ack.frame,
        }
    }

    /// Number of bytes [`Packet::encode`] writes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Self::Tick(tick) => tick.encoded_len(),
            Self::Ack(ack) => ack.encoded_len(),
        }
    }

    /// Encodes into `buffer`, returning the number of bytes written.
    ///
    /// On error the buffer may hold a partial packet, but nothing past its
    /// capacity is touched.
    pub fn encode(&self, buffer: &mut [u8]) -> CodecResult<usize> {
        let mut writer = WireWriter::new(buffer);
        writer.write_u8(self.kind() as u8)?;
        match self {
            Self::Tick(tick) => tick.write_to(&mut writer)?,
            Self::Ack(ack) => ack.write_to(&mut writer)?,
        }
        Ok(writer.len())
    }

    /// Encodes into a fresh vector no larger than `max_size` bytes.
    pub fn encode_to_vec(&self, max_size: usize) -> CodecResult<Vec<u8>> {
        let needed = self.encoded_len();
        if needed > max_size {
            return Err(CodecError::Overflow {
                needed,
                offset: 0,
                capacity: max_size,
            });
        }
        let mut buf = vec![0u8; needed];
        let written = self.encode(&mut buf)?;
        buf.truncate(written);
        Ok(buf)
    }

    /// Decodes a complete packet.
    ///
    /// The whole buffer must be consumed; leftover bytes are an error.
    pub fn decode(bytes: &[u8], parser: &dyn CommandParser) -> CodecResult<Self> {
        let mut reader = WireReader::new(bytes);
        let kind = PacketKind::try_from(reader.read_u8()?)?;
        let packet = match kind {
            PacketKind::Tick => Self::Tick(ServerTick::read_from(&mut reader, parser)?),
            PacketKind::Ack => Self::Ack(ClientAck::read_from(&mut reader, parser)?),
        };
        match reader.remaining() {
            0 => Ok(packet),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}

impl From<ServerTick> for Packet {
    fn from(tick: ServerTick) -> Self {
        Self::Tick(tick)
    }
}

impl From<ClientAck> for Packet {
    fn from(ack: ClientAck) -> Self {
        Self::Ack(ack)
    }
}

fn commands_len(commands: &[Command]) -> usize {
    2 + commands.iter().map(Command::encoded_len).sum::<usize>()
}

fn write_commands(writer: &mut WireWriter<'_>, commands: &[Command]) -> CodecResult<()> {
    let count =
        u16::try_from(commands.len()).map_err(|_| CodecError::TooManyCommands(commands.len()))?;
    writer.write_u16(count)?;
    for command in commands {
        command.write_to(writer)?;
    }
    Ok(())
}

fn read_commands(reader: &mut WireReader<'_>, parser: &dyn CommandParser) -> CodecResult<Vec<Command>> {
    let count = reader.read_u16()?;
    // Each command needs at least its header; do not trust the count for allocation.
    let capacity = usize::from(count).min(reader.remaining() / 8);
    let mut commands = Vec::with_capacity(capacity);
    for _ in 0..count {
        commands.push(Command::read_from(reader, parser)?);
    }
    Ok(commands)
}
