//! # Commands
//!
//! A command is one unit of game intent: a numeric kind, an optional
//! originating entity and an opaque payload owned by the host application.
//!
//! ## Wire Layout
//!
//! ```text
//! ┌───────────┬──────────────────┬─────────────┬─────────────────────┐
//! │ kind (2)  │ payload_len (2)  │ entity (4)  │ payload (len bytes) │
//! └───────────┴──────────────────┴─────────────┴─────────────────────┘
//! ```
//!
//! The core only understands the header. Payload bytes are produced by the
//! payload itself and decoded by the [`CommandParser`] installed on the
//! client or server instance.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use super::codec::{WireReader, WireWriter};
use crate::error::{CodecError, CodecResult};

/// Numeric command discriminator. Meaning is owned by the host application.
pub type CommandKind = u16;

/// Identifier of the entity a command originates from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EntityId(pub u32);

impl EntityId {
    /// Wire value meaning "no entity".
    pub const NONE: Self = Self(u32::MAX);

    /// Returns true if this is the "no entity" sentinel.
    #[inline]
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == u32::MAX
    }
}

/// Fixed command header.
///
/// Size: 8 bytes
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct CommandHeader {
    /// Command kind.
    pub kind: u16,
    /// Number of payload bytes following the header.
    pub payload_len: u16,
    /// Originating entity, `u32::MAX` for none.
    pub entity: u32,
}

impl CommandHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 8;
}

/// Host-owned command payload.
///
/// Payloads are immutable once constructed and shared between packets
/// through `Arc`, never deep-copied.
pub trait CommandPayload: Send + Sync + fmt::Debug + 'static {
    /// Number of bytes [`CommandPayload::encode`] writes.
    fn encoded_len(&self) -> usize;

    /// Writes the payload bytes.
    fn encode(&self, writer: &mut WireWriter<'_>) -> CodecResult<()>;

    /// Upcast used by hosts to recover their concrete payload type.
    fn as_any(&self) -> &dyn Any;
}

/// Decodes command payloads for a given kind.
///
/// One parser is installed per client or server instance. The reader passed
/// to [`CommandParser::parse`] is bounded to exactly the payload bytes of one
/// command; the parser must consume all of them.
pub trait CommandParser: Send + Sync {
    /// Decodes the payload of a command of the given kind.
    fn parse(&self, kind: CommandKind, reader: &mut WireReader<'_>)
        -> CodecResult<Arc<dyn CommandPayload>>;
}

/// A serializable unit of game intent.
#[derive(Clone)]
pub struct Command {
    kind: CommandKind,
    entity: EntityId,
    payload: Arc<dyn CommandPayload>,
}

impl Command {
    /// Creates a command owning a fresh payload.
    pub fn new<P: CommandPayload>(kind: CommandKind, entity: Option<EntityId>, payload: P) -> Self {
        Self::from_shared(kind, entity, Arc::new(payload))
    }

    /// Creates a command around an already shared payload.
    #[must_use]
    pub fn from_shared(
        kind: CommandKind,
        entity: Option<EntityId>,
        payload: Arc<dyn CommandPayload>,
    ) -> Self {
        Self {
            kind,
            entity: entity.unwrap_or(EntityId::NONE),
            payload,
        }
    }

    /// Returns the command kind.
    #[inline]
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Returns the originating entity, if any.
    #[inline]
    #[must_use]
    pub fn entity(&self) -> Option<EntityId> {
        (!self.entity.is_none()).then_some(self.entity)
    }

    /// Returns the payload.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &dyn CommandPayload {
        self.payload.as_ref()
    }

    /// Returns the payload as a concrete type, if it is one.
    #[must_use]
    pub fn payload_as<T: 'static>(&self) -> Option<&T> {
        self.payload.as_any().downcast_ref::<T>()
    }

    /// Returns true if both commands share the same payload allocation.
    #[must_use]
    pub fn shares_payload_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.payload, &other.payload)
    }

    /// Number of bytes [`Command::write_to`] writes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        CommandHeader::SIZE + self.payload.encoded_len()
    }

    /// Encodes only the payload bytes.
    pub fn payload_bytes(&self) -> CodecResult<Vec<u8>> {
        let mut buf = vec![0u8; self.payload.encoded_len()];
        let mut writer = WireWriter::new(&mut buf);
        self.payload.encode(&mut writer)?;
        let written = writer.len();
        buf.truncate(written);
        Ok(buf)
    }

    /// Writes header and payload.
    pub fn write_to(&self, writer: &mut WireWriter<'_>) -> CodecResult<()> {
        let declared = self.payload.encoded_len();
        let payload_len =
            u16::try_from(declared).map_err(|_| CodecError::PayloadTooLarge(declared))?;

        writer.write_pod(&CommandHeader {
            kind: self.kind,
            payload_len,
            entity: self.entity.0,
        })?;

        let start = writer.len();
        self.payload.encode(writer)?;
        let consumed = writer.len() - start;
        if consumed != declared {
            return Err(CodecError::PayloadMismatch {
                kind: self.kind,
                declared,
                consumed,
            });
        }
        Ok(())
    }

    /// Reads header and payload, decoding the payload with `parser`.
    pub fn read_from(reader: &mut WireReader<'_>, parser: &dyn CommandParser) -> CodecResult<Self> {
        let header: CommandHeader = reader.read_pod()?;
        let declared = usize::from(header.payload_len);
        let bytes = reader.read_slice(declared)?;

        let mut payload_reader = WireReader::new(bytes);
        let payload = parser.parse(header.kind, &mut payload_reader)?;
        if payload_reader.remaining() != 0 {
            return Err(CodecError::PayloadMismatch {
                kind: header.kind,
                declared,
                consumed: payload_reader.position(),
            });
        }

        Ok(Self {
            kind: header.kind,
            entity: EntityId(header.entity),
            payload,
        })
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("kind", &self.kind)
            .field("entity", &self.entity())
            .field("payload", &self.payload)
            .finish()
    }
}

impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        if self.kind != other.kind || self.entity != other.entity {
            return false;
        }
        if self.shares_payload_with(other) {
            return true;
        }
        match (self.payload_bytes(), other.payload_bytes()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

/// Payload kept as raw bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpaquePayload(pub Vec<u8>);

impl CommandPayload for OpaquePayload {
    fn encoded_len(&self) -> usize {
        self.0.len()
    }

    fn encode(&self, writer: &mut WireWriter<'_>) -> CodecResult<()> {
        writer.write_bytes(&self.0).map(drop)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Parser that accepts every kind and keeps the payload bytes verbatim.
///
/// Useful for relays and tools that forward commands without understanding
/// them.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpaqueParser;

impl CommandParser for OpaqueParser {
    fn parse(
        &self,
        _kind: CommandKind,
        reader: &mut WireReader<'_>,
    ) -> CodecResult<Arc<dyn CommandPayload>> {
        let bytes = reader.read_slice(reader.remaining())?;
        Ok(Arc::new(OpaquePayload(bytes.to_vec())))
    }
}

type DecodeFn =
    Box<dyn Fn(&mut WireReader<'_>) -> CodecResult<Arc<dyn CommandPayload>> + Send + Sync>;

/// Parser built from per-kind decode functions.
///
/// Kinds without a registered decoder fail with [`CodecError::UnknownCommand`].
#[derive(Default)]
pub struct CommandRegistry {
    decoders: HashMap<CommandKind, DecodeFn>,
}

impl CommandRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the decoder for `kind`, replacing any previous one.
    pub fn register<P, F>(&mut self, kind: CommandKind, decode: F) -> &mut Self
    where
        P: CommandPayload,
        F: Fn(&mut WireReader<'_>) -> CodecResult<P> + Send + Sync + 'static,
    {
        self.decoders.insert(
            kind,
            Box::new(move |reader: &mut WireReader<'_>| {
                decode(reader).map(|p| Arc::new(p) as Arc<dyn CommandPayload>)
            }),
        );
        self
    }

    /// Returns true if `kind` has a decoder.
    #[must_use]
    pub fn contains(&self, kind: CommandKind) -> bool {
        self.decoders.contains_key(&kind)
    }
}

impl CommandParser for CommandRegistry {
    fn parse(
        &self,
        kind: CommandKind,
        reader: &mut WireReader<'_>,
    ) -> CodecResult<Arc<dyn CommandPayload>> {
        let decode = self
            .decoders
            .get(&kind)
            .ok_or(CodecError::UnknownCommand(kind))?;
        decode(reader)
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.decoders.keys().copied().collect();
        kinds.sort_unstable();
        f.debug_struct("CommandRegistry").field("kinds", &kinds).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Move {
        dx: i32,
        dy: i32,
    }

    impl CommandPayload for Move {
        fn encoded_len(&self) -> usize {
            8
        }

        fn encode(&self, writer: &mut WireWriter<'_>) -> CodecResult<()> {
            writer.write_u32(self.dx as u32)?;
            writer.write_u32(self.dy as u32)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn registry() -> CommandRegistry {
        let mut registry = CommandRegistry::new();
        registry.register(1, |r| {
            Ok(Move {
                dx: r.read_u32()? as i32,
                dy: r.read_u32()? as i32,
            })
        });
        registry
    }

    #[test]
    fn test_command_roundtrip() {
        let cmd = Command::new(1, Some(EntityId(42)), Move { dx: -3, dy: 9 });
        let mut buf = [0u8; 64];
        let mut writer = WireWriter::new(&mut buf);
        cmd.write_to(&mut writer).unwrap();
        let len = writer.len();
        assert_eq!(len, cmd.encoded_len());

        let mut reader = WireReader::new(&buf[..len]);
        let decoded = Command::read_from(&mut reader, &registry()).unwrap();
        assert_eq!(decoded.kind(), 1);
        assert_eq!(decoded.entity(), Some(EntityId(42)));
        assert_eq!(decoded.payload_as::<Move>(), Some(&Move { dx: -3, dy: 9 }));
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn test_command_without_entity() {
        let cmd = Command::new(7, None, OpaquePayload(vec![1, 2, 3]));
        let mut buf = [0u8; 16];
        let mut writer = WireWriter::new(&mut buf);
        cmd.write_to(&mut writer).unwrap();
        let len = writer.len();

        let decoded = Command::read_from(&mut WireReader::new(&buf[..len]), &OpaqueParser).unwrap();
        assert_eq!(decoded.entity(), None);
        assert_eq!(decoded.payload_as::<OpaquePayload>().unwrap().0, vec![1, 2, 3]);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let cmd = Command::new(99, None, OpaquePayload(vec![0; 4]));
        let mut buf = [0u8; 16];
        let mut writer = WireWriter::new(&mut buf);
        cmd.write_to(&mut writer).unwrap();
        let len = writer.len();

        let err = Command::read_from(&mut WireReader::new(&buf[..len]), &registry()).unwrap_err();
        assert_eq!(err, CodecError::UnknownCommand(99));
    }

    #[test]
    fn test_parser_must_consume_whole_payload() {
        // Kind 1 decodes 8 bytes; give it 12.
        let cmd = Command::new(1, None, OpaquePayload(vec![0; 12]));
        let mut buf = [0u8; 32];
        let mut writer = WireWriter::new(&mut buf);
        cmd.write_to(&mut writer).unwrap();
        let len = writer.len();

        let err = Command::read_from(&mut WireReader::new(&buf[..len]), &registry()).unwrap_err();
        assert_eq!(
            err,
            CodecError::PayloadMismatch {
                kind: 1,
                declared: 12,
                consumed: 8
            }
        );
    }

    #[test]
    fn test_clone_shares_payload() {
        let cmd = Command::new(1, None, Move { dx: 1, dy: 1 });
        let copy = cmd.clone();
        assert!(cmd.shares_payload_with(&copy));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let cmd = Command::new(1, None, OpaquePayload(vec![0; 70_000]));
        let mut buf = vec![0u8; 80_000];
        let mut writer = WireWriter::new(&mut buf);
        assert_eq!(
            cmd.write_to(&mut writer).unwrap_err(),
            CodecError::PayloadTooLarge(70_000)
        );
    }
}
