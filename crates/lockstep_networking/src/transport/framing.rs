//! Length-prefixed framing for stream sockets.
//!
//! ```text
//! ┌──────────────┬──────────────────────┐
//! │ len (4, LE)  │ packet (len bytes)   │
//! └──────────────┴──────────────────────┘
//! ```

use std::io::{self, Read, Write};

use crate::error::{TransportError, TransportResult};

/// Size of the length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Writes one frame.
pub fn write_frame<W: Write>(stream: &mut W, bytes: &[u8], max: usize) -> TransportResult<()> {
    if bytes.len() > max {
        return Err(TransportError::FrameTooLarge {
            size: bytes.len(),
            max,
        });
    }
    let len = u32::try_from(bytes.len()).map_err(|_| TransportError::FrameTooLarge {
        size: bytes.len(),
        max,
    })?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + bytes.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(bytes);
    stream.write_all(&frame)?;
    stream.flush()?;
    Ok(())
}

/// Reads one frame.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
pub fn read_frame<R: Read>(stream: &mut R, max: usize) -> TransportResult<Option<Vec<u8>>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match stream.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(header) as usize;
    if len > max {
        return Err(TransportError::FrameTooLarge { size: len, max });
    }

    let mut bytes = vec![0u8; len];
    stream.read_exact(&mut bytes)?;
    Ok(Some(bytes))
}
