//! # Wire Codec
//!
//! Bounded field-by-field encoding for lockstep packets.
//!
//! ## Design
//!
//! - Writes go into caller-owned buffers (no allocation per field)
//! - Fixed-width integers in native byte order, copied as Pod values
//! - A field either fits completely or is not written at all
//!
//! Native byte order means the protocol is only valid between hosts that
//! share one endianness.

use bytemuck::{bytes_of, Pod};

use crate::error::{CodecError, CodecResult};

/// Copies `data` into `buffer` at `*offset` and advances the offset.
///
/// Returns the number of bytes written, or 0 with `*offset` unchanged when
/// `*offset + data.len()` exceeds the buffer capacity.
#[inline]
pub fn write_field(buffer: &mut [u8], offset: &mut usize, data: &[u8]) -> usize {
    let Some(end) = offset.checked_add(data.len()) else {
        return 0;
    };
    if end > buffer.len() {
        return 0;
    }
    buffer[*offset..end].copy_from_slice(data);
    *offset = end;
    data.len()
}

/// Copies `out.len()` bytes from `buffer` at `*offset` into `out` and
/// advances the offset.
///
/// Returns the number of bytes read, or 0 with `*offset` unchanged when the
/// buffer holds fewer than `out.len()` bytes past the offset.
#[inline]
pub fn read_field(buffer: &[u8], offset: &mut usize, out: &mut [u8]) -> usize {
    let Some(end) = offset.checked_add(out.len()) else {
        return 0;
    };
    if end > buffer.len() {
        return 0;
    }
    out.copy_from_slice(&buffer[*offset..end]);
    *offset = end;
    out.len()
}

/// Writes fields into a borrowed buffer.
///
/// The buffer length is the capacity. A field that does not fit returns
/// [`CodecError::Overflow`] and nothing is written past the capacity.
pub struct WireWriter<'a> {
    buffer: &'a mut [u8],
    position: usize,
}

impl<'a> WireWriter<'a> {
    /// Creates a writer over `buffer`, starting at offset 0.
    #[must_use]
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Returns the number of bytes written.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.position
    }

    /// Returns true if no bytes have been written.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.position == 0
    }

    /// Returns the number of bytes still available.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    /// Returns the written prefix of the buffer.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[..self.position]
    }

    /// Writes raw bytes.
    pub fn write_bytes(&mut self, data: &[u8]) -> CodecResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let offset = self.position;
        match write_field(self.buffer, &mut self.position, data) {
            0 => Err(CodecError::Overflow {
                needed: data.len(),
                offset,
                capacity: self.buffer.len(),
            }),
            n => Ok(n),
        }
    }

    /// Writes a single byte.
    #[inline]
    pub fn write_u8(&mut self, value: u8) -> CodecResult<()> {
        self.write_bytes(&[value]).map(drop)
    }

    /// Writes a u16 in native byte order.
    #[inline]
    pub fn write_u16(&mut self, value: u16) -> CodecResult<()> {
        self.write_bytes(&value.to_ne_bytes()).map(drop)
    }

    /// Writes a u32 in native byte order.
    #[inline]
    pub fn write_u32(&mut self, value: u32) -> CodecResult<()> {
        self.write_bytes(&value.to_ne_bytes()).map(drop)
    }

    /// Writes a u64 in native byte order.
    #[inline]
    pub fn write_u64(&mut self, value: u64) -> CodecResult<()> {
        self.write_bytes(&value.to_ne_bytes()).map(drop)
    }

    /// Writes a Pod type directly.
    #[inline]
    pub fn write_pod<T: Pod>(&mut self, value: &T) -> CodecResult<()> {
        self.write_bytes(bytes_of(value)).map(drop)
    }
}

/// Reads fields from a borrowed buffer.
pub struct WireReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> WireReader<'a> {
    /// Creates a reader over `buffer`, starting at offset 0.
    #[must_use]
    pub const fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Returns the current read offset.
    #[inline]
    #[must_use]
    pub const fn position(&self) -> usize {
        self.position
    }

    /// Returns the number of bytes remaining.
    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    fn truncated(&self, needed: usize) -> CodecError {
        CodecError::Truncated {
            needed,
            offset: self.position,
            len: self.buffer.len(),
        }
    }

    /// Reads exactly `out.len()` bytes into `out`.
    pub fn read_into(&mut self, out: &mut [u8]) -> CodecResult<()> {
        if out.is_empty() {
            return Ok(());
        }
        match read_field(self.buffer, &mut self.position, out) {
            0 => Err(self.truncated(out.len())),
            _ => Ok(()),
        }
    }

    /// Borrows the next `len` bytes without copying.
    pub fn read_slice(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(self.truncated(len));
        }
        let slice = &self.buffer[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    /// Reads a single byte.
    #[inline]
    pub fn read_u8(&mut self) -> CodecResult<u8> {
        let mut raw = [0u8; 1];
        self.read_into(&mut raw)?;
        Ok(raw[0])
    }

    /// Reads a u16 in native byte order.
    #[inline]
    pub fn read_u16(&mut self) -> CodecResult<u16> {
        let mut raw = [0u8; 2];
        self.read_into(&mut raw)?;
        Ok(u16::from_ne_bytes(raw))
    }

    /// Reads a u32 in native byte order.
    #[inline]
    pub fn read_u32(&mut self) -> CodecResult<u32> {
        let mut raw = [0u8; 4];
        self.read_into(&mut raw)?;
        Ok(u32::from_ne_bytes(raw))
    }

    /// Reads a u64 in native byte order.
    #[inline]
    pub fn read_u64(&mut self) -> CodecResult<u64> {
        let mut raw = [0u8; 8];
        self.read_into(&mut raw)?;
        Ok(u64::from_ne_bytes(raw))
    }

    /// Reads a Pod type directly.
    #[inline]
    pub fn read_pod<T: Pod>(&mut self) -> CodecResult<T> {
        let size = std::mem::size_of::<T>();
        let slice = self.read_slice(size)?;
        // Unaligned read: the buffer carries no alignment guarantee.
        Ok(bytemuck::pod_read_unaligned(slice))
    }
}
