//! Byte-level wire primitives shared by the frame layer and the CRDT codec.
//!
//! Integers are little-endian base-128 varints. Decoding is defensive: a
//! varint missing its terminator before the end of the buffer, or a length
//! prefix pointing past it, is a hard [`SyncError::DecodeError`] — never
//! garbage output.

use crate::error::{Result, SyncError};

/// Maximum number of bytes in an encoded u64 varint (ceil(64 / 7)).
const MAX_VARINT_LEN: usize = 10;

/// Read-only cursor over a byte buffer.
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current byte offset, used for error context.
    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| self.truncated("byte"))?;
        self.pos += 1;
        Ok(b)
    }

    /// Read a little-endian base-128 varint.
    pub fn read_var_u64(&mut self) -> Result<u64> {
        let mut result: u64 = 0;
        let mut shift: u32 = 0;
        for i in 0..MAX_VARINT_LEN {
            let b = *self
                .data
                .get(self.pos)
                .ok_or_else(|| self.truncated("varint"))?;
            self.pos += 1;
            let part = (b & 0x7f) as u64;
            if shift >= 64 || (shift == 63 && part > 1) {
                return Err(SyncError::DecodeError(format!(
                    "varint overflows u64 at byte {}",
                    self.pos
                )));
            }
            result |= part << shift;
            if b & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            // Last permitted byte must terminate.
            if i == MAX_VARINT_LEN - 1 {
                break;
            }
        }
        Err(SyncError::DecodeError(format!(
            "varint not terminated within {} bytes at byte {}",
            MAX_VARINT_LEN, self.pos
        )))
    }

    /// Read a varint and bounds-check it as an in-buffer length.
    pub fn read_len(&mut self) -> Result<usize> {
        let len = self.read_var_u64()?;
        let len = usize::try_from(len)
            .map_err(|_| SyncError::DecodeError(format!("length {} too large", len)))?;
        if len > self.remaining() {
            return Err(SyncError::DecodeError(format!(
                "length {} exceeds remaining {} bytes at byte {}",
                len,
                self.remaining(),
                self.pos
            )));
        }
        Ok(len)
    }

    pub fn read_exact(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(self.truncated("payload"));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Varint length prefix followed by that many bytes.
    pub fn read_buf(&mut self) -> Result<&'a [u8]> {
        let len = self.read_len()?;
        self.read_exact(len)
    }

    /// Length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_buf()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| SyncError::DecodeError(format!("invalid UTF-8: {}", e)))
    }

    /// Error unless every byte of the buffer was consumed.
    pub fn finish(&self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(SyncError::DecodeError(format!(
                "{} trailing bytes after byte {}",
                self.remaining(),
                self.pos
            )))
        }
    }

    fn truncated(&self, what: &str) -> SyncError {
        SyncError::DecodeError(format!(
            "buffer truncated reading {} at byte {} of {}",
            what,
            self.pos,
            self.data.len()
        ))
    }
}

pub fn write_var_u64(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut b = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            b |= 0x80;
        }
        out.push(b);
        if value == 0 {
            return;
        }
    }
}

pub fn write_buf(out: &mut Vec<u8>, bytes: &[u8]) {
    write_var_u64(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

pub fn write_string(out: &mut Vec<u8>, s: &str) {
    write_buf(out, s.as_bytes());
}
