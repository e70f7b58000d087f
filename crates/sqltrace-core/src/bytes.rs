//! Bounds-checked reads over captured frame bytes.
//!
//! Capture payloads are untrusted and frequently truncated mid-header, so
//! every read returns `Result<_, Truncated>` instead of panicking. Decoders
//! propagate `Truncated` up to the frame boundary, where it is converted
//! into a per-conversation counter and the next frame decodes normally.

use thiserror::Error;

/// An out-of-range read while decoding one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("truncated read: need {needed} bytes, have {have}")]
pub struct Truncated {
    pub needed: usize,
    pub have: usize,
}

/// Cursor over an immutable byte buffer.
///
/// Network-order (big-endian) reads carry the `_be` suffix matching the wire
/// headers; TDS token payloads are little-endian and use the `_le` variants.
#[derive(Debug, Clone, Copy)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn at(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn skip(&mut self, count: usize) -> Result<(), Truncated> {
        self.take(count).map(|_| ())
    }

    pub fn take(&mut self, count: usize) -> Result<&'a [u8], Truncated> {
        let end = self.pos.checked_add(count).ok_or(Truncated {
            needed: usize::MAX,
            have: self.buf.len(),
        })?;
        let slice = self.buf.get(self.pos..end).ok_or(Truncated {
            needed: end,
            have: self.buf.len(),
        })?;
        self.pos = end;
        Ok(slice)
    }

    pub fn peek_u8(&self, ahead: usize) -> Result<u8, Truncated> {
        self.buf
            .get(self.pos + ahead)
            .copied()
            .ok_or(Truncated {
                needed: self.pos + ahead + 1,
                have: self.buf.len(),
            })
    }

    pub fn read_u8(&mut self) -> Result<u8, Truncated> {
        let b = self.take(1)?;
        Ok(b[0])
    }

    pub fn read_u16_be(&mut self) -> Result<u16, Truncated> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u16_le(&mut self) -> Result<u16, Truncated> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32_be(&mut self) -> Result<u32, Truncated> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, Truncated> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u48_be(&mut self) -> Result<u64, Truncated> {
        let b = self.take(6)?;
        Ok(u64::from_be_bytes([0, 0, b[0], b[1], b[2], b[3], b[4], b[5]]))
    }

    pub fn read_u64_be(&mut self) -> Result<u64, Truncated> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// ASCII/ANSI string of `len` bytes, lossily decoded, NUL-trimmed.
    pub fn read_ansi_string(&mut self, len: usize) -> Result<String, Truncated> {
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes)
            .trim_end_matches('\0')
            .to_string())
    }

    /// UTF-16LE string of `chars` characters (2 bytes each), as used by TDS
    /// tokens.
    pub fn read_unicode_string(&mut self, chars: usize) -> Result<String, Truncated> {
        let bytes = self.take(chars * 2)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        Ok(String::from_utf16_lossy(&units)
            .trim_end_matches('\0')
            .to_string())
    }
}

/// Direct indexed reads, for parsers that jump around a payload rather than
/// advancing a cursor.
pub fn u8_at(buf: &[u8], offset: usize) -> Result<u8, Truncated> {
    buf.get(offset).copied().ok_or(Truncated {
        needed: offset + 1,
        have: buf.len(),
    })
}

pub fn u16_be_at(buf: &[u8], offset: usize) -> Result<u16, Truncated> {
    let mut r = Reader::at(buf, offset);
    r.read_u16_be()
}

pub fn u16_le_at(buf: &[u8], offset: usize) -> Result<u16, Truncated> {
    let mut r = Reader::at(buf, offset);
    r.read_u16_le()
}

pub fn u32_be_at(buf: &[u8], offset: usize) -> Result<u32, Truncated> {
    let mut r = Reader::at(buf, offset);
    r.read_u32_be()
}

pub fn u32_le_at(buf: &[u8], offset: usize) -> Result<u32, Truncated> {
    let mut r = Reader::at(buf, offset);
    r.read_u32_le()
}
