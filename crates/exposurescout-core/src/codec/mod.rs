//! Binary codec primitives shared by snapshot and report files.
//!
//! Records are built from three field kinds: variable-length integers
//! ([`varint`]), length-prefixed UTF-8 strings, and fixed 16-byte digests.
//! [`Reader`] walks a byte slice and fails with [`CodecError`] rather than
//! returning partial values when the input is short or malformed.

pub mod varint;

use crate::digest::Digest;
use thiserror::Error;

/// Malformed or truncated binary input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("varint value {0} exceeds the 61-bit range")]
    VarIntOverflow(u64),

    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("unknown {what} tag {tag:#04x}")]
    UnknownTag { what: &'static str, tag: u8 },

    #[error("field {field} value {value} out of range")]
    OutOfRange { field: &'static str, value: u64 },

    #[error("run id selector {0} out of range")]
    RunIdOutOfRange(u8),

    #[error("run id {0:?} is not part of the report")]
    UnknownRunId(String),

    #[error("{0}")]
    Invalid(String),
}

/// Appends a varint-encoded value.
pub fn put_varint(out: &mut Vec<u8>, value: u64) -> Result<(), CodecError> {
    varint::write(value, out)
}

/// Appends a length-prefixed UTF-8 string.
pub fn put_str(out: &mut Vec<u8>, value: &str) -> Result<(), CodecError> {
    put_varint(out, value.len() as u64)?;
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

/// Appends a length-prefixed byte block.
pub fn put_block(out: &mut Vec<u8>, payload: &[u8]) -> Result<(), CodecError> {
    put_varint(out, payload.len() as u64)?;
    out.extend_from_slice(payload);
    Ok(())
}

/// Cursor over an encoded byte slice.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        let bytes = self.bytes(1)?;
        Ok(bytes[0])
    }

    pub fn varint(&mut self) -> Result<u64, CodecError> {
        let (value, used) = varint::read(self.remaining())?;
        self.pos += used;
        Ok(value)
    }

    /// Reads a varint that must fit in 32 bits (mode, uid, gid).
    pub fn varint_u32(&mut self, field: &'static str) -> Result<u32, CodecError> {
        let value = self.varint()?;
        u32::try_from(value).map_err(|_| CodecError::OutOfRange { field, value })
    }

    /// Reads a varint used as an element count or length.
    pub fn count(&mut self) -> Result<usize, CodecError> {
        let value = self.varint()?;
        let len = usize::try_from(value).map_err(|_| CodecError::OutOfRange {
            field: "length",
            value,
        })?;
        // Every counted item takes at least one byte.
        if len > self.buf.len() - self.pos {
            return Err(CodecError::Truncated {
                needed: len,
                available: self.buf.len() - self.pos,
            });
        }
        Ok(len)
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let available = self.buf.len() - self.pos;
        if n > available {
            return Err(CodecError::Truncated {
                needed: n,
                available,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn string(&mut self) -> Result<String, CodecError> {
        let len = self.count()?;
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Reads a length-prefixed block and returns a reader over it.
    pub fn block(&mut self) -> Result<Reader<'a>, CodecError> {
        let len = self.count()?;
        Ok(Reader::new(self.bytes(len)?))
    }

    pub fn digest(&mut self) -> Result<Digest, CodecError> {
        let bytes = self.bytes(Digest::LEN)?;
        let mut raw = [0u8; Digest::LEN];
        raw.copy_from_slice(bytes);
        Ok(Digest::from_bytes(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_round_trip_with_trailer() {
        let mut out = Vec::new();
        put_str(&mut out, "/etc/passwd").unwrap();
        out.push(0xaa);

        let mut reader = Reader::new(&out);
        assert_eq!(reader.string().unwrap(), "/etc/passwd");
        assert_eq!(reader.remaining(), &[0xaa]);
    }

    #[test]
    fn test_string_truncated() {
        let mut out = Vec::new();
        put_str(&mut out, "hello").unwrap();
        out.truncate(3);

        let mut reader = Reader::new(&out);
        assert!(matches!(
            reader.string(),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let data = [0x02, 0xff, 0xfe];
        let mut reader = Reader::new(&data);
        assert_eq!(reader.string(), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn test_length_larger_than_input() {
        // Claims 1000 items with two bytes left.
        let data = [0x23, 0xe8, 0x00, 0x00];
        let mut reader = Reader::new(&data);
        assert!(matches!(reader.count(), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn test_varint_u32_range() {
        let mut out = Vec::new();
        put_varint(&mut out, u64::from(u32::MAX) + 1).unwrap();
        let mut reader = Reader::new(&out);
        assert!(matches!(
            reader.varint_u32("uid"),
            Err(CodecError::OutOfRange { field: "uid", .. })
        ));
    }

    #[test]
    fn test_digest_needs_sixteen_bytes() {
        let data = [0u8; 15];
        let mut reader = Reader::new(&data);
        assert!(reader.digest().is_err());
    }
}
