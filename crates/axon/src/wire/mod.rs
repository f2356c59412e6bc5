// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Wire encodings for discovery and data traffic.
//!
//! All encodings are little-endian and version-tagged. Decoders skip
//! unknown trailing bytes inside length-delimited records, so older and
//! newer peers coexist on the same channel.

pub mod data;
pub mod registration;

pub use data::{DataHeader, DATA_HEADER_SIZE};
pub use registration::{RegistrationBatch, RegistrationSample};

use std::fmt;

/// Current protocol version, carried in every batch/header.
pub const WIRE_VERSION: u8 = 1;

/// Decode failure. Malformed input is dropped and counted by the caller,
/// never propagated to user code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Input ended before the declared length
    Truncated,
    /// Unsupported protocol version
    Version(u8),
    /// Bad magic / unknown enum discriminant / invalid utf-8
    Malformed(&'static str),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated message"),
            Self::Version(v) => write!(f, "unsupported wire version {v}"),
            Self::Malformed(what) => write!(f, "malformed message: {what}"),
        }
    }
}

impl std::error::Error for WireError {}

/// Bounds-checked reader over a byte slice.
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// u16-length-prefixed UTF-8 string.
    pub fn string(&mut self) -> Result<String, WireError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::Malformed("invalid utf-8"))
    }

    /// u32-length-prefixed byte blob.
    pub fn bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

/// Append helpers mirroring [`Cursor`].
pub(crate) fn put_string(buf: &mut Vec<u8>, s: &str) {
    debug_assert!(s.len() <= u16::MAX as usize);
    buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

pub(crate) fn put_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
    buf.extend_from_slice(b);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_truncated() {
        let mut cur = Cursor::new(&[1, 2]);
        assert!(cur.u32().is_err());
    }

    #[test]
    fn test_string_roundtrip() {
        let mut buf = Vec::new();
        put_string(&mut buf, "sensors/temp");
        let mut cur = Cursor::new(&buf);
        assert_eq!(cur.string().expect("decode"), "sensors/temp");
        assert_eq!(cur.remaining(), 0);
    }

    #[test]
    fn test_bytes_roundtrip() {
        let mut buf = Vec::new();
        put_bytes(&mut buf, &[7u8; 300]);
        let mut cur = Cursor::new(&buf);
        assert_eq!(cur.bytes().expect("decode"), vec![7u8; 300]);
    }
}
