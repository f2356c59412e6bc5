// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Payload serializer contract.
//!
//! The core never inspects payload bytes. Typed publishers and subscribers
//! are constructed with an implementation of [`PayloadSerializer`]; the
//! descriptor it reports drives endpoint matching during discovery.

use crate::types::DataTypeDescriptor;
use std::fmt;

/// Error raised by a serializer implementation.
#[derive(Debug)]
pub enum SerializeError {
    /// The provided buffer is smaller than `size()` reported
    BufferTooSmall { needed: usize, got: usize },
    /// Input bytes do not decode to a valid message
    Malformed(String),
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferTooSmall { needed, got } => {
                write!(f, "serialize buffer too small: need {needed}, got {got}")
            }
            Self::Malformed(reason) => write!(f, "malformed payload: {reason}"),
        }
    }
}

impl std::error::Error for SerializeError {}

/// Serialization contract implemented per payload type.
///
/// Implementations must be stateless with respect to individual messages:
/// `size` followed by `serialize` into a buffer of that size must succeed.
pub trait PayloadSerializer<T>: Send + Sync {
    /// Descriptor used for compatibility matching and diagnostics.
    fn descriptor(&self) -> DataTypeDescriptor;

    /// Exact number of bytes `serialize` will write for `msg`.
    fn size(&self, msg: &T) -> usize;

    /// Serialize `msg` into `buf` (`buf.len() >= self.size(msg)`).
    /// Returns the number of bytes written.
    fn serialize(&self, msg: &T, buf: &mut [u8]) -> Result<usize, SerializeError>;

    /// Deserialize a message from `buf`.
    fn deserialize(&self, buf: &[u8]) -> Result<T, SerializeError>;
}

/// Identity serializer for untyped byte payloads.
///
/// Reports the wildcard descriptor, so raw endpoints match any typed peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawBytes;

impl PayloadSerializer<Vec<u8>> for RawBytes {
    fn descriptor(&self) -> DataTypeDescriptor {
        DataTypeDescriptor::raw()
    }

    fn size(&self, msg: &Vec<u8>) -> usize {
        msg.len()
    }

    fn serialize(&self, msg: &Vec<u8>, buf: &mut [u8]) -> Result<usize, SerializeError> {
        if buf.len() < msg.len() {
            return Err(SerializeError::BufferTooSmall {
                needed: msg.len(),
                got: buf.len(),
            });
        }
        buf[..msg.len()].copy_from_slice(msg);
        Ok(msg.len())
    }

    fn deserialize(&self, buf: &[u8]) -> Result<Vec<u8>, SerializeError> {
        Ok(buf.to_vec())
    }
}

/// UTF-8 string serializer. Mostly used by samples and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl PayloadSerializer<String> for StringSerializer {
    fn descriptor(&self) -> DataTypeDescriptor {
        DataTypeDescriptor {
            encoding: "utf-8".into(),
            type_name: "std::string".into(),
            schema: Vec::new(),
        }
    }

    fn size(&self, msg: &String) -> usize {
        msg.len()
    }

    fn serialize(&self, msg: &String, buf: &mut [u8]) -> Result<usize, SerializeError> {
        if buf.len() < msg.len() {
            return Err(SerializeError::BufferTooSmall {
                needed: msg.len(),
                got: buf.len(),
            });
        }
        buf[..msg.len()].copy_from_slice(msg.as_bytes());
        Ok(msg.len())
    }

    fn deserialize(&self, buf: &[u8]) -> Result<String, SerializeError> {
        String::from_utf8(buf.to_vec())
            .map_err(|e| SerializeError::Malformed(format!("invalid utf-8: {e}")))
    }
}
