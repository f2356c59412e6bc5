// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Data message header shared by the UDP and TCP layers.
//!
//! Every data message (or UDP fragment of one) starts with a fixed-size
//! [`DataHeader`]. The SHM layer carries the same header inside the slot
//! payload so all three layers feed one demultiplexing path.
//!
//! ```text
//! version u8 | topic_id u64 | sender u64 | clock u64
//! | fragment_index u16 | fragment_count u16
//! | message_len u32 | send_timestamp_us u64
//! ```

use super::{Cursor, WireError, WIRE_VERSION};

/// Serialized size of [`DataHeader`].
pub const DATA_HEADER_SIZE: usize = 1 + 8 + 8 + 8 + 2 + 2 + 4 + 8;

/// Fixed header preceding every data payload/fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    /// FNV-1a hash of the topic name (demux key)
    pub topic_id: u64,
    /// Publisher instance id (dedup key together with `clock`)
    pub sender: u64,
    /// Per-publisher monotonically increasing sample counter
    pub clock: u64,
    /// Fragment index, 0-based
    pub fragment_index: u16,
    /// Total fragments of this sample (1 = unfragmented)
    pub fragment_count: u16,
    /// Length of the complete reassembled message
    pub message_len: u32,
    /// Microseconds since the UNIX epoch at send time
    pub send_timestamp_us: u64,
}

impl DataHeader {
    /// Header for an unfragmented message.
    pub fn single(topic_id: u64, sender: u64, clock: u64, message_len: u32) -> Self {
        Self {
            topic_id,
            sender,
            clock,
            fragment_index: 0,
            fragment_count: 1,
            message_len,
            send_timestamp_us: now_us(),
        }
    }

    /// Append the encoded header to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(WIRE_VERSION);
        out.extend_from_slice(&self.topic_id.to_le_bytes());
        out.extend_from_slice(&self.sender.to_le_bytes());
        out.extend_from_slice(&self.clock.to_le_bytes());
        out.extend_from_slice(&self.fragment_index.to_le_bytes());
        out.extend_from_slice(&self.fragment_count.to_le_bytes());
        out.extend_from_slice(&self.message_len.to_le_bytes());
        out.extend_from_slice(&self.send_timestamp_us.to_le_bytes());
    }

    /// Decode a header and return it with the remaining payload bytes.
    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let mut cur = Cursor::new(buf);
        let version = cur.u8()?;
        if version != WIRE_VERSION {
            return Err(WireError::Version(version));
        }
        let header = Self {
            topic_id: cur.u64()?,
            sender: cur.u64()?,
            clock: cur.u64()?,
            fragment_index: cur.u16()?,
            fragment_count: cur.u16()?,
            message_len: cur.u32()?,
            send_timestamp_us: cur.u64()?,
        };
        if header.fragment_count == 0 || header.fragment_index >= header.fragment_count {
            return Err(WireError::Malformed("fragment index out of range"));
        }
        Ok((header, &buf[DATA_HEADER_SIZE..]))
    }
}

/// Wall-clock microseconds, used for send/receive timestamps.
#[must_use]
pub fn now_us() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_size_constant() {
        let header = DataHeader::single(1, 2, 3, 4);
        let mut out = Vec::new();
        header.encode_into(&mut out);
        assert_eq!(out.len(), DATA_HEADER_SIZE);
    }

    #[test]
    fn test_header_roundtrip_with_payload() {
        let header = DataHeader {
            topic_id: 0x1122_3344_5566_7788,
            sender: 42,
            clock: 1000,
            fragment_index: 2,
            fragment_count: 5,
            message_len: 7000,
            send_timestamp_us: 1_700_000_000_000_000,
        };
        let mut out = Vec::new();
        header.encode_into(&mut out);
        out.extend_from_slice(b"fragment-bytes");

        let (decoded, payload) = DataHeader::decode(&out).expect("decode");
        assert_eq!(decoded, header);
        assert_eq!(payload, b"fragment-bytes");
    }

    #[test]
    fn test_zero_fragment_count_rejected() {
        let mut out = Vec::new();
        DataHeader::single(1, 2, 3, 4).encode_into(&mut out);
        // fragment_count sits after version + 3*u64 + fragment_index
        let off = 1 + 24 + 2;
        out[off..off + 2].copy_from_slice(&0u16.to_le_bytes());
        assert!(DataHeader::decode(&out).is_err());
    }

    #[test]
    fn test_truncated_header_rejected() {
        let mut out = Vec::new();
        DataHeader::single(1, 2, 3, 4).encode_into(&mut out);
        assert_eq!(
            DataHeader::decode(&out[..10]),
            Err(WireError::Truncated)
        );
    }
}
