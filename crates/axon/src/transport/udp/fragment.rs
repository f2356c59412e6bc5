// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Datagram fragmentation and reassembly.
//!
//! A sample larger than the configured datagram size is split into
//! fragments that all carry the same `(sender, clock)` pair. The receiver
//! keeps a short-lived set per pair and reassembles once every fragment
//! arrived. Incomplete sets are discarded after a bounded number of
//! subsequent datagrams; this layer never retransmits.

use crate::wire::{DataHeader, WireError, DATA_HEADER_SIZE};
use std::collections::HashMap;

/// Incomplete sets older than this many received datagrams are evicted.
const EVICTION_WINDOW: u64 = 1_024;

/// Upper bound on concurrently pending sets (memory bound).
const MAX_PENDING: usize = 256;

/// Split one sample into ready-to-send datagrams.
///
/// Each datagram is `DataHeader` + payload chunk. `max_datagram` bounds
/// the total datagram size, so chunks are `max_datagram - header`.
pub fn fragment_message(
    topic_id: u64,
    sender: u64,
    clock: u64,
    payload: &[u8],
    max_datagram: usize,
) -> Vec<Vec<u8>> {
    let chunk_size = max_datagram.saturating_sub(DATA_HEADER_SIZE).max(1);
    let count = payload.len().div_ceil(chunk_size).max(1);
    debug_assert!(count <= u16::MAX as usize, "payload needs too many fragments");

    let mut header = DataHeader::single(topic_id, sender, clock, payload.len() as u32);
    header.fragment_count = count as u16;

    let mut datagrams = Vec::with_capacity(count);
    for index in 0..count {
        let start = index * chunk_size;
        let end = (start + chunk_size).min(payload.len());
        header.fragment_index = index as u16;

        let mut datagram = Vec::with_capacity(DATA_HEADER_SIZE + (end - start));
        header.encode_into(&mut datagram);
        datagram.extend_from_slice(&payload[start..end]);
        datagrams.push(datagram);
    }
    datagrams
}

struct PendingSet {
    fragments: Vec<Option<Vec<u8>>>,
    received: usize,
    header: DataHeader,
    /// Receiver tick when the first fragment arrived
    born: u64,
}

/// Counters of the reassembly path.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReassemblyStats {
    pub completed: u64,
    /// Incomplete sets dropped by the eviction window
    pub evicted: u64,
    /// Fragments with inconsistent headers
    pub inconsistent: u64,
}

/// Per-receiver reassembly state.
pub struct Reassembler {
    pending: HashMap<(u64, u64), PendingSet>,
    tick: u64,
    pub stats: ReassemblyStats,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            tick: 0,
            stats: ReassemblyStats::default(),
        }
    }

    /// Feed one decoded datagram.
    ///
    /// Returns the complete message once the last fragment arrives;
    /// single-fragment messages complete immediately.
    pub fn insert(&mut self, header: DataHeader, payload: &[u8]) -> Option<(DataHeader, Vec<u8>)> {
        self.tick += 1;
        self.evict_stale();

        if header.fragment_count == 1 {
            self.stats.completed += 1;
            return Some((header, payload.to_vec()));
        }

        let key = (header.sender, header.clock);
        let born = self.tick;
        let set = self.pending.entry(key).or_insert_with(|| PendingSet {
            fragments: vec![None; header.fragment_count as usize],
            received: 0,
            header,
            born,
        });

        if set.header.fragment_count != header.fragment_count
            || set.header.message_len != header.message_len
        {
            // Conflicting geometry for the same (sender, clock): drop the
            // whole set, the stream will resync on the next sample.
            self.stats.inconsistent += 1;
            self.pending.remove(&key);
            return None;
        }

        let slot = &mut set.fragments[header.fragment_index as usize];
        if slot.is_none() {
            *slot = Some(payload.to_vec());
            set.received += 1;
        }

        if set.received < set.fragments.len() {
            return None;
        }

        let set = self.pending.remove(&key)?;
        let mut message = Vec::with_capacity(set.header.message_len as usize);
        for fragment in set.fragments {
            message.extend_from_slice(&fragment?);
        }
        if message.len() != set.header.message_len as usize {
            self.stats.inconsistent += 1;
            return None;
        }
        self.stats.completed += 1;
        Some((set.header, message))
    }

    /// Number of incomplete sets currently buffered.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn evict_stale(&mut self) {
        let tick = self.tick;
        let before = self.pending.len();
        self.pending
            .retain(|_, set| tick.saturating_sub(set.born) < EVICTION_WINDOW);
        self.stats.evicted += (before - self.pending.len()) as u64;

        // Hard cap: drop the oldest sets first.
        while self.pending.len() > MAX_PENDING {
            if let Some(oldest) = self
                .pending
                .iter()
                .min_by_key(|(_, set)| set.born)
                .map(|(k, _)| *k)
            {
                self.pending.remove(&oldest);
                self.stats.evicted += 1;
            } else {
                break;
            }
        }
    }
}

/// Decode a datagram into header + fragment payload.
pub fn decode_datagram(buf: &[u8]) -> Result<(DataHeader, &[u8]), WireError> {
    DataHeader::decode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble_all(datagrams: &[Vec<u8>], r: &mut Reassembler) -> Option<(DataHeader, Vec<u8>)> {
        let mut out = None;
        for datagram in datagrams {
            let (header, chunk) = decode_datagram(datagram).expect("decode");
            if let Some(done) = r.insert(header, chunk) {
                out = Some(done);
            }
        }
        out
    }

    #[test]
    fn test_small_message_single_fragment() {
        let datagrams = fragment_message(1, 2, 3, b"small", 1400);
        assert_eq!(datagrams.len(), 1);

        let mut r = Reassembler::new();
        let (header, message) = reassemble_all(&datagrams, &mut r).expect("complete");
        assert_eq!(header.clock, 3);
        assert_eq!(message, b"small");
    }

    #[test]
    fn test_large_message_roundtrip() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let datagrams = fragment_message(7, 8, 9, &payload, 1400);
        assert!(datagrams.len() > 1);
        for d in &datagrams {
            assert!(d.len() <= 1400);
        }

        let mut r = Reassembler::new();
        let (header, message) = reassemble_all(&datagrams, &mut r).expect("complete");
        assert_eq!(header.message_len as usize, payload.len());
        assert_eq!(message, payload);
    }

    #[test]
    fn test_out_of_order_fragments() {
        let payload = vec![0xABu8; 5_000];
        let mut datagrams = fragment_message(1, 1, 1, &payload, 1400);
        datagrams.reverse();

        let mut r = Reassembler::new();
        let (_, message) = reassemble_all(&datagrams, &mut r).expect("complete");
        assert_eq!(message, payload);
    }

    #[test]
    fn test_duplicate_fragment_ignored() {
        let payload = vec![1u8; 3_000];
        let datagrams = fragment_message(1, 1, 1, &payload, 1400);

        let mut r = Reassembler::new();
        let (h0, c0) = decode_datagram(&datagrams[0]).expect("decode");
        assert!(r.insert(h0, c0).is_none());
        assert!(r.insert(h0, c0).is_none()); // duplicate

        let mut result = None;
        for d in &datagrams[1..] {
            let (h, c) = decode_datagram(d).expect("decode");
            result = r.insert(h, c);
        }
        assert_eq!(result.expect("complete").1, payload);
    }

    #[test]
    fn test_incomplete_set_evicted_after_window() {
        let payload = vec![2u8; 5_000];
        let datagrams = fragment_message(1, 42, 1, &payload, 1400);

        let mut r = Reassembler::new();
        let (h, c) = decode_datagram(&datagrams[0]).expect("decode");
        r.insert(h, c);
        assert_eq!(r.pending(), 1);

        // A long run of unrelated datagrams pushes the set out.
        for clock in 0..EVICTION_WINDOW + 10 {
            let single = fragment_message(9, 9, clock, b"x", 1400);
            let (h, c) = decode_datagram(&single[0]).expect("decode");
            r.insert(h, c);
        }
        assert_eq!(r.pending(), 0);
        assert!(r.stats.evicted >= 1);
    }

    #[test]
    fn test_payload_bytes_exact_one_byte() {
        let datagrams = fragment_message(1, 1, 1, &[0x7F], 1400);
        let mut r = Reassembler::new();
        let (_, message) = reassemble_all(&datagrams, &mut r).expect("complete");
        assert_eq!(message, vec![0x7F]);
    }
}
