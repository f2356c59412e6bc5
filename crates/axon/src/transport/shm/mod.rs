// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Shared-memory transport for same-host zero-copy delivery.
//!
//! A publisher owns one named POSIX segment holding a ring of payload
//! slots. Subscribers learn the segment name from the registration layer,
//! map it, and wait on a futex for new data.
//!
//! ```text
//! +--------------------+           +--------------------+
//! |  Publisher process |  /dev/shm |  Subscriber process |
//! |   ShmRingWriter ---+-- mmap ---+--> ShmRingReader    |
//! +--------------------+   futex   +--------------------+
//! ```
//!
//! Slot acknowledgement is optional: with `acknowledge_timeout_ms > 0`
//! the writer waits for all attached readers to release a slot before
//! reusing it, then proceeds anyway once the timeout expires. A slow
//! reader therefore only ever loses its own samples.

mod futex;
mod ring;
mod segment;

pub use futex::{wait as futex_wait, wake_all as futex_wake_all, WaitOutcome};
pub use ring::{PopResult, ReaderMetrics, ShmRingReader, ShmRingWriter, SlotHeader, WriterMetrics};
pub use segment::ShmSegment;

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

/// Errors of the shared-memory transport.
#[derive(Debug)]
pub enum ShmError {
    /// `shm_open`/`ftruncate` failed while creating a segment
    SegmentCreate(io::Error),
    /// `shm_open` failed while opening an existing segment
    SegmentOpen(io::Error),
    /// `mmap` failed
    Mmap(io::Error),
    /// Segment does not exist (yet)
    NotFound(String),
    /// Segment name violates POSIX rules
    InvalidName(String),
    /// Header magic/version/generation check failed
    IncompatibleSegment,
    /// Payload exceeds the slot size; caller must grow the segment
    PayloadTooLarge { size: usize, slot_size: usize },
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SegmentCreate(e) => write!(f, "segment creation failed: {e}"),
            Self::SegmentOpen(e) => write!(f, "segment open failed: {e}"),
            Self::Mmap(e) => write!(f, "memory mapping failed: {e}"),
            Self::NotFound(name) => write!(f, "segment not found: {name}"),
            Self::InvalidName(name) => write!(f, "invalid segment name: {name}"),
            Self::IncompatibleSegment => write!(f, "segment header validation failed"),
            Self::PayloadTooLarge { size, slot_size } => {
                write!(f, "payload of {size} bytes exceeds slot size {slot_size}")
            }
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SegmentCreate(e) | Self::SegmentOpen(e) | Self::Mmap(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for SHM operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Build a fresh segment name for a topic.
///
/// Format: `/axon_<pid>_<topic-hash>_<suffix>`. The suffix changes on
/// every call, so a restarted or grown writer never collides with an
/// orphaned segment left by its previous life.
#[must_use]
pub fn segment_name(topic: &str) -> String {
    static SUFFIX: AtomicU64 = AtomicU64::new(0);
    let nonce = {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        ts ^ (SUFFIX.fetch_add(1, Ordering::Relaxed) << 48)
    };
    format!(
        "/axon_{}_{:08x}_{:08x}",
        std::process::id(),
        crate::types::topic_hash(topic) as u32,
        nonce as u32
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_names_unique_per_call() {
        let a = segment_name("sensors/temp");
        let b = segment_name("sensors/temp");
        assert_ne!(a, b);
        assert!(a.starts_with("/axon_"));
        assert!(!a[1..].contains('/'));
    }

    #[test]
    fn test_segment_name_length_bounded() {
        let long_topic = "t".repeat(4096);
        assert!(segment_name(&long_topic).len() < 255);
    }
}
