// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Concrete data transport layers.
//!
//! Three layers move payload bytes between matched endpoints:
//!
//! | Layer | Scope       | Semantics                         |
//! |-------|-------------|-----------------------------------|
//! | SHM   | same host   | zero-copy, ring buffer, best effort |
//! | UDP   | any network | multicast, fragmented, best effort |
//! | TCP   | any network | ordered per session, reconnecting  |
//!
//! A logical publisher/subscriber pair may run several layers at once;
//! the subscriber façade deduplicates by `(sender, clock)`.

pub mod shm;
pub mod tcp;
pub mod udp;

use std::fmt;

/// Closed set of transport layers, selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportLayer {
    /// Shared-memory ring buffer (same host only)
    Shm,
    /// UDP multicast (best effort)
    Udp,
    /// TCP session (ordered)
    Tcp,
}

impl fmt::Display for TransportLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Shm => "shm",
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        };
        write!(f, "{s}")
    }
}
