// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! UDP multicast transport (best effort).
//!
//! One multicast group/port pair carries either discovery or user data.
//! Samples above the datagram limit are split into sequenced fragments
//! and reassembled on the receiver; losses are expected and tolerated,
//! there is no retransmission on this layer.

mod demux;
mod fragment;
mod multicast;

pub use demux::{DemuxHandler, UdpDemux};
pub use fragment::{fragment_message, Reassembler};
pub use multicast::{create_recv_socket, create_send_socket, multicast_interfaces};

use std::fmt;
use std::io;

/// Errors of the UDP transport. Send-side datagram loss is not an error;
/// these cover socket lifecycle problems only.
#[derive(Debug)]
pub enum UdpError {
    /// Socket creation/bind/join failed
    Socket(io::Error),
}

impl fmt::Display for UdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(e) => write!(f, "udp socket setup failed: {e}"),
        }
    }
}

impl std::error::Error for UdpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Socket(e) => Some(e),
        }
    }
}

impl From<io::Error> for UdpError {
    fn from(e: io::Error) -> Self {
        Self::Socket(e)
    }
}

/// Result type for UDP operations.
pub type Result<T> = std::result::Result<T, UdpError>;
