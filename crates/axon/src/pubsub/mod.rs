// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Publisher/subscriber façade and connection management.
//!
//! The [`gate`] matches registry events against local endpoints and
//! opens/closes per-layer sessions; [`publisher`] and [`subscriber`] hold
//! the per-endpoint state. User callbacks run on whichever thread
//! received the sample (SHM wait thread, UDP demux, TCP reader).

pub mod gate;
pub mod publisher;
pub mod subscriber;

pub use gate::Gate;
pub use publisher::{Publisher, PublisherCore};
pub use subscriber::{Subscriber, SubscriberCore};

use crate::config::ConfigError;
use crate::ser::SerializeError;
use crate::transport::shm::ShmError;
use crate::transport::TransportLayer;
use crate::types::EntityId;
use std::fmt;
use std::io;
use std::sync::Arc;

/// Errors surfaced through the public API.
///
/// Transient transport conditions (datagram loss, slot-ack timeout, TCP
/// disconnect) never appear here; they are logged, counted and degrade
/// gracefully.
#[derive(Debug)]
pub enum Error {
    /// Context was finalized; the entity can no longer be used
    ContextClosed,
    /// Rejected configuration
    Config(ConfigError),
    /// Socket/listener setup failure during initialization
    Io(io::Error),
    /// Shared-memory setup failure
    Shm(ShmError),
    /// Payload (de)serialization failure
    Serialize(SerializeError),
    /// No server instance currently known for a service call
    NoServerAvailable(String),
    /// A blocking service call ran out of time
    Timeout,
    /// Services require the TCP layer, which this configuration disables
    TcpLayerDisabled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContextClosed => write!(f, "middleware context is finalized"),
            Self::Config(e) => write!(f, "invalid configuration: {e}"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
            Self::Shm(e) => write!(f, "shared memory error: {e}"),
            Self::Serialize(e) => write!(f, "serialization error: {e}"),
            Self::NoServerAvailable(service) => {
                write!(f, "no server available for service '{service}'")
            }
            Self::Timeout => write!(f, "call timed out"),
            Self::TcpLayerDisabled => write!(f, "tcp layer is disabled in the configuration"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Shm(e) => Some(e),
            Self::Serialize(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ShmError> for Error {
    fn from(e: ShmError) -> Self {
        Self::Shm(e)
    }
}

impl From<SerializeError> for Error {
    fn from(e: SerializeError) -> Self {
        Self::Serialize(e)
    }
}

/// Result alias for the public API.
pub type Result<T> = std::result::Result<T, Error>;

/// Connection lifecycle events forwarded to user event callbacks,
/// separate from data callbacks.
#[derive(Debug, Clone)]
pub enum PubSubEvent {
    /// A compatible remote endpoint was matched on `layer`
    Connected {
        remote: EntityId,
        layer: TransportLayer,
    },
    /// The remote endpoint vanished or the layer session ended
    Disconnected {
        remote: EntityId,
        layer: TransportLayer,
    },
    /// Clock gap observed: `lost` samples from `remote` never arrived
    Dropped { remote: EntityId, lost: u64 },
}

/// User event callback.
pub type EventCallback = Arc<dyn Fn(PubSubEvent) + Send + Sync>;

/// Metadata delivered with every sample.
#[derive(Debug, Clone, Copy)]
pub struct SampleInfo {
    /// Publisher instance the sample came from
    pub source: u64,
    /// Per-publisher sample counter
    pub clock: u64,
    /// Wall clock at send, microseconds
    pub send_timestamp_us: u64,
    /// Wall clock at delivery, microseconds
    pub receive_timestamp_us: u64,
    /// Layer that delivered first
    pub layer: TransportLayer,
}

/// Untyped data callback: payload bytes are only valid for the duration
/// of the call (zero-copy SHM hands out a borrowed slice).
pub type DataCallback = Arc<dyn Fn(&[u8], &SampleInfo) + Send + Sync>;
