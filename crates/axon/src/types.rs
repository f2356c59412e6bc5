// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Entity identification and compatibility types.
//!
//! Every publisher, subscriber, service endpoint and process in an axon
//! domain is addressed by an [`EntityId`]. Two endpoints exchange data
//! only if their [`DataTypeDescriptor`]s are compatible
//! ([`DataTypeDescriptor::is_compatible_with`]).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Kind of a registered entity.
///
/// Carried in every registration sample so receivers can route the sample
/// to the matching gate (pub/sub or service).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntityKind {
    /// A process announcing itself (no topic attached)
    Process = 0,
    /// A topic publisher
    Publisher = 1,
    /// A topic subscriber
    Subscriber = 2,
    /// A service server instance
    ServiceServer = 3,
    /// A service client instance
    ServiceClient = 4,
}

impl EntityKind {
    /// Decode from wire byte. Unknown values are rejected by the caller.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Process),
            1 => Some(Self::Publisher),
            2 => Some(Self::Subscriber),
            3 => Some(Self::ServiceServer),
            4 => Some(Self::ServiceClient),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Process => "process",
            Self::Publisher => "publisher",
            Self::Subscriber => "subscriber",
            Self::ServiceServer => "service-server",
            Self::ServiceClient => "service-client",
        };
        write!(f, "{s}")
    }
}

/// Unique identifier for an entity instance.
///
/// `instance_id` is freshly generated for every created object, so a
/// restarted process never aliases the entities of its previous life.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityId {
    /// Host the entity lives on
    pub host_name: String,
    /// OS process id
    pub process_id: u32,
    /// Topic name (pub/sub) or service name (RPC); empty for processes
    pub entity: String,
    /// Per-instance unique id
    pub instance_id: u64,
}

impl EntityId {
    /// Create an id for an entity of the local process.
    pub fn local(entity: impl Into<String>) -> Self {
        Self {
            host_name: local_host_name(),
            process_id: std::process::id(),
            entity: entity.into(),
            instance_id: next_instance_id(),
        }
    }

    /// Whether this entity lives on the same host as `other`.
    #[must_use]
    pub fn same_host(&self, other: &EntityId) -> bool {
        self.host_name == other.host_name
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}:{}#{:016x}",
            self.host_name, self.process_id, self.entity, self.instance_id
        )
    }
}

/// Resolve the local host name once per call.
///
/// Falls back to `localhost` when the environment gives no answer; the
/// value only needs to be stable within one run, not globally resolvable.
pub fn local_host_name() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    // Linux: /proc is cheaper than spawning `hostname`
    if let Ok(name) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
        let trimmed = name.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    "localhost".to_string()
}

/// Generate a process-unique, run-unique instance id.
///
/// Mixes the wall clock with the process id and a monotonic counter so two
/// entities created in the same nanosecond still differ.
pub fn next_instance_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    (now.as_nanos() as u64) ^ (u64::from(std::process::id()) << 32) ^ (seq << 1)
}

/// FNV-1a hash of a topic name, used as the demux key in data headers.
#[must_use]
pub fn topic_hash(topic: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in topic.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Payload type description exchanged during discovery.
///
/// Compatibility gates on `encoding` + `type_name` only; `schema` travels
/// with the descriptor for diagnostic tooling and never affects matching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataTypeDescriptor {
    /// Serialization format identifier (e.g. `raw`, `proto`, `json`)
    pub encoding: String,
    /// Fully qualified type name within the encoding
    pub type_name: String,
    /// Optional schema blob (descriptor set, IDL text, ...)
    pub schema: Vec<u8>,
}

impl DataTypeDescriptor {
    /// Descriptor of an untyped byte stream. Matches any other descriptor.
    pub fn raw() -> Self {
        Self::default()
    }

    /// A wildcard descriptor carries neither encoding nor type name.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.encoding.is_empty() && self.type_name.is_empty()
    }

    /// Two endpoints match if encoding and type name agree, or if either
    /// side declares the wildcard/raw type.
    #[must_use]
    pub fn is_compatible_with(&self, other: &DataTypeDescriptor) -> bool {
        if self.is_wildcard() || other.is_wildcard() {
            return true;
        }
        self.encoding == other.encoding && self.type_name == other.type_name
    }
}

/// Delivery reliability requested by an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum Reliability {
    /// Loss is tolerated (SHM/UDP layers)
    #[default]
    BestEffort = 0,
    /// Ordered, connection-oriented delivery (TCP layer)
    Reliable = 1,
}

/// History depth requested by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum History {
    /// Keep only the most recent `depth` samples
    KeepLast(u32),
    /// Keep everything buffering allows
    KeepAll,
}

impl Default for History {
    fn default() -> Self {
        Self::KeepLast(1)
    }
}

/// Quality of service attached to a registration sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QoS {
    pub reliability: Reliability,
    pub history: History,
}

impl QoS {
    /// Best-effort, keep-last-1. The default for high-rate topics.
    pub fn best_effort() -> Self {
        Self::default()
    }

    /// Reliable delivery with the given history depth.
    pub fn reliable(depth: u32) -> Self {
        Self {
            reliability: Reliability::Reliable,
            history: History::KeepLast(depth),
        }
    }
}
