// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! # Axon - brokerless publish/subscribe middleware
//!
//! Axon exchanges typed data samples between processes on one host or
//! across a network without any broker or rendezvous server. Discovery is
//! fully decentralized: every process periodically broadcasts what it
//! publishes, subscribes to and serves, and everyone keeps a local
//! registry of everyone else.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use axon::{Config, MiddlewareContext, QoS, StringSerializer};
//!
//! fn main() -> axon::Result<()> {
//!     let ctx = MiddlewareContext::initialize(Config::default())?;
//!
//!     let publisher = ctx.create_publisher("sensors/temp", StringSerializer, QoS::best_effort())?;
//!     publisher.send(&"23.5 C".to_string())?;
//!
//!     let subscriber = ctx.create_subscriber("sensors/temp", StringSerializer, QoS::best_effort())?;
//!     subscriber.set_callback(|msg: String, info| {
//!         println!("got {msg} (clock {})", info.clock);
//!     });
//!
//!     ctx.finalize();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Application Layer                           |
//! |    Publisher / Subscriber / ServiceServer / ServiceClient          |
//! +--------------------------------------------------------------------+
//! |                      Connection Management                         |
//! |    Gate (matching, layer selection) | dedup | gap detection        |
//! +--------------------------------------------------------------------+
//! |                       Registration Layer                           |
//! |    Broadcaster | Receiver | Registry | UDP multicast or SHM bus    |
//! +--------------------------------------------------------------------+
//! |                        Transport Layers                            |
//! |    Shared Memory (zero-copy) | UDP Multicast | TCP (executor)      |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`MiddlewareContext`] | Process-wide root; owns all background threads |
//! | [`Publisher`] | Sends typed samples to every matched subscriber |
//! | [`Subscriber`] | Receives typed samples, deduplicated across layers |
//! | [`ServiceServer`] | Named byte-in/byte-out methods over TCP |
//! | [`ServiceClient`] | Blocking and async calls to discovered servers |
//! | [`Config`] | Plain-struct configuration, validated at initialize |
//!
//! ## Delivery model
//!
//! A publisher/subscriber pair may run shared memory, UDP multicast and
//! TCP at the same time; the subscriber keeps the first arrival of every
//! `(publisher, clock)` pair and drops the rest. Ordering is guaranteed
//! only within one layer from one publisher; nothing is exactly-once.

/// Global configuration and validation.
pub mod config;
/// Process-wide lifecycle (`MiddlewareContext`).
pub mod context;
/// Publisher/subscriber façade, connection manager, events.
pub mod pubsub;
/// Decentralized discovery: broadcaster, receiver, registry.
pub mod registration;
/// Payload serializer contract.
pub mod ser;
/// Service RPC (client/server) on the TCP substrate.
pub mod service;
/// Concrete transports: shared memory, UDP multicast, TCP.
pub mod transport;
/// Entity identity, descriptors, QoS.
pub mod types;
/// Wire encodings for discovery and data traffic.
pub mod wire;

pub use config::{Config, ConfigError, DiscoveryChannelKind};
pub use context::MiddlewareContext;
pub use pubsub::{
    Error, EventCallback, PubSubEvent, Publisher, Result, SampleInfo, Subscriber,
};
pub use ser::{PayloadSerializer, RawBytes, SerializeError, StringSerializer};
pub use service::{CallStatus, ServiceClient, ServiceResponse, ServiceServer};
pub use transport::TransportLayer;
pub use types::{DataTypeDescriptor, EntityId, EntityKind, History, QoS, Reliability};

/// Axon version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
