// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Decentralized discovery without a rendezvous server.
//!
//! Every process broadcasts snapshots of its entities on a fixed timer
//! and consumes the broadcasts of its peers into a local [`Registry`].
//! There is no coordinator: membership is the fixpoint of everyone
//! announcing themselves, and absence is detected by liveliness expiry.
//!
//! ```text
//!  process A                                 process B
//!  +------------------+   UDP multicast      +------------------+
//!  | Broadcaster ---- | --- or SHM bus ----> | Receiver         |
//!  | (refresh timer)  |                      |   |- Registry    |
//!  | Receiver <------ | <------------------- | Broadcaster      |
//!  +------------------+                      +------------------+
//! ```

mod broadcaster;
mod channel;
mod local;
mod receiver;
mod registry;

pub use broadcaster::RegistrationBroadcaster;
pub use channel::{create_channel, DiscoveryRx, DiscoveryTx, MAX_DISCOVERY_FRAME};
pub use local::{LocalEntities, LocalEntityInfo};
pub use receiver::{EventHandler, ReceiverStats, RegistrationReceiver, SweepHandler};
pub use registry::{RegistrationEvent, Registry};
