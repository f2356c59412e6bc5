// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Table of entities registered by the local process.
//!
//! Publishers, subscribers and services register here on creation; the
//! broadcaster snapshots the table every refresh tick. Unregistration
//! queues a retract sample so peers expire the entity immediately instead
//! of waiting for the liveliness timeout.

use crate::types::{DataTypeDescriptor, EntityId, EntityKind, QoS};
use crate::wire::RegistrationSample;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

/// Advertised attributes of one local entity.
#[derive(Debug, Clone)]
pub struct LocalEntityInfo {
    pub kind: EntityKind,
    pub descriptor: DataTypeDescriptor,
    pub qos: QoS,
    /// `wire::registration::LAYER_*` bits this endpoint offers
    pub layer_flags: u8,
    /// Current SHM segment name (publishers; changes when the ring grows)
    pub shm_segment: String,
    /// Address peers dial for `tcp_port`
    pub tcp_host: String,
    /// TCP listen port (publishers and service servers)
    pub tcp_port: u16,
}

/// Shared registry of everything this context announces.
#[derive(Default)]
pub struct LocalEntities {
    entries: RwLock<HashMap<EntityId, LocalEntityInfo>>,
    retracts: Mutex<Vec<RegistrationSample>>,
}

impl LocalEntities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce a new entity from the next broadcast tick on.
    pub fn register(&self, id: EntityId, info: LocalEntityInfo) {
        log::debug!("[REG] local {} registered: {}", info.kind, id);
        self.entries.write().insert(id, info);
    }

    /// Mutate advertised attributes (e.g. a grown SHM segment name).
    pub fn update(&self, id: &EntityId, mutate: impl FnOnce(&mut LocalEntityInfo)) {
        if let Some(info) = self.entries.write().get_mut(id) {
            mutate(info);
        }
    }

    /// Remove the entity and queue its retract sample.
    pub fn unregister(&self, id: &EntityId) {
        if let Some(info) = self.entries.write().remove(id) {
            log::debug!("[REG] local {} unregistered: {}", info.kind, id);
            self.retracts
                .lock()
                .push(sample_of(id.clone(), &info, 0).retracted());
        }
    }

    /// Samples for every live entity, stamped with `clock`.
    pub fn snapshot(&self, clock: u64) -> Vec<RegistrationSample> {
        self.entries
            .read()
            .iter()
            .map(|(id, info)| sample_of(id.clone(), info, clock))
            .collect()
    }

    /// Drain retract samples queued since the last tick.
    pub fn take_retracts(&self) -> Vec<RegistrationSample> {
        std::mem::take(&mut *self.retracts.lock())
    }

    /// Look up one entity's advertised info.
    pub fn get(&self, id: &EntityId) -> Option<LocalEntityInfo> {
        self.entries.read().get(id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

fn sample_of(id: EntityId, info: &LocalEntityInfo, clock: u64) -> RegistrationSample {
    RegistrationSample {
        kind: info.kind,
        retract: false,
        clock,
        entity_id: id,
        descriptor: info.descriptor.clone(),
        qos: info.qos,
        layer_flags: info.layer_flags,
        shm_segment: info.shm_segment.clone(),
        tcp_host: info.tcp_host.clone(),
        tcp_port: info.tcp_port,
    }
}
