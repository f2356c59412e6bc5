// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Registry of remote entities with liveliness expiry.
//!
//! Mutated only by the registration receiver thread; the connection
//! manager reads it under the surrounding lock. An entry disappears when
//! its peer sends a retract sample or stops refreshing for longer than
//! the registration timeout.

use crate::types::EntityId;
use crate::wire::RegistrationSample;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Change notifications produced by registry mutation.
#[derive(Debug, Clone)]
pub enum RegistrationEvent {
    /// First sighting of an entity
    Connected(RegistrationSample),
    /// Refresh that changed advertised attributes (segment name, port, ...)
    Updated(RegistrationSample),
    /// Retract received or liveliness expired
    Disconnected(RegistrationSample),
}

struct Entry {
    sample: RegistrationSample,
    last_seen: Instant,
}

/// EntityId -> latest sample + liveliness timestamp.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<EntityId, Entry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one received sample.
    ///
    /// Plain refreshes (no attribute change) return `None`: the gate only
    /// cares about membership and attribute changes, not heartbeats.
    pub fn apply(&mut self, sample: RegistrationSample) -> Option<RegistrationEvent> {
        let key = sample.entity_id.clone();

        if sample.retract {
            return self
                .entries
                .remove(&key)
                .map(|entry| RegistrationEvent::Disconnected(entry.sample));
        }

        match self.entries.get_mut(&key) {
            Some(entry) => {
                let changed = entry.sample.shm_segment != sample.shm_segment
                    || entry.sample.tcp_host != sample.tcp_host
                    || entry.sample.tcp_port != sample.tcp_port
                    || entry.sample.layer_flags != sample.layer_flags;
                entry.sample = sample.clone();
                entry.last_seen = Instant::now();
                changed.then_some(RegistrationEvent::Updated(sample))
            }
            None => {
                self.entries.insert(
                    key,
                    Entry {
                        sample: sample.clone(),
                        last_seen: Instant::now(),
                    },
                );
                Some(RegistrationEvent::Connected(sample))
            }
        }
    }

    /// Expire every entry not refreshed within `timeout`.
    pub fn sweep(&mut self, timeout: Duration) -> Vec<RegistrationEvent> {
        let now = Instant::now();
        let expired: Vec<EntityId> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_seen) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .map(|entry| {
                log::debug!(
                    "[REG] liveliness expired for {} {}",
                    entry.sample.kind,
                    entry.sample.entity_id
                );
                RegistrationEvent::Disconnected(entry.sample)
            })
            .collect()
    }

    /// Current sample for an entity, if alive.
    pub fn get(&self, id: &EntityId) -> Option<&RegistrationSample> {
        self.entries.get(id).map(|e| &e.sample)
    }

    /// Iterate all live samples.
    pub fn iter(&self) -> impl Iterator<Item = &RegistrationSample> {
        self.entries.values().map(|e| &e.sample)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything (shutdown); no events are produced.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataTypeDescriptor, EntityKind, QoS};

    fn sample(topic: &str, instance: u64) -> RegistrationSample {
        RegistrationSample {
            kind: EntityKind::Publisher,
            retract: false,
            clock: 0,
            entity_id: EntityId {
                host_name: "h".into(),
                process_id: 1,
                entity: topic.into(),
                instance_id: instance,
            },
            descriptor: DataTypeDescriptor::raw(),
            qos: QoS::default(),
            layer_flags: 0,
            shm_segment: String::new(),
            tcp_host: String::new(),
            tcp_port: 0,
        }
    }

    #[test]
    fn test_first_sample_connects() {
        let mut registry = Registry::new();
        let event = registry.apply(sample("t", 1));
        assert!(matches!(event, Some(RegistrationEvent::Connected(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_refresh_is_silent() {
        let mut registry = Registry::new();
        registry.apply(sample("t", 1));
        let event = registry.apply(sample("t", 1));
        assert!(event.is_none(), "plain heartbeat must not emit an event");
    }

    #[test]
    fn test_attribute_change_updates() {
        let mut registry = Registry::new();
        registry.apply(sample("t", 1));

        let mut changed = sample("t", 1);
        changed.shm_segment = "/axon_new_segment".into();
        let event = registry.apply(changed);
        assert!(matches!(event, Some(RegistrationEvent::Updated(_))));
    }

    #[test]
    fn test_retract_disconnects_immediately() {
        let mut registry = Registry::new();
        registry.apply(sample("t", 1));

        let event = registry.apply(sample("t", 1).retracted());
        assert!(matches!(event, Some(RegistrationEvent::Disconnected(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_retract_of_unknown_is_silent() {
        let mut registry = Registry::new();
        assert!(registry.apply(sample("t", 9).retracted()).is_none());
    }

    #[test]
    fn test_sweep_expires_stale_entries() {
        let mut registry = Registry::new();
        registry.apply(sample("t", 1));

        // Zero timeout: everything older than "now" expires.
        std::thread::sleep(Duration::from_millis(5));
        let events = registry.sweep(Duration::from_millis(1));
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], RegistrationEvent::Disconnected(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_sweep_keeps_fresh_entries() {
        let mut registry = Registry::new();
        registry.apply(sample("t", 1));
        let events = registry.sweep(Duration::from_secs(60));
        assert!(events.is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_two_instances_same_topic_coexist() {
        let mut registry = Registry::new();
        registry.apply(sample("t", 1));
        registry.apply(sample("t", 2));
        assert_eq!(registry.len(), 2);
    }
}
