// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Connection manager: registry events in, layer sessions out.
//!
//! On every registry event the gate computes which local endpoints are
//! compatible with the remote entity (same topic, compatible type) and
//! tells them to open or close layer sessions, ordered by the configured
//! local/remote priority lists. It also fans incoming UDP messages out
//! to every local subscriber of a topic.

use super::publisher::PublisherCore;
use super::subscriber::SubscriberCore;
use crate::config::Config;
use crate::registration::RegistrationEvent;
use crate::service::client::ServiceClientCore;
use crate::transport::udp::UdpDemux;
use crate::transport::TransportLayer;
use crate::types::{EntityId, EntityKind};
use crate::wire::registration::{LAYER_SHM, LAYER_TCP, LAYER_UDP};
use crate::wire::RegistrationSample;
use dashmap::DashMap;
use std::sync::Arc;

/// Matches registry traffic against local endpoints.
pub struct Gate {
    host_name: String,
    priority_local: Vec<TransportLayer>,
    priority_remote: Vec<TransportLayer>,
    shm_enabled: bool,
    udp_enabled: bool,
    tcp_enabled: bool,

    publishers: DashMap<EntityId, Arc<PublisherCore>>,
    subscribers: DashMap<EntityId, Arc<SubscriberCore>>,
    service_clients: DashMap<EntityId, Arc<ServiceClientCore>>,
    /// Topic id -> local subscribers, consulted by the UDP demux handler
    udp_topics: Arc<DashMap<u64, Vec<Arc<SubscriberCore>>>>,
}

impl Gate {
    pub fn new(config: &Config, host_name: String) -> Arc<Self> {
        Arc::new(Self {
            host_name,
            priority_local: config.priority_local.clone(),
            priority_remote: config.priority_remote.clone(),
            shm_enabled: config.shm.enable,
            udp_enabled: config.udp.enable,
            tcp_enabled: config.tcp.enable,
            publishers: DashMap::new(),
            subscribers: DashMap::new(),
            service_clients: DashMap::new(),
            udp_topics: Arc::new(DashMap::new()),
        })
    }

    // ====================================================================
    // Endpoint registration
    // ====================================================================

    pub fn add_publisher(&self, core: Arc<PublisherCore>) {
        self.publishers.insert(core.entity_id.clone(), core);
    }

    pub fn remove_publisher(&self, id: &EntityId) {
        self.publishers.remove(id);
    }

    pub fn add_subscriber(&self, core: Arc<SubscriberCore>, demux: Option<&UdpDemux>) {
        if let Some(demux) = demux {
            let topic = core.topic_id;
            let mut first = false;
            self.udp_topics
                .entry(topic)
                .and_modify(|subs| subs.push(Arc::clone(&core)))
                .or_insert_with(|| {
                    first = true;
                    vec![Arc::clone(&core)]
                });
            if first {
                let map = Arc::clone(&self.udp_topics);
                demux.register(
                    topic,
                    Arc::new(move |header, bytes| {
                        // Clone out of the shard before running callbacks;
                        // a callback may create/drop subscribers.
                        let subs = map.get(&topic).map(|entry| entry.value().clone());
                        if let Some(subs) = subs {
                            for sub in subs {
                                sub.deliver(header, &bytes, TransportLayer::Udp);
                            }
                        }
                    }),
                );
            }
        }
        self.subscribers.insert(core.entity_id.clone(), core);
    }

    pub fn remove_subscriber(&self, id: &EntityId, demux: Option<&UdpDemux>) {
        let Some((_, core)) = self.subscribers.remove(id) else {
            return;
        };
        let topic = core.topic_id;
        let mut now_empty = false;
        if let Some(mut subs) = self.udp_topics.get_mut(&topic) {
            subs.retain(|s| s.entity_id != *id);
            now_empty = subs.is_empty();
        }
        if now_empty {
            self.udp_topics.remove(&topic);
            if let Some(demux) = demux {
                demux.unregister(topic);
            }
        }
    }

    pub fn add_service_client(&self, core: Arc<ServiceClientCore>) {
        self.service_clients.insert(core.entity_id.clone(), core);
    }

    pub fn remove_service_client(&self, id: &EntityId) {
        self.service_clients.remove(id);
    }

    // ====================================================================
    // Registry event handling (registration receiver thread)
    // ====================================================================

    pub fn handle_event(&self, event: RegistrationEvent) {
        match event {
            RegistrationEvent::Connected(sample) | RegistrationEvent::Updated(sample) => {
                self.entity_alive(&sample);
            }
            RegistrationEvent::Disconnected(sample) => self.entity_gone(&sample),
        }
    }

    fn entity_alive(&self, sample: &RegistrationSample) {
        match sample.kind {
            EntityKind::Publisher => {
                let layers = self.select_layers(sample);
                if layers.is_empty() {
                    return;
                }
                for sub in self.subscribers.iter() {
                    if Self::matches(sample, &sub.entity_id.entity, &sub.descriptor) {
                        sub.apply_publisher(sample, &layers);
                    }
                }
            }
            EntityKind::Subscriber => {
                let layers = self.select_layers(sample);
                for publisher in self.publishers.iter() {
                    if Self::matches(sample, &publisher.entity_id.entity, &publisher.descriptor) {
                        for layer in &layers {
                            // TCP attachment is handshake-driven; the
                            // gate only tracks the connectionless layers.
                            match layer {
                                TransportLayer::Shm | TransportLayer::Udp => {
                                    publisher.layer_up(&sample.entity_id, *layer);
                                }
                                TransportLayer::Tcp => {}
                            }
                        }
                    }
                }
            }
            EntityKind::ServiceServer => {
                for client in self.service_clients.iter() {
                    if client.service_name() == sample.entity_id.entity {
                        client.apply_server(sample);
                    }
                }
            }
            EntityKind::Process | EntityKind::ServiceClient => {}
        }
    }

    fn entity_gone(&self, sample: &RegistrationSample) {
        match sample.kind {
            EntityKind::Publisher => {
                for sub in self.subscribers.iter() {
                    if Self::matches(sample, &sub.entity_id.entity, &sub.descriptor) {
                        sub.remove_publisher(&sample.entity_id);
                    }
                }
            }
            EntityKind::Subscriber => {
                for publisher in self.publishers.iter() {
                    if Self::matches(sample, &publisher.entity_id.entity, &publisher.descriptor) {
                        publisher.remote_gone(&sample.entity_id);
                    }
                }
            }
            EntityKind::ServiceServer => {
                for client in self.service_clients.iter() {
                    if client.service_name() == sample.entity_id.entity {
                        client.remove_server(&sample.entity_id);
                    }
                }
            }
            EntityKind::Process | EntityKind::ServiceClient => {}
        }
    }

    /// Re-run matching against an existing registry snapshot; used when
    /// an endpoint is created after its peers were already discovered.
    /// All apply paths are idempotent, so replaying is safe.
    pub fn bootstrap<'a>(&self, samples: impl Iterator<Item = &'a RegistrationSample>) {
        for sample in samples {
            self.entity_alive(sample);
        }
    }

    /// Sweep-cadence housekeeping: reconnects and pending attachments.
    pub fn tick(&self) {
        for sub in self.subscribers.iter() {
            sub.tick();
        }
        for client in self.service_clients.iter() {
            client.tick();
        }
    }

    /// Tear everything down (context finalize).
    pub fn close(&self) {
        for publisher in self.publishers.iter() {
            publisher.close();
        }
        for sub in self.subscribers.iter() {
            sub.close();
        }
        for client in self.service_clients.iter() {
            client.close();
        }
        self.publishers.clear();
        self.subscribers.clear();
        self.service_clients.clear();
        self.udp_topics.clear();
    }

    // ====================================================================
    // Matching
    // ====================================================================

    fn matches(
        sample: &RegistrationSample,
        local_topic: &str,
        local_descriptor: &crate::types::DataTypeDescriptor,
    ) -> bool {
        sample.entity_id.entity == local_topic
            && sample.descriptor.is_compatible_with(local_descriptor)
    }

    /// Layers eligible for a remote endpoint, in priority order. Every
    /// eligible layer is activated; the subscriber dedups the overlap.
    fn select_layers(&self, remote: &RegistrationSample) -> Vec<TransportLayer> {
        let same_host = remote.entity_id.host_name == self.host_name;
        let priorities = if same_host {
            &self.priority_local
        } else {
            &self.priority_remote
        };
        priorities
            .iter()
            .copied()
            .filter(|layer| match layer {
                TransportLayer::Shm => {
                    same_host && self.shm_enabled && remote.layer_flags & LAYER_SHM != 0
                }
                TransportLayer::Udp => self.udp_enabled && remote.layer_flags & LAYER_UDP != 0,
                TransportLayer::Tcp => self.tcp_enabled && remote.layer_flags & LAYER_TCP != 0,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataTypeDescriptor, QoS};

    fn gate() -> Arc<Gate> {
        Gate::new(&Config::default(), "local-host".to_string())
    }

    fn remote_publisher(topic: &str, host: &str, flags: u8) -> RegistrationSample {
        RegistrationSample {
            kind: EntityKind::Publisher,
            retract: false,
            clock: 1,
            entity_id: EntityId {
                host_name: host.into(),
                process_id: 9,
                entity: topic.into(),
                instance_id: 77,
            },
            descriptor: DataTypeDescriptor::raw(),
            qos: QoS::default(),
            layer_flags: flags,
            shm_segment: "/axon_remote_seg".into(),
            tcp_host: "127.0.0.1".into(),
            tcp_port: 19_999,
        }
    }

    #[test]
    fn test_layer_selection_local_prefers_shm() {
        let gate = gate();
        let sample = remote_publisher("t", "local-host", LAYER_SHM | LAYER_UDP | LAYER_TCP);
        let layers = gate.select_layers(&sample);
        assert_eq!(
            layers,
            vec![TransportLayer::Shm, TransportLayer::Udp, TransportLayer::Tcp]
        );
    }

    #[test]
    fn test_layer_selection_remote_excludes_shm() {
        let gate = gate();
        let sample = remote_publisher("t", "other-host", LAYER_SHM | LAYER_UDP | LAYER_TCP);
        let layers = gate.select_layers(&sample);
        assert!(!layers.contains(&TransportLayer::Shm));
        assert!(layers.contains(&TransportLayer::Udp));
    }

    #[test]
    fn test_layer_selection_honors_remote_flags() {
        let gate = gate();
        let sample = remote_publisher("t", "other-host", LAYER_TCP);
        let layers = gate.select_layers(&sample);
        assert_eq!(layers, vec![TransportLayer::Tcp]);
    }

    #[test]
    fn test_matching_gates_on_topic_and_type() {
        let typed = DataTypeDescriptor {
            encoding: "proto".into(),
            type_name: "pkg.A".into(),
            schema: Vec::new(),
        };
        let mut sample = remote_publisher("t", "h", LAYER_UDP);
        sample.descriptor = typed.clone();

        assert!(Gate::matches(&sample, "t", &typed));
        assert!(Gate::matches(&sample, "t", &DataTypeDescriptor::raw()));
        assert!(!Gate::matches(&sample, "other", &typed));

        let mut incompatible = typed;
        incompatible.type_name = "pkg.B".into();
        assert!(!Gate::matches(&sample, "t", &incompatible));
    }
}
