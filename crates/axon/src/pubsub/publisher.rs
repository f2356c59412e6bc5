// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Publisher: serialize once, fan out to every active layer.
//!
//! A publisher owns its SHM ring (grown on demand, never shrunk), a TCP
//! listener for pull-style subscribers and a handle to the shared UDP
//! multicast socket. The sample clock is strictly monotonic per publisher
//! instance and scopes the cross-layer dedup on the subscriber side.

use super::{Error, EventCallback, PubSubEvent, Result};
use crate::config::ShmConfig;
use crate::registration::LocalEntities;
use crate::transport::shm::{segment_name, ShmRingWriter};
use crate::transport::tcp::{
    ConnId, Frame, FrameCodec, FrameKind, Handshake, SessionRole, TcpEvent, TcpExecutor,
};
use crate::transport::udp::fragment_message;
use crate::transport::TransportLayer;
use crate::types::{topic_hash, DataTypeDescriptor, EntityId, QoS};
use crate::wire::{DataHeader, WIRE_VERSION};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::{SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared UDP send path handed to every publisher of a context.
pub struct UdpSendHandle {
    pub socket: Arc<UdpSocket>,
    pub dest: SocketAddrV4,
    pub max_datagram: usize,
}

/// Publisher-side counters.
#[derive(Debug, Default)]
pub struct PublisherStats {
    pub sent: AtomicU64,
    /// Sends where a layer failed locally (segment could not grow, ...)
    pub local_failures: AtomicU64,
}

/// Internal state of one publisher instance.
pub struct PublisherCore {
    pub entity_id: EntityId,
    pub topic_id: u64,
    pub descriptor: DataTypeDescriptor,
    pub qos: QoS,
    closed: AtomicBool,
    clock: AtomicU64,

    // Shared memory
    shm: Mutex<Option<ShmRingWriter>>,
    shm_cfg: ShmConfig,
    local_entities: Arc<LocalEntities>,

    // UDP multicast
    udp: Option<UdpSendHandle>,
    udp_subscribers: AtomicUsize,

    // TCP
    executor: Option<Arc<TcpExecutor>>,
    tcp_port: AtomicU16,
    tcp_conns: DashMap<ConnId, EntityId>,

    event_cb: RwLock<Option<EventCallback>>,
    /// Remote subscribers per layer, for events and introspection
    remotes: Mutex<HashMap<EntityId, Vec<TransportLayer>>>,
    pub stats: PublisherStats,
}

impl PublisherCore {
    /// Build a publisher and bring up its per-layer resources.
    pub fn create(
        entity_id: EntityId,
        descriptor: DataTypeDescriptor,
        qos: QoS,
        shm_cfg: ShmConfig,
        udp: Option<UdpSendHandle>,
        executor: Option<Arc<TcpExecutor>>,
        local_entities: Arc<LocalEntities>,
    ) -> Result<Arc<Self>> {
        let topic_id = topic_hash(&entity_id.entity);

        let shm = if shm_cfg.enable {
            let name = segment_name(&entity_id.entity);
            let ack = (shm_cfg.acknowledge_timeout_ms > 0)
                .then(|| Duration::from_millis(shm_cfg.acknowledge_timeout_ms));
            Some(ShmRingWriter::create(
                &name,
                shm_cfg.buffer_count,
                shm_cfg.min_size,
                1,
                ack,
            )?)
        } else {
            None
        };

        let core = Arc::new(Self {
            entity_id,
            topic_id,
            descriptor,
            qos,
            closed: AtomicBool::new(false),
            clock: AtomicU64::new(0),
            shm: Mutex::new(shm),
            shm_cfg,
            local_entities,
            udp,
            udp_subscribers: AtomicUsize::new(0),
            executor,
            tcp_port: AtomicU16::new(0),
            tcp_conns: DashMap::new(),
            event_cb: RwLock::new(None),
            remotes: Mutex::new(HashMap::new()),
            stats: PublisherStats::default(),
        });

        // TCP listener: accepted subscribers handshake before any data.
        if let Some(executor) = core.executor.clone() {
            let weak = Arc::downgrade(&core);
            let port = executor
                .listen(Arc::new(move |event| {
                    if let Some(core) = weak.upgrade() {
                        core.on_tcp_event(event);
                    }
                }))
                .map_err(Error::Io)?;
            core.tcp_port.store(port, Ordering::Release);
        }

        Ok(core)
    }

    /// Advertised SHM segment name (empty when SHM is off).
    pub fn shm_segment(&self) -> String {
        self.shm
            .lock()
            .as_ref()
            .map(|w| w.segment_name().to_string())
            .unwrap_or_default()
    }

    /// Advertised TCP data port (0 when TCP is off).
    pub fn tcp_port(&self) -> u16 {
        self.tcp_port.load(Ordering::Acquire)
    }

    pub fn set_event_callback(&self, callback: Option<EventCallback>) {
        *self.event_cb.write() = callback;
    }

    /// Next value of the monotonically increasing sample clock.
    fn next_clock(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Serialize-once fan-out to all active layers.
    ///
    /// Returns `Ok(false)` when a layer failed locally (resource
    /// exhaustion) and nothing was delivered; transient network loss
    /// still counts as sent.
    pub fn send_bytes(&self, payload: &[u8]) -> Result<bool> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ContextClosed);
        }

        let clock = self.next_clock();
        let header = DataHeader::single(
            self.topic_id,
            self.entity_id.instance_id,
            clock,
            payload.len() as u32,
        );
        let mut message = Vec::with_capacity(crate::wire::DATA_HEADER_SIZE + payload.len());
        header.encode_into(&mut message);
        message.extend_from_slice(payload);

        let mut delivered = false;
        let mut local_failure = false;

        // Shared memory
        {
            let mut guard = self.shm.lock();
            if let Some(writer) = guard.as_mut() {
                match self.shm_push(writer, &message) {
                    Ok(grown) => {
                        delivered = true;
                        if let Some(new_name) = grown {
                            // Re-advertise; readers reattach on the next
                            // registration tick.
                            self.local_entities
                                .update(&self.entity_id, |info| info.shm_segment = new_name);
                        }
                    }
                    Err(e) => {
                        log::warn!("[GATE] shm send on {} failed: {e}", self.entity_id.entity);
                        local_failure = true;
                    }
                }
            }
        }

        // UDP multicast: only when matched subscribers listen
        if let Some(udp) = &self.udp {
            if self.udp_subscribers.load(Ordering::Acquire) > 0 {
                for datagram in fragment_message(
                    self.topic_id,
                    self.entity_id.instance_id,
                    clock,
                    payload,
                    udp.max_datagram,
                ) {
                    if let Err(e) = udp.socket.send_to(&datagram, udp.dest) {
                        log::debug!("[UDP] datagram send failed (transient): {e}");
                    }
                }
                delivered = true;
            }
        }

        // TCP: one frame, every handshaken session
        if let Some(executor) = &self.executor {
            if !self.tcp_conns.is_empty() {
                let frame = FrameCodec::encode(FrameKind::Data, &message);
                for entry in self.tcp_conns.iter() {
                    if executor.send(*entry.key(), frame.clone()) {
                        delivered = true;
                    }
                }
            }
        }

        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        if local_failure && !delivered {
            self.stats.local_failures.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }
        Ok(true)
    }

    /// Push into the ring, growing it (recreate + bumped generation)
    /// when the message outgrows the slot. Returns the new segment name
    /// after a grow.
    fn shm_push(&self, writer: &mut ShmRingWriter, message: &[u8]) -> Result<Option<String>> {
        let mut grown = None;
        if message.len() > writer.slot_size() {
            let new_size = message.len().next_power_of_two();
            let name = segment_name(&self.entity_id.entity);
            let ack = (self.shm_cfg.acknowledge_timeout_ms > 0)
                .then(|| Duration::from_millis(self.shm_cfg.acknowledge_timeout_ms));
            let new_writer = ShmRingWriter::create(
                &name,
                self.shm_cfg.buffer_count,
                new_size,
                writer.generation() + 1,
                ack,
            )?;
            log::debug!(
                "[SHM] grew segment for {}: {} -> {} bytes/slot",
                self.entity_id.entity,
                writer.slot_size(),
                new_size
            );
            let old = std::mem::replace(writer, new_writer);
            old.unlink().ok();
            grown = Some(writer.segment_name().to_string());
        }

        writer.push(message).map_err(Error::Shm)?;
        Ok(grown)
    }

    /// TCP listener events (executor reader threads).
    fn on_tcp_event(&self, event: TcpEvent) {
        match event {
            TcpEvent::Accepted { conn, peer } => {
                log::debug!(
                    "[TCP] subscriber candidate for {} from {peer} (conn {conn})",
                    self.entity_id.entity
                );
            }
            TcpEvent::Frame { conn, frame } => self.on_tcp_frame(conn, frame),
            TcpEvent::Closed { conn, .. } => {
                if let Some((_, remote)) = self.tcp_conns.remove(&conn) {
                    self.layer_down(&remote, TransportLayer::Tcp);
                }
            }
        }
    }

    fn on_tcp_frame(&self, conn: ConnId, frame: Frame) {
        if frame.kind != FrameKind::Handshake {
            return; // publishers never receive data frames
        }
        let Some(executor) = &self.executor else {
            return;
        };

        let handshake = match Handshake::decode(&frame.body) {
            Ok(hs) => hs,
            Err(e) => {
                log::debug!("[TCP] malformed handshake on conn {conn}: {e}");
                executor.close(conn);
                return;
            }
        };

        let acceptable = handshake.version == WIRE_VERSION
            && handshake.role == SessionRole::Subscriber
            && handshake.entity_id.entity == self.entity_id.entity
            && handshake.descriptor.is_compatible_with(&self.descriptor);
        if !acceptable {
            log::debug!(
                "[TCP] rejecting handshake v{} from {} on topic {}",
                handshake.version,
                handshake.entity_id,
                self.entity_id.entity
            );
            executor.close(conn);
            return;
        }

        executor.send(conn, FrameCodec::encode(FrameKind::HandshakeAck, &[]));
        self.tcp_conns.insert(conn, handshake.entity_id.clone());
        self.layer_up(&handshake.entity_id, TransportLayer::Tcp);
    }

    /// Gate bookkeeping: a matched remote subscriber appeared on `layer`.
    pub fn layer_up(&self, remote: &EntityId, layer: TransportLayer) {
        {
            let mut remotes = self.remotes.lock();
            let layers = remotes.entry(remote.clone()).or_default();
            if layers.contains(&layer) {
                return;
            }
            layers.push(layer);
        }
        if layer == TransportLayer::Udp {
            self.udp_subscribers.fetch_add(1, Ordering::AcqRel);
        }
        self.raise(PubSubEvent::Connected {
            remote: remote.clone(),
            layer,
        });
    }

    /// Gate bookkeeping: the remote subscriber left `layer`.
    pub fn layer_down(&self, remote: &EntityId, layer: TransportLayer) {
        {
            let mut remotes = self.remotes.lock();
            let Some(layers) = remotes.get_mut(remote) else {
                return;
            };
            let Some(index) = layers.iter().position(|l| *l == layer) else {
                return;
            };
            layers.remove(index);
            if layers.is_empty() {
                remotes.remove(remote);
            }
        }
        if layer == TransportLayer::Udp {
            self.udp_subscribers.fetch_sub(1, Ordering::AcqRel);
        }
        self.raise(PubSubEvent::Disconnected {
            remote: remote.clone(),
            layer,
        });
    }

    /// Every layer of `remote` went away (registration expiry/retract).
    pub fn remote_gone(&self, remote: &EntityId) {
        let layers = self
            .remotes
            .lock()
            .get(remote)
            .cloned()
            .unwrap_or_default();
        for layer in layers {
            self.layer_down(remote, layer);
        }
        // Drop any handshaken session of that subscriber.
        if let Some(executor) = &self.executor {
            let stale: Vec<ConnId> = self
                .tcp_conns
                .iter()
                .filter(|e| e.value() == remote)
                .map(|e| *e.key())
                .collect();
            for conn in stale {
                self.tcp_conns.remove(&conn);
                executor.close(conn);
            }
        }
    }

    /// Number of subscribers currently connected on any layer.
    pub fn connection_count(&self) -> usize {
        self.remotes.lock().len()
    }

    fn raise(&self, event: PubSubEvent) {
        let callback = self.event_cb.read().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    /// Tear down all layer resources. Safe to call while another thread
    /// is mid-`send_bytes`; the ring is unlinked after the lock is won.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(writer) = self.shm.lock().take() {
            writer.unlink().ok();
        }
        if let Some(executor) = &self.executor {
            for entry in self.tcp_conns.iter() {
                executor.close(*entry.key());
            }
        }
        self.tcp_conns.clear();
        self.remotes.lock().clear();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Typed publisher handed to user code.
///
/// Dropping it unregisters the entity (a retract goes out on the next
/// broadcast tick) and releases the per-layer resources.
pub struct Publisher<T> {
    core: Arc<PublisherCore>,
    serializer: Arc<dyn crate::ser::PayloadSerializer<T>>,
    on_drop: Option<Box<dyn FnOnce(&EntityId) + Send + Sync>>,
}

impl<T> Publisher<T> {
    pub(crate) fn new(
        core: Arc<PublisherCore>,
        serializer: Arc<dyn crate::ser::PayloadSerializer<T>>,
        on_drop: Box<dyn FnOnce(&EntityId) + Send + Sync>,
    ) -> Self {
        Self {
            core,
            serializer,
            on_drop: Some(on_drop),
        }
    }

    /// Serialize and send one message to every connected subscriber.
    pub fn send(&self, msg: &T) -> Result<bool> {
        let size = self.serializer.size(msg);
        let mut buf = vec![0u8; size];
        let written = self.serializer.serialize(msg, &mut buf)?;
        self.core.send_bytes(&buf[..written])
    }

    /// Register a connect/disconnect event callback.
    pub fn set_event_callback(&self, callback: impl Fn(PubSubEvent) + Send + Sync + 'static) {
        self.core.set_event_callback(Some(Arc::new(callback)));
    }

    /// This publisher's identity.
    pub fn id(&self) -> &EntityId {
        &self.core.entity_id
    }

    /// Subscribers currently connected on any layer.
    pub fn connection_count(&self) -> usize {
        self.core.connection_count()
    }
}

impl<T> Drop for Publisher<T> {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop(&self.core.entity_id);
        }
        self.core.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_core() -> Arc<PublisherCore> {
        PublisherCore::create(
            EntityId::local("pub/test"),
            DataTypeDescriptor::raw(),
            QoS::default(),
            ShmConfig {
                enable: true,
                buffer_count: 4,
                min_size: 256,
                zero_copy: false,
                acknowledge_timeout_ms: 0,
            },
            None,
            None,
            Arc::new(LocalEntities::new()),
        )
        .expect("create core")
    }

    #[test]
    fn test_clock_strictly_increasing() {
        let core = bare_core();
        core.send_bytes(b"a").expect("send");
        core.send_bytes(b"b").expect("send");
        assert_eq!(core.clock.load(Ordering::Relaxed), 2);
        core.close();
    }

    #[test]
    fn test_send_after_close_fails() {
        let core = bare_core();
        core.close();
        assert!(matches!(core.send_bytes(b"x"), Err(Error::ContextClosed)));
    }

    #[test]
    fn test_shm_segment_advertised() {
        let core = bare_core();
        assert!(core.shm_segment().starts_with("/axon_"));
        core.close();
    }

    #[test]
    fn test_segment_grows_for_large_payload() {
        let core = bare_core();
        let first = core.shm_segment();

        // 256-byte slots cannot hold this; the ring must be recreated.
        let big = vec![0xABu8; 100_000];
        assert!(core.send_bytes(&big).expect("send"));

        let second = core.shm_segment();
        assert_ne!(first, second, "grow must produce a fresh segment name");
        core.close();
    }

    #[test]
    fn test_layer_bookkeeping_events() {
        let core = bare_core();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        core.set_event_callback(Some(Arc::new(move |event| sink.lock().push(event))));

        let remote = EntityId::local("pub/test");
        core.layer_up(&remote, TransportLayer::Udp);
        core.layer_up(&remote, TransportLayer::Udp); // idempotent
        assert_eq!(core.udp_subscribers.load(Ordering::Relaxed), 1);
        assert_eq!(core.connection_count(), 1);

        core.remote_gone(&remote);
        assert_eq!(core.udp_subscribers.load(Ordering::Relaxed), 0);
        assert_eq!(core.connection_count(), 0);

        let events = events.lock();
        assert!(matches!(events[0], PubSubEvent::Connected { .. }));
        assert!(matches!(events[1], PubSubEvent::Disconnected { .. }));
        core.close();
    }

    #[test]
    fn test_close_unlinks_segment() {
        let core = bare_core();
        let name = core.shm_segment();
        assert!(crate::transport::shm::ShmSegment::exists(&name));
        core.close();
        assert!(!crate::transport::shm::ShmSegment::exists(&name));
    }
}
