// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Subscriber: per-remote layer sessions, cross-layer dedup, gap
//! detection and callback dispatch.
//!
//! A subscriber may receive the same logical sample over several layers
//! at once; an LRU window over `(publisher instance, clock)` keeps the
//! first arrival and drops the rest. Clock gaps surface as `Dropped`
//! events, clock regressions obey `drop_out_of_order_messages`.

use super::{DataCallback, EventCallback, PubSubEvent, SampleInfo};
use crate::transport::shm::{PopResult, ShmError, ShmRingReader};
use crate::transport::tcp::{
    ConnId, EventSink, FrameCodec, FrameKind, Handshake, ReconnectPolicy, SessionRole,
    SessionState, TcpEvent, TcpExecutor,
};
use crate::transport::TransportLayer;
use crate::types::{topic_hash, DataTypeDescriptor, EntityId, QoS};
use crate::wire::{data::now_us, DataHeader, RegistrationSample};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Samples remembered for cross-layer dedup.
const DEDUP_WINDOW: usize = 1_024;

/// Subscriber-side counters.
#[derive(Debug, Default)]
pub struct SubscriberStats {
    pub delivered: AtomicU64,
    pub duplicates: AtomicU64,
    pub out_of_order_dropped: AtomicU64,
    pub deserialize_errors: AtomicU64,
    /// Samples dropped because the bounded hand-off queue was full
    pub queue_overflow: AtomicU64,
}

struct ShmAttachment {
    segment: String,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ShmAttachment {
    fn shut_down(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct TcpLink {
    conn: Option<ConnId>,
    state: SessionState,
    policy: ReconnectPolicy,
}

/// Everything known about one matched remote publisher.
struct RemotePublisher {
    sample: RegistrationSample,
    layers: Vec<TransportLayer>,
    shm: Option<ShmAttachment>,
    tcp: Option<TcpLink>,
    udp: bool,
}

impl RemotePublisher {
    fn new(sample: RegistrationSample) -> Self {
        Self {
            sample,
            layers: Vec::new(),
            shm: None,
            tcp: None,
            udp: false,
        }
    }
}

/// Dedup + ordering state, guarded as one unit.
struct FlowState {
    dedup: LruCache<(u64, u64), ()>,
    last_clock: HashMap<u64, u64>,
}

/// Internal state of one subscriber instance.
pub struct SubscriberCore {
    pub entity_id: EntityId,
    pub topic_id: u64,
    pub descriptor: DataTypeDescriptor,
    pub qos: QoS,
    closed: AtomicBool,
    zero_copy: bool,
    drop_out_of_order: bool,
    connect_timeout: Duration,
    max_reconnect: u32,
    reconnect_backoff: Duration,

    data_cb: RwLock<Option<DataCallback>>,
    event_cb: RwLock<Option<EventCallback>>,
    flow: Mutex<FlowState>,
    remotes: Mutex<HashMap<EntityId, RemotePublisher>>,
    /// Publisher instance id -> entity, for naming Dropped events
    instances: Mutex<HashMap<u64, EntityId>>,
    /// Outbound TCP session -> remote publisher
    conn_index: Mutex<HashMap<ConnId, EntityId>>,
    sink_cache: Mutex<Option<EventSink>>,
    /// Detached reader threads awaiting a join outside the remotes lock
    graveyard: Mutex<Vec<ShmAttachment>>,
    executor: Option<Arc<TcpExecutor>>,
    pub stats: SubscriberStats,
}

impl SubscriberCore {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        entity_id: EntityId,
        descriptor: DataTypeDescriptor,
        qos: QoS,
        zero_copy: bool,
        drop_out_of_order: bool,
        connect_timeout: Duration,
        max_reconnect: u32,
        reconnect_backoff: Duration,
        executor: Option<Arc<TcpExecutor>>,
    ) -> Arc<Self> {
        let topic_id = topic_hash(&entity_id.entity);
        Arc::new(Self {
            entity_id,
            topic_id,
            descriptor,
            qos,
            closed: AtomicBool::new(false),
            zero_copy,
            drop_out_of_order,
            connect_timeout,
            max_reconnect,
            reconnect_backoff,
            data_cb: RwLock::new(None),
            event_cb: RwLock::new(None),
            flow: Mutex::new(FlowState {
                dedup: LruCache::new(NonZeroUsize::new(DEDUP_WINDOW).expect("nonzero")),
                last_clock: HashMap::new(),
            }),
            remotes: Mutex::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            conn_index: Mutex::new(HashMap::new()),
            sink_cache: Mutex::new(None),
            graveyard: Mutex::new(Vec::new()),
            executor,
            stats: SubscriberStats::default(),
        })
    }

    pub fn set_data_callback(&self, callback: Option<DataCallback>) {
        *self.data_cb.write() = callback;
    }

    pub fn set_event_callback(&self, callback: Option<EventCallback>) {
        *self.event_cb.write() = callback;
    }

    // ====================================================================
    // Delivery path (all layers funnel through here)
    // ====================================================================

    /// Deliver one complete message. Thread: SHM wait thread, UDP demux
    /// or TCP reader, whichever layer won the race.
    pub fn deliver(&self, header: DataHeader, payload: &[u8], layer: TransportLayer) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let receive_timestamp_us = now_us();
        let key = (header.sender, header.clock);

        let mut gap: Option<(u64, u64)> = None;
        {
            let mut flow = self.flow.lock();
            if flow.dedup.contains(&key) {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                return;
            }
            flow.dedup.put(key, ());

            let last = flow.last_clock.get(&header.sender).copied().unwrap_or(0);
            if header.clock <= last {
                if self.drop_out_of_order {
                    self.stats
                        .out_of_order_dropped
                        .fetch_add(1, Ordering::Relaxed);
                    return;
                }
            } else {
                if last != 0 && header.clock > last + 1 {
                    gap = Some((header.sender, header.clock - last - 1));
                }
                flow.last_clock.insert(header.sender, header.clock);
            }
        }

        if let Some((sender, lost)) = gap {
            let remote = self.instances.lock().get(&sender).cloned();
            if let Some(remote) = remote {
                self.raise(PubSubEvent::Dropped { remote, lost });
            }
        }

        let callback = self.data_cb.read().clone();
        if let Some(callback) = callback {
            let info = SampleInfo {
                source: header.sender,
                clock: header.clock,
                send_timestamp_us: header.send_timestamp_us,
                receive_timestamp_us,
                layer,
            };
            callback(payload, &info);
        }
        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
    }

    // ====================================================================
    // Gate-driven connection management (registration receiver thread)
    // ====================================================================

    /// Open/refresh layer sessions towards a matched remote publisher.
    pub fn apply_publisher(
        self: &Arc<Self>,
        sample: &RegistrationSample,
        layers: &[TransportLayer],
    ) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.instances
            .lock()
            .insert(sample.entity_id.instance_id, sample.entity_id.clone());

        let mut tcp_target = None;
        let mut events = Vec::new();
        {
            let mut remotes = self.remotes.lock();
            let entry = remotes
                .entry(sample.entity_id.clone())
                .or_insert_with(|| RemotePublisher::new(sample.clone()));
            entry.sample = sample.clone();
            entry.layers = layers.to_vec();

            for layer in layers {
                match layer {
                    TransportLayer::Shm => self.ensure_shm(entry, &mut events),
                    TransportLayer::Udp => {
                        if !entry.udp {
                            entry.udp = true;
                            events.push(PubSubEvent::Connected {
                                remote: entry.sample.entity_id.clone(),
                                layer: TransportLayer::Udp,
                            });
                        }
                    }
                    TransportLayer::Tcp => {
                        if let Some(target) = self.ensure_tcp(entry) {
                            tcp_target = Some(target);
                        }
                    }
                }
            }
        }
        for event in events {
            self.raise(event);
        }
        if let Some(target) = tcp_target {
            self.connect_tcp(target);
        }
    }

    /// The remote publisher vanished (retract or expiry): drop sessions.
    pub fn remove_publisher(&self, remote: &EntityId) {
        let entry = self.remotes.lock().remove(remote);
        let Some(mut entry) = entry else {
            return;
        };
        self.instances
            .lock()
            .remove(&entry.sample.entity_id.instance_id);

        if let Some(mut shm) = entry.shm.take() {
            shm.shut_down();
            self.raise(PubSubEvent::Disconnected {
                remote: remote.clone(),
                layer: TransportLayer::Shm,
            });
        }
        if entry.udp {
            self.raise(PubSubEvent::Disconnected {
                remote: remote.clone(),
                layer: TransportLayer::Udp,
            });
        }
        if let Some(link) = entry.tcp.take() {
            if let Some(conn) = link.conn {
                self.conn_index.lock().remove(&conn);
                if let Some(executor) = &self.executor {
                    executor.close(conn);
                }
            }
            if link.state == SessionState::Connected {
                self.raise(PubSubEvent::Disconnected {
                    remote: remote.clone(),
                    layer: TransportLayer::Tcp,
                });
            }
        }
    }

    /// Sweep-cadence housekeeping: retry missing SHM attachments and due
    /// TCP reconnects.
    pub fn tick(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut tcp_targets = Vec::new();
        let mut events = Vec::new();
        {
            let mut remotes = self.remotes.lock();
            for entry in remotes.values_mut() {
                if entry.layers.contains(&TransportLayer::Shm) {
                    self.ensure_shm(entry, &mut events);
                }
                if entry.layers.contains(&TransportLayer::Tcp) {
                    if let Some(target) = self.ensure_tcp(entry) {
                        tcp_targets.push(target);
                    }
                }
            }
        }
        for event in events {
            self.raise(event);
        }
        for target in tcp_targets {
            self.connect_tcp(target);
        }

        // Join superseded reader threads now that no lock is held.
        let dead: Vec<ShmAttachment> = std::mem::take(&mut *self.graveyard.lock());
        for mut attachment in dead {
            attachment.shut_down();
        }
    }

    /// Attach (or re-attach after a grow) to the advertised segment.
    /// Missing segments are retried on the next tick, never busy-polled.
    fn ensure_shm(self: &Arc<Self>, entry: &mut RemotePublisher, events: &mut Vec<PubSubEvent>) {
        let advertised = entry.sample.shm_segment.clone();
        if advertised.is_empty() {
            return;
        }
        let current = entry.shm.as_ref().map(|a| a.segment.clone());
        if current.as_deref() == Some(advertised.as_str()) {
            return;
        }

        // The old reader thread is joined on the next tick, outside the
        // remotes lock: it may be inside a user callback right now.
        let had_attachment = if let Some(old) = entry.shm.take() {
            old.stop.store(true, Ordering::Relaxed);
            self.graveyard.lock().push(old);
            true
        } else {
            false
        };

        match ShmRingReader::attach(&advertised) {
            Ok(reader) => {
                let stop = Arc::new(AtomicBool::new(false));
                let thread = self.spawn_shm_reader(reader, Arc::clone(&stop));
                entry.shm = Some(ShmAttachment {
                    segment: advertised,
                    stop,
                    thread: Some(thread),
                });
                if !had_attachment {
                    events.push(PubSubEvent::Connected {
                        remote: entry.sample.entity_id.clone(),
                        layer: TransportLayer::Shm,
                    });
                }
            }
            Err(ShmError::NotFound(name)) => {
                log::debug!("[SHM] segment {name} not there yet, retrying on next tick");
            }
            Err(e) => {
                log::debug!("[SHM] attach to {advertised} failed: {e}");
            }
        }
    }

    fn spawn_shm_reader(
        self: &Arc<Self>,
        mut reader: ShmRingReader,
        stop: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let core = Arc::clone(self);
        std::thread::Builder::new()
            .name("axon-shm-rx".to_string())
            .spawn(move || {
                let zero_copy = core.zero_copy;
                let mut scratch: Vec<u8> = Vec::new();
                while !stop.load(Ordering::Relaxed) && !core.closed.load(Ordering::Relaxed) {
                    let mut copied = false;
                    let result = reader.pop_blocking_with(
                        Some(Duration::from_millis(100)),
                        |message| {
                            if zero_copy {
                                // Slot stays held through the callback;
                                // the payload slice must not be retained.
                                if let Ok((header, payload)) = DataHeader::decode(message) {
                                    core.deliver(header, payload, TransportLayer::Shm);
                                }
                            } else {
                                scratch.clear();
                                scratch.extend_from_slice(message);
                                copied = true;
                            }
                        },
                    );
                    if copied {
                        // Copy mode: slot already released, deliver now.
                        if let Ok((header, payload)) = DataHeader::decode(&scratch) {
                            core.deliver(header, payload, TransportLayer::Shm);
                        }
                    }
                    if result == PopResult::Torn {
                        log::debug!("[SHM] torn read discarded (writer ran past ack timeout)");
                    }
                }
            })
            .expect("spawning the shm reader thread")
    }

    /// Bring the TCP link into a connectable state; returns the target
    /// to dial (outside the remotes lock) if an attempt is due.
    fn ensure_tcp(&self, entry: &mut RemotePublisher) -> Option<(EntityId, String, u16)> {
        if entry.sample.tcp_port == 0 {
            return None;
        }
        let link = entry.tcp.get_or_insert_with(|| TcpLink {
            conn: None,
            state: SessionState::NotConnected,
            policy: ReconnectPolicy::new(self.max_reconnect, self.reconnect_backoff),
        });
        if link.state != SessionState::NotConnected || !link.policy.due() {
            return None;
        }
        // Claim the attempt so a racing tick does not dial twice.
        link.state = SessionState::Handshake;
        let host = if entry.sample.tcp_host.is_empty() {
            "127.0.0.1".to_string()
        } else {
            entry.sample.tcp_host.clone()
        };
        Some((entry.sample.entity_id.clone(), host, entry.sample.tcp_port))
    }

    fn connect_tcp(self: &Arc<Self>, (remote, host, port): (EntityId, String, u16)) {
        let Some(executor) = self.executor.clone() else {
            return;
        };
        let addr = match format!("{host}:{port}").parse() {
            Ok(addr) => addr,
            Err(_) => {
                log::debug!("[TCP] unusable publisher address {host}:{port}");
                self.tcp_attempt_failed(&remote);
                return;
            }
        };

        match executor.connect(addr, self.connect_timeout, self.tcp_sink()) {
            Ok(conn) => {
                self.conn_index.lock().insert(conn, remote.clone());
                let handshake = Handshake::new(
                    SessionRole::Subscriber,
                    self.entity_id.clone(),
                    self.descriptor.clone(),
                );
                executor.send(
                    conn,
                    FrameCodec::encode(FrameKind::Handshake, &handshake.encode()),
                );
                let mut remotes = self.remotes.lock();
                if let Some(entry) = remotes.get_mut(&remote) {
                    if let Some(link) = entry.tcp.as_mut() {
                        link.conn = Some(conn);
                    }
                }
            }
            Err(e) => {
                log::debug!("[TCP] connect to {addr} failed: {e}");
                self.tcp_attempt_failed(&remote);
            }
        }
    }

    fn tcp_attempt_failed(&self, remote: &EntityId) {
        let mut remotes = self.remotes.lock();
        let Some(link) = remotes.get_mut(remote).and_then(|e| e.tcp.as_mut()) else {
            return;
        };
        if link.policy.register_failure() {
            link.state = SessionState::NotConnected;
        } else {
            log::debug!(
                "[TCP] reconnect budget exhausted for {remote}, session failed"
            );
            link.state = SessionState::Failed;
            drop(remotes);
            self.raise(PubSubEvent::Disconnected {
                remote: remote.clone(),
                layer: TransportLayer::Tcp,
            });
        }
    }

    /// Shared sink for all outbound sessions of this subscriber.
    fn tcp_sink(self: &Arc<Self>) -> EventSink {
        let mut cache = self.sink_cache.lock();
        if let Some(sink) = cache.as_ref() {
            return Arc::clone(sink);
        }
        let weak = Arc::downgrade(self);
        let sink: EventSink = Arc::new(move |event| {
            if let Some(core) = weak.upgrade() {
                core.on_tcp_event(event);
            }
        });
        *cache = Some(Arc::clone(&sink));
        sink
    }

    fn on_tcp_event(self: &Arc<Self>, event: TcpEvent) {
        match event {
            TcpEvent::Frame { conn, frame } => match frame.kind {
                FrameKind::HandshakeAck => self.on_handshake_ack(conn),
                FrameKind::Data => {
                    if let Ok((header, payload)) = DataHeader::decode(&frame.body) {
                        self.deliver(header, payload, TransportLayer::Tcp);
                    }
                }
                _ => {}
            },
            TcpEvent::Closed { conn, reason } => self.on_tcp_closed(conn, &reason),
            TcpEvent::Accepted { .. } => {}
        }
    }

    fn on_handshake_ack(&self, conn: ConnId) {
        let remote = self.conn_index.lock().get(&conn).cloned();
        let Some(remote) = remote else {
            return;
        };
        let mut connected = false;
        {
            let mut remotes = self.remotes.lock();
            if let Some(link) = remotes.get_mut(&remote).and_then(|e| e.tcp.as_mut()) {
                if link.state == SessionState::Handshake {
                    link.state = SessionState::Connected;
                    link.policy.reset();
                    connected = true;
                }
            }
        }
        if connected {
            self.raise(PubSubEvent::Connected {
                remote,
                layer: TransportLayer::Tcp,
            });
        }
    }

    fn on_tcp_closed(&self, conn: ConnId, reason: &str) {
        let remote = self.conn_index.lock().remove(&conn);
        let Some(remote) = remote else {
            return;
        };
        let mut was_connected = false;
        {
            let mut remotes = self.remotes.lock();
            if let Some(link) = remotes.get_mut(&remote).and_then(|e| e.tcp.as_mut()) {
                // conn may not be recorded yet when the peer rejects the
                // handshake immediately after accept.
                if link.conn == Some(conn) || link.conn.is_none() {
                    link.conn = None;
                    match link.state {
                        // Closed during handshake: version/topic mismatch
                        // on the publisher side. Terminal, no retry.
                        SessionState::Handshake => {
                            log::debug!(
                                "[TCP] handshake with {remote} rejected ({reason}), session failed"
                            );
                            link.state = SessionState::Failed;
                        }
                        SessionState::Connected => {
                            was_connected = true;
                            link.state = SessionState::NotConnected;
                        }
                        _ => {}
                    }
                }
            }
        }
        if was_connected {
            log::debug!("[TCP] session to {remote} lost ({reason}), will reconnect");
            self.raise(PubSubEvent::Disconnected {
                remote,
                layer: TransportLayer::Tcp,
            });
        }
    }

    fn raise(&self, event: PubSubEvent) {
        let callback = self.event_cb.read().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    /// Stop every layer session and reader thread.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Collect under the lock, join/close after releasing it: a
        // reader thread may be inside a user callback that touches this
        // subscriber.
        let mut attachments = Vec::new();
        let mut conns = Vec::new();
        {
            let mut remotes = self.remotes.lock();
            for (_, entry) in remotes.iter_mut() {
                if let Some(shm) = entry.shm.take() {
                    shm.stop.store(true, Ordering::Relaxed);
                    attachments.push(shm);
                }
                if let Some(link) = entry.tcp.as_mut() {
                    if let Some(conn) = link.conn.take() {
                        conns.push(conn);
                    }
                }
            }
            remotes.clear();
        }
        attachments.extend(std::mem::take(&mut *self.graveyard.lock()));
        for mut attachment in attachments {
            attachment.shut_down();
        }
        if let Some(executor) = &self.executor {
            for conn in conns {
                executor.close(conn);
            }
        }
        self.conn_index.lock().clear();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Remote publishers currently matched on any layer.
    pub fn connection_count(&self) -> usize {
        self.remotes.lock().len()
    }
}

/// Typed subscriber handed to user code.
pub struct Subscriber<T> {
    core: Arc<SubscriberCore>,
    serializer: Arc<dyn crate::ser::PayloadSerializer<T>>,
    on_drop: Option<Box<dyn FnOnce(&EntityId) + Send + Sync>>,
}

impl<T: 'static> Subscriber<T> {
    pub(crate) fn new(
        core: Arc<SubscriberCore>,
        serializer: Arc<dyn crate::ser::PayloadSerializer<T>>,
        on_drop: Box<dyn FnOnce(&EntityId) + Send + Sync>,
    ) -> Self {
        Self {
            core,
            serializer,
            on_drop: Some(on_drop),
        }
    }

    /// Register the data callback.
    ///
    /// Runs on the delivering layer's thread; it must not block
    /// unboundedly or the layer stalls (SHM additionally times out the
    /// slot acknowledge).
    pub fn set_callback(&self, callback: impl Fn(T, &SampleInfo) + Send + Sync + 'static) {
        let serializer = Arc::clone(&self.serializer);
        let core = Arc::clone(&self.core);
        self.core
            .set_data_callback(Some(Arc::new(move |payload, info| {
                match serializer.deserialize(payload) {
                    Ok(msg) => callback(msg, info),
                    Err(e) => {
                        core.stats.deserialize_errors.fetch_add(1, Ordering::Relaxed);
                        log::debug!("[GATE] dropping undecodable sample: {e}");
                    }
                }
            })));
    }

    /// Route samples into a bounded queue instead of running user code on
    /// the transport threads.
    ///
    /// Samples that would overflow the queue are dropped and counted;
    /// the delivering layer never blocks on a slow consumer. Replaces a
    /// previously registered callback.
    pub fn set_queue(&self, capacity: usize) -> crossbeam::channel::Receiver<(T, SampleInfo)>
    where
        T: Send,
    {
        let (tx, rx) = crossbeam::channel::bounded(capacity);
        let serializer = Arc::clone(&self.serializer);
        let core = Arc::clone(&self.core);
        self.core
            .set_data_callback(Some(Arc::new(move |payload, info| {
                match serializer.deserialize(payload) {
                    Ok(msg) => {
                        if tx.try_send((msg, *info)).is_err() {
                            core.stats.queue_overflow.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(e) => {
                        core.stats.deserialize_errors.fetch_add(1, Ordering::Relaxed);
                        log::debug!("[GATE] dropping undecodable sample: {e}");
                    }
                }
            })));
        rx
    }

    /// Register the connect/disconnect/dropped event callback.
    pub fn set_event_callback(&self, callback: impl Fn(PubSubEvent) + Send + Sync + 'static) {
        self.core.set_event_callback(Some(Arc::new(callback)));
    }

    pub fn id(&self) -> &EntityId {
        &self.core.entity_id
    }

    /// Remote publishers currently matched.
    pub fn connection_count(&self) -> usize {
        self.core.connection_count()
    }
}

impl<T> Drop for Subscriber<T> {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop(&self.core.entity_id);
        }
        self.core.close();
    }
}
