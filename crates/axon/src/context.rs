// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Process-wide middleware lifecycle.
//!
//! One [`MiddlewareContext`] owns every background thread and shared
//! resource: the registration timer and receiver, the UDP demux thread,
//! the TCP executor pools and, through the gate, all endpoint cores.
//! There are no hidden singletons: tests run several contexts in one
//! process, each with its own identity on the discovery channel.
//!
//! All entity objects are only usable between [`MiddlewareContext::initialize`]
//! and [`MiddlewareContext::finalize`]; afterwards operations fail locally
//! with `Error::ContextClosed`, never by crashing.

use crate::config::Config;
use crate::pubsub::{Error, Gate, Publisher, PublisherCore, Result, Subscriber, SubscriberCore};
use crate::registration::{
    create_channel, LocalEntities, LocalEntityInfo, ReceiverStats, Registry,
    RegistrationBroadcaster, RegistrationReceiver,
};
use crate::ser::PayloadSerializer;
use crate::service::{ServiceClient, ServiceClientCore, ServiceServer, ServiceServerCore};
use crate::transport::tcp::TcpExecutor;
use crate::transport::udp::{create_send_socket, multicast_interfaces, UdpDemux};
use crate::types::{local_host_name, next_instance_id, EntityId, EntityKind, QoS};
use crate::wire::registration::{LAYER_SHM, LAYER_TCP, LAYER_UDP};
use parking_lot::{Mutex, RwLock};
use std::net::{SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Explicitly-owned root of one middleware instance.
pub struct MiddlewareContext {
    config: Config,
    context_id: u64,
    host_name: String,
    local_entities: Arc<LocalEntities>,
    registry: Arc<RwLock<Registry>>,
    gate: Arc<Gate>,
    broadcaster: Mutex<Option<RegistrationBroadcaster>>,
    receiver: Mutex<Option<RegistrationReceiver>>,
    executor: Option<Arc<TcpExecutor>>,
    demux: Option<Arc<UdpDemux>>,
    udp_send: Option<Arc<UdpSocket>>,
    closed: AtomicBool,
}

impl MiddlewareContext {
    /// Validate the configuration and bring up all background threads.
    pub fn initialize(config: Config) -> Result<Arc<Self>> {
        config.validate()?;

        let context_id = next_instance_id();
        let host_name = local_host_name();
        let process_entity = EntityId::local("");
        let local_entities = Arc::new(LocalEntities::new());
        let registry = Arc::new(RwLock::new(Registry::new()));
        let gate = Gate::new(&config, host_name.clone());

        let executor = if config.tcp.enable {
            Some(Arc::new(
                TcpExecutor::start(
                    config.tcp.reader_pool_size,
                    config.tcp.writer_pool_size,
                    config.tcp.max_frame_bytes,
                )
                .map_err(Error::Io)?,
            ))
        } else {
            None
        };

        let (demux, udp_send) = if config.udp.enable {
            let demux = UdpDemux::start(
                config.udp.group,
                config.udp.port,
                config.udp.recv_buffer,
                config.udp.max_datagram,
            )
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
            let socket =
                create_send_socket(config.udp.ttl, config.udp.loopback, config.udp.send_buffer)
                    .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
            (Some(Arc::new(demux)), Some(Arc::new(socket)))
        } else {
            (None, None)
        };

        let (tx, rx) = create_channel(&config.registration).map_err(Error::Io)?;

        let receiver = {
            let gate_events = Arc::clone(&gate);
            let gate_sweep = Arc::clone(&gate);
            RegistrationReceiver::start(
                context_id,
                config.registration.loopback,
                Arc::clone(&registry),
                rx,
                config.registration.refresh,
                config.registration.timeout,
                Arc::new(move |event| gate_events.handle_event(event)),
                Arc::new(move || gate_sweep.tick()),
            )
        };

        let broadcaster = RegistrationBroadcaster::start(
            context_id,
            process_entity,
            Arc::clone(&local_entities),
            tx,
            config.registration.refresh,
        );

        log::info!(
            "[GATE] context {context_id:016x} up on {host_name} (shm={}, udp={}, tcp={})",
            config.shm.enable,
            config.udp.enable,
            config.tcp.enable
        );

        Ok(Arc::new(Self {
            config,
            context_id,
            host_name,
            local_entities,
            registry,
            gate,
            broadcaster: Mutex::new(Some(broadcaster)),
            receiver: Mutex::new(Some(receiver)),
            executor,
            demux,
            udp_send,
            closed: AtomicBool::new(false),
        }))
    }

    /// Identity of this context on the discovery channel.
    #[must_use]
    pub fn context_id(&self) -> u64 {
        self.context_id
    }

    #[must_use]
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// Receiver-side discovery counters.
    pub fn registration_stats(&self) -> Option<Arc<ReceiverStats>> {
        self.receiver.lock().as_ref().map(|r| Arc::clone(&r.stats))
    }

    /// Number of remote entities currently known.
    pub fn known_entities(&self) -> usize {
        self.registry.read().len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ContextClosed);
        }
        Ok(())
    }

    /// IP this host advertises for inbound TCP sessions.
    fn advertised_host(&self) -> String {
        multicast_interfaces()
            .first()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    // ====================================================================
    // Entity factories
    // ====================================================================

    /// Create a typed publisher for `topic`.
    pub fn create_publisher<T, S>(
        self: &Arc<Self>,
        topic: &str,
        serializer: S,
        qos: QoS,
    ) -> Result<Publisher<T>>
    where
        S: PayloadSerializer<T> + 'static,
    {
        self.ensure_open()?;
        let entity_id = EntityId::local(topic);
        let descriptor = serializer.descriptor();

        let udp = match (&self.udp_send, self.config.udp.enable) {
            (Some(socket), true) => Some(crate::pubsub::publisher::UdpSendHandle {
                socket: Arc::clone(socket),
                dest: SocketAddrV4::new(self.config.udp.group, self.config.udp.port),
                max_datagram: self.config.udp.max_datagram,
            }),
            _ => None,
        };

        let core = PublisherCore::create(
            entity_id.clone(),
            descriptor.clone(),
            qos,
            self.config.shm.clone(),
            udp,
            self.executor.clone(),
            Arc::clone(&self.local_entities),
        )?;

        let mut layer_flags = 0u8;
        if self.config.shm.enable {
            layer_flags |= LAYER_SHM;
        }
        if self.config.udp.enable {
            layer_flags |= LAYER_UDP;
        }
        if core.tcp_port() != 0 {
            layer_flags |= LAYER_TCP;
        }
        self.local_entities.register(
            entity_id,
            LocalEntityInfo {
                kind: EntityKind::Publisher,
                descriptor,
                qos,
                layer_flags,
                shm_segment: core.shm_segment(),
                tcp_host: self.advertised_host(),
                tcp_port: core.tcp_port(),
            },
        );

        self.gate.add_publisher(Arc::clone(&core));
        self.gate.bootstrap(self.registry.read().iter());

        let ctx = Arc::clone(self);
        Ok(Publisher::new(
            core,
            Arc::new(serializer),
            Box::new(move |id| {
                ctx.gate.remove_publisher(id);
                ctx.local_entities.unregister(id);
            }),
        ))
    }

    /// Create a typed subscriber for `topic`.
    pub fn create_subscriber<T, S>(
        self: &Arc<Self>,
        topic: &str,
        serializer: S,
        qos: QoS,
    ) -> Result<Subscriber<T>>
    where
        T: 'static,
        S: PayloadSerializer<T> + 'static,
    {
        self.ensure_open()?;
        let entity_id = EntityId::local(topic);
        let descriptor = serializer.descriptor();

        let core = SubscriberCore::create(
            entity_id.clone(),
            descriptor.clone(),
            qos,
            self.config.shm.zero_copy,
            self.config.tcp.drop_out_of_order_messages,
            self.config.tcp.connect_timeout,
            self.config.tcp.max_reconnection_attempts,
            self.config.registration.refresh,
            self.executor.clone(),
        );

        let mut layer_flags = 0u8;
        if self.config.shm.enable {
            layer_flags |= LAYER_SHM;
        }
        if self.config.udp.enable {
            layer_flags |= LAYER_UDP;
        }
        if self.config.tcp.enable {
            layer_flags |= LAYER_TCP;
        }
        self.local_entities.register(
            entity_id,
            LocalEntityInfo {
                kind: EntityKind::Subscriber,
                descriptor,
                qos,
                layer_flags,
                shm_segment: String::new(),
                tcp_host: String::new(),
                tcp_port: 0,
            },
        );

        self.gate
            .add_subscriber(Arc::clone(&core), self.demux.as_deref());
        self.gate.bootstrap(self.registry.read().iter());

        let ctx = Arc::clone(self);
        Ok(Subscriber::new(
            core,
            Arc::new(serializer),
            Box::new(move |id| {
                ctx.gate.remove_subscriber(id, ctx.demux.as_deref());
                ctx.local_entities.unregister(id);
            }),
        ))
    }

    /// Create a service server exposing named methods.
    pub fn create_service_server(self: &Arc<Self>, service: &str) -> Result<ServiceServer> {
        self.ensure_open()?;
        let executor = self.executor.clone().ok_or(Error::TcpLayerDisabled)?;
        let entity_id = EntityId::local(service);

        let core = ServiceServerCore::create(entity_id.clone(), executor)?;
        self.local_entities.register(
            entity_id,
            LocalEntityInfo {
                kind: EntityKind::ServiceServer,
                descriptor: crate::types::DataTypeDescriptor::raw(),
                qos: QoS::default(),
                layer_flags: LAYER_TCP,
                shm_segment: String::new(),
                tcp_host: self.advertised_host(),
                tcp_port: core.tcp_port(),
            },
        );

        let ctx = Arc::clone(self);
        Ok(ServiceServer::new(
            core,
            Box::new(move |id| {
                ctx.local_entities.unregister(id);
            }),
        ))
    }

    /// Create a client for the named service.
    pub fn create_service_client(self: &Arc<Self>, service: &str) -> Result<ServiceClient> {
        self.ensure_open()?;
        let executor = self.executor.clone().ok_or(Error::TcpLayerDisabled)?;
        let entity_id = EntityId::local(service);

        let core = ServiceClientCore::create(
            entity_id.clone(),
            executor,
            self.config.tcp.connect_timeout,
            self.config.tcp.max_reconnection_attempts,
            self.config.registration.refresh,
        );
        self.local_entities.register(
            entity_id,
            LocalEntityInfo {
                kind: EntityKind::ServiceClient,
                descriptor: crate::types::DataTypeDescriptor::raw(),
                qos: QoS::default(),
                layer_flags: LAYER_TCP,
                shm_segment: String::new(),
                tcp_host: String::new(),
                tcp_port: 0,
            },
        );

        self.gate.add_service_client(Arc::clone(&core));
        self.gate.bootstrap(self.registry.read().iter());

        let ctx = Arc::clone(self);
        Ok(ServiceClient::new(
            core,
            Box::new(move |id| {
                ctx.gate.remove_service_client(id);
                ctx.local_entities.unregister(id);
            }),
        ))
    }

    // ====================================================================
    // Teardown
    // ====================================================================

    /// Stop all background threads and release every shared resource.
    ///
    /// Safe to call while publisher threads are mid-`send`: their next
    /// operation fails with `ContextClosed` instead of deadlocking or
    /// corrupting shared state. Idempotent.
    pub fn finalize(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("[GATE] context {:016x} shutting down", self.context_id);

        // 1. Retract our entities so peers expire us immediately.
        if let Some(mut broadcaster) = self.broadcaster.lock().take() {
            broadcaster.stop();
        }
        // 2. Stop consuming discovery traffic.
        if let Some(mut receiver) = self.receiver.lock().take() {
            receiver.stop();
        }
        // 3. Close endpoint cores: SHM reader threads, rings, sessions.
        self.gate.close();
        // 4. Drop the transport machinery.
        if let Some(demux) = &self.demux {
            demux.shutdown();
        }
        if let Some(executor) = &self.executor {
            executor.shutdown();
        }
        self.registry.write().clear();
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for MiddlewareContext {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigError, DiscoveryChannelKind};
    use crate::ser::StringSerializer;
    use std::time::Duration;

    fn test_config() -> Config {
        // Shared-memory discovery on a unique domain: no sockets, no
        // cross-talk between parallel tests.
        let mut config = Config::default();
        config.registration.channel = DiscoveryChannelKind::SharedMemory;
        config.registration.domain = format!("ctx_test_{}", next_instance_id());
        config.registration.refresh = Duration::from_millis(100);
        config.registration.timeout = Duration::from_millis(500);
        config.udp.enable = false;
        config.tcp.enable = false;
        config.priority_local = vec![crate::transport::TransportLayer::Shm];
        config.priority_remote = vec![];
        config
    }

    #[test]
    fn test_invalid_config_rejected_at_initialize() {
        let mut config = test_config();
        config.registration.timeout = config.registration.refresh;
        match MiddlewareContext::initialize(config) {
            Err(Error::Config(ConfigError::TimeoutNotAboveRefresh { .. })) => {}
            Err(other) => panic!("wrong rejection: {other}"),
            Ok(_) => panic!("invalid config must be rejected"),
        }
    }

    #[test]
    fn test_initialize_finalize_cycle() {
        let ctx = MiddlewareContext::initialize(test_config()).expect("init");
        assert!(!ctx.is_finalized());
        ctx.finalize();
        assert!(ctx.is_finalized());
        ctx.finalize(); // idempotent
    }

    #[test]
    fn test_create_after_finalize_fails() {
        let ctx = MiddlewareContext::initialize(test_config()).expect("init");
        ctx.finalize();
        let result = ctx.create_publisher("t", StringSerializer, QoS::default());
        assert!(matches!(result, Err(Error::ContextClosed)));
    }

    #[test]
    fn test_service_creation_requires_tcp() {
        let ctx = MiddlewareContext::initialize(test_config()).expect("init");
        assert!(matches!(
            ctx.create_service_server("svc"),
            Err(Error::TcpLayerDisabled)
        ));
        assert!(matches!(
            ctx.create_service_client("svc"),
            Err(Error::TcpLayerDisabled)
        ));
        ctx.finalize();
    }

    #[test]
    fn test_publisher_advertises_its_layers() {
        let ctx = MiddlewareContext::initialize(test_config()).expect("init");
        let publisher = ctx
            .create_publisher("topic/adv", StringSerializer, QoS::default())
            .expect("publisher");

        let id = publisher.id().clone();
        let info = ctx.local_entities.get(&id).expect("registered locally");
        assert_eq!(info.kind, EntityKind::Publisher);
        assert_ne!(info.layer_flags & LAYER_SHM, 0);
        assert!(info.shm_segment.starts_with("/axon_"));

        drop(publisher);
        assert!(ctx.local_entities.get(&id).is_none());
        ctx.finalize();
    }
}
