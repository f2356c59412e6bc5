// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Service server: named byte-in/byte-out methods behind a TCP listener.
//!
//! Method callbacks run on the executor's reader threads; a slow method
//! therefore delays other sessions on the same pool thread and should
//! offload long work.

use super::types::{CallRequest, CallResponse, CallStatus};
use crate::pubsub::{Error, Result};
use crate::transport::tcp::{
    ConnId, Frame, FrameCodec, FrameKind, Handshake, SessionRole, TcpEvent, TcpExecutor,
};
use crate::types::{DataTypeDescriptor, EntityId};
use crate::wire::WIRE_VERSION;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

/// A registered method: request bytes in, response bytes out.
pub type MethodHandler =
    Arc<dyn Fn(&[u8]) -> std::result::Result<Vec<u8>, String> + Send + Sync>;

/// Server-side counters.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub calls: AtomicU64,
    pub unknown_method: AtomicU64,
    pub failed: AtomicU64,
}

/// Internal state of one service server instance.
pub struct ServiceServerCore {
    pub entity_id: EntityId,
    executor: Arc<TcpExecutor>,
    tcp_port: AtomicU16,
    methods: DashMap<String, MethodHandler>,
    /// Sessions that completed the handshake
    ready: DashSet<ConnId>,
    closed: AtomicBool,
    pub stats: ServerStats,
}

impl ServiceServerCore {
    pub fn create(entity_id: EntityId, executor: Arc<TcpExecutor>) -> Result<Arc<Self>> {
        let core = Arc::new(Self {
            entity_id,
            executor: Arc::clone(&executor),
            tcp_port: AtomicU16::new(0),
            methods: DashMap::new(),
            ready: DashSet::new(),
            closed: AtomicBool::new(false),
            stats: ServerStats::default(),
        });

        let weak = Arc::downgrade(&core);
        let port = executor
            .listen(Arc::new(move |event| {
                if let Some(core) = weak.upgrade() {
                    core.on_tcp_event(event);
                }
            }))
            .map_err(Error::Io)?;
        core.tcp_port.store(port, Ordering::Release);
        Ok(core)
    }

    /// Advertised listen port.
    pub fn tcp_port(&self) -> u16 {
        self.tcp_port.load(Ordering::Acquire)
    }

    /// Register (or replace) a method.
    pub fn register_method(&self, name: impl Into<String>, handler: MethodHandler) {
        self.methods.insert(name.into(), handler);
    }

    pub fn unregister_method(&self, name: &str) {
        self.methods.remove(name);
    }

    fn on_tcp_event(&self, event: TcpEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        match event {
            TcpEvent::Accepted { .. } => {}
            TcpEvent::Frame { conn, frame } => self.on_frame(conn, frame),
            TcpEvent::Closed { conn, .. } => {
                self.ready.remove(&conn);
            }
        }
    }

    fn on_frame(&self, conn: ConnId, frame: Frame) {
        match frame.kind {
            FrameKind::Handshake => self.on_handshake(conn, &frame.body),
            FrameKind::Request => self.on_request(conn, &frame.body),
            _ => {}
        }
    }

    fn on_handshake(&self, conn: ConnId, body: &[u8]) {
        let ok = Handshake::decode(body).is_ok_and(|hs| {
            hs.version == WIRE_VERSION
                && hs.role == SessionRole::ServiceClient
                && hs.entity_id.entity == self.entity_id.entity
        });
        if !ok {
            log::debug!(
                "[SVC] rejecting client handshake on service {}",
                self.entity_id.entity
            );
            self.executor.close(conn);
            return;
        }
        self.executor
            .send(conn, FrameCodec::encode(FrameKind::HandshakeAck, &[]));
        self.ready.insert(conn);
    }

    fn on_request(&self, conn: ConnId, body: &[u8]) {
        if !self.ready.contains(&conn) {
            // Request before handshake: protocol violation.
            self.executor.close(conn);
            return;
        }
        let request = match CallRequest::decode(body) {
            Ok(request) => request,
            Err(e) => {
                log::debug!("[SVC] malformed request on conn {conn}: {e}");
                return;
            }
        };
        self.stats.calls.fetch_add(1, Ordering::Relaxed);

        let response = match self.methods.get(&request.method).map(|h| h.value().clone()) {
            None => {
                self.stats.unknown_method.fetch_add(1, Ordering::Relaxed);
                CallResponse {
                    call_id: request.call_id,
                    status: CallStatus::MethodNotFound,
                    payload: Vec::new(),
                }
            }
            Some(handler) => match handler(&request.payload) {
                Ok(payload) => CallResponse {
                    call_id: request.call_id,
                    status: CallStatus::Ok,
                    payload,
                },
                Err(reason) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    CallResponse {
                        call_id: request.call_id,
                        status: CallStatus::ExecFailed,
                        payload: reason.into_bytes(),
                    }
                }
            },
        };
        self.executor
            .send(conn, FrameCodec::encode(FrameKind::Response, &response.encode()));
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for conn in self.ready.iter() {
            self.executor.close(*conn.key());
        }
        self.ready.clear();
        self.methods.clear();
    }
}

/// User-facing service server.
///
/// Registered methods receive the raw request payload and return the
/// response payload; serialization of both is the caller's concern (the
/// serializer contract lives above this API).
pub struct ServiceServer {
    core: Arc<ServiceServerCore>,
    on_drop: Option<Box<dyn FnOnce(&EntityId) + Send + Sync>>,
}

impl ServiceServer {
    pub(crate) fn new(
        core: Arc<ServiceServerCore>,
        on_drop: Box<dyn FnOnce(&EntityId) + Send + Sync>,
    ) -> Self {
        Self {
            core,
            on_drop: Some(on_drop),
        }
    }

    /// Register a method by name.
    pub fn register_method(
        &self,
        name: impl Into<String>,
        handler: impl Fn(&[u8]) -> std::result::Result<Vec<u8>, String> + Send + Sync + 'static,
    ) {
        self.core.register_method(name, Arc::new(handler));
    }

    pub fn unregister_method(&self, name: &str) {
        self.core.unregister_method(name);
    }

    pub fn id(&self) -> &EntityId {
        &self.core.entity_id
    }
}

impl Drop for ServiceServer {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop(&self.core.entity_id);
        }
        self.core.close();
    }
}

/// Descriptor advertised by service endpoints: method signatures are not
/// negotiated, only the service name matches.
pub fn service_descriptor() -> DataTypeDescriptor {
    DataTypeDescriptor::raw()
}
