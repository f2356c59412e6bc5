// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Service client: one session per discovered server instance, blocking
//! and asynchronous calls with per-call state.
//!
//! Server instances come and go through the registry; pending calls are
//! tracked independently of the sessions, so a late response after a
//! reconnect is simply dropped instead of corrupting a newer call.

use super::types::{CallRequest, CallResponse, CallStatus, ServiceResponse};
use crate::pubsub::{Error, Result};
use crate::transport::tcp::{
    ConnId, EventSink, FrameCodec, FrameKind, Handshake, ReconnectPolicy, SessionRole,
    SessionState, TcpEvent, TcpExecutor,
};
use crate::types::{DataTypeDescriptor, EntityId};
use crate::wire::RegistrationSample;
use crossbeam::channel::{bounded, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Async completion callback.
pub type CallCallback = Arc<dyn Fn(Result<ServiceResponse>) + Send + Sync>;

enum PendingCall {
    Blocking {
        conn: ConnId,
        tx: Sender<ServiceResponse>,
    },
    Async {
        conn: ConnId,
        deadline: Instant,
        callback: CallCallback,
    },
}

struct ServerLink {
    sample: RegistrationSample,
    conn: Option<ConnId>,
    state: SessionState,
    policy: ReconnectPolicy,
}

/// Internal state of one service client instance.
pub struct ServiceClientCore {
    pub entity_id: EntityId,
    closed: AtomicBool,
    executor: Arc<TcpExecutor>,
    connect_timeout: Duration,
    max_reconnect: u32,
    reconnect_backoff: Duration,

    servers: Mutex<HashMap<EntityId, ServerLink>>,
    conn_index: Mutex<HashMap<ConnId, EntityId>>,
    pending: DashMap<u64, PendingCall>,
    next_call: AtomicU64,
    sink_cache: Mutex<Option<EventSink>>,
}

impl ServiceClientCore {
    pub fn create(
        entity_id: EntityId,
        executor: Arc<TcpExecutor>,
        connect_timeout: Duration,
        max_reconnect: u32,
        reconnect_backoff: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            entity_id,
            closed: AtomicBool::new(false),
            executor,
            connect_timeout,
            max_reconnect,
            reconnect_backoff,
            servers: Mutex::new(HashMap::new()),
            conn_index: Mutex::new(HashMap::new()),
            pending: DashMap::new(),
            next_call: AtomicU64::new(1),
            sink_cache: Mutex::new(None),
        })
    }

    /// Service this client calls.
    pub fn service_name(&self) -> &str {
        &self.entity_id.entity
    }

    // ====================================================================
    // Gate-driven server tracking
    // ====================================================================

    /// A server instance appeared or refreshed in the registry.
    pub fn apply_server(self: &Arc<Self>, sample: &RegistrationSample) {
        if self.closed.load(Ordering::Acquire) || sample.tcp_port == 0 {
            return;
        }
        let target = {
            let mut servers = self.servers.lock();
            let link = servers
                .entry(sample.entity_id.clone())
                .or_insert_with(|| ServerLink {
                    sample: sample.clone(),
                    conn: None,
                    state: SessionState::NotConnected,
                    policy: ReconnectPolicy::new(self.max_reconnect, self.reconnect_backoff),
                });
            link.sample = sample.clone();
            self.dial_target(link)
        };
        if let Some(target) = target {
            self.connect_server(target);
        }
    }

    /// A server instance retracted or expired.
    pub fn remove_server(&self, id: &EntityId) {
        let link = self.servers.lock().remove(id);
        if let Some(link) = link {
            if let Some(conn) = link.conn {
                self.conn_index.lock().remove(&conn);
                self.fail_pending_on(conn);
                self.executor.close(conn);
            }
        }
    }

    /// Sweep-cadence housekeeping: reconnects and async call timeouts.
    pub fn tick(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let targets: Vec<_> = {
            let mut servers = self.servers.lock();
            servers
                .values_mut()
                .filter_map(|link| self.dial_target(link))
                .collect()
        };
        for target in targets {
            self.connect_server(target);
        }

        // Expire overdue async calls.
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter_map(|entry| match entry.value() {
                PendingCall::Async { deadline, .. } if *deadline <= now => Some(*entry.key()),
                _ => None,
            })
            .collect();
        for call_id in expired {
            if let Some((_, PendingCall::Async { callback, .. })) = self.pending.remove(&call_id) {
                callback(Err(Error::Timeout));
            }
        }
    }

    fn dial_target(&self, link: &mut ServerLink) -> Option<(EntityId, String, u16)> {
        if link.state != SessionState::NotConnected || !link.policy.due() {
            return None;
        }
        link.state = SessionState::Handshake;
        let host = if link.sample.tcp_host.is_empty() {
            "127.0.0.1".to_string()
        } else {
            link.sample.tcp_host.clone()
        };
        Some((link.sample.entity_id.clone(), host, link.sample.tcp_port))
    }

    fn connect_server(self: &Arc<Self>, (remote, host, port): (EntityId, String, u16)) {
        let addr = match format!("{host}:{port}").parse() {
            Ok(addr) => addr,
            Err(_) => {
                self.attempt_failed(&remote);
                return;
            }
        };
        match self
            .executor
            .connect(addr, self.connect_timeout, self.sink())
        {
            Ok(conn) => {
                self.conn_index.lock().insert(conn, remote.clone());
                let handshake = Handshake::new(
                    SessionRole::ServiceClient,
                    self.entity_id.clone(),
                    DataTypeDescriptor::raw(),
                );
                self.executor.send(
                    conn,
                    FrameCodec::encode(FrameKind::Handshake, &handshake.encode()),
                );
                if let Some(link) = self.servers.lock().get_mut(&remote) {
                    link.conn = Some(conn);
                }
            }
            Err(e) => {
                log::debug!("[SVC] connect to {addr} failed: {e}");
                self.attempt_failed(&remote);
            }
        }
    }

    fn attempt_failed(&self, remote: &EntityId) {
        let mut servers = self.servers.lock();
        if let Some(link) = servers.get_mut(remote) {
            link.state = if link.policy.register_failure() {
                SessionState::NotConnected
            } else {
                SessionState::Failed
            };
        }
    }

    fn sink(self: &Arc<Self>) -> EventSink {
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

    fn on_tcp_event(&self, event: TcpEvent) {
        match event {
            TcpEvent::Frame { conn, frame } => match frame.kind {
                FrameKind::HandshakeAck => {
                    let remote = self.conn_index.lock().get(&conn).cloned();
                    if let Some(remote) = remote {
                        if let Some(link) = self.servers.lock().get_mut(&remote) {
                            link.state = SessionState::Connected;
                            link.policy.reset();
                        }
                    }
                }
                FrameKind::Response => {
                    if let Ok(response) = CallResponse::decode(&frame.body) {
                        self.complete(response);
                    }
                }
                _ => {}
            },
            TcpEvent::Closed { conn, .. } => {
                let remote = self.conn_index.lock().remove(&conn);
                self.fail_pending_on(conn);
                if let Some(remote) = remote {
                    let mut servers = self.servers.lock();
                    if let Some(link) = servers.get_mut(&remote) {
                        if link.conn == Some(conn) || link.conn.is_none() {
                            link.conn = None;
                            link.state = match link.state {
                                // Closed mid-handshake: terminal refusal.
                                SessionState::Handshake => SessionState::Failed,
                                _ => SessionState::NotConnected,
                            };
                        }
                    }
                }
            }
            TcpEvent::Accepted { .. } => {}
        }
    }

    fn complete(&self, response: CallResponse) {
        let Some((_, pending)) = self.pending.remove(&response.call_id) else {
            return; // response for a call we already gave up on
        };
        let result = ServiceResponse {
            status: response.status,
            payload: response.payload,
        };
        match pending {
            PendingCall::Blocking { tx, .. } => {
                let _ = tx.send(result);
            }
            PendingCall::Async { callback, .. } => callback(Ok(result)),
        }
    }

    /// Terminate every pending call bound to a dropped session.
    fn fail_pending_on(&self, conn: ConnId) {
        let stale: Vec<u64> = self
            .pending
            .iter()
            .filter_map(|entry| {
                let bound = match entry.value() {
                    PendingCall::Blocking { conn: c, .. } | PendingCall::Async { conn: c, .. } => {
                        *c == conn
                    }
                };
                bound.then_some(*entry.key())
            })
            .collect();
        for call_id in stale {
            if let Some((_, pending)) = self.pending.remove(&call_id) {
                let lost = ServiceResponse {
                    status: CallStatus::ConnectionLost,
                    payload: Vec::new(),
                };
                match pending {
                    PendingCall::Blocking { tx, .. } => {
                        let _ = tx.send(lost);
                    }
                    PendingCall::Async { callback, .. } => callback(Ok(lost)),
                }
            }
        }
    }

    /// First currently connected server session.
    fn pick_connected(&self) -> Option<ConnId> {
        self.servers
            .lock()
            .values()
            .find(|link| link.state == SessionState::Connected)
            .and_then(|link| link.conn)
    }

    // ====================================================================
    // Calls
    // ====================================================================

    /// Blocking call with timeout.
    pub fn call(&self, method: &str, request: &[u8], timeout: Duration) -> Result<ServiceResponse> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ContextClosed);
        }
        let conn = self
            .pick_connected()
            .ok_or_else(|| Error::NoServerAvailable(self.entity_id.entity.clone()))?;

        let call_id = self.next_call.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded::<ServiceResponse>(1);
        self.pending
            .insert(call_id, PendingCall::Blocking { conn, tx });

        let frame = CallRequest {
            call_id,
            method: method.to_string(),
            payload: request.to_vec(),
        };
        if !self
            .executor
            .send(conn, FrameCodec::encode(FrameKind::Request, &frame.encode()))
        {
            self.pending.remove(&call_id);
            return Err(Error::NoServerAvailable(self.entity_id.entity.clone()));
        }

        match rx.recv_timeout(timeout) {
            Ok(response) => Ok(response),
            Err(_) => {
                self.pending.remove(&call_id);
                Err(Error::Timeout)
            }
        }
    }

    /// Asynchronous call; `callback` runs on an executor reader thread
    /// (response) or the registration thread (timeout).
    pub fn call_async(
        &self,
        method: &str,
        request: &[u8],
        timeout: Duration,
        callback: CallCallback,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ContextClosed);
        }
        let conn = self
            .pick_connected()
            .ok_or_else(|| Error::NoServerAvailable(self.entity_id.entity.clone()))?;

        let call_id = self.next_call.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(
            call_id,
            PendingCall::Async {
                conn,
                deadline: Instant::now() + timeout,
                callback,
            },
        );

        let frame = CallRequest {
            call_id,
            method: method.to_string(),
            payload: request.to_vec(),
        };
        if !self
            .executor
            .send(conn, FrameCodec::encode(FrameKind::Request, &frame.encode()))
        {
            self.pending.remove(&call_id);
            return Err(Error::NoServerAvailable(self.entity_id.entity.clone()));
        }
        Ok(())
    }

    /// Connected server instances.
    pub fn server_count(&self) -> usize {
        self.servers
            .lock()
            .values()
            .filter(|link| link.state == SessionState::Connected)
            .count()
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let conns: Vec<ConnId> = {
            let mut servers = self.servers.lock();
            let conns = servers.values_mut().filter_map(|link| link.conn.take());
            conns.collect()
        };
        for conn in conns {
            self.executor.close(conn);
        }
        self.servers.lock().clear();
        self.conn_index.lock().clear();
        // Unblock every caller still waiting.
        let stale: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for call_id in stale {
            if let Some((_, pending)) = self.pending.remove(&call_id) {
                match pending {
                    PendingCall::Blocking { tx, .. } => {
                        let _ = tx.send(ServiceResponse {
                            status: CallStatus::ConnectionLost,
                            payload: Vec::new(),
                        });
                    }
                    PendingCall::Async { callback, .. } => callback(Err(Error::ContextClosed)),
                }
            }
        }
    }
}

/// User-facing service client.
pub struct ServiceClient {
    core: Arc<ServiceClientCore>,
    on_drop: Option<Box<dyn FnOnce(&EntityId) + Send + Sync>>,
}

impl ServiceClient {
    pub(crate) fn new(
        core: Arc<ServiceClientCore>,
        on_drop: Box<dyn FnOnce(&EntityId) + Send + Sync>,
    ) -> Self {
        Self {
            core,
            on_drop: Some(on_drop),
        }
    }

    /// Call `method` on the first available server, blocking up to
    /// `timeout` for the response.
    pub fn call(&self, method: &str, request: &[u8], timeout: Duration) -> Result<ServiceResponse> {
        self.core.call(method, request, timeout)
    }

    /// Fire an asynchronous call; the callback observes the response,
    /// timeout, or connection loss.
    pub fn call_async(
        &self,
        method: &str,
        request: &[u8],
        timeout: Duration,
        callback: impl Fn(Result<ServiceResponse>) + Send + Sync + 'static,
    ) -> Result<()> {
        self.core
            .call_async(method, request, timeout, Arc::new(callback))
    }

    /// Number of currently connected server instances.
    pub fn server_count(&self) -> usize {
        self.core.server_count()
    }

    pub fn id(&self) -> &EntityId {
        &self.core.entity_id
    }
}

impl Drop for ServiceClient {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop(&self.core.entity_id);
        }
        self.core.close();
    }
}
