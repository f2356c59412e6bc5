// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Bounded thread-pool executor for all TCP sessions.
//!
//! Reads and accepts are served by a pool of `mio`-poll threads; writes by
//! a pool of writer threads draining per-connection queues. No session
//! ever owns a thread, so the thread count stays fixed no matter how many
//! peers connect.
//!
//! ```text
//! +------------------------------------------------------------------+
//! |                          TcpExecutor                             |
//! |  reader pool (mio Poll per thread)    writer pool                |
//! |  +---------+ +---------+             +---------+ +---------+    |
//! |  | accept  | | read    |   ...       | drain   | | drain   | .. |
//! |  | decode  | | decode  |             | queues  | | queues  |    |
//! |  +----+----+ +----+----+             +----+----+ +----+----+    |
//! |       |           |                       ^                     |
//! |       v           v                       |                     |
//! |     EventSink callbacks          send() enqueues + schedules    |
//! +------------------------------------------------------------------+
//! ```
//!
//! Outbound sessions are assigned to reader threads round-robin;
//! accepted sessions stay on their listener's thread. Per-connection
//! write queues keep frame order; a connection is serviced by at most one
//! writer thread at a time.

use super::frame_codec::{Frame, FrameCodec};
use crossbeam::channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Executor-wide connection identifier.
pub type ConnId = u64;

/// Callback receiving session events. Invoked on executor threads; must
/// not block unboundedly.
pub type EventSink = Arc<dyn Fn(TcpEvent) + Send + Sync>;

/// Events surfaced to session owners.
#[derive(Debug)]
pub enum TcpEvent {
    /// Inbound connection accepted on one of our listeners
    Accepted { conn: ConnId, peer: SocketAddr },
    /// Complete frame received
    Frame { conn: ConnId, frame: Frame },
    /// Connection ended (EOF, reset, write failure)
    Closed { conn: ConnId, reason: String },
}

const WAKER_TOKEN: Token = Token(0);
const TOKEN_BASE: usize = 16;
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_EVENTS: usize = 128;

enum Command {
    AddConn {
        conn_id: ConnId,
        stream: TcpStream,
        sink: EventSink,
    },
    AddListener {
        listener: TcpListener,
        sink: EventSink,
    },
    Close(ConnId),
    Shutdown,
}

/// Outbound side of one connection, shared with the writer pool.
struct WriterState {
    /// Duplicate handle of the session socket (non-blocking)
    stream: std::net::TcpStream,
    queue: Mutex<VecDeque<Vec<u8>>>,
    /// Set while a writer thread is servicing this connection
    scheduled: AtomicBool,
    sink: EventSink,
}

struct ReaderHandle {
    cmd_tx: Sender<Command>,
    waker: Arc<Waker>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Fixed-size executor owning every TCP session of a context.
pub struct TcpExecutor {
    readers: Vec<ReaderHandle>,
    writer_threads: Mutex<Vec<JoinHandle<()>>>,
    job_tx: Sender<ConnId>,
    writers: Arc<DashMap<ConnId, Arc<WriterState>>>,
    next_conn: AtomicU64,
    next_reader: AtomicUsize,
    running: Arc<AtomicBool>,
    max_frame: usize,
}

impl TcpExecutor {
    /// Start `reader_pool` poll threads and `writer_pool` writer threads.
    pub fn start(reader_pool: usize, writer_pool: usize, max_frame: usize) -> io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let writers: Arc<DashMap<ConnId, Arc<WriterState>>> = Arc::new(DashMap::new());
        let (job_tx, job_rx) = unbounded::<ConnId>();

        let mut readers = Vec::with_capacity(reader_pool);
        for index in 0..reader_pool {
            readers.push(Self::spawn_reader(index, max_frame, &writers, &running)?);
        }

        let mut writer_threads = Vec::with_capacity(writer_pool);
        for index in 0..writer_pool {
            writer_threads.push(Self::spawn_writer(
                index,
                job_rx.clone(),
                &writers,
                &running,
            )?);
        }

        Ok(Self {
            readers,
            writer_threads: Mutex::new(writer_threads),
            job_tx,
            writers,
            next_conn: AtomicU64::new(1),
            next_reader: AtomicUsize::new(0),
            running,
            max_frame,
        })
    }

    // ====================================================================
    // Public API
    // ====================================================================

    /// Open a listener on an ephemeral port. Accepted connections report
    /// to `sink`; the returned port is advertised via registration.
    pub fn listen(&self, sink: EventSink) -> io::Result<u16> {
        let std_listener = std::net::TcpListener::bind(("0.0.0.0", 0))?;
        std_listener.set_nonblocking(true)?;
        let port = std_listener.local_addr()?.port();
        let listener = TcpListener::from_std(std_listener);

        let reader = self.pick_reader();
        reader
            .cmd_tx
            .send(Command::AddListener { listener, sink })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "executor stopped"))?;
        reader.waker.wake()?;
        log::debug!("[TCP] listener opened on port {port}");
        Ok(port)
    }

    /// Establish an outbound connection (blocking connect, then handed to
    /// the reader pool).
    pub fn connect(
        &self,
        addr: SocketAddr,
        timeout: Duration,
        sink: EventSink,
    ) -> io::Result<ConnId> {
        let stream = std::net::TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        self.add_connection(stream, sink)
    }

    /// Adopt an already connected stream.
    pub fn add_connection(
        &self,
        stream: std::net::TcpStream,
        sink: EventSink,
    ) -> io::Result<ConnId> {
        stream.set_nonblocking(true)?;
        let writer_handle = stream.try_clone()?;
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);

        self.writers.insert(
            conn_id,
            Arc::new(WriterState {
                stream: writer_handle,
                queue: Mutex::new(VecDeque::new()),
                scheduled: AtomicBool::new(false),
                sink: Arc::clone(&sink),
            }),
        );

        let mio_stream = TcpStream::from_std(stream);
        let reader = self.pick_reader();
        reader
            .cmd_tx
            .send(Command::AddConn {
                conn_id,
                stream: mio_stream,
                sink,
            })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "executor stopped"))?;
        reader.waker.wake()?;
        Ok(conn_id)
    }

    /// Queue a pre-framed message. Returns `false` if the connection is
    /// gone; the caller treats that as a disconnect, not an error.
    pub fn send(&self, conn: ConnId, frame: Vec<u8>) -> bool {
        let Some(state) = self.writers.get(&conn).map(|s| s.value().clone()) else {
            return false;
        };
        state.queue.lock().push_back(frame);
        if state
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _ = self.job_tx.send(conn);
        }
        true
    }

    /// Close a connection from our side. No `Closed` event is raised.
    pub fn close(&self, conn: ConnId) {
        self.writers.remove(&conn);
        for reader in &self.readers {
            if reader.cmd_tx.send(Command::Close(conn)).is_ok() {
                let _ = reader.waker.wake();
            }
        }
    }

    /// Stop all pool threads and drop every session.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for reader in &self.readers {
            let _ = reader.cmd_tx.send(Command::Shutdown);
            let _ = reader.waker.wake();
        }
        for reader in &self.readers {
            if let Some(thread) = reader.thread.lock().take() {
                let _ = thread.join();
            }
        }
        for thread in self.writer_threads.lock().drain(..) {
            let _ = thread.join();
        }
        self.writers.clear();
    }

    /// Maximum frame size accepted by session codecs.
    #[must_use]
    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    fn pick_reader(&self) -> &ReaderHandle {
        let index = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        &self.readers[index]
    }

    // ====================================================================
    // Reader pool
    // ====================================================================

    fn spawn_reader(
        index: usize,
        max_frame: usize,
        writers: &Arc<DashMap<ConnId, Arc<WriterState>>>,
        running: &Arc<AtomicBool>,
    ) -> io::Result<ReaderHandle> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (cmd_tx, cmd_rx) = unbounded::<Command>();
        let writers = Arc::clone(writers);
        let running = Arc::clone(running);

        let thread = std::thread::Builder::new()
            .name(format!("axon-tcp-rd-{index}"))
            .spawn(move || reader_loop(index, poll, cmd_rx, writers, running, max_frame))?;

        Ok(ReaderHandle {
            cmd_tx,
            waker,
            thread: Mutex::new(Some(thread)),
        })
    }

    // ====================================================================
    // Writer pool
    // ====================================================================

    fn spawn_writer(
        index: usize,
        job_rx: Receiver<ConnId>,
        writers: &Arc<DashMap<ConnId, Arc<WriterState>>>,
        running: &Arc<AtomicBool>,
    ) -> io::Result<JoinHandle<()>> {
        let writers = Arc::clone(writers);
        let running = Arc::clone(running);
        std::thread::Builder::new()
            .name(format!("axon-tcp-wr-{index}"))
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    let conn = match job_rx.recv_timeout(POLL_TIMEOUT) {
                        Ok(conn) => conn,
                        Err(crossbeam::channel::RecvTimeoutError::Timeout) => continue,
                        Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
                    };
                    let Some(state) = writers.get(&conn).map(|s| s.value().clone()) else {
                        continue;
                    };
                    drain_queue(conn, &state, &writers, &running);
                }
            })
            .map_err(io::Error::from)
    }
}

impl Drop for TcpExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Write every queued frame of one connection, preserving order.
fn drain_queue(
    conn: ConnId,
    state: &Arc<WriterState>,
    writers: &DashMap<ConnId, Arc<WriterState>>,
    running: &AtomicBool,
) {
    loop {
        let next = state.queue.lock().pop_front();
        let Some(data) = next else {
            state.scheduled.store(false, Ordering::Release);
            // A send racing the flag clear may have enqueued without
            // scheduling; reclaim the flag and keep draining if so.
            if !state.queue.lock().is_empty()
                && state
                    .scheduled
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                continue;
            }
            return;
        };

        let mut offset = 0;
        while offset < data.len() {
            if !running.load(Ordering::Relaxed) {
                return;
            }
            match (&state.stream).write(&data[offset..]) {
                Ok(0) => {
                    report_write_failure(conn, state, writers, "write returned 0");
                    return;
                }
                Ok(n) => offset += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_micros(200));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    report_write_failure(conn, state, writers, &e.to_string());
                    return;
                }
            }
        }
    }
}

fn report_write_failure(
    conn: ConnId,
    state: &Arc<WriterState>,
    writers: &DashMap<ConnId, Arc<WriterState>>,
    reason: &str,
) {
    log::debug!("[TCP] conn {conn} write failed: {reason}");
    writers.remove(&conn);
    (state.sink)(TcpEvent::Closed {
        conn,
        reason: reason.to_string(),
    });
}

struct ConnEntry {
    stream: TcpStream,
    codec: FrameCodec,
    sink: EventSink,
    conn_id: ConnId,
}

fn reader_loop(
    index: usize,
    mut poll: Poll,
    cmd_rx: Receiver<Command>,
    writers: Arc<DashMap<ConnId, Arc<WriterState>>>,
    running: Arc<AtomicBool>,
    max_frame: usize,
) {
    let mut events = Events::with_capacity(MAX_EVENTS);
    let mut conns: HashMap<Token, ConnEntry> = HashMap::new();
    let mut listeners: HashMap<Token, (TcpListener, EventSink)> = HashMap::new();
    let mut next_token = TOKEN_BASE;
    // Accepted-connection ids live in a per-thread block above the
    // outbound id range, so reader threads never collide.
    let mut next_accept_id: u64 = (index as u64 + 1) << 48;

    'outer: while running.load(Ordering::Relaxed) {
        if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::debug!("[TCP] poll error, reader thread exiting: {e}");
            break;
        }

        for event in events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue; // commands drained below
            }

            if listeners.contains_key(&token) {
                accept_all(
                    token,
                    &mut listeners,
                    &mut conns,
                    &poll,
                    &mut next_token,
                    &mut next_accept_id,
                    &writers,
                    max_frame,
                );
                continue;
            }

            if event.is_readable() {
                service_readable(token, &mut conns, &poll, &writers);
            }
        }

        // Drain pending commands.
        while let Ok(cmd) = cmd_rx.try_recv() {
            match cmd {
                Command::AddConn {
                    conn_id,
                    mut stream,
                    sink,
                } => {
                    let token = Token(next_token);
                    next_token += 1;
                    if let Err(e) =
                        poll.registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        log::debug!("[TCP] register conn {conn_id} failed: {e}");
                        writers.remove(&conn_id);
                        sink(TcpEvent::Closed {
                            conn: conn_id,
                            reason: e.to_string(),
                        });
                        continue;
                    }
                    conns.insert(
                        token,
                        ConnEntry {
                            stream,
                            codec: FrameCodec::new(max_frame),
                            sink,
                            conn_id,
                        },
                    );
                }
                Command::AddListener { mut listener, sink } => {
                    let token = Token(next_token);
                    next_token += 1;
                    if let Err(e) =
                        poll.registry()
                            .register(&mut listener, token, Interest::READABLE)
                    {
                        log::debug!("[TCP] register listener failed: {e}");
                        continue;
                    }
                    listeners.insert(token, (listener, sink));
                }
                Command::Close(conn_id) => {
                    let token = conns
                        .iter()
                        .find(|(_, entry)| entry.conn_id == conn_id)
                        .map(|(token, _)| *token);
                    if let Some(token) = token {
                        if let Some(mut entry) = conns.remove(&token) {
                            let _ = poll.registry().deregister(&mut entry.stream);
                        }
                        writers.remove(&conn_id);
                    }
                }
                Command::Shutdown => break 'outer,
            }
        }
    }

    // Teardown: drop sessions without raising events; the owner asked us
    // to stop.
    for (_, mut entry) in conns.drain() {
        let _ = poll.registry().deregister(&mut entry.stream);
    }
    for (_, (mut listener, _)) in listeners.drain() {
        let _ = poll.registry().deregister(&mut listener);
    }
}

#[allow(clippy::too_many_arguments)]
fn accept_all(
    token: Token,
    listeners: &mut HashMap<Token, (TcpListener, EventSink)>,
    conns: &mut HashMap<Token, ConnEntry>,
    poll: &Poll,
    next_token: &mut usize,
    next_accept_id: &mut u64,
    writers: &DashMap<ConnId, Arc<WriterState>>,
    max_frame: usize,
) {
    let Some((listener, sink)) = listeners.get(&token) else {
        return;
    };
    let sink = Arc::clone(sink);

    loop {
        match listener.accept() {
            Ok((mut stream, peer)) => {
                let conn_id = *next_accept_id;
                *next_accept_id += 1;

                let writer_handle = match dup_stream(&stream) {
                    Ok(handle) => handle,
                    Err(e) => {
                        log::debug!("[TCP] dup of accepted socket failed: {e}");
                        continue;
                    }
                };
                writers.insert(
                    conn_id,
                    Arc::new(WriterState {
                        stream: writer_handle,
                        queue: Mutex::new(VecDeque::new()),
                        scheduled: AtomicBool::new(false),
                        sink: Arc::clone(&sink),
                    }),
                );

                let conn_token = Token(*next_token);
                *next_token += 1;
                if let Err(e) =
                    poll.registry()
                        .register(&mut stream, conn_token, Interest::READABLE)
                {
                    log::debug!("[TCP] register accepted conn failed: {e}");
                    writers.remove(&conn_id);
                    continue;
                }
                conns.insert(
                    conn_token,
                    ConnEntry {
                        stream,
                        codec: FrameCodec::new(max_frame),
                        sink: Arc::clone(&sink),
                        conn_id,
                    },
                );
                sink(TcpEvent::Accepted {
                    conn: conn_id,
                    peer,
                });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                log::debug!("[TCP] accept error (ignored): {e}");
                break;
            }
        }
    }
}

fn service_readable(
    token: Token,
    conns: &mut HashMap<Token, ConnEntry>,
    poll: &Poll,
    writers: &DashMap<ConnId, Arc<WriterState>>,
) {
    let Some(entry) = conns.get_mut(&token) else {
        return;
    };

    loop {
        match entry.codec.decode(&mut entry.stream) {
            Ok(Some(frame)) => {
                (entry.sink)(TcpEvent::Frame {
                    conn: entry.conn_id,
                    frame,
                });
            }
            Ok(None) => return,
            Err(e) => {
                let conn_id = entry.conn_id;
                let sink = Arc::clone(&entry.sink);
                if let Some(mut entry) = conns.remove(&token) {
                    let _ = poll.registry().deregister(&mut entry.stream);
                }
                writers.remove(&conn_id);
                sink(TcpEvent::Closed {
                    conn: conn_id,
                    reason: e.to_string(),
                });
                return;
            }
        }
    }
}

/// Duplicate a mio stream's descriptor for the writer pool.
fn dup_stream(stream: &TcpStream) -> io::Result<std::net::TcpStream> {
    use std::os::fd::{AsRawFd, FromRawFd};
    // SAFETY: dup creates a fresh owned descriptor referring to the same
    // socket; wrapping it in TcpStream transfers ownership of exactly that
    // descriptor.
    let fd = unsafe { libc::dup(stream.as_raw_fd()) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { std::net::TcpStream::from_raw_fd(fd) })
}

#[cfg(test)]
mod tests {
    use super::super::frame_codec::FrameKind;
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    fn wait_until(limit: Duration, mut done: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + limit;
        while Instant::now() < end {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[derive(Default)]
    struct Collected {
        accepted: Vec<ConnId>,
        frames: Vec<(ConnId, Frame)>,
        closed: Vec<ConnId>,
    }

    fn collecting_sink() -> (EventSink, Arc<StdMutex<Collected>>) {
        let collected = Arc::new(StdMutex::new(Collected::default()));
        let inner = Arc::clone(&collected);
        let sink: EventSink = Arc::new(move |event| {
            let mut c = inner.lock().expect("collector lock");
            match event {
                TcpEvent::Accepted { conn, .. } => c.accepted.push(conn),
                TcpEvent::Frame { conn, frame } => c.frames.push((conn, frame)),
                TcpEvent::Closed { conn, .. } => c.closed.push(conn),
            }
        });
        (sink, collected)
    }

    #[test]
    fn test_listen_accept_exchange() {
        let executor = TcpExecutor::start(2, 2, 1 << 20).expect("executor");

        let (server_sink, server_events) = collecting_sink();
        let port = executor.listen(server_sink).expect("listen");

        let (client_sink, client_events) = collecting_sink();
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().expect("addr");
        let client = executor
            .connect(addr, Duration::from_secs(2), client_sink)
            .expect("connect");

        assert!(wait_until(Duration::from_secs(3), || {
            !server_events.lock().expect("lock").accepted.is_empty()
        }));
        let server_conn = server_events.lock().expect("lock").accepted[0];

        // Client -> server
        assert!(executor.send(client, FrameCodec::encode(FrameKind::Handshake, b"hi")));
        assert!(wait_until(Duration::from_secs(3), || {
            !server_events.lock().expect("lock").frames.is_empty()
        }));
        {
            let events = server_events.lock().expect("lock");
            assert_eq!(events.frames[0].1.kind, FrameKind::Handshake);
            assert_eq!(events.frames[0].1.body, b"hi");
        }

        // Server -> client
        assert!(executor.send(server_conn, FrameCodec::encode(FrameKind::Data, b"sample")));
        assert!(wait_until(Duration::from_secs(3), || {
            !client_events.lock().expect("lock").frames.is_empty()
        }));
        assert_eq!(
            client_events.lock().expect("lock").frames[0].1.body,
            b"sample"
        );

        executor.shutdown();
    }

    #[test]
    fn test_peer_close_raises_closed() {
        let executor = TcpExecutor::start(1, 1, 1 << 20).expect("executor");

        let (server_sink, server_events) = collecting_sink();
        let port = executor.listen(server_sink).expect("listen");

        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().expect("addr");
        let raw = std::net::TcpStream::connect(addr).expect("raw connect");
        assert!(wait_until(Duration::from_secs(3), || {
            !server_events.lock().expect("lock").accepted.is_empty()
        }));

        drop(raw); // peer goes away
        assert!(wait_until(Duration::from_secs(3), || {
            !server_events.lock().expect("lock").closed.is_empty()
        }));

        executor.shutdown();
    }

    #[test]
    fn test_send_to_unknown_conn_returns_false() {
        let executor = TcpExecutor::start(1, 1, 1 << 20).expect("executor");
        assert!(!executor.send(0xDEAD, vec![1, 2, 3]));
        executor.shutdown();
    }

    #[test]
    fn test_many_frames_preserve_order() {
        let executor = TcpExecutor::start(2, 2, 1 << 20).expect("executor");

        let (server_sink, server_events) = collecting_sink();
        let port = executor.listen(server_sink).expect("listen");

        let (client_sink, client_events) = collecting_sink();
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().expect("addr");
        let _client = executor
            .connect(addr, Duration::from_secs(2), client_sink)
            .expect("connect");

        assert!(wait_until(Duration::from_secs(3), || {
            !server_events.lock().expect("lock").accepted.is_empty()
        }));
        let server_conn = server_events.lock().expect("lock").accepted[0];

        for i in 0..200u32 {
            assert!(executor.send(
                server_conn,
                FrameCodec::encode(FrameKind::Data, &i.to_le_bytes())
            ));
        }

        assert!(wait_until(Duration::from_secs(5), || {
            client_events.lock().expect("lock").frames.len() == 200
        }));
        let events = client_events.lock().expect("lock");
        for (i, (_, frame)) in events.frames.iter().enumerate() {
            let v = u32::from_le_bytes(frame.body[..4].try_into().expect("4 bytes"));
            assert_eq!(v as usize, i, "frame order broken");
        }

        executor.shutdown();
    }

    #[test]
    fn test_shutdown_joins_quickly() {
        let executor = TcpExecutor::start(2, 2, 1 << 20).expect("executor");
        let (sink, _events) = collecting_sink();
        executor.listen(sink).expect("listen");

        let start = Instant::now();
        executor.shutdown();
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
