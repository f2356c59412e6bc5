// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Receive/demultiplex thread for one multicast group.
//!
//! A single thread drains the group socket, reassembles fragments and
//! dispatches complete messages by topic id. Datagrams for unknown topics
//! are counted and dropped; malformed datagrams never terminate the
//! thread.

use super::fragment::Reassembler;
use super::{create_recv_socket, Result};
use crate::wire::DataHeader;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Callback invoked for every complete message of a registered topic.
pub type DemuxHandler = Arc<dyn Fn(DataHeader, Vec<u8>) + Send + Sync>;

/// Counters of one demux thread.
#[derive(Debug, Default)]
pub struct DemuxStats {
    pub delivered: AtomicU64,
    /// Datagrams for topics nobody subscribed to here
    pub unknown_topic: AtomicU64,
    /// Datagrams that failed header validation
    pub malformed: AtomicU64,
}

/// Owner handle of the demux thread; dropping it stops the thread.
pub struct UdpDemux {
    handlers: Arc<DashMap<u64, DemuxHandler>>,
    stats: Arc<DemuxStats>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl UdpDemux {
    /// Bind the group socket and start the receive thread.
    pub fn start(group: Ipv4Addr, port: u16, recv_buffer: usize, max_datagram: usize) -> Result<Self> {
        let socket = create_recv_socket(group, port, recv_buffer)?;
        let handlers: Arc<DashMap<u64, DemuxHandler>> = Arc::new(DashMap::new());
        let stats = Arc::new(DemuxStats::default());
        let running = Arc::new(AtomicBool::new(true));

        let thread = {
            let handlers = Arc::clone(&handlers);
            let stats = Arc::clone(&stats);
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name(format!("axon-udp-rx-{port}"))
                .spawn(move || {
                    log::debug!("[UDP] demux thread up on {group}:{port}");
                    let mut reassembler = Reassembler::new();
                    // Header + full fragment payload fits in one read.
                    let mut buf = vec![0u8; max_datagram.max(2048)];
                    while running.load(Ordering::Relaxed) {
                        match socket.recv_from(&mut buf) {
                            Ok((n, _from)) => {
                                Self::dispatch(&buf[..n], &handlers, &stats, &mut reassembler);
                            }
                            Err(e)
                                if matches!(
                                    e.kind(),
                                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                                ) =>
                            {
                                // Read timeout: just re-check the running flag.
                            }
                            Err(e) => {
                                log::debug!("[UDP] recv error (ignored): {e}");
                            }
                        }
                    }
                    log::debug!("[UDP] demux thread on port {port} stopped");
                })
                .map_err(io::Error::from)?
        };

        Ok(Self {
            handlers,
            stats,
            running,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn dispatch(
        datagram: &[u8],
        handlers: &DashMap<u64, DemuxHandler>,
        stats: &DemuxStats,
        reassembler: &mut Reassembler,
    ) {
        let Ok((header, chunk)) = DataHeader::decode(datagram) else {
            stats.malformed.fetch_add(1, Ordering::Relaxed);
            return;
        };

        // Resolve the handler before paying for reassembly.
        let Some(handler) = handlers.get(&header.topic_id).map(|h| h.value().clone()) else {
            stats.unknown_topic.fetch_add(1, Ordering::Relaxed);
            return;
        };

        if let Some((header, message)) = reassembler.insert(header, chunk) {
            stats.delivered.fetch_add(1, Ordering::Relaxed);
            handler(header, message);
        }
    }

    /// Route future messages of `topic_id` to `handler`.
    pub fn register(&self, topic_id: u64, handler: DemuxHandler) {
        self.handlers.insert(topic_id, handler);
    }

    /// Stop routing `topic_id`; subsequent datagrams count as unknown.
    pub fn unregister(&self, topic_id: u64) {
        self.handlers.remove(&topic_id);
    }

    /// Demux counters.
    #[must_use]
    pub fn stats(&self) -> &DemuxStats {
        &self.stats
    }

    /// Stop the thread and wait for it.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for UdpDemux {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::super::{create_send_socket, fragment_message};
    use super::*;
    use std::net::SocketAddrV4;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    const TEST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 254, 201, 1);

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn test_demux_delivers_registered_topic() {
        let port = 24_801;
        let demux = UdpDemux::start(TEST_GROUP, port, 0, 1400).expect("demux");

        let received = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
        let sink = Arc::clone(&received);
        demux.register(
            77,
            Arc::new(move |_h, msg| sink.lock().expect("lock").push(msg)),
        );

        let send = create_send_socket(1, true, 0).expect("send socket");
        let payload = vec![0x42u8; 4_000];
        for datagram in fragment_message(77, 1, 1, &payload, 1400) {
            send.send_to(&datagram, SocketAddrV4::new(TEST_GROUP, port))
                .expect("send");
        }

        assert!(wait_until(Duration::from_secs(3), || {
            !received.lock().expect("lock").is_empty()
        }));
        assert_eq!(received.lock().expect("lock")[0], payload);
        assert_eq!(demux.stats().delivered.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_unknown_topic_counted_dropped() {
        let port = 24_802;
        let demux = UdpDemux::start(TEST_GROUP, port, 0, 1400).expect("demux");

        let send = create_send_socket(1, true, 0).expect("send socket");
        for datagram in fragment_message(999, 1, 1, b"nobody listens", 1400) {
            send.send_to(&datagram, SocketAddrV4::new(TEST_GROUP, port))
                .expect("send");
        }

        assert!(wait_until(Duration::from_secs(3), || {
            demux.stats().unknown_topic.load(Ordering::Relaxed) > 0
        }));
        assert_eq!(demux.stats().delivered.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_malformed_datagram_survives() {
        let port = 24_803;
        let demux = UdpDemux::start(TEST_GROUP, port, 0, 1400).expect("demux");
        demux.register(5, Arc::new(|_h, _m| {}));

        let send = create_send_socket(1, true, 0).expect("send socket");
        send.send_to(&[0xFF; 7], SocketAddrV4::new(TEST_GROUP, port))
            .expect("send garbage");

        assert!(wait_until(Duration::from_secs(3), || {
            demux.stats().malformed.load(Ordering::Relaxed) > 0
        }));

        // Thread is still alive and delivering after the garbage.
        for datagram in fragment_message(5, 1, 1, b"still alive", 1400) {
            send.send_to(&datagram, SocketAddrV4::new(TEST_GROUP, port))
                .expect("send");
        }
        assert!(wait_until(Duration::from_secs(3), || {
            demux.stats().delivered.load(Ordering::Relaxed) > 0
        }));
    }
}
