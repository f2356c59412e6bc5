// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Registration receiver and liveliness sweep.
//!
//! One thread drains the discovery channel, applies samples to the
//! [`Registry`] and forwards the resulting events to the connection
//! manager. The same thread runs the expiry sweep at refresh cadence, so
//! the registry has exactly one mutating thread.

use super::channel::DiscoveryRx;
use super::registry::{RegistrationEvent, Registry};
use crate::wire::RegistrationBatch;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Callback receiving registry events on the receiver thread.
pub type EventHandler = Arc<dyn Fn(RegistrationEvent) + Send + Sync>;

/// Callback invoked after every liveliness sweep; the connection manager
/// uses it to drive reconnect attempts at sweep cadence.
pub type SweepHandler = Arc<dyn Fn() + Send + Sync>;

/// Receiver-side counters.
#[derive(Debug, Default)]
pub struct ReceiverStats {
    /// Samples applied to the registry
    pub samples_received: AtomicU64,
    /// Frames or sample records dropped as malformed
    pub samples_malformed: AtomicU64,
    /// Retract samples seen
    pub samples_retracted: AtomicU64,
    /// Own-context batches suppressed by the loopback filter
    pub loopback_filtered: AtomicU64,
}

/// Handle of the registration receive/sweep thread.
pub struct RegistrationReceiver {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    pub stats: Arc<ReceiverStats>,
}

impl RegistrationReceiver {
    /// Start consuming `rx` into `registry`.
    ///
    /// `loopback = false` suppresses batches carrying our own context id
    /// (self-subscription stays possible by enabling it).
    pub fn start(
        context_id: u64,
        loopback: bool,
        registry: Arc<RwLock<Registry>>,
        mut rx: Box<dyn DiscoveryRx>,
        refresh: Duration,
        timeout: Duration,
        handler: EventHandler,
        on_sweep: SweepHandler,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(ReceiverStats::default());

        let thread = {
            let stop = Arc::clone(&stop);
            let stats = Arc::clone(&stats);
            std::thread::Builder::new()
                .name("axon-reg-rx".to_string())
                .spawn(move || {
                    let mut frames: Vec<Vec<u8>> = Vec::new();
                    let mut last_sweep = Instant::now();

                    while !stop.load(Ordering::Relaxed) {
                        frames.clear();
                        rx.recv(&mut frames);

                        for frame in &frames {
                            apply_frame(
                                frame, context_id, loopback, &registry, &stats, &handler,
                            );
                        }

                        if last_sweep.elapsed() >= refresh {
                            last_sweep = Instant::now();
                            let events = registry.write().sweep(timeout);
                            for event in events {
                                handler(event);
                            }
                            on_sweep();
                        }
                    }
                    log::debug!("[REG] receiver thread stopped");
                })
                .expect("spawning the receiver thread")
        };

        Self {
            stop,
            thread: Some(thread),
            stats,
        }
    }

    /// Stop the thread and wait for it.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RegistrationReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn apply_frame(
    frame: &[u8],
    context_id: u64,
    loopback: bool,
    registry: &RwLock<Registry>,
    stats: &ReceiverStats,
    handler: &EventHandler,
) {
    let (batch, malformed) = match RegistrationBatch::decode(frame) {
        Ok(decoded) => decoded,
        Err(e) => {
            stats.samples_malformed.fetch_add(1, Ordering::Relaxed);
            log::debug!("[REG] dropping malformed discovery frame: {e}");
            return;
        }
    };
    stats
        .samples_malformed
        .fetch_add(malformed as u64, Ordering::Relaxed);

    if batch.context_id == context_id && !loopback {
        stats.loopback_filtered.fetch_add(1, Ordering::Relaxed);
        return;
    }

    for sample in batch.samples {
        stats.samples_received.fetch_add(1, Ordering::Relaxed);
        if sample.retract {
            stats.samples_retracted.fetch_add(1, Ordering::Relaxed);
        }
        let event = registry.write().apply(sample);
        if let Some(event) = event {
            handler(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataTypeDescriptor, EntityId, EntityKind, QoS};
    use crate::wire::RegistrationSample;
    use crossbeam::channel::{unbounded, Receiver, Sender};
    use parking_lot::Mutex;

    /// Channel double fed from a crossbeam queue.
    struct QueueRx(Receiver<Vec<u8>>);

    impl DiscoveryRx for QueueRx {
        fn recv(&mut self, out: &mut Vec<Vec<u8>>) {
            match self.0.recv_timeout(Duration::from_millis(20)) {
                Ok(frame) => out.push(frame),
                Err(_) => {}
            }
        }
    }

    fn sample(topic: &str) -> RegistrationSample {
        RegistrationSample {
            kind: EntityKind::Publisher,
            retract: false,
            clock: 1,
            entity_id: EntityId {
                host_name: "peer".into(),
                process_id: 2,
                entity: topic.into(),
                instance_id: 11,
            },
            descriptor: DataTypeDescriptor::raw(),
            qos: QoS::default(),
            layer_flags: 0,
            shm_segment: String::new(),
            tcp_host: String::new(),
            tcp_port: 0,
        }
    }

    fn batch_frame(context_id: u64, samples: Vec<RegistrationSample>) -> Vec<u8> {
        let mut batch = RegistrationBatch::new(context_id);
        batch.samples = samples;
        batch.encode()
    }

    struct Fixture {
        tx: Sender<Vec<u8>>,
        receiver: RegistrationReceiver,
        registry: Arc<RwLock<Registry>>,
        events: Arc<Mutex<Vec<RegistrationEvent>>>,
    }

    fn fixture(own_context: u64, loopback: bool, timeout: Duration) -> Fixture {
        let (tx, rx) = unbounded::<Vec<u8>>();
        let registry = Arc::new(RwLock::new(Registry::new()));
        let events: Arc<Mutex<Vec<RegistrationEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);

        let receiver = RegistrationReceiver::start(
            own_context,
            loopback,
            Arc::clone(&registry),
            Box::new(QueueRx(rx)),
            Duration::from_millis(50),
            timeout,
            Arc::new(move |event| sink.lock().push(event)),
            Arc::new(|| {}),
        );

        Fixture {
            tx,
            receiver,
            registry,
            events,
        }
    }

    fn wait_events(events: &Mutex<Vec<RegistrationEvent>>, count: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if events.lock().len() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_sample_reaches_registry_and_handler() {
        let mut fx = fixture(1, false, Duration::from_secs(60));
        fx.tx
            .send(batch_frame(99, vec![sample("topic/a")]))
            .expect("send");

        assert!(wait_events(&fx.events, 1));
        assert!(matches!(
            fx.events.lock()[0],
            RegistrationEvent::Connected(_)
        ));
        assert_eq!(fx.registry.read().len(), 1);
        fx.receiver.stop();
    }

    #[test]
    fn test_own_context_filtered_without_loopback() {
        let mut fx = fixture(42, false, Duration::from_secs(60));
        fx.tx
            .send(batch_frame(42, vec![sample("topic/self")]))
            .expect("send");

        std::thread::sleep(Duration::from_millis(150));
        assert!(fx.events.lock().is_empty());
        assert!(fx.registry.read().is_empty());
        assert!(
            fx.receiver
                .stats
                .loopback_filtered
                .load(Ordering::Relaxed)
                >= 1
        );
        fx.receiver.stop();
    }

    #[test]
    fn test_own_context_applied_with_loopback() {
        let mut fx = fixture(42, true, Duration::from_secs(60));
        fx.tx
            .send(batch_frame(42, vec![sample("topic/self")]))
            .expect("send");

        assert!(wait_events(&fx.events, 1));
        fx.receiver.stop();
    }

    #[test]
    fn test_garbage_frame_counted_not_fatal() {
        let mut fx = fixture(1, false, Duration::from_secs(60));
        fx.tx.send(vec![0xEE; 40]).expect("send garbage");
        fx.tx
            .send(batch_frame(9, vec![sample("topic/after")]))
            .expect("send");

        assert!(wait_events(&fx.events, 1));
        assert!(fx.receiver.stats.samples_malformed.load(Ordering::Relaxed) >= 1);
        fx.receiver.stop();
    }

    #[test]
    fn test_expiry_within_timeout_plus_sweep() {
        let mut fx = fixture(1, false, Duration::from_millis(120));
        fx.tx
            .send(batch_frame(9, vec![sample("topic/fleeting")]))
            .expect("send");
        assert!(wait_events(&fx.events, 1));

        // Stop refreshing: within timeout + one sweep interval the entity
        // must be reported disconnected.
        assert!(wait_events(&fx.events, 2));
        let events = fx.events.lock();
        assert!(matches!(events[1], RegistrationEvent::Disconnected(_)));
        drop(events);
        assert!(fx.registry.read().is_empty());
        fx.receiver.stop();
    }

    #[test]
    fn test_retract_fires_disconnect() {
        let mut fx = fixture(1, false, Duration::from_secs(60));
        fx.tx
            .send(batch_frame(9, vec![sample("topic/r")]))
            .expect("send");
        assert!(wait_events(&fx.events, 1));

        fx.tx
            .send(batch_frame(9, vec![sample("topic/r").retracted()]))
            .expect("send");
        assert!(wait_events(&fx.events, 2));
        assert!(matches!(
            fx.events.lock()[1],
            RegistrationEvent::Disconnected(_)
        ));
        fx.receiver.stop();
    }
}
