// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Discovery lifecycle across contexts: connect, retract, expiry.

mod common;

use axon::{MiddlewareContext, PubSubEvent, QoS, RawBytes, TransportLayer};
use common::{shm_config, wait_until, REFRESH, TIMEOUT};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn test_peer_discovery_populates_registry() {
    let config = shm_config("reg_discovery");
    let a = MiddlewareContext::initialize(config.clone()).expect("ctx a");
    let b = MiddlewareContext::initialize(config).expect("ctx b");

    let _publisher = a
        .create_publisher("disc/topic", RawBytes, QoS::best_effort())
        .expect("publisher");

    // B must learn about A's process and publisher entities.
    assert!(
        wait_until(Duration::from_secs(5), || b.known_entities() >= 2),
        "registry never populated, knows {}",
        b.known_entities()
    );

    b.finalize();
    a.finalize();
}

#[test]
fn test_graceful_shutdown_retracts_immediately() {
    let config = shm_config("reg_retract");
    let a = MiddlewareContext::initialize(config.clone()).expect("ctx a");
    let b = MiddlewareContext::initialize(config).expect("ctx b");

    let publisher = a
        .create_publisher("retract/topic", RawBytes, QoS::best_effort())
        .expect("publisher");
    let subscriber = b
        .create_subscriber("retract/topic", RawBytes, QoS::best_effort())
        .expect("subscriber");

    let events: Arc<Mutex<Vec<PubSubEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    subscriber.set_event_callback(move |event| sink.lock().push(event));

    assert!(wait_until(Duration::from_secs(5), || {
        subscriber.connection_count() >= 1
    }));

    // Finalizing A sends retract samples; B must see the disconnect well
    // before the liveliness timeout would fire.
    drop(publisher);
    let retract_started = Instant::now();
    a.finalize();

    assert!(
        wait_until(Duration::from_secs(2), || subscriber.connection_count() == 0),
        "retract was not applied"
    );
    assert!(
        retract_started.elapsed() < TIMEOUT,
        "disconnect took as long as expiry; retract had no effect"
    );
    assert!(events
        .lock()
        .iter()
        .any(|e| matches!(e, PubSubEvent::Disconnected { layer: TransportLayer::Shm, .. })));

    b.finalize();
}

#[test]
fn test_silent_peer_expires_within_timeout_plus_sweep() {
    use axon::registration::create_channel;
    use axon::wire::registration::LAYER_SHM;
    use axon::wire::{RegistrationBatch, RegistrationSample};
    use axon::{DataTypeDescriptor, EntityId, EntityKind};

    let config = shm_config("reg_expiry");
    let b = MiddlewareContext::initialize(config.clone()).expect("ctx b");
    let subscriber = b
        .create_subscriber("expiry/topic", RawBytes, QoS::best_effort())
        .expect("subscriber");

    // Fake peer: announce a publisher once on the raw discovery channel,
    // then go silent, as a crashed process would.
    let (tx, _rx) = create_channel(&config.registration).expect("channel");
    let mut batch = RegistrationBatch::new(0xFEED_F00D);
    batch.samples.push(RegistrationSample {
        kind: EntityKind::Publisher,
        retract: false,
        clock: 1,
        entity_id: EntityId {
            host_name: b.host_name().to_string(),
            process_id: 999_999,
            entity: "expiry/topic".into(),
            instance_id: 0x5151,
        },
        descriptor: DataTypeDescriptor::raw(),
        qos: QoS::best_effort(),
        layer_flags: LAYER_SHM,
        shm_segment: String::new(),
        tcp_host: String::new(),
        tcp_port: 0,
    });
    tx.send(&batch.encode());

    assert!(
        wait_until(Duration::from_secs(3), || subscriber.connection_count() >= 1),
        "fake peer never discovered"
    );
    let seen_at = Instant::now();

    // Never earlier: well before the timeout the entity must still live.
    std::thread::sleep(TIMEOUT - REFRESH * 2);
    assert!(
        subscriber.connection_count() >= 1,
        "entity expired before registration_timeout"
    );

    // Within timeout + one sweep interval (plus scheduling slack) the
    // disconnect must be reported.
    assert!(
        wait_until(TIMEOUT + REFRESH * 3, || subscriber.connection_count() == 0),
        "entity never expired"
    );
    assert!(seen_at.elapsed() >= TIMEOUT - REFRESH);

    b.finalize();
}
