// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! TCP data layer between two contexts, plus cross-layer dedup when SHM
//! and TCP run concurrently for the same pair.

mod common;

use axon::{MiddlewareContext, QoS, RawBytes, StringSerializer, TransportLayer};
use common::{shm_config, tcp_config, wait_until};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_tcp_roundtrip_ordered() {
    let config = tcp_config("tcp_rt");
    let pub_ctx = MiddlewareContext::initialize(config.clone()).expect("pub ctx");
    let sub_ctx = MiddlewareContext::initialize(config).expect("sub ctx");

    let publisher = pub_ctx
        .create_publisher("tcp/stream", StringSerializer, QoS::reliable(10))
        .expect("publisher");
    let subscriber = sub_ctx
        .create_subscriber("tcp/stream", StringSerializer, QoS::reliable(10))
        .expect("subscriber");

    let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    subscriber.set_callback(move |msg: String, _info| sink.lock().push(msg));

    // TCP connects via handshake; both sides report the session.
    assert!(
        wait_until(Duration::from_secs(5), || {
            publisher.connection_count() >= 1 && subscriber.connection_count() >= 1
        }),
        "tcp session never handshaked"
    );

    for i in 0..200 {
        publisher.send(&format!("sample {i}")).expect("send");
    }

    assert!(
        wait_until(Duration::from_secs(10), || received.lock().len() >= 200),
        "only {} samples arrived",
        received.lock().len()
    );

    // Single publisher, single session: delivery order == send order.
    let received = received.lock();
    for (i, msg) in received.iter().enumerate() {
        assert_eq!(msg, &format!("sample {i}"), "order broken at {i}");
    }
    drop(received);

    sub_ctx.finalize();
    pub_ctx.finalize();
}

#[test]
fn test_dual_layer_delivers_each_clock_once() {
    // SHM and TCP both active for the same pair: the dedup window must
    // reduce every clock value to exactly one delivery.
    let mut config = shm_config("dual_layer");
    config.tcp.enable = true;
    config.priority_local = vec![TransportLayer::Shm, TransportLayer::Tcp];

    let pub_ctx = MiddlewareContext::initialize(config.clone()).expect("pub ctx");
    let sub_ctx = MiddlewareContext::initialize(config).expect("sub ctx");

    let publisher = pub_ctx
        .create_publisher("dual/topic", RawBytes, QoS::best_effort())
        .expect("publisher");
    let subscriber = sub_ctx
        .create_subscriber("dual/topic", RawBytes, QoS::best_effort())
        .expect("subscriber");

    let clocks: Arc<Mutex<HashMap<u64, u32>>> = Arc::new(Mutex::new(HashMap::new()));
    let sink = Arc::clone(&clocks);
    subscriber.set_callback(move |_msg: Vec<u8>, info| {
        *sink.lock().entry(info.clock).or_insert(0) += 1;
    });

    // Wait until BOTH layers are up (publisher sees the tcp handshake
    // and the gate-tracked shm attach).
    assert!(
        wait_until(Duration::from_secs(5), || publisher.connection_count() >= 1),
        "pair never matched"
    );
    // Give the second layer a moment to finish as well.
    std::thread::sleep(Duration::from_millis(500));

    for _ in 0..100 {
        publisher.send(&vec![7u8; 128]).expect("send");
    }

    assert!(
        wait_until(Duration::from_secs(10), || clocks.lock().len() >= 100),
        "only {} distinct clocks arrived",
        clocks.lock().len()
    );

    let clocks = clocks.lock();
    for (clock, count) in clocks.iter() {
        assert_eq!(*count, 1, "clock {clock} delivered {count} times");
    }
    drop(clocks);

    sub_ctx.finalize();
    pub_ctx.finalize();
}
