// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! UDP multicast data layer between two contexts, including fragmented
//! samples above the datagram limit.

mod common;

use axon::{MiddlewareContext, QoS, RawBytes, TransportLayer};
use common::{base_config, wait_until};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn udp_config(tag: &str, port: u16) -> axon::Config {
    let mut config = base_config(tag);
    config.udp.enable = true;
    config.udp.port = port;
    config.priority_local = vec![TransportLayer::Udp];
    config.priority_remote = vec![TransportLayer::Udp];
    config
}

#[test]
fn test_udp_roundtrip_with_fragmentation() {
    let config = udp_config("udp_rt", 24_920);
    let pub_ctx = MiddlewareContext::initialize(config.clone()).expect("pub ctx");
    let sub_ctx = MiddlewareContext::initialize(config).expect("sub ctx");

    let publisher = pub_ctx
        .create_publisher("udp/frag", RawBytes, QoS::best_effort())
        .expect("publisher");
    let subscriber = sub_ctx
        .create_subscriber("udp/frag", RawBytes, QoS::best_effort())
        .expect("subscriber");

    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    subscriber.set_callback(move |msg: Vec<u8>, _info| sink.lock().push(msg));

    assert!(
        wait_until(Duration::from_secs(5), || {
            publisher.connection_count() >= 1 && subscriber.connection_count() >= 1
        }),
        "pair never matched via registration"
    );

    // Far above the 1400-byte datagram limit: must fragment/reassemble.
    let mut big = vec![0u8; 20_000];
    fastrand::seed(0x5EED);
    fastrand::fill(&mut big);

    // Multicast is best effort; repeat until one copy made it through.
    for _ in 0..20 {
        publisher.send(&big).expect("send");
        if wait_until(Duration::from_millis(250), || !received.lock().is_empty()) {
            break;
        }
    }

    let received = received.lock();
    assert!(!received.is_empty(), "no fragmented sample ever arrived");
    assert_eq!(received[0], big, "reassembled payload differs");
    drop(received);

    sub_ctx.finalize();
    pub_ctx.finalize();
}

#[test]
fn test_udp_small_payloads() {
    let config = udp_config("udp_small", 24_921);
    let pub_ctx = MiddlewareContext::initialize(config.clone()).expect("pub ctx");
    let sub_ctx = MiddlewareContext::initialize(config).expect("sub ctx");

    let publisher = pub_ctx
        .create_publisher("udp/small", RawBytes, QoS::best_effort())
        .expect("publisher");
    let subscriber = sub_ctx
        .create_subscriber("udp/small", RawBytes, QoS::best_effort())
        .expect("subscriber");

    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    subscriber.set_callback(move |msg: Vec<u8>, _info| sink.lock().push(msg));

    assert!(wait_until(Duration::from_secs(5), || {
        publisher.connection_count() >= 1 && subscriber.connection_count() >= 1
    }));

    for _ in 0..20 {
        publisher.send(&vec![0xC3u8; 1]).expect("send");
        if wait_until(Duration::from_millis(250), || !received.lock().is_empty()) {
            break;
        }
    }

    let received = received.lock();
    assert!(!received.is_empty(), "single-byte sample never arrived");
    assert_eq!(received[0], vec![0xC3u8]);
    drop(received);

    sub_ctx.finalize();
    pub_ctx.finalize();
}
