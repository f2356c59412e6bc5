// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Finalize must complete while publishers are actively sending: no
//! deadlock, no crash, bounded time.

mod common;

use axon::{Error, MiddlewareContext, QoS, RawBytes};
use common::{shm_config, wait_until};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn test_finalize_during_concurrent_sends() {
    let config = shm_config("shutdown_live");
    let ctx = MiddlewareContext::initialize(config).expect("ctx");

    let publisher = Arc::new(
        ctx.create_publisher("shutdown/topic", RawBytes, QoS::best_effort())
            .expect("publisher"),
    );

    // Hammer send() from several threads while the main thread tears the
    // context down underneath them.
    let stop = Arc::new(AtomicBool::new(false));
    let saw_closed = Arc::new(AtomicBool::new(false));
    let mut senders = Vec::new();
    for _ in 0..4 {
        let publisher = Arc::clone(&publisher);
        let stop = Arc::clone(&stop);
        let saw_closed = Arc::clone(&saw_closed);
        senders.push(std::thread::spawn(move || {
            let payload = vec![0x5Au8; 512];
            while !stop.load(Ordering::Relaxed) {
                match publisher.send(&payload) {
                    Ok(_) => {}
                    Err(Error::ContextClosed) => {
                        // Expected after finalize; keep calling to prove
                        // the path stays safe.
                        saw_closed.store(true, Ordering::Relaxed);
                    }
                    Err(e) => panic!("unexpected send error: {e}"),
                }
            }
        }));
    }

    // Let the senders get going.
    std::thread::sleep(Duration::from_millis(200));

    let start = Instant::now();
    ctx.finalize();
    let elapsed = start.elapsed();
    assert!(
        elapsed < Duration::from_secs(2),
        "finalize took {elapsed:?}, liveness bound is 2s"
    );

    // Sends after finalize must fail locally, not crash.
    assert!(wait_until(Duration::from_secs(2), || {
        saw_closed.load(Ordering::Relaxed)
    }));

    stop.store(true, Ordering::Relaxed);
    for sender in senders {
        sender.join().expect("sender thread must not have panicked");
    }
}

#[test]
fn test_finalize_with_active_subscriber_threads() {
    let config = shm_config("shutdown_sub");
    let pub_ctx = MiddlewareContext::initialize(config.clone()).expect("pub ctx");
    let sub_ctx = MiddlewareContext::initialize(config).expect("sub ctx");

    let publisher = pub_ctx
        .create_publisher("shutdown/sub", RawBytes, QoS::best_effort())
        .expect("publisher");
    let subscriber = sub_ctx
        .create_subscriber("shutdown/sub", RawBytes, QoS::best_effort())
        .expect("subscriber");
    subscriber.set_callback(|_msg: Vec<u8>, _info| {
        std::thread::sleep(Duration::from_millis(1));
    });

    assert!(wait_until(Duration::from_secs(5), || {
        subscriber.connection_count() >= 1
    }));

    for _ in 0..100 {
        publisher.send(&vec![1u8; 256]).expect("send");
    }

    // Tear down the subscriber side while its SHM wait thread is busy.
    let start = Instant::now();
    sub_ctx.finalize();
    assert!(start.elapsed() < Duration::from_secs(2));

    pub_ctx.finalize();
}
