// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Shared helpers for cross-context integration tests.
//!
//! Every test runs its own pair of contexts on a unique shared-memory
//! discovery domain, so parallel tests never see each other.
#![allow(dead_code)] // each test binary uses a different subset

use axon::{Config, DiscoveryChannelKind, TransportLayer};
use std::time::{Duration, Instant};

/// Fast registration cadence for tests.
pub const REFRESH: Duration = Duration::from_millis(100);
pub const TIMEOUT: Duration = Duration::from_millis(500);

/// Base config: SHM discovery bus on a unique domain, all data layers
/// off. Tests enable the layers they exercise.
pub fn base_config(tag: &str) -> Config {
    let nonce = {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64
    };
    let mut config = Config::default();
    config.registration.channel = DiscoveryChannelKind::SharedMemory;
    config.registration.domain = format!("{tag}_{nonce:x}");
    config.registration.refresh = REFRESH;
    config.registration.timeout = TIMEOUT;
    config.shm.enable = false;
    config.udp.enable = false;
    config.tcp.enable = false;
    config.priority_local = Vec::new();
    config.priority_remote = Vec::new();
    config
}

/// SHM-only data plane.
pub fn shm_config(tag: &str) -> Config {
    let mut config = base_config(tag);
    config.shm.enable = true;
    config.priority_local = vec![TransportLayer::Shm];
    config
}

/// TCP-only data plane.
pub fn tcp_config(tag: &str) -> Config {
    let mut config = base_config(tag);
    config.tcp.enable = true;
    config.priority_local = vec![TransportLayer::Tcp];
    config.priority_remote = vec![TransportLayer::Tcp];
    config
}

/// Poll `done` until it holds or `limit` expires.
pub fn wait_until(limit: Duration, mut done: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + limit;
    while Instant::now() < end {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}
