// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Periodic broadcaster of local entity registrations.
//!
//! One timer thread serializes every local entity into registration
//! batches each `registration_refresh` tick and writes them to the
//! discovery channel. Stopping the broadcaster sends a final retract
//! batch so peers drop us immediately instead of waiting for expiry.

use super::channel::{DiscoveryTx, MAX_DISCOVERY_FRAME};
use super::local::LocalEntities;
use crate::types::EntityId;
use crate::wire::{RegistrationBatch, RegistrationSample};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Handle of the broadcast timer thread.
pub struct RegistrationBroadcaster {
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl RegistrationBroadcaster {
    /// Start broadcasting `entities` every `refresh`.
    ///
    /// `process_id` is announced as a `Process` entity so peers see the
    /// process itself, not only its endpoints.
    pub fn start(
        context_id: u64,
        process_id: EntityId,
        entities: Arc<LocalEntities>,
        tx: Box<dyn DiscoveryTx>,
        refresh: Duration,
    ) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let thread = std::thread::Builder::new()
            .name("axon-reg-tx".to_string())
            .spawn(move || {
                broadcast_loop(context_id, &process_id, &entities, tx.as_ref(), refresh, &stop_rx);
            })
            .expect("spawning the broadcaster thread");

        Self {
            stop_tx,
            thread: Some(thread),
        }
    }

    /// Stop the timer; blocks until the final retract batch went out.
    pub fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RegistrationBroadcaster {
    fn drop(&mut self) {
        self.stop();
    }
}

fn broadcast_loop(
    context_id: u64,
    process_id: &EntityId,
    entities: &LocalEntities,
    tx: &dyn DiscoveryTx,
    refresh: Duration,
    stop_rx: &Receiver<()>,
) {
    let mut clock: u64 = 0;
    loop {
        clock += 1;

        let mut samples = vec![RegistrationSample::process(process_id.clone(), clock)];
        samples.extend(entities.take_retracts());
        samples.extend(entities.snapshot(clock));
        for frame in build_frames(context_id, samples) {
            tx.send(&frame);
        }

        match stop_rx.recv_timeout(refresh) {
            Err(RecvTimeoutError::Timeout) => continue,
            // Stop requested (or handle dropped): announce departure.
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // Final tick: retract everything, including the process entity.
    clock += 1;
    let mut samples = vec![RegistrationSample::process(process_id.clone(), clock).retracted()];
    samples.extend(entities.take_retracts());
    samples.extend(
        entities
            .snapshot(clock)
            .into_iter()
            .map(RegistrationSample::retracted),
    );
    for frame in build_frames(context_id, samples) {
        tx.send(&frame);
    }
    log::debug!("[REG] broadcaster stopped, retract batch sent");
}

/// Pack samples into batches below the discovery frame bound.
///
/// Re-encoding per pushed sample is quadratic but the entity count per
/// process is small; correctness of the bound matters more here.
fn build_frames(context_id: u64, samples: Vec<RegistrationSample>) -> Vec<Vec<u8>> {
    const SLACK: usize = 1_024;
    let bound = MAX_DISCOVERY_FRAME - SLACK;

    let mut frames = Vec::new();
    let mut batch = RegistrationBatch::new(context_id);
    for sample in samples {
        batch.samples.push(sample);
        if batch.samples.len() > 1 && batch.encode().len() > bound {
            let overflow = batch.samples.pop().expect("len > 1");
            frames.push(batch.encode());
            batch = RegistrationBatch::new(context_id);
            batch.samples.push(overflow);
        }
    }
    if !batch.samples.is_empty() {
        frames.push(batch.encode());
    }
    frames
}
