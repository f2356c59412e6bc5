// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Single-writer/multi-reader shared-memory ring.
//!
//! # Memory layout
//!
//! ```text
//! +--------------------------------------------------------------+
//! | RingControl (64 bytes, cache-aligned)                        |
//! +--------------------------------------------------------------+
//! | SlotHeader[0] (64 bytes) | payload[0] (slot_size, 64-padded) |
//! | SlotHeader[1]            | payload[1]                        |
//! | ...                                                          |
//! +--------------------------------------------------------------+
//! ```
//!
//! # Protocol
//!
//! Writer push (slot = seq % capacity):
//! 1. Wait until `slot.acks == 0` or `acknowledge_timeout` expires
//! 2. `slot.seq = (seq << 1) | 1` (write in progress)
//! 3. Copy length + payload
//! 4. `slot.acks = attached readers` (Release)
//! 5. `slot.seq = seq << 1` (Release, committed)
//! 6. Publish `control.head = seq + 1`, bump notify futex
//!
//! Reader pop:
//! 1. Overrun check against `head`
//! 2. Verify `slot.seq == expected << 1` (Acquire)
//! 3. Copy payload (or run the zero-copy callback in place)
//! 4. Re-check `slot.seq` to detect a torn read
//! 5. Decrement `slot.acks`; wake the writer at zero
//!
//! A reader acknowledges only slots whose sequence still matches what it
//! read, so a late ack after the writer's timeout can never corrupt the
//! count of a newer sample.

use super::futex;
use super::segment::ShmSegment;
use super::{Result, ShmError};
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Ring header magic ("AXSM").
const RING_MAGIC: u32 = 0x4158_534d;

/// Ring layout version.
const RING_VERSION: u32 = 1;

/// Control block at offset 0 of every ring segment.
#[repr(C, align(64))]
pub struct RingControl {
    magic: u32,
    version: u32,
    /// Bumped each time the writer recreates the ring (growth, restart)
    generation: u32,
    capacity: u32,
    slot_size: u32,
    _pad0: u32,
    /// Next sequence number to be written
    head: AtomicU64,
    /// Data-ready counter; futex target for blocking readers
    notify: AtomicU32,
    /// Number of currently attached readers
    attached: AtomicU32,
    _pad1: [u8; 24],
}

impl RingControl {
    fn init(&mut self, generation: u32, capacity: u32, slot_size: u32) {
        self.magic = RING_MAGIC;
        self.version = RING_VERSION;
        self.generation = generation;
        self.capacity = capacity;
        self.slot_size = slot_size;
        self.head = AtomicU64::new(0);
        self.notify = AtomicU32::new(0);
        self.attached = AtomicU32::new(0);
    }

    fn validate(&self) -> bool {
        self.magic == RING_MAGIC && self.version == RING_VERSION && self.capacity > 0
    }
}

/// Per-slot header preceding the payload area.
#[repr(C, align(64))]
pub struct SlotHeader {
    /// `(seq << 1) | 1` while writing, `seq << 1` once committed
    pub seq: AtomicU64,
    /// Payload length of the committed sample
    pub len: AtomicU32,
    /// Readers that have not yet released this slot; futex target for the
    /// writer's acknowledge wait
    pub acks: AtomicU32,
    _pad: [u8; 48],
}

/// Stride of one slot (header + payload, cache-line padded).
fn slot_stride(slot_size: usize) -> usize {
    let raw = std::mem::size_of::<SlotHeader>() + slot_size;
    (raw + 63) & !63
}

/// Total segment size for a ring.
fn ring_segment_size(capacity: usize, slot_size: usize) -> usize {
    std::mem::size_of::<RingControl>() + capacity * slot_stride(slot_size)
}

/// Writer-side counters.
#[derive(Debug, Default)]
pub struct WriterMetrics {
    /// Pushes where the acknowledge wait expired and the slot was reused
    pub ack_timeouts: AtomicU64,
    /// Samples pushed
    pub pushed: AtomicU64,
}

/// Owning side of a shared-memory ring.
pub struct ShmRingWriter {
    segment: ShmSegment,
    capacity: usize,
    slot_size: usize,
    stride: usize,
    generation: u32,
    next_seq: u64,
    acknowledge_timeout: Option<Duration>,
    /// Counters, readable by the owner
    pub metrics: WriterMetrics,
}

impl ShmRingWriter {
    /// Create a ring with `capacity` slots of `slot_size` payload bytes.
    ///
    /// `acknowledge_timeout = None` disables the handshake entirely: the
    /// writer overwrites slots without waiting for readers.
    pub fn create(
        name: &str,
        capacity: usize,
        slot_size: usize,
        generation: u32,
        acknowledge_timeout: Option<Duration>,
    ) -> Result<Self> {
        debug_assert!(capacity >= 1);
        let segment = ShmSegment::create(name, ring_segment_size(capacity, slot_size))?;

        // SAFETY: the segment starts with a RingControl-sized region,
        // page alignment satisfies the 64-byte requirement, and the zeroed
        // segment is exclusively ours until the name is advertised.
        let control = unsafe { &mut *(segment.as_ptr().cast::<RingControl>()) };
        control.init(generation, capacity as u32, slot_size as u32);

        Ok(Self {
            segment,
            capacity,
            slot_size,
            stride: slot_stride(slot_size),
            generation,
            next_seq: 0,
            acknowledge_timeout,
            metrics: WriterMetrics::default(),
        })
    }

    #[inline]
    fn control(&self) -> &RingControl {
        // SAFETY: segment holds a valid mapping with RingControl at offset
        // 0 for its whole lifetime; mutation happens through atomics only.
        unsafe { &*(self.segment.as_ptr().cast::<RingControl>()) }
    }

    #[inline]
    fn slot(&self, index: usize) -> (&SlotHeader, *mut u8) {
        debug_assert!(index < self.capacity);
        // SAFETY: index < capacity keeps the offset within the mapping
        // created with ring_segment_size; SlotHeader starts each stride
        // and its payload area directly follows.
        unsafe {
            let base = self
                .segment
                .as_ptr()
                .add(std::mem::size_of::<RingControl>() + index * self.stride);
            (
                &*(base.cast::<SlotHeader>()),
                base.add(std::mem::size_of::<SlotHeader>()),
            )
        }
    }

    /// Push one payload into the next slot.
    ///
    /// Blocks at most `acknowledge_timeout` waiting for the slot's previous
    /// readers; on expiry the slot is reused anyway and only the slow
    /// reader misses the overwritten sample.
    pub fn push(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.slot_size {
            return Err(ShmError::PayloadTooLarge {
                size: data.len(),
                slot_size: self.slot_size,
            });
        }

        let msg_seq = self.next_seq;
        let idx = (msg_seq % self.capacity as u64) as usize;
        let (slot, payload) = self.slot(idx);

        // 1. Wait for the previous occupant to be released
        if let Some(timeout) = self.acknowledge_timeout {
            if msg_seq >= self.capacity as u64 {
                self.await_acks(slot, timeout);
            }
        }

        // 2. Mark in-progress (odd)
        slot.seq.store((msg_seq << 1) | 1, Ordering::Relaxed);
        slot.len.store(data.len() as u32, Ordering::Relaxed);

        // 3. Copy payload
        // SAFETY: payload points at this slot's `slot_size`-byte area;
        // data.len() <= slot_size was checked; the odd sequence marker
        // keeps readers away while we copy.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), payload, data.len());
        }

        // 4. Arm the acknowledge count for the attached readers
        let readers = if self.acknowledge_timeout.is_some() {
            self.control().attached.load(Ordering::Acquire)
        } else {
            0
        };
        slot.acks.store(readers, Ordering::Release);

        // 5. Commit (even), 6. publish head + wake readers
        slot.seq.store(msg_seq << 1, Ordering::Release);
        let control = self.control();
        control.head.store(msg_seq + 1, Ordering::Release);
        control.notify.fetch_add(1, Ordering::Release);
        futex::wake_all(&control.notify);

        self.next_seq = msg_seq + 1;
        self.metrics.pushed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn await_acks(&self, slot: &SlotHeader, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let pending = slot.acks.load(Ordering::Acquire);
            if pending == 0 {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                self.metrics.ack_timeouts.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "[SHM] ack timeout on {}: {pending} reader(s) still holding, reusing slot",
                    self.segment.name()
                );
                return;
            }
            futex::wait(&slot.acks, pending, Some(deadline - now));
        }
    }

    /// Next sequence to be written.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.next_seq
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    #[must_use]
    pub fn segment_name(&self) -> &str {
        self.segment.name()
    }

    /// Remove the segment name; mappings of attached readers stay valid.
    pub fn unlink(&self) -> Result<()> {
        ShmSegment::unlink(self.segment.name())
    }
}

/// Reader-side counters.
#[derive(Debug, Default)]
pub struct ReaderMetrics {
    pub received: AtomicU64,
    /// Reader fell more than `capacity` behind and skipped forward
    pub overruns: AtomicU64,
    /// Slot was overwritten while reading (post-timeout writer)
    pub torn_reads: AtomicU64,
}

/// Outcome of a single pop attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopResult {
    /// A sample was delivered
    Delivered(usize),
    /// Nothing to read
    Empty,
    /// Reader was overrun; cursor skipped to the newest sample
    Overrun,
    /// Payload was overwritten mid-read and discarded
    Torn,
}

/// Attached side of a shared-memory ring.
///
/// Dropping the reader deregisters it, so the writer stops waiting for
/// its acknowledgements.
pub struct ShmRingReader {
    segment: ShmSegment,
    capacity: usize,
    slot_size: usize,
    stride: usize,
    generation: u32,
    next_seq: u64,
    /// Reason the most recent pop attempt delivered nothing
    last_miss: PopResult,
    pub metrics: ReaderMetrics,
}

impl ShmRingReader {
    /// Attach to an existing ring by name.
    ///
    /// Reads the geometry from the control block, so callers only need
    /// the advertised segment name.
    pub fn attach(name: &str) -> Result<Self> {
        // First map just the control block to learn the geometry.
        let probe = ShmSegment::open(name, std::mem::size_of::<RingControl>())?;
        // SAFETY: the mapping covers at least RingControl; concurrent
        // access is atomic-only.
        let (generation, capacity, slot_size) = {
            let control = unsafe { &*(probe.as_ptr().cast::<RingControl>()) };
            if !control.validate() {
                return Err(ShmError::IncompatibleSegment);
            }
            (
                control.generation,
                control.capacity as usize,
                control.slot_size as usize,
            )
        };
        drop(probe);

        let segment = ShmSegment::open(name, ring_segment_size(capacity, slot_size))?;
        // SAFETY: full-size mapping with RingControl at offset 0.
        let control = unsafe { &*(segment.as_ptr().cast::<RingControl>()) };
        if !control.validate() || control.generation != generation {
            return Err(ShmError::IncompatibleSegment);
        }

        // Start at the current head: a late joiner sees new data only.
        let start = control.head.load(Ordering::Acquire);
        control.attached.fetch_add(1, Ordering::AcqRel);

        Ok(Self {
            segment,
            capacity,
            slot_size,
            stride: slot_stride(slot_size),
            generation,
            next_seq: start,
            last_miss: PopResult::Empty,
            metrics: ReaderMetrics::default(),
        })
    }

    /// Attach and rewind to a specific sequence (tests/replay).
    pub fn attach_from(name: &str, start_seq: u64) -> Result<Self> {
        let mut reader = Self::attach(name)?;
        reader.next_seq = start_seq;
        Ok(reader)
    }

    #[inline]
    fn control(&self) -> &RingControl {
        // SAFETY: see ShmRingWriter::control.
        unsafe { &*(self.segment.as_ptr().cast::<RingControl>()) }
    }

    #[inline]
    fn slot(&self, index: usize) -> (&SlotHeader, *const u8) {
        debug_assert!(index < self.capacity);
        // SAFETY: see ShmRingWriter::slot; reader side only loads payload
        // bytes and stores to the atomic ack word.
        unsafe {
            let base = self
                .segment
                .as_ptr()
                .add(std::mem::size_of::<RingControl>() + index * self.stride);
            (
                &*(base.cast::<SlotHeader>()),
                base.add(std::mem::size_of::<SlotHeader>()) as *const u8,
            )
        }
    }

    /// Release a slot we finished reading. Only counts if the slot still
    /// carries the sequence we read; after a writer timeout the slot
    /// belongs to a newer sample and our ack is moot.
    fn ack(&self, slot: &SlotHeader, want: u64) {
        loop {
            let pending = slot.acks.load(Ordering::Acquire);
            if pending == 0 || slot.seq.load(Ordering::Acquire) != want {
                return;
            }
            if slot
                .acks
                .compare_exchange_weak(pending, pending - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if pending == 1 {
                    futex::wake_all(&slot.acks);
                }
                return;
            }
        }
    }

    /// Copy the next sample into `buf` without blocking.
    pub fn try_pop(&mut self, buf: &mut [u8]) -> PopResult {
        let mut out = PopResult::Empty;
        self.pop_inner(|payload| {
            let n = payload.len().min(buf.len());
            buf[..n].copy_from_slice(&payload[..n]);
            out = PopResult::Delivered(n);
        });
        match out {
            PopResult::Delivered(n) => PopResult::Delivered(n),
            _ => self.last_miss,
        }
    }

    /// Deliver the next sample to `f` without copying.
    ///
    /// `f` runs while the slot is still held; the slot is acknowledged
    /// when `f` returns, so the callback must not retain the slice.
    pub fn try_pop_with(&mut self, f: impl FnOnce(&[u8])) -> PopResult {
        let mut delivered_len = None;
        self.pop_inner(|payload| {
            delivered_len = Some(payload.len());
            f(payload);
        });
        match delivered_len {
            Some(n) => PopResult::Delivered(n),
            None => self.last_miss,
        }
    }

    /// Blocking variant of [`Self::try_pop_with`].
    ///
    /// Uses the double-check pattern against the notify futex to avoid
    /// lost wakeups; returns `Empty` once `timeout` expires.
    pub fn pop_blocking_with(
        &mut self,
        timeout: Option<Duration>,
        f: impl FnOnce(&[u8]),
    ) -> PopResult {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut f = Some(f);
        loop {
            let result = self.try_pop_with(|payload| {
                if let Some(f) = f.take() {
                    f(payload);
                }
            });
            match result {
                PopResult::Empty => {}
                other => return other,
            }

            let snapshot = self.control().notify.load(Ordering::Acquire);

            // Re-poll after snapshotting: catches a push racing the wait.
            let result = self.try_pop_with(|payload| {
                if let Some(f) = f.take() {
                    f(payload);
                }
            });
            match result {
                PopResult::Empty => {}
                other => return other,
            }

            let remaining = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return PopResult::Empty;
                    }
                    Some(d - now)
                }
                None => None,
            };
            futex::wait(&self.control().notify, snapshot, remaining);
        }
    }

    /// Core pop: runs `f` on the committed payload, handles overrun,
    /// torn-read detection and acknowledgement. On a miss, the reason is
    /// left in `self.last_miss`.
    fn pop_inner(&mut self, f: impl FnOnce(&[u8])) {
        self.last_miss = PopResult::Empty;

        let head = self.control().head.load(Ordering::Acquire);
        if head.saturating_sub(self.next_seq) > self.capacity as u64 {
            // Too far behind: everything below head - 1 is being reused.
            self.next_seq = head - 1;
            self.metrics.overruns.fetch_add(1, Ordering::Relaxed);
            self.last_miss = PopResult::Overrun;
            return;
        }
        if self.next_seq >= head {
            return;
        }

        let expected = self.next_seq;
        let idx = (expected % self.capacity as u64) as usize;
        let (slot, payload_ptr) = self.slot(idx);
        let want = expected << 1;

        if slot.seq.load(Ordering::Acquire) != want {
            // Not committed yet (or already recycled past us).
            return;
        }

        let len = slot.len.load(Ordering::Relaxed) as usize;
        if len > self.slot_size {
            self.metrics.torn_reads.fetch_add(1, Ordering::Relaxed);
            self.next_seq = expected + 1;
            self.last_miss = PopResult::Torn;
            return;
        }

        // SAFETY: payload_ptr spans slot_size bytes of the mapping and
        // len <= slot_size. The slice is only valid until the writer
        // recycles the slot; the seq re-check below detects that case.
        let payload = unsafe { std::slice::from_raw_parts(payload_ptr, len) };
        f(payload);

        if slot.seq.load(Ordering::Acquire) != want {
            // Writer gave up on our ack and overwrote during the read.
            self.metrics.torn_reads.fetch_add(1, Ordering::Relaxed);
            self.next_seq = expected + 1;
            self.last_miss = PopResult::Torn;
            return;
        }

        self.ack(slot, want);
        self.next_seq = expected + 1;
        self.metrics.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Samples currently available.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.control()
            .head
            .load(Ordering::Acquire)
            .saturating_sub(self.next_seq)
    }

    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    #[must_use]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }
}

impl Drop for ShmRingReader {
    fn drop(&mut self) {
        self.control().attached.fetch_sub(1, Ordering::AcqRel);
    }
}
