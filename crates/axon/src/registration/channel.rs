// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Pluggable discovery channels.
//!
//! Registration batches travel either over UDP multicast (network-wide)
//! or over a host-local shared-memory broadcast bus. Both carry the exact
//! same frames; the choice is deployment configuration, not protocol.
//!
//! The bus is one well-known multi-writer segment per domain. Writers
//! claim slots with an atomic fetch-add on the head and commit with the
//! same seqlock protocol the data ring uses; readers poll from the
//! registration receiver thread.

use crate::config::RegistrationConfig;
use crate::transport::shm::ShmSegment;
use crate::transport::udp::{create_recv_socket, create_send_socket};
use std::io;
use std::net::{SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Largest frame a discovery channel accepts. The broadcaster chunks
/// sample batches below this bound.
pub const MAX_DISCOVERY_FRAME: usize = 32 * 1024;

/// Sending half of a discovery channel.
pub trait DiscoveryTx: Send {
    /// Best effort: failures are logged and counted, never surfaced.
    fn send(&self, frame: &[u8]);
}

/// Receiving half of a discovery channel.
pub trait DiscoveryRx: Send {
    /// Append every pending frame to `out`. May block for up to roughly
    /// 100 ms waiting for traffic; returns promptly when frames arrive.
    fn recv(&mut self, out: &mut Vec<Vec<u8>>);
}

/// Build the configured channel pair.
pub fn create_channel(
    config: &RegistrationConfig,
) -> io::Result<(Box<dyn DiscoveryTx>, Box<dyn DiscoveryRx>)> {
    match config.channel {
        crate::config::DiscoveryChannelKind::UdpMulticast => {
            let tx = UdpDiscoveryTx::new(config)?;
            let rx = UdpDiscoveryRx::new(config)?;
            Ok((Box::new(tx), Box::new(rx)))
        }
        crate::config::DiscoveryChannelKind::SharedMemory => {
            let tx = ShmBusTx::open(&config.domain)?;
            let rx = ShmBusRx::open(&config.domain)?;
            Ok((Box::new(tx), Box::new(rx)))
        }
    }
}

// =======================================================================
// UDP multicast channel
// =======================================================================

struct UdpDiscoveryTx {
    socket: UdpSocket,
    dest: SocketAddrV4,
}

impl UdpDiscoveryTx {
    fn new(config: &RegistrationConfig) -> io::Result<Self> {
        // Loopback stays on: same-host processes must hear us.
        let socket = create_send_socket(2, true, 0).map_err(io_of_udp)?;
        Ok(Self {
            socket,
            dest: SocketAddrV4::new(config.multicast_group, config.port),
        })
    }
}

impl DiscoveryTx for UdpDiscoveryTx {
    fn send(&self, frame: &[u8]) {
        if let Err(e) = self.socket.send_to(frame, self.dest) {
            log::debug!("[REG] discovery send failed (transient): {e}");
        }
    }
}

struct UdpDiscoveryRx {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl UdpDiscoveryRx {
    fn new(config: &RegistrationConfig) -> io::Result<Self> {
        let socket =
            create_recv_socket(config.multicast_group, config.port, 0).map_err(io_of_udp)?;
        Ok(Self {
            socket,
            buf: vec![0u8; MAX_DISCOVERY_FRAME * 2],
        })
    }
}

impl DiscoveryRx for UdpDiscoveryRx {
    fn recv(&mut self, out: &mut Vec<Vec<u8>>) {
        // First read blocks up to the socket timeout, the rest drains.
        loop {
            match self.socket.recv_from(&mut self.buf) {
                Ok((n, _)) => out.push(self.buf[..n].to_vec()),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return;
                }
                Err(e) => {
                    log::debug!("[REG] discovery recv error (ignored): {e}");
                    return;
                }
            }
        }
    }
}

fn io_of_udp(e: crate::transport::udp::UdpError) -> io::Error {
    match e {
        crate::transport::udp::UdpError::Socket(inner) => inner,
    }
}

// =======================================================================
// Shared-memory broadcast bus
// =======================================================================

const BUS_MAGIC: u32 = 0x4158_4242; // "AXBB"
const BUS_VERSION: u32 = 1;
const BUS_CAPACITY: usize = 64;
const BUS_SLOT_SIZE: usize = MAX_DISCOVERY_FRAME;

#[repr(C, align(64))]
struct BusControl {
    magic: AtomicU32,
    version: u32,
    capacity: u32,
    slot_size: u32,
    _pad0: u32,
    head: AtomicU64,
    _pad1: [u8; 32],
}

#[repr(C, align(64))]
struct BusSlot {
    /// `(seq << 1) | 1` while writing, `seq << 1` committed
    seq: AtomicU64,
    len: AtomicU32,
    _pad: [u8; 52],
}

fn bus_stride() -> usize {
    std::mem::size_of::<BusSlot>() + BUS_SLOT_SIZE
}

fn bus_size() -> usize {
    std::mem::size_of::<BusControl>() + BUS_CAPACITY * bus_stride()
}

fn bus_name(domain: &str) -> String {
    let safe: String = domain
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    format!("/axon_regbus_{safe}")
}

/// Open (or create) the bus segment and wait until it is initialized.
fn open_bus(domain: &str) -> io::Result<ShmSegment> {
    let name = bus_name(domain);
    let (segment, created) = ShmSegment::open_or_create(&name, bus_size())
        .map_err(|e| io::Error::other(e.to_string()))?;

    if created {
        // SAFETY: we just created the zeroed segment and nobody trusts it
        // before the magic is published, so exclusive access holds here.
        unsafe {
            let control = &mut *(segment.as_ptr().cast::<BusControl>());
            control.version = BUS_VERSION;
            control.capacity = BUS_CAPACITY as u32;
            control.slot_size = BUS_SLOT_SIZE as u32;
            control.magic.store(BUS_MAGIC, Ordering::Release);
        }
        log::debug!("[REG] created discovery bus {name}");
    } else {
        // SAFETY: BusControl sits at offset 0 of a mapping of at least
        // bus_size() bytes; cross-process access goes through atomics.
        let control = unsafe { &*(segment.as_ptr().cast::<BusControl>()) };
        // Another process may still be between create and init.
        let mut tries = 0;
        while control.magic.load(Ordering::Acquire) != BUS_MAGIC {
            tries += 1;
            if tries > 100 {
                return Err(io::Error::other("discovery bus never initialized"));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
    Ok(segment)
}

fn bus_slot(segment: &ShmSegment, index: usize) -> (&BusSlot, *mut u8) {
    debug_assert!(index < BUS_CAPACITY);
    // SAFETY: index < BUS_CAPACITY keeps the offset inside the mapping
    // sized by bus_size(); each stride starts with a BusSlot header.
    unsafe {
        let base = segment
            .as_ptr()
            .add(std::mem::size_of::<BusControl>() + index * bus_stride());
        (
            &*(base.cast::<BusSlot>()),
            base.add(std::mem::size_of::<BusSlot>()),
        )
    }
}

struct ShmBusTx {
    segment: ShmSegment,
}

impl ShmBusTx {
    fn open(domain: &str) -> io::Result<Self> {
        Ok(Self {
            segment: open_bus(domain)?,
        })
    }

    fn control(&self) -> &BusControl {
        // SAFETY: see open_bus.
        unsafe { &*(self.segment.as_ptr().cast::<BusControl>()) }
    }
}

impl DiscoveryTx for ShmBusTx {
    fn send(&self, frame: &[u8]) {
        if frame.len() > BUS_SLOT_SIZE {
            log::warn!(
                "[REG] discovery frame of {} bytes exceeds bus slot size {}, dropped",
                frame.len(),
                BUS_SLOT_SIZE
            );
            return;
        }

        // Claim a slot; the seqlock markers protect readers from the rare
        // case of two writers lapping onto the same slot.
        let seq = self.control().head.fetch_add(1, Ordering::AcqRel);
        let idx = (seq % BUS_CAPACITY as u64) as usize;
        let (slot, payload) = bus_slot(&self.segment, idx);

        slot.seq.store((seq << 1) | 1, Ordering::Relaxed);
        slot.len.store(frame.len() as u32, Ordering::Relaxed);
        // SAFETY: payload spans BUS_SLOT_SIZE bytes; length checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(frame.as_ptr(), payload, frame.len());
        }
        slot.seq.store(seq << 1, Ordering::Release);
    }
}

struct ShmBusRx {
    segment: ShmSegment,
    next_seq: u64,
}

impl ShmBusRx {
    fn open(domain: &str) -> io::Result<Self> {
        let segment = open_bus(domain)?;
        // SAFETY: see open_bus.
        let head = unsafe {
            (*(segment.as_ptr().cast::<BusControl>()))
                .head
                .load(Ordering::Acquire)
        };
        Ok(Self {
            segment,
            next_seq: head,
        })
    }

    fn control(&self) -> &BusControl {
        // SAFETY: see open_bus.
        unsafe { &*(self.segment.as_ptr().cast::<BusControl>()) }
    }
}

impl DiscoveryRx for ShmBusRx {
    fn recv(&mut self, out: &mut Vec<Vec<u8>>) {
        let head = self.control().head.load(Ordering::Acquire);

        // Fell behind a full lap: resync to the newest frames.
        if head.saturating_sub(self.next_seq) > BUS_CAPACITY as u64 {
            self.next_seq = head.saturating_sub(BUS_CAPACITY as u64 / 2);
        }

        let mut got_any = false;
        while self.next_seq < head {
            let seq = self.next_seq;
            let idx = (seq % BUS_CAPACITY as u64) as usize;
            let (slot, payload) = bus_slot(&self.segment, idx);
            let want = seq << 1;

            if slot.seq.load(Ordering::Acquire) == want {
                let len = (slot.len.load(Ordering::Relaxed) as usize).min(BUS_SLOT_SIZE);
                // SAFETY: payload spans BUS_SLOT_SIZE bytes, len clamped.
                let bytes =
                    unsafe { std::slice::from_raw_parts(payload as *const u8, len) }.to_vec();
                // Re-check: a concurrent writer lapping this slot tears
                // the copy; drop it, the next refresh repeats the data.
                if slot.seq.load(Ordering::Acquire) == want {
                    out.push(bytes);
                    got_any = true;
                }
            }
            self.next_seq = seq + 1;
        }

        if !got_any {
            // Nothing on the bus; pace the polling loop.
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryChannelKind;

    fn unique_domain() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("bus_test_{ts}")
    }

    #[test]
    fn test_bus_roundtrip() {
        let domain = unique_domain();
        let tx = ShmBusTx::open(&domain).expect("tx");
        let mut rx = ShmBusRx::open(&domain).expect("rx");

        tx.send(b"frame one");
        tx.send(b"frame two");

        let mut out = Vec::new();
        rx.recv(&mut out);
        assert_eq!(out, vec![b"frame one".to_vec(), b"frame two".to_vec()]);

        ShmSegment::unlink(&bus_name(&domain)).ok();
    }

    #[test]
    fn test_bus_reader_starts_at_head() {
        let domain = unique_domain();
        let tx = ShmBusTx::open(&domain).expect("tx");
        tx.send(b"old frame");

        let mut rx = ShmBusRx::open(&domain).expect("rx");
        let mut out = Vec::new();
        rx.recv(&mut out);
        assert!(out.is_empty(), "late joiner must not see old frames");

        ShmSegment::unlink(&bus_name(&domain)).ok();
    }

    #[test]
    fn test_bus_oversized_frame_dropped() {
        let domain = unique_domain();
        let tx = ShmBusTx::open(&domain).expect("tx");
        let mut rx = ShmBusRx::open(&domain).expect("rx");

        tx.send(&vec![0u8; BUS_SLOT_SIZE + 1]);
        let mut out = Vec::new();
        rx.recv(&mut out);
        assert!(out.is_empty());

        ShmSegment::unlink(&bus_name(&domain)).ok();
    }

    #[test]
    fn test_bus_two_writers_interleave() {
        let domain = unique_domain();
        let tx_a = ShmBusTx::open(&domain).expect("tx a");
        let tx_b = ShmBusTx::open(&domain).expect("tx b");
        let mut rx = ShmBusRx::open(&domain).expect("rx");

        tx_a.send(b"from a");
        tx_b.send(b"from b");

        let mut out = Vec::new();
        rx.recv(&mut out);
        assert_eq!(out.len(), 2);

        ShmSegment::unlink(&bus_name(&domain)).ok();
    }

    #[test]
    fn test_udp_channel_roundtrip() {
        let config = RegistrationConfig {
            channel: DiscoveryChannelKind::UdpMulticast,
            multicast_group: std::net::Ipv4Addr::new(239, 254, 202, 1),
            port: 24_901,
            ..RegistrationConfig::default()
        };
        let (tx, mut rx) = create_channel(&config).expect("channel");

        let mut out = Vec::new();
        for _ in 0..20 {
            tx.send(b"discovery frame");
            rx.recv(&mut out);
            if !out.is_empty() {
                break;
            }
        }
        assert!(!out.is_empty(), "multicast loopback frame never arrived");
        assert_eq!(out[0], b"discovery frame");
    }
}
