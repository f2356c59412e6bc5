// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Multicast socket construction and interface discovery.
//!
//! Sockets are built through `socket2` so TTL, loopback and buffer sizes
//! can be applied before binding. Receive sockets join the group on every
//! non-loopback IPv4 interface; per-interface join failures are logged and
//! skipped, mirroring how multi-homed hosts behave in practice.

use super::Result;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

/// All non-loopback IPv4 interface addresses usable for multicast.
///
/// `AXON_MULTICAST_IF` overrides discovery with one fixed interface
/// (useful in containers with oddball routing).
pub fn multicast_interfaces() -> Vec<Ipv4Addr> {
    if let Ok(var) = std::env::var("AXON_MULTICAST_IF") {
        if let Ok(addr) = var.parse::<Ipv4Addr>() {
            log::debug!("[UDP] using AXON_MULTICAST_IF override: {addr}");
            return vec![addr];
        }
    }

    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(ifs) => ifs,
        Err(e) => {
            log::debug!("[UDP] interface enumeration failed: {e}");
            return Vec::new();
        }
    };

    let mut addrs = Vec::new();
    for (_name, ip) in interfaces {
        if let IpAddr::V4(ipv4) = ip {
            if !ipv4.is_loopback() {
                addrs.push(ipv4);
            }
        }
    }
    addrs
}

/// Build a send socket for the given group.
///
/// Bound to an ephemeral port; destination is passed per send call.
pub fn create_send_socket(ttl: u32, loopback: bool, send_buffer: usize) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_multicast_ttl_v4(ttl)?;
    socket.set_multicast_loop_v4(loopback)?;
    if send_buffer > 0 {
        socket.set_send_buffer_size(send_buffer)?;
    }
    let bind: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into();
    socket.bind(&bind.into())?;
    Ok(socket.into())
}

/// Build a receive socket bound to `port`, joined to `group`.
///
/// `SO_REUSEADDR`/`SO_REUSEPORT` allow several processes on one host to
/// share the group, which same-host pub/sub depends on. A short read
/// timeout keeps receive loops responsive to shutdown.
pub fn create_recv_socket(group: Ipv4Addr, port: u16, recv_buffer: usize) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    if recv_buffer > 0 {
        socket.set_recv_buffer_size(recv_buffer)?;
    }

    let bind: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into();
    socket.bind(&bind.into())?;

    let socket: UdpSocket = socket.into();
    join_group(&socket, group)?;
    socket.set_read_timeout(Some(Duration::from_millis(100)))?;
    Ok(socket)
}

/// Join `group` on every available interface.
fn join_group(socket: &UdpSocket, group: Ipv4Addr) -> io::Result<()> {
    let interfaces = multicast_interfaces();

    if interfaces.is_empty() {
        log::debug!("[UDP] no multicast interfaces found, joining {group} on UNSPECIFIED");
        socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        return Ok(());
    }

    let mut joined = 0usize;
    for iface in &interfaces {
        match socket.join_multicast_v4(&group, iface) {
            Ok(()) => {
                log::debug!("[UDP] joined {group} on {iface}");
                joined += 1;
            }
            Err(e) if e.raw_os_error() == Some(libc::EADDRINUSE) => {
                // Already joined via another address on the same NIC.
                joined += 1;
            }
            Err(e) => {
                log::debug!("[UDP] join {group} on {iface} failed (non-fatal): {e}");
            }
        }
    }

    if joined == 0 {
        // Last resort: let the kernel pick.
        socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_socket_builds() {
        let socket = create_send_socket(1, true, 0).expect("send socket");
        assert_eq!(socket.local_addr().expect("addr").ip(), Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_recv_socket_builds_and_times_out() {
        let group = Ipv4Addr::new(239, 254, 200, 1);
        let socket = create_recv_socket(group, 0, 0).expect("recv socket");
        let mut buf = [0u8; 16];
        // No traffic on an ephemeral-port group: must time out, not block.
        let err = socket.recv_from(&mut buf).expect_err("should time out");
        assert!(
            matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut),
            "unexpected error kind {:?}",
            err.kind()
        );
    }

    #[test]
    fn test_loopback_roundtrip() {
        let group = Ipv4Addr::new(239, 254, 200, 2);
        let recv = create_recv_socket(group, 0, 0).expect("recv socket");
        let port = recv.local_addr().expect("addr").port();
        let send = create_send_socket(1, true, 0).expect("send socket");

        send.send_to(b"ping", SocketAddrV4::new(group, port))
            .expect("send");

        let mut buf = [0u8; 16];
        // A couple of tries: multicast loopback can be slow to warm up.
        for _ in 0..20 {
            match recv.recv_from(&mut buf) {
                Ok((4, _)) => {
                    assert_eq!(&buf[..4], b"ping");
                    return;
                }
                Ok(_) => panic!("unexpected datagram size"),
                Err(_) => {
                    send.send_to(b"ping", SocketAddrV4::new(group, port)).ok();
                }
            }
        }
        panic!("loopback datagram never arrived");
    }
}
