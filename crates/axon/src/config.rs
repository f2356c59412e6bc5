// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Global configuration - single source of truth.
//!
//! All tunables of the middleware live here, consumed as plain structs.
//! Loading them from files is an external concern; the core only validates.
//!
//! # Validation
//!
//! [`Config::validate`] is called by `MiddlewareContext::initialize` and
//! rejects inconsistent settings (timeout ordering, non-multicast group,
//! zero-sized pools) with a descriptive [`ConfigError`]. Invalid values are
//! never silently coerced.

use crate::transport::TransportLayer;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

// =======================================================================
// Defaults
// =======================================================================

/// Registration broadcast period (milliseconds).
///
/// Every local entity is re-announced at this cadence.
pub const DEFAULT_REGISTRATION_REFRESH_MS: u64 = 1_000;

/// Registration expiry timeout (milliseconds).
///
/// An entity with no sample for this long is reported disconnected.
/// Must be strictly greater than the refresh period.
pub const DEFAULT_REGISTRATION_TIMEOUT_MS: u64 = 5_000;

/// Well-known discovery multicast group.
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 0, 0, 1);

/// Discovery (registration traffic) UDP port.
pub const DEFAULT_DISCOVERY_PORT: u16 = 14_000;

/// User data multicast UDP port.
pub const DEFAULT_DATA_PORT: u16 = 14_010;

/// Default number of shared-memory buffer slots per writer.
pub const DEFAULT_SHM_BUFFER_COUNT: usize = 1;

/// Default minimum shared-memory slot payload size (bytes).
pub const DEFAULT_SHM_MIN_SIZE: usize = 4_096;

/// Largest UDP datagram payload before fragmentation (bytes).
///
/// Chosen below the common 1500-byte Ethernet MTU minus IP/UDP/axon headers.
pub const DEFAULT_MAX_DATAGRAM_BYTES: usize = 1_400;

/// Default maximum TCP frame size (anti-OOM guard).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

// =======================================================================
// Errors
// =======================================================================

/// Configuration rejected at build time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `registration.timeout` must be strictly greater than `registration.refresh`
    TimeoutNotAboveRefresh { refresh: Duration, timeout: Duration },
    /// Refresh interval of zero would spin the broadcaster
    ZeroRefreshInterval,
    /// Discovery/data group address is not in the IPv4 multicast range
    NotMulticast(Ipv4Addr),
    /// Shared-memory buffer count must be >= 1
    ZeroBufferCount,
    /// TCP executor pools must have at least one thread each
    ZeroPoolSize { role: &'static str },
    /// A layer priority list references a disabled layer
    DisabledLayerInPriority(TransportLayer),
    /// Discovery and data ports collide
    PortCollision(u16),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimeoutNotAboveRefresh { refresh, timeout } => write!(
                f,
                "registration timeout ({timeout:?}) must be strictly greater than refresh ({refresh:?})"
            ),
            Self::ZeroRefreshInterval => write!(f, "registration refresh interval must be > 0"),
            Self::NotMulticast(addr) => {
                write!(f, "{addr} is not an IPv4 multicast address (224.0.0.0/4)")
            }
            Self::ZeroBufferCount => write!(f, "shared-memory buffer count must be >= 1"),
            Self::ZeroPoolSize { role } => {
                write!(f, "tcp {role} pool size must be >= 1")
            }
            Self::DisabledLayerInPriority(layer) => {
                write!(f, "layer priority list contains disabled layer {layer}")
            }
            Self::PortCollision(port) => {
                write!(f, "discovery and data channels both bound to port {port}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// =======================================================================
// Sections
// =======================================================================

/// Which channel carries registration samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DiscoveryChannelKind {
    /// UDP multicast: network-wide discovery
    #[default]
    UdpMulticast,
    /// Shared-memory broadcast bus: host-local, works without multicast
    /// routing (containers, lockdown networks)
    SharedMemory,
}

/// Registration control-plane settings.
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    /// Broadcast period
    pub refresh: Duration,
    /// Expiry timeout; must be > `refresh`
    pub timeout: Duration,
    /// Deliver our own broadcasts back to this process (self-subscription)
    pub loopback: bool,
    /// Transport for registration samples
    pub channel: DiscoveryChannelKind,
    /// Multicast group for the UDP discovery channel
    pub multicast_group: Ipv4Addr,
    /// UDP port for the discovery channel
    pub port: u16,
    /// Domain name scoping the shared-memory discovery bus
    pub domain: String,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            refresh: Duration::from_millis(DEFAULT_REGISTRATION_REFRESH_MS),
            timeout: Duration::from_millis(DEFAULT_REGISTRATION_TIMEOUT_MS),
            loopback: false,
            channel: DiscoveryChannelKind::default(),
            multicast_group: DEFAULT_MULTICAST_GROUP,
            port: DEFAULT_DISCOVERY_PORT,
            domain: "default".to_string(),
        }
    }
}

/// Shared-memory transport settings.
#[derive(Debug, Clone)]
pub struct ShmConfig {
    pub enable: bool,
    /// Number of ring slots per writer segment (>= 1)
    pub buffer_count: usize,
    /// Minimum slot payload size; segments grow beyond this on demand
    pub min_size: usize,
    /// Hand subscribers a pointer into the mapping instead of copying
    pub zero_copy: bool,
    /// How long a writer waits for slot acknowledgement before reusing the
    /// slot anyway. Zero disables acknowledge handshaking entirely.
    pub acknowledge_timeout_ms: u64,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            enable: true,
            buffer_count: DEFAULT_SHM_BUFFER_COUNT,
            min_size: DEFAULT_SHM_MIN_SIZE,
            zero_copy: false,
            acknowledge_timeout_ms: 0,
        }
    }
}

/// UDP multicast transport settings.
#[derive(Debug, Clone)]
pub struct UdpConfig {
    pub enable: bool,
    /// Multicast group for user data
    pub group: Ipv4Addr,
    /// UDP port for user data
    pub port: u16,
    /// Multicast TTL (1 = link-local)
    pub ttl: u32,
    /// Receive our own datagrams (required for same-host delivery)
    pub loopback: bool,
    /// SO_SNDBUF, bytes (0 = OS default)
    pub send_buffer: usize,
    /// SO_RCVBUF, bytes (0 = OS default)
    pub recv_buffer: usize,
    /// Fragmentation threshold
    pub max_datagram: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            enable: true,
            group: DEFAULT_MULTICAST_GROUP,
            port: DEFAULT_DATA_PORT,
            ttl: 2,
            loopback: true,
            send_buffer: 0,
            recv_buffer: 0,
            max_datagram: DEFAULT_MAX_DATAGRAM_BYTES,
        }
    }
}

/// TCP transport settings.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub enable: bool,
    /// Threads servicing socket reads/accepts
    pub reader_pool_size: usize,
    /// Threads servicing socket writes
    pub writer_pool_size: usize,
    /// Client-side reconnect budget before a session goes `Failed`
    pub max_reconnection_attempts: u32,
    /// Discard samples whose clock is below the last delivered one
    pub drop_out_of_order_messages: bool,
    /// Maximum accepted frame size
    pub max_frame_bytes: usize,
    /// Connect timeout for outbound sessions
    pub connect_timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            enable: true,
            reader_pool_size: 2,
            writer_pool_size: 2,
            max_reconnection_attempts: 5,
            drop_out_of_order_messages: true,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// Top-level configuration consumed by `MiddlewareContext::initialize`.
#[derive(Debug, Clone)]
pub struct Config {
    pub registration: RegistrationConfig,
    pub shm: ShmConfig,
    pub udp: UdpConfig,
    pub tcp: TcpConfig,
    /// Layer preference for same-host peers (first match wins, all
    /// listed layers are activated; dedup handles the overlap)
    pub priority_local: Vec<TransportLayer>,
    /// Layer preference for remote-host peers
    pub priority_remote: Vec<TransportLayer>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registration: RegistrationConfig::default(),
            shm: ShmConfig::default(),
            udp: UdpConfig::default(),
            tcp: TcpConfig::default(),
            priority_local: vec![TransportLayer::Shm, TransportLayer::Udp, TransportLayer::Tcp],
            priority_remote: vec![TransportLayer::Udp, TransportLayer::Tcp],
        }
    }
}

impl Config {
    /// Check all cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registration.refresh.is_zero() {
            return Err(ConfigError::ZeroRefreshInterval);
        }
        if self.registration.timeout <= self.registration.refresh {
            return Err(ConfigError::TimeoutNotAboveRefresh {
                refresh: self.registration.refresh,
                timeout: self.registration.timeout,
            });
        }
        if !self.registration.multicast_group.is_multicast() {
            return Err(ConfigError::NotMulticast(self.registration.multicast_group));
        }
        if !self.udp.group.is_multicast() {
            return Err(ConfigError::NotMulticast(self.udp.group));
        }
        if self.registration.channel == DiscoveryChannelKind::UdpMulticast
            && self.udp.enable
            && self.registration.port == self.udp.port
        {
            return Err(ConfigError::PortCollision(self.udp.port));
        }
        if self.shm.enable && self.shm.buffer_count == 0 {
            return Err(ConfigError::ZeroBufferCount);
        }
        if self.tcp.enable {
            if self.tcp.reader_pool_size == 0 {
                return Err(ConfigError::ZeroPoolSize { role: "reader" });
            }
            if self.tcp.writer_pool_size == 0 {
                return Err(ConfigError::ZeroPoolSize { role: "writer" });
            }
        }
        for layer in self.priority_local.iter().chain(&self.priority_remote) {
            let enabled = match layer {
                TransportLayer::Shm => self.shm.enable,
                TransportLayer::Udp => self.udp.enable,
                TransportLayer::Tcp => self.tcp.enable,
            };
            if !enabled {
                return Err(ConfigError::DisabledLayerInPriority(*layer));
            }
        }
        Ok(())
    }

    /// Layers to try for a peer on `same_host`.
    #[must_use]
    pub fn layer_priority(&self, same_host: bool) -> &[TransportLayer] {
        if same_host {
            &self.priority_local
        } else {
            &self.priority_remote
        }
    }
}
