// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! TCP session state machine and handshake payload.
//!
//! ```text
//!   +--------------+  connect/accept  +-----------+
//!   | NotConnected | ---------------> | Handshake |
//!   +--------------+                  +-----+-----+
//!        ^   (backoff retry)                | version+identity ok
//!        |                                  v
//!        |   unexpected close        +-----------+
//!        +------------------------   | Connected |
//!                                    +-----+-----+
//!                                          | version mismatch /
//!                                          | retries exhausted
//!                                          v
//!                                    +-----------+
//!                                    |  Failed   |  (terminal)
//!                                    +-----------+
//! ```
//!
//! The handshake carries protocol version and the initiator's [`EntityId`]
//! plus descriptor; the accepting side verifies the version and topic and
//! answers with an ack. A mismatch moves the session straight to `Failed`
//! with no retry.

use crate::types::{DataTypeDescriptor, EntityId};
use crate::wire::{put_bytes, put_string, Cursor, WireError, WIRE_VERSION};
use std::fmt;
use std::time::{Duration, Instant};

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    /// No transport connection (initial, or lost and awaiting retry)
    #[default]
    NotConnected,
    /// TCP established, handshake in flight
    Handshake,
    /// Handshake verified; data may flow
    Connected,
    /// Terminal: version mismatch or reconnect budget exhausted
    Failed,
}

impl SessionState {
    pub fn is_operational(self) -> bool {
        self == SessionState::Connected
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Failed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotConnected => "NotConnected",
            Self::Handshake => "Handshake",
            Self::Connected => "Connected",
            Self::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

/// Role announced in a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionRole {
    /// Subscriber pulling topic data from a publisher
    Subscriber = 1,
    /// Service client calling a server
    ServiceClient = 2,
}

impl SessionRole {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Subscriber),
            2 => Some(Self::ServiceClient),
            _ => None,
        }
    }
}

/// Handshake frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: u8,
    pub role: SessionRole,
    pub entity_id: EntityId,
    /// Topic (subscriber) or service name (client)
    pub descriptor: DataTypeDescriptor,
}

impl Handshake {
    pub fn new(role: SessionRole, entity_id: EntityId, descriptor: DataTypeDescriptor) -> Self {
        Self {
            version: WIRE_VERSION,
            role,
            entity_id,
            descriptor,
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.push(self.version);
        out.push(self.role as u8);
        put_string(&mut out, &self.entity_id.host_name);
        out.extend_from_slice(&self.entity_id.process_id.to_le_bytes());
        put_string(&mut out, &self.entity_id.entity);
        out.extend_from_slice(&self.entity_id.instance_id.to_le_bytes());
        put_string(&mut out, &self.descriptor.encoding);
        put_string(&mut out, &self.descriptor.type_name);
        put_bytes(&mut out, &self.descriptor.schema);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(buf);
        let version = cur.u8()?;
        let role =
            SessionRole::from_u8(cur.u8()?).ok_or(WireError::Malformed("unknown session role"))?;
        let host_name = cur.string()?;
        let process_id = cur.u32()?;
        let entity = cur.string()?;
        let instance_id = cur.u64()?;
        let encoding = cur.string()?;
        let type_name = cur.string()?;
        let schema = cur.bytes()?;
        Ok(Self {
            version,
            role,
            entity_id: EntityId {
                host_name,
                process_id,
                entity,
                instance_id,
            },
            descriptor: DataTypeDescriptor {
                encoding,
                type_name,
                schema,
            },
        })
    }
}

/// Client-side reconnect bookkeeping with linear backoff.
#[derive(Debug)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    attempts: u32,
    backoff_unit: Duration,
    next_attempt: Instant,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, backoff_unit: Duration) -> Self {
        Self {
            max_attempts,
            attempts: 0,
            backoff_unit,
            next_attempt: Instant::now(),
        }
    }

    /// Whether a connect attempt is due now.
    #[must_use]
    pub fn due(&self) -> bool {
        self.attempts < self.max_attempts && Instant::now() >= self.next_attempt
    }

    /// Record a failed attempt; returns `false` once the budget is spent
    /// (the session must transition to `Failed`).
    pub fn register_failure(&mut self) -> bool {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            return false;
        }
        self.next_attempt = Instant::now() + self.backoff_unit * self.attempts;
        true
    }

    /// Successful connect: the budget refills.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_attempt = Instant::now();
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake() -> Handshake {
        Handshake::new(
            SessionRole::Subscriber,
            EntityId {
                host_name: "hostB".into(),
                process_id: 777,
                entity: "sensors/temp".into(),
                instance_id: 0x0102_0304_0506_0708,
            },
            DataTypeDescriptor {
                encoding: "proto".into(),
                type_name: "pkg.Temperature".into(),
                schema: Vec::new(),
            },
        )
    }

    #[test]
    fn test_handshake_roundtrip() {
        let hs = handshake();
        let decoded = Handshake::decode(&hs.encode()).expect("decode");
        assert_eq!(decoded, hs);
    }

    #[test]
    fn test_handshake_bad_role_rejected() {
        let mut encoded = handshake().encode();
        encoded[1] = 0xEE;
        assert!(Handshake::decode(&encoded).is_err());
    }

    #[test]
    fn test_state_predicates() {
        assert!(SessionState::Connected.is_operational());
        assert!(!SessionState::Handshake.is_operational());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::NotConnected.is_terminal());
    }

    #[test]
    fn test_reconnect_budget() {
        let mut policy = ReconnectPolicy::new(3, Duration::from_millis(0));
        assert!(policy.due());

        assert!(policy.register_failure()); // 1
        assert!(policy.register_failure()); // 2
        assert!(!policy.register_failure()); // 3 -> exhausted
        assert!(!policy.due());
    }

    #[test]
    fn test_reconnect_reset_refills() {
        let mut policy = ReconnectPolicy::new(2, Duration::from_millis(0));
        assert!(policy.register_failure());
        policy.reset();
        assert_eq!(policy.attempts(), 0);
        assert!(policy.due());
    }

    #[test]
    fn test_backoff_delays_next_attempt() {
        let mut policy = ReconnectPolicy::new(5, Duration::from_millis(200));
        assert!(policy.register_failure());
        // Immediately after a failure the next attempt is not due yet.
        assert!(!policy.due());
    }
}
