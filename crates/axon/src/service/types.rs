// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Wire types for service request/response correlation.
//!
//! Requests and responses travel as TCP frames on the same executor as
//! topic data. A per-client `call_id` correlates them; per-call state is
//! independent of the session state underneath.

use crate::wire::{put_bytes, put_string, Cursor, WireError};

/// Outcome of one service call, as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CallStatus {
    /// Method executed, payload is its response
    Ok = 0,
    /// Server has no method of that name
    MethodNotFound = 1,
    /// Method callback failed; payload carries its error text
    ExecFailed = 2,
    /// Session dropped while the call was pending (client-side)
    ConnectionLost = 3,
}

impl CallStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::MethodNotFound),
            2 => Some(Self::ExecFailed),
            3 => Some(Self::ConnectionLost),
            _ => None,
        }
    }
}

/// A completed call: status plus response payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResponse {
    pub status: CallStatus,
    pub payload: Vec<u8>,
}

impl ServiceResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == CallStatus::Ok
    }
}

/// Request frame body: `call_id | method | payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub call_id: u64,
    pub method: String,
    pub payload: Vec<u8>,
}

impl CallRequest {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.method.len() + self.payload.len());
        out.extend_from_slice(&self.call_id.to_le_bytes());
        put_string(&mut out, &self.method);
        put_bytes(&mut out, &self.payload);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(buf);
        Ok(Self {
            call_id: cur.u64()?,
            method: cur.string()?,
            payload: cur.bytes()?,
        })
    }
}

/// Response frame body: `call_id | status | payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResponse {
    pub call_id: u64,
    pub status: CallStatus,
    pub payload: Vec<u8>,
}

impl CallResponse {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.payload.len());
        out.extend_from_slice(&self.call_id.to_le_bytes());
        out.push(self.status as u8);
        put_bytes(&mut out, &self.payload);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(buf);
        let call_id = cur.u64()?;
        let status =
            CallStatus::from_u8(cur.u8()?).ok_or(WireError::Malformed("unknown call status"))?;
        Ok(Self {
            call_id,
            status,
            payload: cur.bytes()?,
        })
    }
}
