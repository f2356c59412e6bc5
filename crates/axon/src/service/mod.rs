// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Service RPC on the registration + TCP substrate.
//!
//! Services are just another entity kind: servers advertise their listen
//! port through registration samples, clients resolve instances from the
//! registry and keep one session per instance. Calls are correlated by a
//! per-client id, so per-call state survives session churn.

pub mod client;
pub mod server;
pub mod types;

pub use client::{CallCallback, ServiceClient, ServiceClientCore};
pub use server::{MethodHandler, ServiceServer, ServiceServerCore};
pub use types::{CallRequest, CallResponse, CallStatus, ServiceResponse};
