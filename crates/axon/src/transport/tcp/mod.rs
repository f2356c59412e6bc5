// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! TCP transport (ordered, optional).
//!
//! Publishers and service servers listen; subscribers and service clients
//! connect. All sockets are serviced by one bounded [`TcpExecutor`] per
//! context. Sessions open with a version/identity [`Handshake`]; a
//! mismatch is terminal for that session.

mod executor;
mod frame_codec;
mod session;

pub use executor::{ConnId, EventSink, TcpEvent, TcpExecutor};
pub use frame_codec::{Frame, FrameCodec, FrameKind, FRAME_HEADER_SIZE};
pub use session::{Handshake, ReconnectPolicy, SessionRole, SessionState};
