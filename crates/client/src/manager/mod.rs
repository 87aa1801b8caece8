// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Transport-aware control-request dispatch.
//!
//! Over WebSocket every request rides its own text frame on the stream
//! socket; over HTTP requests are batched into bodies with one control
//! connection in flight at a time. Both paths register the request id
//! against its tutor so REQOK/REQERR — wherever they arrive — settle
//! the right retransmission state.

pub(crate) mod http;
pub(crate) mod ws;

use std::collections::HashMap;

use crate::protocol::Codec;
use crate::session::EngineHandle;
use crate::transport::TransportOptions;

/// What a control request is, for lane selection and replacement keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ControlKind {
    Message,
    Heartbeat,
    Subscribe(u64),
    Unsubscribe(u64),
    ChangeFrequency(u64),
    Constrain,
    ForceRebind,
    Destroy(String),
}

/// Lifecycle of the HTTP control connection owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ManagerPhase {
    /// No batch in flight; the next add dequeues synchronously.
    Idle,
    /// A batch is on the wire.
    Waiting,
    /// Close requested; finishing the in-flight batch first.
    Ending,
    /// Closed for good.
    End,
}

/// Borrowed engine context a manager needs to put bytes on the wire.
pub(crate) struct SendEnv<'a> {
    pub codec: &'a Codec,
    pub handle: &'a EngineHandle,
    /// `req_id → tutor_id` for every request awaiting REQOK/REQERR.
    pub inflight: &'a mut HashMap<u64, u64>,
    /// Control endpoint base for the current session, e.g.
    /// `http://push.example/lightstreamer`.
    pub control_base: String,
    pub transport_options: TransportOptions,
}
