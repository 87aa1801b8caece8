// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket control-request manager.
//!
//! Each request is one text frame on the stream socket; no batching is
//! needed for correctness. Frames submitted while the socket is still
//! connecting are buffered in order by the connection itself, with the
//! bind-session frame always ahead of controls because the session
//! sends it first. Acknowledgements arrive interleaved with stream
//! data and are routed by request id.

use std::sync::Arc;

use tracing::debug;

use crate::request::Request;
use crate::transport::WsConnection;

use super::SendEnv;

pub(crate) struct WsRequestManager {
    conn: Arc<dyn WsConnection>,
}

impl WsRequestManager {
    pub fn new(conn: Arc<dyn WsConnection>) -> Self {
        Self { conn }
    }

    /// Frame the request and put it on the socket, registering the
    /// request id for acknowledgement routing.
    pub fn send(&self, request: &Request, tutor_id: u64, env: &mut SendEnv<'_>) {
        if let Some(req_id) = request.req_id() {
            env.inflight.insert(req_id, tutor_id);
        }
        let frame = env.codec.ws_frame(request);
        debug!(verb = request.name().as_str(), "control frame out");
        self.conn.send(frame);

        let handle = env.handle.clone();
        handle.post(move |engine| engine.arm_tutor(tutor_id));
    }

    pub fn connection(&self) -> &Arc<dyn WsConnection> {
        &self.conn
    }
}
