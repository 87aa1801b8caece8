// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! User-message request builder.

use crate::constants::UNORDERED_MESSAGES;

use super::{Request, RequestName};

/// `msg`: submit one user message.
///
/// Ordered sequences carry `LS_sequence` and a contiguous
/// `LS_msg_prog`; the reserved unordered sequence omits both unless an
/// outcome or ack is needed to route server responses back. A message
/// without a listener sets `LS_outcome=false` so the server skips the
/// outcome notification.
pub(crate) fn message(
    text: &str,
    sequence: &str,
    prog: u64,
    max_wait_ms: i64,
    has_listener: bool,
    needs_ack: bool,
) -> Request {
    let mut req = Request::new(RequestName::Msg);
    req.param("LS_message", text);
    let unordered = sequence == UNORDERED_MESSAGES;
    let track_outcome = has_listener;
    if !unordered || track_outcome {
        req.param("LS_sequence", sequence);
        req.param_u64("LS_msg_prog", prog);
    }
    if max_wait_ms >= 0 {
        req.param("LS_max_wait", max_wait_ms.to_string());
    }
    if !track_outcome {
        req.param_bool("LS_outcome", false);
    }
    if !needs_ack {
        // Over WS the frame itself is the ack barrier; fire-and-forget
        // messages tell the server not to send one.
        req.param_bool("LS_ack", false);
    }
    req
}
