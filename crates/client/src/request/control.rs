// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control request builders: subscription management, bandwidth
//! constraints, rebind/destroy, reverse heartbeats.

use crate::config::Bandwidth;
use crate::subscription::{BufferSize, MaxFrequency, Mode, Snapshot};

use super::{next_unique, Request, RequestName};

/// `LS_op=add`: open a subscription.
#[allow(clippy::too_many_arguments)]
pub(crate) fn subscribe(
    sub_id: u64,
    mode: Mode,
    group: &str,
    schema: &str,
    data_adapter: Option<&str>,
    selector: Option<&str>,
    snapshot: &Snapshot,
    buffer_size: &BufferSize,
    frequency: &MaxFrequency,
) -> Request {
    let mut req = Request::new(RequestName::Control);
    req.param("LS_op", "add");
    req.param_u64("LS_subId", sub_id);
    req.param("LS_mode", mode.as_str());
    req.param("LS_group", group);
    req.param("LS_schema", schema);
    if let Some(adapter) = data_adapter {
        req.param("LS_data_adapter", adapter);
    }
    if let Some(selector) = selector {
        req.param("LS_selector", selector);
    }
    if let Some(value) = snapshot.to_wire() {
        req.param("LS_snapshot", value);
    }
    if let Some(value) = buffer_size.to_wire() {
        req.param("LS_requested_buffer_size", value);
    }
    if let Some(value) = frequency.to_wire() {
        req.param("LS_requested_max_frequency", value);
    }
    req
}

/// `LS_op=delete`: close a subscription.
pub(crate) fn unsubscribe(sub_id: u64) -> Request {
    let mut req = Request::new(RequestName::Control);
    req.param("LS_op", "delete");
    req.param_u64("LS_subId", sub_id);
    req
}

/// `LS_op=reconf`: change the max frequency of a live subscription.
pub(crate) fn change_frequency(sub_id: u64, frequency: &MaxFrequency) -> Request {
    let mut req = Request::new(RequestName::Control);
    req.param("LS_op", "reconf");
    req.param_u64("LS_subId", sub_id);
    req.param(
        "LS_requested_max_frequency",
        frequency.to_wire().unwrap_or_else(|| "unlimited".to_owned()),
    );
    req
}

/// `LS_op=constrain`: adjust the session bandwidth cap.
pub(crate) fn constrain(bandwidth: Bandwidth) -> Request {
    let mut req = Request::new(RequestName::Control);
    req.param("LS_op", "constrain");
    req.param("LS_requested_max_bandwidth", bandwidth.to_wire());
    req
}

/// `LS_op=force_rebind`: ask the server to close the stream so the
/// client can rebind on a different transport.
pub(crate) fn force_rebind(cause: Option<&str>) -> Request {
    let mut req = Request::new(RequestName::Control);
    req.param("LS_op", "force_rebind");
    if let Some(cause) = cause {
        req.param("LS_cause", cause);
    }
    req
}

/// `LS_op=destroy`: tear down a session, possibly on the server it
/// moved away from.
pub(crate) fn destroy(session_id: &str, cause: Option<&str>, server: Option<&str>) -> Request {
    let mut req = Request::new(RequestName::Control);
    req.param("LS_op", "destroy");
    req.param_bool("LS_close_socket", true);
    if let Some(cause) = cause {
        req.param("LS_cause", cause);
    }
    req.set_session(session_id);
    if let Some(server) = server {
        req.set_server(server);
    }
    req
}

/// Reverse heartbeat. `with_unique` marks HTTP heartbeats so
/// intermediaries cannot collapse identical bodies.
pub(crate) fn heartbeat(with_unique: bool) -> Request {
    let mut req = Request::new(RequestName::Heartbeat);
    if with_unique {
        req.param_u64("LS_unique", next_unique());
    }
    req
}
