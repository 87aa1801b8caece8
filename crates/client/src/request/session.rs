// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session request builders: create, bind, and recovery bind.

use crate::config::{Bandwidth, ConnectionDetails, ConnectionOptions};
use crate::constants::CLIENT_CID;

use super::{Request, RequestName};

/// `create_session`, opening a brand-new logical session.
///
/// `delay` widens the declared polling interval when the slowing
/// handler has measured client-side lag; `old_session` tells the server
/// which dead session this one replaces.
pub(crate) fn create_session(
    polling: bool,
    cause: Option<&str>,
    options: &ConnectionOptions,
    details: &ConnectionDetails,
    delay_ms: i64,
    old_session: Option<&str>,
) -> Request {
    let mut req = Request::new(RequestName::CreateSession);
    req.param_bool("LS_polling", polling);
    if let Some(cause) = cause {
        req.param("LS_cause", cause);
    }
    let polling_millis = if polling {
        (options.polling_interval().as_millis() as i64 + delay_ms).max(0)
    } else {
        0
    };
    req.param("LS_polling_millis", polling_millis.to_string());
    req.param_u64("LS_idle_millis", 0);
    req.param("LS_cid", CLIENT_CID);
    if let Bandwidth::Limited(_) = options.requested_max_bandwidth() {
        req.param("LS_requested_max_bandwidth", options.requested_max_bandwidth().to_wire());
    }
    if let Some(adapter_set) = details.adapter_set() {
        req.param("LS_adapter_set", adapter_set);
    }
    if let Some(user) = details.user() {
        req.param("LS_user", user);
    }
    if let Some(password) = details.password() {
        req.param("LS_password", password);
    }
    if let Some(old) = old_session {
        req.param("LS_old_session", old);
    }
    req
}

/// `bind_session`, attaching a new stream connection to an existing
/// logical session.
///
/// `max_reverse_heartbeat_ms` becomes `LS_inactivity_millis` and caps
/// the effective reverse-heartbeat interval for the bound stream;
/// `add_content_length` is set for HTTP streaming connections only.
pub(crate) fn bind_session(
    session_id: &str,
    polling: bool,
    cause: Option<&str>,
    options: &ConnectionOptions,
    delay_ms: i64,
    add_content_length: bool,
    max_reverse_heartbeat_ms: u64,
) -> Request {
    let mut req = Request::new(RequestName::BindSession);
    if polling {
        req.param_bool("LS_polling", true);
        let polling_millis = (options.polling_interval().as_millis() as i64 + delay_ms).max(0);
        req.param("LS_polling_millis", polling_millis.to_string());
        req.param_u64("LS_idle_millis", options.idle_timeout().as_millis() as u64);
    } else {
        let keepalive = options.keepalive_interval().as_millis() as u64;
        if keepalive > 0 {
            req.param_u64("LS_keepalive_millis", keepalive);
        }
        if max_reverse_heartbeat_ms > 0 {
            req.param_u64("LS_inactivity_millis", max_reverse_heartbeat_ms);
        }
        if add_content_length {
            req.param_u64("LS_content_length", options.content_length());
        }
    }
    if let Some(cause) = cause {
        req.param("LS_cause", cause);
    }
    req.set_session(session_id);
    req
}

/// Recovery bind: a polling `bind_session` carrying `LS_recovery_from`
/// so the server resumes the stream from the given progress counter.
pub(crate) fn recover_session(
    session_id: &str,
    cause: Option<&str>,
    options: &ConnectionOptions,
    delay_ms: i64,
    recovery_from: u64,
) -> Request {
    let mut req = Request::new(RequestName::BindSession);
    req.param_bool("LS_polling", true);
    if let Some(cause) = cause {
        req.param("LS_cause", cause);
    }
    req.param("LS_polling_millis", delay_ms.max(0).to_string());
    req.param_u64("LS_idle_millis", 0);
    if let Bandwidth::Limited(_) = options.requested_max_bandwidth() {
        req.param("LS_requested_max_bandwidth", options.requested_max_bandwidth().to_wire());
    }
    req.param_u64("LS_recovery_from", recovery_from);
    req.set_session(session_id);
    req
}
