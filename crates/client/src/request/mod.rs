// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed control/session requests and their TLCP query-string form.
//!
//! A request is an ordered list of `LS_*` parameters. Values are
//! percent-encoded over the minimal TLCP set (CR, LF, `%`, `+`, `&`,
//! `=`) with uppercase two-digit escapes; everything else goes through
//! verbatim, spaces included.

use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) mod control;
pub(crate) mod message;
pub(crate) mod session;

/// Process-wide request-id source. Ids are unique across clients.
pub(crate) fn next_request_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Process-wide source for `LS_unique` markers.
pub(crate) fn next_unique() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

fn is_special(b: u8) -> bool {
    matches!(b, b'\r' | b'\n' | b'%' | b'+' | b'&' | b'=')
}

/// Percent-encode a parameter value over the minimal TLCP set.
pub(crate) fn percent_encode(value: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    if !value.bytes().any(is_special) {
        return value.to_owned();
    }
    let mut out = Vec::with_capacity(value.len() + 6);
    for b in value.bytes() {
        if is_special(b) {
            out.push(b'%');
            out.push(HEX[(b >> 4) as usize]);
            out.push(HEX[(b & 0x0F) as usize]);
        } else {
            out.push(b);
        }
    }
    // Only ASCII was escaped, so the byte stream is still valid UTF-8.
    String::from_utf8(out).unwrap_or_default()
}

/// The TLCP verbs this client issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestName {
    CreateSession,
    BindSession,
    Control,
    Msg,
    Heartbeat,
}

impl RequestName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateSession => "create_session",
            Self::BindSession => "bind_session",
            Self::Control => "control",
            Self::Msg => "msg",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// One outgoing request: verb plus ordered parameters.
///
/// `LS_reqId` (control/message requests only — session requests carry
/// none) is kept separate so it always serializes first; `LS_session`
/// is appended last and omitted when it matches the codec's default
/// session.
#[derive(Debug, Clone)]
pub(crate) struct Request {
    name: RequestName,
    req_id: Option<u64>,
    params: Vec<(&'static str, String)>,
    session_id: Option<String>,
    /// Target server override; set on destroys for a moved session.
    server: Option<String>,
}

impl Request {
    pub fn new(name: RequestName) -> Self {
        Self { name, req_id: None, params: Vec::new(), session_id: None, server: None }
    }

    pub fn name(&self) -> RequestName {
        self.name
    }

    /// Session requests are create/bind; everything else is a control
    /// request and must carry `LS_reqId`.
    pub fn is_session_request(&self) -> bool {
        matches!(self.name, RequestName::CreateSession | RequestName::BindSession)
    }

    pub fn param(&mut self, key: &'static str, value: impl Into<String>) -> &mut Self {
        self.params.push((key, value.into()));
        self
    }

    pub fn param_u64(&mut self, key: &'static str, value: u64) -> &mut Self {
        self.param(key, value.to_string())
    }

    pub fn param_bool(&mut self, key: &'static str, value: bool) -> &mut Self {
        self.param(key, if value { "true" } else { "false" })
    }

    pub fn set_req_id(&mut self, id: u64) {
        self.req_id = Some(id);
    }

    pub fn req_id(&self) -> Option<u64> {
        self.req_id
    }

    pub fn set_session(&mut self, session_id: impl Into<String>) {
        self.session_id = Some(session_id.into());
    }

    pub fn session(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn set_server(&mut self, server: impl Into<String>) {
        self.server = Some(server.into());
    }

    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    /// Serialize to the URL-form body. `default_session` suppresses a
    /// matching `LS_session` parameter.
    pub fn query_string(&self, default_session: Option<&str>) -> String {
        let mut out = String::new();
        if let Some(id) = self.req_id {
            out.push_str("LS_reqId=");
            out.push_str(&id.to_string());
        }
        for (key, value) in &self.params {
            if !out.is_empty() {
                out.push('&');
            }
            out.push_str(key);
            out.push('=');
            out.push_str(&percent_encode(value));
        }
        if let Some(ref sid) = self.session_id {
            if default_session != Some(sid.as_str()) {
                if !out.is_empty() {
                    out.push('&');
                }
                out.push_str("LS_session=");
                out.push_str(&percent_encode(sid));
            }
        }
        if out.is_empty() {
            // A parameterless body still needs a line for the server
            // to consume.
            out.push_str("\r\n");
        }
        out
    }

    /// Upper-bound serialized length, used for batch-size accounting.
    pub fn length_estimate(&self) -> usize {
        self.query_string(None).len()
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
