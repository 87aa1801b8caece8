// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! TLCP line codec.
//!
//! Incoming traffic is a stream of LF-terminated ASCII lines; each
//! parses to one [`ProtocolEvent`]. Outgoing requests serialize either
//! to a WebSocket text frame (`<verb>\r\n<body>`) or to an HTTP body
//! of `\r\n`-joined request bodies. The codec also tracks the default
//! session id (set on CONOK) that lets requests omit `LS_session`, and
//! the server's request-length limit.

pub(crate) mod field;
pub(crate) mod heartbeat;

use std::fmt;

use crate::config::Bandwidth;
use crate::request::Request;

use field::FieldValue;

/// Failure to understand a server line. Fails the stream session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParseError {
    pub line: String,
    pub reason: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unparsable line {:?}: {}", self.line, self.reason)
    }
}

/// Outcome token of a message notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MsgOutcome {
    Processed,
    Deny { code: i32, message: String },
    Discarded,
    Error { code: i32, message: String },
}

/// A server line, decoded.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ProtocolEvent {
    Conok {
        session_id: String,
        keepalive_ms: u64,
        request_limit: u64,
        control_link: Option<String>,
    },
    Conerr { code: i32, message: String },
    ServerName(String),
    ClientIp(String),
    Sync { seconds: u64 },
    Probe,
    Loop { pause_ms: u64 },
    End { code: i32, message: String },
    Update { sub_id: u64, item: usize, fields: Vec<FieldValue> },
    EndOfSnapshot { sub_id: u64, item: usize },
    ClearSnapshot { sub_id: u64, item: usize },
    Overflow { sub_id: u64, item: usize, lost: u32 },
    Subok { sub_id: u64, num_items: usize, num_fields: usize },
    Subcmd { sub_id: u64, num_items: usize, num_fields: usize, key_pos: usize, cmd_pos: usize },
    Unsub { sub_id: u64 },
    /// Session bandwidth confirmation (`CONS`).
    Constrain { bandwidth: Option<Bandwidth> },
    /// Per-subscription real frequency (`CONF`).
    Configuration { sub_id: u64, frequency: Option<f64> },
    Reqok { req_id: Option<u64> },
    Reqerr { req_id: u64, code: i32, message: String },
    Error { code: i32, message: String },
    Msg { sequence: String, prog: u64, outcome: MsgOutcome },
    Prog { prog: u64 },
    Noop,
}

impl ProtocolEvent {
    /// Data notifications are the lines counted by the recovery
    /// progress counter; everything else is bookkeeping.
    pub fn is_data_notification(&self) -> bool {
        matches!(
            self,
            Self::Update { .. }
                | Self::EndOfSnapshot { .. }
                | Self::ClearSnapshot { .. }
                | Self::Overflow { .. }
                | Self::Subok { .. }
                | Self::Subcmd { .. }
                | Self::Unsub { .. }
                | Self::Configuration { .. }
                | Self::Msg { .. }
        )
    }
}

/// Comma cursor over one line; the final field may swallow the rest.
struct Cursor<'a> {
    line: &'a str,
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(line: &'a str, rest: &'a str) -> Self {
        Self { line, rest }
    }

    fn err(&self, reason: impl Into<String>) -> ParseError {
        ParseError { line: self.line.to_owned(), reason: reason.into() }
    }

    fn next(&mut self) -> Result<&'a str, ParseError> {
        if self.rest.is_empty() {
            return Err(self.err("missing field"));
        }
        match self.rest.split_once(',') {
            Some((head, tail)) => {
                self.rest = tail;
                Ok(head)
            }
            None => {
                let head = self.rest;
                self.rest = "";
                Ok(head)
            }
        }
    }

    fn next_u64(&mut self) -> Result<u64, ParseError> {
        let tok = self.next()?;
        tok.parse().map_err(|_| self.err(format!("bad number: {tok:?}")))
    }

    fn next_usize(&mut self) -> Result<usize, ParseError> {
        let tok = self.next()?;
        tok.parse().map_err(|_| self.err(format!("bad number: {tok:?}")))
    }

    fn next_i32(&mut self) -> Result<i32, ParseError> {
        let tok = self.next()?;
        tok.parse().map_err(|_| self.err(format!("bad number: {tok:?}")))
    }

    /// Everything left, commas included.
    fn take_rest(&mut self) -> &'a str {
        std::mem::take(&mut self.rest)
    }
}

/// Strip one layer of double quotes, the form some servers use for
/// human-readable error text.
fn unquote(text: &str) -> &str {
    text.strip_prefix('"').and_then(|t| t.strip_suffix('"')).unwrap_or(text)
}

/// Parse one LF-terminated line (terminator already removed).
pub(crate) fn parse_line(line: &str) -> Result<ProtocolEvent, ParseError> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let (verb, rest) = line.split_once(',').unwrap_or((line, ""));
    let mut cur = Cursor::new(line, rest);
    match verb {
        "CONOK" => {
            let session_id = cur.next()?.to_owned();
            let keepalive_ms = cur.next_u64()?;
            let request_limit = cur.next_u64()?;
            let link = cur.next()?;
            let control_link = if link == "*" { None } else { Some(link.to_owned()) };
            Ok(ProtocolEvent::Conok { session_id, keepalive_ms, request_limit, control_link })
        }
        "CONERR" => {
            let code = cur.next_i32()?;
            let message = unquote(cur.take_rest()).to_owned();
            Ok(ProtocolEvent::Conerr { code, message })
        }
        "SERVNAME" => Ok(ProtocolEvent::ServerName(cur.take_rest().to_owned())),
        "CLIENTIP" => Ok(ProtocolEvent::ClientIp(cur.take_rest().to_owned())),
        "SYNC" => Ok(ProtocolEvent::Sync { seconds: cur.next_u64()? }),
        "PROBE" => Ok(ProtocolEvent::Probe),
        "LOOP" => Ok(ProtocolEvent::Loop { pause_ms: cur.next_u64()? }),
        "END" => {
            let code = cur.next_i32()?;
            let message = unquote(cur.take_rest()).to_owned();
            Ok(ProtocolEvent::End { code, message })
        }
        "U" => {
            let sub_id = cur.next_u64()?;
            let item = cur.next_usize()?;
            let section = cur.take_rest();
            let fields = field::decode_fields(section)
                .map_err(|e| ParseError { line: line.to_owned(), reason: e.to_string() })?;
            Ok(ProtocolEvent::Update { sub_id, item, fields })
        }
        "EOS" => Ok(ProtocolEvent::EndOfSnapshot { sub_id: cur.next_u64()?, item: cur.next_usize()? }),
        "CS" => Ok(ProtocolEvent::ClearSnapshot { sub_id: cur.next_u64()?, item: cur.next_usize()? }),
        "OV" => Ok(ProtocolEvent::Overflow {
            sub_id: cur.next_u64()?,
            item: cur.next_usize()?,
            lost: cur.next_u64()? as u32,
        }),
        "SUBOK" => Ok(ProtocolEvent::Subok {
            sub_id: cur.next_u64()?,
            num_items: cur.next_usize()?,
            num_fields: cur.next_usize()?,
        }),
        "SUBCMD" => Ok(ProtocolEvent::Subcmd {
            sub_id: cur.next_u64()?,
            num_items: cur.next_usize()?,
            num_fields: cur.next_usize()?,
            key_pos: cur.next_usize()?,
            cmd_pos: cur.next_usize()?,
        }),
        "UNSUB" => Ok(ProtocolEvent::Unsub { sub_id: cur.next_u64()? }),
        "CONS" => {
            let tok = cur.next()?;
            let bandwidth = match tok {
                "unlimited" => Some(Bandwidth::Unlimited),
                "unmanaged" => None,
                n => Some(
                    n.parse::<f64>()
                        .map(Bandwidth::Limited)
                        .map_err(|_| cur.err(format!("bad bandwidth: {n:?}")))?,
                ),
            };
            Ok(ProtocolEvent::Constrain { bandwidth })
        }
        "CONF" => {
            let sub_id = cur.next_u64()?;
            let tok = cur.next()?;
            let frequency = match tok {
                "unlimited" => None,
                n => Some(n.parse::<f64>().map_err(|_| cur.err(format!("bad frequency: {n:?}")))?),
            };
            // A trailing filtered/unfiltered marker may follow; it is
            // implied by the subscription mode and ignored here.
            Ok(ProtocolEvent::Configuration { sub_id, frequency })
        }
        "REQOK" => {
            let req_id = if cur.rest.is_empty() { None } else { Some(cur.next_u64()?) };
            Ok(ProtocolEvent::Reqok { req_id })
        }
        "REQERR" => {
            let req_id = cur.next_u64()?;
            let code = cur.next_i32()?;
            let message = unquote(cur.take_rest()).to_owned();
            Ok(ProtocolEvent::Reqerr { req_id, code, message })
        }
        "ERROR" => {
            let code = cur.next_i32()?;
            let message = unquote(cur.take_rest()).to_owned();
            Ok(ProtocolEvent::Error { code, message })
        }
        "MSG" => {
            let sequence = cur.next()?.to_owned();
            let prog = cur.next_u64()?;
            let outcome_tok = cur.next()?;
            let outcome = parse_outcome(outcome_tok, &mut cur)?;
            Ok(ProtocolEvent::Msg { sequence, prog, outcome })
        }
        // Abbreviated outcome-as-verb forms.
        "MSGOK" | "MSGDENY" | "MSGDISCARD" | "MSGERR" => {
            let sequence = cur.next()?.to_owned();
            let prog = cur.next_u64()?;
            let outcome = parse_outcome(verb, &mut cur)?;
            Ok(ProtocolEvent::Msg { sequence, prog, outcome })
        }
        "PROG" => Ok(ProtocolEvent::Prog { prog: cur.next_u64()? }),
        "NOOP" => Ok(ProtocolEvent::Noop),
        other => Err(ParseError {
            line: line.to_owned(),
            reason: format!("unknown verb: {other:?}"),
        }),
    }
}

fn parse_outcome(token: &str, cur: &mut Cursor<'_>) -> Result<MsgOutcome, ParseError> {
    match token {
        "MSGOK" => Ok(MsgOutcome::Processed),
        "MSGDISCARD" => Ok(MsgOutcome::Discarded),
        "MSGDENY" => {
            let code = cur.next_i32()?;
            let message = unquote(cur.take_rest()).to_owned();
            Ok(MsgOutcome::Deny { code, message })
        }
        "MSGERR" => {
            let code = cur.next_i32()?;
            let message = unquote(cur.take_rest()).to_owned();
            Ok(MsgOutcome::Error { code, message })
        }
        other => Err(cur.err(format!("unknown message outcome: {other:?}"))),
    }
}

/// Outgoing-side state: the default session and the server-imposed
/// request-length limit, both learned from CONOK.
#[derive(Default)]
pub(crate) struct Codec {
    default_session: Option<String>,
    request_limit: Option<usize>,
}

impl Codec {
    pub fn set_default_session(&mut self, session_id: Option<String>) {
        self.default_session = session_id;
    }

    pub fn default_session(&self) -> Option<&str> {
        self.default_session.as_deref()
    }

    /// 0 from the server means no limit.
    pub fn set_request_limit(&mut self, limit: u64) {
        self.request_limit = if limit == 0 { None } else { Some(limit as usize) };
    }

    pub fn request_limit(&self) -> Option<usize> {
        self.request_limit
    }

    /// One request per WebSocket text frame.
    ///
    /// Control frames ride a socket the session was bound on, so a
    /// matching `LS_session` is elided; session requests are the ones
    /// doing the binding and always spell it out.
    pub fn ws_frame(&self, request: &Request) -> String {
        let default = if request.is_session_request() { None } else { self.default_session() };
        format!("{}\r\n{}", request.name().as_str(), request.query_string(default))
    }

    /// Batched HTTP body: one request body per `\r\n`-separated line.
    /// HTTP requests share no connection-scoped session, so every body
    /// carries its `LS_session`.
    pub fn batch_body<'a>(&self, requests: impl IntoIterator<Item = &'a Request>) -> String {
        let mut out = String::new();
        for request in requests {
            if !out.is_empty() {
                out.push_str("\r\n");
            }
            out.push_str(&request.query_string(None));
        }
        out
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
