// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Transport capability consumed by the engine.
//!
//! The engine never touches sockets: it hands fully-formed request
//! bodies (or frames) to a transport and receives LF-terminated lines
//! back through a [`RequestListener`]. Callbacks arrive on transport
//! tasks; the engine-side listener implementations hop onto the
//! session thread before touching any state. Any compliant transport
//! plugs in; default providers backed by reqwest and
//! tokio-tungstenite live in this module's submodules.

pub mod http;
pub mod ws;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Proxy;

/// Per-request transport knobs, snapshot from the connection options.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    pub extra_headers: Option<HashMap<String, String>>,
    pub proxy: Option<Proxy>,
    /// TCP connect budget; zero means provider default.
    pub connect_timeout: Duration,
    /// Silence budget while reading the response; zero disables.
    pub read_timeout: Duration,
}

/// One HTTP exchange: POST `body` to `url`, stream the response.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub url: String,
    pub body: String,
}

/// Receiver for one connection's lifecycle and lines.
///
/// `on_message` is invoked once per complete LF-terminated line, with
/// the terminator stripped. Exactly one of `on_closed` / `on_broken`
/// ends the exchange: closed for an orderly end, broken for anything
/// that smells of network failure.
pub trait RequestListener: Send + 'static {
    fn on_open(&mut self) {}
    fn on_message(&mut self, line: &str);
    fn on_closed(&mut self) {}
    fn on_broken(&mut self) {}
}

/// Cancels an in-flight exchange. Dropping the handle does not cancel.
#[derive(Clone)]
pub struct RequestHandle {
    cancel: CancellationToken,
}

impl RequestHandle {
    /// Wrap a cancellation token; transports cancel their read loop
    /// when the token fires.
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Stop the exchange. `force_connection_close` additionally tears
    /// down the underlying connection instead of letting it be reused.
    pub fn close(&self, _force_connection_close: bool) {
        self.cancel.cancel();
    }
}

/// Chunked request/response channel (HTTP).
pub trait HttpTransport: Send + Sync {
    fn send_request(
        &self,
        request: StreamRequest,
        listener: Box<dyn RequestListener>,
        options: &TransportOptions,
    ) -> RequestHandle;
}

/// Lifecycle of a WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    NotConnected,
    Connecting,
    Connected,
    Disconnected,
    Broken,
    UnexpectedError,
}

/// One open (or opening) WebSocket.
///
/// `send` may be called while still `Connecting`; frames are flushed
/// in order once the socket opens.
pub trait WsConnection: Send + Sync {
    fn send(&self, frame: String);
    fn state(&self) -> WsState;
    fn disconnect(&self);
}

/// Bidirectional frame stream (WebSocket).
pub trait WsTransport: Send + Sync {
    fn connect(
        &self,
        url: &str,
        listener: Box<dyn RequestListener>,
        options: &TransportOptions,
        timeout: Duration,
    ) -> Arc<dyn WsConnection>;
}

/// The pair of providers a client is wired with.
#[derive(Clone)]
pub struct TransportFactory {
    pub http: Arc<dyn HttpTransport>,
    pub ws: Arc<dyn WsTransport>,
}

impl TransportFactory {
    /// The reqwest + tungstenite production pair.
    pub fn standard() -> Self {
        Self { http: Arc::new(http::ReqwestTransport::new()), ws: Arc::new(ws::TungsteniteTransport) }
    }
}

/// Splits a byte stream into LF-terminated lines across chunk
/// boundaries. Carries the unterminated tail between feeds.
#[derive(Default)]
pub(crate) struct LineSplitter {
    tail: Vec<u8>,
}

impl LineSplitter {
    /// Feed a chunk; returns the complete lines it finished.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.tail.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.tail.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.tail.drain(..=pos).collect();
            line.pop(); // LF
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
