// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end engine specs.
//!
//! Provides a scripted in-memory server implementing both transport
//! capabilities: tests inspect the frames and bodies the client sent
//! and push protocol lines back, with no sockets involved.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use tlcp_client::transport::{
    HttpTransport, RequestHandle, RequestListener, StreamRequest, TransportFactory,
    TransportOptions, WsConnection, WsState, WsTransport,
};
use tlcp_client::{ClientListener, ClientMessageListener, ItemUpdate, SubscriptionListener};

static TRACING_INIT: Once = Once::new();

/// Install a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// How long spec polls wait before declaring a condition dead.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `probe` every few milliseconds until it yields `Some`.
pub async fn wait_for<T>(
    what: &str,
    mut probe: impl FnMut() -> Option<T>,
) -> anyhow::Result<T> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        if let Some(value) = probe() {
            return Ok(value);
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// -- Fake WebSocket ----------------------------------------------------------

/// One scripted WebSocket connection.
pub struct FakeWsConn {
    frames: Mutex<Vec<String>>,
    listener: Mutex<Option<Box<dyn RequestListener>>>,
    state: Mutex<WsState>,
}

impl FakeWsConn {
    fn new(listener: Box<dyn RequestListener>) -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
            listener: Mutex::new(Some(listener)),
            state: Mutex::new(WsState::Connected),
        }
    }

    /// Frames the client has written so far.
    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().clone()
    }

    /// Wait until a frame satisfying `pred` was written.
    pub async fn wait_frame(&self, what: &str, pred: impl Fn(&str) -> bool) -> anyhow::Result<String> {
        wait_for(what, || self.frames.lock().iter().find(|f| pred(f)).cloned()).await
    }

    /// Push one protocol line to the client.
    pub fn push(&self, line: &str) {
        if let Some(listener) = self.listener.lock().as_mut() {
            listener.on_message(line);
        }
    }

    /// Simulate a network failure.
    pub fn break_conn(&self) {
        *self.state.lock() = WsState::Broken;
        if let Some(listener) = self.listener.lock().as_mut() {
            listener.on_broken();
        }
    }

    /// Simulate an orderly server close.
    pub fn close_conn(&self) {
        *self.state.lock() = WsState::Disconnected;
        if let Some(listener) = self.listener.lock().as_mut() {
            listener.on_closed();
        }
    }
}

impl WsConnection for FakeWsConn {
    fn send(&self, frame: String) {
        self.frames.lock().push(frame);
    }

    fn state(&self) -> WsState {
        *self.state.lock()
    }

    fn disconnect(&self) {
        *self.state.lock() = WsState::Disconnected;
    }
}

// -- Fake HTTP ---------------------------------------------------------------

/// One scripted HTTP exchange (request sent, response streamed back).
pub struct FakeHttpExchange {
    pub url: String,
    pub body: String,
    listener: Mutex<Option<Box<dyn RequestListener>>>,
    opened: AtomicBool,
    pub cancelled: CancellationToken,
}

impl FakeHttpExchange {
    /// Push one response line, opening the exchange if needed.
    pub fn push(&self, line: &str) {
        let mut listener = self.listener.lock();
        if let Some(listener) = listener.as_mut() {
            if !self.opened.swap(true, Ordering::SeqCst) {
                listener.on_open();
            }
            listener.on_message(line);
        }
    }

    /// Push a full scripted response and close.
    pub fn respond(&self, lines: &[&str]) {
        for line in lines {
            self.push(line);
        }
        self.finish();
    }

    /// Orderly end of the response body.
    pub fn finish(&self) {
        if let Some(mut listener) = self.listener.lock().take() {
            listener.on_closed();
        }
    }

    /// Network failure mid-response.
    pub fn fail(&self) {
        if let Some(mut listener) = self.listener.lock().take() {
            listener.on_broken();
        }
    }

    pub fn endpoint_is(&self, endpoint: &str) -> bool {
        self.url.contains(endpoint)
    }
}

// -- The scripted server -----------------------------------------------------

#[derive(Default)]
struct FakeState {
    ws: Vec<Arc<FakeWsConn>>,
    http: Vec<Arc<FakeHttpExchange>>,
}

/// In-memory server shared by both fake transports.
#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<FakeState>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> TransportFactory {
        TransportFactory {
            http: Arc::new(FakeHttp { server: self.clone() }),
            ws: Arc::new(FakeWs { server: self.clone() }),
        }
    }

    pub fn ws_count(&self) -> usize {
        self.state.lock().ws.len()
    }

    /// Wait for the `index`-th WebSocket connection (0-based).
    pub async fn wait_ws(&self, index: usize) -> anyhow::Result<Arc<FakeWsConn>> {
        wait_for("ws connection", || self.state.lock().ws.get(index).cloned()).await
    }

    /// Wait for an HTTP exchange whose URL or body satisfies `pred`,
    /// starting the scan at `from` (use the count before the action).
    pub async fn wait_http(
        &self,
        what: &str,
        from: usize,
        pred: impl Fn(&FakeHttpExchange) -> bool,
    ) -> anyhow::Result<Arc<FakeHttpExchange>> {
        wait_for(what, || {
            self.state.lock().http.iter().skip(from).find(|e| pred(e)).cloned()
        })
        .await
    }

    pub fn http_count(&self) -> usize {
        self.state.lock().http.len()
    }
}

struct FakeWs {
    server: FakeServer,
}

impl WsTransport for FakeWs {
    fn connect(
        &self,
        _url: &str,
        mut listener: Box<dyn RequestListener>,
        _options: &TransportOptions,
        _timeout: Duration,
    ) -> Arc<dyn WsConnection> {
        listener.on_open();
        let conn = Arc::new(FakeWsConn::new(listener));
        self.server.state.lock().ws.push(Arc::clone(&conn));
        conn
    }
}

struct FakeHttp {
    server: FakeServer,
}

impl HttpTransport for FakeHttp {
    fn send_request(
        &self,
        request: StreamRequest,
        listener: Box<dyn RequestListener>,
        _options: &TransportOptions,
    ) -> RequestHandle {
        let cancelled = CancellationToken::new();
        let exchange = Arc::new(FakeHttpExchange {
            url: request.url,
            body: request.body,
            listener: Mutex::new(Some(listener)),
            opened: AtomicBool::new(false),
            cancelled: cancelled.clone(),
        });
        self.server.state.lock().http.push(exchange);
        RequestHandle::new(cancelled)
    }
}

// -- Recording listeners -----------------------------------------------------

/// Client listener recording status changes, property changes, and
/// server errors.
pub struct StatusRecorder {
    pub statuses: Arc<Mutex<Vec<String>>>,
    pub properties: Arc<Mutex<Vec<String>>>,
    pub errors: Arc<Mutex<Vec<(i32, String)>>>,
}

impl StatusRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            statuses: Arc::new(Mutex::new(Vec::new())),
            properties: Arc::new(Mutex::new(Vec::new())),
            errors: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn saw_status(&self, status: &str) -> bool {
        self.statuses.lock().iter().any(|s| s == status)
    }

    pub fn saw_property(&self, property: &str) -> bool {
        self.properties.lock().iter().any(|p| p == property)
    }
}

impl ClientListener for StatusRecorder {
    fn on_status_change(&self, status: &str) {
        self.statuses.lock().push(status.to_owned());
    }
    fn on_property_change(&self, property: &str) {
        self.properties.lock().push(property.to_owned());
    }
    fn on_server_error(&self, code: i32, message: &str) {
        self.errors.lock().push((code, message.to_owned()));
    }
}

/// Subscription listener recording a compact event trace.
pub struct SubRecorder {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl SubRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { events: Arc::new(Mutex::new(Vec::new())) })
    }

    pub fn trace(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl SubscriptionListener for SubRecorder {
    fn on_subscription(&self) {
        self.events.lock().push("subscribed".to_owned());
    }
    fn on_unsubscription(&self) {
        self.events.lock().push("unsubscribed".to_owned());
    }
    fn on_subscription_error(&self, code: i32, message: &str) {
        self.events.lock().push(format!("error:{code}:{message}"));
    }
    fn on_item_update(&self, update: &ItemUpdate) {
        let values: Vec<String> = (1..=update.num_fields())
            .map(|pos| update.value(pos).unwrap_or("#").to_owned())
            .collect();
        let changed: Vec<String> =
            update.changed_fields().map(|(pos, _, _)| pos.to_string()).collect();
        self.events.lock().push(format!(
            "update:{}:[{}]:changed[{}]:snap={}",
            update.item_name().unwrap_or("?"),
            values.join(","),
            changed.join(","),
            update.is_snapshot(),
        ));
    }
    fn on_end_of_snapshot(&self, item_name: Option<&str>, item_pos: usize) {
        self.events.lock().push(format!("eos:{}:{item_pos}", item_name.unwrap_or("?")));
    }
}

/// Message listener recording outcome callbacks.
pub struct MsgRecorder {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MsgRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { events: Arc::new(Mutex::new(Vec::new())) })
    }

    pub fn trace(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl ClientMessageListener for MsgRecorder {
    fn on_abort(&self, original: &str, sent_on_network: bool) {
        self.events.lock().push(format!("abort:{original}:{sent_on_network}"));
    }
    fn on_deny(&self, original: &str, code: i32, error: &str) {
        self.events.lock().push(format!("deny:{original}:{code}:{error}"));
    }
    fn on_discarded(&self, original: &str) {
        self.events.lock().push(format!("discarded:{original}"));
    }
    fn on_error(&self, original: &str) {
        self.events.lock().push(format!("error:{original}"));
    }
    fn on_processed(&self, original: &str) {
        self.events.lock().push(format!("processed:{original}"));
    }
}

/// Extract an `LS_*` parameter value from a request body or frame.
pub fn body_param(body: &str, key: &str) -> Option<String> {
    body.split(['&', '\n'])
        .filter_map(|pair| pair.trim_end_matches('\r').split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.to_owned())
}
