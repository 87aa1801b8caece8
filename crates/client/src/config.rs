// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! User-mutable connection configuration.
//!
//! Both objects here are shared between user threads and the session
//! thread: reads and writes go through an internal lock, and every
//! effective mutation fires an `onPropertyChange` notification on the
//! events thread via the installed notifier.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::ClientError;

/// Callback invoked with the property name after an effective mutation.
pub(crate) type PropertyNotifier = Arc<dyn Fn(&'static str) + Send + Sync>;

// -- Transport selection -----------------------------------------------------

/// The transport/mode combinations a client can be pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForcedTransport {
    Ws,
    WsStreaming,
    WsPolling,
    Http,
    HttpStreaming,
    HttpPolling,
}

impl ForcedTransport {
    pub fn parse(token: &str) -> Result<Option<Self>, ClientError> {
        match token {
            "" => Ok(None),
            "WS" => Ok(Some(Self::Ws)),
            "WS-STREAMING" => Ok(Some(Self::WsStreaming)),
            "WS-POLLING" => Ok(Some(Self::WsPolling)),
            "HTTP" => Ok(Some(Self::Http)),
            "HTTP-STREAMING" => Ok(Some(Self::HttpStreaming)),
            "HTTP-POLLING" => Ok(Some(Self::HttpPolling)),
            other => {
                Err(ClientError::argument(format!("unknown forced transport: {other:?}")))
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ws => "WS",
            Self::WsStreaming => "WS-STREAMING",
            Self::WsPolling => "WS-POLLING",
            Self::Http => "HTTP",
            Self::HttpStreaming => "HTTP-STREAMING",
            Self::HttpPolling => "HTTP-POLLING",
        }
    }
}

/// A bandwidth constraint: a positive kbps figure or unlimited.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bandwidth {
    Unlimited,
    Limited(f64),
}

impl Bandwidth {
    pub fn parse(value: &str) -> Result<Self, ClientError> {
        if value.eq_ignore_ascii_case(crate::constants::UNLIMITED) {
            return Ok(Self::Unlimited);
        }
        match value.parse::<f64>() {
            Ok(n) if n > 0.0 => Ok(Self::Limited(n)),
            _ => Err(ClientError::argument(format!("invalid bandwidth: {value:?}"))),
        }
    }

    /// Wire form for `LS_requested_max_bandwidth`.
    pub fn to_wire(&self) -> String {
        match self {
            Self::Unlimited => crate::constants::UNLIMITED.to_owned(),
            Self::Limited(n) => format_float(*n),
        }
    }
}

/// HTTP proxy coordinates for both transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proxy {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Proxy {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port, user: None, password: None }
    }
}

/// Format a float the way the protocol expects: no trailing `.0` on
/// integral values.
pub(crate) fn format_float(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

// -- Connection details ------------------------------------------------------

#[derive(Default)]
struct DetailsState {
    server_address: Option<String>,
    adapter_set: Option<String>,
    user: Option<String>,
    password: Option<String>,
    // Server-assigned, read-only for users.
    session_id: Option<String>,
    server_instance_address: Option<String>,
    server_socket_name: Option<String>,
    client_ip: Option<String>,
}

/// Server endpoint and credentials for a client.
pub struct ConnectionDetails {
    state: Mutex<DetailsState>,
    notifier: Mutex<Option<PropertyNotifier>>,
}

impl ConnectionDetails {
    pub(crate) fn new(server_address: Option<String>) -> Self {
        Self {
            state: Mutex::new(DetailsState { server_address, ..DetailsState::default() }),
            notifier: Mutex::new(None),
        }
    }

    pub(crate) fn install_notifier(&self, notifier: PropertyNotifier) {
        *self.notifier.lock() = Some(notifier);
    }

    fn notify(&self, property: &'static str) {
        if let Some(n) = self.notifier.lock().clone() {
            n(property);
        }
    }

    /// Validate a server address: scheme http/https/ws/wss, host present,
    /// no query or fragment.
    fn check_address(address: &str) -> Result<(), ClientError> {
        let parsed = url::Url::parse(address)
            .map_err(|e| ClientError::argument(format!("invalid server address: {e}")))?;
        match parsed.scheme() {
            "http" | "https" | "ws" | "wss" => {}
            other => {
                return Err(ClientError::argument(format!("unsupported scheme: {other:?}")));
            }
        }
        if parsed.host_str().is_none() {
            return Err(ClientError::argument("server address has no host"));
        }
        if parsed.query().is_some() || parsed.fragment().is_some() {
            return Err(ClientError::argument("server address must not carry query/fragment"));
        }
        Ok(())
    }

    pub fn set_server_address(&self, address: Option<&str>) -> Result<(), ClientError> {
        if let Some(a) = address {
            Self::check_address(a)?;
        }
        let changed = {
            let mut s = self.state.lock();
            let next = address.map(str::to_owned);
            if s.server_address == next {
                false
            } else {
                s.server_address = next;
                true
            }
        };
        if changed {
            self.notify("serverAddress");
        }
        Ok(())
    }

    pub fn server_address(&self) -> Option<String> {
        self.state.lock().server_address.clone()
    }

    pub fn set_adapter_set(&self, adapter_set: Option<&str>) {
        self.state.lock().adapter_set = adapter_set.map(str::to_owned);
        self.notify("adapterSet");
    }

    pub fn adapter_set(&self) -> Option<String> {
        self.state.lock().adapter_set.clone()
    }

    pub fn set_user(&self, user: Option<&str>) {
        self.state.lock().user = user.map(str::to_owned);
        self.notify("user");
    }

    pub fn user(&self) -> Option<String> {
        self.state.lock().user.clone()
    }

    /// Write-only: the password is sent on session creation and never
    /// exposed back through the API.
    pub fn set_password(&self, password: Option<&str>) {
        self.state.lock().password = password.map(str::to_owned);
        self.notify("password");
    }

    pub(crate) fn password(&self) -> Option<String> {
        self.state.lock().password.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.lock().session_id.clone()
    }

    pub(crate) fn set_session_id(&self, session_id: Option<String>) {
        self.state.lock().session_id = session_id;
        self.notify("sessionId");
    }

    pub fn server_instance_address(&self) -> Option<String> {
        self.state.lock().server_instance_address.clone()
    }

    pub(crate) fn set_server_instance_address(&self, address: Option<String>) {
        self.state.lock().server_instance_address = address;
        self.notify("serverInstanceAddress");
    }

    pub fn server_socket_name(&self) -> Option<String> {
        self.state.lock().server_socket_name.clone()
    }

    pub(crate) fn set_server_socket_name(&self, name: Option<String>) {
        self.state.lock().server_socket_name = name;
        self.notify("serverSocketName");
    }

    pub fn client_ip(&self) -> Option<String> {
        self.state.lock().client_ip.clone()
    }

    pub(crate) fn set_client_ip(&self, ip: Option<String>) {
        self.state.lock().client_ip = ip;
        self.notify("clientIp");
    }
}

// -- Connection options ------------------------------------------------------

struct OptionsState {
    forced_transport: Option<ForcedTransport>,
    content_length: u64,
    first_retry_max_delay_ms: u64,
    retry_delay_ms: u64,
    reconnect_timeout_ms: u64,
    stalled_timeout_ms: u64,
    session_recovery_timeout_ms: u64,
    keepalive_interval_ms: u64,
    idle_timeout_ms: u64,
    polling_interval_ms: u64,
    reverse_heartbeat_interval_ms: u64,
    requested_max_bandwidth: Bandwidth,
    real_max_bandwidth: Option<Bandwidth>,
    slowing_enabled: bool,
    early_ws_open_enabled: bool,
    http_extra_headers: Option<HashMap<String, String>>,
    http_extra_headers_on_session_creation_only: bool,
    server_instance_address_ignored: bool,
    proxy: Option<Proxy>,
}

impl Default for OptionsState {
    fn default() -> Self {
        Self {
            forced_transport: None,
            content_length: crate::constants::DEFAULT_CONTENT_LENGTH,
            first_retry_max_delay_ms: crate::constants::DEFAULT_FIRST_RETRY_MAX_DELAY.as_millis()
                as u64,
            retry_delay_ms: crate::constants::DEFAULT_RETRY_DELAY.as_millis() as u64,
            reconnect_timeout_ms: crate::constants::DEFAULT_RECONNECT_TIMEOUT.as_millis() as u64,
            stalled_timeout_ms: crate::constants::DEFAULT_STALLED_TIMEOUT.as_millis() as u64,
            session_recovery_timeout_ms: crate::constants::DEFAULT_SESSION_RECOVERY_TIMEOUT
                .as_millis() as u64,
            keepalive_interval_ms: 0,
            idle_timeout_ms: 0,
            polling_interval_ms: 0,
            reverse_heartbeat_interval_ms: 0,
            requested_max_bandwidth: Bandwidth::Unlimited,
            real_max_bandwidth: None,
            slowing_enabled: false,
            early_ws_open_enabled: true,
            http_extra_headers: None,
            http_extra_headers_on_session_creation_only: false,
            server_instance_address_ignored: false,
            proxy: None,
        }
    }
}

/// Tunable connection behavior for a client.
///
/// Interval options default to 0, meaning the server (or transport)
/// decides. All setters may be called at any time; values picked up at
/// the next suspension point of the session thread.
pub struct ConnectionOptions {
    state: Mutex<OptionsState>,
    notifier: Mutex<Option<PropertyNotifier>>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self { state: Mutex::new(OptionsState::default()), notifier: Mutex::new(None) }
    }
}

impl ConnectionOptions {
    pub(crate) fn install_notifier(&self, notifier: PropertyNotifier) {
        *self.notifier.lock() = Some(notifier);
    }

    fn notify(&self, property: &'static str) {
        if let Some(n) = self.notifier.lock().clone() {
            n(property);
        }
    }

    pub fn set_forced_transport(&self, token: Option<&str>) -> Result<(), ClientError> {
        let parsed = match token {
            None => None,
            Some(t) => ForcedTransport::parse(t)?,
        };
        self.state.lock().forced_transport = parsed;
        self.notify("forcedTransport");
        Ok(())
    }

    pub fn forced_transport(&self) -> Option<ForcedTransport> {
        self.state.lock().forced_transport
    }

    pub fn set_content_length(&self, bytes: u64) -> Result<(), ClientError> {
        if bytes == 0 {
            return Err(ClientError::argument("content length must be positive"));
        }
        self.state.lock().content_length = bytes;
        self.notify("contentLength");
        Ok(())
    }

    pub fn content_length(&self) -> u64 {
        self.state.lock().content_length
    }

    pub fn set_first_retry_max_delay(&self, millis: u64) -> Result<(), ClientError> {
        if millis == 0 {
            return Err(ClientError::argument("first retry max delay must be positive"));
        }
        self.state.lock().first_retry_max_delay_ms = millis;
        self.notify("firstRetryMaxDelay");
        Ok(())
    }

    pub fn first_retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.state.lock().first_retry_max_delay_ms)
    }

    pub fn set_retry_delay(&self, millis: u64) -> Result<(), ClientError> {
        if millis == 0 {
            return Err(ClientError::argument("retry delay must be positive"));
        }
        self.state.lock().retry_delay_ms = millis;
        self.notify("retryDelay");
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.state.lock().retry_delay_ms)
    }

    pub fn set_reconnect_timeout(&self, millis: u64) -> Result<(), ClientError> {
        if millis == 0 {
            return Err(ClientError::argument("reconnect timeout must be positive"));
        }
        self.state.lock().reconnect_timeout_ms = millis;
        self.notify("reconnectTimeout");
        Ok(())
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.state.lock().reconnect_timeout_ms)
    }

    pub fn set_stalled_timeout(&self, millis: u64) -> Result<(), ClientError> {
        if millis == 0 {
            return Err(ClientError::argument("stalled timeout must be positive"));
        }
        self.state.lock().stalled_timeout_ms = millis;
        self.notify("stalledTimeout");
        Ok(())
    }

    pub fn stalled_timeout(&self) -> Duration {
        Duration::from_millis(self.state.lock().stalled_timeout_ms)
    }

    /// 0 disables session recovery entirely.
    pub fn set_session_recovery_timeout(&self, millis: u64) {
        self.state.lock().session_recovery_timeout_ms = millis;
        self.notify("sessionRecoveryTimeout");
    }

    pub fn session_recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.state.lock().session_recovery_timeout_ms)
    }

    /// 0 lets the server choose its own keepalive cadence.
    pub fn set_keepalive_interval(&self, millis: u64) {
        self.state.lock().keepalive_interval_ms = millis;
        self.notify("keepaliveInterval");
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.state.lock().keepalive_interval_ms)
    }

    pub(crate) fn set_keepalive_interval_from_server(&self, millis: u64) {
        self.state.lock().keepalive_interval_ms = millis;
        self.notify("keepaliveInterval");
    }

    /// Maximum time the server may wait before answering a poll.
    pub fn set_idle_timeout(&self, millis: u64) {
        self.state.lock().idle_timeout_ms = millis;
        self.notify("idleTimeout");
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.state.lock().idle_timeout_ms)
    }

    pub fn set_polling_interval(&self, millis: u64) {
        self.state.lock().polling_interval_ms = millis;
        self.notify("pollingInterval");
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.state.lock().polling_interval_ms)
    }

    /// 0 disables reverse heartbeats.
    pub fn set_reverse_heartbeat_interval(&self, millis: u64) {
        self.state.lock().reverse_heartbeat_interval_ms = millis;
        self.notify("reverseHeartbeatInterval");
    }

    pub fn reverse_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.state.lock().reverse_heartbeat_interval_ms)
    }

    pub fn set_requested_max_bandwidth(&self, value: &str) -> Result<(), ClientError> {
        let parsed = Bandwidth::parse(value)?;
        self.state.lock().requested_max_bandwidth = parsed;
        self.notify("requestedMaxBandwidth");
        Ok(())
    }

    pub fn requested_max_bandwidth(&self) -> Bandwidth {
        self.state.lock().requested_max_bandwidth
    }

    /// Last bandwidth constraint the server confirmed (`CONS`).
    pub fn real_max_bandwidth(&self) -> Option<Bandwidth> {
        self.state.lock().real_max_bandwidth
    }

    pub(crate) fn set_real_max_bandwidth(&self, value: Option<Bandwidth>) {
        self.state.lock().real_max_bandwidth = value;
        self.notify("realMaxBandwidth");
    }

    pub fn set_slowing_enabled(&self, enabled: bool) {
        self.state.lock().slowing_enabled = enabled;
        self.notify("slowingEnabled");
    }

    pub fn slowing_enabled(&self) -> bool {
        self.state.lock().slowing_enabled
    }

    pub fn set_early_ws_open_enabled(&self, enabled: bool) {
        self.state.lock().early_ws_open_enabled = enabled;
        self.notify("earlyWSOpenEnabled");
    }

    pub fn early_ws_open_enabled(&self) -> bool {
        self.state.lock().early_ws_open_enabled
    }

    pub fn set_http_extra_headers(&self, headers: Option<HashMap<String, String>>) {
        self.state.lock().http_extra_headers = headers;
        self.notify("httpExtraHeaders");
    }

    pub fn http_extra_headers(&self) -> Option<HashMap<String, String>> {
        self.state.lock().http_extra_headers.clone()
    }

    pub fn set_http_extra_headers_on_session_creation_only(&self, enabled: bool) {
        self.state.lock().http_extra_headers_on_session_creation_only = enabled;
        self.notify("httpExtraHeadersOnSessionCreationOnly");
    }

    pub fn http_extra_headers_on_session_creation_only(&self) -> bool {
        self.state.lock().http_extra_headers_on_session_creation_only
    }

    /// When set, `CONOK` control-link indications are ignored and all
    /// requests keep targeting the configured address.
    pub fn set_server_instance_address_ignored(&self, ignored: bool) {
        self.state.lock().server_instance_address_ignored = ignored;
        self.notify("serverInstanceAddressIgnored");
    }

    pub fn server_instance_address_ignored(&self) -> bool {
        self.state.lock().server_instance_address_ignored
    }

    pub fn set_proxy(&self, proxy: Option<Proxy>) {
        self.state.lock().proxy = proxy;
        self.notify("proxy");
    }

    pub fn proxy(&self) -> Option<Proxy> {
        self.state.lock().proxy.clone()
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
