// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use yare::parameterized;

use super::*;

#[parameterized(
    ws = { "WS", ForcedTransport::Ws },
    ws_streaming = { "WS-STREAMING", ForcedTransport::WsStreaming },
    ws_polling = { "WS-POLLING", ForcedTransport::WsPolling },
    http = { "HTTP", ForcedTransport::Http },
    http_streaming = { "HTTP-STREAMING", ForcedTransport::HttpStreaming },
    http_polling = { "HTTP-POLLING", ForcedTransport::HttpPolling },
)]
fn forced_transport_tokens(token: &str, expected: ForcedTransport) {
    assert_eq!(ForcedTransport::parse(token).ok(), Some(Some(expected)));
}

#[test]
fn forced_transport_rejects_unknown_token() {
    assert!(ForcedTransport::parse("SPDY").is_err());
}

#[test]
fn bandwidth_grammar() {
    assert_eq!(Bandwidth::parse("unlimited").ok(), Some(Bandwidth::Unlimited));
    assert_eq!(Bandwidth::parse("12.5").ok(), Some(Bandwidth::Limited(12.5)));
    assert!(Bandwidth::parse("0").is_err());
    assert!(Bandwidth::parse("-3").is_err());
    assert!(Bandwidth::parse("fast").is_err());
}

#[test]
fn bandwidth_wire_form_drops_integral_fraction() {
    assert_eq!(Bandwidth::Limited(40.0).to_wire(), "40");
    assert_eq!(Bandwidth::Limited(12.5).to_wire(), "12.5");
    assert_eq!(Bandwidth::Unlimited.to_wire(), "unlimited");
}

#[test]
fn server_address_validation() {
    let details = ConnectionDetails::new(None);
    assert!(details.set_server_address(Some("http://push.example:80/")).is_ok());
    assert!(details.set_server_address(Some("wss://push.example")).is_ok());
    assert!(details.set_server_address(Some("ftp://push.example")).is_err());
    assert!(details.set_server_address(Some("http://push.example/?x=1")).is_err());
    assert!(details.set_server_address(Some("not a url")).is_err());
}

#[test]
fn mutation_fires_property_change() {
    let details = ConnectionDetails::new(None);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    details.install_notifier(Arc::new(move |name| sink.lock().push(name)));

    let _ = details.set_server_address(Some("http://push.example"));
    details.set_adapter_set(Some("DEFAULT"));
    details.set_user(Some("u"));

    assert_eq!(*seen.lock(), vec!["serverAddress", "adapterSet", "user"]);
}

#[test]
fn unchanged_server_address_is_silent() {
    let details = ConnectionDetails::new(Some("http://push.example/".to_owned()));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    details.install_notifier(Arc::new(move |name| sink.lock().push(name)));

    let _ = details.set_server_address(Some("http://push.example/"));
    assert!(seen.lock().is_empty());
}

#[test]
fn option_defaults_match_contract() {
    let options = ConnectionOptions::default();
    assert_eq!(options.content_length(), 50_000_000);
    assert_eq!(options.retry_delay().as_millis(), 4000);
    assert_eq!(options.reconnect_timeout().as_millis(), 3000);
    assert_eq!(options.stalled_timeout().as_millis(), 2000);
    assert_eq!(options.session_recovery_timeout().as_millis(), 15_000);
    assert_eq!(options.keepalive_interval().as_millis(), 0);
    assert_eq!(options.polling_interval().as_millis(), 0);
    assert_eq!(options.reverse_heartbeat_interval().as_millis(), 0);
    assert!(options.forced_transport().is_none());
    assert!(!options.slowing_enabled());
    assert!(options.early_ws_open_enabled());
}

#[test]
fn zero_timeouts_rejected_where_meaningless() {
    let options = ConnectionOptions::default();
    assert!(options.set_content_length(0).is_err());
    assert!(options.set_retry_delay(0).is_err());
    assert!(options.set_stalled_timeout(0).is_err());
    // Interval options accept 0 (server-decided / disabled).
    options.set_keepalive_interval(0);
    options.set_reverse_heartbeat_interval(0);
}
