// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Default WebSocket provider backed by tokio-tungstenite.
//!
//! Frames queued while the socket is still connecting are flushed in
//! order on open; a connect failure or socket error flips the state to
//! `Broken` and fires `on_broken` exactly once.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::constants::WS_SUBPROTOCOL;

use super::{RequestListener, TransportOptions, WsConnection, WsState, WsTransport};

pub struct TungsteniteTransport;

struct Connection {
    out_tx: mpsc::UnboundedSender<String>,
    state: Arc<Mutex<WsState>>,
    cancel: CancellationToken,
}

impl WsConnection for Connection {
    fn send(&self, frame: String) {
        // Queued frames drain once the socket opens; after a break the
        // channel is closed and the frame is dropped with it.
        let _ = self.out_tx.send(frame);
    }

    fn state(&self) -> WsState {
        *self.state.lock()
    }

    fn disconnect(&self) {
        *self.state.lock() = WsState::Disconnected;
        self.cancel.cancel();
    }
}

impl WsTransport for TungsteniteTransport {
    fn connect(
        &self,
        url: &str,
        mut listener: Box<dyn RequestListener>,
        options: &TransportOptions,
        timeout: Duration,
    ) -> Arc<dyn WsConnection> {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let state = Arc::new(Mutex::new(WsState::Connecting));
        let cancel = CancellationToken::new();
        let conn = Arc::new(Connection {
            out_tx,
            state: Arc::clone(&state),
            cancel: cancel.clone(),
        });

        let url = url.to_owned();
        let extra_headers = options.extra_headers.clone();
        tokio::spawn(async move {
            let mut request = match url.as_str().into_client_request() {
                Ok(r) => r,
                Err(e) => {
                    debug!(url = %url, err = %e, "bad ws url");
                    *state.lock() = WsState::UnexpectedError;
                    listener.on_broken();
                    return;
                }
            };
            if let Ok(proto) = WS_SUBPROTOCOL.parse() {
                request.headers_mut().insert("Sec-WebSocket-Protocol", proto);
            }
            if let Some(headers) = extra_headers {
                for (name, value) in headers {
                    if let (Ok(name), Ok(value)) = (
                        name.parse::<tokio_tungstenite::tungstenite::http::HeaderName>(),
                        value.parse(),
                    ) {
                        request.headers_mut().insert(name, value);
                    }
                }
            }

            let connecting = tokio_tungstenite::connect_async(request);
            let connected = tokio::select! {
                _ = cancel.cancelled() => return,
                r = tokio::time::timeout(timeout, connecting) => r,
            };
            let ws = match connected {
                Ok(Ok((ws, _response))) => ws,
                Ok(Err(e)) => {
                    debug!(url = %url, err = %e, "ws connect failed");
                    *state.lock() = WsState::Broken;
                    listener.on_broken();
                    return;
                }
                Err(_) => {
                    debug!(url = %url, timeout_ms = timeout.as_millis() as u64, "ws connect timed out");
                    *state.lock() = WsState::Broken;
                    listener.on_broken();
                    return;
                }
            };

            *state.lock() = WsState::Connected;
            listener.on_open();
            let (mut sink, mut source) = ws.split();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        listener.on_closed();
                        return;
                    }
                    frame = out_rx.recv() => match frame {
                        Some(text) => {
                            if let Err(e) = sink.send(Message::Text(text.into())).await {
                                debug!(url = %url, err = %e, "ws send failed");
                                *state.lock() = WsState::Broken;
                                listener.on_broken();
                                return;
                            }
                        }
                        None => {
                            // Every handle dropped; orderly shutdown.
                            let _ = sink.send(Message::Close(None)).await;
                            listener.on_closed();
                            return;
                        }
                    },
                    incoming = source.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            for line in text.lines() {
                                let line = line.strip_suffix('\r').unwrap_or(line);
                                listener.on_message(line);
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            *state.lock() = WsState::Disconnected;
                            listener.on_closed();
                            return;
                        }
                        Some(Ok(_)) => {} // ping/pong/binary: nothing to do
                        Some(Err(e)) => {
                            debug!(url = %url, err = %e, "ws stream broken");
                            *state.lock() = WsState::Broken;
                            listener.on_broken();
                            return;
                        }
                    },
                }
            }
        });

        conn
    }
}
