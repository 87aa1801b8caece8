// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The client facade.
//!
//! [`TlcpClient`] validates arguments synchronously and hands the real
//! work to the session thread. It must be constructed inside a tokio
//! runtime; by default all clients in a process share one session
//! worker, while each client gets its own events worker so one
//! client's slow listeners never delay another's.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{ConnectionDetails, ConnectionOptions};
use crate::error::ClientError;
use crate::executor::{shared_session_thread, Executor};
use crate::listener::{ClientListener, ClientMessageListener};
use crate::session::{Engine, EngineHandle};
use crate::subscription::Subscription;
use crate::transport::TransportFactory;

pub struct TlcpClient {
    engine: Arc<Mutex<Engine>>,
    handle: EngineHandle,
    details: Arc<ConnectionDetails>,
    options: Arc<ConnectionOptions>,
    session_exec: Executor,
    events_exec: Executor,
}

impl TlcpClient {
    /// Build a client for `server_address` (optional here; it can be
    /// set later through [`ConnectionDetails`]) and an adapter set.
    pub fn new(
        server_address: Option<&str>,
        adapter_set: Option<&str>,
    ) -> Result<Self, ClientError> {
        Self::with_transports(server_address, adapter_set, TransportFactory::standard())
    }

    /// Build a client over caller-supplied transport providers.
    pub fn with_transports(
        server_address: Option<&str>,
        adapter_set: Option<&str>,
        transports: TransportFactory,
    ) -> Result<Self, ClientError> {
        let details = Arc::new(ConnectionDetails::new(None));
        details.set_server_address(server_address)?;
        if let Some(adapter_set) = adapter_set {
            details.set_adapter_set(Some(adapter_set));
        }
        let options = Arc::new(ConnectionOptions::default());

        let session_exec = shared_session_thread();
        let events_exec = Executor::spawn("events", true);
        let (engine, handle) = Engine::build(
            session_exec.clone(),
            events_exec.clone(),
            Arc::clone(&details),
            Arc::clone(&options),
            transports,
        );

        let client = Self { engine, handle, details, options, session_exec, events_exec };
        client.install_notifiers();
        Ok(client)
    }

    /// Route property changes to listeners, and to the engine for the
    /// options it acts on while connected.
    ///
    /// The notifier must never lock the engine: setters fire it from
    /// inside engine tasks too.
    fn install_notifiers(&self) {
        let notifier = {
            let listeners = self.engine.lock().client_listeners.clone();
            let events = self.events_exec.clone();
            let handle = self.handle.clone();
            Arc::new(move |property: &'static str| {
                let listeners = listeners.snapshot();
                events.queue(move || {
                    for listener in &listeners {
                        listener.on_property_change(property);
                    }
                });
                match property {
                    "requestedMaxBandwidth" => {
                        handle.post(|engine| engine.on_bandwidth_changed());
                    }
                    "reverseHeartbeatInterval" => {
                        handle.post(|engine| engine.on_heartbeat_interval_changed());
                    }
                    _ => {}
                }
            })
        };
        self.details.install_notifier(Arc::clone(&notifier) as _);
        self.options.install_notifier(notifier as _);
    }

    pub fn connection_details(&self) -> &ConnectionDetails {
        &self.details
    }

    pub fn connection_options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Current status string (`DISCONNECTED`, `CONNECTING`, `CONNECTED:*`, ...).
    pub fn status(&self) -> String {
        self.engine.lock().status().to_owned()
    }

    pub fn add_listener(&self, listener: Arc<dyn ClientListener>) {
        if self.engine.lock().client_listeners.add(Arc::clone(&listener)) {
            self.events_exec.queue(move || listener.on_listen_start());
        }
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ClientListener>) {
        if self.engine.lock().client_listeners.remove(listener) {
            let listener = Arc::clone(listener);
            self.events_exec.queue(move || listener.on_listen_end());
        }
    }

    /// Open (or re-open) the connection to the configured server.
    pub fn connect(&self) -> Result<(), ClientError> {
        if self.details.server_address().is_none() {
            return Err(ClientError::state("no server address configured"));
        }
        self.handle.post(|engine| {
            if let Err(e) = engine.connect() {
                tracing::warn!(error = %e, "connect failed");
            }
        });
        Ok(())
    }

    /// Close the session. Status reaches `DISCONNECTED` once the close
    /// task runs on the session thread.
    pub fn disconnect(&self) {
        self.handle.post(|engine| engine.disconnect());
    }

    /// Disconnect and resolve once both executors drained the work
    /// this produced.
    pub async fn disconnect_future(&self) {
        self.disconnect();
        self.session_exec.drained().await;
        self.events_exec.drained().await;
    }

    /// Attach a subscription. Validation is synchronous; the
    /// SUBSCRIBE request goes out on the session thread.
    pub fn subscribe(&self, subscription: &Subscription) -> Result<(), ClientError> {
        let outgoing = {
            let mut engine = self.engine.lock();
            let session_open = engine.session_open();
            engine.subscriptions.subscribe(subscription, self.handle.clone(), session_open)?
        };
        if !outgoing.is_empty() {
            self.handle.post(move |engine| engine.send_outgoing(outgoing));
        }
        Ok(())
    }

    /// Detach a subscription; pending unsubscribes go out on the
    /// session thread.
    pub fn unsubscribe(&self, subscription: &Subscription) -> Result<(), ClientError> {
        let outgoing = {
            let mut engine = self.engine.lock();
            let session_open = engine.session_open();
            engine.subscriptions.unsubscribe(subscription, session_open)?
        };
        if !outgoing.is_empty() {
            self.handle.post(move |engine| engine.send_outgoing(outgoing));
        }
        Ok(())
    }

    /// Send a message with full delivery-guarantee control.
    ///
    /// `delay_timeout_ms < 0` defers to the server default.
    pub fn send_message(
        &self,
        message: &str,
        sequence: &str,
        delay_timeout_ms: i64,
        listener: Option<Arc<dyn ClientMessageListener>>,
        enqueue_while_disconnected: bool,
    ) -> Result<(), ClientError> {
        let outgoing = {
            let mut engine = self.engine.lock();
            let session_open = engine.session_open();
            engine.messages.send(
                message,
                sequence,
                delay_timeout_ms,
                listener,
                enqueue_while_disconnected,
                session_open,
            )?
        };
        if let Some(outgoing) = outgoing {
            self.handle.post(move |engine| engine.send_outgoing(vec![outgoing]));
        }
        Ok(())
    }

    /// Fire-and-forget message on the unordered sequence.
    pub fn send_simple_message(&self, message: &str) -> Result<(), ClientError> {
        self.send_message(message, crate::constants::UNORDERED_MESSAGES, -1, None, false)
    }
}
