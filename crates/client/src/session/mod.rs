// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The session engine: one logical server session carried by a
//! sequence of physical stream connections.
//!
//! All state here is owned by a single [`Engine`] mutated only from
//! session-thread tasks; transports, timers, and the facade re-enter
//! through an [`EngineHandle`]. The engine routes protocol events to
//! the subscription and message managers, drives stream-sense,
//! slowing-induced polling switches, stall detection, reverse
//! heartbeats, and recovery of broken sessions from the data-
//! notification progress counter.

pub(crate) mod recovery;
pub(crate) mod retry;
pub(crate) mod slowing;
pub(crate) mod stream;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Bandwidth, ConnectionDetails, ConnectionOptions};
use crate::constants::{self, SERVER_PATH, TLCP_VERSION};
use crate::error::ClientError;
use crate::executor::{Executor, TimerHandle};
use crate::listener::{ClientListener, ListenerSet};
use crate::manager::http::HttpRequestManager;
use crate::manager::ws::WsRequestManager;
use crate::manager::{ControlKind, SendEnv};
use crate::message::MessageManager;
use crate::protocol::heartbeat::ReverseHeartbeat;
use crate::protocol::{parse_line, Codec, MsgOutcome, ProtocolEvent};
use crate::request::{control, next_request_id, session as session_request, Request};
use crate::subscription::{MaxFrequency, Outgoing, SubscriptionManager};
use crate::transport::{
    RequestListener, StreamRequest, TransportFactory, TransportOptions, WsState,
};
use crate::tutor::{timeout_verdict, TimeoutEnv, TimeoutVerdict, Tutor, TutorContext};

use recovery::RecoveryBean;
use retry::RetryDelayCounter;
use stream::{Binding, StreamPhase, StreamSession, TransportKind};

/// Cheap handle re-entering the engine on the session thread.
pub(crate) struct EngineHandle {
    exec: Executor,
    cell: Weak<Mutex<Engine>>,
}

impl Clone for EngineHandle {
    fn clone(&self) -> Self {
        Self { exec: self.exec.clone(), cell: Weak::clone(&self.cell) }
    }
}

impl EngineHandle {
    pub fn post(&self, task: impl FnOnce(&mut Engine) + Send + 'static) {
        let cell = Weak::clone(&self.cell);
        self.exec.queue(move || {
            if let Some(engine) = cell.upgrade() {
                task(&mut engine.lock());
            }
        });
    }

    pub fn schedule(
        &self,
        delay: Duration,
        task: impl FnOnce(&mut Engine) + Send + 'static,
    ) -> TimerHandle {
        let cell = Weak::clone(&self.cell);
        self.exec.schedule(delay, move || {
            if let Some(engine) = cell.upgrade() {
                task(&mut engine.lock());
            }
        })
    }

    /// A handle bound to no engine; tasks posted through it vanish.
    #[cfg(test)]
    pub fn detached(exec: Executor) -> Self {
        Self { exec, cell: Weak::new() }
    }
}

/// End codes after which the server session can simply be recreated.
fn end_code_is_retriable(code: i32) -> bool {
    matches!(code, 41 | 48)
}

/// CONERR codes that merit another attempt instead of a server error.
fn conerr_is_retriable(code: i32) -> bool {
    matches!(code, 4 | 5)
}

pub(crate) struct Engine {
    handle: EngineHandle,
    events: Executor,
    pub details: Arc<ConnectionDetails>,
    pub options: Arc<ConnectionOptions>,
    pub client_listeners: ListenerSet<dyn ClientListener>,
    transports: TransportFactory,

    status: String,
    codec: Codec,
    http: HttpRequestManager,
    ws_control: Option<WsRequestManager>,
    tutors: HashMap<u64, Tutor>,
    /// req_id → tutor_id awaiting REQOK/REQERR.
    inflight: HashMap<u64, u64>,

    pub subscriptions: SubscriptionManager,
    pub messages: MessageManager,

    stream: Option<StreamSession>,
    session_id: Option<String>,
    /// Control-link address from CONOK, full scheme://host form.
    control_address: Option<String>,
    /// Count of data notifications applied this logical session.
    data_prog: u64,
    /// Notifications still to drop after a recovery bind.
    recovery_skip: u64,
    awaiting_recovery_prog: bool,
    recovery: RecoveryBean,
    retry: RetryDelayCounter,
    retry_timer: Option<TimerHandle>,
    heartbeat: ReverseHeartbeat,
    /// Polling variant to adopt at the next LOOP (slowing switch).
    pending_switch: Option<TransportKind>,
    pending_constrain: Option<Bandwidth>,
    pending_force_rebind: bool,
    /// The control channel is usable (CONOK seen, session not closed).
    session_open: bool,
    /// The user wants to be connected.
    desired_connected: bool,
}

impl Engine {
    /// Build the engine cell and hand back the re-entry handle.
    pub fn build(
        session_exec: Executor,
        events: Executor,
        details: Arc<ConnectionDetails>,
        options: Arc<ConnectionOptions>,
        transports: TransportFactory,
    ) -> (Arc<Mutex<Engine>>, EngineHandle) {
        let cell = Arc::new_cyclic(|weak: &Weak<Mutex<Engine>>| {
            let handle = EngineHandle { exec: session_exec.clone(), cell: Weak::clone(weak) };
            let heartbeat =
                ReverseHeartbeat::new(options.reverse_heartbeat_interval().as_millis() as u64);
            let retry = RetryDelayCounter::new(options.retry_delay());
            Mutex::new(Engine {
                handle: handle.clone(),
                events: events.clone(),
                details,
                options,
                client_listeners: ListenerSet::default(),
                transports: transports.clone(),
                status: constants::DISCONNECTED.to_owned(),
                codec: Codec::default(),
                http: HttpRequestManager::new(Arc::clone(&transports.http)),
                ws_control: None,
                tutors: HashMap::new(),
                inflight: HashMap::new(),
                subscriptions: SubscriptionManager::new(events.clone()),
                messages: MessageManager::new(events),
                stream: None,
                session_id: None,
                control_address: None,
                data_prog: 0,
                recovery_skip: 0,
                awaiting_recovery_prog: false,
                recovery: RecoveryBean::new(),
                retry,
                retry_timer: None,
                heartbeat,
                pending_switch: None,
                pending_constrain: None,
                pending_force_rebind: false,
                session_open: false,
                desired_connected: false,
            })
        });
        let handle = EngineHandle { exec: session_exec, cell: Arc::downgrade(&cell) };
        (cell, handle)
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn session_open(&self) -> bool {
        self.session_open
    }

    fn set_status(&mut self, status: &str) {
        if self.status == status {
            return;
        }
        info!(from = %self.status, to = status, "status change");
        self.status = status.to_owned();
        let listeners = self.client_listeners.snapshot();
        let status = status.to_owned();
        self.events.queue(move || {
            for listener in &listeners {
                listener.on_status_change(&status);
            }
        });
    }

    fn fire_server_error(&mut self, code: i32, message: &str) {
        let listeners = self.client_listeners.snapshot();
        let message = message.to_owned();
        self.events.queue(move || {
            for listener in &listeners {
                listener.on_server_error(code, &message);
            }
        });
    }

    // -- Addressing ------------------------------------------------------

    /// Base server address for the current session, control link
    /// included unless ignored.
    fn base_address(&self) -> Option<String> {
        if !self.options.server_instance_address_ignored() {
            if let Some(ref link) = self.control_address {
                return Some(link.clone());
            }
        }
        self.details.server_address()
    }

    fn http_base(address: &str) -> String {
        let address = address.trim_end_matches('/');
        let address = address
            .replacen("wss://", "https://", 1)
            .replacen("ws://", "http://", 1);
        format!("{address}{SERVER_PATH}")
    }

    fn ws_url(address: &str) -> String {
        let address = address.trim_end_matches('/');
        let address = address
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{address}{SERVER_PATH}")
    }

    fn session_endpoint(address: &str, endpoint: &str) -> String {
        format!("{}/{endpoint}?LS_protocol={TLCP_VERSION}", Self::http_base(address))
    }

    fn transport_options(&self, session_creation: bool) -> TransportOptions {
        let headers = if self.options.http_extra_headers_on_session_creation_only()
            && !session_creation
        {
            None
        } else {
            self.options.http_extra_headers()
        };
        TransportOptions {
            extra_headers: headers,
            proxy: self.options.proxy(),
            connect_timeout: self.options.retry_delay(),
            read_timeout: Duration::ZERO,
        }
    }

    // -- Public operations ----------------------------------------------

    pub fn connect(&mut self) -> Result<(), ClientError> {
        if self.details.server_address().is_none() {
            return Err(ClientError::state("no server address configured"));
        }
        if self.desired_connected {
            return Ok(());
        }
        self.desired_connected = true;
        self.set_status(constants::CONNECTING);
        let kind = TransportKind::initial(self.options.forced_transport());
        self.open_create(kind, Some("api"), None);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if !self.desired_connected && self.stream.is_none() {
            self.set_status(constants::DISCONNECTED);
            return;
        }
        self.desired_connected = false;
        if let Some(timer) = self.retry_timer.take() {
            timer.cancel();
        }

        if self.session_open {
            if let Some(sid) = self.session_id.clone() {
                let request = control::destroy(&sid, Some("api"), None);
                self.send_control(ControlKind::Destroy(sid), request, TutorContext::Void, None);
            }
        }
        self.teardown_session(false);
        self.set_status(constants::DISCONNECTED);
    }

    /// Full logical-session teardown. `will_retry` keeps the client in
    /// a reconnecting state (subscriptions pause either way).
    fn teardown_session(&mut self, will_retry: bool) {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown();
        }
        self.ws_control = None;
        // Let an in-flight destroy batch drain; everything queued dies.
        let orphaned = self.http.close(true);
        for tutor_id in orphaned {
            self.abort_tutor(tutor_id);
        }
        let ids: Vec<u64> = self.tutors.keys().copied().collect();
        for tutor_id in ids {
            self.abort_tutor(tutor_id);
        }
        self.inflight.clear();
        self.http = HttpRequestManager::new(Arc::clone(&self.transports.http));

        self.session_open = false;
        self.subscriptions.on_session_close(false);
        self.messages.on_session_close(false);
        self.codec.set_default_session(None);
        self.session_id = None;
        self.control_address = None;
        self.details.set_session_id(None);
        self.details.set_server_instance_address(None);
        self.data_prog = 0;
        self.recovery_skip = 0;
        self.awaiting_recovery_prog = false;
        self.recovery.restore();
        self.pending_switch = None;
        self.pending_force_rebind = false;
        self.pending_constrain = None;
        if !will_retry {
            self.retry.reset(self.options.retry_delay());
        }
    }

    /// `requestedMaxBandwidth` changed; constrain the live session.
    pub fn on_bandwidth_changed(&mut self) {
        if !self.session_open {
            return;
        }
        let bandwidth = self.options.requested_max_bandwidth();
        self.pending_constrain = Some(bandwidth);
        let request = control::constrain(bandwidth);
        self.send_control(
            ControlKind::Constrain,
            request,
            TutorContext::Constrain { bandwidth },
            None,
        );
    }

    /// `reverseHeartbeatInterval` changed; re-arm the pacing.
    pub fn on_heartbeat_interval_changed(&mut self) {
        let user_ms = self.options.reverse_heartbeat_interval().as_millis() as u64;
        self.heartbeat.set_user_interval(user_ms);
        self.schedule_heartbeat();
    }

    pub fn change_frequency(&mut self, sub_id: u64, frequency: MaxFrequency) {
        let outgoing = self.subscriptions.change_frequency(sub_id, frequency);
        self.send_outgoing(outgoing);
    }

    // -- Request dispatch ------------------------------------------------

    pub(crate) fn send_outgoing(&mut self, outgoing: Vec<Outgoing>) {
        for item in outgoing {
            self.send_control(item.kind, item.request, item.context, item.fixed_timeout);
        }
    }

    fn send_control(
        &mut self,
        kind: ControlKind,
        mut request: Request,
        context: TutorContext,
        fixed_timeout: Option<Duration>,
    ) {
        // A delete makes any queued frequency change for the same
        // subscription pointless; purge it rather than let it chase a
        // dead id.
        if let ControlKind::Unsubscribe(sub_id) = kind {
            if let Some(old) = self.http.cancel_change_frequency(sub_id) {
                self.abort_tutor(old);
            }
        }
        request.set_req_id(next_request_id());
        if request.session().is_none() {
            if let Some(ref sid) = self.session_id {
                request.set_session(sid.clone());
            }
        }
        let stream_id = self.stream.as_ref().map(|s| s.id).unwrap_or(0);
        let tutor = match (fixed_timeout, &context) {
            (_, TutorContext::Void) => {
                Tutor::fixed(context, kind, request, stream_id, Duration::ZERO)
            }
            (Some(timeout), _) => Tutor::fixed(context, kind, request, stream_id, timeout),
            (None, _) => Tutor::growing(context, kind, request, stream_id, None),
        };
        let tutor_id = tutor.id;
        self.tutors.insert(tutor_id, tutor);
        self.dispatch_request(tutor_id);
    }

    /// Put a tutored request on the current control channel.
    fn dispatch_request(&mut self, tutor_id: u64) {
        let (request, kind) = match self.tutors.get(&tutor_id) {
            Some(tutor) if !tutor.discarded => (tutor.request.clone(), tutor.kind.clone()),
            _ => return,
        };
        let ws_usable = self
            .ws_control
            .as_ref()
            .is_some_and(|ws| {
                matches!(ws.connection().state(), WsState::Connecting | WsState::Connected)
            });
        // Destroys travel over HTTP so they can outlive the socket and
        // target the server the session lives on.
        let use_ws = ws_usable && !matches!(kind, ControlKind::Destroy(_));

        let control_base = self
            .base_address()
            .map(|a| Self::http_base(&a))
            .unwrap_or_default();
        let transport_options = self.transport_options(false);
        let mut env = SendEnv {
            codec: &self.codec,
            handle: &self.handle,
            inflight: &mut self.inflight,
            control_base,
            transport_options,
        };
        if use_ws {
            if let Some(ref ws) = self.ws_control {
                ws.send(&request, tutor_id, &mut env);
            }
        } else {
            let replaced = self.http.add(&kind, request, tutor_id, &mut env);
            if let Some(old) = replaced {
                self.abort_tutor(old);
            }
        }
    }

    /// The request actually hit the wire: start its retransmission
    /// clock and refresh the reverse-heartbeat silence window.
    pub(crate) fn arm_tutor(&mut self, tutor_id: u64) {
        self.heartbeat.note_sent(crate::executor::now());
        self.schedule_heartbeat();
        let current_stream = self.stream.as_ref().map(|s| s.id).unwrap_or(0);
        let Some(tutor) = self.tutors.get_mut(&tutor_id) else {
            return;
        };
        if tutor.discarded {
            return;
        }
        tutor.stream_id = current_stream;
        if let TutorContext::Message { ref sequence, prog } = tutor.context {
            let sequence = sequence.clone();
            self.messages.on_sent(&sequence, prog);
        }
        let Some(tutor) = self.tutors.get_mut(&tutor_id) else {
            return;
        };
        if tutor.is_void() {
            // No retransmission; the id stays registered for REQOK.
            return;
        }
        let timeout = tutor.timeout;
        let timer = self.handle.schedule(timeout, move |engine| engine.on_tutor_timeout(tutor_id));
        if let Some(tutor) = self.tutors.get_mut(&tutor_id) {
            if let Some(old) = tutor.timer.replace(timer) {
                old.cancel();
            }
        }
    }

    fn abort_tutor(&mut self, tutor_id: u64) {
        if let Some(mut tutor) = self.tutors.remove(&tutor_id) {
            tutor.abort();
            if let Some(req_id) = tutor.request.req_id() {
                self.inflight.remove(&req_id);
            }
        }
    }

    /// A tutor's "did it succeed" question, answered by its owner.
    fn tutor_settled(&self, context: &TutorContext) -> bool {
        match context {
            TutorContext::Subscribe { sub_id } => {
                self.subscriptions.subscribe_succeeded(*sub_id)
                    || !self.subscriptions.subscribe_still_wanted(*sub_id)
            }
            TutorContext::Unsubscribe { sub_id } => {
                self.subscriptions.unsubscribe_succeeded(*sub_id)
            }
            TutorContext::ChangeFrequency { sub_id, reconf_id, .. } => {
                self.subscriptions.reconf_succeeded(*sub_id, *reconf_id)
            }
            TutorContext::Constrain { bandwidth } => {
                self.pending_constrain != Some(*bandwidth)
            }
            TutorContext::ForceRebind => !self.pending_force_rebind,
            TutorContext::Message { sequence, prog } => {
                self.messages.message_settled(sequence, *prog)
            }
            TutorContext::Void => true,
        }
    }

    pub(crate) fn on_tutor_timeout(&mut self, tutor_id: u64) {
        let verdict = {
            let Some(tutor) = self.tutors.get(&tutor_id) else {
                return;
            };
            let env = TimeoutEnv {
                succeeded: self.tutor_settled(&tutor.context),
                session_closed: !self.session_open,
                transport_http: self.ws_control.is_none(),
                same_stream: self.stream.as_ref().map(|s| s.id).unwrap_or(0) == tutor.stream_id,
            };
            timeout_verdict(tutor, env)
        };
        match verdict {
            TimeoutVerdict::Discard => {
                self.abort_tutor(tutor_id);
            }
            TimeoutVerdict::Resend => {
                if let Some(tutor) = self.tutors.get_mut(&tutor_id) {
                    debug!(tutor_id, "retransmitting control request");
                    tutor.timeout *= 2;
                }
                self.dispatch_request(tutor_id);
            }
            TimeoutVerdict::Reschedule(next) => {
                if let Some(tutor) = self.tutors.get_mut(&tutor_id) {
                    tutor.timeout = next;
                }
                let timer =
                    self.handle.schedule(next, move |engine| engine.on_tutor_timeout(tutor_id));
                if let Some(tutor) = self.tutors.get_mut(&tutor_id) {
                    if let Some(old) = tutor.timer.replace(timer) {
                        old.cancel();
                    }
                }
            }
        }
    }

    // -- Stream lifecycle ------------------------------------------------

    fn open_create(&mut self, kind: TransportKind, cause: Option<&str>, old_session: Option<String>) {
        let Some(address) = self.details.server_address() else {
            warn!("connect without a server address");
            return;
        };
        let mut stream = StreamSession::new(kind, cause.map(str::to_owned));
        stream.phase = StreamPhase::Creating;
        let stream_id = stream.id;
        info!(stream_id, kind = kind.status(), "creating session");

        let request = session_request::create_session(
            kind.is_polling(),
            cause,
            &self.options,
            &self.details,
            0,
            old_session.as_deref(),
        );

        if kind.is_ws() {
            let url = Self::ws_url(&address);
            let listener = StreamListener { handle: self.handle.clone(), stream_id };
            let conn = self.transports.ws.connect(
                &url,
                Box::new(listener),
                &self.transport_options(true),
                self.options.retry_delay(),
            );
            conn.send(self.codec.ws_frame(&request));
            self.ws_control = Some(WsRequestManager::new(Arc::clone(&conn)));
            stream.binding = Binding::Ws(conn);
        } else {
            let url = Self::session_endpoint(&address, "create_session.txt");
            let body = request.query_string(None);
            let listener = StreamListener { handle: self.handle.clone(), stream_id };
            let handle = self.transports.http.send_request(
                StreamRequest { url, body },
                Box::new(listener),
                &self.transport_options(true),
            );
            self.ws_control = None;
            stream.binding = Binding::Http(handle);
        }

        let guard = self.retry.current().max(self.options.reconnect_timeout());
        stream.connect_timer = Some(
            self.handle
                .schedule(guard, move |engine| engine.on_connect_timeout(stream_id)),
        );
        self.stream = Some(stream);
    }

    /// Bind (or rebind) the current stream session after a LOOP.
    fn do_bind(&mut self, stream_id: u64) {
        let Some(address) = self.base_address() else {
            return;
        };
        let Some(sid) = self.session_id.clone() else {
            return;
        };
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        if stream.id != stream_id {
            return;
        }
        let kind = stream.kind;
        let first = stream.bind_count == 0;
        stream.phase = if first { StreamPhase::FirstBinding } else { StreamPhase::Binding };
        stream.bind_count += 1;
        let delay = stream.slowing.delay_ms();
        let cause = stream.cause.take();

        let heartbeat_ms = self.options.reverse_heartbeat_interval().as_millis() as u64;
        let request = session_request::bind_session(
            &sid,
            kind.is_polling(),
            cause.as_deref(),
            &self.options,
            delay,
            kind == TransportKind::HttpStreaming,
            heartbeat_ms,
        );

        match kind {
            TransportKind::WsStreaming | TransportKind::WsPolling => {
                let frame = self.codec.ws_frame(&request);
                if let Some(stream) = self.stream.as_ref() {
                    if let Some(conn) = stream.ws_connection() {
                        conn.send(frame);
                    }
                }
            }
            TransportKind::HttpStreaming | TransportKind::HttpPolling => {
                let url = Self::session_endpoint(&address, "bind_session.txt");
                let body = request.query_string(None);
                let listener = StreamListener { handle: self.handle.clone(), stream_id };
                let handle = self.transports.http.send_request(
                    StreamRequest { url, body },
                    Box::new(listener),
                    &self.transport_options(false),
                );
                if let Some(stream) = self.stream.as_mut() {
                    stream.close_binding();
                    stream.binding = Binding::Http(handle);
                }
            }
        }

        self.heartbeat.on_bind(heartbeat_ms, crate::executor::now());
        self.schedule_heartbeat();

        let guard = self.retry.current().max(self.options.reconnect_timeout());
        let timer = self
            .handle
            .schedule(guard, move |engine| engine.on_connect_timeout(stream_id));
        if let Some(stream) = self.stream.as_mut() {
            if let Some(old) = stream.connect_timer.replace(timer) {
                old.cancel();
            }
        }
    }

    /// Open a fresh stream session that recovers the logical session.
    fn open_recovery_bind(&mut self) {
        let Some(address) = self.base_address() else {
            return;
        };
        let Some(sid) = self.session_id.clone() else {
            return;
        };
        let kind = self
            .stream
            .as_ref()
            .map(|s| s.kind)
            .unwrap_or_else(|| TransportKind::initial(self.options.forced_transport()));
        let mut stream = StreamSession::new(kind, Some("recovery".to_owned()));
        stream.phase = StreamPhase::Binding;
        stream.recovering_bind = true;
        let stream_id = stream.id;
        info!(stream_id, prog = self.data_prog, "attempting session recovery");

        let request = session_request::recover_session(
            &sid,
            Some("network.error"),
            &self.options,
            0,
            self.data_prog,
        );
        self.awaiting_recovery_prog = true;

        if kind.is_ws() {
            let url = Self::ws_url(&address);
            let listener = StreamListener { handle: self.handle.clone(), stream_id };
            let conn = self.transports.ws.connect(
                &url,
                Box::new(listener),
                &self.transport_options(false),
                self.options.retry_delay(),
            );
            conn.send(self.codec.ws_frame(&request));
            self.ws_control = Some(WsRequestManager::new(Arc::clone(&conn)));
            stream.binding = Binding::Ws(conn);
        } else {
            let url = Self::session_endpoint(&address, "bind_session.txt");
            let body = request.query_string(None);
            let listener = StreamListener { handle: self.handle.clone(), stream_id };
            let handle = self.transports.http.send_request(
                StreamRequest { url, body },
                Box::new(listener),
                &self.transport_options(false),
            );
            self.ws_control = None;
            stream.binding = Binding::Http(handle);
        }

        let guard = self.options.reconnect_timeout();
        stream.connect_timer = Some(
            self.handle
                .schedule(guard, move |engine| engine.on_connect_timeout(stream_id)),
        );
        self.stream = Some(stream);
    }

    /// Give the session up and create a fresh one after the retry
    /// delay.
    fn will_retry_create(&mut self, cause: &'static str) {
        let old_session = self.session_id.clone();
        self.teardown_session(true);
        if !self.desired_connected {
            self.set_status(constants::DISCONNECTED);
            return;
        }
        self.retry.increase();
        self.set_status(constants::WILL_RETRY);
        let delay = self.retry.current();
        debug!(delay_ms = delay.as_millis() as u64, cause, "scheduling session retry");
        let timer = self.handle.schedule(delay, move |engine| {
            if !engine.desired_connected {
                return;
            }
            engine.set_status(constants::CONNECTING);
            let kind = TransportKind::initial(engine.options.forced_transport());
            engine.open_create(kind, Some(cause), old_session);
        });
        if let Some(old) = self.retry_timer.replace(timer) {
            old.cancel();
        }
    }

    /// A stream died underneath an open session.
    fn on_stream_failed(&mut self, cause: &'static str) {
        if let Some(stream) = self.stream.as_mut() {
            stream.shutdown();
            stream.phase = StreamPhase::Sleep;
        }
        self.ws_control = None;
        if !self.desired_connected {
            self.teardown_session(false);
            self.set_status(constants::DISCONNECTED);
            return;
        }

        let recovery_budget = self.options.session_recovery_timeout();
        let now = crate::executor::now();
        let recoverable = self.session_open
            && self.session_id.is_some()
            && recovery_budget > Duration::ZERO
            && {
                self.recovery.start(now);
                self.recovery.time_left(recovery_budget, now) > Duration::ZERO
            };
        if recoverable {
            debug!(cause, "stream lost; trying recovery");
            self.set_status(constants::TRYING_RECOVERY);
            self.subscriptions.on_session_close(true);
            self.messages.on_session_close(true);
            let delay = self.options.first_retry_max_delay();
            let timer = self.handle.schedule(delay, |engine| engine.open_recovery_bind());
            if let Some(old) = self.retry_timer.replace(timer) {
                old.cancel();
            }
        } else {
            debug!(cause, "stream lost; recreating session");
            self.will_retry_create(cause);
        }
    }

    // -- Transport callbacks --------------------------------------------

    fn is_current(&self, stream_id: u64) -> bool {
        self.stream.as_ref().is_some_and(|s| s.id == stream_id)
    }

    pub(crate) fn on_stream_line(&mut self, stream_id: u64, line: &str) {
        if !self.is_current(stream_id) {
            return;
        }
        if line.is_empty() {
            return;
        }
        self.note_activity();
        match parse_line(line) {
            Ok(event) => self.route_event(event),
            Err(e) => {
                warn!(error = %e, "protocol error");
                self.on_stream_failed("protocol.error");
            }
        }
    }

    /// Bytes arrived: un-stall and re-arm the silence timers.
    fn note_activity(&mut self) {
        let (restore, kind) = match self.stream.as_mut() {
            Some(stream) => {
                let restore =
                    matches!(stream.phase, StreamPhase::Stalling | StreamPhase::Stalled);
                if restore {
                    stream.phase = StreamPhase::Receiving;
                }
                (restore, stream.kind)
            }
            None => return,
        };
        if restore {
            self.set_status(kind.status());
        }
        self.start_stall_timer();
    }

    fn start_stall_timer(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        if stream.kind.is_polling() || stream.keepalive_ms == 0 {
            return;
        }
        if !matches!(stream.phase, StreamPhase::Receiving | StreamPhase::Created) {
            return;
        }
        let stream_id = stream.id;
        let delay = Duration::from_millis(stream.keepalive_ms)
            + self.options.stalled_timeout();
        let timer = self
            .handle
            .schedule(delay, move |engine| engine.on_stall_step(stream_id));
        if let Some(old) = stream.stall_timer.replace(timer) {
            old.cancel();
        }
    }

    /// Walk RECEIVING → STALLING → STALLED → failure as silence
    /// persists.
    pub(crate) fn on_stall_step(&mut self, stream_id: u64) {
        if !self.is_current(stream_id) {
            return;
        }
        let next = {
            let Some(stream) = self.stream.as_mut() else {
                return;
            };
            match stream.phase {
                StreamPhase::Receiving => {
                    stream.phase = StreamPhase::Stalling;
                    Some(self.options.reconnect_timeout())
                }
                StreamPhase::Stalling => {
                    stream.phase = StreamPhase::Stalled;
                    Some(self.options.reconnect_timeout())
                }
                StreamPhase::Stalled => None,
                _ => return,
            }
        };
        match next {
            Some(delay) => {
                if self
                    .stream
                    .as_ref()
                    .is_some_and(|s| s.phase == StreamPhase::Stalled)
                {
                    self.set_status(constants::STALLED);
                }
                let timer = self
                    .handle
                    .schedule(delay, move |engine| engine.on_stall_step(stream_id));
                if let Some(stream) = self.stream.as_mut() {
                    if let Some(old) = stream.stall_timer.replace(timer) {
                        old.cancel();
                    }
                }
            }
            None => self.on_stream_failed("stalled"),
        }
    }

    pub(crate) fn on_transport_broken(&mut self, stream_id: u64) {
        if !self.is_current(stream_id) {
            return;
        }
        let phase = self.stream.as_ref().map(|s| s.phase);
        match phase {
            Some(StreamPhase::Creating) => {
                // Create never came up; stream-sense instead of
                // recovery (there is nothing to recover yet).
                self.on_connect_timeout(stream_id);
            }
            Some(p) if p.is_open() => self.on_stream_failed("network.error"),
            _ => {}
        }
    }

    pub(crate) fn on_transport_closed(&mut self, stream_id: u64) {
        if !self.is_current(stream_id) {
            return;
        }
        let phase = self.stream.as_ref().map(|s| s.phase);
        match phase {
            // Expected whenever a LOOP paused the stream.
            Some(StreamPhase::Pause | StreamPhase::FirstPause | StreamPhase::Sleep) => {}
            Some(p) if p.is_open() => self.on_stream_failed("server.close"),
            _ => {}
        }
    }

    /// Guard timer: no CONOK within the window.
    pub(crate) fn on_connect_timeout(&mut self, stream_id: u64) {
        if !self.is_current(stream_id) {
            return;
        }
        let (phase, kind, recovering) = match self.stream.as_ref() {
            Some(s) => (s.phase, s.kind, s.recovering_bind),
            None => return,
        };
        match phase {
            StreamPhase::Creating => {
                // Stream-sense: walk to the next transport/mode.
                if let Some(next) = kind.stream_sense_next(self.options.forced_transport()) {
                    info!(from = kind.status(), to = next.status(), "stream-sense switch");
                    if let Some(mut stream) = self.stream.take() {
                        stream.shutdown();
                    }
                    self.ws_control = None;
                    let old_session = self.session_id.clone();
                    self.open_create(next, Some("streamsense"), old_session);
                } else {
                    self.will_retry_create("connect.timeout");
                }
            }
            StreamPhase::FirstBinding | StreamPhase::Binding => {
                if recovering {
                    // The recovery attempt itself hung.
                    self.on_stream_failed("recovery.timeout");
                } else {
                    self.on_stream_failed("bind.timeout");
                }
            }
            _ => {}
        }
    }

    // -- Control-response plumbing (HTTP manager) -----------------------

    pub(crate) fn on_control_line(&mut self, line: &str) {
        if line.is_empty() {
            return;
        }
        match parse_line(line) {
            Ok(ProtocolEvent::Reqok { req_id }) => self.on_reqok(req_id),
            Ok(ProtocolEvent::Reqerr { req_id, code, message }) => {
                self.on_reqerr(req_id, code, &message);
            }
            Ok(ProtocolEvent::Error { code, message }) => self.on_fatal_error(code, &message),
            Ok(other) => debug!(?other, "unexpected line on control channel"),
            Err(e) => warn!(error = %e, "bad control response line"),
        }
    }

    pub(crate) fn on_control_batch_done(&mut self) {
        let control_base = self
            .base_address()
            .map(|a| Self::http_base(&a))
            .unwrap_or_default();
        let transport_options = self.transport_options(false);
        let mut env = SendEnv {
            codec: &self.codec,
            handle: &self.handle,
            inflight: &mut self.inflight,
            control_base,
            transport_options,
        };
        self.http.on_batch_complete(&mut env);
    }

    // -- Protocol event routing -----------------------------------------

    fn route_event(&mut self, event: ProtocolEvent) {
        if event.is_data_notification() {
            if self.recovery_skip > 0 {
                self.recovery_skip -= 1;
                debug!(remaining = self.recovery_skip, "dropping replayed notification");
                return;
            }
            self.data_prog += 1;
        }
        match event {
            ProtocolEvent::Conok { session_id, keepalive_ms, request_limit, control_link } => {
                self.on_conok(session_id, keepalive_ms, request_limit, control_link);
            }
            ProtocolEvent::Conerr { code, message } => self.on_conerr(code, &message),
            ProtocolEvent::ServerName(name) => {
                self.details.set_server_socket_name(Some(name));
            }
            ProtocolEvent::ClientIp(ip) => {
                self.details.set_client_ip(Some(ip));
            }
            ProtocolEvent::Sync { seconds } => self.on_sync(seconds),
            ProtocolEvent::Probe => {}
            ProtocolEvent::Loop { pause_ms } => self.on_loop(pause_ms),
            ProtocolEvent::End { code, message } => self.on_end(code, &message),
            ProtocolEvent::Update { sub_id, item, fields } => {
                let outgoing = self.subscriptions.on_update(sub_id, item, &fields);
                self.send_outgoing(outgoing);
            }
            ProtocolEvent::EndOfSnapshot { sub_id, item } => {
                self.subscriptions.on_end_of_snapshot(sub_id, item);
            }
            ProtocolEvent::ClearSnapshot { sub_id, item } => {
                let outgoing = self.subscriptions.on_clear_snapshot(sub_id, item);
                self.send_outgoing(outgoing);
            }
            ProtocolEvent::Overflow { sub_id, item, lost } => {
                self.subscriptions.on_lost_updates(sub_id, item, lost);
            }
            ProtocolEvent::Subok { sub_id, num_items, num_fields } => {
                self.subscriptions.on_subok(sub_id, num_items, num_fields);
            }
            ProtocolEvent::Subcmd { sub_id, num_items, num_fields, key_pos, cmd_pos } => {
                self.subscriptions.on_subcmd(sub_id, num_items, num_fields, key_pos, cmd_pos);
            }
            ProtocolEvent::Unsub { sub_id } => {
                let outgoing = self.subscriptions.on_unsub(sub_id);
                self.send_outgoing(outgoing);
            }
            ProtocolEvent::Constrain { bandwidth } => {
                self.pending_constrain = None;
                self.options.set_real_max_bandwidth(bandwidth);
            }
            ProtocolEvent::Configuration { sub_id, frequency } => {
                self.subscriptions.on_configuration(sub_id, frequency);
            }
            ProtocolEvent::Reqok { req_id } => self.on_reqok(req_id),
            ProtocolEvent::Reqerr { req_id, code, message } => {
                self.on_reqerr(req_id, code, &message);
            }
            ProtocolEvent::Error { code, message } => self.on_fatal_error(code, &message),
            ProtocolEvent::Msg { sequence, prog, outcome } => {
                self.on_msg_outcome(&sequence, prog, &outcome);
            }
            ProtocolEvent::Prog { prog } => self.on_prog(prog),
            ProtocolEvent::Noop => {}
        }
    }

    fn on_conok(
        &mut self,
        session_id: String,
        keepalive_ms: u64,
        request_limit: u64,
        control_link: Option<String>,
    ) {
        self.codec.set_default_session(Some(session_id.clone()));
        self.codec.set_request_limit(request_limit);
        self.session_id = Some(session_id.clone());
        self.details.set_session_id(Some(session_id));
        self.options.set_keepalive_interval_from_server(keepalive_ms);

        if let Some(link) = control_link {
            let full = if link.contains("://") {
                link
            } else {
                let scheme = self
                    .details
                    .server_address()
                    .and_then(|a| a.split_once("://").map(|(s, _)| s.to_owned()))
                    .unwrap_or_else(|| "http".to_owned());
                format!("{scheme}://{link}")
            };
            if !self.options.server_instance_address_ignored() {
                self.details.set_server_instance_address(Some(full.clone()));
                self.control_address = Some(full);
            }
        }

        enum AfterConok {
            Created,
            Bound { recovering: bool, status: &'static str, fresh_session: bool },
            Unexpected,
        }
        let after = {
            let Some(stream) = self.stream.as_mut() else {
                return;
            };
            stream.keepalive_ms = keepalive_ms;
            let recovering = stream.recovering_bind;
            match stream.phase {
                StreamPhase::Creating => {
                    stream.phase = StreamPhase::Created;
                    AfterConok::Created
                }
                StreamPhase::FirstBinding | StreamPhase::Binding => {
                    stream.phase = StreamPhase::Receiving;
                    stream.recovering_bind = false;
                    if !stream.kind.is_polling() {
                        stream.slowing.start_stream(crate::executor::now());
                    }
                    AfterConok::Bound {
                        recovering,
                        status: stream.kind.status(),
                        fresh_session: !self.session_open,
                    }
                }
                _ => AfterConok::Unexpected,
            }
        };
        match after {
            AfterConok::Created => {
                self.retry.reset(self.options.retry_delay());
                self.set_status(constants::STREAM_SENSING);
                self.on_session_started();
            }
            AfterConok::Bound { recovering, status, fresh_session } => {
                self.set_status(status);
                self.retry.reset(self.options.retry_delay());
                if recovering {
                    self.recovery.restore();
                    self.session_open = true;
                    info!("session recovered");
                } else if fresh_session {
                    self.on_session_started();
                }
                self.start_stall_timer();
            }
            AfterConok::Unexpected => debug!("CONOK in unexpected phase"),
        }
    }

    /// The control channel just became usable: flush subscriptions and
    /// queued messages.
    fn on_session_started(&mut self) {
        self.session_open = true;
        let mut outgoing = self.subscriptions.on_session_start();
        outgoing.extend(self.messages.on_session_start());
        self.send_outgoing(outgoing);
    }

    fn on_conerr(&mut self, code: i32, message: &str) {
        warn!(code, message, "session refused");
        if conerr_is_retriable(code) && self.desired_connected {
            self.will_retry_create("conerr");
        } else {
            self.on_fatal_error(code, message);
        }
    }

    fn on_end(&mut self, code: i32, message: &str) {
        info!(code, message, "session ended by server");
        if end_code_is_retriable(code) && self.desired_connected {
            self.will_retry_create("end");
        } else {
            self.on_fatal_error(code, message);
        }
    }

    fn on_fatal_error(&mut self, code: i32, message: &str) {
        self.desired_connected = false;
        self.teardown_session(false);
        self.set_status(constants::DISCONNECTED);
        self.fire_server_error(code, message);
    }

    fn on_sync(&mut self, seconds: u64) {
        let slow = {
            let Some(stream) = self.stream.as_mut() else {
                return;
            };
            if stream.kind.is_polling() || stream.phase != StreamPhase::Receiving {
                return;
            }
            stream.slowing.on_sync(seconds, crate::executor::now())
        };
        if slow && self.options.slowing_enabled() && self.pending_switch.is_none() {
            let Some(kind) = self.stream.as_ref().map(|s| s.kind) else {
                return;
            };
            info!("slow client detected; switching to polling");
            self.pending_switch = Some(kind.polling_variant());
            self.pending_force_rebind = true;
            let request = control::force_rebind(Some("slow"));
            self.send_control(
                ControlKind::ForceRebind,
                request,
                TutorContext::ForceRebind,
                Some(crate::constants::DEFAULT_FORCE_BIND_TIMEOUT),
            );
        }
    }

    fn on_loop(&mut self, pause_ms: u64) {
        self.pending_force_rebind = false;
        let stream_id = {
            let Some(stream) = self.stream.as_mut() else {
                return;
            };
            stream.cancel_timers();
            stream.phase = match stream.phase {
                StreamPhase::Created => StreamPhase::FirstPause,
                _ => StreamPhase::Pause,
            };
            if let Some(next) = self.pending_switch.take() {
                info!(to = next.status(), "rebinding in polling mode");
                stream.kind = next;
            }
            stream.id
        };
        if pause_ms == 0 {
            self.do_bind(stream_id);
        } else {
            let timer = self
                .handle
                .schedule(Duration::from_millis(pause_ms), move |engine| {
                    engine.do_bind(stream_id);
                });
            if let Some(stream) = self.stream.as_mut() {
                if let Some(old) = stream.connect_timer.replace(timer) {
                    old.cancel();
                }
            }
        }
    }

    fn on_prog(&mut self, prog: u64) {
        if self.awaiting_recovery_prog {
            self.awaiting_recovery_prog = false;
            if prog > self.data_prog {
                warn!(prog, local = self.data_prog, "server ahead of client after recovery");
                self.on_stream_failed("prog.mismatch");
                return;
            }
            self.recovery_skip = self.data_prog - prog;
            debug!(skip = self.recovery_skip, "recovery replay window");
        } else if prog != self.data_prog {
            warn!(prog, local = self.data_prog, "progress counter drift");
        }
    }

    fn on_msg_outcome(&mut self, sequence: &str, prog: u64, outcome: &MsgOutcome) {
        self.messages.on_outcome(sequence, prog, outcome);
    }

    fn on_reqok(&mut self, req_id: Option<u64>) {
        let Some(req_id) = req_id else {
            return;
        };
        let Some(tutor_id) = self.inflight.remove(&req_id) else {
            return;
        };
        let Some(mut tutor) = self.tutors.remove(&tutor_id) else {
            return;
        };
        tutor.abort();
        match tutor.context {
            TutorContext::Message { ref sequence, prog } => {
                let sequence = sequence.clone();
                self.messages.on_ack(&sequence, prog);
            }
            TutorContext::ChangeFrequency { sub_id, reconf_id, .. } => {
                self.subscriptions.on_reconf_ack(sub_id, reconf_id);
            }
            TutorContext::Unsubscribe { sub_id } => {
                self.subscriptions.on_unsubscribe_settled(sub_id);
            }
            _ => {}
        }
    }

    fn on_reqerr(&mut self, req_id: u64, code: i32, message: &str) {
        let Some(tutor_id) = self.inflight.remove(&req_id) else {
            return;
        };
        let Some(mut tutor) = self.tutors.remove(&tutor_id) else {
            return;
        };
        tutor.abort();
        match tutor.context {
            TutorContext::Subscribe { sub_id } => {
                self.subscriptions.on_subscription_error(sub_id, code, message);
            }
            TutorContext::Unsubscribe { sub_id } => {
                debug!(sub_id, code, message, "unsubscribe refused");
                self.subscriptions.on_unsubscribe_settled(sub_id);
            }
            TutorContext::ChangeFrequency { sub_id, reconf_id, .. } => {
                warn!(sub_id, code, message, "frequency change refused");
                self.subscriptions.on_reconf_ack(sub_id, reconf_id);
            }
            TutorContext::Message { ref sequence, prog } => {
                let sequence = sequence.clone();
                self.messages.on_request_error(&sequence, prog, code, message);
            }
            TutorContext::Constrain { .. } => {
                warn!(code, message, "constrain refused");
                self.pending_constrain = None;
            }
            TutorContext::ForceRebind => {
                warn!(code, message, "force rebind refused");
                self.pending_force_rebind = false;
                self.pending_switch = None;
            }
            TutorContext::Void => {}
        }
    }

    // -- Reverse heartbeat ----------------------------------------------

    fn schedule_heartbeat(&mut self) {
        let Some(delay) = self.heartbeat.next_delay(crate::executor::now()) else {
            return;
        };
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        if !stream.phase.is_open() {
            return;
        }
        let stream_id = stream.id;
        let delay = delay.max(Duration::from_millis(1));
        let timer = self
            .handle
            .schedule(delay, move |engine| engine.on_heartbeat_timer(stream_id));
        if let Some(old) = stream.heartbeat_timer.replace(timer) {
            old.cancel();
        }
    }

    pub(crate) fn on_heartbeat_timer(&mut self, stream_id: u64) {
        if !self.is_current(stream_id) || !self.session_open {
            return;
        }
        let user_ms = self.options.reverse_heartbeat_interval().as_millis() as u64;
        self.heartbeat.set_user_interval(user_ms);
        match self.heartbeat.next_delay(crate::executor::now()) {
            Some(delay) if delay <= Duration::from_millis(1) => {
                let with_unique = self.ws_control.is_none();
                let request = control::heartbeat(with_unique);
                self.send_control(
                    ControlKind::Heartbeat,
                    request,
                    TutorContext::Void,
                    Some(Duration::ZERO),
                );
                // arm_tutor notes the send and reschedules.
            }
            Some(_) | None => self.schedule_heartbeat(),
        }
    }
}

/// Transport listener for stream connections; hops every callback onto
/// the session thread tagged with its stream id.
struct StreamListener {
    handle: EngineHandle,
    stream_id: u64,
}

impl RequestListener for StreamListener {
    fn on_open(&mut self) {}

    fn on_message(&mut self, line: &str) {
        let stream_id = self.stream_id;
        let line = line.to_owned();
        self.handle.post(move |engine| engine.on_stream_line(stream_id, &line));
    }

    fn on_closed(&mut self) {
        let stream_id = self.stream_id;
        self.handle.post(move |engine| engine.on_transport_closed(stream_id));
    }

    fn on_broken(&mut self) {
        let stream_id = self.stream_id;
        self.handle.post(move |engine| engine.on_transport_broken(stream_id));
    }
}
