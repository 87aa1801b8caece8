// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP control-request manager.
//!
//! Exactly one control connection is in flight at a time: batches are
//! serialized as `\r\n`-joined bodies, the response carries one
//! REQOK/REQERR line per enclosed request, and completion triggers the
//! next dequeue. Destroys target the server their session lives on,
//! which may differ from the current one after a control-link move.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::batch::{Batcher, Lane, PendingRequest};
use crate::constants::{SERVER_PATH, TLCP_VERSION};
use crate::request::Request;
use crate::transport::{HttpTransport, RequestHandle, RequestListener, StreamRequest};

use super::{ControlKind, ManagerPhase, SendEnv};

pub(crate) struct HttpRequestManager {
    transport: Arc<dyn HttpTransport>,
    phase: ManagerPhase,
    batcher: Batcher,
    in_flight: Option<RequestHandle>,
    in_flight_has_destroys: bool,
}

impl HttpRequestManager {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            phase: ManagerPhase::Idle,
            batcher: Batcher::default(),
            in_flight: None,
            in_flight_has_destroys: false,
        }
    }

    /// Queue a request; when idle, dequeue one batch immediately.
    /// Returns the tutor displaced by a replacement key, if any.
    pub fn add(
        &mut self,
        kind: &ControlKind,
        request: Request,
        tutor_id: u64,
        env: &mut SendEnv<'_>,
    ) -> Option<u64> {
        if matches!(self.phase, ManagerPhase::End | ManagerPhase::Ending) {
            debug!("control manager closing; request dropped");
            return Some(tutor_id);
        }
        let pending = PendingRequest { request, tutor_id };
        let replaced = match kind {
            ControlKind::Message => {
                self.batcher.add_message(pending);
                None
            }
            ControlKind::Heartbeat => {
                self.batcher.add_heartbeat(pending);
                None
            }
            ControlKind::Subscribe(sub_id) => self.batcher.add_subscribe(*sub_id, pending),
            ControlKind::Unsubscribe(sub_id) => self.batcher.add_unsubscribe(*sub_id, pending),
            ControlKind::ChangeFrequency(sub_id) => {
                self.batcher.add_change_frequency(*sub_id, pending)
            }
            ControlKind::Constrain => self.batcher.add_constrain(pending),
            ControlKind::ForceRebind => self.batcher.add_force_rebind(pending),
            ControlKind::Destroy(session_id) => self.batcher.add_destroy(session_id, pending),
        };
        self.try_dequeue(env);
        replaced
    }

    /// Drop a queued frequency change (its subscription is going away).
    pub fn cancel_change_frequency(&mut self, sub_id: u64) -> Option<u64> {
        self.batcher.remove_change_frequency(sub_id)
    }

    /// Send the next batch when the channel is free.
    pub fn try_dequeue(&mut self, env: &mut SendEnv<'_>) {
        if self.phase != ManagerPhase::Idle || self.batcher.is_empty() {
            return;
        }
        let Some(batch) = self.batcher.next_batch(env.codec.request_limit()) else {
            return;
        };

        let endpoint = match batch.lane {
            Lane::Message => "msg.txt",
            Lane::Heartbeat => "heartbeat.txt",
            Lane::Control | Lane::Destroy => "control.txt",
        };
        // Destroys follow their session to the server it lives on.
        let base = batch.requests[0]
            .request
            .server()
            .map(|s| format!("{}{}", s.trim_end_matches('/'), SERVER_PATH))
            .unwrap_or_else(|| env.control_base.clone());
        let url = format!("{base}/{endpoint}?LS_protocol={TLCP_VERSION}");

        let body = env.codec.batch_body(batch.requests.iter().map(|p| &p.request));
        for pending in &batch.requests {
            if let Some(req_id) = pending.request.req_id() {
                env.inflight.insert(req_id, pending.tutor_id);
            }
        }
        let sent: Vec<u64> = batch.requests.iter().map(|p| p.tutor_id).collect();

        debug!(url = %url, requests = batch.requests.len(), "control batch out");
        let handle = self.transport.send_request(
            StreamRequest { url, body },
            Box::new(BatchListener { handle: env.handle.clone() }),
            &env.transport_options,
        );
        self.in_flight = Some(handle);
        self.in_flight_has_destroys = batch.lane == Lane::Destroy;
        self.phase = ManagerPhase::Waiting;

        // Arm retransmission only once the batch is actually out.
        let handle = env.handle.clone();
        handle.post(move |engine| {
            for tutor_id in sent {
                engine.arm_tutor(tutor_id);
            }
        });
    }

    /// The in-flight control connection finished (orderly or not).
    pub fn on_batch_complete(&mut self, env: &mut SendEnv<'_>) {
        self.in_flight = None;
        self.in_flight_has_destroys = false;
        match self.phase {
            ManagerPhase::Waiting => {
                self.phase = ManagerPhase::Idle;
                self.try_dequeue(env);
            }
            ManagerPhase::Ending => {
                self.phase = ManagerPhase::End;
            }
            ManagerPhase::Idle | ManagerPhase::End => {
                warn!("control batch completion in unexpected phase");
            }
        }
    }

    /// Close the manager. With `wait_pending` an in-flight batch is
    /// allowed to finish; otherwise the connection is dropped now
    /// (unless it carries destroys, which must reach the server).
    /// Returns the tutors of every request still queued.
    pub fn close(&mut self, wait_pending: bool) -> Vec<u64> {
        if wait_pending && self.in_flight.is_some() {
            self.phase = ManagerPhase::Ending;
        } else {
            if let Some(handle) = self.in_flight.take() {
                if !self.in_flight_has_destroys {
                    handle.close(true);
                }
            }
            self.phase = ManagerPhase::End;
        }
        self.batcher.drain_all().into_iter().map(|(_, p)| p.tutor_id).collect()
    }
}

/// Routes control-response lines back onto the session thread.
struct BatchListener {
    handle: crate::session::EngineHandle,
}

impl RequestListener for BatchListener {
    fn on_message(&mut self, line: &str) {
        let line = line.to_owned();
        self.handle.post(move |engine| engine.on_control_line(&line));
    }

    fn on_closed(&mut self) {
        self.handle.post(|engine| engine.on_control_batch_done());
    }

    fn on_broken(&mut self) {
        // Tutors cover the retransmission; just free the channel.
        self.handle.post(|engine| engine.on_control_batch_done());
    }
}
