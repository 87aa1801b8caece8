// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sequenced user-message submission.
//!
//! Messages on a named sequence get contiguous progressive numbers
//! starting at 1 and are retransmitted by their tutors until the
//! server settles them. `UNORDERED_MESSAGES` makes no ordering demands
//! and, without a listener, is pure fire-and-forget. An error outcome
//! aborts every later message still pending on the same sequence.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::constants::UNORDERED_MESSAGES;
use crate::error::ClientError;
use crate::executor::Executor;
use crate::listener::ClientMessageListener;
use crate::manager::ControlKind;
use crate::protocol::MsgOutcome;
use crate::request::message as msg_request;
use crate::subscription::Outgoing;
use crate::tutor::TutorContext;

struct PendingMessage {
    text: String,
    prog: u64,
    listener: Option<Arc<dyn ClientMessageListener>>,
    delay_ms: i64,
    /// Whether the request was handed to a transport at least once.
    sent_on_network: bool,
}

#[derive(Default)]
struct SequenceState {
    next_prog: u64,
    pending: BTreeMap<u64, PendingMessage>,
}

/// A message accepted while no session was open
/// (`enqueueWhileDisconnected`).
struct QueuedMessage {
    text: String,
    sequence: String,
    delay_ms: i64,
    listener: Option<Arc<dyn ClientMessageListener>>,
}

pub(crate) struct MessageManager {
    events: Executor,
    sequences: HashMap<String, SequenceState>,
    offline_queue: Vec<QueuedMessage>,
}

fn valid_sequence_name(name: &str) -> bool {
    name == UNORDERED_MESSAGES
        || (!name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_'))
}

impl MessageManager {
    pub fn new(events: Executor) -> Self {
        Self { events, sequences: HashMap::new(), offline_queue: Vec::new() }
    }

    fn fire<F>(&self, listener: &Option<Arc<dyn ClientMessageListener>>, f: F)
    where
        F: FnOnce(&dyn ClientMessageListener) + Send + 'static,
    {
        if let Some(listener) = listener.clone() {
            self.events.queue(move || f(&*listener));
        }
    }

    /// Submit one message. Returns the request to send, if a session
    /// is open; queues or aborts otherwise per
    /// `enqueue_while_disconnected`. An empty sequence name selects
    /// the unordered default.
    pub fn send(
        &mut self,
        text: &str,
        sequence: &str,
        delay_ms: i64,
        listener: Option<Arc<dyn ClientMessageListener>>,
        enqueue_while_disconnected: bool,
        session_open: bool,
    ) -> Result<Option<Outgoing>, ClientError> {
        let sequence = if sequence.is_empty() { UNORDERED_MESSAGES } else { sequence };
        if !valid_sequence_name(sequence) {
            return Err(ClientError::argument(format!(
                "sequence names are alphanumeric/underscore: {sequence:?}"
            )));
        }
        if !session_open {
            if enqueue_while_disconnected {
                self.offline_queue.push(QueuedMessage {
                    text: text.to_owned(),
                    sequence: sequence.to_owned(),
                    delay_ms,
                    listener,
                });
                return Ok(None);
            }
            let text = text.to_owned();
            self.fire(&listener, move |l| l.on_abort(&text, false));
            return Ok(None);
        }
        Ok(Some(self.enqueue(text, sequence, delay_ms, listener)))
    }

    fn enqueue(
        &mut self,
        text: &str,
        sequence: &str,
        delay_ms: i64,
        listener: Option<Arc<dyn ClientMessageListener>>,
    ) -> Outgoing {
        let state = self.sequences.entry(sequence.to_owned()).or_default();
        state.next_prog += 1;
        let prog = state.next_prog;
        let has_listener = listener.is_some();
        state.pending.insert(
            prog,
            PendingMessage {
                text: text.to_owned(),
                prog,
                listener,
                delay_ms,
                sent_on_network: false,
            },
        );
        debug!(sequence, prog, "message enqueued");
        let request = msg_request::message(text, sequence, prog, delay_ms, has_listener, true);
        Outgoing {
            kind: ControlKind::Message,
            request,
            context: TutorContext::Message { sequence: sequence.to_owned(), prog },
            fixed_timeout: None,
        }
    }

    /// A session opened: flush everything accepted while disconnected.
    pub fn on_session_start(&mut self) -> Vec<Outgoing> {
        let queued = std::mem::take(&mut self.offline_queue);
        queued
            .into_iter()
            .map(|m| self.enqueue(&m.text, &m.sequence, m.delay_ms, m.listener))
            .collect()
    }

    /// The session died. Unless a recovery is in progress, every
    /// pending message aborts.
    pub fn on_session_close(&mut self, recovering: bool) {
        if recovering {
            return;
        }
        for (_, state) in self.sequences.drain() {
            for (_, message) in state.pending {
                let text = message.text;
                let sent = message.sent_on_network;
                if let Some(listener) = message.listener {
                    self.events.queue(move || listener.on_abort(&text, sent));
                }
            }
        }
    }

    /// The request hit the wire (used for abort reporting).
    pub fn on_sent(&mut self, sequence: &str, prog: u64) {
        if let Some(message) =
            self.sequences.get_mut(sequence).and_then(|s| s.pending.get_mut(&prog))
        {
            message.sent_on_network = true;
        }
    }

    /// Server outcome for one message.
    pub fn on_outcome(&mut self, sequence: &str, prog: u64, outcome: &MsgOutcome) {
        let Some(state) = self.sequences.get_mut(sequence) else {
            debug!(sequence, prog, "outcome for unknown sequence");
            return;
        };
        let Some(message) = state.pending.remove(&prog) else {
            debug!(sequence, prog, "outcome for settled message");
            return;
        };
        let text = message.text.clone();
        match outcome {
            MsgOutcome::Processed => self.fire(&message.listener, move |l| l.on_processed(&text)),
            MsgOutcome::Discarded => self.fire(&message.listener, move |l| l.on_discarded(&text)),
            MsgOutcome::Deny { code, message: error } => {
                let code = *code;
                let error = error.clone();
                self.fire(&message.listener, move |l| l.on_deny(&text, code, &error));
            }
            MsgOutcome::Error { code, message: error } => {
                warn!(sequence, prog, code, error = %error, "message sequence aborted");
                self.fire(&message.listener, move |l| l.on_error(&text));
                self.abort_after(sequence, prog);
            }
        }
    }

    /// REQOK for a message: the server has it. Messages that asked for
    /// no outcome are settled here; the rest wait for their MSG line.
    pub fn on_ack(&mut self, sequence: &str, prog: u64) {
        let Some(state) = self.sequences.get_mut(sequence) else {
            return;
        };
        let settle_now = matches!(
            state.pending.get(&prog),
            Some(message) if message.listener.is_none()
        );
        if settle_now {
            state.pending.remove(&prog);
        }
    }

    /// REQERR for a message: it never reached processing.
    pub fn on_request_error(&mut self, sequence: &str, prog: u64, code: i32, error: &str) {
        debug!(sequence, prog, code, error, "message refused");
        let Some(state) = self.sequences.get_mut(sequence) else {
            return;
        };
        if let Some(message) = state.pending.remove(&prog) {
            let text = message.text;
            self.fire(&message.listener, move |l| l.on_error(&text));
        }
        self.abort_after(sequence, prog);
    }

    /// An error on `prog` kills everything later in the sequence.
    /// Unordered messages are independent of each other, so no cascade
    /// applies there.
    fn abort_after(&mut self, sequence: &str, prog: u64) {
        if sequence == UNORDERED_MESSAGES {
            return;
        }
        let Some(state) = self.sequences.get_mut(sequence) else {
            return;
        };
        let later: Vec<u64> = state.pending.range(prog + 1..).map(|(p, _)| *p).collect();
        let mut removed = Vec::new();
        for p in later {
            if let Some(message) = state.pending.remove(&p) {
                removed.push(message);
            }
        }
        for message in removed {
            let text = message.text;
            let sent = message.sent_on_network;
            self.fire(&message.listener, move |l| l.on_abort(&text, sent));
        }
    }

    // -- Tutor verification ---------------------------------------------

    /// A message is settled once it leaves the pending map.
    pub fn message_settled(&self, sequence: &str, prog: u64) -> bool {
        match self.sequences.get(sequence) {
            Some(state) => !state.pending.contains_key(&prog),
            None => true,
        }
    }

    /// Resend payload for a tutor retry.
    pub fn resend_request(&self, sequence: &str, prog: u64) -> Option<Outgoing> {
        let message = self.sequences.get(sequence)?.pending.get(&prog)?;
        let request = msg_request::message(
            &message.text,
            sequence,
            message.prog,
            message.delay_ms,
            message.listener.is_some(),
            true,
        );
        Some(Outgoing {
            kind: ControlKind::Message,
            request,
            context: TutorContext::Message { sequence: sequence.to_owned(), prog },
            fixed_timeout: None,
        })
    }

    pub fn has_pending(&self) -> bool {
        self.sequences.values().any(|s| !s.pending.is_empty())
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
