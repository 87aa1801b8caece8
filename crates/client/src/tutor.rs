// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Retransmission tutors.
//!
//! Every control request gets a tutor that arms a timer on send. When
//! the timer fires the engine consults the owning subsystem (did an
//! acknowledgement arrive meanwhile?) and this module's pure verdict
//! function decides between dropping the tutor, resending the request,
//! or rescheduling with a doubled timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::config::Bandwidth;
use crate::executor::TimerHandle;
use crate::manager::ControlKind;
use crate::request::Request;
use crate::subscription::MaxFrequency;

/// Floor for the growing retransmission timeout.
pub(crate) const MIN_TIMEOUT: Duration = Duration::from_millis(4000);

pub(crate) fn next_tutor_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// What a tutor's request was trying to accomplish; consulted on
/// timeout to ask the owner whether the request already succeeded, and
/// on REQERR to route the failure.
#[derive(Debug, Clone)]
pub(crate) enum TutorContext {
    Subscribe { sub_id: u64 },
    Unsubscribe { sub_id: u64 },
    ChangeFrequency { sub_id: u64, reconf_id: u64, frequency: MaxFrequency },
    Constrain { bandwidth: Bandwidth },
    ForceRebind,
    Message { sequence: String, prog: u64 },
    /// No retransmission and no owner: destroys and heartbeats.
    Void,
}

/// Per-request retransmission state. Keeps the request itself so a
/// resend re-enters the dispatch path byte-identical (same `LS_reqId`;
/// the server deduplicates).
pub(crate) struct Tutor {
    pub id: u64,
    pub context: TutorContext,
    pub kind: ControlKind,
    pub request: Request,
    /// Stream session the request was last written to; a mismatch with
    /// the current stream means a switch happened underneath it.
    pub stream_id: u64,
    pub timeout: Duration,
    fixed: bool,
    pub timer: Option<TimerHandle>,
    pub discarded: bool,
}

impl Tutor {
    /// Tutor with the growing timeout: `max(4000, 2 × last)`.
    pub fn growing(
        context: TutorContext,
        kind: ControlKind,
        request: Request,
        stream_id: u64,
        last_timeout: Option<Duration>,
    ) -> Self {
        let timeout = match last_timeout {
            Some(last) if last * 2 > MIN_TIMEOUT => last * 2,
            _ => MIN_TIMEOUT,
        };
        Self {
            id: next_tutor_id(),
            context,
            kind,
            request,
            stream_id,
            timeout,
            fixed: false,
            timer: None,
            discarded: false,
        }
    }

    /// Tutor whose timeout never grows (frequency changes, heartbeats).
    pub fn fixed(
        context: TutorContext,
        kind: ControlKind,
        request: Request,
        stream_id: u64,
        timeout: Duration,
    ) -> Self {
        Self {
            id: next_tutor_id(),
            context,
            kind,
            request,
            stream_id,
            timeout,
            fixed: true,
            timer: None,
            discarded: false,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self.context, TutorContext::Void)
    }

    /// Called when the request is superseded before hitting the wire
    /// (batch replacement) or the manager shuts down.
    pub fn abort(&mut self) {
        self.discarded = true;
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

/// Session facts the verdict depends on, gathered by the engine at the
/// moment the timer fires.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimeoutEnv {
    /// The owner observed an acknowledgement for this request.
    pub succeeded: bool,
    /// The logical session is gone.
    pub session_closed: bool,
    /// The control channel currently runs over HTTP.
    pub transport_http: bool,
    /// The current stream session is still the one the request was
    /// written to.
    pub same_stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeoutVerdict {
    /// Done: acknowledged, aborted, or pointless.
    Discard,
    /// Put the request back on the wire.
    Resend,
    /// Still plausible in flight; check again after the new timeout.
    Reschedule(Duration),
}

/// The retransmission decision, as a pure function.
pub(crate) fn timeout_verdict(tutor: &Tutor, env: TimeoutEnv) -> TimeoutVerdict {
    if tutor.discarded || env.succeeded {
        return TimeoutVerdict::Discard;
    }
    if env.session_closed {
        return TimeoutVerdict::Discard;
    }
    if env.transport_http || matches!(tutor.context, TutorContext::ForceRebind) {
        // HTTP gives no per-frame delivery signal; always retry.
        return TimeoutVerdict::Resend;
    }
    if !env.same_stream {
        // The frame may have died with the old socket.
        return TimeoutVerdict::Resend;
    }
    let next = if tutor.fixed { tutor.timeout } else { tutor.timeout * 2 };
    TimeoutVerdict::Reschedule(next)
}

#[cfg(test)]
#[path = "tutor_tests.rs"]
mod tests;
