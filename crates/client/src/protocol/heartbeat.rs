// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reverse-heartbeat pacing.
//!
//! When the user configures a positive interval, a `heartbeat` request
//! goes out whenever the control channel has been silent for that
//! long, keeping NAT bindings and intermediaries alive. Binding a
//! stream freezes the declared ceiling (`LS_inactivity_millis`); from
//! then on the effective interval is the minimum of the ceiling and
//! the live user setting. Timer arming is done by the session; this
//! type only answers "when is the next beat due".

use std::time::{Duration, Instant};

pub(crate) struct ReverseHeartbeat {
    user_ms: u64,
    /// Ceiling declared on bind; 0 until a stream declared one.
    max_ms: u64,
    last_sent: Option<Instant>,
}

impl ReverseHeartbeat {
    pub fn new(user_ms: u64) -> Self {
        Self { user_ms, max_ms: 0, last_sent: None }
    }

    /// A stream was bound declaring `max_ms` as `LS_inactivity_millis`
    /// (0 when none was declared). Resets the silence clock.
    pub fn on_bind(&mut self, max_ms: u64, now: Instant) {
        self.max_ms = max_ms;
        self.last_sent = Some(now);
    }

    /// The user changed `reverseHeartbeatInterval`.
    pub fn set_user_interval(&mut self, user_ms: u64) {
        self.user_ms = user_ms;
    }

    /// Effective interval, `None` when heartbeats are off.
    ///
    /// Once a bind declared a ceiling the server expects traffic at
    /// that cadence, so heartbeats stay on even if the user setting
    /// drops to 0 afterwards.
    pub fn effective_ms(&self) -> Option<u64> {
        match (self.user_ms, self.max_ms) {
            (0, 0) => None,
            (user, 0) => Some(user),
            (0, max) => Some(max),
            (user, max) => Some(user.min(max)),
        }
    }

    /// Any control request (heartbeats included) hit the wire.
    pub fn note_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }

    /// Time until the next beat is due: `Duration::ZERO` means send
    /// now, `None` means heartbeats are disabled.
    pub fn next_delay(&self, now: Instant) -> Option<Duration> {
        let interval = Duration::from_millis(self.effective_ms()?);
        let Some(last) = self.last_sent else {
            return Some(interval);
        };
        let elapsed = now.saturating_duration_since(last);
        Some(interval.saturating_sub(elapsed))
    }
}

#[cfg(test)]
#[path = "heartbeat_tests.rs"]
mod tests;
