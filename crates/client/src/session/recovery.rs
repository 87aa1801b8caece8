// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Recovery budget tracking.
//!
//! When a stream connection breaks, the client may try to resume the
//! logical session from the last observed progress counter. The bean
//! remembers when the first failure happened so the whole recovery —
//! across any number of attempts — stays inside
//! `sessionRecoveryTimeout`.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub(crate) struct RecoveryBean {
    /// Set while the next bind is a recovery attempt for a broken
    /// session.
    recovering: bool,
    started_at: Option<Instant>,
}

impl RecoveryBean {
    pub fn new() -> Self {
        Self { recovering: false, started_at: None }
    }

    /// A stream broke and recovery begins; the clock starts on the
    /// first failure only and keeps running across nested attempts.
    pub fn start(&mut self, now: Instant) {
        if !self.recovering {
            self.recovering = true;
            self.started_at = Some(now);
        }
    }

    /// Recovery succeeded (or was abandoned): full budget restored.
    pub fn restore(&mut self) {
        self.recovering = false;
        self.started_at = None;
    }

    pub fn recovering(&self) -> bool {
        self.recovering
    }

    /// Budget left before the session must be given up and recreated.
    pub fn time_left(&self, max: Duration, now: Instant) -> Duration {
        match self.started_at {
            Some(start) if self.recovering => {
                max.saturating_sub(now.saturating_duration_since(start))
            }
            _ => max,
        }
    }
}

#[cfg(test)]
#[path = "recovery_tests.rs"]
mod tests;
