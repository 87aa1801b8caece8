// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Slow-client detection from SYNC drift.
//!
//! Each SYNC carries the seconds elapsed server-side since the stream
//! started. The difference against the client's own clock estimates
//! how far behind the client is at draining the stream; an
//! exponentially smoothed mean of that drift decides when streaming
//! should yield to polling. A single enormous jump is attributed to
//! machine standby/hibernation and tolerated once.

use std::time::Instant;

use tracing::{debug, info};

use crate::constants::{
    SLOWING_HUGE_DELAY_FLOOR_MS, SLOWING_IGNORE_JUMP_MS, SLOWING_MAX_MEAN_MS, SLOWING_MOMENTUM,
};

pub(crate) struct SlowingHandler {
    ref_time: Option<Instant>,
    mean_ms: f64,
    first_done: bool,
    huge_flag: bool,
}

impl SlowingHandler {
    pub fn new() -> Self {
        Self { ref_time: None, mean_ms: 0.0, first_done: false, huge_flag: false }
    }

    /// A new stream started; drift accumulates from here.
    pub fn start_stream(&mut self, now: Instant) {
        self.ref_time = Some(now);
        self.mean_ms = 0.0;
        self.first_done = false;
        self.huge_flag = false;
    }

    /// Smoothed drift, used to widen declared polling intervals so the
    /// server paces the poll loop to what the client can drain.
    pub fn delay_ms(&self) -> i64 {
        if self.first_done && self.mean_ms > 0.0 {
            self.mean_ms.floor() as i64
        } else {
            0
        }
    }

    /// Feed one SYNC. Returns true when the smoothed drift says the
    /// client cannot keep up with streaming.
    pub fn on_sync(&mut self, server_seconds: u64, now: Instant) -> bool {
        let Some(ref_time) = self.ref_time else {
            return false;
        };
        let elapsed_ms = now.saturating_duration_since(ref_time).as_millis() as f64;
        let drift = elapsed_ms - (server_seconds * 1000) as f64;

        if !self.first_done {
            self.first_done = true;
            self.mean_ms = drift;
            return false;
        }

        if drift > SLOWING_IGNORE_JUMP_MS && drift > self.mean_ms * 2.0 {
            self.huge_flag = !self.huge_flag;
            if self.huge_flag {
                info!(drift_ms = drift as i64, "huge sync drift; restored from standby?");
                return self.mean_ms > SLOWING_MAX_MEAN_MS;
            }
        }

        self.mean_ms = self.mean_ms * SLOWING_MOMENTUM + drift * (1.0 - SLOWING_MOMENTUM);
        if self.mean_ms < SLOWING_HUGE_DELAY_FLOOR_MS {
            self.mean_ms = 0.0;
        }
        debug!(mean_ms = self.mean_ms as i64, "sync drift");
        self.mean_ms > SLOWING_MAX_MEAN_MS
    }
}

#[cfg(test)]
#[path = "slowing_tests.rs"]
mod tests;
