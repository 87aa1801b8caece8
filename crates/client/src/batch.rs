// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-request batching.
//!
//! Requests wait in four lanes: user messages, reverse heartbeats,
//! ordinary controls, and destroys (which may target the server a
//! session moved away from). Within the control lane a replacement key
//! keeps only the newest of competing requests; the displaced tutor is
//! reported back so its retransmission stops. Batches are assembled
//! round-robin between non-empty lanes up to the server-imposed
//! request-length limit.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

use crate::request::Request;

/// A request waiting in a lane, paired with its tutor.
pub(crate) struct PendingRequest {
    pub request: Request,
    pub tutor_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lane {
    Message,
    Heartbeat,
    Control,
    Destroy,
}

const LANES: [Lane; 4] = [Lane::Message, Lane::Heartbeat, Lane::Control, Lane::Destroy];

/// One assembled batch: requests of one lane sharing a verb and target.
pub(crate) struct Batch {
    pub lane: Lane,
    pub requests: Vec<PendingRequest>,
}

#[derive(Default)]
struct LaneQueue {
    order: VecDeque<String>,
    by_key: HashMap<String, PendingRequest>,
    next_seq: u64,
}

impl LaneQueue {
    fn push_seq(&mut self, pending: PendingRequest) {
        let key = self.next_seq.to_string();
        self.next_seq += 1;
        self.order.push_back(key.clone());
        self.by_key.insert(key, pending);
    }

    /// Insert under `key`, replacing any pending holder of the same
    /// key. Returns the displaced tutor id.
    fn push_keyed(&mut self, key: String, pending: PendingRequest) -> Option<u64> {
        match self.by_key.insert(key.clone(), pending) {
            Some(old) => Some(old.tutor_id),
            None => {
                self.order.push_back(key);
                None
            }
        }
    }

    fn pop(&mut self) -> Option<PendingRequest> {
        let key = self.order.pop_front()?;
        self.by_key.remove(&key)
    }

    fn peek(&self) -> Option<&PendingRequest> {
        self.order.front().and_then(|k| self.by_key.get(k))
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn drain(&mut self) -> Vec<PendingRequest> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(p) = self.pop() {
            out.push(p);
        }
        out
    }
}

#[derive(Default)]
pub(crate) struct Batcher {
    message: LaneQueue,
    heartbeat: LaneQueue,
    control: LaneQueue,
    destroy: LaneQueue,
    /// Round-robin cursor: index into `LANES` of the lane served last.
    cursor: usize,
}

impl Batcher {
    fn lane_mut(&mut self, lane: Lane) -> &mut LaneQueue {
        match lane {
            Lane::Message => &mut self.message,
            Lane::Heartbeat => &mut self.heartbeat,
            Lane::Control => &mut self.control,
            Lane::Destroy => &mut self.destroy,
        }
    }

    fn lane(&self, lane: Lane) -> &LaneQueue {
        match lane {
            Lane::Message => &self.message,
            Lane::Heartbeat => &self.heartbeat,
            Lane::Control => &self.control,
            Lane::Destroy => &self.destroy,
        }
    }

    pub fn add_message(&mut self, pending: PendingRequest) {
        self.message.push_seq(pending);
    }

    pub fn add_heartbeat(&mut self, pending: PendingRequest) {
        self.heartbeat.push_seq(pending);
    }

    /// A subscribe for a sub-id. A repeat while one is still pending is
    /// unexpected; the older request is dropped.
    pub fn add_subscribe(&mut self, sub_id: u64, pending: PendingRequest) -> Option<u64> {
        let replaced = self.control.push_keyed(sub_id.to_string(), pending);
        if replaced.is_some() {
            warn!(sub_id, "pending subscribe replaced by a newer one");
        }
        replaced
    }

    /// An unsubscribe supersedes a pending subscribe for the same id.
    pub fn add_unsubscribe(&mut self, sub_id: u64, pending: PendingRequest) -> Option<u64> {
        let replaced = self.control.push_keyed(sub_id.to_string(), pending);
        if replaced.is_some() {
            debug!(sub_id, "pending subscribe superseded by unsubscribe");
        }
        replaced
    }

    /// Frequency changes are keyed apart from add/delete: a newer one
    /// replaces only an older pending change for the same id.
    pub fn add_change_frequency(&mut self, sub_id: u64, pending: PendingRequest) -> Option<u64> {
        self.control.push_keyed(format!("X{sub_id}"), pending)
    }

    /// Bandwidth constraints occupy a single slot; last wins.
    pub fn add_constrain(&mut self, pending: PendingRequest) -> Option<u64> {
        self.control.push_keyed("C".to_owned(), pending)
    }

    /// Force-rebinds occupy a single slot; last wins.
    pub fn add_force_rebind(&mut self, pending: PendingRequest) -> Option<u64> {
        self.control.push_keyed("F".to_owned(), pending)
    }

    /// Destroys are keyed by the session they tear down.
    pub fn add_destroy(&mut self, session_id: &str, pending: PendingRequest) -> Option<u64> {
        self.destroy.push_keyed(session_id.to_owned(), pending)
    }

    /// Drop a pending control request by its replacement key, if still
    /// queued. Returns the tutor of the dropped request.
    pub fn remove_change_frequency(&mut self, sub_id: u64) -> Option<u64> {
        let key = format!("X{sub_id}");
        let removed = self.control.by_key.remove(&key)?;
        self.control.order.retain(|k| k != &key);
        Some(removed.tutor_id)
    }

    pub fn is_empty(&self) -> bool {
        LANES.iter().all(|l| self.lane(*l).is_empty())
    }

    pub fn pending_count(&self) -> usize {
        LANES.iter().map(|l| self.lane(*l).len()).sum()
    }

    pub fn has_destroys(&self) -> bool {
        !self.destroy.is_empty()
    }

    /// Pull every pending request out, in lane-then-arrival order. Used
    /// when pending work migrates to a new stream session.
    pub fn drain_all(&mut self) -> Vec<(Lane, PendingRequest)> {
        let mut out = Vec::new();
        for lane in LANES {
            for p in self.lane_mut(lane).drain() {
                out.push((lane, p));
            }
        }
        out
    }

    /// Assemble the next batch, round-robin between non-empty lanes.
    ///
    /// The first request fixes the verb and (for destroys) the target
    /// server; more requests of the same lane are appended while the
    /// combined body stays under `limit`. A request that alone exceeds
    /// the limit is sent alone. Heartbeats never share a batch.
    pub fn next_batch(&mut self, limit: Option<usize>) -> Option<Batch> {
        let lane = self.next_lane()?;
        let queue = self.lane_mut(lane);
        let first = queue.pop()?;
        let mut body_len = first.request.length_estimate();
        let target = first.request.server().map(str::to_owned);
        let mut requests = vec![first];

        if lane != Lane::Heartbeat {
            while let Some(next) = queue.peek() {
                let added = next.request.length_estimate() + 2;
                if let Some(limit) = limit {
                    if body_len + added > limit {
                        break;
                    }
                }
                if next.request.server().map(str::to_owned) != target {
                    break;
                }
                body_len += added;
                match queue.pop() {
                    Some(p) => requests.push(p),
                    None => break,
                }
            }
        }

        Some(Batch { lane, requests })
    }

    fn next_lane(&mut self) -> Option<Lane> {
        for step in 1..=LANES.len() {
            let idx = (self.cursor + step) % LANES.len();
            if !self.lane(LANES[idx]).is_empty() {
                self.cursor = idx;
                return Some(LANES[idx]);
            }
        }
        None
    }
}

#[cfg(test)]
#[path = "batch_tests.rs"]
mod tests;
