// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! User-facing listener capabilities.
//!
//! Every method has a no-op default so implementors override only what
//! they need. All callbacks are dispatched on the events thread; a
//! slow or panicking listener never disturbs protocol state.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::item_update::ItemUpdate;

/// Frequency limit reported by the server for a subscription.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RealMaxFrequency {
    Unlimited,
    Limited(f64),
}

/// Client-lifecycle events.
pub trait ClientListener: Send + Sync {
    fn on_status_change(&self, _status: &str) {}
    fn on_server_error(&self, _code: i32, _message: &str) {}
    fn on_property_change(&self, _property: &str) {}
    fn on_listen_start(&self) {}
    fn on_listen_end(&self) {}
}

/// Subscription-lifecycle and data events.
pub trait SubscriptionListener: Send + Sync {
    fn on_subscription(&self) {}
    fn on_unsubscription(&self) {}
    fn on_subscription_error(&self, _code: i32, _message: &str) {}
    fn on_item_update(&self, _update: &ItemUpdate) {}
    fn on_end_of_snapshot(&self, _item_name: Option<&str>, _item_pos: usize) {}
    fn on_clear_snapshot(&self, _item_name: Option<&str>, _item_pos: usize) {}
    fn on_item_lost_updates(&self, _item_name: Option<&str>, _item_pos: usize, _lost: u32) {}
    fn on_real_max_frequency(&self, _frequency: Option<RealMaxFrequency>) {}
    fn on_command_second_level_subscription_error(&self, _code: i32, _message: &str, _key: &str) {}
    fn on_command_second_level_item_lost_updates(&self, _lost: u32, _key: &str) {}
    fn on_listen_start(&self) {}
    fn on_listen_end(&self) {}
}

/// Outcomes for a single submitted message.
pub trait ClientMessageListener: Send + Sync {
    /// The message was aborted client-side. `sent_on_network` tells
    /// whether it had already been written to the transport.
    fn on_abort(&self, _original: &str, _sent_on_network: bool) {}
    fn on_deny(&self, _original: &str, _code: i32, _error: &str) {}
    fn on_discarded(&self, _original: &str) {}
    fn on_error(&self, _original: &str) {}
    fn on_processed(&self, _original: &str) {}
}

/// A shared, ordered set of listeners of one kind.
///
/// Additions and removals may happen from any thread; dispatch
/// snapshots the current set so iteration never holds the lock.
pub(crate) struct ListenerSet<T: ?Sized> {
    inner: Arc<Mutex<Vec<Arc<T>>>>,
}

impl<T: ?Sized> Clone for ListenerSet<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: ?Sized> Default for ListenerSet<T> {
    fn default() -> Self {
        Self { inner: Arc::new(Mutex::new(Vec::new())) }
    }
}

impl<T: ?Sized> ListenerSet<T> {
    /// Add a listener. Returns false when the same instance is already
    /// registered.
    pub fn add(&self, listener: Arc<T>) -> bool {
        let mut set = self.inner.lock();
        if set.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        set.push(listener);
        true
    }

    /// Remove a listener by instance identity.
    pub fn remove(&self, listener: &Arc<T>) -> bool {
        let mut set = self.inner.lock();
        let before = set.len();
        set.retain(|l| !Arc::ptr_eq(l, listener));
        set.len() != before
    }

    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;
