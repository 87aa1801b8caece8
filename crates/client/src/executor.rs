// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The two cooperative executors the engine runs on.
//!
//! All protocol, session, and subscription state is mutated only from
//! tasks drained by the *session thread*; user-visible listener
//! callbacks are dispatched from the *events thread* so a blocking
//! listener can never stall protocol work. Timers are cancellable
//! sleeps that re-enter through the owning executor, preserving the
//! single-writer discipline.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a single-worker task executor.
///
/// Cloning is cheap; all clones feed the same worker. Tasks run in
/// submission order. Dropping every handle stops the worker once the
/// queue drains.
#[derive(Clone)]
pub(crate) struct Executor {
    tx: mpsc::UnboundedSender<Task>,
}

impl Executor {
    /// Spawn a new worker. Must be called from within a tokio runtime.
    pub fn spawn(name: &'static str, catch_panics: bool) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                if catch_panics {
                    if std::panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        warn!(executor = name, "listener panicked; continuing");
                    }
                } else {
                    task();
                }
            }
        });
        Self { tx }
    }

    /// Post a task to the back of the queue.
    pub fn queue(&self, task: impl FnOnce() + Send + 'static) {
        // A send failure means the runtime is shutting down; the task
        // is dropped with it.
        let _ = self.tx.send(Box::new(task));
    }

    /// Post a task after `delay`. The returned handle cancels delivery
    /// if invoked before the timer fires.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> TimerHandle {
        let token = CancellationToken::new();
        let tx = self.tx.clone();
        let guard = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Box::new(task));
                }
            }
        });
        TimerHandle { token }
    }

    /// Resolve once every task queued before this call has run.
    pub async fn drained(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.queue(move || {
            let _ = done_tx.send(());
        });
        let _ = done_rx.await;
    }

    /// The worker is gone (its runtime shut down).
    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Cancellable handle for a scheduled task.
///
/// Cancelling after the fire point is a no-op; the task may already be
/// queued or running.
#[derive(Clone)]
pub(crate) struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// Monotonic now. Goes through tokio's clock so tests driving paused
/// time see it move with `tokio::time::advance`.
pub(crate) fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

/// The session thread shared by all clients in this process.
///
/// Clients on the same runtime share one worker. A worker dies with
/// the runtime that hosted it, so a dead instance is replaced rather
/// than handed out again.
pub(crate) fn shared_session_thread() -> Executor {
    static SHARED: Mutex<Option<Executor>> = Mutex::new(None);
    let mut shared = SHARED.lock();
    match shared.as_ref() {
        Some(exec) if !exec.is_closed() => exec.clone(),
        _ => {
            let exec = Executor::spawn("session", false);
            *shared = Some(exec.clone());
            exec
        }
    }
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
