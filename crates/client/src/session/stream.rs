// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One physical stream connection and its lifecycle state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::ForcedTransport;
use crate::executor::TimerHandle;
use crate::transport::{RequestHandle, WsConnection};

use super::slowing::SlowingHandler;

/// Transport/mode combination a stream session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportKind {
    WsStreaming,
    WsPolling,
    HttpStreaming,
    HttpPolling,
}

impl TransportKind {
    pub fn is_ws(&self) -> bool {
        matches!(self, Self::WsStreaming | Self::WsPolling)
    }

    pub fn is_polling(&self) -> bool {
        matches!(self, Self::WsPolling | Self::HttpPolling)
    }

    /// The user-visible status string while this kind is receiving.
    pub fn status(&self) -> &'static str {
        match self {
            Self::WsStreaming => crate::constants::WS_STREAMING,
            Self::WsPolling => crate::constants::WS_POLLING,
            Self::HttpStreaming => crate::constants::HTTP_STREAMING,
            Self::HttpPolling => crate::constants::HTTP_POLLING,
        }
    }

    /// The polling sibling within the same transport family.
    pub fn polling_variant(&self) -> Self {
        match self {
            Self::WsStreaming | Self::WsPolling => Self::WsPolling,
            Self::HttpStreaming | Self::HttpPolling => Self::HttpPolling,
        }
    }

    /// First kind to try for a given forced-transport setting.
    pub fn initial(forced: Option<ForcedTransport>) -> Self {
        match forced {
            None | Some(ForcedTransport::Ws) | Some(ForcedTransport::WsStreaming) => {
                Self::WsStreaming
            }
            Some(ForcedTransport::WsPolling) => Self::WsPolling,
            Some(ForcedTransport::Http) | Some(ForcedTransport::HttpStreaming) => {
                Self::HttpStreaming
            }
            Some(ForcedTransport::HttpPolling) => Self::HttpPolling,
        }
    }

    /// Next kind in the stream-sense probe order, `None` when the
    /// sequence is exhausted for the given constraint.
    ///
    /// Full order: WS streaming, WS polling, HTTP streaming, HTTP
    /// polling. A forced family restricts the walk to that family; an
    /// exact forced kind disables sensing entirely.
    pub fn stream_sense_next(&self, forced: Option<ForcedTransport>) -> Option<Self> {
        match forced {
            None => match self {
                Self::WsStreaming => Some(Self::WsPolling),
                Self::WsPolling => Some(Self::HttpStreaming),
                Self::HttpStreaming => Some(Self::HttpPolling),
                Self::HttpPolling => None,
            },
            Some(ForcedTransport::Ws) => match self {
                Self::WsStreaming => Some(Self::WsPolling),
                _ => None,
            },
            Some(ForcedTransport::Http) => match self {
                Self::HttpStreaming => Some(Self::HttpPolling),
                _ => None,
            },
            Some(_) => None,
        }
    }
}

/// Stream-session lifecycle. All transitions run on the
/// session thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamPhase {
    Off,
    Creating,
    Created,
    FirstPause,
    FirstBinding,
    Pause,
    Binding,
    Receiving,
    Stalling,
    Stalled,
    Sleep,
}

impl StreamPhase {
    /// Phases during which server lines are expected.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            Self::Creating
                | Self::Created
                | Self::FirstBinding
                | Self::Binding
                | Self::Receiving
                | Self::Stalling
                | Self::Stalled
        )
    }
}

/// The transport channel a stream session reads from.
pub(crate) enum Binding {
    None,
    Ws(Arc<dyn WsConnection>),
    Http(RequestHandle),
}

fn next_stream_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// One physical connection of a logical session.
pub(crate) struct StreamSession {
    /// Identity used to drop callbacks from superseded connections and
    /// to detect stream switches under in-flight requests.
    pub id: u64,
    pub kind: TransportKind,
    pub phase: StreamPhase,
    pub binding: Binding,
    /// Keepalive cadence granted by the server on CONOK.
    pub keepalive_ms: u64,
    pub bind_count: u64,
    /// Whether the in-flight bind is a recovery attempt.
    pub recovering_bind: bool,
    pub slowing: SlowingHandler,
    pub connect_timer: Option<TimerHandle>,
    pub stall_timer: Option<TimerHandle>,
    pub heartbeat_timer: Option<TimerHandle>,
    /// Cause token reported on the next session request.
    pub cause: Option<String>,
}

impl StreamSession {
    pub fn new(kind: TransportKind, cause: Option<String>) -> Self {
        Self {
            id: next_stream_id(),
            kind,
            phase: StreamPhase::Off,
            binding: Binding::None,
            keepalive_ms: 0,
            bind_count: 0,
            recovering_bind: false,
            slowing: SlowingHandler::new(),
            connect_timer: None,
            stall_timer: None,
            heartbeat_timer: None,
            cause,
        }
    }

    pub fn ws_connection(&self) -> Option<&Arc<dyn WsConnection>> {
        match &self.binding {
            Binding::Ws(conn) => Some(conn),
            _ => None,
        }
    }

    /// Drop the transport channel, if any.
    pub fn close_binding(&mut self) {
        match std::mem::replace(&mut self.binding, Binding::None) {
            Binding::None => {}
            Binding::Ws(conn) => conn.disconnect(),
            Binding::Http(handle) => handle.close(true),
        }
    }

    pub fn cancel_timers(&mut self) {
        for timer in [
            self.connect_timer.take(),
            self.stall_timer.take(),
            self.heartbeat_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.cancel();
        }
    }

    /// Full teardown on the way to `Sleep`/`Off`.
    pub fn shutdown(&mut self) {
        self.cancel_timers();
        self.close_binding();
    }
}

#[cfg(test)]
#[path = "stream_tests.rs"]
mod tests;
