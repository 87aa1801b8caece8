// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Protocol tokens, status strings, and default timeouts.

use std::time::Duration;

/// TLCP protocol version token sent with every session request.
pub const TLCP_VERSION: &str = "TLCP-2.1.0";

/// Client-library identifier sent as `LS_cid` on session creation.
pub const CLIENT_CID: &str = "jqWtj1twChtfDxikwp1ltvcB4CJ5M5iwVztxHfDprfc7Do";

/// URL path prefix under which the server mounts the protocol endpoints.
pub const SERVER_PATH: &str = "/lightstreamer";

/// WebSocket subprotocol announced on upgrade.
pub const WS_SUBPROTOCOL: &str = "TLCP-2.1.0.lightstreamer.com";

/// Reserved sequence name for messages with no ordering demands.
pub const UNORDERED_MESSAGES: &str = "UNORDERED_MESSAGES";

/// Sentinel accepted for bandwidth, frequency, and buffer-size options.
pub const UNLIMITED: &str = "unlimited";

// -- Client status strings ---------------------------------------------------

pub const DISCONNECTED: &str = "DISCONNECTED";
pub const WILL_RETRY: &str = "DISCONNECTED:WILL-RETRY";
pub const TRYING_RECOVERY: &str = "DISCONNECTED:TRYING-RECOVERY";
pub const CONNECTING: &str = "CONNECTING";
pub const STREAM_SENSING: &str = "CONNECTED:STREAM-SENSING";
pub const WS_STREAMING: &str = "CONNECTED:WS-STREAMING";
pub const HTTP_STREAMING: &str = "CONNECTED:HTTP-STREAMING";
pub const WS_POLLING: &str = "CONNECTED:WS-POLLING";
pub const HTTP_POLLING: &str = "CONNECTED:HTTP-POLLING";
pub const STALLED: &str = "STALLED";

// -- Default timeouts ------------------------------------------------------

/// Default content length for streaming connections: 50 MB.
pub const DEFAULT_CONTENT_LENGTH: u64 = 50_000_000;

/// Base delay between session retries; also the base tutor timeout.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(4000);

/// Upper bound the retry delay grows to under repeated failures.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Retry attempts after which the retry delay starts doubling.
pub const RETRY_GROWTH_THRESHOLD: u32 = 9;

/// Maximum randomized delay before the very first retry.
pub const DEFAULT_FIRST_RETRY_MAX_DELAY: Duration = Duration::from_millis(100);

/// Silence tolerated past the keepalive interval before stalling.
pub const DEFAULT_STALLED_TIMEOUT: Duration = Duration::from_millis(2000);

/// Further silence tolerated in STALLING before the stream is given up.
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Wall-clock budget for resuming a broken session before recreating it.
pub const DEFAULT_SESSION_RECOVERY_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Grace accorded to a `force_rebind` before the session is abandoned.
pub const DEFAULT_FORCE_BIND_TIMEOUT: Duration = Duration::from_millis(2000);

// -- Slowing detection -----------------------------------------------------

/// Smoothed sync drift below which the accumulated mean is reset.
pub const SLOWING_HUGE_DELAY_FLOOR_MS: f64 = 60.0;

/// Smoothed sync drift above which the session switches to polling.
pub const SLOWING_MAX_MEAN_MS: f64 = 7000.0;

/// A single drift jump beyond this is attributed to standby/hibernation
/// and tolerated once.
pub const SLOWING_IGNORE_JUMP_MS: f64 = 20_000.0;

/// Momentum of the exponentially smoothed sync drift mean.
pub const SLOWING_MOMENTUM: f64 = 0.5;
