// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

/// Error kinds surfaced synchronously by the client API.
///
/// Protocol and transport failures never appear here — those are
/// recovered internally or reported through listener callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A supplied value is malformed (bad URL, unknown transport token,
    /// invalid item or field name, non-positive timeout).
    IllegalArgument,
    /// The operation is not valid in the object's current state
    /// (mutating an active subscription, subscribing twice).
    IllegalState,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IllegalArgument => "ILLEGAL_ARGUMENT",
            Self::IllegalState => "ILLEGAL_STATE",
        }
    }
}

/// Synchronous client-side error: machine-readable kind plus detail.
#[derive(Debug, Clone)]
pub struct ClientError {
    kind: ErrorKind,
    message: String,
}

impl ClientError {
    pub fn argument(message: impl Into<String>) -> Self {
        Self { kind: ErrorKind::IllegalArgument, message: message.into() }
    }

    pub fn state(message: impl Into<String>) -> Self {
        Self { kind: ErrorKind::IllegalState, message: message.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for ClientError {}
