//! Driver error taxonomy.
//!
//! Every fallible operation in this crate returns [`DriverError`]. The
//! variants mirror the error taxonomy drivers and the device manager agree
//! on at the wire level: a `BadRequest`/`NotFound`/`NotReady` surfaces to
//! the caller via an error envelope field, a `Timeout` is retried by the
//! caller's own policy, `Unreachable` bubbles out of initialization, and
//! `Internal` is a programmer error that should never occur in practice.

use thiserror::Error;

/// Errors produced by the driver SDK.
#[derive(Error, Debug)]
pub enum DriverError {
    /// The caller supplied an undefined id, a read-only property, or
    /// missing required method inputs/outputs.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// An unknown product, device or runner was referenced.
    #[error("not found: {0}")]
    NotFound(String),

    /// A soft read missed the property cache (unset or expired).
    #[error("not ready: {0}")]
    NotReady(String),

    /// A bus `Call` did not receive a response within its timeout.
    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// The message bus is not connected.
    #[error("bus unreachable: {0}")]
    Unreachable(String),

    /// A user-supplied twin returned an error.
    #[error("device twin error: {0}")]
    DeviceTwin(String),

    /// A malformed topic string.
    #[error("bad topic: {0}")]
    BadTopic(String),

    /// A remote peer responded on the error channel of a `Call`.
    #[error("remote error: {0}")]
    RemoteError(String),

    /// A programmer error: nil product, nil builder, and the like. Fatal
    /// at construction time.
    #[error("internal error: {0}")]
    Internal(String),

    /// Transport-level failure from the underlying message bus client.
    #[error("bus error: {0}")]
    Bus(String),

    /// JSON (de)serialization failure of an envelope payload.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl DriverError {
    /// The stable, wire-facing name of this error's kind, used as the
    /// `error` field of a response envelope (spec: reserved field names).
    pub fn kind(&self) -> &'static str {
        match self {
            DriverError::BadRequest(_) => "bad_request",
            DriverError::NotFound(_) => "not_found",
            DriverError::NotReady(_) => "not_ready",
            DriverError::Timeout(_) => "timeout",
            DriverError::Unreachable(_) => "unreachable",
            DriverError::DeviceTwin(_) => "device_twin",
            DriverError::BadTopic(_) => "bad_topic",
            DriverError::RemoteError(_) => "remote_error",
            DriverError::Internal(_) => "internal",
            DriverError::Bus(_) => "bus",
            DriverError::Serde(_) => "serde",
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DriverError>;
