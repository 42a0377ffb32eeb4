//! Error types for the streaming pipeline
//!
//! Two families live here:
//!
//! - [`Error`] is returned synchronously: bad configuration at assembly time,
//!   requests rejected at the submission boundary, server/CLI failures.
//! - [`FailureKind`] travels *with* a request as data once it has entered the
//!   pipeline. Requests cross into device threads, so a failure is a terminal
//!   status on the request, never a panic or an `Err` unwinding a stage.

use thiserror::Error;

use crate::request::RequestId;
use crate::transport::TransportError;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while assembling or driving a stream stack
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Assembly Errors
    // =========================================================================
    /// Invalid static parameters for a stage or device
    #[error("Configuration error: {0}")]
    Config(String),

    /// Pipeline configuration file could not be parsed
    #[error("Failed to parse stack configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    // =========================================================================
    // Request Errors
    // =========================================================================
    /// Malformed request rejected before entering the pipeline
    #[error("Invalid request: {0}")]
    RequestValidation(String),

    /// Request reached a terminal failure inside the pipeline
    #[error("Request {id} failed: {kind}")]
    RequestFailed { id: RequestId, kind: FailureKind },

    /// Request was cancelled before it could execute
    #[error("Request {id} was cancelled")]
    Cancelled { id: RequestId },

    // =========================================================================
    // Device / Transport Errors
    // =========================================================================
    /// Transport failure surfaced synchronously
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    // =========================================================================
    // Export Errors
    // =========================================================================
    /// Prometheus encoding error
    #[error("Metrics export error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Reason a request ended in the `Failed` state.
///
/// Cloneable so a split parent can report the first failure of its children.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Range is malformed (e.g. `offset + length` overflows)
    #[error("invalid range: offset {offset} length {length}")]
    InvalidRange { offset: u64, length: u64 },

    /// Underlying transport failed while executing
    #[error("transport failure: {0}")]
    Transport(String),

    /// Device was unmounted before the request could run
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Request was dropped by a stage without being completed
    #[error("request abandoned before completion")]
    Abandoned,
}

impl From<TransportError> for FailureKind {
    fn from(err: TransportError) -> Self {
        FailureKind::Transport(err.to_string())
    }
}
