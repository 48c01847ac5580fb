//! Error types for the telemetry pipeline.
//!
//! None of these ever reach the response path of the instrumented
//! application: producers see an [`EmitOutcome`](crate::EmitOutcome) they may
//! ignore, and export failures end in the processor's log and drop counters.

use std::time::Duration;
use thiserror::Error;

/// Errors returned when a record cannot be placed in a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// Buffer stayed full for the whole `block` timeout (BufferFull).
    #[error("buffer is full")]
    Full,
    /// Buffer is full and the `drop_newest` policy rejected the incoming record.
    #[error("record rejected by drop_newest overflow policy")]
    Rejected,
    /// Buffer has been closed by shutdown.
    #[error("buffer is closed")]
    Closed,
}

impl EnqueueError {
    /// Returns `true` if retrying later might succeed.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Full | Self::Rejected)
    }
}

/// Error types for batch export operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExportError {
    /// Transport-layer error (connect refused, reset, broken pipe)
    #[error("transport error: {0}")]
    Transport(String),
    /// Export attempt exceeded `export_timeout`
    #[error("export attempt timed out")]
    Timeout,
    /// Collector asked us to try again later
    #[error("collector unavailable: {0}")]
    Unavailable(String),
    /// Batch could not be encoded
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Collector reply violated the wire protocol
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Collector refused the batch as malformed
    #[error("batch rejected by collector: {0}")]
    Rejected(String),
    /// Collector refused our credentials
    #[error("authentication rejected: {0}")]
    Unauthenticated(String),
    /// All retry attempts exhausted
    #[error("export failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl ExportError {
    /// Transient failures are retried with backoff; everything else fails the batch at once.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout | Self::Unavailable(_) | Self::Protocol(_)
        )
    }
}

/// A flush or shutdown did not complete before its deadline.
///
/// The processor keeps running; the caller decides whether to wait again or
/// accept losing whatever is still buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation timed out after {after:?}")]
pub struct TimedOut {
    pub after: Duration,
}

/// Invalid pipeline configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0}")]
    Invalid(String),
    #[error("failed to load TLS material from {path}: {reason}")]
    Tls { path: String, reason: String },
}
