//! Error types for telemetry capture and comparison.
//!
//! Three error enums cover the crate:
//!
//! - [`DecodeError`]: a single datagram could not be turned into a sample.
//!   Always recovered locally by the pipeline (dropped and counted).
//! - [`AlignError`]: a lap comparison request was rejected. Surfaced
//!   synchronously to the caller; the underlying laps are untouched.
//! - [`TelemetryError`]: everything else, covering store I/O, session
//!   lifecycle, and shutdown timeouts. Wraps the two enums above so `?`
//!   composes.

use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::types::SessionId;

/// Result type alias for telemetry operations.
pub type Result<T, E = TelemetryError> = std::result::Result<T, E>;

/// A raw datagram could not be decoded into a telemetry sample.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram of {len} bytes is shorter than the smallest known layout ({min} bytes)")]
    TruncatedBuffer { len: usize, min: usize },

    #[error("datagram of {len} bytes matches no known layout")]
    UnknownLayout { len: usize },
}

/// A lap comparison request was rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlignError {
    #[error("lap {lap_number} has {samples} samples, need at least 2 to interpolate")]
    EmptyLap { lap_number: u16, samples: usize },

    #[error(
        "lap {lap_number} distance reverses at sample {at}: {from:.2}m -> {to:.2}m \
         exceeds tolerance"
    )]
    NonMonotonicDistance { lap_number: u16, at: usize, from: f64, to: f64 },
}

/// Main error type for session and store operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TelemetryError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Align(#[from] AlignError),

    #[error("session {session} not found in store")]
    SessionNotFound { session: SessionId },

    #[error("session {session} is closed; no further appends accepted")]
    SessionClosed { session: SessionId },

    #[error("session {session} is degraded after a write failure; read-only")]
    SessionDegraded { session: SessionId },

    #[error("lap {lap_number} not found in session {session}")]
    LapNotFound { session: SessionId, lap_number: u16 },

    #[error("sequence range {}..{} not yet durable in session {session}", range.start, range.end)]
    RangeUnavailable { session: SessionId, range: Range<u64> },

    #[error("store I/O failure: {context} ({path})")]
    Store {
        context: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt session data: {context}: {details}")]
    Corrupt { context: String, details: String },

    #[error("unsupported session format version: expected {expected}, found {found}")]
    FormatVersion { expected: u16, found: u16 },

    #[error("network source error: {reason}")]
    Source {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },
}

impl TelemetryError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            TelemetryError::Decode(_) => false,
            TelemetryError::Align(_) => false,
            TelemetryError::SessionNotFound { .. } => false,
            TelemetryError::SessionClosed { .. } => false,
            TelemetryError::SessionDegraded { .. } => false,
            TelemetryError::LapNotFound { .. } => false,
            // The range may become durable once the recorder flushes.
            TelemetryError::RangeUnavailable { .. } => true,
            TelemetryError::Store { .. } => false,
            TelemetryError::Corrupt { .. } => false,
            TelemetryError::FormatVersion { .. } => false,
            TelemetryError::Source { .. } => true,
            TelemetryError::Timeout { .. } => true,
        }
    }

    /// Helper constructor for store I/O errors with path context.
    pub fn store_error(
        context: impl Into<String>,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        TelemetryError::Store { context: context.into(), path: path.into(), source }
    }

    /// Helper constructor for corrupt-data errors.
    pub fn corrupt(context: impl Into<String>, details: impl Into<String>) -> Self {
        TelemetryError::Corrupt { context: context.into(), details: details.into() }
    }

    /// Helper constructor for network source errors.
    pub fn source_error(reason: impl Into<String>) -> Self {
        TelemetryError::Source { reason: reason.into(), source: None }
    }

    /// Helper constructor for network source errors with a cause.
    pub fn source_error_with(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        TelemetryError::Source { reason: reason.into(), source: Some(source) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_traits_validation() {
        // Compile-time check: TelemetryError must be Send + Sync + 'static
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<TelemetryError>();
        assert_send_sync_static::<DecodeError>();
        assert_send_sync_static::<AlignError>();

        let error = TelemetryError::source_error("socket closed");
        let _: &dyn std::error::Error = &error;
    }

    #[test]
    fn decode_errors_carry_lengths() {
        let err = DecodeError::TruncatedBuffer { len: 12, min: 311 };
        assert!(err.to_string().contains("12"));
        assert!(err.to_string().contains("311"));

        let err = DecodeError::UnknownLayout { len: 500 };
        assert!(err.to_string().contains("500"));
    }

    #[test]
    fn retryability_classification() {
        let degraded = TelemetryError::SessionDegraded { session: SessionId::from_raw(1) };
        assert!(!degraded.is_retryable());

        let timeout = TelemetryError::Timeout { duration: Duration::from_secs(1) };
        assert!(timeout.is_retryable());

        let unavailable =
            TelemetryError::RangeUnavailable { session: SessionId::from_raw(1), range: 10..20 };
        assert!(unavailable.is_retryable());
    }

    #[test]
    fn decode_error_converts_into_telemetry_error() {
        let err: TelemetryError = DecodeError::UnknownLayout { len: 7 }.into();
        assert!(matches!(err, TelemetryError::Decode(DecodeError::UnknownLayout { len: 7 })));
    }
}
