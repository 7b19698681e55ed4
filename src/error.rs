//! Error types for the admission service.

use thiserror::Error;

use crate::ledger::LedgerError;

/// Main error type for admission operations.
///
/// Admission *outcomes* (denials, unknown keys, invalid requests) are not
/// errors; they travel in the response `error` code. This type covers the
/// failures a caller cannot interpret as backpressure.
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Registry persistence errors
    #[error("Registry error: {0}")]
    Registry(String),

    /// Storage or transport failures inside a backend
    #[error("Backend error: {0}")]
    Backend(String),

    /// Failures reported by the ledger client
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// The caller's deadline passed before a result arrived
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The batcher has been shut down
    #[error("batcher is closed")]
    BatcherClosed,

    /// The scheduler has been shut down
    #[error("scheduler is closed")]
    SchedulerClosed,

    /// A batch call returned a different number of results than requests
    #[error("batch response mismatch: expected {expected} results, got {actual}")]
    BatchMismatch { expected: usize, actual: usize },

    /// gRPC transport errors
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// gRPC call errors from a remote limiter
    #[error("gRPC status: {0}")]
    Status(#[from] tonic::Status),

    /// JSON encoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Clone for AdmissionError {
    fn clone(&self) -> Self {
        // Batch failures fan one error out to many callers. Variants whose
        // sources are not `Clone` collapse to their message.
        match self {
            AdmissionError::Config(msg) => AdmissionError::Config(msg.clone()),
            AdmissionError::Registry(msg) => AdmissionError::Registry(msg.clone()),
            AdmissionError::Backend(msg) => AdmissionError::Backend(msg.clone()),
            AdmissionError::Ledger(err) => AdmissionError::Ledger(err.clone()),
            AdmissionError::DeadlineExceeded => AdmissionError::DeadlineExceeded,
            AdmissionError::BatcherClosed => AdmissionError::BatcherClosed,
            AdmissionError::SchedulerClosed => AdmissionError::SchedulerClosed,
            AdmissionError::BatchMismatch { expected, actual } => AdmissionError::BatchMismatch {
                expected: *expected,
                actual: *actual,
            },
            AdmissionError::Status(status) => AdmissionError::Status(status.clone()),
            other => AdmissionError::Backend(other.to_string()),
        }
    }
}

/// Result type alias for admission operations.
pub type Result<T> = std::result::Result<T, AdmissionError>;
