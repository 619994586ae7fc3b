//! Error types for the background worker

use thiserror::Error;

/// Result type alias for worker operations
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Errors that can occur while running a worker job
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Core library error
    #[error("Core error: {0}")]
    Core(#[from] keyless_core::Error),

    /// A newer request replaced this one before it finished
    #[error("Request {token} was superseded by a newer request")]
    Superseded { token: u64 },

    /// No randomness reproduces the recorded leaf (usually a wrong OTP)
    #[error("Randomness not found for slot {index}")]
    RandomnessNotFound { index: u64 },

    /// The blocking task panicked or was aborted
    #[error("Worker task failed: {0}")]
    Join(String),
}

impl From<tokio::task::JoinError> for WorkerError {
    fn from(e: tokio::task::JoinError) -> Self {
        WorkerError::Join(e.to_string())
    }
}
