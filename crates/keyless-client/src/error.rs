//! Error types for the keyless client

use thiserror::Error;

use crate::relayer::RelayerError;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors raised by the registry, store and restore procedure
#[derive(Debug, Error)]
pub enum ClientError {
    /// Core library error
    #[error("Core error: {0}")]
    Core(#[from] keyless_core::Error),

    /// Background worker error
    #[error("Worker error: {0}")]
    Worker(#[from] keyless_worker::WorkerError),

    /// Relayer error
    #[error("Relayer error: {0}")]
    Relayer(#[from] RelayerError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No wallet recorded for the address
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    /// No layers stored for the root
    #[error("Layers not found for root {0}")]
    LayersNotFound(String),

    /// A commit for the wallet is still pending
    #[error("Commit outstanding for {address}, retry in {retry_after}s")]
    CommitOutstanding { address: String, retry_after: u64 },

    /// The wallet needs a second seed to rebuild its tree
    #[error("Wallet uses double OTP; a second seed is required")]
    MissingSecondSeed,

    /// No recorded core matches the scanned seed
    #[error("No wallet core matches the provided seed")]
    NoMatchingCore,
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Serialization(e.to_string())
    }
}

/// Failures of one commit-reveal run
#[derive(Debug, Error)]
pub enum FlowError {
    /// Input rejected locally, nothing was sent
    #[error("Invalid input: {0}")]
    Validation(keyless_core::Error),

    /// Proof material could not be prepared
    #[error("Proof preparation failed: {0}")]
    Proof(String),

    /// Commit could not be submitted (network or signing failure)
    #[error("Commit error: {0}")]
    CommitError(String),

    /// The contract rejected the commit
    #[error("Commit rejected: {0}")]
    CommitFailure(String),

    /// A previous commit has not expired yet
    #[error("A commit is outstanding, retry in {retry_after}s")]
    CommitOutstanding { retry_after: u64 },

    /// The contract rejected the operation
    #[error("Reveal rejected: {0}")]
    RevealFailure(String),

    /// Reveal failed unexpectedly or ran out of attempts
    #[error("Reveal error: {0}")]
    RevealError(String),

    /// The operation was already revealed successfully
    #[error("Operation already revealed")]
    AlreadyRevealed,

    /// Step called out of order
    #[error("Cannot {action} while {state}")]
    InvalidState { action: &'static str, state: String },
}

impl FlowError {
    /// Whether the flow is back at idle and may be retried from the start
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FlowError::Validation(_)
                | FlowError::CommitError(_)
                | FlowError::CommitFailure(_)
                | FlowError::CommitOutstanding { .. }
        )
    }
}

impl From<ClientError> for FlowError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Core(core) if core.is_validation() => FlowError::Validation(core),
            ClientError::CommitOutstanding { retry_after, .. } => {
                FlowError::CommitOutstanding { retry_after }
            }
            other => FlowError::Proof(other.to_string()),
        }
    }
}
