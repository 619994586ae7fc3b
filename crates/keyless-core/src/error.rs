//! Error types for keyless core primitives

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the core primitives
///
/// The first group is input validation: these are always raised before any
/// network interaction and are recoverable by correcting the input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// OTP code is not exactly six decimal digits
    #[error("Invalid OTP: {0}")]
    InvalidOtp(String),

    /// Address is not a 20-byte hex string
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Amount is not a positive integer or exceeds a limit
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Seed has the wrong length or encoding
    #[error("Invalid seed: {0}")]
    InvalidSeed(String),

    /// Hex decoding failed
    #[error("Hex decode error: {0}")]
    Hex(String),

    /// Tree parameters do not describe a complete binary tree
    #[error("Invalid tree parameters: {0}")]
    InvalidTreeParams(String),

    /// Slot index is outside `[0, 2^height)`
    #[error("Slot index {index} out of range (tree has {slots} slots)")]
    SlotOutOfRange { index: u64, slots: u64 },

    /// Operation time is outside the wallet's lifespan
    #[error("Wallet core is not active at {0}")]
    CoreInactive(u64),

    /// Selected generation is not recorded for the wallet
    #[error("No wallet generation {0}")]
    UnknownGeneration(usize),

    /// Layer blob is malformed
    #[error("Layer format error: {0}")]
    LayerFormat(String),

    /// Recomputed root does not match the recorded root
    #[error("Root mismatch: expected {expected}, got {actual}")]
    RootMismatch { expected: String, actual: String },

    /// Merkle proof did not reproduce the root
    #[error("Proof verification failed")]
    ProofVerificationFailed,

    /// Inner core authorization does not bind to the parent tree
    #[error("Inner core binding invalid: {0}")]
    InnerBinding(String),

    /// Hash function failure (argon2 parameter errors)
    #[error("Hasher error: {0}")]
    Hasher(String),

    /// Tree construction was cancelled by the caller
    #[error("Tree construction cancelled")]
    Cancelled,
}

impl Error {
    /// Whether this error is an input validation failure
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidOtp(_)
                | Error::InvalidAddress(_)
                | Error::InvalidAmount(_)
                | Error::InvalidSeed(_)
                | Error::Hex(_)
                | Error::UnknownGeneration(_)
        )
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::Hex(e.to_string())
    }
}
