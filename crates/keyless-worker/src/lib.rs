//! Keyless Worker - Background tree construction
//!
//! Tree builds and randomness searches are CPU-bound and run on the
//! blocking pool. Callers await a single future per request and may
//! subscribe to progress; requests are tagged with tokens so results of a
//! superseded request are never observed.

pub mod error;
pub mod protocol;
pub mod token;
pub mod worker;

pub use error::{Result, WorkerError};
pub use protocol::{BuildSummary, RandomnessQuery, RecoveredRandomness, WorkerMessage};
pub use token::TokenGate;
pub use worker::TreeWorker;
