//! Keyless Client - Wallet registry, relayer client and commit-reveal flow
//!
//! This crate provides:
//! - File-backed storage of wallet records and their layers
//! - An in-memory registry gating one outstanding commit per wallet
//! - An HTTP client for the relayer that submits commits and reveals
//! - The commit-reveal state machine driving one operation
//! - Restoring a wallet generation from a scanned seed

pub mod config;
pub mod error;
pub mod flow;
pub mod registry;
pub mod relayer;
pub mod restore;
pub mod store;

pub use config::ClientConfig;
pub use error::{ClientError, FlowError, Result};
pub use flow::{
    CommitRevealFlow, FlowEvent, FlowObserver, FlowSettings, FlowState, NoopFlowObserver,
    OperationIntent, RevealOutcome,
};
pub use registry::{PendingCommit, Registry};
pub use relayer::{
    CommitRequest, HttpRelayer, Relayer, RelayerError, RelayerReceipt, RelayerResponse,
    RevealRequest,
};
pub use restore::{restore, restore_wallet, MatchedBy, RestoreOutcome};
pub use store::WalletStore;
