//! Keyless Core - OTP Merkle tree primitives for keyless wallets
//!
//! A keyless wallet's spending authority is a Merkle tree whose leaves are
//! derived from time-based one-time passwords. This crate holds the pure,
//! synchronous parts: OTP generation, leaf derivation, tree reduction, the
//! proof locator, EOTP composition, commit hashing and the wallet record.

pub mod eotp;
pub mod error;
pub mod hash;
pub mod identity;
pub mod leaf;
pub mod merkle;
pub mod otp;
pub mod tree;
pub mod types;
pub mod wallet;

pub use eotp::{
    commit_hash, compose, verification_hash, Authorization, Commit, ExtendedOtp, Operation,
    ParamsScheme, TokenType, RECOVER_PARAMS_MIN_VERSION,
};
pub use error::{Error, Result};
pub use hash::HashFunction;
pub use identity::{IdentificationKey, Seed, SEED_LEN};
pub use leaf::{leaf_hash, leaf_value, recover_randomness, LeafInput};
pub use merkle::{verify_proof, Layers, MerkleProof, Side, LAYERS_MAGIC};
pub use otp::{OtpCode, DEFAULT_INTERVAL};
pub use tree::{
    build_tree, slot_value, BuildObserver, BuildProgress, BuildStage, BuiltInnerTree, BuiltTree,
    InnerTreeSpec, NoopObserver, SecurityParameters, TreeParams, TreeRequest,
};
pub use types::{parse_amount, Address, Hash32};
pub use wallet::{
    bind_built_inner_trees, bind_inner_core, inner_params_hash, CoreGeneration, CoreSelection,
    InnerAuthorization, InnerCore, TreeTarget, WalletCore, WalletRecord,
};

/// Major version of wallets created by this library
pub const CURRENT_MAJOR_VERSION: u32 = 16;

/// Default wallet lifespan (one year) in seconds
pub const DEFAULT_DURATION: u64 = 365 * 24 * 3600;

/// Default number of operations per interval
pub const DEFAULT_SLOT_SIZE: u16 = 1;
