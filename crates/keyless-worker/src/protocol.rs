//! Messages posted by the worker
//!
//! Every message carries the token of the request that produced it. Builds
//! and randomness recovery draw tokens from separate gates, so a message is
//! only meaningful together with its kind.

use serde::{Deserialize, Serialize};

use keyless_core::{BuildStage, BuiltTree, Hash32, HashFunction, LeafInput};

/// Worker message, tagged by `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum WorkerMessage {
    /// Build progress
    Working {
        token: u64,
        current: u64,
        total: u64,
        stage: BuildStage,
    },

    /// Build finished; the layers are delivered through the request's future
    Done { token: u64, result: BuildSummary },

    /// Randomness search finished
    #[serde(rename_all = "camelCase")]
    RandomnessRecovered {
        token: u64,
        index: u64,
        found: bool,
    },

    /// A request failed
    Failed { token: u64, error: String },
}

impl WorkerMessage {
    pub fn token(&self) -> u64 {
        match self {
            WorkerMessage::Working { token, .. }
            | WorkerMessage::Done { token, .. }
            | WorkerMessage::RandomnessRecovered { token, .. }
            | WorkerMessage::Failed { token, .. } => *token,
        }
    }

    /// Whether the message belongs to the randomness channel
    pub fn is_randomness(&self) -> bool {
        matches!(self, WorkerMessage::RandomnessRecovered { .. })
    }
}

/// Non-secret outline of a finished build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSummary {
    pub root: Hash32,
    pub height: u8,
    pub max_operations_per_interval: u16,
    #[serde(default)]
    pub inner_roots: Vec<Hash32>,
}

impl From<&BuiltTree> for BuildSummary {
    fn from(tree: &BuiltTree) -> Self {
        Self {
            root: tree.root,
            height: tree.layers.height(),
            max_operations_per_interval: tree.max_operations_per_interval,
            inner_roots: tree.inner_trees.iter().map(|t| t.root).collect(),
        }
    }
}

/// Search for the randomness of one randomized leaf
#[derive(Debug, Clone)]
pub struct RandomnessQuery {
    /// hseed of the tree holding the leaf
    pub hseed: Hash32,
    /// Slot index of the leaf
    pub index: u64,
    /// Leaf inputs without randomness
    pub input: LeafInput,
    /// Randomness width in bits
    pub bits: u8,
    pub hasher: HashFunction,
    /// Leaf recorded in `layers[0][index]`
    pub expected_leaf: Hash32,
}

/// Result of a successful randomness search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveredRandomness {
    pub randomness: u32,
    /// The slot's one-time value
    pub eotp: Hash32,
}
