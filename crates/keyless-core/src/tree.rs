//! Merkle tree builder
//!
//! Derives every slot's leaf from the seed(s) and reduces the leaves into
//! layers. This is the CPU-heavy part of wallet creation and restore; it is
//! synchronous and reports progress and polls for cancellation through a
//! [`BuildObserver`] so callers can run it on a background worker.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::{hash_leaf, HashFunction};
use crate::identity::{inner_hseed, IdentificationKey, Seed, MAX_RANDOMNESS_BITS};
use crate::leaf::{leaf_value, LeafInput};
use crate::merkle::{reduce, Layers, MAX_HEIGHT};
use crate::otp;
use crate::types::{amount_string, Hash32};
use crate::CURRENT_MAJOR_VERSION;

/// Leaves derived between progress reports
const DERIVE_PROGRESS_CHUNK: u64 = 1024;

/// Maximum number of inner trees per wallet
pub const MAX_INNER_TREES: usize = 8;

/// Versioning and leaf-derivation options of a wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityParameters {
    pub major_version: u32,
    pub minor_version: u32,
    /// Randomness width in bits (0 = none)
    pub randomness: u8,
    pub hasher: HashFunction,
}

impl Default for SecurityParameters {
    fn default() -> Self {
        Self {
            major_version: CURRENT_MAJOR_VERSION,
            minor_version: 0,
            randomness: 0,
            hasher: HashFunction::default(),
        }
    }
}

/// Time layout of a tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeParams {
    /// Unix time of slot 0, aligned to `interval`
    pub effective_time: u64,
    /// Lifespan in seconds, a multiple of `interval`
    pub duration: u64,
    /// TOTP interval in seconds
    pub interval: u64,
    /// Maximum operations per interval
    pub slot_size: u16,
    pub security: SecurityParameters,
}

impl TreeParams {
    /// Check that the layout describes a complete binary tree
    pub fn validate(&self) -> Result<()> {
        if self.interval == 0 {
            return Err(Error::InvalidTreeParams("interval must be positive".to_string()));
        }
        if self.effective_time % self.interval != 0 {
            return Err(Error::InvalidTreeParams(format!(
                "effective time {} is not aligned to interval {}",
                self.effective_time, self.interval
            )));
        }
        if self.duration == 0 || self.duration % self.interval != 0 {
            return Err(Error::InvalidTreeParams(format!(
                "duration {} is not a positive multiple of interval {}",
                self.duration, self.interval
            )));
        }
        if self.slot_size == 0 {
            return Err(Error::InvalidTreeParams("slot size must be positive".to_string()));
        }
        if self.security.randomness > MAX_RANDOMNESS_BITS {
            return Err(Error::InvalidTreeParams(format!(
                "randomness {} exceeds {} bits",
                self.security.randomness, MAX_RANDOMNESS_BITS
            )));
        }
        let slots = self
            .intervals()
            .checked_mul(u64::from(self.slot_size))
            .ok_or_else(|| Error::InvalidTreeParams("slot count overflow".to_string()))?;
        if !slots.is_power_of_two() {
            return Err(Error::InvalidTreeParams(format!(
                "slot count {} is not a power of two",
                slots
            )));
        }
        if slots.trailing_zeros() > u32::from(MAX_HEIGHT) {
            return Err(Error::InvalidTreeParams(format!("slot count {} too large", slots)));
        }
        Ok(())
    }

    pub fn intervals(&self) -> u64 {
        self.duration / self.interval.max(1)
    }

    pub fn slot_count(&self) -> u64 {
        self.intervals() * u64::from(self.slot_size)
    }

    pub fn height(&self) -> u8 {
        self.slot_count().trailing_zeros() as u8
    }

    /// TOTP counter of slot 0
    pub fn base_counter(&self) -> u64 {
        otp::counter_at(self.effective_time, self.interval)
    }
}

/// An inner tree to build alongside the main tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InnerTreeSpec {
    /// Maximum amount spendable per spending interval
    #[serde(with = "amount_string")]
    pub spending_limit: u128,
    /// Spending window in seconds
    pub spending_interval: u64,
}

/// Everything needed to build a wallet's trees
///
/// Holds the seeds; drop it as soon as the build completes.
#[derive(Debug, Clone)]
pub struct TreeRequest {
    pub seed: Seed,
    pub seed2: Option<Seed>,
    pub params: TreeParams,
    pub inner_trees: Vec<InnerTreeSpec>,
}

impl TreeRequest {
    pub fn new(seed: Seed, params: TreeParams) -> Self {
        Self {
            seed,
            seed2: None,
            params,
            inner_trees: Vec::new(),
        }
    }

    pub fn with_second_seed(mut self, seed2: Seed) -> Self {
        self.seed2 = Some(seed2);
        self
    }

    pub fn with_inner_trees(mut self, inner_trees: Vec<InnerTreeSpec>) -> Self {
        self.inner_trees = inner_trees;
        self
    }
}

/// Build phase reported with progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BuildStage {
    DerivingLeaves,
    ReducingLayers,
}

/// Progress of a build within its current stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildProgress {
    pub current: u64,
    pub total: u64,
    pub stage: BuildStage,
}

/// Receives progress and controls cancellation of a build
pub trait BuildObserver {
    fn on_progress(&mut self, _progress: BuildProgress) {}

    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Observer that ignores progress and never cancels
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl BuildObserver for NoopObserver {}

/// A built inner tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuiltInnerTree {
    pub index: u8,
    pub root: Hash32,
    pub layers: Layers,
    pub spec: InnerTreeSpec,
}

/// Output of a tree build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuiltTree {
    pub root: Hash32,
    pub layers: Layers,
    pub hseed: Hash32,
    pub max_operations_per_interval: u16,
    pub identification_key: IdentificationKey,
    pub params: TreeParams,
    pub inner_trees: Vec<BuiltInnerTree>,
}

/// Build the main tree and any inner trees
pub fn build_tree(request: &TreeRequest, observer: &mut dyn BuildObserver) -> Result<BuiltTree> {
    let params = request.params;
    params.validate()?;
    if request.inner_trees.len() > MAX_INNER_TREES {
        return Err(Error::InvalidTreeParams(format!(
            "at most {} inner trees are supported",
            MAX_INNER_TREES
        )));
    }

    let hseed = request.seed.hseed();
    let inner_hseeds: Vec<Hash32> = (0..request.inner_trees.len())
        .map(|i| inner_hseed(&hseed, i as u8))
        .collect();

    let slots = params.slot_count();
    let tree_count = 1 + request.inner_trees.len() as u64;
    let total_leaves = slots * tree_count;
    let hasher = params.security.hasher;
    let bits = params.security.randomness;
    let base_counter = params.base_counter();
    let slot_size = u64::from(params.slot_size);

    let mut main_leaves = Vec::with_capacity(slots as usize);
    let mut inner_leaves: Vec<Vec<Hash32>> = request
        .inner_trees
        .iter()
        .map(|_| Vec::with_capacity(slots as usize))
        .collect();

    let mut derived = 0u64;
    for interval_index in 0..params.intervals() {
        let counter = base_counter + interval_index;
        let code = otp::generate(&request.seed, counter)?;
        let code2 = match &request.seed2 {
            Some(seed2) => Some(otp::generate(seed2, counter)?),
            None => None,
        };

        for nonce in 0..slot_size {
            let slot = interval_index * slot_size + nonce;
            let base = LeafInput::new(code, code2, nonce as u16);

            let main_input = if bits > 0 {
                base.with_randomness(request.seed.leaf_randomness(slot, bits))
            } else {
                base
            };
            main_leaves.push(hash_leaf(&leaf_value(&hseed, &main_input, hasher)?));

            for (leaves, inner) in inner_leaves.iter_mut().zip(&inner_hseeds) {
                leaves.push(hash_leaf(&leaf_value(inner, &base, hasher)?));
            }

            derived += tree_count;
            if derived % DERIVE_PROGRESS_CHUNK < tree_count {
                if observer.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                observer.on_progress(BuildProgress {
                    current: derived,
                    total: total_leaves,
                    stage: BuildStage::DerivingLeaves,
                });
            }
        }
    }

    let reduce_total = (slots - 1) * tree_count;
    let layers = reduce_reporting(main_leaves, observer, 0, reduce_total)?;
    let mut inner_trees = Vec::with_capacity(request.inner_trees.len());
    for (index, (leaves, spec)) in inner_leaves.into_iter().zip(&request.inner_trees).enumerate() {
        let offset = (slots - 1) * (index as u64 + 1);
        let inner_layers = reduce_reporting(leaves, observer, offset, reduce_total)?;
        inner_trees.push(BuiltInnerTree {
            index: index as u8,
            root: inner_layers.root(),
            layers: inner_layers,
            spec: *spec,
        });
    }

    Ok(BuiltTree {
        root: layers.root(),
        layers,
        hseed,
        max_operations_per_interval: params.slot_size,
        identification_key: IdentificationKey::derive(&request.seed, request.seed2.as_ref()),
        params,
        inner_trees,
    })
}

/// One-time value of a main-tree slot, derived from the seeds
pub fn slot_value(request: &TreeRequest, slot: u64) -> Result<Hash32> {
    let params = request.params;
    params.validate()?;
    let slots = params.slot_count();
    if slot >= slots {
        return Err(Error::SlotOutOfRange { index: slot, slots });
    }
    let slot_size = u64::from(params.slot_size);
    let counter = params.base_counter() + slot / slot_size;
    let code = otp::generate(&request.seed, counter)?;
    let code2 = match &request.seed2 {
        Some(seed2) => Some(otp::generate(seed2, counter)?),
        None => None,
    };
    let mut input = LeafInput::new(code, code2, (slot % slot_size) as u16);
    if params.security.randomness > 0 {
        let randomness = request.seed.leaf_randomness(slot, params.security.randomness);
        input = input.with_randomness(randomness);
    }
    leaf_value(&request.seed.hseed(), &input, params.security.hasher)
}

fn reduce_reporting(
    leaves: Vec<Hash32>,
    observer: &mut dyn BuildObserver,
    offset: u64,
    total: u64,
) -> Result<Layers> {
    reduce(leaves, |done, _| {
        if observer.is_cancelled() {
            return Err(Error::Cancelled);
        }
        observer.on_progress(BuildProgress {
            current: offset + done,
            total,
            stage: BuildStage::ReducingLayers,
        });
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SEED_LEN;

    fn params(intervals: u64, slot_size: u16) -> TreeParams {
        TreeParams {
            effective_time: 1_700_000_010 - 1_700_000_010 % 30,
            duration: intervals * 30,
            interval: 30,
            slot_size,
            security: SecurityParameters::default(),
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<BuildProgress>,
        cancel_after: Option<usize>,
    }

    impl BuildObserver for Recorder {
        fn on_progress(&mut self, progress: BuildProgress) {
            self.events.push(progress);
        }

        fn is_cancelled(&self) -> bool {
            self.cancel_after.is_some_and(|n| self.events.len() >= n)
        }
    }

    #[test]
    fn test_build_sixteen_slots() {
        let request = TreeRequest::new(Seed::new([1; SEED_LEN]), params(16, 1));
        let tree = build_tree(&request, &mut NoopObserver).unwrap();
        assert_eq!(tree.layers.height(), 4);
        assert_eq!(tree.layers.leaves().len(), 16);
        assert_eq!(tree.root, tree.layers.root());
        assert_eq!(tree.hseed, request.seed.hseed());
        assert_eq!(tree.max_operations_per_interval, 1);
    }

    #[test]
    fn test_build_is_deterministic() {
        let request = TreeRequest::new(Seed::new([9; SEED_LEN]), params(8, 2));
        let a = build_tree(&request, &mut NoopObserver).unwrap();
        let b = build_tree(&request, &mut NoopObserver).unwrap();
        assert_eq!(a.root, b.root);

        let other = TreeRequest::new(Seed::new([8; SEED_LEN]), params(8, 2));
        assert_ne!(build_tree(&other, &mut NoopObserver).unwrap().root, a.root);
    }

    #[test]
    fn test_leaf_matches_otp_derivation() {
        let p = params(4, 2);
        let seed = Seed::new([4; SEED_LEN]);
        let tree = build_tree(&TreeRequest::new(seed.clone(), p), &mut NoopObserver).unwrap();

        // slot 5 = interval 2, nonce 1
        let code = otp::generate(&seed, p.base_counter() + 2).unwrap();
        let expected = crate::leaf::leaf_hash(
            &seed.hseed(),
            &LeafInput::new(code, None, 1),
            p.security.hasher,
        )
        .unwrap();
        assert_eq!(tree.layers.leaf(5).unwrap(), expected);
    }

    #[test]
    fn test_rejects_non_power_of_two() {
        let request = TreeRequest::new(Seed::new([1; SEED_LEN]), params(12, 1));
        assert!(matches!(
            build_tree(&request, &mut NoopObserver),
            Err(Error::InvalidTreeParams(_))
        ));
    }

    #[test]
    fn test_rejects_unaligned_effective_time() {
        let mut p = params(16, 1);
        p.effective_time += 1;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_double_otp_changes_root() {
        let p = params(8, 1);
        let single = build_tree(&TreeRequest::new(Seed::new([1; SEED_LEN]), p), &mut NoopObserver)
            .unwrap();
        let double = build_tree(
            &TreeRequest::new(Seed::new([1; SEED_LEN]), p)
                .with_second_seed(Seed::new([2; SEED_LEN])),
            &mut NoopObserver,
        )
        .unwrap();
        assert_ne!(single.root, double.root);
        assert_ne!(single.identification_key, double.identification_key);
    }

    #[test]
    fn test_inner_trees_are_independent() {
        let spec = InnerTreeSpec {
            spending_limit: 1000,
            spending_interval: 86400,
        };
        let request = TreeRequest::new(Seed::new([5; SEED_LEN]), params(8, 1))
            .with_inner_trees(vec![spec, spec]);
        let tree = build_tree(&request, &mut NoopObserver).unwrap();
        assert_eq!(tree.inner_trees.len(), 2);
        assert_ne!(tree.inner_trees[0].root, tree.root);
        assert_ne!(tree.inner_trees[0].root, tree.inner_trees[1].root);
        assert_eq!(tree.inner_trees[1].index, 1);
    }

    #[test]
    fn test_progress_stages_and_cancellation() {
        let request = TreeRequest::new(Seed::new([3; SEED_LEN]), params(2048, 1));
        let mut recorder = Recorder::default();
        build_tree(&request, &mut recorder).unwrap();
        assert!(recorder
            .events
            .iter()
            .any(|p| p.stage == BuildStage::DerivingLeaves));
        let last = recorder.events.last().unwrap();
        assert_eq!(last.stage, BuildStage::ReducingLayers);
        assert_eq!(last.current, last.total);

        let mut cancelling = Recorder {
            cancel_after: Some(1),
            ..Default::default()
        };
        assert_eq!(build_tree(&request, &mut cancelling), Err(Error::Cancelled));
    }

    #[test]
    fn test_randomized_leaves_reproducible() {
        let mut p = params(8, 1);
        p.security.randomness = 6;
        p.security.hasher = HashFunction::Sha256;
        let seed = Seed::new([6; SEED_LEN]);
        let a = build_tree(&TreeRequest::new(seed.clone(), p), &mut NoopObserver).unwrap();
        let b = build_tree(&TreeRequest::new(seed, p), &mut NoopObserver).unwrap();
        assert_eq!(a.root, b.root);
    }

    #[test]
    fn test_slot_value_reproduces_leaves() {
        let mut p = params(4, 2);
        p.security.randomness = 4;
        let request = TreeRequest::new(Seed::new([7; SEED_LEN]), p)
            .with_second_seed(Seed::new([8; SEED_LEN]));
        let tree = build_tree(&request, &mut NoopObserver).unwrap();
        for slot in 0..8 {
            let value = slot_value(&request, slot).unwrap();
            assert_eq!(hash_leaf(&value), tree.layers.leaf(slot).unwrap());
        }
        assert!(matches!(
            slot_value(&request, 8),
            Err(Error::SlotOutOfRange { index: 8, slots: 8 })
        ));
    }
}
