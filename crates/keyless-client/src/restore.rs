//! Restoring a wallet from its seed
//!
//! A scanned seed is matched to one generation of the wallet, and that
//! generation's tree is rebuilt so operations can be proven again. The
//! identification key recorded per generation selects the core directly;
//! without a usable key every candidate core is rebuilt until one matches.

use tracing::{info, warn};

use keyless_core::{
    Address, BuiltTree, CoreGeneration, CoreSelection, IdentificationKey, InnerTreeSpec, Seed,
    TreeRequest, WalletCore, WalletRecord,
};
use keyless_worker::TreeWorker;

use crate::error::{ClientError, Result};
use crate::registry::Registry;

/// How the restored core was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedBy {
    IdentificationKey,
    RootComparison,
}

/// A core rebuilt from a seed
///
/// `selection` is the generation to pass to
/// [`OperationIntent::with_generation`](crate::OperationIntent::with_generation)
/// when proving with the restored tree.
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub selection: CoreSelection,
    pub core: WalletCore,
    pub tree: BuiltTree,
    pub matched_by: MatchedBy,
}

/// Find and rebuild the generation of `record` that `seed` belongs to
pub async fn restore(
    worker: &TreeWorker,
    record: &WalletRecord,
    seed: &Seed,
    seed2: Option<&Seed>,
    allow_fallback: bool,
) -> Result<RestoreOutcome> {
    if record.double_otp && seed2.is_none() {
        return Err(ClientError::MissingSecondSeed);
    }

    let key = IdentificationKey::derive(seed, seed2);
    if let Some(selection) = record.find_generation(&key) {
        let generation = record.generation(selection)?;
        let core = generation.core;
        info!(address = %record.address, ?selection, "Identification key matched");
        let tree = rebuild(worker, record, selection, &generation, seed, seed2).await?;
        if tree.root != core.root {
            return Err(keyless_core::Error::RootMismatch {
                expected: core.root.to_hex(),
                actual: tree.root.to_hex(),
            }
            .into());
        }
        return Ok(RestoreOutcome {
            selection,
            core,
            tree,
            matched_by: MatchedBy::IdentificationKey,
        });
    }

    if !allow_fallback {
        return Err(ClientError::NoMatchingCore);
    }

    let candidates = record.candidate_cores();
    warn!(
        address = %record.address,
        candidates = candidates.len(),
        "No identification key matched, rebuilding candidate cores"
    );
    for (selection, generation) in candidates {
        let tree = rebuild(worker, record, selection, &generation, seed, seed2).await?;
        if tree.root == generation.core.root {
            info!(address = %record.address, ?selection, "Root matched");
            return Ok(RestoreOutcome {
                selection,
                core: generation.core,
                tree,
                matched_by: MatchedBy::RootComparison,
            });
        }
    }
    Err(ClientError::NoMatchingCore)
}

/// Restore a stored wallet and persist the rebuilt layers
pub async fn restore_wallet(
    worker: &TreeWorker,
    registry: &mut Registry,
    address: &Address,
    seed: &Seed,
    seed2: Option<&Seed>,
    allow_fallback: bool,
) -> Result<RestoreOutcome> {
    let record = registry.load(address)?.clone();
    let outcome = restore(worker, &record, seed, seed2, allow_fallback).await?;
    registry.persist_layers(outcome.tree.layers.clone())?;
    for inner in &outcome.tree.inner_trees {
        registry.persist_layers(inner.layers.clone())?;
    }
    Ok(outcome)
}

async fn rebuild(
    worker: &TreeWorker,
    record: &WalletRecord,
    selection: CoreSelection,
    generation: &CoreGeneration,
    seed: &Seed,
    seed2: Option<&Seed>,
) -> Result<BuiltTree> {
    let mut request = TreeRequest::new(seed.clone(), generation.params());
    if let Some(seed2) = seed2 {
        request = request.with_second_seed(seed2.clone());
    }
    if selection == CoreSelection::Current {
        if let Some(specs) = inner_specs(record) {
            request = request.with_inner_trees(specs);
        }
    }
    Ok(worker.build(request).await?)
}

/// Inner tree specs in build order, if the recorded inner cores are contiguous
fn inner_specs(record: &WalletRecord) -> Option<Vec<InnerTreeSpec>> {
    if record.inner_cores.is_empty() {
        return None;
    }
    let mut inner: Vec<_> = record.inner_cores.iter().collect();
    inner.sort_by_key(|c| c.index);
    if inner.iter().enumerate().any(|(i, c)| usize::from(c.index) != i) {
        return None;
    }
    Some(
        inner
            .iter()
            .map(|c| InnerTreeSpec {
                spending_limit: c.spending_limit,
                spending_interval: c.spending_interval,
            })
            .collect(),
    )
}
