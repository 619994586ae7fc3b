//! End-to-end workflow tests for keyless wallets
//!
//! These tests drive a wallet through its whole life: tree construction,
//! operations through commit and reveal, inner cores, renewal, restore on a
//! fresh device and eviction.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use keyless_client::{
    restore_wallet, ClientError, CommitRequest, CommitRevealFlow, FlowError, FlowSettings,
    FlowState, MatchedBy, OperationIntent, Registry, Relayer, RelayerError, RelayerReceipt,
    RevealRequest, WalletStore,
};
use keyless_core::{
    bind_built_inner_trees, otp, Address, CoreSelection, Hash32, HashFunction, InnerTreeSpec,
    Operation, SecurityParameters, Seed, TreeParams, TreeRequest, TreeTarget, WalletRecord,
    SEED_LEN,
};
use keyless_worker::TreeWorker;

const INTERVAL: u64 = 30;
const SLOTS: u64 = 16;
const EPOCH: u64 = 1_700_000_010;

/// Relayer enforcing the contract's commit-before-reveal rule
#[derive(Default)]
struct ContractRelayer {
    commits: Mutex<HashSet<Hash32>>,
    spent: Mutex<HashSet<Hash32>>,
    executed: Mutex<Vec<RevealRequest>>,
}

#[async_trait]
impl Relayer for ContractRelayer {
    async fn commit(&self, request: &CommitRequest) -> Result<RelayerReceipt, RelayerError> {
        if !self.commits.lock().unwrap().insert(request.hash) {
            return Err(RelayerError::Rejected("commit already exists".to_string()));
        }
        Ok(RelayerReceipt { tx: None })
    }

    async fn reveal(&self, request: &RevealRequest) -> Result<RelayerReceipt, RelayerError> {
        let hash = request
            .authorization
            .commit_hash()
            .map_err(|e| RelayerError::Rejected(e.to_string()))?;
        if !self.commits.lock().unwrap().contains(&hash) {
            return Err(RelayerError::Rejected("no matching commit".to_string()));
        }
        if !self.spent.lock().unwrap().insert(hash) {
            return Err(RelayerError::Rejected("commit already revealed".to_string()));
        }
        self.executed.lock().unwrap().push(request.clone());
        Ok(RelayerReceipt {
            tx: Some(format!("0x{:02x}", self.executed.lock().unwrap().len())),
        })
    }

    async fn health(&self) -> Result<(), RelayerError> {
        Ok(())
    }
}

fn params(effective_time: u64) -> TreeParams {
    TreeParams {
        effective_time,
        duration: SLOTS * INTERVAL,
        interval: INTERVAL,
        slot_size: 1,
        security: SecurityParameters::default(),
    }
}

fn code(seed: &Seed, at: u64) -> String {
    otp::generate_at(seed, at, INTERVAL).unwrap().to_string()
}

fn flow(
    address: Address,
    relayer: &Arc<ContractRelayer>,
    worker: &Arc<TreeWorker>,
) -> CommitRevealFlow {
    CommitRevealFlow::new(address, relayer.clone(), worker.clone()).with_settings(FlowSettings {
        reveal_attempts: 2,
        retry_delay: Duration::from_millis(1),
    })
}

/// Simulates the complete lifecycle of a wallet
#[tokio::test]
async fn test_full_wallet_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let worker = Arc::new(TreeWorker::new());
    let relayer = Arc::new(ContractRelayer::default());
    let address = Address([0x5a; 20]);
    let dest = Address([0x77; 20]);

    // ==========================================
    // STEP 1: Build the first generation with one inner tree
    // ==========================================
    let first_seed = Seed::new([0x01; SEED_LEN]);
    let first_start = EPOCH - EPOCH % INTERVAL;
    let request = TreeRequest::new(first_seed.clone(), params(first_start)).with_inner_trees(vec![
        InnerTreeSpec {
            spending_limit: 300,
            spending_interval: 86400,
        },
    ]);
    let first = worker.build(request.clone()).await.unwrap();
    assert_eq!(first.layers.slot_count(), SLOTS);

    let mut record = WalletRecord::from_built(address, &first, Address([0xee; 20]), 10_000, false);
    for inner in bind_built_inner_trees(&request, &first).unwrap() {
        record.add_inner_core(inner).unwrap();
    }
    drop(request);

    let mut registry = Registry::new(WalletStore::new(dir.path().to_path_buf()).unwrap(), 60);
    registry.persist_built(record, &first).unwrap();

    // ==========================================
    // STEP 2: Transfer from the main tree
    // ==========================================
    let now = first_start + 15;
    let mut transfer = flow(address, &relayer, &worker);
    let receipt = transfer
        .run(
            &mut registry,
            &OperationIntent::new(
                Operation::Transfer {
                    dest,
                    amount: 2_500,
                },
                code(&first_seed, now),
            ),
            now,
        )
        .await
        .unwrap();
    assert_eq!(receipt.tx.as_deref(), Some("0x01"));
    assert!(matches!(transfer.state(), FlowState::Revealed(_)));

    // ==========================================
    // STEP 3: Spend through the inner core, within its limit
    // ==========================================
    let mut over_limit = flow(address, &relayer, &worker);
    let err = over_limit
        .run(
            &mut registry,
            &OperationIntent::new(Operation::Transfer { dest, amount: 301 }, code(&first_seed, now))
                .with_target(TreeTarget::Inner(0)),
            now,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Validation(_)));

    let mut inner_spend = flow(address, &relayer, &worker);
    inner_spend
        .run(
            &mut registry,
            &OperationIntent::new(Operation::Transfer { dest, amount: 300 }, code(&first_seed, now))
                .with_target(TreeTarget::Inner(0)),
            now,
        )
        .await
        .unwrap();
    assert_eq!(relayer.executed.lock().unwrap().len(), 2);

    // ==========================================
    // STEP 4: Renew with a new seed
    // ==========================================
    let second_seed = Seed::new([0x02; SEED_LEN]);
    let second_start = first_start + SLOTS * INTERVAL;
    let second = worker
        .build(TreeRequest::new(second_seed.clone(), params(second_start)))
        .await
        .unwrap();
    registry.renew(&address, &second).unwrap();
    drop(registry);

    // reopen from disk
    let mut registry = Registry::new(WalletStore::new(dir.path().to_path_buf()).unwrap(), 60);
    let renewed = registry.load(&address).unwrap().clone();
    assert_eq!(renewed.core.root, second.root);
    assert_eq!(renewed.old_infos.len(), 1);
    assert!(renewed.inner_cores.is_empty());
    assert_eq!(renewed.identification_keys.len(), 2);

    let later = second_start + 15;
    let mut stale = flow(address, &relayer, &worker);
    let err = stale
        .run(
            &mut registry,
            &OperationIntent::new(Operation::Recover, code(&first_seed, later)),
            later,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Validation(_)));

    let mut recover = flow(address, &relayer, &worker);
    recover
        .run(
            &mut registry,
            &OperationIntent::new(Operation::Recover, code(&second_seed, later)),
            later,
        )
        .await
        .unwrap();
    assert_eq!(
        relayer.executed.lock().unwrap().last().unwrap().operation,
        Operation::Recover
    );

    // ==========================================
    // STEP 5: Restore on a device holding only the wallet record
    // ==========================================
    let device = tempfile::tempdir().unwrap();
    let device_store = WalletStore::new(device.path().to_path_buf()).unwrap();
    device_store.save_wallet(&renewed).unwrap();
    let mut device_registry = Registry::new(device_store, 60);

    let next = later + INTERVAL;
    let intent = OperationIntent::new(
        Operation::Transfer {
            dest,
            amount: 1_000,
        },
        code(&second_seed, next),
    );
    let mut without_layers = flow(address, &relayer, &worker);
    assert!(matches!(
        without_layers.run(&mut device_registry, &intent, next).await,
        Err(FlowError::Proof(_))
    ));

    let old = restore_wallet(&worker, &mut device_registry, &address, &first_seed, None, false)
        .await
        .unwrap();
    assert_eq!(old.selection, CoreSelection::Old(0));
    assert_eq!(old.matched_by, MatchedBy::IdentificationKey);

    let current = restore_wallet(&worker, &mut device_registry, &address, &second_seed, None, false)
        .await
        .unwrap();
    assert_eq!(current.selection, CoreSelection::Current);
    assert!(device_registry.store().has_layers(&second.root));

    let mut restored = flow(address, &relayer, &worker);
    restored.run(&mut device_registry, &intent, next).await.unwrap();
    assert_eq!(relayer.executed.lock().unwrap().len(), 4);

    // ==========================================
    // STEP 6: Evict
    // ==========================================
    registry.evict(&address).unwrap();
    assert!(!registry.store().has_layers(&first.root));
    assert!(!registry.store().has_layers(&second.root));
    assert!(!registry.store().has_layers(&first.inner_trees[0].root));
    assert!(registry.store().list_wallets().unwrap().is_empty());
    assert!(matches!(
        registry.load(&address),
        Err(ClientError::WalletNotFound(_))
    ));
}

/// A wallet whose identification keys are missing is found by rebuilding
#[tokio::test]
async fn test_restore_without_identification_keys() {
    let dir = tempfile::tempdir().unwrap();
    let worker = TreeWorker::new();
    let address = Address([0x33; 20]);
    let seeds: Vec<Seed> = (1..=3u8).map(|b| Seed::new([b; SEED_LEN])).collect();

    let mut record: Option<WalletRecord> = None;
    for (generation, seed) in seeds.iter().enumerate() {
        let start = EPOCH - EPOCH % INTERVAL + generation as u64 * SLOTS * INTERVAL;
        let tree = worker
            .build(TreeRequest::new(seed.clone(), params(start)))
            .await
            .unwrap();
        record = Some(match record {
            None => WalletRecord::from_built(address, &tree, Address([0xee; 20]), 0, false),
            Some(mut r) => {
                r.renew(
                    keyless_core::WalletCore::from_params(tree.root, &tree.params),
                    tree.hseed,
                    tree.params.security,
                    tree.identification_key,
                );
                r
            }
        });
    }
    let mut record = record.unwrap();
    record.identification_keys.truncate(1);
    assert!(!record.has_aligned_keys());

    let store = WalletStore::new(dir.path().to_path_buf()).unwrap();
    store.save_wallet(&record).unwrap();
    let mut registry = Registry::new(store, 60);

    assert!(matches!(
        restore_wallet(&worker, &mut registry, &address, &seeds[0], None, false).await,
        Err(ClientError::NoMatchingCore)
    ));
    let outcome = restore_wallet(&worker, &mut registry, &address, &seeds[0], None, true)
        .await
        .unwrap();
    assert_eq!(outcome.selection, CoreSelection::Old(0));
    assert_eq!(outcome.matched_by, MatchedBy::RootComparison);
    assert!(registry.store().has_layers(&record.old_infos[0].core.root));
}

/// A generation replaced before it expired can still be restored and used
#[tokio::test]
async fn test_restored_old_generation_proves_operation() {
    let dir = tempfile::tempdir().unwrap();
    let worker = Arc::new(TreeWorker::new());
    let relayer = Arc::new(ContractRelayer::default());
    let address = Address([0x44; 20]);
    let start = EPOCH - EPOCH % INTERVAL;

    // ==========================================
    // STEP 1: Build, then renew while the first tree is still active
    // ==========================================
    let first_seed = Seed::new([0x0a; SEED_LEN]);
    let first = worker
        .build(TreeRequest::new(first_seed.clone(), params(start)))
        .await
        .unwrap();
    let mut renewed = params(start + 2 * INTERVAL);
    renewed.security.hasher = HashFunction::Sha256;
    let second = worker
        .build(TreeRequest::new(Seed::new([0x0b; SEED_LEN]), renewed))
        .await
        .unwrap();

    let mut registry = Registry::new(WalletStore::new(dir.path().to_path_buf()).unwrap(), 60);
    let record = WalletRecord::from_built(address, &first, Address([0xee; 20]), 0, false);
    registry.persist_built(record, &first).unwrap();
    registry.renew(&address, &second).unwrap();
    let record = registry.load(&address).unwrap().clone();

    // ==========================================
    // STEP 2: Restore the first generation on a device without layers
    // ==========================================
    let device = tempfile::tempdir().unwrap();
    let device_store = WalletStore::new(device.path().to_path_buf()).unwrap();
    device_store.save_wallet(&record).unwrap();
    let mut device_registry = Registry::new(device_store, 60);

    let outcome = restore_wallet(&worker, &mut device_registry, &address, &first_seed, None, true)
        .await
        .unwrap();
    assert_eq!(outcome.selection, CoreSelection::Old(0));
    assert_eq!(outcome.core.root, first.root);

    // ==========================================
    // STEP 3: Prove with the restored generation
    // ==========================================
    let now = start + 15;
    let intent = OperationIntent::new(Operation::Recover, code(&first_seed, now));
    let mut current = flow(address, &relayer, &worker);
    assert!(matches!(
        current.run(&mut device_registry, &intent, now).await,
        Err(FlowError::Validation(keyless_core::Error::CoreInactive(_)))
    ));

    let mut old = flow(address, &relayer, &worker);
    old.run(
        &mut device_registry,
        &intent.with_generation(outcome.selection),
        now,
    )
    .await
    .unwrap();
    let executed = relayer.executed.lock().unwrap();
    assert_eq!(executed.len(), 1);
    assert!(executed[0].authorization.verify(&first.root));
}
