//! Wallet registry
//!
//! Owns the loaded wallet records, a cache of their layers, and the
//! outstanding-commit ledger, which is mirrored to the store so it holds
//! across processes. Nothing here is global: callers create a
//! [`Registry`] over a store and pass it to the operations that need it.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use keyless_core::{Address, BuiltTree, Hash32, InnerCore, Layers, WalletCore, WalletRecord};

use crate::error::{ClientError, Result};
use crate::store::WalletStore;

/// A commit submitted and not yet revealed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCommit {
    pub hash: Hash32,
    /// Unix time of submission
    pub submitted_at: u64,
}

/// Loaded wallets and their layers
pub struct Registry {
    store: WalletStore,
    wallets: HashMap<Address, WalletRecord>,
    layers: HashMap<Hash32, Arc<Layers>>,
    commits: HashMap<Address, PendingCommit>,
    commit_timeout: u64,
}

impl Registry {
    pub fn new(store: WalletStore, commit_timeout_secs: u64) -> Self {
        Self {
            store,
            wallets: HashMap::new(),
            layers: HashMap::new(),
            commits: HashMap::new(),
            commit_timeout: commit_timeout_secs,
        }
    }

    pub fn store(&self) -> &WalletStore {
        &self.store
    }

    /// Load a wallet record from the store
    pub fn load(&mut self, address: &Address) -> Result<&WalletRecord> {
        if !self.wallets.contains_key(address) {
            let record = self.store.load_wallet(address)?;
            self.wallets.insert(*address, record);
        }
        self.wallets
            .get(address)
            .ok_or_else(|| ClientError::WalletNotFound(address.to_hex()))
    }

    /// Load every stored wallet
    pub fn load_all(&mut self) -> Result<Vec<Address>> {
        let addresses = self.store.list_wallets()?;
        for address in &addresses {
            self.load(address)?;
        }
        Ok(addresses)
    }

    pub fn get(&self, address: &Address) -> Option<&WalletRecord> {
        self.wallets.get(address)
    }

    /// Loaded wallets, ordered by address
    pub fn wallets(&self) -> Vec<&WalletRecord> {
        let mut wallets: Vec<&WalletRecord> = self.wallets.values().collect();
        wallets.sort_by_key(|w| w.address);
        wallets
    }

    /// Write a record and cache it
    pub fn persist(&mut self, record: WalletRecord) -> Result<()> {
        self.store.save_wallet(&record)?;
        info!(address = %record.address, root = %record.core.root.short(), "Persisted wallet");
        self.wallets.insert(record.address, record);
        Ok(())
    }

    /// Store layers under their root and cache them
    pub fn persist_layers(&mut self, layers: Layers) -> Result<Arc<Layers>> {
        self.store.save_layers(&layers)?;
        let layers = Arc::new(layers);
        self.layers.insert(layers.root(), layers.clone());
        Ok(layers)
    }

    /// Persist a freshly built tree: the record and every tree's layers
    pub fn persist_built(&mut self, record: WalletRecord, tree: &BuiltTree) -> Result<()> {
        self.persist_layers(tree.layers.clone())?;
        for inner in &tree.inner_trees {
            self.persist_layers(inner.layers.clone())?;
        }
        self.persist(record)
    }

    /// Layers for a root, from cache or store
    pub fn layers(&mut self, root: &Hash32) -> Result<Arc<Layers>> {
        if let Some(layers) = self.layers.get(root) {
            return Ok(layers.clone());
        }
        let layers = Arc::new(self.store.load_layers(root)?);
        debug!(root = %root.short(), "Loaded layers");
        self.layers.insert(*root, layers.clone());
        Ok(layers)
    }

    /// Drop a wallet from memory and storage
    pub fn evict(&mut self, address: &Address) -> Result<()> {
        let removed = self.store.evict(address)?;
        self.wallets.remove(address);
        self.commits.remove(address);
        for root in removed {
            self.layers.remove(&root);
        }
        Ok(())
    }

    /// Move a wallet to a new tree generation
    ///
    /// Inner cores belong to the replaced generation and are dropped.
    pub fn renew(&mut self, address: &Address, tree: &BuiltTree) -> Result<()> {
        let mut record = self.load(address)?.clone();
        let dropped: Vec<Hash32> = record.inner_cores.iter().map(|c| c.core.root).collect();
        record.renew(
            WalletCore::from_params(tree.root, &tree.params),
            tree.hseed,
            tree.params.security,
            tree.identification_key,
        );
        self.persist_layers(tree.layers.clone())?;
        self.persist(record)?;
        for root in self.store.release_layers(&dropped)? {
            self.layers.remove(&root);
        }
        info!(address = %address, root = %tree.root.short(), "Renewed wallet");
        Ok(())
    }

    /// Admit an inner core whose layers are already built
    pub fn add_inner_core(
        &mut self,
        address: &Address,
        inner: InnerCore,
        layers: Layers,
    ) -> Result<()> {
        if layers.root() != inner.core.root {
            return Err(keyless_core::Error::RootMismatch {
                expected: inner.core.root.to_hex(),
                actual: layers.root().to_hex(),
            }
            .into());
        }
        let mut record = self.load(address)?.clone();
        record.add_inner_core(inner)?;
        self.persist_layers(layers)?;
        self.persist(record)
    }

    /// Outstanding commit of a wallet, from cache or store
    fn outstanding(&mut self, address: &Address) -> Result<Option<PendingCommit>> {
        if !self.commits.contains_key(address) {
            if let Some(pending) = self.store.load_pending_commit(address)? {
                self.commits.insert(*address, pending);
            }
        }
        Ok(self.commits.get(address).copied())
    }

    /// Reserve the wallet's commit slot
    ///
    /// Fails while an earlier commit is younger than the contract timeout.
    pub fn begin_commit(&mut self, address: &Address, now: u64) -> Result<()> {
        if let Some(pending) = self.outstanding(address)? {
            let expires = pending.submitted_at.saturating_add(self.commit_timeout);
            if now < expires {
                return Err(ClientError::CommitOutstanding {
                    address: address.to_hex(),
                    retry_after: expires - now,
                });
            }
            debug!(address = %address, "Previous commit expired");
            self.commits.remove(address);
            self.store.clear_pending_commit(address)?;
        }
        Ok(())
    }

    /// Record a commit accepted by the relayer
    pub fn record_commit(&mut self, address: &Address, hash: Hash32, now: u64) -> Result<()> {
        let pending = PendingCommit {
            hash,
            submitted_at: now,
        };
        self.commits.insert(*address, pending);
        self.store.save_pending_commit(address, &pending)
    }

    /// Release the commit slot after its reveal succeeded
    pub fn complete_commit(&mut self, address: &Address) -> Result<Option<PendingCommit>> {
        let pending = self.outstanding(address)?;
        self.commits.remove(address);
        self.store.clear_pending_commit(address)?;
        Ok(pending)
    }

    pub fn pending_commit(&self, address: &Address) -> Option<&PendingCommit> {
        self.commits.get(address)
    }
}
