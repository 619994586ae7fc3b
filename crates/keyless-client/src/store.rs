//! Persistent wallet storage
//!
//! Layout under the store directory:
//!
//! ```text
//! wallets/<address>.json   wallet record
//! layers/<root>.bin        layer blob, shared by every core with that root
//! commits/<address>.json   commit awaiting its reveal
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use keyless_core::{Address, Hash32, Layers, WalletRecord};

use crate::error::{ClientError, Result};
use crate::registry::PendingCommit;

/// File-backed store of wallet records and layers
#[derive(Debug, Clone)]
pub struct WalletStore {
    /// Base path for storage
    store_path: PathBuf,
}

impl WalletStore {
    /// Open a store, creating its directories
    pub fn new(store_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(store_path.join("wallets"))?;
        std::fs::create_dir_all(store_path.join("layers"))?;
        std::fs::create_dir_all(store_path.join("commits"))?;
        Ok(Self { store_path })
    }

    pub fn path(&self) -> &Path {
        &self.store_path
    }

    fn wallet_path(&self, address: &Address) -> PathBuf {
        self.store_path
            .join("wallets")
            .join(format!("{}.json", address.to_hex()))
    }

    fn commit_path(&self, address: &Address) -> PathBuf {
        self.store_path
            .join("commits")
            .join(format!("{}.json", address.to_hex()))
    }

    fn layers_path(&self, root: &Hash32) -> PathBuf {
        self.store_path
            .join("layers")
            .join(format!("{}.bin", hex::encode(root.0)))
    }

    /// Write a wallet record, replacing any previous one
    pub fn save_wallet(&self, record: &WalletRecord) -> Result<()> {
        let content = serde_json::to_string_pretty(record)?;
        write_atomic(&self.wallet_path(&record.address), content.as_bytes())?;
        debug!(address = %record.address, "Saved wallet record");
        Ok(())
    }

    pub fn load_wallet(&self, address: &Address) -> Result<WalletRecord> {
        let path = self.wallet_path(address);
        if !path.exists() {
            return Err(ClientError::WalletNotFound(address.to_hex()));
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// List all stored wallet addresses
    pub fn list_wallets(&self) -> Result<Vec<Address>> {
        let mut addresses = Vec::new();
        for entry in std::fs::read_dir(self.store_path.join("wallets"))? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Some(stem) = path.file_stem() {
                    if let Ok(address) = stem.to_string_lossy().parse::<Address>() {
                        addresses.push(address);
                    }
                }
            }
        }
        addresses.sort();
        Ok(addresses)
    }

    pub fn has_layers(&self, root: &Hash32) -> bool {
        self.layers_path(root).exists()
    }

    /// Write layers under their root; returns false if already stored
    pub fn save_layers(&self, layers: &Layers) -> Result<bool> {
        let root = layers.root();
        let path = self.layers_path(&root);
        if path.exists() {
            return Ok(false);
        }
        write_atomic(&path, &layers.to_bytes())?;
        debug!(root = %root.short(), height = layers.height(), "Saved layers");
        Ok(true)
    }

    /// Read layers, checking they hash to the root they are stored under
    pub fn load_layers(&self, root: &Hash32) -> Result<Layers> {
        let path = self.layers_path(root);
        if !path.exists() {
            return Err(ClientError::LayersNotFound(root.to_hex()));
        }
        let layers = Layers::from_bytes(&std::fs::read(&path)?)?;
        if layers.root() != *root {
            return Err(keyless_core::Error::RootMismatch {
                expected: root.to_hex(),
                actual: layers.root().to_hex(),
            }
            .into());
        }
        Ok(layers)
    }

    pub fn save_pending_commit(&self, address: &Address, pending: &PendingCommit) -> Result<()> {
        let content = serde_json::to_string_pretty(pending)?;
        write_atomic(&self.commit_path(address), content.as_bytes())?;
        debug!(address = %address, hash = %pending.hash.short(), "Saved pending commit");
        Ok(())
    }

    pub fn load_pending_commit(&self, address: &Address) -> Result<Option<PendingCommit>> {
        let path = self.commit_path(address);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn clear_pending_commit(&self, address: &Address) -> Result<()> {
        let path = self.commit_path(address);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Remove a wallet and every layer blob no remaining wallet references
    ///
    /// Returns the roots whose layers were deleted.
    pub fn evict(&self, address: &Address) -> Result<Vec<Hash32>> {
        let record = self.load_wallet(address)?;
        std::fs::remove_file(self.wallet_path(address))?;
        self.clear_pending_commit(address)?;
        let removed = self.release_layers(&record.referenced_roots())?;
        info!(address = %address, removed = removed.len(), "Evicted wallet");
        Ok(removed)
    }

    /// Delete the layers of `roots` that no stored wallet references
    pub fn release_layers(&self, roots: &[Hash32]) -> Result<Vec<Hash32>> {
        let mut still_used = HashSet::new();
        for other in self.list_wallets()? {
            still_used.extend(self.load_wallet(&other)?.referenced_roots());
        }

        let mut removed = Vec::new();
        for root in roots {
            if still_used.contains(root) || removed.contains(root) {
                continue;
            }
            let path = self.layers_path(root);
            if path.exists() {
                std::fs::remove_file(&path)?;
                debug!(root = %root.short(), "Removed unreferenced layers");
                removed.push(*root);
            }
        }
        Ok(removed)
    }
}

/// Write to a temp file first, then rename for atomicity
fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyless_core::{CoreGeneration, SecurityParameters, WalletCore};

    fn layers(seed: u8) -> Layers {
        Layers::build((0..8u8).map(|i| Hash32([seed ^ i; 32])).collect()).unwrap()
    }

    fn record(address: u8, root: Hash32) -> WalletRecord {
        WalletRecord {
            address: Address([address; 20]),
            name: String::new(),
            core: WalletCore {
                root,
                height: 3,
                interval: 30,
                effective_time: 0,
                duration: 240,
                slot_size: 1,
            },
            hseed: Hash32([address; 32]),
            last_resort_address: Address([0xee; 20]),
            daily_limit: 0,
            security: SecurityParameters::default(),
            double_otp: false,
            old_infos: Vec::new(),
            inner_cores: Vec::new(),
            identification_keys: Vec::new(),
        }
    }

    #[test]
    fn test_wallet_roundtrip_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = WalletStore::new(dir.path().to_path_buf()).unwrap();
        let a = record(1, Hash32([1; 32]));
        let b = record(2, Hash32([2; 32]));
        store.save_wallet(&b).unwrap();
        store.save_wallet(&a).unwrap();
        assert_eq!(store.load_wallet(&a.address).unwrap(), a);
        assert_eq!(store.list_wallets().unwrap(), vec![a.address, b.address]);
        assert!(matches!(
            store.load_wallet(&Address([9; 20])),
            Err(ClientError::WalletNotFound(_))
        ));
    }

    #[test]
    fn test_layers_are_deduplicated_by_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = WalletStore::new(dir.path().to_path_buf()).unwrap();
        let l = layers(1);
        assert!(store.save_layers(&l).unwrap());
        assert!(!store.save_layers(&l).unwrap());
        assert_eq!(store.load_layers(&l.root()).unwrap(), l);
        assert!(matches!(
            store.load_layers(&Hash32([0; 32])),
            Err(ClientError::LayersNotFound(_))
        ));
    }

    #[test]
    fn test_evict_keeps_shared_layers() {
        let dir = tempfile::tempdir().unwrap();
        let store = WalletStore::new(dir.path().to_path_buf()).unwrap();
        let shared = layers(1);
        let own = layers(2);
        store.save_layers(&shared).unwrap();
        store.save_layers(&own).unwrap();

        let mut a = record(1, shared.root());
        a.old_infos.push(CoreGeneration {
            core: WalletCore {
                root: own.root(),
                ..a.core
            },
            hseed: Hash32([7; 32]),
            security: SecurityParameters::default(),
        });
        let b = record(2, shared.root());
        store.save_wallet(&a).unwrap();
        store.save_wallet(&b).unwrap();

        let removed = store.evict(&a.address).unwrap();
        assert_eq!(removed, vec![own.root()]);
        assert!(store.has_layers(&shared.root()));
        assert!(!store.has_layers(&own.root()));

        assert_eq!(store.evict(&b.address).unwrap(), vec![shared.root()]);
        assert!(store.list_wallets().unwrap().is_empty());
    }

    #[test]
    fn test_pending_commit_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = WalletStore::new(dir.path().to_path_buf()).unwrap();
        let a = record(1, Hash32([1; 32]));
        store.save_wallet(&a).unwrap();
        assert_eq!(store.load_pending_commit(&a.address).unwrap(), None);

        let pending = PendingCommit {
            hash: Hash32([5; 32]),
            submitted_at: 1000,
        };
        store.save_pending_commit(&a.address, &pending).unwrap();
        assert_eq!(store.load_pending_commit(&a.address).unwrap(), Some(pending));

        store.evict(&a.address).unwrap();
        assert_eq!(store.load_pending_commit(&a.address).unwrap(), None);
    }
}
