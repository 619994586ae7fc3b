//! Wallet cores and the per-wallet record
//!
//! A wallet has one current [`WalletCore`], the generations replaced by
//! renewal, and any inner cores bound to it. A replaced generation keeps
//! its hseed and security parameters so it stays provable until it
//! expires. `identification_keys[i]` belongs to `old_infos[i]`; the key
//! after the last old core belongs to the current core.

use serde::{Deserialize, Serialize};

use crate::eotp::{keccak_words, verification_hash, Authorization, ParamsScheme};
use crate::error::{Error, Result};
use crate::identity::IdentificationKey;
use crate::otp;
use crate::tree::{
    slot_value, BuiltInnerTree, BuiltTree, SecurityParameters, TreeParams, TreeRequest,
};
use crate::types::{amount_string, u256_word, Address, Hash32};

/// Immutable parameters of one deployed tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletCore {
    pub root: Hash32,
    pub height: u8,
    pub interval: u64,
    pub effective_time: u64,
    pub duration: u64,
    pub slot_size: u16,
}

impl WalletCore {
    pub fn from_params(root: Hash32, params: &TreeParams) -> Self {
        Self {
            root,
            height: params.height(),
            interval: params.interval,
            effective_time: params.effective_time,
            duration: params.duration,
            slot_size: params.slot_size,
        }
    }

    /// Tree parameters that rebuild this core
    pub fn params(&self, security: SecurityParameters) -> TreeParams {
        TreeParams {
            effective_time: self.effective_time,
            duration: self.duration,
            interval: self.interval,
            slot_size: self.slot_size,
            security,
        }
    }

    pub fn slot_count(&self) -> u64 {
        1u64 << self.height
    }

    /// First unix time after the core's lifespan
    pub fn expires_at(&self) -> u64 {
        self.effective_time.saturating_add(self.duration)
    }

    pub fn is_active(&self, now: u64) -> bool {
        now >= self.effective_time && now < self.expires_at()
    }

    /// TOTP counter at `now`, if the core is active
    pub fn counter(&self, now: u64) -> Result<u64> {
        if !self.is_active(now) {
            return Err(Error::CoreInactive(now));
        }
        Ok(otp::counter_at(now, self.interval))
    }

    /// Leaf index of operation `nonce` at `now`
    pub fn slot_index(&self, now: u64, nonce: u16) -> Result<u64> {
        let counter = self.counter(now)?;
        let slot_size = u64::from(self.slot_size);
        let index = (counter - otp::counter_at(self.effective_time, self.interval)) * slot_size
            + u64::from(nonce);
        if nonce >= self.slot_size || index >= self.slot_count() {
            return Err(Error::SlotOutOfRange {
                index,
                slots: self.slot_count(),
            });
        }
        Ok(index)
    }

    /// TOTP counter of the interval holding `index`
    pub fn counter_for_slot(&self, index: u64) -> Result<u64> {
        if index >= self.slot_count() {
            return Err(Error::SlotOutOfRange {
                index,
                slots: self.slot_count(),
            });
        }
        let slot_size = u64::from(self.slot_size.max(1));
        Ok(otp::counter_at(self.effective_time, self.interval) + index / slot_size)
    }
}

/// Proof that the parent tree authorized an inner core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InnerAuthorization {
    #[serde(flatten)]
    pub authorization: Authorization,
    pub verification_hash: Hash32,
}

/// Sub-wallet with its own tree and a spending limit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InnerCore {
    pub index: u8,
    pub core: WalletCore,
    #[serde(with = "amount_string")]
    pub spending_limit: u128,
    pub spending_interval: u64,
    pub authorization: InnerAuthorization,
}

impl InnerCore {
    /// Params hash of the terms this core is admitted under
    pub fn params_hash(&self) -> Hash32 {
        inner_params_hash(&self.core, self.spending_limit, self.spending_interval)
    }

    /// Check the authorization against the parent root
    pub fn verify_binding(&self, parent_root: &Hash32) -> Result<()> {
        if !self.authorization.authorization.verify(parent_root) {
            return Err(Error::InnerBinding(format!(
                "slot {} does not prove against parent root {}",
                self.authorization.authorization.index,
                parent_root.short()
            )));
        }
        let eotp = &self.authorization.authorization.eotp;
        let expected = verification_hash(&self.params_hash(), eotp);
        if expected != self.authorization.verification_hash {
            return Err(Error::InnerBinding(format!(
                "verification hash does not bind root {}",
                self.core.root.short()
            )));
        }
        Ok(())
    }
}

/// Params hash binding an inner core's terms to its parent wallet
pub fn inner_params_hash(
    core: &WalletCore,
    spending_limit: u128,
    spending_interval: u64,
) -> Hash32 {
    keccak_words(&[
        core.root.0,
        u256_word(u128::from(core.height)),
        u256_word(u128::from(core.interval)),
        u256_word(u128::from(core.effective_time)),
        u256_word(u128::from(core.duration)),
        u256_word(u128::from(core.slot_size)),
        u256_word(spending_limit),
        u256_word(u128::from(spending_interval)),
    ])
}

/// Build the inner core record for a freshly built inner tree
pub fn bind_inner_core(
    inner: &BuiltInnerTree,
    params: &TreeParams,
    parent_authorization: Authorization,
) -> InnerCore {
    let core = WalletCore::from_params(inner.root, params);
    let spec = inner.spec;
    let params_hash = inner_params_hash(&core, spec.spending_limit, spec.spending_interval);
    InnerCore {
        index: inner.index,
        core,
        spending_limit: spec.spending_limit,
        spending_interval: spec.spending_interval,
        authorization: InnerAuthorization {
            verification_hash: verification_hash(&params_hash, &parent_authorization.eotp),
            authorization: parent_authorization,
        },
    }
}

/// Inner cores for every inner tree of a fresh build
///
/// Inner tree `i` is authorized by main slot `slots - 1 - i`.
pub fn bind_built_inner_trees(request: &TreeRequest, tree: &BuiltTree) -> Result<Vec<InnerCore>> {
    let slots = tree.layers.slot_count();
    tree.inner_trees
        .iter()
        .map(|inner| {
            let slot = slots.checked_sub(1 + u64::from(inner.index)).ok_or_else(|| {
                Error::InnerBinding(format!("no parent slot for inner tree {}", inner.index))
            })?;
            let authorization =
                Authorization::new(tree.layers.proof(slot)?, slot_value(request, slot)?)?;
            Ok(bind_inner_core(inner, &tree.params, authorization))
        })
        .collect()
}

/// Which generation of a wallet a seed belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreSelection {
    Current,
    /// Index into `old_infos`
    Old(usize),
}

/// Proof material of one tree generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreGeneration {
    #[serde(flatten)]
    pub core: WalletCore,
    pub hseed: Hash32,
    pub security: SecurityParameters,
}

impl CoreGeneration {
    /// Tree parameters that rebuild this generation
    pub fn params(&self) -> TreeParams {
        self.core.params(self.security)
    }
}

/// Which tree of the selected generation proves an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TreeTarget {
    #[default]
    Main,
    Inner(u8),
}

/// Everything persisted about one wallet
///
/// Holds no secrets: the hseed is a one-way digest of the seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletRecord {
    pub address: Address,
    #[serde(default)]
    pub name: String,
    pub core: WalletCore,
    pub hseed: Hash32,
    pub last_resort_address: Address,
    /// Largest native amount per transfer, 0 for no limit
    #[serde(with = "amount_string")]
    pub daily_limit: u128,
    pub security: SecurityParameters,
    #[serde(default)]
    pub double_otp: bool,
    #[serde(default)]
    pub old_infos: Vec<CoreGeneration>,
    #[serde(default)]
    pub inner_cores: Vec<InnerCore>,
    #[serde(default)]
    pub identification_keys: Vec<IdentificationKey>,
}

impl WalletRecord {
    /// Record for a wallet deployed from a freshly built tree
    pub fn from_built(
        address: Address,
        tree: &BuiltTree,
        last_resort_address: Address,
        daily_limit: u128,
        double_otp: bool,
    ) -> Self {
        Self {
            address,
            name: String::new(),
            core: WalletCore::from_params(tree.root, &tree.params),
            hseed: tree.hseed,
            last_resort_address,
            daily_limit,
            security: tree.params.security,
            double_otp,
            old_infos: Vec::new(),
            inner_cores: Vec::new(),
            identification_keys: vec![tree.identification_key],
        }
    }

    pub fn scheme(&self) -> ParamsScheme {
        ParamsScheme::for_version(self.security.major_version)
    }

    /// Whether every core has a recorded identification key
    pub fn has_aligned_keys(&self) -> bool {
        self.identification_keys.len() == self.old_infos.len() + 1
    }

    /// Look up the generation a key was recorded for
    pub fn find_generation(&self, key: &IdentificationKey) -> Option<CoreSelection> {
        if !self.has_aligned_keys() {
            return None;
        }
        let position = self.identification_keys.iter().position(|k| k == key)?;
        if position == self.old_infos.len() {
            Some(CoreSelection::Current)
        } else {
            Some(CoreSelection::Old(position))
        }
    }

    pub fn core_for(&self, selection: CoreSelection) -> Option<&WalletCore> {
        match selection {
            CoreSelection::Current => Some(&self.core),
            CoreSelection::Old(i) => self.old_infos.get(i).map(|g| &g.core),
        }
    }

    pub fn current_generation(&self) -> CoreGeneration {
        CoreGeneration {
            core: self.core,
            hseed: self.hseed,
            security: self.security,
        }
    }

    /// Core, hseed and security parameters of a generation
    pub fn generation(&self, selection: CoreSelection) -> Result<CoreGeneration> {
        match selection {
            CoreSelection::Current => Ok(self.current_generation()),
            CoreSelection::Old(i) => self
                .old_infos
                .get(i)
                .copied()
                .ok_or(Error::UnknownGeneration(i)),
        }
    }

    /// Generations in restore search order: current first, then newest old first
    pub fn candidate_cores(&self) -> Vec<(CoreSelection, CoreGeneration)> {
        let mut candidates = vec![(CoreSelection::Current, self.current_generation())];
        candidates.extend(
            self.old_infos
                .iter()
                .enumerate()
                .rev()
                .map(|(i, generation)| (CoreSelection::Old(i), *generation)),
        );
        candidates
    }

    /// Replace the current generation, keeping the old one provable
    pub fn renew(
        &mut self,
        core: WalletCore,
        hseed: Hash32,
        security: SecurityParameters,
        key: IdentificationKey,
    ) {
        let aligned = self.has_aligned_keys();
        self.old_infos.push(self.current_generation());
        self.core = core;
        self.hseed = hseed;
        self.security = security;
        self.inner_cores.clear();
        if aligned {
            self.identification_keys.push(key);
        }
    }

    pub fn inner_core(&self, index: u8) -> Option<&InnerCore> {
        self.inner_cores.iter().find(|c| c.index == index)
    }

    /// Admit an inner core after checking its binding to the current root
    pub fn add_inner_core(&mut self, inner: InnerCore) -> Result<()> {
        if self.inner_core(inner.index).is_some() {
            return Err(Error::InnerBinding(format!(
                "inner core {} already registered",
                inner.index
            )));
        }
        inner.verify_binding(&self.core.root)?;
        self.inner_cores.push(inner);
        Ok(())
    }

    /// Core proving operations for `target` in generation `selection`
    ///
    /// Inner cores exist only in the current generation.
    pub fn target_core(&self, selection: CoreSelection, target: TreeTarget) -> Result<WalletCore> {
        match (selection, target) {
            (selection, TreeTarget::Main) => Ok(self.generation(selection)?.core),
            (CoreSelection::Current, TreeTarget::Inner(i)) => self
                .inner_core(i)
                .map(|c| c.core)
                .ok_or_else(|| Error::InnerBinding(format!("no inner core {}", i))),
            (CoreSelection::Old(g), TreeTarget::Inner(i)) => Err(Error::InnerBinding(format!(
                "generation {} has no inner core {}",
                g, i
            ))),
        }
    }

    /// Reject a native amount over the applicable limit
    pub fn check_spending_limit(&self, target: TreeTarget, amount: u128) -> Result<()> {
        let limit = match target {
            TreeTarget::Main => self.daily_limit,
            TreeTarget::Inner(i) => {
                self.inner_core(i)
                    .ok_or_else(|| Error::InnerBinding(format!("no inner core {}", i)))?
                    .spending_limit
            }
        };
        if limit > 0 && amount > limit {
            return Err(Error::InvalidAmount(format!(
                "{} exceeds spending limit {}",
                amount, limit
            )));
        }
        Ok(())
    }

    /// Every root whose layers this record needs
    pub fn referenced_roots(&self) -> Vec<Hash32> {
        let mut roots = vec![self.core.root];
        roots.extend(self.inner_cores.iter().map(|c| c.core.root));
        roots.extend(self.old_infos.iter().map(|g| g.core.root));
        roots
    }
}
