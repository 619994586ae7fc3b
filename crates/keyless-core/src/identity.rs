//! Seeds and values derived from them
//!
//! A [`Seed`] is the only secret in the system. Everything persisted is
//! derived one-way from it:
//!
//! - `hseed = keccak256(seed)`, the per-wallet prefix mixed into every leaf
//! - an [`IdentificationKey`], a fingerprint used to tell tree generations apart
//! - the per-slot randomness of randomized leaves

use std::fmt;

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::hash::keccak256_multi;
use crate::types::Hash32;

/// Seed length in bytes (160-bit TOTP secret)
pub const SEED_LEN: usize = 20;

/// Maximum supported randomness width in bits
pub const MAX_RANDOMNESS_BITS: u8 = 24;

const IDENTIFICATION_DOMAIN: &[u8] = b"keyless/identification";
const RANDOMNESS_DOMAIN: &[u8] = b"keyless/randomness";
const INNER_DOMAIN: &[u8] = b"keyless/inner";

/// TOTP seed
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Seed([u8; SEED_LEN]);

impl Seed {
    pub fn new(bytes: [u8; SEED_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random seed
    pub fn generate() -> Self {
        let mut bytes = [0u8; SEED_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; SEED_LEN] = bytes.try_into().map_err(|_| {
            Error::InvalidSeed(format!("expected {} bytes, got {}", SEED_LEN, bytes.len()))
        })?;
        Ok(Self(bytes))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.trim();
        let s = s.strip_prefix("0x").unwrap_or(s);
        let mut bytes = [0u8; SEED_LEN];
        hex::decode_to_slice(s, &mut bytes).map_err(|e| Error::InvalidSeed(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Hex encoding, for one-time display to the user
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; SEED_LEN] {
        &self.0
    }

    /// `keccak256(seed)`
    pub fn hseed(&self) -> Hash32 {
        Hash32(keccak256_multi(&[&self.0]))
    }

    /// Randomness mixed into the leaf at `slot`, masked to `bits`
    ///
    /// Derived from the seed rather than sampled so that a tree rebuilt
    /// from the same seed reproduces the same root. Holders of only the
    /// hseed must search for it.
    pub fn leaf_randomness(&self, slot: u64, bits: u8) -> u32 {
        if bits == 0 {
            return 0;
        }
        let digest = keccak256_multi(&[RANDOMNESS_DOMAIN, &self.0, &slot.to_be_bytes()]);
        let raw = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        raw & randomness_mask(bits)
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Seed(<redacted>)")
    }
}

/// Mask selecting the low `bits` bits
pub fn randomness_mask(bits: u8) -> u32 {
    match bits {
        0 => 0,
        b if b >= 32 => u32::MAX,
        b => (1u32 << b) - 1,
    }
}

/// Non-secret seed fingerprint used to pick a tree generation on restore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentificationKey(pub Hash32);

impl IdentificationKey {
    /// Derive the key for a seed, or a seed pair in double-OTP mode
    pub fn derive(seed: &Seed, seed2: Option<&Seed>) -> Self {
        let hash = match seed2 {
            Some(seed2) => keccak256_multi(&[IDENTIFICATION_DOMAIN, &seed.0, &seed2.0]),
            None => keccak256_multi(&[IDENTIFICATION_DOMAIN, &seed.0]),
        };
        Self(Hash32(hash))
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }
}

/// hseed of the `index`-th inner tree of a wallet
pub fn inner_hseed(hseed: &Hash32, index: u8) -> Hash32 {
    Hash32(keccak256_multi(&[INNER_DOMAIN, &hseed.0, &[index]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_hex_roundtrip() {
        let seed = Seed::new([0x42; SEED_LEN]);
        let parsed = Seed::from_hex(&seed.to_hex()).unwrap();
        assert_eq!(parsed.as_bytes(), seed.as_bytes());
        assert!(Seed::from_hex("abcd").is_err());
    }

    #[test]
    fn test_debug_redacts_seed() {
        let seed = Seed::new([0x42; SEED_LEN]);
        assert!(!format!("{:?}", seed).contains("42"));
    }

    #[test]
    fn test_identification_key_depends_on_second_seed() {
        let a = Seed::new([1; SEED_LEN]);
        let b = Seed::new([2; SEED_LEN]);
        let single = IdentificationKey::derive(&a, None);
        let double = IdentificationKey::derive(&a, Some(&b));
        assert_ne!(single, double);
        assert_eq!(single, IdentificationKey::derive(&a, None));
        assert_ne!(single.0, a.hseed());
    }

    #[test]
    fn test_leaf_randomness_within_mask() {
        let seed = Seed::new([7; SEED_LEN]);
        for slot in 0..64 {
            assert!(seed.leaf_randomness(slot, 4) < 16);
        }
        assert_eq!(seed.leaf_randomness(3, 0), 0);
        assert_eq!(seed.leaf_randomness(3, 8), seed.leaf_randomness(3, 8));
    }

    #[test]
    fn test_inner_hseed_distinct_per_index() {
        let hseed = Seed::new([3; SEED_LEN]).hseed();
        assert_ne!(inner_hseed(&hseed, 0), inner_hseed(&hseed, 1));
        assert_ne!(inner_hseed(&hseed, 0), hseed);
    }
}
