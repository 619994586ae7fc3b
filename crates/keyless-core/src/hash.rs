//! Hash primitives shared by the tree, the EOTP composer and commit hashing

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sha3::Keccak256;

use crate::error::{Error, Result};
use crate::types::Hash32;

/// Argon2 memory cost in KiB for leaf derivation
pub const ARGON2_MEMORY_KIB: u32 = 16;

/// Argon2 passes for leaf derivation
pub const ARGON2_ITERATIONS: u32 = 1;

/// Fixed argon2 salt; the leaf buffer already carries per-wallet material
const ARGON2_SALT: &[u8; 16] = b"keyless/leaf/v1\0";

/// Hash data using SHA256
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash multiple pieces of data using SHA256
pub fn sha256_multi(data: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for d in data {
        hasher.update(d);
    }
    hasher.finalize().into()
}

/// Hash data using Keccak-256
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash multiple pieces of data using Keccak-256
pub fn keccak256_multi(data: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for d in data {
        hasher.update(d);
    }
    hasher.finalize().into()
}

/// Interior node hash: `SHA256(left || right)`
pub fn hash_pair(left: &Hash32, right: &Hash32) -> Hash32 {
    Hash32(sha256_multi(&[&left.0, &right.0]))
}

/// Leaf hash over a one-time value: `SHA256(value)`
pub fn hash_leaf(value: &Hash32) -> Hash32 {
    Hash32(sha256(&value.0))
}

/// Function turning a 32-byte leaf buffer into the slot's one-time value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HashFunction {
    /// Full SHA-256
    Sha256,
    /// SHA-256 truncated to 16 bytes, zero-filled to the node width
    #[default]
    Sha256Truncated,
    /// Argon2id with small fixed parameters (randomized leaves)
    Argon2,
}

impl HashFunction {
    /// Apply the hash function to a leaf buffer
    pub fn apply(&self, buffer: &[u8; 32]) -> Result<Hash32> {
        match self {
            HashFunction::Sha256 => Ok(Hash32(sha256(buffer))),
            HashFunction::Sha256Truncated => {
                let full = sha256(buffer);
                let mut out = [0u8; 32];
                out[..16].copy_from_slice(&full[..16]);
                Ok(Hash32(out))
            }
            HashFunction::Argon2 => {
                let params = Params::new(ARGON2_MEMORY_KIB, ARGON2_ITERATIONS, 1, Some(32))
                    .map_err(|e| Error::Hasher(e.to_string()))?;
                let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
                let mut out = [0u8; 32];
                argon2
                    .hash_password_into(buffer, ARGON2_SALT, &mut out)
                    .map_err(|e| Error::Hasher(e.to_string()))?;
                Ok(Hash32(out))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HashFunction::Sha256 => "sha256",
            HashFunction::Sha256Truncated => "sha256-truncated",
            HashFunction::Argon2 => "argon2",
        }
    }
}

impl std::str::FromStr for HashFunction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(HashFunction::Sha256),
            "sha256-truncated" => Ok(HashFunction::Sha256Truncated),
            "argon2" => Ok(HashFunction::Argon2),
            other => Err(Error::Hasher(format!("unknown hash function: {}", other))),
        }
    }
}
