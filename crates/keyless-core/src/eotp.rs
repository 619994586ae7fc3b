//! Operations, EOTP composition and commit hashing
//!
//! The EOTP revealed to the contract is the slot's one-time value. It is
//! bound to one operation through two hashes:
//!
//! ```text
//! paramsHash       = keccak256(abi words of the operation)
//! verificationHash = keccak256(paramsHash || eotp)
//! commitHash       = keccak256(neighbors[0] || index (u32 BE) || eotp)
//! ```
//!
//! The commit carries all three; at reveal the contract recomputes them from
//! the revealed operation and rejects any mismatch, so an EOTP captured from
//! one reveal cannot authorize a different operation.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::{hash_leaf, keccak256, keccak256_multi};
use crate::merkle::{verify_proof, MerkleProof};
use crate::types::{amount_string, u256_word, Address, Hash32};

/// First major version hashing the recover operation code into its params
pub const RECOVER_PARAMS_MIN_VERSION: u32 = 14;

/// Standard of a token moved by [`Operation::TransferToken`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Erc20,
    Erc721,
    Erc1155,
}

impl TokenType {
    pub fn code(&self) -> u8 {
        match self {
            TokenType::Erc20 => 0,
            TokenType::Erc721 => 1,
            TokenType::Erc1155 => 2,
        }
    }
}

/// An operation authorized by one slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "camelCase")]
pub enum Operation {
    #[serde(rename_all = "camelCase")]
    Transfer {
        dest: Address,
        #[serde(with = "amount_string")]
        amount: u128,
    },
    Recover,
    #[serde(rename_all = "camelCase")]
    SetRecoveryAddress { address: Address },
    #[serde(rename_all = "camelCase")]
    TransferToken {
        token_type: TokenType,
        contract: Address,
        #[serde(with = "amount_string")]
        token_id: u128,
        dest: Address,
        #[serde(with = "amount_string")]
        amount: u128,
    },
    #[serde(rename_all = "camelCase")]
    Call {
        contract: Address,
        #[serde(with = "amount_string")]
        amount: u128,
        #[serde(with = "hex_vec")]
        data: Vec<u8>,
    },
}

impl Operation {
    /// Operation code as known to the contract
    pub fn code(&self) -> u8 {
        match self {
            Operation::TransferToken { .. } => 2,
            Operation::Transfer { .. } => 4,
            Operation::SetRecoveryAddress { .. } => 5,
            Operation::Recover => 6,
            Operation::Call { .. } => 11,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::Transfer { .. } => "transfer",
            Operation::Recover => "recover",
            Operation::SetRecoveryAddress { .. } => "set-recovery-address",
            Operation::TransferToken { .. } => "transfer-token",
            Operation::Call { .. } => "call",
        }
    }

    /// Relayer endpoint receiving the reveal
    pub fn reveal_path(&self) -> &'static str {
        match self {
            Operation::Transfer { .. } => "/reveal/transfer",
            Operation::Recover => "/reveal/recovery",
            Operation::SetRecoveryAddress { .. } => "/reveal/set-recovery-address",
            Operation::TransferToken { .. } => "/reveal/token",
            Operation::Call { .. } => "/reveal/call",
        }
    }

    /// Addresses whose balances or nonces change when this operation executes
    pub fn affected_addresses(&self) -> Vec<Address> {
        match self {
            Operation::Transfer { dest, .. } => vec![*dest],
            Operation::Recover => Vec::new(),
            Operation::SetRecoveryAddress { .. } => Vec::new(),
            Operation::TransferToken { contract, dest, .. } => vec![*contract, *dest],
            Operation::Call { contract, .. } => vec![*contract],
        }
    }

    /// Native amount moved out of the wallet
    pub fn native_amount(&self) -> u128 {
        match self {
            Operation::Transfer { amount, .. } | Operation::Call { amount, .. } => *amount,
            _ => 0,
        }
    }

    /// Check the operation's own fields
    pub fn validate(&self) -> Result<()> {
        match self {
            Operation::Transfer { dest, amount } => {
                if dest.is_zero() {
                    return Err(Error::InvalidAddress(
                        "destination is the zero address".to_string(),
                    ));
                }
                if *amount == 0 {
                    return Err(Error::InvalidAmount("amount must be positive".to_string()));
                }
            }
            Operation::SetRecoveryAddress { address } if address.is_zero() => {
                return Err(Error::InvalidAddress(
                    "recovery address is the zero address".to_string(),
                ));
            }
            Operation::TransferToken { contract, dest, .. } => {
                if contract.is_zero() || dest.is_zero() {
                    return Err(Error::InvalidAddress(
                        "token transfer needs contract and destination".to_string(),
                    ));
                }
            }
            Operation::Call { contract, .. } if contract.is_zero() => {
                return Err(Error::InvalidAddress("call target is the zero address".to_string()));
            }
            _ => {}
        }
        Ok(())
    }
}

/// How a wallet version hashes operation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamsScheme {
    /// Recover carries an all-zero params hash
    Legacy,
    /// Recover hashes its operation code
    Current,
}

impl ParamsScheme {
    pub fn for_version(major_version: u32) -> Self {
        if major_version >= RECOVER_PARAMS_MIN_VERSION {
            ParamsScheme::Current
        } else {
            ParamsScheme::Legacy
        }
    }

    pub fn params_hash(&self, operation: &Operation) -> Hash32 {
        let words: Vec<[u8; 32]> = match operation {
            Operation::Transfer { dest, amount } => vec![dest.to_word(), u256_word(*amount)],
            Operation::Recover => match self {
                ParamsScheme::Legacy => return Hash32::ZERO,
                ParamsScheme::Current => vec![u256_word(u128::from(operation.code()))],
            },
            Operation::SetRecoveryAddress { address } => vec![address.to_word()],
            Operation::TransferToken {
                token_type,
                contract,
                token_id,
                dest,
                amount,
            } => vec![
                u256_word(u128::from(token_type.code())),
                contract.to_word(),
                u256_word(*token_id),
                dest.to_word(),
                u256_word(*amount),
            ],
            Operation::Call {
                contract,
                amount,
                data,
            } => vec![contract.to_word(), u256_word(*amount), keccak256(data)],
        };
        keccak_words(&words)
    }
}

pub(crate) fn keccak_words(words: &[[u8; 32]]) -> Hash32 {
    let parts: Vec<&[u8]> = words.iter().map(|w| w.as_slice()).collect();
    Hash32(keccak256_multi(&parts))
}

/// `keccak256(paramsHash || eotp)`
pub fn verification_hash(params_hash: &Hash32, eotp: &Hash32) -> Hash32 {
    Hash32(keccak256_multi(&[&params_hash.0, &eotp.0]))
}

/// `keccak256(neighbors[0] || index || eotp)`
pub fn commit_hash(first_neighbor: &Hash32, index: u32, eotp: &Hash32) -> Hash32 {
    Hash32(keccak256_multi(&[
        &first_neighbor.0,
        &index.to_be_bytes(),
        &eotp.0,
    ]))
}

/// The slot material revealed to the contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    pub index: u32,
    pub neighbors: Vec<Hash32>,
    pub eotp: Hash32,
}

impl Authorization {
    /// Combine a located proof with the slot's one-time value
    pub fn new(proof: MerkleProof, eotp: Hash32) -> Result<Self> {
        let index = u32::try_from(proof.index).map_err(|_| Error::SlotOutOfRange {
            index: proof.index,
            slots: u64::from(u32::MAX) + 1,
        })?;
        Ok(Self {
            index,
            neighbors: proof.neighbors,
            eotp,
        })
    }

    /// Whether the EOTP's leaf is provable against `root` at `index`
    pub fn verify(&self, root: &Hash32) -> bool {
        verify_proof(root, &hash_leaf(&self.eotp), u64::from(self.index), &self.neighbors)
    }

    pub fn commit_hash(&self) -> Result<Hash32> {
        let first = self.neighbors.first().ok_or(Error::ProofVerificationFailed)?;
        Ok(commit_hash(first, self.index, &self.eotp))
    }
}

/// EOTP bound to one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedOtp {
    pub eotp: Hash32,
    pub params_hash: Hash32,
    pub verification_hash: Hash32,
}

/// Bind a slot's one-time value to `operation`
pub fn compose(
    one_time_value: &Hash32,
    operation: &Operation,
    scheme: ParamsScheme,
) -> ExtendedOtp {
    let params_hash = scheme.params_hash(operation);
    ExtendedOtp {
        eotp: *one_time_value,
        verification_hash: verification_hash(&params_hash, one_time_value),
        params_hash,
    }
}

/// A commit submitted ahead of its reveal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub hash: Hash32,
    pub params_hash: Hash32,
    pub verification_hash: Hash32,
    /// Unix time the commit was created
    pub timestamp: u64,
}

impl Commit {
    pub fn new(
        authorization: &Authorization,
        extended: &ExtendedOtp,
        timestamp: u64,
    ) -> Result<Self> {
        Ok(Self {
            hash: authorization.commit_hash()?,
            params_hash: extended.params_hash,
            verification_hash: extended.verification_hash,
            timestamp,
        })
    }
}

mod hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(serde::de::Error::custom)
    }
}
