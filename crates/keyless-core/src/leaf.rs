//! Leaf derivation
//!
//! Each slot's leaf is built from a 32-byte buffer:
//!
//! ```text
//! hseed[..prefix] | randomness (4, optional) | nonce (2) | otp (4) | otp2 (4, optional)
//! ```
//!
//! The buffer is hashed with the wallet's [`HashFunction`] into the slot's
//! one-time value (the EOTP preimage revealed to the contract), and the
//! leaf stored in the tree is `SHA256(one-time value)`.

use crate::error::{Error, Result};
use crate::hash::{hash_leaf, HashFunction};
use crate::identity::randomness_mask;
use crate::otp::OtpCode;
use crate::types::Hash32;

/// How often the randomness search polls for cancellation
const CANCEL_POLL_INTERVAL: u32 = 256;

/// Inputs for one slot's leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafInput {
    /// Code from the first seed
    pub otp: OtpCode,
    /// Code from the second seed (double-OTP mode)
    pub otp2: Option<OtpCode>,
    /// Operation index within the interval, `< slot_size`
    pub nonce: u16,
    /// Randomness for randomized leaves
    pub randomness: Option<u32>,
}

impl LeafInput {
    pub fn new(otp: OtpCode, otp2: Option<OtpCode>, nonce: u16) -> Self {
        Self {
            otp,
            otp2,
            nonce,
            randomness: None,
        }
    }

    pub fn with_randomness(mut self, randomness: u32) -> Self {
        self.randomness = Some(randomness);
        self
    }
}

/// Assemble the 32-byte leaf buffer
pub fn leaf_buffer(hseed: &Hash32, input: &LeafInput) -> [u8; 32] {
    let mut tail = [0u8; 14];
    let mut len = 0;
    if let Some(r) = input.randomness {
        tail[len..len + 4].copy_from_slice(&r.to_be_bytes());
        len += 4;
    }
    tail[len..len + 2].copy_from_slice(&input.nonce.to_be_bytes());
    len += 2;
    tail[len..len + 4].copy_from_slice(&input.otp.to_bytes());
    len += 4;
    if let Some(otp2) = input.otp2 {
        tail[len..len + 4].copy_from_slice(&otp2.to_bytes());
        len += 4;
    }

    let prefix = 32 - len;
    let mut buffer = [0u8; 32];
    buffer[..prefix].copy_from_slice(&hseed.0[..prefix]);
    buffer[prefix..].copy_from_slice(&tail[..len]);
    buffer
}

/// The slot's one-time value (EOTP preimage)
pub fn leaf_value(hseed: &Hash32, input: &LeafInput, hasher: HashFunction) -> Result<Hash32> {
    hasher.apply(&leaf_buffer(hseed, input))
}

/// The tree leaf for a slot
pub fn leaf_hash(hseed: &Hash32, input: &LeafInput, hasher: HashFunction) -> Result<Hash32> {
    Ok(hash_leaf(&leaf_value(hseed, input, hasher)?))
}

/// Search the randomness that makes `input` hash to `expected_leaf`
///
/// Returns the randomness and the matching one-time value, or `None` when no
/// value in `[0, 2^bits)` matches (usually a wrong OTP). Fails with
/// [`Error::Cancelled`] once `is_cancelled` reports true.
pub fn recover_randomness<F>(
    hseed: &Hash32,
    input: &LeafInput,
    bits: u8,
    hasher: HashFunction,
    expected_leaf: &Hash32,
    is_cancelled: F,
) -> Result<Option<(u32, Hash32)>>
where
    F: Fn() -> bool,
{
    let mask = randomness_mask(bits);
    let mut candidate = *input;
    for r in 0..=mask {
        if r % CANCEL_POLL_INTERVAL == 0 && is_cancelled() {
            return Err(Error::Cancelled);
        }
        candidate.randomness = Some(r);
        let value = leaf_value(hseed, &candidate, hasher)?;
        if hash_leaf(&value) == *expected_leaf {
            return Ok(Some((r, value)));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hseed() -> Hash32 {
        Hash32([0xaa; 32])
    }

    fn otp(v: u32) -> OtpCode {
        OtpCode::new(v).unwrap()
    }

    #[test]
    fn test_single_otp_layout() {
        let buffer = leaf_buffer(&hseed(), &LeafInput::new(otp(123456), None, 3));
        assert_eq!(&buffer[..26], &[0xaa; 26]);
        assert_eq!(&buffer[26..28], &3u16.to_be_bytes());
        assert_eq!(&buffer[28..], &123456u32.to_be_bytes());
    }

    #[test]
    fn test_double_otp_randomized_layout() {
        let input = LeafInput::new(otp(1), Some(otp(2)), 0).with_randomness(0x0102_0304);
        let buffer = leaf_buffer(&hseed(), &input);
        assert_eq!(&buffer[..18], &[0xaa; 18]);
        assert_eq!(&buffer[18..22], &[1, 2, 3, 4]);
        assert_eq!(&buffer[22..24], &[0, 0]);
        assert_eq!(&buffer[24..28], &1u32.to_be_bytes());
        assert_eq!(&buffer[28..], &2u32.to_be_bytes());
    }

    #[test]
    fn test_leaf_is_deterministic_and_input_sensitive() {
        let hash = |code: u32, nonce: u16| {
            leaf_hash(&hseed(), &LeafInput::new(otp(code), None, nonce), HashFunction::Sha256)
                .unwrap()
        };
        let a = hash(1, 0);
        let b = hash(1, 0);
        let c = hash(2, 0);
        let d = hash(1, 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_recover_randomness_finds_value() {
        let base = LeafInput::new(otp(654321), None, 0);
        let target = base.with_randomness(37);
        let expected = leaf_hash(&hseed(), &target, HashFunction::Sha256).unwrap();

        let (r, value) = recover_randomness(
            &hseed(),
            &base,
            8,
            HashFunction::Sha256,
            &expected,
            || false,
        )
        .unwrap()
        .unwrap();
        assert_eq!(r, 37);
        assert_eq!(hash_leaf(&value), expected);
    }

    #[test]
    fn test_recover_randomness_wrong_otp() {
        let target = LeafInput::new(otp(1), None, 0).with_randomness(5);
        let expected = leaf_hash(&hseed(), &target, HashFunction::Sha256).unwrap();
        let found = recover_randomness(
            &hseed(),
            &LeafInput::new(otp(2), None, 0),
            4,
            HashFunction::Sha256,
            &expected,
            || false,
        )
        .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_recover_randomness_cancelled() {
        let result = recover_randomness(
            &hseed(),
            &LeafInput::new(otp(2), None, 0),
            4,
            HashFunction::Sha256,
            &Hash32::ZERO,
            || true,
        );
        assert_eq!(result, Err(Error::Cancelled));
    }
}
