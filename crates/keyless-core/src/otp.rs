//! Time-based one-time passwords (RFC 4226 / RFC 6238, HMAC-SHA1, 6 digits)
//!
//! Codes must match what an authenticator app shows for the same seed and
//! time, since the user types them in from the app.

use std::fmt;
use std::str::FromStr;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;

use crate::error::{Error, Result};
use crate::identity::Seed;

type HmacSha1 = Hmac<Sha1>;

/// Number of decimal digits in a code
pub const OTP_DIGITS: usize = 6;

/// `10^OTP_DIGITS`
pub const OTP_MODULUS: u32 = 1_000_000;

/// Default TOTP interval in seconds
pub const DEFAULT_INTERVAL: u64 = 30;

/// A six-digit one-time code
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OtpCode(u32);

impl OtpCode {
    pub fn new(value: u32) -> Result<Self> {
        if value >= OTP_MODULUS {
            return Err(Error::InvalidOtp(format!("{} has more than six digits", value)));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// Big-endian 4-byte encoding used inside leaf buffers
    pub fn to_bytes(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl FromStr for OtpCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.len() != OTP_DIGITS || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidOtp(format!(
                "expected {} digits, got {} characters",
                OTP_DIGITS,
                s.len()
            )));
        }
        let value: u32 = s
            .parse()
            .map_err(|_| Error::InvalidOtp("not a number".to_string()))?;
        Self::new(value)
    }
}

impl fmt::Display for OtpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}", self.0)
    }
}

impl fmt::Debug for OtpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OtpCode(******)")
    }
}

/// TOTP counter for a unix time
pub fn counter_at(unix_time: u64, interval: u64) -> u64 {
    unix_time / interval.max(1)
}

/// HOTP code for `counter` (RFC 4226 dynamic truncation)
pub fn generate(seed: &Seed, counter: u64) -> Result<OtpCode> {
    let mut mac = HmacSha1::new_from_slice(seed.as_bytes())
        .map_err(|e| Error::InvalidSeed(e.to_string()))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = (u32::from(digest[offset]) & 0x7f) << 24
        | u32::from(digest[offset + 1]) << 16
        | u32::from(digest[offset + 2]) << 8
        | u32::from(digest[offset + 3]);

    Ok(OtpCode(binary % OTP_MODULUS))
}

/// TOTP code at a unix time
pub fn generate_at(seed: &Seed, unix_time: u64, interval: u64) -> Result<OtpCode> {
    generate(seed, counter_at(unix_time, interval))
}
