//! Request tokens
//!
//! Each request takes a fresh, monotonically increasing token. Only the
//! latest token is current; results tagged with any earlier token are
//! dropped.

use std::sync::atomic::{AtomicU64, Ordering};

/// Issues tokens and tells whether one is still current
#[derive(Debug, Default)]
pub struct TokenGate {
    latest: AtomicU64,
}

impl TokenGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a token, invalidating all earlier ones
    pub fn issue(&self) -> u64 {
        self.latest.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_current(&self, token: u64) -> bool {
        token != 0 && self.latest.load(Ordering::SeqCst) == token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_increase_and_supersede() {
        let gate = TokenGate::new();
        assert!(!gate.is_current(0));
        let a = gate.issue();
        assert!(gate.is_current(a));
        let b = gate.issue();
        assert!(b > a);
        assert!(!gate.is_current(a));
        assert!(gate.is_current(b));
    }
}
