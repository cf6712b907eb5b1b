//! Process-local record of solved challenges.
//!
//! Challenge validity is decided from the signature alone; this only stops
//! the same solved challenge from being submitted twice to one process
//! before it expires.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Entries beyond this count trigger a sweep of expired nonces.
const SWEEP_THRESHOLD: usize = 4096;

#[derive(Debug, Default)]
pub struct ReplayGuard {
    spent: DashMap<String, i64>,
}

impl ReplayGuard {
    /// Marks `nonce` as used. Returns false if it was already used and is
    /// still live.
    pub fn consume(&self, nonce: &str, expires_at: i64, now: i64) -> bool {
        if self.spent.len() > SWEEP_THRESHOLD {
            self.purge_expired(now);
        }
        match self.spent.entry(nonce.to_string()) {
            Entry::Occupied(mut seen) if *seen.get() < now => {
                seen.insert(expires_at);
                true
            }
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(expires_at);
                true
            }
        }
    }

    pub fn purge_expired(&self, now: i64) {
        self.spent.retain(|_, exp| *exp >= now);
    }

    pub fn len(&self) -> usize {
        self.spent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spent.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_use_is_refused() {
        let g = ReplayGuard::default();
        assert!(g.consume("n1", 100, 10));
        assert!(!g.consume("n1", 100, 11));
        assert!(g.consume("n2", 100, 11));
    }

    #[test]
    fn purge_drops_only_expired() {
        let g = ReplayGuard::default();
        g.consume("old", 5, 0);
        g.consume("new", 50, 0);
        g.purge_expired(10);
        assert_eq!(g.len(), 1);
        assert!(!g.consume("new", 50, 10));
    }
}
