//! Per-key locks serialising work on the same nodes.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// A set of held keys. Cloning shares the set.
#[derive(Debug, Clone, Default)]
pub struct KeyLocks {
    held: Arc<Mutex<BTreeSet<String>>>,
}

impl KeyLocks {
    /// Creates an empty lock set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes every key in `keys`, or none of them if any is already held.
    #[must_use]
    pub fn try_lock_all<I, S>(&self, keys: I) -> Option<KeyGuard>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: BTreeSet<String> = keys.into_iter().map(Into::into).collect();
        let mut held = self.held.lock();
        if let Some(busy) = keys.iter().find(|k| held.contains(*k)) {
            debug!(key = %busy, "key already locked");
            return None;
        }
        held.extend(keys.iter().cloned());
        Some(KeyGuard {
            held: Arc::clone(&self.held),
            keys,
        })
    }

    /// Returns true if `key` is held.
    #[must_use]
    pub fn is_locked(&self, key: &str) -> bool {
        self.held.lock().contains(key)
    }
}

/// Releases its keys when dropped.
#[derive(Debug)]
pub struct KeyGuard {
    held: Arc<Mutex<BTreeSet<String>>>,
    keys: BTreeSet<String>,
}

impl KeyGuard {
    /// Keys this guard holds.
    #[must_use]
    pub fn keys(&self) -> &BTreeSet<String> {
        &self.keys
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let mut held = self.held.lock();
        for key in &self.keys {
            held.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn overlapping_sets_are_exclusive() {
        let locks = KeyLocks::new();
        let guard = locks.try_lock_all(["n1", "n2"]).expect("free");
        assert!(locks.try_lock_all(["n2", "n3"]).is_none());
        // A failed attempt takes nothing
        assert!(!locks.is_locked("n3"));
        drop(guard);
        assert!(locks.try_lock_all(["n2", "n3"]).is_some());
    }

    #[test]
    fn disjoint_sets_coexist() {
        let locks = KeyLocks::new();
        let a = locks.try_lock_all(["n1"]).expect("free");
        let b = locks.try_lock_all(["n2"]).expect("free");
        assert_eq!(a.keys().len() + b.keys().len(), 2);
    }

    proptest! {
        #[test]
        fn held_keys_match_live_guards(sets in proptest::collection::vec(
            proptest::collection::btree_set(0u8..8, 1..4), 1..16,
        )) {
            let locks = KeyLocks::new();
            let mut guards = Vec::new();
            for set in sets {
                let keys: Vec<String> = set.iter().map(|k| format!("n{k}")).collect();
                if let Some(g) = locks.try_lock_all(keys) {
                    guards.push(g);
                }
            }
            let mut seen = BTreeSet::new();
            for g in &guards {
                for k in g.keys() {
                    prop_assert!(seen.insert(k.clone()), "key {} held twice", k);
                }
            }
            for k in &seen {
                prop_assert!(locks.is_locked(k));
            }
            drop(guards);
            for k in &seen {
                prop_assert!(!locks.is_locked(k));
            }
        }
    }
}
