//! Key and value trait bounds plus the deterministic hash used for key
//! ownership.
//!
//! Keys select which task instance of a template a message is for. They
//! must hash identically on every rank of a process group, so the default
//! keymap and the task cache use a fixed-seed [`ahash`] state rather than
//! the randomly seeded default.

use std::fmt::Debug;
use std::hash::{BuildHasher, Hash};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A task key: hashable, comparable, serializable, and cheap to clone.
///
/// The void key of a single-instance template is `()`.
pub trait Key:
    Clone + Eq + Hash + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> Key for T where
    T: Clone + Eq + Hash + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// A value carried by an edge. Control edges carry `()`.
///
/// `Clone` is required so one produced value can fan out to several
/// consuming terminals; the move-to-one-consumer optimization avoids the
/// clone whenever there is a single consuming peer.
pub trait Datum: Clone + Debug + Send + Serialize + DeserializeOwned + 'static {}

impl<T> Datum for T where T: Clone + Debug + Send + Serialize + DeserializeOwned + 'static {}

// Seeds are arbitrary but fixed: every rank of a group must agree on
// hash(k) for the default keymap to be a valid ownership function.
const HASH_SEEDS: (u64, u64, u64, u64) = (
    0x9e37_79b9_7f4a_7c15,
    0xd1b5_4a32_d192_ed03,
    0x8eb4_4a04_86df_ea6b,
    0x2545_f491_4f6c_dd1d,
);

/// Deterministic 64-bit hash of a key, stable across the ranks of a group.
pub fn stable_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    let state = ahash::RandomState::with_seeds(HASH_SEEDS.0, HASH_SEEDS.1, HASH_SEEDS.2, HASH_SEEDS.3);
    state.hash_one(value)
}

/// Fixed-seed hasher state for the task caches.
pub(crate) fn cache_hasher() -> ahash::RandomState {
    ahash::RandomState::with_seeds(HASH_SEEDS.3, HASH_SEEDS.2, HASH_SEEDS.1, HASH_SEEDS.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_hash_is_deterministic_across_threads() {
        let here = stable_hash(&42u64);
        let there = std::thread::spawn(|| stable_hash(&42u64)).join().unwrap();
        assert_eq!(here, there);
    }

    #[test]
    fn stable_hash_separates_keys() {
        assert_ne!(stable_hash(&1u64), stable_hash(&2u64));
    }
}
