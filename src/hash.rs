//! Fixed-seed hashing for the runtime's internal maps.
//!
//! Every map in the arenas is keyed by small `Copy` ids or short keys that
//! never come from an adversary, so HashDoS resistance buys nothing. A
//! zero-sized builder keeps the ordered maps one word smaller each.

use indexmap::{IndexMap, IndexSet};
use std::hash::BuildHasher;

use foldhash::fast::{FixedState, FoldHasher};

const SEED: u64 = 0x2d35_8dcc_aa6c_78a5;

/// Zero-sized `BuildHasher` backed by foldhash with a constant seed.
#[derive(Clone, Copy, Debug, Default)]
pub struct FastHashBuilder;

impl BuildHasher for FastHashBuilder {
    type Hasher = FoldHasher<'static>;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(SEED).build_hasher()
    }
}

/// Insertion-ordered map used wherever iteration order is observable
/// (record fields, subscriber registration order, access records).
pub(crate) type FastIndexMap<K, V> = IndexMap<K, V, FastHashBuilder>;

/// Insertion-ordered set, see [`FastIndexMap`].
pub(crate) type FastIndexSet<K> = IndexSet<K, FastHashBuilder>;
