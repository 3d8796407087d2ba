//! Key search within a node.
//!
//! Leaves are searched in permutation order by `(ikey, rank)`; internodes by
//! ikey alone. Both searches tolerate concurrent modification: they only
//! ever index within the node's fixed arrays, and the caller decides whether
//! to trust the result by validating the node version.

use std::cmp::Ordering;

use crate::internode::InternodeNode;
use crate::key::Key;
use crate::leaf::LeafNode;
use crate::permuter::Permuter;

/// Outcome of a leaf lower-bound search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyIndexPosition {
    /// Logical position: where the key is, or where it would be inserted.
    pub i: usize,

    /// Physical slot holding an entry with the same `(ikey, rank)`.
    pub p: Option<usize>,
}

impl KeyIndexPosition {
    /// Matched slot at position `i`.
    #[inline(always)]
    #[must_use]
    pub const fn found(i: usize, p: usize) -> Self {
        Self { i, p: Some(p) }
    }

    /// No match; insertion point `i`.
    #[inline(always)]
    #[must_use]
    pub const fn not_found(i: usize) -> Self {
        Self { i, p: None }
    }
}

/// Binary search over positions `0..perm.size()` with a per-slot comparator
/// returning `search_key.cmp(slot_key)`.
pub fn lower_bound_by<const WIDTH: usize, F>(perm: Permuter<WIDTH>, compare: F) -> KeyIndexPosition
where
    F: Fn(usize) -> Ordering,
{
    let mut lo: usize = 0;
    let mut hi: usize = perm.size();

    while lo < hi {
        let mid: usize = (lo + hi) >> 1;
        let slot: usize = perm.get(mid);
        match compare(slot) {
            Ordering::Less => hi = mid,
            Ordering::Equal => return KeyIndexPosition::found(mid, slot),
            Ordering::Greater => lo = mid + 1,
        }
    }

    KeyIndexPosition::not_found(lo)
}

/// Locate `key` (at its current layer) in `leaf` under permutation `perm`.
///
/// A match means equal ikey and equal rank. For rank [`LONG_RANK`](crate::key::LONG_RANK)
/// the slot may still hold a different suffix, or a layer; the caller
/// inspects `keylenx`.
#[inline]
pub fn lower_bound_leaf<V, const WIDTH: usize>(
    leaf: &LeafNode<V, WIDTH>,
    perm: Permuter<WIDTH>,
    key: &Key<'_>,
) -> KeyIndexPosition {
    lower_bound_by(perm, |slot| key.compare(leaf.ikey(slot), leaf.rank(slot)))
}

/// Child index covering `ikey`.
#[inline]
pub fn upper_bound_internode<const WIDTH: usize>(node: &InternodeNode<WIDTH>, ikey: u64) -> usize {
    node.upper_bound(ikey)
}
