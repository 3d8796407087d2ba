//! Locked leaf lookup and insert.
//!
//! Writers descend optimistically like readers, then lock the target leaf
//! and re-check it: the leaf may have split (move right), been unlinked
//! (retry the layer), or been the root of a collapsed layer (retry from the
//! table root). Once the lock is held and the leaf is right for the key, the
//! answer cannot change until the lock is released.
//!
//! Lock order, everywhere in the table: right leaf before left leaf, child
//! before parent, upper layer before lower layer.

use std::sync::Arc;

use crate::internode::InternodeNode;
use crate::key::Key;
use crate::ksearch::{KeyIndexPosition, lower_bound_leaf};
use crate::leaf::LeafNode;
use crate::nodeversion::{LockGuard, version_deleted};
use crate::ordering::COUNTER_ORD;
use crate::permuter::Permuter;
use crate::threadinfo::{Counter, ThreadInfo, reclaim_arc};
use crate::tracing_helpers::trace_log;
use crate::value::{LeafValue, keylenx_has_ksuf, keylenx_is_layer, keylenx_is_stable_layer};

use super::{Table, node_parent};

// ============================================================================
//  Locate
// ============================================================================

/// Where `key` sits in a locked leaf.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum SlotMatch {
    /// Same key (or, when not descending, the layer slot for its chunk).
    Found { slot: usize, pos: usize },

    /// Absent; would be inserted at permutation position `pos`.
    NotFound { pos: usize },

    /// A different key with the same 8-byte chunk and a suffix.
    Conflict { slot: usize, pos: usize },
}

/// A leaf locked for `key`.
pub(super) struct LockedLeaf<'a, V, const WIDTH: usize> {
    pub(super) leaf: &'a LeafNode<V, WIDTH>,
    pub(super) guard: LockGuard<'a>,
    pub(super) found: SlotMatch,
}

/// Result of [`Table::find_locked`].
pub(super) enum Locate<'a, V, const WIDTH: usize> {
    /// The key continues in this next-layer root. No lock is held.
    Descend(*mut u8),

    /// The layer being searched was collapsed. No lock is held.
    RetryFromRoot,

    Locked(LockedLeaf<'a, V, WIDTH>),
}

impl<V, const WIDTH: usize> Table<V, WIDTH> {
    /// Find and lock the leaf of the layer rooted at `layer_root` that owns
    /// `key`'s current chunk.
    ///
    /// With `descend`, a layer slot for the chunk yields
    /// [`Locate::Descend`]; without it, the layer slot is reported as
    /// [`SlotMatch::Found`].
    pub(super) fn find_locked<'a>(
        &self,
        layer_root: *mut u8,
        key: &Key<'_>,
        descend: bool,
        ti: &ThreadInfo<'_>,
    ) -> Locate<'a, V, WIDTH> {
        let ikey: u64 = key.ikey();

        loop {
            let (leaf_ptr, version) = self.reach_leaf(layer_root, ikey, ti);

            // SAFETY: reached under the caller's guard.
            let mut leaf: &'a LeafNode<V, WIDTH> = unsafe { &*leaf_ptr };

            if descend && !version_deleted(version) {
                if let Some(next_root) = Self::stable_layer_unlocked(leaf, version, key) {
                    return Locate::Descend(next_root);
                }
            }

            let mut guard: LockGuard<'a> = leaf.version().lock_with(ti.lock_fence(Counter::LeafLock));

            while !guard.is_deleted() {
                let next: *mut LeafNode<V, WIDTH> = leaf.next();
                // SAFETY: `next` cannot be unlinked while we hold its
                // predecessor's lock.
                if next.is_null() || ikey < unsafe { (*next).ikey_bound() } {
                    break;
                }
                drop(guard);
                ti.mark(Counter::LeafForward);
                // SAFETY: loaded under the guard.
                leaf = unsafe { &*next };
                guard = leaf.version().lock_with(ti.lock_fence(Counter::LeafLock));
            }

            if guard.is_deleted() {
                if leaf.is_deleted_layer() {
                    return Locate::RetryFromRoot;
                }
                drop(guard);
                ti.mark(Counter::LayerRetry);
                continue;
            }

            let perm: Permuter<WIDTH> = leaf.permutation();
            let kx: KeyIndexPosition = lower_bound_leaf(leaf, perm, key);

            let found: SlotMatch = match kx.p {
                None => SlotMatch::NotFound { pos: kx.i },
                Some(slot) => {
                    let keylenx: u8 = leaf.keylenx(slot);
                    // SAFETY: lock held.
                    let suffix_differs: bool =
                        keylenx_has_ksuf(keylenx) && !unsafe { leaf.ksuf_matches(slot, key.suffix()) };

                    if keylenx_is_layer(keylenx) {
                        if descend {
                            let next_root: *mut u8 = leaf.lv(slot);
                            drop(guard);
                            return Locate::Descend(next_root);
                        }
                        SlotMatch::Found { slot, pos: kx.i }
                    } else if suffix_differs {
                        SlotMatch::Conflict { slot, pos: kx.i }
                    } else {
                        SlotMatch::Found { slot, pos: kx.i }
                    }
                }
            };

            return Locate::Locked(LockedLeaf { leaf, guard, found });
        }
    }

    /// Layer pointer for `key` read without locking, if the leaf validates.
    fn stable_layer_unlocked(leaf: &LeafNode<V, WIDTH>, version: u32, key: &Key<'_>) -> Option<*mut u8> {
        let perm: Permuter<WIDTH> = leaf.permutation();
        let slot: usize = lower_bound_leaf(leaf, perm, key).p?;
        let keylenx: u8 = leaf.keylenx(slot);
        let lv: *mut u8 = leaf.lv(slot);

        (keylenx_is_stable_layer(keylenx) && !leaf.version().has_changed(version)).then_some(lv)
    }

    /// Lock the parent of `node`, re-checking that it is still the parent.
    ///
    /// `None` means `node` is a layer root. The caller holds `node`'s lock,
    /// so it cannot gain a parent concurrently.
    pub(super) fn locked_parent<'a>(node: *mut u8, ti: &ThreadInfo<'_>) -> Option<(&'a InternodeNode<WIDTH>, LockGuard<'a>)> {
        loop {
            // SAFETY: the caller holds `node`'s lock.
            let parent: *mut u8 = unsafe { node_parent::<V, WIDTH>(node) };
            if parent.is_null() {
                return None;
            }

            // SAFETY: internodes are freed only when the table drops.
            let inode: &'a InternodeNode<WIDTH> = unsafe { &*parent.cast::<InternodeNode<WIDTH>>() };
            let guard: LockGuard<'a> = inode.version().lock_with(ti.lock_fence(Counter::InternodeLock));

            // An internode split may have moved `node` to a new parent.
            // SAFETY: as above.
            if unsafe { node_parent::<V, WIDTH>(node) } == parent {
                return Some((inode, guard));
            }
            drop(guard);
        }
    }

    // ========================================================================
    //  Insert
    // ========================================================================

    /// Insert or replace `key` with `value`.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip_all))]
    pub(super) fn put(&self, key: &[u8], value: Arc<V>, ti: &ThreadInfo<'_>) -> Option<Arc<V>> {
        let mut key: Key<'_> = Key::new(key);
        let mut layer_root: *mut u8 = self.root_ptr();

        loop {
            match self.find_locked(layer_root, &key, true, ti) {
                Locate::Descend(next_root) => {
                    ti.mark(Counter::LayerDescend);
                    key.shift();
                    layer_root = next_root;
                }
                Locate::RetryFromRoot => {
                    ti.mark(Counter::RootRetry);
                    trace_log!(depth = key.shift_count(), "insert hit collapsed layer, restarting from root");
                    key.unshift_all();
                    layer_root = self.root_ptr();
                }
                Locate::Locked(locked) => return self.insert_at(locked, &key, value, ti),
            }
        }
    }

    fn insert_at(&self, locked: LockedLeaf<'_, V, WIDTH>, key: &Key<'_>, value: Arc<V>, ti: &ThreadInfo<'_>) -> Option<Arc<V>> {
        let LockedLeaf { leaf, mut guard, found } = locked;

        match found {
            SlotMatch::Found { slot, .. } => {
                // Readers see the old or the new pointer; both stay valid
                // until their guards end.
                let old: *mut u8 = leaf.swap_lv(slot, LeafValue::encode(value));
                drop(guard);

                // SAFETY: the slot owned one count of `old`, now ours to retire.
                let previous: Option<Arc<V>> = unsafe { LeafValue::<V>::Value(old.cast_const().cast::<V>()).clone_arc() };
                // SAFETY: unreachable from the slot, retired once.
                unsafe { ti.defer_free(old.cast::<V>(), reclaim_arc::<V>) };
                previous
            }

            SlotMatch::NotFound { pos } => {
                let mut perm: Permuter<WIDTH> = leaf.permutation();
                if perm.size() < WIDTH {
                    guard.mark_insert();
                    leaf.assign(perm.back(), key, LeafValue::encode(value));
                    let _ = perm.insert_from_back(pos);
                    leaf.set_permutation(perm);
                    leaf.debug_assert_sorted();
                    trace_log!(pos, size = perm.size(), "insert");
                } else {
                    self.split_insert(leaf, guard, pos, key, LeafValue::encode(value), ti);
                }
                self.count.fetch_add(1, COUNTER_ORD);
                None
            }

            SlotMatch::Conflict { slot, .. } => {
                self.make_new_layer(leaf, guard, slot, key, value, ti);
                self.count.fetch_add(1, COUNTER_ORD);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locate(table: &Table<u64>, key: &[u8], descend: bool) -> Option<SlotMatch> {
        let ti = table.threadinfo();
        let key = Key::new(key);
        match table.find_locked(table.root_ptr(), &key, descend, &ti) {
            Locate::Locked(locked) => Some(locked.found),
            Locate::Descend(_) | Locate::RetryFromRoot => None,
        }
    }

    #[test]
    fn test_find_locked_found_and_missing() {
        let table: Table<u64> = Table::new();
        table.insert(b"b", 1);

        assert!(matches!(locate(&table, b"b", true), Some(SlotMatch::Found { pos: 0, .. })));
        assert_eq!(locate(&table, b"a", true), Some(SlotMatch::NotFound { pos: 0 }));
        assert_eq!(locate(&table, b"c", true), Some(SlotMatch::NotFound { pos: 1 }));
    }

    #[test]
    fn test_find_locked_reports_suffix_conflict() {
        let table: Table<u64> = Table::new();
        table.insert(b"abcdefgh-one", 1);

        assert!(matches!(locate(&table, b"abcdefgh-two", true), Some(SlotMatch::Conflict { .. })));
        assert!(matches!(locate(&table, b"abcdefgh-one", true), Some(SlotMatch::Found { .. })));
    }

    #[test]
    fn test_find_locked_layer_slot() {
        let table: Table<u64> = Table::new();
        table.insert(b"abcdefgh-one", 1);
        table.insert(b"abcdefgh-two", 2);

        assert_eq!(locate(&table, b"abcdefgh-three", true), None);
        assert!(matches!(locate(&table, b"abcdefgh-three", false), Some(SlotMatch::Found { .. })));
    }

    #[test]
    fn test_locked_parent_of_root_is_none() {
        let table: Table<u64> = Table::new();
        let ti = table.threadinfo();
        let root: *mut u8 = table.root_ptr();
        // SAFETY: the table owns the root leaf.
        let leaf: &LeafNode<u64> = unsafe { &*root.cast::<LeafNode<u64>>() };
        let _guard = leaf.version().lock();
        assert!(Table::<u64>::locked_parent(root, &ti).is_none());
    }

    #[test]
    fn test_replace_returns_previous() {
        let table: Table<String> = Table::new();
        assert_eq!(table.insert(b"k", "one".to_owned()), None);
        let previous: Option<Arc<String>> = table.insert(b"k", "two".to_owned());
        assert_eq!(previous.as_deref().map(String::as_str), Some("one"));
        assert_eq!(table.len(), 1);
    }
}
