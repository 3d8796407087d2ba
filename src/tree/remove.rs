//! Remove, leaf unlink and layer collapse.
//!
//! Removing a key only rewrites the permutation. Structure shrinks in two
//! ways once a leaf empties:
//!
//! - a non-root leaf that is not its parent's first child is unlinked from
//!   the parent and the sibling chain, and its range merges into its left
//!   sibling
//! - an empty root leaf of a layer below layer 0 is removed from the upper
//!   layer's slot (`gc_layer`); if that empties the upper leaf the process
//!   repeats one layer up
//!
//! Unlinked nodes are marked deleted before their locks drop and are freed
//! through the epoch collector.

use std::sync::Arc;

use crate::key::Key;
use crate::leaf::{LeafNode, ModState};
use crate::nodeversion::LockGuard;
use crate::ordering::COUNTER_ORD;
use crate::permuter::Permuter;
use crate::suffix::KeySuffix;
use crate::threadinfo::{Counter, ThreadInfo, reclaim_arc, reclaim_boxed};
use crate::tracing_helpers::{debug_log, trace_log};
use crate::value::{LeafValue, keylenx_is_stable_layer};

use super::Table;
use super::locked::{Locate, LockedLeaf, SlotMatch};

impl<V, const WIDTH: usize> Table<V, WIDTH> {
    /// Remove `key`, returning its value.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip_all))]
    pub(super) fn remove_key(&self, key: &[u8], ti: &ThreadInfo<'_>) -> Option<Arc<V>> {
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
                    trace_log!(depth = key.shift_count(), "remove hit collapsed layer, restarting from root");
                    key.unshift_all();
                    layer_root = self.root_ptr();
                }
                Locate::Locked(LockedLeaf { leaf, mut guard, found }) => {
                    let SlotMatch::Found { slot, pos } = found else {
                        return None;
                    };

                    guard.mark_insert();
                    let mut perm: Permuter<WIDTH> = leaf.permutation();
                    perm.remove(pos);
                    leaf.set_permutation(perm);

                    let lv: *mut u8 = leaf.lv(slot);
                    // SAFETY: lock held; the slot still owns its count.
                    let removed: Option<Arc<V>> = unsafe { LeafValue::<V>::decode(leaf.keylenx(slot), lv).clone_arc() };
                    let ksuf: *mut KeySuffix = leaf.take_ksuf(slot);

                    // SAFETY: both left the permutation above and are
                    // retired exactly once.
                    unsafe {
                        ti.defer_free(lv.cast::<V>(), reclaim_arc::<V>);
                        if !ksuf.is_null() {
                            ti.defer_free(ksuf, reclaim_boxed::<KeySuffix>);
                        }
                    }
                    self.count.fetch_sub(1, COUNTER_ORD);
                    trace_log!(pos, size = perm.size(), "remove");

                    if perm.size() == 0 {
                        self.reclaim_empty_leaf(leaf, guard, &key, ti);
                    }
                    return removed;
                }
            }
        }
    }

    /// Shrink the structure around the empty, locked `leaf` reached through
    /// `key`. Releases the lock.
    fn reclaim_empty_leaf<'a>(&self, leaf: &'a LeafNode<V, WIDTH>, guard: LockGuard<'a>, key: &Key<'_>, ti: &ThreadInfo<'_>) {
        if !leaf.parent().is_null() {
            self.try_unlink_leaf(leaf, guard, ti);
            return;
        }

        // The table's root leaf is never removed.
        let depth: usize = key.shift_count();
        drop(guard);
        if depth > 0 {
            self.gc_layer(key.full(), depth, leaf.as_node_ptr(), ti);
        }
    }

    /// Unlink the empty, locked, non-root `leaf` from its parent and the
    /// sibling chain. Leaves that are their parent's first child stay.
    fn try_unlink_leaf<'a>(&self, leaf: &'a LeafNode<V, WIDTH>, mut guard: LockGuard<'a>, ti: &ThreadInfo<'_>) {
        let leaf_ptr: *mut LeafNode<V, WIDTH> = std::ptr::from_ref(leaf).cast_mut();

        // Lock the current predecessor: right before left.
        let (prev, mut prev_guard) = loop {
            let prev_ptr: *mut LeafNode<V, WIDTH> = leaf.prev();
            if prev_ptr.is_null() {
                return;
            }
            // SAFETY: a predecessor is retired only after being unlinked,
            // which requires the lock of its own predecessor and then ours.
            let prev: &'a LeafNode<V, WIDTH> = unsafe { &*prev_ptr };
            let prev_guard: LockGuard<'a> = prev.version().lock_with(ti.lock_fence(Counter::LeafLock));
            if !prev_guard.is_deleted() && prev.next() == leaf_ptr && leaf.prev() == prev_ptr {
                break (prev, prev_guard);
            }
            drop(prev_guard);
        };

        let Some((parent, mut parent_guard)) = Self::locked_parent(leaf.as_node_ptr(), ti) else {
            return;
        };
        let Some(idx) = parent.find_child(leaf.as_node_ptr()).filter(|&idx| idx > 0) else {
            return;
        };
        if parent.child(idx - 1) != prev.as_node_ptr() {
            return;
        }

        parent_guard.mark_insert();
        parent.remove_child(idx);
        drop(parent_guard);

        guard.mark_deleted();
        prev_guard.mark_insert();
        let next: *mut LeafNode<V, WIDTH> = leaf.next();
        prev.set_next(next);
        if !next.is_null() {
            // SAFETY: we hold the lock of `next`'s predecessor.
            unsafe { (*next).set_prev(std::ptr::from_ref(prev).cast_mut()) };
        }
        drop(prev_guard);
        drop(guard);

        ti.mark(Counter::LeafUnlink);
        debug_log!(ikey_bound = format_args!("{:#018x}", leaf.ikey_bound()), "leaf unlinked");

        // SAFETY: unreachable from the parent and the chain; retired once.
        unsafe { ti.defer_free(leaf_ptr, reclaim_boxed::<LeafNode<V, WIDTH>>) };
    }

    /// Remove the empty layer rooted at `lower`, reached through the first
    /// `depth` chunks of `full_key`, from its slot one layer up.
    ///
    /// Holds no locks on entry. Gives up quietly if anything changed in the
    /// meantime: the layer refilled, grew, or was already removed.
    fn gc_layer(&self, full_key: &[u8], depth: usize, lower: *mut u8, ti: &ThreadInfo<'_>) {
        let target: usize = depth - 1;
        let mut key: Key<'_> = Key::new(full_key);
        let mut layer_root: *mut u8 = self.root_ptr();

        loop {
            let descend: bool = key.shift_count() < target;
            match self.find_locked(layer_root, &key, descend, ti) {
                Locate::Descend(next_root) => {
                    key.shift();
                    layer_root = next_root;
                }
                Locate::RetryFromRoot => {
                    key.unshift_all();
                    layer_root = self.root_ptr();
                }
                Locate::Locked(LockedLeaf { leaf, mut guard, found }) => {
                    let SlotMatch::Found { slot, pos } = found else {
                        return;
                    };
                    if descend || !keylenx_is_stable_layer(leaf.keylenx(slot)) || leaf.lv(slot) != lower {
                        return;
                    }

                    // SAFETY: still linked from the locked slot.
                    let lower_leaf: &LeafNode<V, WIDTH> = unsafe { &*lower.cast::<LeafNode<V, WIDTH>>() };
                    let mut lower_guard: LockGuard<'_> = lower_leaf.version().lock_with(ti.lock_fence(Counter::LeafLock));
                    if lower_guard.is_deleted() || !lower_leaf.parent().is_null() || lower_leaf.size() != 0 {
                        return;
                    }

                    lower_leaf.set_modstate(ModState::DeletedLayer);
                    lower_guard.mark_deleted();

                    guard.mark_insert();
                    let mut perm: Permuter<WIDTH> = leaf.permutation();
                    perm.remove(pos);
                    leaf.set_permutation(perm);
                    drop(lower_guard);

                    // SAFETY: unlinked from its only slot; retired once.
                    unsafe { ti.defer_free(lower.cast::<LeafNode<V, WIDTH>>(), reclaim_boxed::<LeafNode<V, WIDTH>>) };
                    ti.mark(Counter::LayerCollapse);
                    debug_log!(depth, "layer collapsed");

                    if perm.size() == 0 {
                        self.reclaim_empty_leaf(leaf, guard, &key, ti);
                    }
                    return;
                }
            }
        }
    }
}
