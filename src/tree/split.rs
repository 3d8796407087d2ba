//! Leaf split and separator propagation.
//!
//! A full leaf `L` receiving one more key is split into `L` and a new right
//! sibling `N`:
//!
//! ```text
//! 1. pick a split position in the WIDTH + 1 combined entries, never between
//!    two entries with the same ikey
//! 2. mark L splitting, move the upper entries into N (locked, unpublished)
//! 3. place the new key on its side
//! 4. link N into the sibling chain
//! 5. insert (N.ikey_bound, N) into the parent, splitting internodes upward
//!    hand over hand; a split root gets a new root internode above it
//! ```
//!
//! Readers caught mid-split see L's split counter move and either forward
//! along `next` or restart from the layer root.

use crate::internode::InternodeNode;
use crate::key::Key;
use crate::leaf::LeafNode;
use crate::nodeversion::LockGuard;
use crate::ordering::{READ_ORD, WRITE_ORD};
use crate::permuter::Permuter;
use crate::threadinfo::{Counter, ThreadInfo};
use crate::tracing_helpers::debug_log;

use super::{Table, set_node_parent};

/// Choose the first position of the right half among `len` combined
/// entries. The result `p` is in `1..len` with `ikey(p - 1) != ikey(p)`.
///
/// Appending past the end splits off just the new entry so sequential
/// inserts leave full leaves behind.
fn split_position(len: usize, appended: bool, ikey: impl Fn(usize) -> u64) -> usize {
    let last: usize = len - 1;
    if appended && ikey(last - 1) != ikey(last) {
        return last;
    }

    let mid: usize = len / 2;
    for delta in 0..len {
        for p in [mid.checked_sub(delta), mid.checked_add(delta)].into_iter().flatten() {
            if (1..len).contains(&p) && ikey(p - 1) != ikey(p) {
                return p;
            }
        }
    }

    // Every entry shares one ikey; impossible for WIDTH >= MIN_LEAF_WIDTH.
    mid
}

impl<V, const WIDTH: usize> Table<V, WIDTH> {
    /// Split the full, locked `leaf` while inserting `key` (encoded value
    /// `lv`) at permutation position `pos`.
    pub(super) fn split_insert<'a>(
        &self,
        leaf: &'a LeafNode<V, WIDTH>,
        mut guard: LockGuard<'a>,
        pos: usize,
        key: &Key<'_>,
        lv: *mut u8,
        ti: &ThreadInfo<'_>,
    ) {
        let perm: Permuter<WIDTH> = leaf.permutation();
        debug_assert_eq!(perm.size(), WIDTH, "split_insert: leaf not full");

        // Combined order: old positions with the new key at `pos`.
        let combined_ikey = |i: usize| -> u64 {
            match i.cmp(&pos) {
                std::cmp::Ordering::Less => leaf.ikey(perm.get(i)),
                std::cmp::Ordering::Equal => key.ikey(),
                std::cmp::Ordering::Greater => leaf.ikey(perm.get(i - 1)),
            }
        };
        let split_at: usize = split_position(WIDTH + 1, pos == WIDTH, combined_ikey);
        let separator: u64 = combined_ikey(split_at);

        guard.mark_split();

        let right_ptr: *mut LeafNode<V, WIDTH> = Box::into_raw(LeafNode::new(separator));
        // SAFETY: fresh allocation, published below and never freed while
        // linked.
        let right: &'a LeafNode<V, WIDTH> = unsafe { &*right_ptr };
        let right_guard: LockGuard<'a> = right.version().lock_with(ti.lock_fence(Counter::LeafLock));

        // Move combined entries split_at..=WIDTH into `right`, in order.
        let mut moved: usize = 0;
        for i in split_at..=WIDTH {
            if i == pos {
                right.assign(moved, key, lv);
            } else {
                let slot: usize = perm.get(if i < pos { i } else { i - 1 });
                right.assign_raw(moved, leaf.ikey(slot), leaf.keylenx(slot), leaf.ksuf(slot), leaf.lv(slot));
            }
            moved += 1;
        }
        right.set_permutation(Permuter::make_sorted(moved));

        let mut left_perm: Permuter<WIDTH> = perm;
        if pos < split_at {
            left_perm.set_size(split_at - 1);
            leaf.assign(left_perm.back(), key, lv);
            let _ = left_perm.insert_from_back(pos);
        } else {
            left_perm.set_size(split_at);
        }
        leaf.set_permutation(left_perm);

        // Sibling chain. `right.prev` and `next.prev` are ours to write:
        // we hold the lock of their predecessor.
        let next: *mut LeafNode<V, WIDTH> = leaf.next();
        right.set_next(next);
        right.set_prev(std::ptr::from_ref(leaf).cast_mut());
        if !next.is_null() {
            // SAFETY: `next` cannot be unlinked while we hold its predecessor.
            unsafe { (*next).set_prev(right_ptr) };
        }
        leaf.set_next(right_ptr);

        leaf.debug_assert_sorted();
        right.debug_assert_sorted();
        ti.mark(Counter::LeafSplit);
        debug_log!(
            left = leaf.size(),
            right = right.size(),
            separator = format_args!("{separator:#018x}"),
            "leaf split"
        );

        self.propagate_split(leaf.as_node_ptr(), guard, separator, right.as_node_ptr(), right_guard, ti);
    }

    /// Insert `(separator, right)` above `left`, both locked, splitting
    /// parents as needed. Consumes and releases every lock taken.
    fn propagate_split<'a>(
        &self,
        left: *mut u8,
        left_guard: LockGuard<'a>,
        separator: u64,
        right: *mut u8,
        right_guard: LockGuard<'a>,
        ti: &ThreadInfo<'_>,
    ) {
        let mut left: *mut u8 = left;
        let mut left_guard: LockGuard<'a> = left_guard;
        let mut right: *mut u8 = right;
        let mut right_guard: LockGuard<'a> = right_guard;
        let mut separator: u64 = separator;
        // Height of a parent created over `left`.
        let mut height: u32 = 0;

        loop {
            let Some((parent, mut parent_guard)) = Self::locked_parent(left, ti) else {
                let root: *mut InternodeNode<WIDTH> = Box::into_raw(InternodeNode::new_root(height, left, separator, right));
                let root: *mut u8 = root.cast::<u8>();

                // SAFETY: both children are locked by us.
                unsafe {
                    set_node_parent::<V, WIDTH>(left, root);
                    set_node_parent::<V, WIDTH>(right, root);
                }
                // Only layer 0 has a root pointer to update; deeper layers
                // are found through parent links from their old root.
                let _ = self.root.compare_exchange(left, root, WRITE_ORD, READ_ORD);

                ti.mark(Counter::RootSplit);
                debug_log!(height, "new layer root");
                // The split bit on `left` clears its root bit on unlock.
                drop(right_guard);
                drop(left_guard);
                return;
            };

            let parent_ptr: *mut u8 = parent.as_node_ptr();
            let Some(p) = parent.find_child(left) else {
                debug_assert!(false, "locked parent does not list its child");
                return;
            };

            if !parent.is_full() {
                parent_guard.mark_insert();
                parent.insert_key_and_child(p, separator, right);
                // SAFETY: `right` is locked by us.
                unsafe { set_node_parent::<V, WIDTH>(right, parent_ptr) };
                parent.debug_assert_invariants();
                return;
            }

            parent_guard.mark_split();
            let sibling_ptr: *mut InternodeNode<WIDTH> = Box::into_raw(InternodeNode::new(parent.height()));
            // SAFETY: fresh allocation, owned by the tree once published.
            let sibling: &'a InternodeNode<WIDTH> = unsafe { &*sibling_ptr };
            let sibling_guard: LockGuard<'a> = sibling.version().lock_with(ti.lock_fence(Counter::InternodeLock));

            let popup: u64 = parent.split_into(sibling, p, separator, right);
            for child in sibling.children() {
                // SAFETY: children of a node we hold locked.
                unsafe { set_node_parent::<V, WIDTH>(child, sibling.as_node_ptr()) };
            }
            if sibling.find_child(right).is_none() {
                // SAFETY: `right` is locked by us.
                unsafe { set_node_parent::<V, WIDTH>(right, parent_ptr) };
            }
            parent.debug_assert_invariants();
            sibling.debug_assert_invariants();
            ti.mark(Counter::InternodeSplit);
            debug_log!(height = parent.height(), popup = format_args!("{popup:#018x}"), "internode split");

            drop(right_guard);
            drop(left_guard);

            height = parent.height() + 1;
            left = parent_ptr;
            left_guard = parent_guard;
            right = sibling.as_node_ptr();
            right_guard = sibling_guard;
            separator = popup;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_position_prefers_middle() {
        let ikeys: Vec<u64> = (0..16).collect();
        assert_eq!(split_position(16, false, |i| ikeys[i]), 8);
    }

    #[test]
    fn test_split_position_appended_splits_last() {
        let ikeys: Vec<u64> = (0..16).collect();
        assert_eq!(split_position(16, true, |i| ikeys[i]), 15);
    }

    #[test]
    fn test_split_position_never_divides_equal_ikeys() {
        // Ten entries share ikey 5 around the middle.
        let ikeys: Vec<u64> = vec![1, 2, 3, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 9, 9, 9];
        let p: usize = split_position(16, false, |i| ikeys[i]);
        assert_ne!(ikeys[p - 1], ikeys[p]);
        // 3 and 13 are equally far from the middle; the left one wins.
        assert_eq!(p, 3);
    }

    #[test]
    fn test_split_position_appended_equal_ikey_falls_back() {
        let ikeys: Vec<u64> = vec![1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2];
        let p: usize = split_position(11, true, |i| ikeys[i]);
        assert_eq!(p, 6);
    }

    #[test]
    fn test_sequential_inserts_fill_left_leaves() {
        let table: Table<u64, 10> = Table::new();
        let ti = table.threadinfo();
        for i in 0..11u64 {
            table.insert_with(&i.to_be_bytes(), i, &ti);
        }
        let (leaf, _) = table.reach_leaf(table.root_ptr(), 0, &ti);
        // SAFETY: single-threaded.
        let leaf: &LeafNode<u64, 10> = unsafe { &*leaf };
        assert_eq!(leaf.size(), 10);
        // SAFETY: as above.
        assert_eq!(unsafe { (*leaf.next()).size() }, 1);
    }

    #[test]
    fn test_split_links_siblings_both_ways() {
        let table: Table<u64, 10> = Table::new();
        let ti = table.threadinfo();
        for i in (0..200u64).rev() {
            table.insert_with(&i.to_be_bytes(), i, &ti);
        }

        let (mut leaf, _) = table.reach_leaf(table.root_ptr(), 0, &ti);
        let mut seen: usize = 0;
        let mut last_bound: Option<u64> = None;
        while !leaf.is_null() {
            // SAFETY: single-threaded.
            let node: &LeafNode<u64, 10> = unsafe { &*leaf };
            if let Some(bound) = last_bound {
                assert!(node.ikey_bound() > bound);
            }
            let next = node.next();
            if !next.is_null() {
                // SAFETY: as above.
                assert_eq!(unsafe { (*next).prev() }, leaf);
            }
            last_bound = Some(node.ikey_bound());
            seen += node.size();
            leaf = next;
        }
        assert_eq!(seen, 200);
    }
}
