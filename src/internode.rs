//! Filepath: src/internode.rs
//!
//! Internal routing node.
//!
//! Keys are kept physically sorted, so there is no permutation. A node with
//! `n` keys has `n + 1` children:
//!
//! ```text
//!         [K0 | K1 | K2]
//!        /    |    |    \
//!    C0     C1    C2     C3
//!
//!    C0: ikey < K0
//!    C1: K0 <= ikey < K1
//!    C2: K1 <= ikey < K2
//!    C3: ikey >= K2
//! ```
//!
//! Child `WIDTH` lives in `rightmost_child` because `[_; WIDTH + 1]` needs
//! unstable const generics.
//!
//! Children are stored as `*mut u8`; a child's type is read from its
//! version. Parent pointers of leaf children are maintained by the tree,
//! which knows the leaf type.

use std::fmt as StdFmt;
use std::ptr as StdPtr;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicU64, Ordering, fence};

use crate::nodeversion::NodeVersion;
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};

/// An internal node with up to `WIDTH` keys.
///
/// # Invariants
/// - `nkeys <= WIDTH`
/// - `ikey0[0..nkeys]` strictly ascending
/// - `child(0..=nkeys)` non-null
#[repr(C, align(64))]
pub struct InternodeNode<const WIDTH: usize = 15> {
    version: NodeVersion,
    nkeys: AtomicU8,

    /// 0 when the children are leaves.
    height: u32,

    ikey0: [AtomicU64; WIDTH],
    child: [AtomicPtr<u8>; WIDTH],
    rightmost_child: AtomicPtr<u8>,
    parent: AtomicPtr<u8>,
}

impl<const WIDTH: usize> StdFmt::Debug for InternodeNode<WIDTH> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("InternodeNode")
            .field("nkeys", &self.nkeys())
            .field("height", &self.height)
            .field("has_parent", &(!self.parent().is_null()))
            .finish_non_exhaustive()
    }
}

impl<const WIDTH: usize> InternodeNode<WIDTH> {
    const WIDTH_CHECK: () = {
        assert!(WIDTH >= 3, "internode WIDTH must be at least 3");
        assert!(WIDTH <= 15, "internode WIDTH must be at most 15");
    };

    /// An empty internode at `height`.
    #[must_use]
    pub fn new(height: u32) -> Box<Self> {
        let _: () = Self::WIDTH_CHECK;

        Box::new(Self {
            version: NodeVersion::new(false),
            nkeys: AtomicU8::new(0),
            height,
            ikey0: std::array::from_fn(|_| AtomicU64::new(0)),
            child: std::array::from_fn(|_| AtomicPtr::new(StdPtr::null_mut())),
            rightmost_child: AtomicPtr::new(StdPtr::null_mut()),
            parent: AtomicPtr::new(StdPtr::null_mut()),
        })
    }

    /// A new layer root over two children split from an old root.
    #[must_use]
    pub fn new_root(height: u32, left: *mut u8, separator: u64, right: *mut u8) -> Box<Self> {
        let node: Box<Self> = Self::new(height);
        node.set_child(0, left);
        node.ikey0[0].store(separator, RELAXED);
        node.set_child(1, right);
        node.nkeys.store(1, RELAXED);
        node.version.mark_root();
        node
    }

    /// This node as an untyped node pointer.
    #[inline(always)]
    #[must_use]
    pub fn as_node_ptr(&self) -> *mut u8 {
        StdPtr::from_ref(self).cast_mut().cast::<u8>()
    }

    /// The version word.
    #[inline(always)]
    #[must_use]
    pub const fn version(&self) -> &NodeVersion {
        &self.version
    }

    /// Number of keys.
    #[inline(always)]
    #[must_use]
    pub fn nkeys(&self) -> usize {
        self.nkeys.load(READ_ORD) as usize
    }

    /// No room for another key.
    #[inline(always)]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.nkeys() >= WIDTH
    }

    /// Key `i`.
    #[inline(always)]
    #[must_use]
    pub fn ikey(&self, i: usize) -> u64 {
        self.ikey0[i].load(READ_ORD)
    }

    /// 0 when the children are leaves.
    #[inline(always)]
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// True if the children are leaves.
    #[inline(always)]
    #[must_use]
    pub const fn children_are_leaves(&self) -> bool {
        self.height == 0
    }

    /// Child `i`, `0..=WIDTH`.
    #[inline(always)]
    #[must_use]
    pub fn child(&self, i: usize) -> *mut u8 {
        if i < WIDTH {
            self.child[i].load(READ_ORD)
        } else {
            self.rightmost_child.load(READ_ORD)
        }
    }

    #[inline(always)]
    fn set_child(&self, i: usize, child: *mut u8) {
        if i < WIDTH {
            self.child[i].store(child, WRITE_ORD);
        } else {
            self.rightmost_child.store(child, WRITE_ORD);
        }
    }

    /// Parent internode, null for a layer root.
    #[inline(always)]
    #[must_use]
    pub fn parent(&self) -> *mut u8 {
        self.parent.load(READ_ORD)
    }

    /// Set the parent internode.
    #[inline(always)]
    pub fn set_parent(&self, parent: *mut u8) {
        self.parent.store(parent, WRITE_ORD);
    }

    /// Index of the child covering `ikey`: the number of keys `<= ikey`.
    ///
    /// Safe to call on a node being modified; the result is always in
    /// `0..=WIDTH` and the caller validates the version.
    #[must_use]
    pub fn upper_bound(&self, ikey: u64) -> usize {
        let n: usize = self.nkeys().min(WIDTH);
        let mut lo: usize = 0;
        let mut hi: usize = n;
        while lo < hi {
            let mid: usize = (lo + hi) >> 1;
            if self.ikey(mid) <= ikey {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Position of `child` among the children, lock held.
    #[must_use]
    pub fn find_child(&self, child: *mut u8) -> Option<usize> {
        (0..=self.nkeys()).find(|&i| self.child(i) == child)
    }

    /// Children `0..=nkeys`.
    pub fn children(&self) -> impl Iterator<Item = *mut u8> + '_ {
        (0..=self.nkeys()).map(|i| self.child(i))
    }

    // ========================================================================
    //  Mutation (lock held, dirty bit set)
    // ========================================================================

    /// Insert `ikey` at key position `p` with `right` as child `p + 1`.
    pub fn insert_key_and_child(&self, p: usize, ikey: u64, right: *mut u8) {
        let n: usize = self.nkeys.load(RELAXED) as usize;
        debug_assert!(n < WIDTH, "insert_key_and_child: node is full");
        debug_assert!(p <= n, "insert_key_and_child: {p} > {n}");

        for i in (p..n).rev() {
            self.ikey0[i + 1].store(self.ikey0[i].load(RELAXED), RELAXED);
            self.set_child(i + 2, self.child(i + 1));
        }
        self.ikey0[p].store(ikey, RELAXED);
        self.set_child(p + 1, right);

        fence(Ordering::Release);
        #[expect(clippy::cast_possible_truncation, reason = "n < WIDTH <= 15")]
        self.nkeys.store((n + 1) as u8, WRITE_ORD);
    }

    /// Drop child `idx` and the key to its left, merging its range into
    /// child `idx - 1`.
    pub fn remove_child(&self, idx: usize) {
        let n: usize = self.nkeys.load(RELAXED) as usize;
        debug_assert!(idx >= 1 && idx <= n, "remove_child: bad index {idx}");

        for i in idx..n {
            self.ikey0[i - 1].store(self.ikey0[i].load(RELAXED), RELAXED);
            self.set_child(i, self.child(i + 1));
        }

        fence(Ordering::Release);
        #[expect(clippy::cast_possible_truncation, reason = "n <= WIDTH <= 15")]
        self.nkeys.store((n - 1) as u8, WRITE_ORD);
    }

    /// Split a full node while inserting `(ikey, child)` at key position
    /// `p`: the lower half stays, the upper half moves to `right`, and the
    /// middle key is returned for the parent.
    ///
    /// `right` is unpublished. Parent pointers of the children that moved
    /// are left to the caller.
    #[expect(clippy::cast_possible_truncation, reason = "WIDTH <= 15")]
    pub fn split_into(&self, right: &Self, p: usize, ikey: u64, child: *mut u8) -> u64 {
        debug_assert_eq!(self.nkeys.load(RELAXED) as usize, WIDTH, "split_into: not full");
        debug_assert_eq!(right.height, self.height, "split_into: height mismatch");

        // Combined WIDTH + 1 keys and WIDTH + 2 children.
        let mut keys = [0u64; 16];
        let mut children = [StdPtr::null_mut::<u8>(); 17];
        children[0] = self.child(0);
        let mut src: usize = 0;
        for dst in 0..=WIDTH {
            if dst == p {
                keys[dst] = ikey;
                children[dst + 1] = child;
            } else {
                keys[dst] = self.ikey0[src].load(RELAXED);
                children[dst + 1] = self.child(src + 1);
                src += 1;
            }
        }

        let mid: usize = (WIDTH + 1) / 2;
        let popup: u64 = keys[mid];

        for i in 0..mid {
            self.ikey0[i].store(keys[i], RELAXED);
            self.set_child(i + 1, children[i + 1]);
        }

        let moved: usize = WIDTH - mid;
        right.set_child(0, children[mid + 1]);
        for i in 0..moved {
            right.ikey0[i].store(keys[mid + 1 + i], RELAXED);
            right.set_child(i + 1, children[mid + 2 + i]);
        }

        fence(Ordering::Release);
        right.nkeys.store(moved as u8, WRITE_ORD);
        self.nkeys.store(mid as u8, WRITE_ORD);

        popup
    }

    /// Debug check of key order.
    pub fn debug_assert_invariants(&self) {
        #[cfg(debug_assertions)]
        {
            let n: usize = self.nkeys();
            assert!(n <= WIDTH, "nkeys {n} > {WIDTH}");
            for i in 1..n {
                assert!(self.ikey(i - 1) < self.ikey(i), "internode keys out of order at {i}");
            }
            for i in 0..=n {
                assert!(!self.child(i).is_null(), "null child {i}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake(n: usize) -> *mut u8 {
        // Distinct, never dereferenced.
        StdPtr::without_provenance_mut(0x1000 + n * 64)
    }

    fn full_node() -> Box<InternodeNode<4>> {
        let node = InternodeNode::<4>::new_root(0, fake(0), 10, fake(1));
        node.insert_key_and_child(1, 20, fake(2));
        node.insert_key_and_child(2, 30, fake(3));
        node.insert_key_and_child(3, 40, fake(4));
        node
    }

    #[test]
    fn test_new_root_layout() {
        let node = InternodeNode::<15>::new_root(0, fake(0), 100, fake(1));
        assert_eq!(node.nkeys(), 1);
        assert!(node.version().is_root());
        assert!(!node.version().is_leaf());
        assert_eq!(node.upper_bound(99), 0);
        assert_eq!(node.upper_bound(100), 1);
        assert_eq!(node.child(1), fake(1));
    }

    #[test]
    fn test_insert_keeps_order() {
        let node = InternodeNode::<15>::new_root(0, fake(0), 50, fake(1));
        node.insert_key_and_child(0, 20, fake(2));
        node.insert_key_and_child(2, 80, fake(3));

        assert_eq!(node.nkeys(), 3);
        assert_eq!((node.ikey(0), node.ikey(1), node.ikey(2)), (20, 50, 80));
        let children: Vec<*mut u8> = node.children().collect();
        assert_eq!(children, vec![fake(0), fake(2), fake(1), fake(3)]);
        node.debug_assert_invariants();
    }

    #[test]
    fn test_upper_bound_routes() {
        let node = full_node();
        assert_eq!(node.upper_bound(0), 0);
        assert_eq!(node.upper_bound(10), 1);
        assert_eq!(node.upper_bound(25), 2);
        assert_eq!(node.upper_bound(u64::MAX), 4);
        assert_eq!(node.child(4), fake(4));
    }

    #[test]
    fn test_find_and_remove_child() {
        let node = full_node();
        assert_eq!(node.find_child(fake(2)), Some(2));
        assert_eq!(node.find_child(fake(9)), None);

        node.remove_child(2);
        assert_eq!(node.nkeys(), 3);
        assert_eq!((node.ikey(0), node.ikey(1), node.ikey(2)), (10, 30, 40));
        assert_eq!(node.upper_bound(25), 1);
        assert_eq!(node.child(1), fake(1));
        node.debug_assert_invariants();
    }

    #[test]
    fn test_split_into_insert_left() {
        let node = full_node();
        let right = InternodeNode::<4>::new(0);

        let popup: u64 = node.split_into(&right, 0, 5, fake(9));

        // keys 5 10 | 20 | 30 40
        assert_eq!(popup, 20);
        assert_eq!(node.nkeys(), 2);
        assert_eq!((node.ikey(0), node.ikey(1)), (5, 10));
        assert_eq!(node.children().collect::<Vec<_>>(), vec![fake(0), fake(9), fake(1)]);

        assert_eq!(right.nkeys(), 2);
        assert_eq!((right.ikey(0), right.ikey(1)), (30, 40));
        assert_eq!(right.children().collect::<Vec<_>>(), vec![fake(2), fake(3), fake(4)]);
    }

    #[test]
    fn test_split_into_insert_becomes_popup() {
        let node = full_node();
        let right = InternodeNode::<4>::new(0);

        let popup: u64 = node.split_into(&right, 2, 25, fake(9));

        assert_eq!(popup, 25);
        assert_eq!(node.children().collect::<Vec<_>>(), vec![fake(0), fake(1), fake(2)]);
        assert_eq!(right.child(0), fake(9));
        assert_eq!((right.ikey(0), right.ikey(1)), (30, 40));
    }

    #[test]
    fn test_split_into_insert_right() {
        let node = full_node();
        let right = InternodeNode::<4>::new(0);

        let popup: u64 = node.split_into(&right, 4, 50, fake(9));

        assert_eq!(popup, 30);
        assert_eq!((node.ikey(0), node.ikey(1)), (10, 20));
        assert_eq!((right.ikey(0), right.ikey(1)), (40, 50));
        assert_eq!(right.children().collect::<Vec<_>>(), vec![fake(3), fake(4), fake(9)]);
        right.debug_assert_invariants();
    }
}
