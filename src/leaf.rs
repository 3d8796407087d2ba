//! Filepath: src/leaf.rs
//!
//! Leaf node: up to `WIDTH` keyed slots behind a [`Permuter`].
//!
//! Slots are physical; the permutation says which are live and in what order.
//! Every slot field is its own atomic so that optimistic readers can load
//! them while a writer holds the lock; consistency comes from the version
//! check around the read, not from the loads themselves.
//!
//! # Sibling links
//! `next` is written only under this leaf's lock. `prev` is written only by
//! the holder of the lock of the leaf's current predecessor (split of the
//! predecessor, or unlink of the predecessor by its own predecessor's holder).
//!
//! # Ownership
//! A live slot owns one strong count of its value `Arc` and its
//! [`KeySuffix`]. Slots outside the permutation own nothing: their pointers
//! were either moved to another leaf by a split or retired on removal.

use std::fmt as StdFmt;
use std::marker::PhantomData;
use std::ptr as StdPtr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicU64};

use crate::key::{Key, LONG_RANK};
use crate::nodeversion::NodeVersion;
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::permuter::Permuter;
use crate::prefetch::prefetch_read;
use crate::suffix::KeySuffix;
use crate::value::{LeafValue, keylenx_for, keylenx_has_ksuf, keylenx_is_layer, keylenx_rank};

/// Smallest supported leaf width.
///
/// A single ikey can carry at most ten entries (lengths 0..=8 plus one long
/// key or layer). A full leaf plus the incoming key must hold at least two
/// distinct ikeys so a split never separates equal ikeys.
pub const MIN_LEAF_WIDTH: usize = LONG_RANK as usize + 1;

/// What the last structural writer did to this leaf.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModState {
    /// Normal operation.
    Insert = 0,

    /// The leaf was the root of a layer that has been removed from its
    /// parent slot. Anyone who reaches it must restart from the table root.
    DeletedLayer = 2,
}

/// A B+tree leaf.
///
/// `#[repr(C)]` with the version first: node pointers are passed around as
/// `*mut u8` and the version is read before the node type is known.
#[repr(C, align(64))]
pub struct LeafNode<V, const WIDTH: usize = 15> {
    version: NodeVersion,
    modstate: AtomicU8,
    permutation: AtomicU64,

    /// Lowest ikey this leaf may hold. Fixed at construction; 0 for the
    /// leftmost leaf of a layer.
    ikey_bound: u64,

    ikey0: [AtomicU64; WIDTH],
    keylenx: [AtomicU8; WIDTH],

    /// `Arc<V>` raw pointer or next-layer root, per `keylenx`.
    lv: [AtomicPtr<u8>; WIDTH],
    ksuf: [AtomicPtr<KeySuffix>; WIDTH],

    next: AtomicPtr<Self>,
    prev: AtomicPtr<Self>,
    parent: AtomicPtr<u8>,

    _marker: PhantomData<Arc<V>>,
}

impl<V, const WIDTH: usize> StdFmt::Debug for LeafNode<V, WIDTH> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("LeafNode")
            .field("size", &self.size())
            .field("ikey_bound", &self.ikey_bound)
            .field("is_root", &self.version.is_root())
            .field("has_parent", &(!self.parent().is_null()))
            .finish_non_exhaustive()
    }
}

impl<V, const WIDTH: usize> LeafNode<V, WIDTH> {
    const WIDTH_CHECK: () = {
        assert!(WIDTH >= MIN_LEAF_WIDTH, "leaf WIDTH must be at least 10");
        assert!(WIDTH <= 15, "leaf WIDTH must be at most 15");
    };

    // ========================================================================
    //  Construction
    // ========================================================================

    fn build(ikey_bound: u64, is_root: bool) -> Box<Self> {
        let _: () = Self::WIDTH_CHECK;

        let version = NodeVersion::new(true);
        if is_root {
            version.mark_root();
        }

        Box::new(Self {
            version,
            modstate: AtomicU8::new(ModState::Insert as u8),
            permutation: AtomicU64::new(Permuter::<WIDTH>::empty().value()),
            ikey_bound,
            ikey0: std::array::from_fn(|_| AtomicU64::new(0)),
            keylenx: std::array::from_fn(|_| AtomicU8::new(0)),
            lv: std::array::from_fn(|_| AtomicPtr::new(StdPtr::null_mut())),
            ksuf: std::array::from_fn(|_| AtomicPtr::new(StdPtr::null_mut())),
            next: AtomicPtr::new(StdPtr::null_mut()),
            prev: AtomicPtr::new(StdPtr::null_mut()),
            parent: AtomicPtr::new(StdPtr::null_mut()),
            _marker: PhantomData,
        })
    }

    /// A non-root leaf holding ikeys `>= ikey_bound`. Split products only.
    #[must_use]
    pub fn new(ikey_bound: u64) -> Box<Self> {
        Self::build(ikey_bound, false)
    }

    /// An empty root leaf for a new layer (or the table).
    #[must_use]
    pub fn new_root() -> Box<Self> {
        Self::build(0, true)
    }

    /// This leaf as an untyped node pointer.
    #[inline(always)]
    #[must_use]
    pub fn as_node_ptr(&self) -> *mut u8 {
        StdPtr::from_ref(self).cast_mut().cast::<u8>()
    }

    // ========================================================================
    //  Header
    // ========================================================================

    /// The version word.
    #[inline(always)]
    #[must_use]
    pub const fn version(&self) -> &NodeVersion {
        &self.version
    }

    /// See [`ModState`].
    #[inline]
    #[must_use]
    pub fn modstate(&self) -> ModState {
        if self.modstate.load(READ_ORD) == ModState::DeletedLayer as u8 {
            ModState::DeletedLayer
        } else {
            ModState::Insert
        }
    }

    /// Set under the lock, before the version is marked deleted.
    #[inline]
    pub fn set_modstate(&self, state: ModState) {
        self.modstate.store(state as u8, WRITE_ORD);
    }

    /// True once the layer rooted here was collapsed.
    #[inline]
    #[must_use]
    pub fn is_deleted_layer(&self) -> bool {
        self.modstate() == ModState::DeletedLayer
    }

    /// Current permutation.
    #[inline(always)]
    #[must_use]
    pub fn permutation(&self) -> Permuter<WIDTH> {
        Permuter::from_value(self.permutation.load(READ_ORD))
    }

    /// Publish a new permutation. This store is what makes slot changes
    /// visible.
    #[inline(always)]
    pub fn set_permutation(&self, perm: Permuter<WIDTH>) {
        perm.debug_assert_valid();
        self.permutation.store(perm.value(), WRITE_ORD);
    }

    /// Live entries.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.permutation().size()
    }

    /// Lowest ikey routed here.
    #[inline(always)]
    #[must_use]
    pub const fn ikey_bound(&self) -> u64 {
        self.ikey_bound
    }

    // ========================================================================
    //  Slots
    // ========================================================================

    /// ikey of `slot`.
    #[inline(always)]
    #[must_use]
    pub fn ikey(&self, slot: usize) -> u64 {
        self.ikey0[slot].load(READ_ORD)
    }

    /// Raw `keylenx` of `slot`.
    #[inline(always)]
    #[must_use]
    pub fn keylenx(&self, slot: usize) -> u8 {
        self.keylenx[slot].load(READ_ORD)
    }

    /// Raw `lv` of `slot`.
    #[inline(always)]
    #[must_use]
    pub fn lv(&self, slot: usize) -> *mut u8 {
        self.lv[slot].load(READ_ORD)
    }

    /// Suffix pointer of `slot`; null unless `keylenx` says suffix.
    #[inline(always)]
    #[must_use]
    pub fn ksuf(&self, slot: usize) -> *mut KeySuffix {
        self.ksuf[slot].load(READ_ORD)
    }

    /// `keylenx` then `lv`, decoded.
    #[inline]
    #[must_use]
    pub fn leaf_value(&self, slot: usize) -> LeafValue<V> {
        let keylenx: u8 = self.keylenx(slot);
        LeafValue::decode(keylenx, self.lv(slot))
    }

    /// Ordering rank of `slot`.
    #[inline(always)]
    #[must_use]
    pub fn rank(&self, slot: usize) -> u8 {
        keylenx_rank(self.keylenx(slot))
    }

    /// Suffix bytes of `slot`.
    ///
    /// # Safety
    /// The caller holds the lock, or is inside an epoch guard and will
    /// discard the result unless the version validates.
    #[inline]
    #[must_use]
    pub unsafe fn ksuf_bytes<'a>(&self, slot: usize) -> Option<&'a [u8]> {
        let ptr: *mut KeySuffix = self.ksuf(slot);
        if ptr.is_null() {
            return None;
        }
        // SAFETY: suffixes are immutable and retired through the epoch.
        Some(unsafe { (*ptr).as_bytes() })
    }

    /// True if `slot` is a suffixed key whose suffix equals `suffix`.
    ///
    /// # Safety
    /// As for [`ksuf_bytes`](Self::ksuf_bytes).
    #[inline]
    #[must_use]
    pub unsafe fn ksuf_matches(&self, slot: usize, suffix: &[u8]) -> bool {
        // SAFETY: forwarded.
        unsafe { self.ksuf_bytes(slot) }.is_some_and(|bytes| bytes == suffix)
    }

    /// Fill `slot` with `key` at its current layer and value pointer `lv`.
    ///
    /// The slot must not be reachable through the permutation.
    pub fn assign(&self, slot: usize, key: &Key<'_>, lv: *mut u8) {
        let ksuf: *mut KeySuffix = if key.has_suffix() {
            KeySuffix::into_raw(key.suffix())
        } else {
            StdPtr::null_mut()
        };
        self.assign_raw(slot, key.ikey(), keylenx_for(key), ksuf, lv);
    }

    /// Fill `slot` with already-encoded fields. Ownership of `ksuf` and `lv`
    /// moves into the slot.
    #[inline]
    pub fn assign_raw(&self, slot: usize, ikey: u64, keylenx: u8, ksuf: *mut KeySuffix, lv: *mut u8) {
        self.ikey0[slot].store(ikey, RELAXED);
        self.ksuf[slot].store(ksuf, RELAXED);
        self.lv[slot].store(lv, RELAXED);
        self.keylenx[slot].store(keylenx, WRITE_ORD);
    }

    /// Overwrite `keylenx` under the lock.
    #[inline]
    pub fn set_keylenx(&self, slot: usize, keylenx: u8) {
        self.keylenx[slot].store(keylenx, WRITE_ORD);
    }

    /// Overwrite `lv` under the lock.
    #[inline]
    pub fn set_lv(&self, slot: usize, lv: *mut u8) {
        self.lv[slot].store(lv, WRITE_ORD);
    }

    /// Replace `lv` under the lock, returning the old pointer.
    #[inline]
    pub fn swap_lv(&self, slot: usize, lv: *mut u8) -> *mut u8 {
        self.lv[slot].swap(lv, WRITE_ORD)
    }

    /// Detach the suffix of `slot` under the lock.
    #[inline]
    pub fn take_ksuf(&self, slot: usize) -> *mut KeySuffix {
        self.ksuf[slot].swap(StdPtr::null_mut(), WRITE_ORD)
    }

    // ========================================================================
    //  Links
    // ========================================================================

    /// Right sibling.
    #[inline(always)]
    #[must_use]
    pub fn next(&self) -> *mut Self {
        self.next.load(READ_ORD)
    }

    /// Set the right sibling (leaf lock held).
    #[inline(always)]
    pub fn set_next(&self, next: *mut Self) {
        self.next.store(next, WRITE_ORD);
    }

    /// Left sibling.
    #[inline(always)]
    #[must_use]
    pub fn prev(&self) -> *mut Self {
        self.prev.load(READ_ORD)
    }

    /// Set the left sibling (predecessor's lock held).
    #[inline(always)]
    pub fn set_prev(&self, prev: *mut Self) {
        self.prev.store(prev, WRITE_ORD);
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

    /// Pull the slot arrays into cache.
    #[inline(always)]
    pub fn prefetch(&self) {
        let base: *const u8 = StdPtr::from_ref(self).cast::<u8>();
        let size: usize = size_of::<Self>();
        let mut offset: usize = 64;
        while offset < size {
            prefetch_read(base.wrapping_add(offset));
            offset += 64;
        }
    }

    // ========================================================================
    //  Teardown
    // ========================================================================

    /// Release every value and suffix owned by a live slot. Layer slots are
    /// left alone; the caller walks them.
    ///
    /// # Safety
    /// No other thread can reach this leaf, and it is not used afterwards
    /// except to be freed.
    pub unsafe fn drop_contents(&self) {
        for slot in self.permutation().slots() {
            let keylenx: u8 = self.keylenx(slot);
            let ksuf: *mut KeySuffix = self.ksuf(slot);
            if !ksuf.is_null() {
                // SAFETY: owned by this live slot.
                drop(unsafe { Box::from_raw(ksuf) });
            }
            if !keylenx_is_layer(keylenx) {
                let lv: *const V = self.lv(slot).cast_const().cast::<V>();
                if !lv.is_null() {
                    // SAFETY: the slot's strong count.
                    drop(unsafe { Arc::from_raw(lv) });
                }
            }
        }
    }

    /// Debug check that live slots are in `(ikey, rank)` order.
    pub fn debug_assert_sorted(&self) {
        #[cfg(debug_assertions)]
        {
            let perm: Permuter<WIDTH> = self.permutation();
            let mut last: Option<(u64, u8)> = None;
            for slot in perm.slots() {
                let here: (u64, u8) = (self.ikey(slot), self.rank(slot));
                if let Some(prev) = last {
                    assert!(prev < here, "leaf slots out of order: {prev:?} !< {here:?}");
                }
                assert!(
                    !keylenx_has_ksuf(self.keylenx(slot)) || !self.ksuf(slot).is_null(),
                    "suffixed slot without suffix"
                );
                last = Some(here);
            }
        }
    }
}
