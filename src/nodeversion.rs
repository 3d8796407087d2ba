//! Filepath: src/nodeversion.rs
//!
//! Node version word for optimistic concurrency control.
//!
//! [`NodeVersion`] packs the lock bit, the two dirty bits, the insert and
//! split counters and the node flags into one `u32`. It is the only
//! synchronization primitive a node has.
//!
//! # Protocol
//! 1. Readers: `v = stable()`, read fields, then `has_changed(v)`. A changed
//!    version means everything read under `v` is discarded.
//! 2. Writers: `lock_with()` returns a [`LockGuard`]. Before touching any field
//!    the writer calls [`LockGuard::mark_insert`] or [`LockGuard::mark_split`];
//!    dropping the guard bumps the matching counter and clears the dirty bit
//!    in a single release store.
//!
//! ```rust
//! use masstable::nodeversion::NodeVersion;
//!
//! let v = NodeVersion::new(true);
//! let before: u32 = v.stable();
//! {
//!     let mut guard = v.lock();
//!     guard.mark_insert();
//! }
//! assert!(v.has_changed(before));
//! assert!(!v.has_split(before));
//! ```

use std::marker::PhantomData;

use crate::sync::{AtomicU32, Ordering, fence, spin_loop, yield_now};
use crate::threadinfo::LockFence;


// ============================================================================
//  Bit Constants
// ============================================================================

/// Lock bit: node is locked for modification.
pub const LOCK_BIT: u32 = 1 << 0;

/// Inserting bit: slot contents are being changed.
pub const INSERTING_BIT: u32 = 1 << 1;

/// Splitting bit: keys are moving to another node.
pub const SPLITTING_BIT: u32 = 1 << 2;

/// Either dirty bit.
pub const DIRTY_MASK: u32 = INSERTING_BIT | SPLITTING_BIT;

/// Low bit of the insert counter (bits 3-8).
pub const VINSERT_LOWBIT: u32 = 1 << 3;

/// Low bit of the split counter (bits 9-27).
pub const VSPLIT_LOWBIT: u32 = 1 << 9;

const UNUSED1_BIT: u32 = 1 << 28;

/// Node has been unlinked from the tree.
pub const DELETED_BIT: u32 = 1 << 29;

/// Node is the root of its layer.
pub const ROOT_BIT: u32 = 1 << 30;

/// Node is a leaf.
pub const ISLEAF_BIT: u32 = 1 << 31;

const SPLIT_UNLOCK_MASK: u32 = !(ROOT_BIT | UNUSED1_BIT | (VSPLIT_LOWBIT - 1));
const UNLOCK_MASK: u32 = !(UNUSED1_BIT | (VINSERT_LOWBIT - 1));

/// Spins in `stable()` before yielding the thread.
const STABLE_SPINS_BEFORE_YIELD: u32 = 64;

/// True if the version value `v` carries the deleted bit.
#[inline(always)]
#[must_use]
pub const fn version_deleted(v: u32) -> bool {
    (v & DELETED_BIT) != 0
}

/// True if the version value `v` describes a leaf.
#[inline(always)]
#[must_use]
pub const fn version_is_leaf(v: u32) -> bool {
    (v & ISLEAF_BIT) != 0
}

/// True if a split (or delete) happened between `old` and `new`.
///
/// Pure comparison of two snapshots, no memory access.
#[inline(always)]
#[must_use]
pub const fn simple_has_split(old: u32, new: u32) -> bool {
    (old ^ new) >= VSPLIT_LOWBIT
}

// ============================================================================
//  NodeVersion
// ============================================================================

/// A versioned spin lock embedded as the first field of every node.
///
/// # Layout
/// Bit 31: `is_leaf` | Bit 30: `root` | Bit 29: `deleted` | Bits 9-27: split counter
/// Bits 3-8: insert counter | Bit 2: `splitting` | Bit 1: `inserting` | Bit 0: `locked`
#[derive(Debug)]
pub struct NodeVersion {
    value: AtomicU32,
}

// ============================================================================
//  LockGuard
// ============================================================================

/// Proof that a node's lock is held.
///
/// Only [`NodeVersion::lock_with`] creates one. Dropping it releases the lock,
/// bumping the split counter if [`mark_split`](Self::mark_split) or
/// [`mark_deleted`](Self::mark_deleted) was called, otherwise the insert
/// counter if [`mark_insert`](Self::mark_insert) was called.
///
/// `!Send` and `!Sync` through `PhantomData<*mut ()>`: a lock is released by
/// the thread that took it.
#[derive(Debug)]
#[must_use = "releasing a lock without using the guard is a logic error"]
pub struct LockGuard<'a> {
    version: &'a NodeVersion,
    locked_value: u32,
    _marker: PhantomData<*mut ()>,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let new_value: u32 = if self.locked_value & SPLITTING_BIT != 0 {
            (self.locked_value + VSPLIT_LOWBIT) & SPLIT_UNLOCK_MASK
        } else {
            // (inserting << 2) == VINSERT_LOWBIT when the inserting bit is set
            (self.locked_value + ((self.locked_value & INSERTING_BIT) << 2)) & UNLOCK_MASK
        };

        self.version.value.store(new_value, Ordering::Release);
    }
}

impl LockGuard<'_> {
    /// The version value as seen by the lock holder.
    #[inline]
    #[must_use]
    pub const fn locked_value(&self) -> u32 {
        self.locked_value
    }

    #[inline(always)]
    fn publish(&mut self, value: u32) {
        self.version.value.store(value, Ordering::Relaxed);
        // Dirty bit must be visible before any field store that follows.
        fence(Ordering::Release);
        self.locked_value = value;
    }

    /// Set the inserting dirty bit. The insert counter bumps on unlock.
    #[inline]
    pub fn mark_insert(&mut self) {
        if self.locked_value & INSERTING_BIT == 0 {
            self.publish(self.locked_value | INSERTING_BIT);
        }
    }

    /// Set the splitting dirty bit. The split counter bumps on unlock.
    #[inline]
    pub fn mark_split(&mut self) {
        if self.locked_value & SPLITTING_BIT == 0 {
            self.publish(self.locked_value | SPLITTING_BIT);
        }
    }

    /// Mark the node deleted. Implies a split so that every reader that
    /// cached an older version takes the slow path.
    #[inline]
    pub fn mark_deleted(&mut self) {
        self.publish(self.locked_value | DELETED_BIT | SPLITTING_BIT);
    }

    /// Clear the root bit.
    #[inline]
    pub fn mark_nonroot(&mut self) {
        self.publish(self.locked_value & !ROOT_BIT);
    }

    /// True once [`mark_deleted`](Self::mark_deleted) ran.
    #[inline]
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        version_deleted(self.locked_value)
    }
}

impl NodeVersion {
    /// A fresh, unlocked version.
    ///
    /// `is_leaf` selects between leaf and internode; the flag never changes.
    #[must_use]
    pub fn new(is_leaf: bool) -> Self {
        let initial: u32 = if is_leaf { ISLEAF_BIT } else { 0 };

        Self {
            value: AtomicU32::new(initial),
        }
    }

    /// A version starting at a raw value. Test helper.
    #[must_use]
    pub fn from_value(value: u32) -> Self {
        Self {
            value: AtomicU32::new(value),
        }
    }

    // ========================================================================
    //  Flag Accessors
    // ========================================================================

    /// Leaf or internode.
    #[inline]
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        version_is_leaf(self.value.load(Ordering::Relaxed))
    }

    /// Root of its layer.
    #[inline]
    #[must_use]
    pub fn is_root(&self) -> bool {
        (self.value.load(Ordering::Relaxed) & ROOT_BIT) != 0
    }

    /// Unlinked from the tree.
    #[inline]
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        version_deleted(self.value.load(Ordering::Acquire))
    }

    /// Locked by some thread.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        (self.value.load(Ordering::Relaxed) & LOCK_BIT) != 0
    }

    /// Either dirty bit set.
    #[inline]
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        (self.value.load(Ordering::Relaxed) & DIRTY_MASK) != 0
    }

    /// Raw value, no synchronization implied.
    #[inline]
    #[must_use]
    pub fn value(&self) -> u32 {
        self.value.load(Ordering::Relaxed)
    }

    // ========================================================================
    //  Optimistic Reads
    // ========================================================================

    /// Wait until no writer is mid-mutation and return that version.
    ///
    /// The returned value never has a dirty bit set. It may have the lock bit
    /// set; [`has_changed`](Self::has_changed) ignores it.
    #[inline]
    #[must_use]
    pub fn stable(&self) -> u32 {
        let mut spins: u32 = 0;
        loop {
            let value: u32 = self.value.load(Ordering::Acquire);
            if value & DIRTY_MASK == 0 {
                return value;
            }

            spins += 1;
            if spins < STABLE_SPINS_BEFORE_YIELD {
                spin_loop();
            } else {
                spins = 0;
                yield_now();
            }
        }
    }

    /// True if anything but the lock bit differs from `old`.
    ///
    /// `(old ^ cur) > LOCK_BIT` because a difference in the lock bit alone
    /// XORs to exactly 1.
    #[inline]
    #[must_use]
    pub fn has_changed(&self, old: u32) -> bool {
        // Field loads above must not drift below the version load.
        fence(Ordering::Acquire);
        (old ^ self.value.load(Ordering::Relaxed)) > LOCK_BIT
    }

    /// True if the split counter, deleted bit or root bit moved since `old`.
    #[inline]
    #[must_use]
    pub fn has_split(&self, old: u32) -> bool {
        fence(Ordering::Acquire);
        simple_has_split(old, self.value.load(Ordering::Relaxed))
    }

    // ========================================================================
    //  Locking
    // ========================================================================

    /// Spin until the lock bit is clear, then take it.
    ///
    /// The `fence` token comes from [`crate::threadinfo::ThreadInfo::lock_fence`],
    /// which has already counted the acquisition.
    pub fn lock_with(&self, fence_token: LockFence) -> LockGuard<'_> {
        let spin_limit: u32 = fence_token.spins_before_yield();
        let mut spins: u32 = 0;

        loop {
            let value: u32 = self.value.load(Ordering::Relaxed);

            if value & LOCK_BIT == 0 {
                let locked: u32 = value | LOCK_BIT;
                if self
                    .value
                    .compare_exchange_weak(value, locked, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return LockGuard {
                        version: self,
                        locked_value: locked,
                        _marker: PhantomData,
                    };
                }
            }

            spins += 1;
            if spins < spin_limit {
                spin_loop();
            } else {
                spins = 0;
                yield_now();
            }
        }
    }

    /// [`lock_with`](Self::lock_with) using a default, uncounted fence.
    pub fn lock(&self) -> LockGuard<'_> {
        self.lock_with(LockFence::default())
    }

    /// Take the lock only if it is free right now.
    #[must_use]
    pub fn try_lock(&self) -> Option<LockGuard<'_>> {
        let value: u32 = self.value.load(Ordering::Relaxed);
        if value & LOCK_BIT != 0 {
            return None;
        }

        let locked: u32 = value | LOCK_BIT;
        self.value
            .compare_exchange(value, locked, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| LockGuard {
                version: self,
                locked_value: locked,
                _marker: PhantomData,
            })
    }

    /// Set the root bit on a node that is not yet published.
    pub fn mark_root(&self) {
        let value: u32 = self.value.load(Ordering::Relaxed);
        self.value.store(value | ROOT_BIT, Ordering::Release);
    }
}

impl Default for NodeVersion {
    /// A leaf version.
    fn default() -> Self {
        Self::new(true)
    }
}
