//! Per-thread context for table operations.
//!
//! A [`ThreadInfo`] bundles what the index needs from its surrounding
//! runtime:
//!
//! - an epoch guard from the table's [`seize::Collector`], so nodes and values
//!   unlinked by one thread are only freed after every thread that could
//!   still hold a raw pointer to them has moved on
//! - per-thread event counters ([`Counter`]), flushed into the table's
//!   [`Stats`] when the handle quiesces or drops
//! - the lock fence token handed to [`NodeVersion::lock_with`](crate::nodeversion::NodeVersion::lock_with)
//! - a process-unique thread index for diagnostics
//!
//! Handles are cheap to create but `!Send`; make one per thread, per batch
//! of operations.

use std::cell::Cell;
use std::fmt as StdFmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use seize::{Collector, Guard, LocalGuard};

// ============================================================================
//  Counters
// ============================================================================

/// Named diagnostic events. None of them affects correctness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Counter {
    /// Leaf lock acquired.
    LeafLock,
    /// Internode lock acquired.
    InternodeLock,
    /// Same leaf re-probed after a version mismatch.
    LeafRetry,
    /// Moved right along the leaf chain.
    LeafForward,
    /// Restarted from the current layer's root.
    LayerRetry,
    /// Restarted from the table root after hitting a collapsed layer.
    RootRetry,
    /// Descended into a next-layer tree.
    LayerDescend,
    /// Leaf split.
    LeafSplit,
    /// Internode split.
    InternodeSplit,
    /// A layer grew a new root.
    RootSplit,
    /// New layer created for two keys sharing an 8-byte chunk.
    LayerCreate,
    /// Empty leaf unlinked from its layer.
    LeafUnlink,
    /// Empty layer removed from its parent leaf.
    LayerCollapse,
}

impl Counter {
    /// Number of counters.
    pub const COUNT: usize = 13;

    /// Every counter, in declaration order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::LeafLock,
        Self::InternodeLock,
        Self::LeafRetry,
        Self::LeafForward,
        Self::LayerRetry,
        Self::RootRetry,
        Self::LayerDescend,
        Self::LeafSplit,
        Self::InternodeSplit,
        Self::RootSplit,
        Self::LayerCreate,
        Self::LeafUnlink,
        Self::LayerCollapse,
    ];

    /// Stable snake_case name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::LeafLock => "leaf_lock",
            Self::InternodeLock => "internode_lock",
            Self::LeafRetry => "leaf_retry",
            Self::LeafForward => "leaf_forward",
            Self::LayerRetry => "layer_retry",
            Self::RootRetry => "root_retry",
            Self::LayerDescend => "layer_descend",
            Self::LeafSplit => "leaf_split",
            Self::InternodeSplit => "internode_split",
            Self::RootSplit => "root_split",
            Self::LayerCreate => "layer_create",
            Self::LeafUnlink => "leaf_unlink",
            Self::LayerCollapse => "layer_collapse",
        }
    }

    #[inline(always)]
    const fn index(self) -> usize {
        self as usize
    }
}

/// Table-wide counter totals.
///
/// Owned by the table; written only when a [`ThreadInfo`] flushes.
#[derive(Debug)]
pub struct Stats {
    counters: [AtomicU64; Counter::COUNT],
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            counters: [const { AtomicU64::new(0) }; Counter::COUNT],
        }
    }
}

impl Stats {
    fn add(&self, counter: Counter, n: u64) {
        self.counters[counter.index()].fetch_add(n, Ordering::Relaxed);
    }

    /// Copy of the current totals.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut counts = [0u64; Counter::COUNT];
        for (slot, counter) in counts.iter_mut().zip(&self.counters) {
            *slot = counter.load(Ordering::Relaxed);
        }
        StatsSnapshot { counts }
    }
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    counts: [u64; Counter::COUNT],
}

impl StatsSnapshot {
    /// Total for one counter.
    #[must_use]
    pub const fn get(&self, counter: Counter) -> u64 {
        self.counts[counter.index()]
    }

    /// `(counter, total)` pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (Counter, u64)> + '_ {
        Counter::ALL.iter().map(|&c| (c, self.get(c)))
    }
}

impl StdFmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        let mut first = true;
        for (counter, total) in self.iter().filter(|&(_, n)| n > 0) {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{}={total}", counter.name())?;
            first = false;
        }
        Ok(())
    }
}

// ============================================================================
//  LockFence
// ============================================================================

/// Token handed to the node lock. Carries the spin budget.
#[derive(Debug, Clone, Copy)]
pub struct LockFence {
    spins_before_yield: u32,
}

impl Default for LockFence {
    fn default() -> Self {
        Self {
            spins_before_yield: 128,
        }
    }
}

impl LockFence {
    /// Busy-wait iterations before the locking thread yields.
    #[inline]
    #[must_use]
    pub const fn spins_before_yield(self) -> u32 {
        self.spins_before_yield
    }
}

// ============================================================================
//  Thread Index
// ============================================================================

static NEXT_THREAD_INDEX: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_INDEX: usize = NEXT_THREAD_INDEX.fetch_add(1, Ordering::Relaxed);
}

/// Process-unique index of the calling thread, assigned on first use.
#[must_use]
pub fn current_thread_index() -> usize {
    THREAD_INDEX.with(|index| *index)
}

// ============================================================================
//  ThreadInfo
// ============================================================================

/// Per-thread handle passed to every `*_with` table operation.
///
/// Holds an epoch guard for as long as it lives: memory retired by any thread
/// after this handle was created (or last quiesced) is not freed until it
/// drops or calls [`rcu_quiesce`](Self::rcu_quiesce).
pub struct ThreadInfo<'t> {
    collector: &'t Collector,
    guard: LocalGuard<'t>,
    stats: &'t Stats,
    local: [Cell<u64>; Counter::COUNT],
    index: usize,
    lock_spins: u32,
}

impl StdFmt::Debug for ThreadInfo<'_> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("ThreadInfo")
            .field("index", &self.index)
            .field("lock_spins", &self.lock_spins)
            .finish_non_exhaustive()
    }
}

impl<'t> ThreadInfo<'t> {
    pub(crate) fn new(collector: &'t Collector, stats: &'t Stats, lock_spins: u32) -> Self {
        Self {
            collector,
            guard: collector.enter(),
            stats,
            local: std::array::from_fn(|_| Cell::new(0)),
            index: current_thread_index(),
            lock_spins,
        }
    }

    /// This thread's diagnostic index.
    #[inline]
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Count one `counter` event.
    #[inline]
    pub fn mark(&self, counter: Counter) {
        let cell: &Cell<u64> = &self.local[counter.index()];
        cell.set(cell.get() + 1);
    }

    /// Count a lock acquisition and return the token the lock needs.
    #[inline]
    #[must_use]
    pub fn lock_fence(&self, counter: Counter) -> LockFence {
        self.mark(counter);
        LockFence {
            spins_before_yield: self.lock_spins,
        }
    }

    /// Events counted by this handle since its last flush.
    #[must_use]
    pub fn pending(&self, counter: Counter) -> u64 {
        self.local[counter.index()].get()
    }

    /// Declare a quiescent point: flush counters and let the epoch advance
    /// past everything this thread has read so far.
    ///
    /// Raw node pointers obtained before this call must not be used after it;
    /// the borrow checker enforces that for everything the table hands out.
    pub fn rcu_quiesce(&mut self) {
        self.flush();
        self.guard.refresh();
    }

    /// True if this handle was made by the table owning `collector`.
    #[inline(always)]
    pub(crate) fn belongs_to(&self, collector: &Collector) -> bool {
        std::ptr::eq(self.collector, collector)
    }

    /// Free `ptr` with `reclaim` once no thread can observe it.
    ///
    /// # Safety
    /// `ptr` must be unreachable for new readers and retired exactly once.
    #[inline]
    pub(crate) unsafe fn defer_free<T>(&self, ptr: *mut T, reclaim: unsafe fn(*mut T, &Collector)) {
        // SAFETY: forwarded from the caller.
        unsafe { self.guard.defer_retire(ptr, reclaim) };
    }

    fn flush(&self) {
        for (counter, cell) in Counter::ALL.iter().zip(&self.local) {
            let n: u64 = cell.replace(0);
            if n > 0 {
                self.stats.add(*counter, n);
            }
        }
    }
}

impl Drop for ThreadInfo<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}

// ============================================================================
//  Reclaimers
// ============================================================================

/// Reclaimer for `Box`-allocated objects.
///
/// # Safety
/// `ptr` came from `Box::into_raw` and is not used again.
pub(crate) unsafe fn reclaim_boxed<T>(ptr: *mut T, _collector: &Collector) {
    // SAFETY: guaranteed by the caller.
    drop(unsafe { Box::from_raw(ptr) });
}

/// Reclaimer that releases one strong count of an `Arc`.
///
/// # Safety
/// `ptr` came from `Arc::into_raw` and its count is not used again.
pub(crate) unsafe fn reclaim_arc<T>(ptr: *mut T, _collector: &Collector) {
    // SAFETY: guaranteed by the caller.
    drop(unsafe { Arc::from_raw(ptr.cast_const()) });
}
