//! Filepath: src/tree.rs
//!
//! [`Table`]: the concurrent ordered index.
//!
//! A table is a trie of B+trees. Layer 0 is indexed by the first 8 bytes of
//! each key; a leaf slot whose 8-byte chunk is shared by several long keys
//! points to a next-layer tree indexed by the following 8 bytes, and so on.
//!
//! The algorithms live in submodules:
//!
//! | module       | operations                                                  |
//! |--------------|-------------------------------------------------------------|
//! | `optimistic` | `reach_leaf`, `forward_at_leaf`, lock-free `find_unlocked`  |
//! | `locked`     | `find_locked`, `get_leaf_locked`, insert                    |
//! | `split`      | leaf split and separator propagation                        |
//! | `layer`      | next-layer creation                                         |
//! | `remove`     | remove, leaf unlink, layer collapse (`gc_layer`)            |
//! | `scan`       | ordered scans in both directions                            |
//! | `teardown`   | freeing everything on drop                                  |

use std::fmt as StdFmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize};

use seize::Collector;

use crate::config::TableConfig;
use crate::internode::InternodeNode;
use crate::key::Key;
use crate::leaf::LeafNode;
use crate::nodeversion::NodeVersion;
use crate::ordering::{COUNTER_ORD, READ_ORD};
use crate::threadinfo::{Stats, StatsSnapshot, ThreadInfo};

mod layer;
mod locked;
mod optimistic;
mod remove;
mod scan;
mod split;
mod teardown;

// ============================================================================
//  Node Helpers
// ============================================================================

/// Version of a leaf or internode.
///
/// # Safety
/// `node` points to a live `LeafNode` or `InternodeNode`.
#[inline(always)]
pub(crate) unsafe fn node_version<'a>(node: *mut u8) -> &'a NodeVersion {
    // SAFETY: both node types are repr(C) with the version first.
    unsafe { &*node.cast::<NodeVersion>() }
}

/// Parent pointer of a leaf or internode.
///
/// # Safety
/// As for [`node_version`], with leaves of type `LeafNode<V, WIDTH>`.
#[inline]
pub(crate) unsafe fn node_parent<V, const WIDTH: usize>(node: *mut u8) -> *mut u8 {
    // SAFETY: type chosen by the version's leaf bit.
    unsafe {
        if node_version(node).is_leaf() {
            (*node.cast::<LeafNode<V, WIDTH>>()).parent()
        } else {
            (*node.cast::<InternodeNode<WIDTH>>()).parent()
        }
    }
}

/// Set the parent pointer of a leaf or internode.
///
/// # Safety
/// As for [`node_parent`]; the caller holds the parent's lock or owns
/// `node` exclusively.
#[inline]
pub(crate) unsafe fn set_node_parent<V, const WIDTH: usize>(node: *mut u8, parent: *mut u8) {
    // SAFETY: type chosen by the version's leaf bit.
    unsafe {
        if node_version(node).is_leaf() {
            (*node.cast::<LeafNode<V, WIDTH>>()).set_parent(parent);
        } else {
            (*node.cast::<InternodeNode<WIDTH>>()).set_parent(parent);
        }
    }
}

// ============================================================================
//  Table
// ============================================================================

/// A concurrent ordered map from byte strings to `Arc<V>`.
///
/// Reads never block and never write shared memory. Writers lock single
/// nodes. Memory unlinked by any operation is freed through the table's
/// epoch collector once no [`ThreadInfo`] can still observe it.
///
/// `WIDTH` is the leaf and internode fan-out (10..=15). Smaller widths only
/// make splits more frequent, which tests use.
///
/// ```rust
/// use masstable::Table;
///
/// let table: Table<u64> = Table::new();
/// table.insert(b"hello", 1);
/// table.insert(b"hello world, a longer key", 2);
///
/// assert_eq!(table.get(b"hello").as_deref(), Some(&1));
/// assert!(table.remove(b"hello"));
/// assert_eq!(table.len(), 1);
///
/// let keys: Vec<Vec<u8>> = table.scan(b"", 10, true).map(|(k, _)| k).collect();
/// assert_eq!(keys, vec![b"hello world, a longer key".to_vec()]);
/// ```
///
/// For batches, take one [`ThreadInfo`] per thread and use the `*_with`
/// forms:
///
/// ```rust
/// use masstable::Table;
///
/// let table: Table<String> = Table::new();
/// std::thread::scope(|s| {
///     for t in 0..4u8 {
///         let table = &table;
///         s.spawn(move || {
///             let ti = table.threadinfo();
///             for i in 0..100u8 {
///                 table.insert_with(&[t, i], format!("{t}/{i}"), &ti);
///             }
///         });
///     }
/// });
/// assert_eq!(table.len(), 400);
/// ```
pub struct Table<V, const WIDTH: usize = 15> {
    /// Layer-0 root. May lag behind a root split; readers climb parents.
    root: AtomicPtr<u8>,
    count: AtomicUsize,
    stats: Stats,
    config: TableConfig,
    collector: Collector,
    _marker: PhantomData<Arc<V>>,
}

impl<V, const WIDTH: usize> StdFmt::Debug for Table<V, WIDTH> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("Table")
            .field("len", &self.len())
            .field("width", &WIDTH)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<V, const WIDTH: usize> Default for Table<V, WIDTH> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, const WIDTH: usize> Table<V, WIDTH> {
    /// An empty table with the default [`TableConfig`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(TableConfig::default())
    }

    /// An empty table tuned by `config`.
    ///
    /// `config` is assumed valid; see [`TableConfig::validate`].
    #[must_use]
    pub fn with_config(config: TableConfig) -> Self {
        let root: *mut LeafNode<V, WIDTH> = Box::into_raw(LeafNode::new_root());

        Self {
            root: AtomicPtr::new(root.cast::<u8>()),
            count: AtomicUsize::new(0),
            stats: Stats::default(),
            config,
            collector: Collector::new().batch_size(config.reclaim_batch_size()),
            _marker: PhantomData,
        }
    }

    /// A per-thread handle for the `*_with` operations.
    ///
    /// Memory retired by any thread is not freed while a handle that predates
    /// the retirement is alive (or until it calls
    /// [`ThreadInfo::rcu_quiesce`]), so do not keep one across long idle
    /// periods.
    #[must_use]
    pub fn threadinfo(&self) -> ThreadInfo<'_> {
        ThreadInfo::new(&self.collector, &self.stats, self.config.lock_spins_before_yield())
    }

    /// The configuration this table was built with.
    #[must_use]
    pub const fn config(&self) -> &TableConfig {
        &self.config
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count.load(COUNTER_ORD)
    }

    /// True if the table holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter totals flushed so far by dropped or quiesced handles.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    #[inline(always)]
    fn root_ptr(&self) -> *mut u8 {
        self.root.load(READ_ORD)
    }

    #[inline(always)]
    fn check_threadinfo(&self, ti: &ThreadInfo<'_>) {
        assert!(
            ti.belongs_to(&self.collector),
            "ThreadInfo was created by a different table"
        );
    }

    // ========================================================================
    //  Get
    // ========================================================================

    /// Value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Arc<V>> {
        let ti: ThreadInfo<'_> = self.threadinfo();
        self.get_with(key, &ti)
    }

    /// [`get`](Self::get) with a caller-provided handle.
    ///
    /// # Panics
    /// If `ti` was made by another table.
    #[must_use]
    pub fn get_with(&self, key: &[u8], ti: &ThreadInfo<'_>) -> Option<Arc<V>> {
        self.check_threadinfo(ti);
        let mut key: Key<'_> = Key::new(key);
        self.find_unlocked(&mut key, ti)
    }

    /// True if `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    // ========================================================================
    //  Insert
    // ========================================================================

    /// Store `value` under `key`, returning the value it replaced.
    pub fn insert(&self, key: &[u8], value: V) -> Option<Arc<V>> {
        let ti: ThreadInfo<'_> = self.threadinfo();
        self.insert_with(key, value, &ti)
    }

    /// [`insert`](Self::insert) with a caller-provided handle.
    ///
    /// # Panics
    /// If `ti` was made by another table.
    pub fn insert_with(&self, key: &[u8], value: V, ti: &ThreadInfo<'_>) -> Option<Arc<V>> {
        self.insert_arc_with(key, Arc::new(value), ti)
    }

    /// Store an already shared value.
    ///
    /// # Panics
    /// If `ti` was made by another table.
    pub fn insert_arc_with(&self, key: &[u8], value: Arc<V>, ti: &ThreadInfo<'_>) -> Option<Arc<V>> {
        self.check_threadinfo(ti);
        self.put(key, value, ti)
    }

    // ========================================================================
    //  Remove
    // ========================================================================

    /// Remove `key`. Returns false if it was absent.
    pub fn remove(&self, key: &[u8]) -> bool {
        let ti: ThreadInfo<'_> = self.threadinfo();
        self.remove_with(key, &ti).is_some()
    }

    /// Remove `key`, returning its value.
    ///
    /// # Panics
    /// If `ti` was made by another table.
    pub fn remove_with(&self, key: &[u8], ti: &ThreadInfo<'_>) -> Option<Arc<V>> {
        self.check_threadinfo(ti);
        self.remove_key(key, ti)
    }

    // ========================================================================
    //  Scan
    // ========================================================================

    /// Up to `count` entries starting at `start`: keys `>= start` in
    /// ascending order, or keys `<= start` in descending order.
    ///
    /// The result is collected eagerly; entries reflect some moment during
    /// the call for each key, not one snapshot of the whole table.
    pub fn scan(&self, start: &[u8], count: usize, ascending: bool) -> std::vec::IntoIter<(Vec<u8>, Arc<V>)> {
        let ti: ThreadInfo<'_> = self.threadinfo();
        let mut out: Vec<(Vec<u8>, Arc<V>)> = Vec::with_capacity(count.min(1024));
        if count > 0 {
            self.scan_with(start, ascending, &ti, |key, value| {
                out.push((key.to_vec(), Arc::clone(value)));
                out.len() < count
            });
        }
        out.into_iter()
    }

    /// Visit entries from `start` in order until `visit` returns false.
    ///
    /// # Panics
    /// If `ti` was made by another table.
    pub fn scan_with<F>(&self, start: &[u8], ascending: bool, ti: &ThreadInfo<'_>, mut visit: F)
    where
        F: FnMut(&[u8], &Arc<V>) -> bool,
    {
        self.check_threadinfo(ti);
        self.scan_from(start, ascending, ti, &mut visit);
    }
}

impl<V, const WIDTH: usize> Drop for Table<V, WIDTH> {
    fn drop(&mut self) {
        let root: *mut u8 = *self.root.get_mut();
        // SAFETY: &mut self; no handle can be alive.
        unsafe { teardown::free_tree::<V, WIDTH>(root) };
    }
}
