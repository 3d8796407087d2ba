//! Ordered scans.
//!
//! A scan walks one layer at a time along the leaf chain, recursing into
//! next-layer slots in key order. Each leaf is read as a version-validated
//! snapshot (entries plus sibling links); values are cloned only from a
//! validated snapshot.
//!
//! Progress is tracked as a full-key bound: inclusive at the start, then
//! exclusive at the last key emitted. Whenever the walk loses its place (a
//! deleted leaf, a sibling link that moved) it re-descends from the layer
//! root using the bound, so no key is emitted twice and keys present for
//! the whole scan are never skipped.
//!
//! Descending scans follow `prev` links, which are only hints: a
//! predecessor is trusted only if its own snapshot still points back at
//! the current leaf.

use std::ops::ControlFlow;
use std::ptr as StdPtr;
use std::sync::Arc;

use crate::key::{IKEY_SIZE, Key, ikey_bytes};
use crate::leaf::LeafNode;
use crate::threadinfo::{Counter, ThreadInfo};
use crate::value::{LeafValue, keylenx_has_ksuf, keylenx_is_layer};

use super::Table;

// ============================================================================
//  Snapshots
// ============================================================================

#[derive(Debug)]
struct Entry {
    ikey: u64,
    keylenx: u8,
    lv: *mut u8,
    suffix: Vec<u8>,
}

impl Entry {
    /// Full key of a value entry under `prefix`.
    fn full_key(&self, prefix: &[u8]) -> Vec<u8> {
        let chunk_len: usize = if keylenx_is_layer(self.keylenx) || keylenx_has_ksuf(self.keylenx) {
            IKEY_SIZE
        } else {
            usize::from(self.keylenx)
        };

        let mut key: Vec<u8> = Vec::with_capacity(prefix.len() + chunk_len + self.suffix.len());
        key.extend_from_slice(prefix);
        key.extend_from_slice(&ikey_bytes(self.ikey, chunk_len));
        key.extend_from_slice(&self.suffix);
        key
    }
}

struct Snapshot<V, const WIDTH: usize> {
    entries: Vec<Entry>,
    next: *mut LeafNode<V, WIDTH>,
}

enum LeafState<V, const WIDTH: usize> {
    Live(Snapshot<V, WIDTH>),
    Deleted,

    /// Root of a collapsed layer; the layer is gone.
    DeletedLayer,
}

fn snapshot<V, const WIDTH: usize>(leaf: &LeafNode<V, WIDTH>, ti: &ThreadInfo<'_>) -> LeafState<V, WIDTH> {
    let mut entries: Vec<Entry> = Vec::with_capacity(WIDTH);

    loop {
        let version: u32 = leaf.version().stable();
        if crate::nodeversion::version_deleted(version) {
            return if leaf.is_deleted_layer() {
                LeafState::DeletedLayer
            } else {
                LeafState::Deleted
            };
        }

        entries.clear();
        for slot in leaf.permutation().slots() {
            let keylenx: u8 = leaf.keylenx(slot);
            let lv: *mut u8 = leaf.lv(slot);
            let suffix: Vec<u8> = if keylenx_has_ksuf(keylenx) {
                // SAFETY: epoch-protected; discarded unless validated.
                unsafe { leaf.ksuf_bytes(slot) }.map(<[u8]>::to_vec).unwrap_or_default()
            } else {
                Vec::new()
            };
            entries.push(Entry {
                ikey: leaf.ikey(slot),
                keylenx,
                lv,
                suffix,
            });
        }
        let next: *mut LeafNode<V, WIDTH> = leaf.next();

        if !leaf.version().has_changed(version) {
            return LeafState::Live(Snapshot { entries, next });
        }
        ti.mark(Counter::LeafRetry);
    }
}

// ============================================================================
//  Bound
// ============================================================================

struct ScanBound {
    key: Vec<u8>,
    inclusive: bool,
}

impl ScanBound {
    /// `key` lies on the unvisited side of the bound.
    fn admits(&self, key: &[u8], ascending: bool) -> bool {
        let order: std::cmp::Ordering = key.cmp(&self.key);
        if self.inclusive && order.is_eq() {
            return true;
        }
        if ascending { order.is_gt() } else { order.is_lt() }
    }

    /// Some key of the layer under `prefix` (all strictly longer than
    /// `prefix`) may lie on the unvisited side.
    fn admits_layer(&self, prefix: &[u8], ascending: bool) -> bool {
        if ascending {
            prefix >= self.key.as_slice() || self.key.starts_with(prefix)
        } else {
            prefix < self.key.as_slice()
        }
    }

    /// ikey to route by within the layer under `prefix`.
    fn route_ikey(&self, prefix: &[u8], ascending: bool) -> u64 {
        if self.key.starts_with(prefix) {
            Key::read_ikey(&self.key, prefix.len())
        } else if ascending {
            0
        } else {
            u64::MAX
        }
    }

    fn advance(&mut self, emitted: Vec<u8>) {
        self.key = emitted;
        self.inclusive = false;
    }
}

// ============================================================================
//  Walk
// ============================================================================

type Visit<'f, V> = dyn FnMut(&[u8], &Arc<V>) -> bool + 'f;

impl<V, const WIDTH: usize> Table<V, WIDTH> {
    pub(super) fn scan_from(&self, start: &[u8], ascending: bool, ti: &ThreadInfo<'_>, visit: &mut Visit<'_, V>) {
        let mut bound = ScanBound {
            key: start.to_vec(),
            inclusive: true,
        };
        let mut prefix: Vec<u8> = Vec::new();
        let _ = self.scan_layer(self.root_ptr(), &mut prefix, &mut bound, ascending, ti, visit);
    }

    /// Leaf to start from: the one owning `ikey`, moved right past any
    /// split that happened since routing.
    fn scan_start_leaf(&self, layer_root: *mut u8, ikey: u64, ti: &ThreadInfo<'_>) -> *mut LeafNode<V, WIDTH> {
        let (leaf, version) = self.reach_leaf(layer_root, ikey, ti);
        Self::forward_at_leaf(leaf, version, ikey, ti).0
    }

    fn scan_layer(
        &self,
        layer_root: *mut u8,
        prefix: &mut Vec<u8>,
        bound: &mut ScanBound,
        ascending: bool,
        ti: &ThreadInfo<'_>,
        visit: &mut Visit<'_, V>,
    ) -> ControlFlow<()> {
        let mut leaf: *mut LeafNode<V, WIDTH> = self.scan_start_leaf(layer_root, bound.route_ikey(prefix, ascending), ti);
        // Descending: the leaf we came from, which a trusted predecessor
        // must still point to.
        let mut came_from: *mut LeafNode<V, WIDTH> = StdPtr::null_mut();

        loop {
            // SAFETY: reached under the caller's guard.
            let node: &LeafNode<V, WIDTH> = unsafe { &*leaf };

            let snap: Snapshot<V, WIDTH> = match snapshot(node, ti) {
                LeafState::Live(snap) if came_from.is_null() || snap.next == came_from => snap,
                LeafState::DeletedLayer => return ControlFlow::Continue(()),
                LeafState::Live(_) | LeafState::Deleted => {
                    ti.mark(Counter::LayerRetry);
                    // Re-route just left of the leaf we came from, or at the
                    // bound if we have no such leaf.
                    let route: u64 = if came_from.is_null() {
                        bound.route_ikey(prefix, ascending)
                    } else {
                        // SAFETY: reached under the caller's guard.
                        unsafe { (*came_from).ikey_bound() }.saturating_sub(1)
                    };
                    leaf = self.scan_start_leaf(layer_root, route, ti);
                    came_from = StdPtr::null_mut();
                    continue;
                }
            };

            if ascending {
                for entry in &snap.entries {
                    self.scan_entry(entry, prefix, bound, ascending, ti, visit)?;
                }
                if snap.next.is_null() {
                    return ControlFlow::Continue(());
                }
                leaf = snap.next;
            } else {
                for entry in snap.entries.iter().rev() {
                    self.scan_entry(entry, prefix, bound, ascending, ti, visit)?;
                }
                let prev: *mut LeafNode<V, WIDTH> = node.prev();
                if prev.is_null() {
                    return ControlFlow::Continue(());
                }
                came_from = leaf;
                leaf = prev;
            }
        }
    }

    fn scan_entry(
        &self,
        entry: &Entry,
        prefix: &mut Vec<u8>,
        bound: &mut ScanBound,
        ascending: bool,
        ti: &ThreadInfo<'_>,
        visit: &mut Visit<'_, V>,
    ) -> ControlFlow<()> {
        if keylenx_is_layer(entry.keylenx) {
            let depth: usize = prefix.len();
            prefix.extend_from_slice(&entry.ikey.to_be_bytes());
            let flow: ControlFlow<()> = if bound.admits_layer(prefix, ascending) {
                ti.mark(Counter::LayerDescend);
                self.scan_layer(entry.lv, prefix, bound, ascending, ti, visit)
            } else {
                ControlFlow::Continue(())
            };
            prefix.truncate(depth);
            return flow;
        }

        let key: Vec<u8> = entry.full_key(prefix);
        if !bound.admits(&key, ascending) {
            return ControlFlow::Continue(());
        }

        // SAFETY: from a validated snapshot, under the caller's guard.
        let Some(value) = (unsafe { LeafValue::<V>::decode(entry.keylenx, entry.lv).clone_arc() }) else {
            return ControlFlow::Continue(());
        };

        let keep_going: bool = visit(&key, &value);
        bound.advance(key);
        if keep_going { ControlFlow::Continue(()) } else { ControlFlow::Break(()) }
    }
}
