//! Lock-free lookups.
//!
//! # Protocol
//!
//! ```text
//! 1. reach_leaf: climb from the (possibly stale) layer root, then descend
//!    through internodes, validating each parent after reading the child
//! 2. stable() -> read permutation, keylenx, lv, suffix -> has_changed()
//! 3. on change: forward along `next` while the ikey lies past the sibling's
//!    bound, then retry the same leaf
//! 4. clone the value Arc only after validation
//! ```
//!
//! Nothing here writes shared memory. Every raw pointer followed was loaded
//! under the caller's epoch guard.

use std::sync::Arc;

use crate::internode::InternodeNode;
use crate::key::Key;
use crate::ksearch::{lower_bound_leaf, upper_bound_internode};
use crate::leaf::LeafNode;
use crate::nodeversion::{ROOT_BIT, simple_has_split, version_deleted, version_is_leaf};
use crate::permuter::Permuter;
use crate::prefetch::prefetch_read;
use crate::threadinfo::{Counter, ThreadInfo};
use crate::tracing_helpers::trace_log;
use crate::value::{LeafValue, keylenx_has_ksuf, keylenx_is_layer, keylenx_is_stable_layer};

use super::{Table, node_parent, node_version};

/// What a validated leaf probe found.
enum Probe<V> {
    Found(LeafValue<V>),
    Layer(*mut u8),
    NotFound,

    /// Layer slot still being published.
    Unstable,
}

impl<V, const WIDTH: usize> Table<V, WIDTH> {
    /// Descend from `layer_root` to the leaf whose range should hold `ikey`.
    ///
    /// Returns the leaf and a stable version of it. The leaf may since have
    /// split or been deleted; callers validate and use
    /// [`forward_at_leaf`](Self::forward_at_leaf).
    pub(super) fn reach_leaf(&self, layer_root: *mut u8, ikey: u64, ti: &ThreadInfo<'_>) -> (*mut LeafNode<V, WIDTH>, u32) {
        'retry: loop {
            let mut node: *mut u8 = layer_root;
            // SAFETY: layer roots are retired only after unlinking, and the
            // caller's guard predates that.
            let mut version: u32 = unsafe { node_version(node) }.stable();

            // A root that split has lost its root bit and gained a parent.
            while version & ROOT_BIT == 0 {
                // SAFETY: as above.
                let parent: *mut u8 = unsafe { node_parent::<V, WIDTH>(node) };
                if parent.is_null() {
                    break;
                }
                node = parent;
                // SAFETY: parents are never freed while the table lives.
                version = unsafe { node_version(node) }.stable();
            }

            while !version_is_leaf(version) {
                // SAFETY: the version says internode.
                let inode: &InternodeNode<WIDTH> = unsafe { &*node.cast::<InternodeNode<WIDTH>>() };
                let child: *mut u8 = inode.child(upper_bound_internode(inode, ikey));

                if child.is_null() {
                    ti.mark(Counter::LayerRetry);
                    continue 'retry;
                }
                prefetch_read(child);
                // SAFETY: child of a node reached under the guard.
                let child_version: u32 = unsafe { node_version(child) }.stable();

                if !inode.version().has_changed(version) {
                    debug_assert_eq!(inode.children_are_leaves(), version_is_leaf(child_version));
                    node = child;
                    version = child_version;
                    continue;
                }

                let fresh: u32 = inode.version().stable();
                if simple_has_split(version, fresh) {
                    ti.mark(Counter::LayerRetry);
                    continue 'retry;
                }
                version = fresh;
            }

            return (node.cast::<LeafNode<V, WIDTH>>(), version);
        }
    }

    /// Move right from `leaf` while `ikey` belongs to a later sibling.
    ///
    /// `version` is a stable version of `leaf`; the returned pair is a leaf
    /// and its stable version. Deleted leaves are returned as-is.
    pub(super) fn forward_at_leaf(
        leaf: *mut LeafNode<V, WIDTH>,
        version: u32,
        ikey: u64,
        ti: &ThreadInfo<'_>,
    ) -> (*mut LeafNode<V, WIDTH>, u32) {
        let mut leaf: *mut LeafNode<V, WIDTH> = leaf;
        let mut version: u32 = version;

        while !version_deleted(version) {
            // SAFETY: reached under the caller's guard.
            let next: *mut LeafNode<V, WIDTH> = unsafe { (*leaf).next() };
            // SAFETY: `next` is retired only after being unlinked, which
            // happens-after we loaded it here.
            if next.is_null() || ikey < unsafe { (*next).ikey_bound() } {
                break;
            }

            ti.mark(Counter::LeafForward);
            leaf = next;
            // SAFETY: as above.
            version = unsafe { (*leaf).version() }.stable();
        }

        (leaf, version)
    }

    /// Probe one leaf for `key` at its current layer.
    fn probe_leaf(leaf: &LeafNode<V, WIDTH>, key: &Key<'_>) -> Probe<V> {
        let perm: Permuter<WIDTH> = leaf.permutation();
        let Some(slot) = lower_bound_leaf(leaf, perm, key).p else {
            return Probe::NotFound;
        };

        let keylenx: u8 = leaf.keylenx(slot);
        let lv: *mut u8 = leaf.lv(slot);

        if keylenx_is_stable_layer(keylenx) {
            Probe::Layer(lv)
        } else if keylenx_is_layer(keylenx) {
            Probe::Unstable
        } else if keylenx_has_ksuf(keylenx) {
            // SAFETY: suffixes outlive the caller's guard; the result is
            // discarded unless the version validates.
            if unsafe { leaf.ksuf_matches(slot, key.suffix()) } {
                prefetch_read(lv);
                Probe::Found(LeafValue::decode(keylenx, lv))
            } else {
                Probe::NotFound
            }
        } else {
            prefetch_read(lv);
            Probe::Found(LeafValue::decode(keylenx, lv))
        }
    }

    /// Lock-free `get`.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip_all))]
    pub(super) fn find_unlocked(&self, key: &mut Key<'_>, ti: &ThreadInfo<'_>) -> Option<Arc<V>> {
        let mut layer_root: *mut u8 = self.root_ptr();

        'layer: loop {
            let (mut leaf, mut version) = self.reach_leaf(layer_root, key.ikey(), ti);

            loop {
                // SAFETY: reached under the caller's guard.
                let node: &LeafNode<V, WIDTH> = unsafe { &*leaf };

                if version_deleted(version) {
                    if node.is_deleted_layer() {
                        ti.mark(Counter::RootRetry);
                        trace_log!(depth = key.shift_count(), "lookup hit collapsed layer, restarting from root");
                        key.unshift_all();
                        layer_root = self.root_ptr();
                    } else {
                        ti.mark(Counter::LayerRetry);
                    }
                    continue 'layer;
                }

                node.prefetch();
                let probe: Probe<V> = Self::probe_leaf(node, key);

                if node.version().has_changed(version) {
                    ti.mark(Counter::LeafRetry);
                    version = node.version().stable();
                    (leaf, version) = Self::forward_at_leaf(leaf, version, key.ikey(), ti);
                    continue;
                }

                match probe {
                    // SAFETY: validated above; the Arc is retired no earlier
                    // than the end of the caller's guard.
                    Probe::Found(value) => return unsafe { value.clone_arc() },
                    Probe::NotFound => return None,
                    Probe::Layer(next_root) => {
                        ti.mark(Counter::LayerDescend);
                        key.shift();
                        layer_root = next_root;
                        continue 'layer;
                    }
                    Probe::Unstable => {
                        ti.mark(Counter::LeafRetry);
                        version = node.version().stable();
                    }
                }
            }
        }
    }
}
