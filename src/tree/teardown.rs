//! Freeing a whole table.
//!
//! Runs from `Drop` with exclusive access, so no versions or locks are
//! consulted. Nodes still reachable from the layer-0 root are freed here;
//! nodes already unlinked were handed to the collector and are freed when
//! it drops.

use crate::internode::InternodeNode;
use crate::leaf::LeafNode;
use crate::value::keylenx_is_layer;

use super::{node_parent, node_version};

/// Walk up to the true root of the layer containing `node`.
///
/// # Safety
/// `node` and its ancestors are live.
unsafe fn layer_root<V, const WIDTH: usize>(node: *mut u8) -> *mut u8 {
    let mut node: *mut u8 = node;
    loop {
        // SAFETY: forwarded.
        let parent: *mut u8 = unsafe { node_parent::<V, WIDTH>(node) };
        if parent.is_null() {
            return node;
        }
        node = parent;
    }
}

/// Free every node, value and suffix reachable from `root`.
///
/// # Safety
/// Exclusive access; nothing reachable from `root` is used afterwards.
pub(super) unsafe fn free_tree<V, const WIDTH: usize>(root: *mut u8) {
    // SAFETY: forwarded.
    let mut stack: Vec<*mut u8> = vec![unsafe { layer_root::<V, WIDTH>(root) }];

    while let Some(node) = stack.pop() {
        // SAFETY: each node is pushed exactly once: layer roots from their
        // single slot, everything else from its single parent.
        unsafe {
            if node_version(node).is_leaf() {
                let leaf: *mut LeafNode<V, WIDTH> = node.cast::<LeafNode<V, WIDTH>>();
                for slot in (*leaf).permutation().slots() {
                    if keylenx_is_layer((*leaf).keylenx(slot)) {
                        stack.push(layer_root::<V, WIDTH>((*leaf).lv(slot)));
                    }
                }
                (*leaf).drop_contents();
                drop(Box::from_raw(leaf));
            } else {
                let inode: *mut InternodeNode<WIDTH> = node.cast::<InternodeNode<WIDTH>>();
                stack.extend((*inode).children().filter(|child| !child.is_null()));
                drop(Box::from_raw(inode));
            }
        }
    }
}
