//! Next-layer creation.
//!
//! When a new key shares its 8-byte chunk with a stored suffixed key, the
//! stored slot becomes a layer slot pointing to a fresh tree holding both
//! keys one chunk further along. If the keys also agree on the following
//! chunks, single-entry "twig" layers bridge the common run.
//!
//! ```text
//! before:  [ "abcdefgh" ksuf="12345678X" -> v1 ]
//! insert:  "abcdefgh12345678Y" -> v2
//! after:   [ "abcdefgh" LAYER ] -> twig [ "12345678" LAYER ] -> [ "X" -> v1, "Y" -> v2 ]
//! ```
//!
//! The new layers are built privately and published with three stores
//! under the leaf's insert bit: `keylenx = UNSTABLE`, `lv = head`,
//! `keylenx = LAYER`.

use std::ptr as StdPtr;
use std::sync::Arc;

use crate::key::Key;
use crate::leaf::LeafNode;
use crate::nodeversion::LockGuard;
use crate::permuter::Permuter;
use crate::suffix::KeySuffix;
use crate::threadinfo::{Counter, ThreadInfo, reclaim_boxed};
use crate::tracing_helpers::debug_log;
use crate::value::{LAYER_KEYLENX, LeafValue, UNSTABLE_LAYER_KEYLENX};

use super::Table;

impl<V, const WIDTH: usize> Table<V, WIDTH> {
    /// Turn the suffixed value `slot` of the locked `leaf` into a layer
    /// holding both its key and `key`.
    pub(super) fn make_new_layer<'a>(
        &self,
        leaf: &'a LeafNode<V, WIDTH>,
        mut guard: LockGuard<'a>,
        slot: usize,
        key: &Key<'_>,
        value: Arc<V>,
        ti: &ThreadInfo<'_>,
    ) {
        // SAFETY: lock held; the suffix is retired only at the end.
        let old_suffix: &[u8] = unsafe { leaf.ksuf_bytes(slot) }.unwrap_or(&[]);
        let old_lv: *mut u8 = leaf.lv(slot);

        // Both cursors start at the chunk after the shared one.
        let mut old_key: Key<'_> = Key::new(old_suffix);
        let mut new_key: Key<'_> = Key::new(key.suffix());

        let mut twigs: Vec<u64> = Vec::new();
        while old_key.ikey() == new_key.ikey() && old_key.has_suffix() && new_key.has_suffix() {
            twigs.push(old_key.ikey());
            old_key.shift();
            new_key.shift();
        }

        let bottom: Box<LeafNode<V, WIDTH>> = LeafNode::new_root();
        let new_lv: *mut u8 = LeafValue::encode(value);
        if old_key.compare(new_key.ikey(), new_key.rank()).is_lt() {
            bottom.assign(0, &old_key, old_lv);
            bottom.assign(1, &new_key, new_lv);
        } else {
            bottom.assign(0, &new_key, new_lv);
            bottom.assign(1, &old_key, old_lv);
        }
        bottom.set_permutation(Permuter::make_sorted(2));
        bottom.debug_assert_sorted();

        let mut head: *mut u8 = Box::into_raw(bottom).cast::<u8>();
        for &ikey in twigs.iter().rev() {
            let twig: Box<LeafNode<V, WIDTH>> = LeafNode::new_root();
            twig.assign_raw(0, ikey, LAYER_KEYLENX, StdPtr::null_mut(), head);
            twig.set_permutation(Permuter::make_sorted(1));
            head = Box::into_raw(twig).cast::<u8>();
        }

        guard.mark_insert();
        leaf.set_keylenx(slot, UNSTABLE_LAYER_KEYLENX);
        leaf.set_lv(slot, head);
        leaf.set_keylenx(slot, LAYER_KEYLENX);

        let ksuf: *mut KeySuffix = leaf.take_ksuf(slot);
        drop(guard);

        if !ksuf.is_null() {
            // SAFETY: detached from the slot above; readers may still hold it.
            unsafe { ti.defer_free(ksuf, reclaim_boxed::<KeySuffix>) };
        }

        ti.mark(Counter::LayerCreate);
        debug_log!(depth = key.shift_count() + 1, twigs = twigs.len(), "layer created");
    }
}
