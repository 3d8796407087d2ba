//! Slot payloads and the `keylenx` encoding.
//!
//! Each leaf slot stores a raw pointer `lv` next to a one-byte `keylenx`.
//! `keylenx` alone decides what `lv` is:
//!
//! | `keylenx`                 | meaning                                   | `lv`                  |
//! |---------------------------|-------------------------------------------|-----------------------|
//! | `0..=8`                   | key ends in this chunk, that many bytes   | `Arc<V>` raw pointer  |
//! | [`KSUF_KEYLENX`]          | key continues, rest in the slot's suffix  | `Arc<V>` raw pointer  |
//! | [`LAYER_KEYLENX`]         | key continues in a next-layer tree        | next-layer root node  |
//! | [`UNSTABLE_LAYER_KEYLENX`]| a layer is being installed; retry         | in flux               |
//!
//! Turning a value slot into a layer slot is bracketed: `keylenx` first goes
//! to the unstable marker, then `lv` is replaced, then `keylenx` becomes
//! [`LAYER_KEYLENX`]. The leaf's insert bit is held across all three stores.

use std::sync::Arc;

use crate::key::{Key, LONG_RANK};

/// Slot key continues in a [`KeySuffix`](crate::suffix::KeySuffix).
pub const KSUF_KEYLENX: u8 = 64;

/// Slot holds a stable next-layer root.
pub const LAYER_KEYLENX: u8 = 128;

/// Slot is mid-transition from value to layer.
pub const UNSTABLE_LAYER_KEYLENX: u8 = LAYER_KEYLENX | 64;

/// `lv` is a layer pointer (stable or not).
#[inline(always)]
#[must_use]
pub const fn keylenx_is_layer(keylenx: u8) -> bool {
    keylenx >= LAYER_KEYLENX
}

/// `lv` is a fully published layer pointer.
#[inline(always)]
#[must_use]
pub const fn keylenx_is_stable_layer(keylenx: u8) -> bool {
    keylenx == LAYER_KEYLENX
}

/// Slot key carries an out-of-line suffix.
#[inline(always)]
#[must_use]
pub const fn keylenx_has_ksuf(keylenx: u8) -> bool {
    keylenx == KSUF_KEYLENX
}

/// Ordering rank of a slot, comparable with [`Key::rank`].
#[inline(always)]
#[must_use]
pub const fn keylenx_rank(keylenx: u8) -> u8 {
    if keylenx <= 8 { keylenx } else { LONG_RANK }
}

/// `keylenx` for a value slot holding `key` at its current layer.
#[inline]
#[must_use]
pub const fn keylenx_for(key: &Key<'_>) -> u8 {
    if key.has_suffix() {
        KSUF_KEYLENX
    } else {
        key.rank()
    }
}

// ============================================================================
//  LeafValue
// ============================================================================

/// Decoded slot payload.
///
/// Built from a `(keylenx, lv)` snapshot; only meaningful if the leaf version
/// validated after both were read.
pub enum LeafValue<V> {
    /// Raw pointer from `Arc::into_raw`.
    Value(*const V),

    /// Root (possibly stale, see `maybe_parent`) of the next layer.
    NextLayer(*mut u8),
}

impl<V> Clone for LeafValue<V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for LeafValue<V> {}

impl<V> std::fmt::Debug for LeafValue<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(ptr) => write!(f, "Value({ptr:?})"),
            Self::NextLayer(ptr) => write!(f, "NextLayer({ptr:?})"),
        }
    }
}

impl<V> LeafValue<V> {
    /// Interpret `lv` according to `keylenx`.
    #[inline(always)]
    #[must_use]
    pub const fn decode(keylenx: u8, lv: *mut u8) -> Self {
        if keylenx_is_layer(keylenx) {
            Self::NextLayer(lv)
        } else {
            Self::Value(lv.cast_const().cast::<V>())
        }
    }

    /// Leak `value` into the raw form stored in `lv`.
    #[inline]
    #[must_use]
    pub fn encode(value: Arc<V>) -> *mut u8 {
        Arc::into_raw(value).cast_mut().cast::<u8>()
    }

    /// Next-layer root, if this is a layer slot.
    #[inline(always)]
    #[must_use]
    pub const fn layer(self) -> Option<*mut u8> {
        match self {
            Self::NextLayer(ptr) => Some(ptr),
            Self::Value(_) => None,
        }
    }

    /// Take a new strong reference to the value.
    ///
    /// # Safety
    /// The pointer came from [`encode`](Self::encode) and its `Arc` has not
    /// been reclaimed: either the leaf lock is held, or the caller is inside
    /// an epoch guard and validated the leaf version after reading `lv`.
    #[inline]
    #[must_use]
    pub unsafe fn clone_arc(self) -> Option<Arc<V>> {
        match self {
            Self::Value(ptr) if !ptr.is_null() => {
                // SAFETY: the tree still owns one count, freed no earlier
                // than the end of the caller's epoch.
                unsafe {
                    Arc::increment_strong_count(ptr);
                    Some(Arc::from_raw(ptr))
                }
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keylenx_classes() {
        assert!(!keylenx_is_layer(8));
        assert!(!keylenx_is_layer(KSUF_KEYLENX));
        assert!(keylenx_is_layer(LAYER_KEYLENX));
        assert!(keylenx_is_layer(UNSTABLE_LAYER_KEYLENX));
        assert!(keylenx_is_stable_layer(LAYER_KEYLENX));
        assert!(!keylenx_is_stable_layer(UNSTABLE_LAYER_KEYLENX));
        assert!(keylenx_has_ksuf(KSUF_KEYLENX));
    }

    #[test]
    fn test_rank_agrees_with_key() {
        let short = Key::new(b"abc");
        let long = Key::new(b"abcdefghij");
        assert_eq!(keylenx_rank(keylenx_for(&short)), short.rank());
        assert_eq!(keylenx_rank(keylenx_for(&long)), long.rank());
        assert_eq!(keylenx_rank(LAYER_KEYLENX), LONG_RANK);
    }

    #[test]
    fn test_encode_decode_value() {
        let raw: *mut u8 = LeafValue::encode(Arc::new(41u64));
        let decoded: LeafValue<u64> = LeafValue::decode(3, raw);
        assert!(decoded.layer().is_none());

        // SAFETY: raw is live; we hold the original count.
        let cloned: Arc<u64> = unsafe { decoded.clone_arc() }.expect("value slot");
        assert_eq!(*cloned, 41);
        assert_eq!(Arc::strong_count(&cloned), 2);

        // SAFETY: release the count leaked by encode.
        drop(unsafe { Arc::from_raw(raw.cast_const().cast::<u64>()) });
        assert_eq!(Arc::strong_count(&cloned), 1);
    }

    #[test]
    fn test_decode_layer() {
        let mut dummy: u8 = 0;
        let ptr: *mut u8 = &raw mut dummy;
        let decoded: LeafValue<u64> = LeafValue::decode(LAYER_KEYLENX, ptr);
        assert_eq!(decoded.layer(), Some(ptr));
        // SAFETY: layer slots never yield a value.
        assert!(unsafe { decoded.clone_arc() }.is_none());
    }
}
