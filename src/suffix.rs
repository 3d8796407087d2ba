//! Filepath: src/suffix.rs
//!
//! Out-of-line storage for key bytes past a slot's 8-byte ikey.
//!
//! A [`KeySuffix`] is written once, before the slot that points to it is
//! published through the permutation, and never mutated afterwards. Readers
//! may therefore compare against it without the leaf lock; the leaf version
//! check tells them whether the slot still belonged to the same key. When a
//! slot's key goes away its suffix is retired through the epoch collector,
//! never freed in place.

use std::cmp::Ordering;

/// Immutable suffix bytes for one leaf slot.
#[derive(Debug, PartialEq, Eq)]
pub struct KeySuffix {
    bytes: Box<[u8]>,
}

impl KeySuffix {
    /// Heap-allocate a suffix and hand back the raw pointer stored in the leaf.
    #[must_use]
    pub fn into_raw(bytes: &[u8]) -> *mut Self {
        Box::into_raw(Box::new(Self {
            bytes: bytes.into(),
        }))
    }

    /// The suffix bytes.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Suffix length.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for a zero-length suffix. Only layer-creation leftovers are empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Byte equality with a key's suffix.
    #[inline]
    #[must_use]
    pub fn matches(&self, other: &[u8]) -> bool {
        *self.bytes == *other
    }

    /// Lexicographic comparison with a key's suffix.
    #[inline]
    #[must_use]
    pub fn compare(&self, other: &[u8]) -> Ordering {
        (*self.bytes).cmp(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_through_raw() {
        let raw: *mut KeySuffix = KeySuffix::into_raw(b"tail");
        // SAFETY: fresh from into_raw, reclaimed once here.
        let suffix: Box<KeySuffix> = unsafe { Box::from_raw(raw) };

        assert_eq!(suffix.as_bytes(), b"tail");
        assert_eq!(suffix.len(), 4);
        assert!(suffix.matches(b"tail"));
        assert!(!suffix.matches(b"tails"));
    }

    #[test]
    fn test_compare_is_lexicographic() {
        let raw: *mut KeySuffix = KeySuffix::into_raw(b"bb");
        // SAFETY: fresh from into_raw, reclaimed once here.
        let suffix: Box<KeySuffix> = unsafe { Box::from_raw(raw) };

        assert_eq!(suffix.compare(b"ba"), Ordering::Greater);
        assert_eq!(suffix.compare(b"bbb"), Ordering::Less);
        assert_eq!(suffix.compare(b"bb"), Ordering::Equal);
        assert!(!suffix.is_empty());
    }
}
