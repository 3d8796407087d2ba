//! Filepath: src/key.rs
//!
//! Key cursor for layered traversal.
//!
//! A key is consumed 8 bytes at a time. At each layer the current 8 bytes
//! form the big-endian `ikey`; whatever follows is the suffix. When traversal
//! finds a next-layer pointer for the current ikey it calls [`Key::shift`]
//! and continues with the next 8 bytes. [`Key::unshift_all`] rewinds to
//! layer 0 for a restart from the table root.

use std::cmp::Ordering;

/// Bytes per ikey.
pub const IKEY_SIZE: usize = 8;

/// Order rank of a key that continues past the current chunk.
///
/// Keys sharing an ikey order by how many of those 8 bytes they use
/// (0..=8); every longer key ranks after all of them.
pub const LONG_RANK: u8 = IKEY_SIZE as u8 + 1;

/// A borrowed key plus its traversal position.
///
/// ```rust
/// use masstable::key::Key;
///
/// let mut key = Key::new(b"hello world!");
/// assert_eq!(key.ikey(), u64::from_be_bytes(*b"hello wo"));
/// assert_eq!(key.suffix(), b"rld!");
///
/// key.shift();
/// assert_eq!(key.ikey(), u64::from_be_bytes(*b"rld!\0\0\0\0"));
/// assert!(!key.has_suffix());
///
/// key.unshift_all();
/// assert_eq!(key.shift_count(), 0);
/// ```
#[derive(Clone, Copy, Debug)]
pub struct Key<'a> {
    data: &'a [u8],
    ikey: u64,
    shift_count: usize,
}

impl<'a> Key<'a> {
    /// Cursor at layer 0 of `data`. Any length is accepted.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            ikey: Self::read_ikey(data, 0),
            shift_count: 0,
        }
    }

    /// The whole key.
    #[inline]
    #[must_use]
    pub const fn full(&self) -> &'a [u8] {
        self.data
    }

    /// Full key length.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.data.len()
    }

    /// Zero-length key.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current 8-byte chunk, zero padded, as a big-endian integer.
    #[inline]
    #[must_use]
    pub const fn ikey(&self) -> u64 {
        self.ikey
    }

    /// Layers descended so far.
    #[inline]
    #[must_use]
    pub const fn shift_count(&self) -> usize {
        self.shift_count
    }

    #[inline(always)]
    const fn offset(&self) -> usize {
        self.shift_count * IKEY_SIZE
    }

    /// Bytes from the start of the current chunk to the end of the key.
    #[inline]
    #[must_use]
    pub const fn current_len(&self) -> usize {
        self.data.len().saturating_sub(self.offset())
    }

    /// True if the key continues past the current chunk.
    #[inline]
    #[must_use]
    pub const fn has_suffix(&self) -> bool {
        self.current_len() > IKEY_SIZE
    }

    /// Bytes after the current chunk.
    #[inline]
    #[must_use]
    pub fn suffix(&self) -> &'a [u8] {
        self.data.get(self.offset() + IKEY_SIZE..).unwrap_or(&[])
    }

    /// Bytes consumed by earlier layers.
    #[inline]
    #[must_use]
    pub fn prefix(&self) -> &'a [u8] {
        &self.data[..self.offset().min(self.data.len())]
    }

    /// Ordering rank among keys with the same ikey; see [`LONG_RANK`].
    #[inline]
    #[must_use]
    pub const fn rank(&self) -> u8 {
        if self.has_suffix() {
            LONG_RANK
        } else {
            self.current_len() as u8
        }
    }

    /// Compare against a slot holding `(ikey, rank)`.
    #[inline]
    #[must_use]
    pub fn compare(&self, ikey: u64, rank: u8) -> Ordering {
        self.ikey.cmp(&ikey).then(self.rank().cmp(&rank))
    }

    /// Descend one layer.
    #[inline]
    pub fn shift(&mut self) {
        debug_assert!(self.has_suffix(), "shift past the end of the key");
        self.shift_count += 1;
        self.ikey = Self::read_ikey(self.data, self.offset());
    }

    /// Back to layer 0.
    #[inline]
    pub fn unshift_all(&mut self) {
        self.shift_count = 0;
        self.ikey = Self::read_ikey(self.data, 0);
    }

    /// Big-endian ikey of `data[offset..offset + 8]`, zero padded; 0 past the end.
    #[must_use]
    pub fn read_ikey(data: &[u8], offset: usize) -> u64 {
        let remaining: &[u8] = data.get(offset..).unwrap_or(&[]);
        let mut bytes = [0u8; IKEY_SIZE];
        let n: usize = remaining.len().min(IKEY_SIZE);
        bytes[..n].copy_from_slice(&remaining[..n]);
        u64::from_be_bytes(bytes)
    }
}

/// The first `len` bytes of `ikey` (`len <= 8`).
#[must_use]
pub fn ikey_bytes(ikey: u64, len: usize) -> Vec<u8> {
    ikey.to_be_bytes()[..len.min(IKEY_SIZE)].to_vec()
}
