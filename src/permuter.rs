//! Filepath: src/permuter.rs
//!
//! Logical-to-physical slot map for a leaf.
//!
//! A [`Permuter`] packs a permutation of `WIDTH` slot indices plus a size into
//! one `u64`: 4 bits of size in the low nibble, then one nibble per logical
//! position. Positions `0..size()` are the live entries in key order;
//! positions `size()..WIDTH` are free slots, and the next slot to hand out
//! sits at the back (position `WIDTH - 1`).
//!
//! Because the whole permutation is one word, a writer publishes an insert
//! or removal with a single atomic store, and a reader always sees a complete
//! permutation.

/// Largest width a `u64` can encode: 15 nibbles + 1 size nibble.
pub const MAX_WIDTH: usize = 15;

const SIZE_MASK: u64 = 0xF;

/// Packed slot permutation of width `WIDTH`.
///
/// # Invariants
/// - `size() <= WIDTH`
/// - every slot index `0..WIDTH` appears at exactly one position
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Permuter<const WIDTH: usize = 15> {
    value: u64,
}

impl<const WIDTH: usize> Permuter<WIDTH> {
    const WIDTH_CHECK: () = {
        assert!(WIDTH > 0, "Permuter WIDTH must be at least 1");
        assert!(WIDTH <= MAX_WIDTH, "Permuter WIDTH must be at most 15");
    };

    /// Free positions hold slots in reverse, so position `WIDTH - 1` (the
    /// back) holds slot 0 and slots are handed out 0, 1, 2, ...
    const EMPTY_VALUE: u64 = {
        let mut value: u64 = 0;
        let mut pos: usize = 0;
        while pos < WIDTH {
            value |= ((WIDTH - 1 - pos) as u64) << ((pos + 1) * 4);
            pos += 1;
        }
        value
    };

    /// No live entries.
    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        let _: () = Self::WIDTH_CHECK;
        Self {
            value: Self::EMPTY_VALUE,
        }
    }

    /// `n` live entries where position `i` maps to slot `i`.
    ///
    /// Used for nodes built off-line, whose slots are filled in key order.
    #[must_use]
    pub fn make_sorted(n: usize) -> Self {
        debug_assert!(n <= WIDTH, "make_sorted: {n} > {WIDTH}");

        let mut value: u64 = n as u64;
        for pos in 0..n {
            value |= (pos as u64) << ((pos + 1) * 4);
        }
        // Remaining slots n..WIDTH, reversed so the back is slot n.
        for pos in n..WIDTH {
            value |= ((WIDTH - 1 - (pos - n)) as u64) << ((pos + 1) * 4);
        }

        let perm = Self { value };
        perm.debug_assert_valid();
        perm
    }

    /// Number of live entries.
    #[inline(always)]
    #[must_use]
    pub const fn size(&self) -> usize {
        (self.value & SIZE_MASK) as usize
    }

    /// Slot at logical position `i`.
    #[inline(always)]
    #[must_use]
    pub const fn get(&self, i: usize) -> usize {
        debug_assert!(i < WIDTH, "get: position out of bounds");
        ((self.value >> ((i + 1) * 4)) & 0xF) as usize
    }

    /// Next slot [`insert_from_back`](Self::insert_from_back) will hand out.
    #[inline(always)]
    #[must_use]
    pub const fn back(&self) -> usize {
        self.get(WIDTH - 1)
    }

    /// Raw encoding, for atomic storage.
    #[inline(always)]
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.value
    }

    /// Rebuild from a raw encoding loaded from atomic storage.
    #[inline(always)]
    #[must_use]
    pub const fn from_value(value: u64) -> Self {
        Self { value }
    }

    /// Truncate (or extend) the live prefix without touching positions.
    #[inline(always)]
    pub fn set_size(&mut self, n: usize) {
        debug_assert!(n <= WIDTH, "set_size: {n} > {WIDTH}");
        self.value = (self.value & !SIZE_MASK) | (n as u64);
    }

    /// Take the back slot and insert it at logical position `i`, shifting
    /// positions `i..` up by one. Returns the slot.
    #[must_use]
    pub fn insert_from_back(&mut self, i: usize) -> usize {
        debug_assert!(i <= self.size(), "insert_from_back: {i} > size");
        debug_assert!(self.size() < WIDTH, "insert_from_back: permuter full");

        let slot: usize = self.back();
        let i_shift: usize = (i + 1) * 4;
        let low_mask: u64 = (1u64 << i_shift) - 1;

        // size + 1 and positions below i | new slot at i | old positions i.. shifted up
        self.value = ((self.value + 1) & low_mask)
            | ((slot as u64) << i_shift)
            | ((self.value << 4) & !(low_mask | (0xF << i_shift)));

        self.debug_assert_valid();
        slot
    }

    /// Drop logical position `i`; its slot becomes the first free position
    /// (`size()` after the call), so it is the last to be handed out again.
    pub fn remove(&mut self, i: usize) {
        let size: usize = self.size();
        debug_assert!(i < size, "remove: {i} >= size {size}");

        if size == i + 1 {
            self.value -= 1;
            return;
        }

        // Rotate positions i..size down by one, carrying position i to size - 1.
        let rot_amount: usize = (size - i - 1) * 4;
        let rot_mask: u64 = (((1u64 << rot_amount) << 4) - 1) << ((i + 1) * 4);

        self.value = ((self.value - 1) & !rot_mask)
            | (((self.value & rot_mask) >> 4) & rot_mask)
            | (((self.value & rot_mask) << rot_amount) & rot_mask);

        self.debug_assert_valid();
    }

    /// Live slots in logical order.
    pub fn slots(&self) -> impl DoubleEndedIterator<Item = usize> + ExactSizeIterator + '_ {
        (0..self.size()).map(|i| self.get(i))
    }

    /// Check the bijection. Compiled out of release builds.
    #[inline]
    pub fn debug_assert_valid(&self) {
        #[cfg(debug_assertions)]
        {
            let size: usize = self.size();
            assert!(size <= WIDTH, "invalid size: {size} > {WIDTH}");

            let mut seen: u16 = 0;
            for pos in 0..WIDTH {
                let slot: usize = self.get(pos);
                assert!(slot < WIDTH, "invalid slot index {slot} at {pos}");
                let bit: u16 = 1 << slot;
                assert!(seen & bit == 0, "duplicate slot index {slot}");
                seen |= bit;
            }
        }
    }
}

impl<const WIDTH: usize> Default for Permuter<WIDTH> {
    fn default() -> Self {
        Self::empty()
    }
}
