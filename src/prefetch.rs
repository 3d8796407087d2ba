//! Software prefetch hint.
//!
//! Used right after a traversal learns the next pointer it will follow
//! (a child node or a value), so the fetch overlaps the version check that
//! has to happen first anyway.

/// Ask the CPU to pull the cache line at `ptr` into all cache levels.
///
/// A hint only: null or dangling pointers are fine, nothing is loaded
/// architecturally. No-op on targets without a stable prefetch intrinsic.
#[inline(always)]
pub fn prefetch_read<T>(ptr: *const T) {
    if ptr.is_null() {
        return;
    }

    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: prefetch never faults, whatever the address.
        unsafe {
            std::arch::x86_64::_mm_prefetch(ptr.cast::<i8>(), std::arch::x86_64::_MM_HINT_T0);
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = ptr;
    }
}
