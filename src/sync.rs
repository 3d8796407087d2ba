//! Atomic primitives used by [`crate::nodeversion`].
//!
//! Under `cfg(loom)` these resolve to loom's model-checked types so the
//! version protocol can be explored exhaustively. Everything else in the
//! crate uses `std` atomics directly.

#[cfg(loom)]
pub(crate) use loom::hint::spin_loop;
#[cfg(loom)]
pub(crate) use loom::sync::atomic::{AtomicU32, Ordering, fence};
#[cfg(loom)]
pub(crate) use loom::thread::yield_now;

#[cfg(not(loom))]
pub(crate) use std::hint::spin_loop;
#[cfg(not(loom))]
pub(crate) use std::sync::atomic::{AtomicU32, Ordering, fence};
#[cfg(not(loom))]
pub(crate) use std::thread::yield_now;
