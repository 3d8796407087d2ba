//! Named memory orderings for node field access.
//!
//! Node fields are individually atomic. What makes a multi-field read
//! consistent is the version check around it, so most field accesses only
//! need to pair a writer's release with a reader's acquire.

use std::sync::atomic::Ordering;

/// Optimistic field loads. Pairs with [`WRITE_ORD`].
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Field stores made while holding the node lock.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Loads and stores of fields only the lock holder can observe changing,
/// or of nodes not yet reachable by other threads.
pub const RELAXED: Ordering = Ordering::Relaxed;

/// Read-modify-write on shared counters that publish nothing.
pub const COUNTER_ORD: Ordering = Ordering::Relaxed;
