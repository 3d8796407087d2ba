//! # `masstable`
//!
//! A concurrent, ordered, in-memory index from byte-string keys to shared
//! values, built as a trie of B+trees.
//!
//! - Keys are arbitrary byte strings, including the empty string and keys
//!   that differ only by trailing zero bytes.
//! - Each trie layer is a B+tree over one 8-byte chunk of the key, compared
//!   as a big-endian integer. Keys that share a chunk and continue past it
//!   move into a next-layer tree for the following chunk.
//! - Lookups are lock-free: they validate per-node version words and retry
//!   instead of locking. Writers lock single nodes.
//! - Unlinked nodes, replaced values and key suffixes are reclaimed through
//!   an epoch collector ([`seize`]), never while a reader might hold them.
//!
//! ## Usage
//!
//! ```rust
//! use masstable::Table;
//!
//! let table: Table<&'static str> = Table::new();
//! table.insert(b"apple", "red");
//! table.insert(b"banana", "yellow");
//! table.insert(b"blueberry, very ripe", "blue");
//!
//! assert_eq!(table.get(b"apple").as_deref(), Some(&"red"));
//!
//! let from_b: Vec<Vec<u8>> = table.scan(b"b", 10, true).map(|(k, _)| k).collect();
//! assert_eq!(from_b, vec![b"banana".to_vec(), b"blueberry, very ripe".to_vec()]);
//! ```
//!
//! ## Thread safety
//!
//! `Table<V>` is `Send + Sync` when `V: Send + Sync`. The plain methods
//! (`get`, `insert`, `remove`, `scan`) create a short-lived [`ThreadInfo`]
//! per call; batches should take one with [`Table::threadinfo`] and use the
//! `*_with` methods.
//!
//! ## Features
//!
//! - `tracing`: structured events for splits, layer creation, unlinks and
//!   layer collapse through the [`tracing`](https://docs.rs/tracing) crate.
//!   Without it the logging macros compile to nothing.

#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
// Hot accessors are benchmarked with #[inline(always)].
#![allow(clippy::inline_always)]

pub mod config;
pub mod internode;
pub mod key;
pub mod ksearch;
pub mod leaf;
pub mod nodeversion;
pub mod ordering;
pub mod permuter;
pub mod suffix;
pub mod threadinfo;
pub mod tree;
pub mod value;

mod prefetch;
mod sync;
mod tracing_helpers;

pub use config::{ConfigError, TableConfig};
pub use threadinfo::{Counter, StatsSnapshot, ThreadInfo};
pub use tree::Table;
