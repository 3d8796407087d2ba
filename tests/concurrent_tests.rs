//! Multi-threaded tests.
//!
//! ```bash
//! cargo test --test concurrent_tests --release
//! RUST_LOG=masstable=debug cargo test --features tracing --test concurrent_tests
//! ```

#![expect(clippy::unwrap_used, reason = "fail fast in tests")]

mod common;

use std::collections::BTreeSet;
use std::sync::Barrier;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use masstable::{Counter, Table};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

fn key8(i: usize) -> Vec<u8> {
    format!("{i:08}").into_bytes()
}

// ============================================================================
//  Insert / get
// ============================================================================

#[test]
fn concurrent_disjoint_inserts_all_visible() {
    common::init_tracing();
    let table: Table<usize> = Table::new();
    let threads: usize = 8;
    let per_thread: usize = 2_000;

    thread::scope(|s| {
        for t in 0..threads {
            let table = &table;
            s.spawn(move || {
                let ti = table.threadinfo();
                for i in 0..per_thread {
                    let n: usize = i * threads + t;
                    table.insert_with(&key8(n), n, &ti);
                    // Our own insert is visible immediately.
                    assert_eq!(table.get_with(&key8(n), &ti).as_deref(), Some(&n));
                }
            });
        }
    });

    assert_eq!(table.len(), threads * per_thread);
    for n in 0..threads * per_thread {
        assert_eq!(table.get(&key8(n)).as_deref(), Some(&n), "key {n}");
    }
    let scanned: Vec<Vec<u8>> = table.scan(b"", usize::MAX, true).map(|(k, _)| k).collect();
    assert_eq!(scanned, (0..threads * per_thread).map(key8).collect::<Vec<_>>());
}

#[test]
fn concurrent_same_keys_every_thread() {
    common::init_tracing();
    let table: Table<usize> = Table::new();
    let barrier = Barrier::new(8);
    // Values encode (writer, round, key) so any read can be traced to a write.
    let encode = |t: usize, round: usize, i: usize| (t * 2 + round) * 1_000 + i;

    thread::scope(|s| {
        for t in 0..8 {
            let table = &table;
            let barrier = &barrier;
            s.spawn(move || {
                let ti = table.threadinfo();
                barrier.wait();
                for i in 0..1_000 {
                    table.insert_with(&key8(i), encode(t, 0, i), &ti);
                    let got: usize = *table.get_with(&key8(i), &ti).unwrap();
                    assert_eq!(got % 1_000, i, "value written for another key");
                }
                barrier.wait();
                // Second round: each key has exactly one final writer.
                for i in (t..1_000).step_by(8) {
                    table.insert_with(&key8(i), encode(t, 1, i), &ti);
                }
            });
        }
    });

    assert_eq!(table.len(), 1_000);
    let scanned: Vec<(Vec<u8>, usize)> = table.scan(b"", usize::MAX, true).map(|(k, v)| (k, *v)).collect();
    let expected: Vec<(Vec<u8>, usize)> = (0..1_000).map(|i| (key8(i), encode(i % 8, 1, i))).collect();
    assert_eq!(scanned, expected);
}

#[test]
fn concurrent_long_keys_build_layers() {
    common::init_tracing();
    let table: Table<usize, 10> = Table::new();

    thread::scope(|s| {
        for t in 0..4 {
            let table = &table;
            s.spawn(move || {
                let ti = table.threadinfo();
                for i in 0..1_500 {
                    let key: Vec<u8> = format!("shared/prefix/{:02}/{i:06}", i % 3).into_bytes();
                    table.insert_with(&key, t, &ti);
                }
            });
        }
    });

    assert_eq!(table.len(), 1_500);
    assert!(table.stats().get(Counter::LayerCreate) > 0);
    for i in 0..1_500 {
        let key: Vec<u8> = format!("shared/prefix/{:02}/{i:06}", i % 3).into_bytes();
        assert!(table.get(&key).is_some(), "missing {}", String::from_utf8_lossy(&key));
    }
}

// ============================================================================
//  Readers during splits
// ============================================================================

#[test]
fn readers_never_lose_stable_keys_during_splits() {
    common::init_tracing();
    let table: Table<usize, 10> = Table::new();
    // Even keys exist before readers start and are never removed.
    for i in (0..4_000).step_by(2) {
        table.insert(&key8(i), i);
    }
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        for t in 0..2 {
            let table = &table;
            let done = &done;
            s.spawn(move || {
                let ti = table.threadinfo();
                for i in (1..4_000).step_by(2).skip(t).step_by(2) {
                    table.insert_with(&key8(i), i, &ti);
                }
                done.store(true, Ordering::Release);
            });
        }
        for _ in 0..4 {
            let table = &table;
            let done = &done;
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(7);
                let mut ti = table.threadinfo();
                while !done.load(Ordering::Acquire) {
                    let i: usize = rng.random_range(0..2_000) * 2;
                    assert_eq!(table.get_with(&key8(i), &ti).as_deref(), Some(&i));
                    ti.rcu_quiesce();
                }
            });
        }
    });

    assert_eq!(table.len(), 4_000);
    assert!(table.stats().get(Counter::LeafSplit) > 0);
}

#[test]
fn readers_see_values_across_layer_transitions() {
    common::init_tracing();
    let table: Table<usize, 10> = Table::new();
    let groups: usize = 1_200;
    // Each stable key is alone in its 8-byte chunk until a writer adds a
    // sibling, which turns the slot into a layer under the readers.
    let stable = |g: usize| format!("g{g:07}/stable").into_bytes();
    let sibling = |g: usize| format!("g{g:07}/churn").into_bytes();
    let doomed = |g: usize, side: &str| format!("c{g:07}/{side}").into_bytes();
    for g in 0..groups {
        table.insert(&stable(g), g);
    }
    let done = AtomicBool::new(false);
    let writers_left = std::sync::atomic::AtomicUsize::new(4);

    thread::scope(|s| {
        for t in 0..4 {
            let table = &table;
            let done = &done;
            let writers_left = &writers_left;
            s.spawn(move || {
                let ti = table.threadinfo();
                for g in (t..groups).step_by(4) {
                    table.insert_with(&sibling(g), g, &ti);
                    assert_eq!(table.get_with(&stable(g), &ti).as_deref(), Some(&g));
                    assert!(table.remove_with(&sibling(g), &ti).is_some());

                    // Both keys leave, so the layer collapses back.
                    table.insert_with(&doomed(g, "a"), g, &ti);
                    table.insert_with(&doomed(g, "b"), g, &ti);
                    assert!(table.remove_with(&doomed(g, "a"), &ti).is_some());
                    assert!(table.remove_with(&doomed(g, "b"), &ti).is_some());
                }
                if writers_left.fetch_sub(1, Ordering::AcqRel) == 1 {
                    done.store(true, Ordering::Release);
                }
            });
        }
        for r in 0..3u64 {
            let table = &table;
            let done = &done;
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(r);
                let mut ti = table.threadinfo();
                while !done.load(Ordering::Acquire) {
                    let g: usize = rng.random_range(0..groups);
                    assert_eq!(table.get_with(&stable(g), &ti).as_deref(), Some(&g), "lost stable key {g}");
                    // Keys in a collapsing layer are either present or absent, never garbage.
                    if let Some(v) = table.get_with(&doomed(g, "a"), &ti) {
                        assert_eq!(*v, g);
                    }

                    let mut up: Vec<usize> = Vec::new();
                    table.scan_with(&stable(g)[..8], true, &ti, |key, value| {
                        if key.ends_with(b"/stable") {
                            up.push(**value);
                        }
                        up.len() < 16
                    });
                    let want: Vec<usize> = (g..groups.min(g + 16)).collect();
                    assert_eq!(up, want, "ascending scan from group {g}");

                    let mut down: Vec<usize> = Vec::new();
                    table.scan_with(&stable(g), false, &ti, |key, value| {
                        if key.ends_with(b"/stable") {
                            down.push(**value);
                        }
                        down.len() < 16
                    });
                    let want: Vec<usize> = (g.saturating_sub(15)..=g).rev().collect();
                    assert_eq!(down, want, "descending scan from group {g}");

                    ti.rcu_quiesce();
                }
            });
        }
    });

    assert_eq!(table.len(), groups);
    let stats = table.stats();
    assert!(stats.get(Counter::LayerCreate) >= 2 * groups as u64);
    assert!(stats.get(Counter::LayerCollapse) > 0);
}

#[test]
fn scans_stay_ordered_under_concurrent_writes() {
    common::init_tracing();
    let table: Table<usize, 10> = Table::new();
    for i in (0..3_000).step_by(3) {
        table.insert(&key8(i), i);
    }
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        {
            let table = &table;
            let done = &done;
            s.spawn(move || {
                let ti = table.threadinfo();
                let mut order: Vec<usize> = (0..3_000).filter(|i| i % 3 != 0).collect();
                order.shuffle(&mut StdRng::seed_from_u64(11));
                for &i in &order {
                    table.insert_with(&key8(i), i, &ti);
                }
                for &i in &order {
                    table.remove_with(&key8(i), &ti);
                }
                done.store(true, Ordering::Release);
            });
        }
        for ascending in [true, false] {
            let table = &table;
            let done = &done;
            s.spawn(move || {
                while !done.load(Ordering::Acquire) {
                    let start: &[u8] = if ascending { b"" } else { b"99999999" };
                    let keys: Vec<Vec<u8>> = table.scan(start, usize::MAX, ascending).map(|(k, _)| k).collect();
                    let ordered: bool = if ascending {
                        keys.windows(2).all(|w| w[0] < w[1])
                    } else {
                        keys.windows(2).all(|w| w[0] > w[1])
                    };
                    assert!(ordered, "scan out of order");

                    // Multiples of 3 are present throughout.
                    let seen: BTreeSet<Vec<u8>> = keys.into_iter().collect();
                    for i in (0..3_000).step_by(3) {
                        assert!(seen.contains(&key8(i)), "scan skipped stable key {i}");
                    }
                }
            });
        }
    });

    assert_eq!(table.len(), 1_000);
}

// ============================================================================
//  Removes
// ============================================================================

#[test]
fn concurrent_insert_remove_churn() {
    common::init_tracing();
    let table: Table<usize, 10> = Table::new();

    thread::scope(|s| {
        for t in 0..4 {
            let table = &table;
            s.spawn(move || {
                let ti = table.threadinfo();
                let mut rng = StdRng::seed_from_u64(t);
                for _ in 0..20_000 {
                    // Each thread owns keys congruent to t mod 4.
                    let n: usize = rng.random_range(0..500) * 4 + usize::try_from(t).unwrap();
                    let key: Vec<u8> = format!("churn/{n:06}/with-a-long-tail").into_bytes();
                    if rng.random_bool(0.5) {
                        table.insert_with(&key, n, &ti);
                        assert_eq!(table.get_with(&key, &ti).as_deref(), Some(&n));
                    } else {
                        table.remove_with(&key, &ti);
                        assert!(table.get_with(&key, &ti).is_none());
                    }
                }
            });
        }
    });

    let scanned: usize = table.scan(b"", usize::MAX, true).count();
    assert_eq!(scanned, table.len());
}

#[test]
fn layers_collapse_and_rebuild_concurrently() {
    common::init_tracing();
    let table: Table<usize> = Table::new();

    thread::scope(|s| {
        for t in 0..4usize {
            let table = &table;
            s.spawn(move || {
                let ti = table.threadinfo();
                for round in 0..200 {
                    let a: Vec<u8> = format!("group-{t}-xx/{round}/a").into_bytes();
                    let b: Vec<u8> = format!("group-{t}-xx/{round}/b").into_bytes();
                    table.insert_with(&a, round, &ti);
                    table.insert_with(&b, round, &ti);
                    assert!(table.remove_with(&a, &ti).is_some());
                    assert!(table.remove_with(&b, &ti).is_some());
                }
            });
        }
    });

    assert!(table.is_empty());
    assert!(table.stats().get(Counter::LayerCollapse) > 0);
}
