//! Differential property tests: [`Table`] against a `BTreeMap` oracle.
//!
//! Key strategies deliberately crowd a few 8-byte chunks so that layers,
//! twig chains, rank ties (`"a"` vs `"a\0"`) and splits all show up in
//! small cases.

#![expect(clippy::unwrap_used, reason = "fail fast in tests")]

use std::collections::BTreeMap;
use std::sync::Arc;

use masstable::Table;
use proptest::prelude::*;

// ============================================================================
//  Strategies
// ============================================================================

/// Keys built from a tiny alphabet, so prefixes collide often.
fn crowded_key() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec(prop::sample::select(vec![0u8, b'a', b'b']), 0..=10),
        (prop::sample::select(vec![&b"prefix00"[..], b"prefix01"]), prop::collection::vec(prop::sample::select(vec![0u8, b'x', b'y']), 0..=20))
            .prop_map(|(head, tail)| [head, &tail[..]].concat()),
        prop::collection::vec(any::<u8>(), 0..=40),
    ]
}

#[derive(Debug, Clone)]
enum Op {
    Insert(Vec<u8>, u64),
    Remove(Vec<u8>),
    Get(Vec<u8>),
    Scan(Vec<u8>, usize, bool),
}

fn operations(max_ops: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            4 => (crowded_key(), any::<u64>()).prop_map(|(k, v)| Op::Insert(k, v)),
            2 => crowded_key().prop_map(Op::Remove),
            2 => crowded_key().prop_map(Op::Get),
            1 => (crowded_key(), 0usize..20, any::<bool>()).prop_map(|(k, n, asc)| Op::Scan(k, n, asc)),
        ],
        0..=max_ops,
    )
}

fn oracle_scan(oracle: &BTreeMap<Vec<u8>, u64>, start: &[u8], count: usize, ascending: bool) -> Vec<(Vec<u8>, u64)> {
    let pick = |(k, v): (&Vec<u8>, &u64)| (k.clone(), *v);
    if ascending {
        oracle.range(start.to_vec()..).take(count).map(pick).collect()
    } else {
        oracle.range(..=start.to_vec()).rev().take(count).map(pick).collect()
    }
}

fn table_scan(table: &Table<u64, 10>, start: &[u8], count: usize, ascending: bool) -> Vec<(Vec<u8>, u64)> {
    table.scan(start, count, ascending).map(|(k, v)| (k, *v)).collect()
}

// ============================================================================
//  Differential
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    #[test]
    fn differential_random_ops(ops in operations(200)) {
        let table: Table<u64, 10> = Table::new();
        let mut oracle: BTreeMap<Vec<u8>, u64> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(key, value) => {
                    let old: Option<u64> = table.insert(&key, value).map(|v| *v);
                    prop_assert_eq!(old, oracle.insert(key, value));
                }
                Op::Remove(key) => {
                    prop_assert_eq!(table.remove(&key), oracle.remove(&key).is_some());
                }
                Op::Get(key) => {
                    prop_assert_eq!(table.get(&key).map(|v| *v), oracle.get(&key).copied());
                }
                Op::Scan(start, count, ascending) => {
                    prop_assert_eq!(
                        table_scan(&table, &start, count, ascending),
                        oracle_scan(&oracle, &start, count, ascending)
                    );
                }
            }
            prop_assert_eq!(table.len(), oracle.len());
        }

        let everything: Vec<(Vec<u8>, u64)> = table_scan(&table, b"", usize::MAX, true);
        prop_assert_eq!(everything, oracle_scan(&oracle, b"", usize::MAX, true));
    }

    #[test]
    fn insert_all_then_remove_all(keys in prop::collection::btree_set(crowded_key(), 0..150)) {
        let table: Table<u64, 10> = Table::new();
        for (i, key) in keys.iter().enumerate() {
            prop_assert!(table.insert(key, i as u64).is_none());
        }
        prop_assert_eq!(table.len(), keys.len());

        let scanned: Vec<Vec<u8>> = table.scan(b"", usize::MAX, true).map(|(k, _)| k).collect();
        prop_assert_eq!(&scanned, &keys.iter().cloned().collect::<Vec<_>>());

        for key in &keys {
            prop_assert!(table.remove(key));
        }
        prop_assert!(table.is_empty());
        prop_assert_eq!(table.scan(b"", usize::MAX, false).count(), 0);
        for key in &keys {
            prop_assert!(table.get(key).is_none());
        }
    }

    #[test]
    fn removing_absent_keys_changes_nothing(
        keys in prop::collection::btree_set(crowded_key(), 1..100),
        strangers in prop::collection::vec(crowded_key(), 0..30),
    ) {
        let table: Table<u64, 10> = Table::new();
        for (i, key) in keys.iter().enumerate() {
            table.insert(key, i as u64);
        }
        let up: Vec<(Vec<u8>, u64)> = table_scan(&table, b"", usize::MAX, true);
        let down: Vec<(Vec<u8>, u64)> = table_scan(&table, &[0xff; 48], usize::MAX, false);

        // Extensions and truncations of live keys reach into their layers.
        let mut absent: Vec<Vec<u8>> = strangers;
        for key in &keys {
            absent.push([&key[..], b"zz"].concat());
            absent.push([&key[..], &[0u8][..]].concat());
            if !key.is_empty() {
                absent.push(key[..key.len() - 1].to_vec());
            }
        }
        absent.retain(|k| !keys.contains(k));

        for key in &absent {
            prop_assert!(!table.remove(key));
        }
        prop_assert_eq!(table.len(), keys.len());
        prop_assert_eq!(table_scan(&table, b"", usize::MAX, true), up);
        prop_assert_eq!(table_scan(&table, &[0xff; 48], usize::MAX, false), down);
    }

    #[test]
    fn descending_scan_is_reverse_of_ascending(keys in prop::collection::btree_set(crowded_key(), 0..150)) {
        let table: Table<u64, 10> = Table::new();
        for key in &keys {
            table.insert(key, 0);
        }
        let up: Vec<Vec<u8>> = table.scan(b"", usize::MAX, true).map(|(k, _)| k).collect();
        let mut down: Vec<Vec<u8>> = table.scan(&[0xff; 48], usize::MAX, false).map(|(k, _)| k).collect();
        down.reverse();
        prop_assert_eq!(up, down);
    }

    #[test]
    fn values_are_shared_not_copied(key in crowded_key()) {
        let table: Table<u64, 10> = Table::new();
        let ti = table.threadinfo();
        let value: Arc<u64> = Arc::new(7);
        table.insert_arc_with(&key, Arc::clone(&value), &ti);
        let got: Arc<u64> = table.get_with(&key, &ti).unwrap();
        prop_assert!(Arc::ptr_eq(&got, &value));
    }
}
