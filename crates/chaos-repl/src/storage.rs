//! In-memory tablet storage.
//!
//! Sorted data tablets keep every version of every column so reads at a
//! timestamp see exactly the writes committed at or before it. Queues and
//! ordered tables are append-only logs addressed by row index, trimmed from
//! the front.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chaos_meta::key::{Key, Value};
use chaos_meta::types::Timestamp;

use crate::row::{ReplicatedRow, Row, RowChange};
use crate::schema::{TableSchema, TIMESTAMP_COLUMN};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct VersionedRow {
    written: BTreeSet<Timestamp>,
    values: BTreeMap<String, BTreeMap<Timestamp, Value>>,
    deletes: BTreeSet<Timestamp>,
    locks: BTreeMap<String, Timestamp>,
}

impl VersionedRow {
    fn last_delete(&self, timestamp: Timestamp) -> Timestamp {
        self.deletes
            .range(..=timestamp)
            .next_back()
            .copied()
            .unwrap_or(Timestamp::NULL)
    }

    fn visible_at(&self, timestamp: Timestamp) -> bool {
        let deleted = self.last_delete(timestamp);
        self.written
            .range(..=timestamp)
            .next_back()
            .map(|written| *written > deleted)
            .unwrap_or(false)
    }

    fn lock(&mut self, group: &str, timestamp: Timestamp) {
        let entry = self.locks.entry(group.to_string()).or_insert(timestamp);
        *entry = (*entry).max(timestamp);
    }
}

/// Multi-version store of a sorted data tablet.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SortedStore {
    rows: BTreeMap<Key, VersionedRow>,
}

impl SortedStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a committed change. Applying the same change twice is a no-op.
    pub fn apply(&mut self, timestamp: Timestamp, change: &RowChange, schema: &TableSchema) {
        let row = self.rows.entry(change.key().clone()).or_default();
        match change {
            RowChange::Write { values, .. } => {
                row.written.insert(timestamp);
                for (column, value) in values.iter() {
                    if schema.column(column).is_none() {
                        continue;
                    }
                    row.values
                        .entry(column.clone())
                        .or_default()
                        .insert(timestamp, value.clone());
                    let group = schema.lock_group(column).to_string();
                    row.lock(&group, timestamp);
                }
            }
            RowChange::Delete { .. } => {
                row.deletes.insert(timestamp);
            }
            RowChange::Lock { lock_groups, .. } => {
                for group in lock_groups {
                    row.lock(group, timestamp);
                }
            }
        }
    }

    /// Reads a row as of `timestamp`.
    pub fn lookup(&self, key: &Key, timestamp: Timestamp, schema: &TableSchema) -> Option<Row> {
        let row = self.rows.get(key)?;
        if !row.visible_at(timestamp) {
            return None;
        }
        let deleted = row.last_delete(timestamp);
        let mut result = Row::new();
        for (column, value) in schema.key_columns().zip(key.values()) {
            result.set(&column.name, value.clone());
        }
        for column in schema.value_columns() {
            let value = row
                .values
                .get(&column.name)
                .and_then(|versions| versions.range(..=timestamp).next_back())
                .filter(|(written, _)| **written > deleted)
                .map(|(_, value)| value.clone())
                .unwrap_or(Value::Null);
            result.set(&column.name, value);
        }
        Some(result)
    }

    /// Every row visible at `timestamp`, in key order.
    pub fn select(&self, timestamp: Timestamp, schema: &TableSchema) -> Vec<Row> {
        self.rows
            .keys()
            .filter_map(|key| self.lookup(key, timestamp, schema))
            .collect()
    }

    /// Latest commit that touched `group` of the row (deletes touch every group).
    pub fn last_lock_timestamp(&self, key: &Key, group: &str) -> Timestamp {
        self.rows
            .get(key)
            .map(|row| {
                let locked = row.locks.get(group).copied().unwrap_or(Timestamp::NULL);
                let deleted = row.deletes.iter().next_back().copied().unwrap_or(Timestamp::NULL);
                locked.max(deleted)
            })
            .unwrap_or(Timestamp::NULL)
    }

    /// Number of keys with any version.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether nothing was ever written.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// One entry of an append-only log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Position in the tablet.
    pub row_index: u64,
    /// The committed change.
    pub row: ReplicatedRow,
}

/// Append-only log of a queue or ordered tablet.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LogStore {
    records: VecDeque<LogRecord>,
    trimmed_row_count: u64,
}

impl LogStore {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a committed change and returns its row index.
    pub fn append(&mut self, row: ReplicatedRow) -> u64 {
        let row_index = self.total_row_count();
        self.records.push_back(LogRecord { row_index, row });
        row_index
    }

    /// Records not trimmed yet.
    pub fn records(&self) -> impl Iterator<Item = &LogRecord> {
        self.records.iter()
    }

    /// Drops records from the front while `trimmable` holds.
    pub fn trim_while<F>(&mut self, mut trimmable: F) -> usize
    where
        F: FnMut(&ReplicatedRow) -> bool,
    {
        let mut trimmed = 0;
        while let Some(front) = self.records.front() {
            if !trimmable(&front.row) {
                break;
            }
            self.records.pop_front();
            trimmed += 1;
        }
        self.trimmed_row_count += trimmed as u64;
        trimmed
    }

    /// Rows removed by trimming.
    pub fn trimmed_row_count(&self) -> u64 {
        self.trimmed_row_count
    }

    /// Rows ever appended.
    pub fn total_row_count(&self) -> u64 {
        self.trimmed_row_count + self.records.len() as u64
    }

    /// Written rows visible at `timestamp`; with `with_timestamp` the commit
    /// timestamp is materialized in [`TIMESTAMP_COLUMN`].
    pub fn select(&self, timestamp: Timestamp, with_timestamp: bool) -> Vec<Row> {
        self.records
            .iter()
            .filter(|r| r.row.timestamp <= timestamp)
            .filter_map(|r| match &r.row.change {
                RowChange::Write { values, .. } => {
                    let mut row = values.clone();
                    if with_timestamp {
                        row.set(TIMESTAMP_COLUMN, Value::Uint64(r.row.timestamp.as_u64()));
                    }
                    Some(row)
                }
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, ColumnType};

    fn ts(raw: u64) -> Timestamp {
        Timestamp::new(raw)
    }

    fn write(key: i64, column: &str, value: &str) -> RowChange {
        RowChange::Write {
            key: Key::from(key),
            values: Row::new().with(column, value),
        }
    }

    mod sorted {
        use super::*;

        #[test]
        fn test_versions_and_deletes() {
            let schema = TableSchema::simple_sorted();
            let mut store = SortedStore::new();
            store.apply(ts(10), &write(0, "value", "a"), &schema);
            store.apply(ts(20), &write(0, "value", "b"), &schema);
            store.apply(ts(30), &RowChange::Delete { key: Key::from(0) }, &schema);

            assert!(store.lookup(&Key::from(0), ts(5), &schema).is_none());
            let row = store.lookup(&Key::from(0), ts(15), &schema).unwrap();
            assert_eq!(row.get("value"), Some(&Value::from("a")));
            assert_eq!(row.get("key"), Some(&Value::Int64(0)));
            let row = store.lookup(&Key::from(0), ts(25), &schema).unwrap();
            assert_eq!(row.get("value"), Some(&Value::from("b")));
            assert!(store.lookup(&Key::from(0), Timestamp::MAX, &schema).is_none());
        }

        #[test]
        fn test_out_of_order_apply() {
            let schema = TableSchema::simple_sorted();
            let mut store = SortedStore::new();
            store.apply(ts(20), &write(1, "value", "new"), &schema);
            store.apply(ts(10), &write(1, "value", "old"), &schema);
            store.apply(ts(10), &write(1, "value", "old"), &schema);
            let row = store.lookup(&Key::from(1), Timestamp::MAX, &schema).unwrap();
            assert_eq!(row.get("value"), Some(&Value::from("new")));
            assert_eq!(store.select(ts(15), &schema).len(), 1);
        }

        #[test]
        fn test_partial_writes_and_locks() {
            let schema = TableSchema::new(vec![
                ColumnSchema::key("key", ColumnType::Int64),
                ColumnSchema::value("a", ColumnType::String).with_lock("a"),
                ColumnSchema::value("b", ColumnType::String).with_lock("b"),
            ])
            .unwrap();
            let mut store = SortedStore::new();
            store.apply(ts(10), &write(1, "a", "1"), &schema);
            store.apply(ts(20), &write(1, "b", "2"), &schema);
            store.apply(
                ts(30),
                &RowChange::Lock {
                    key: Key::from(1),
                    lock_groups: ["a".to_string()].into_iter().collect(),
                },
                &schema,
            );
            let row = store.lookup(&Key::from(1), Timestamp::MAX, &schema).unwrap();
            assert_eq!(row.get("a"), Some(&Value::from("1")));
            assert_eq!(row.get("b"), Some(&Value::from("2")));
            assert_eq!(store.last_lock_timestamp(&Key::from(1), "a"), ts(30));
            assert_eq!(store.last_lock_timestamp(&Key::from(1), "b"), ts(20));
            assert_eq!(store.last_lock_timestamp(&Key::from(2), "b"), Timestamp::NULL);
        }
    }

    mod log {
        use super::*;

        fn replicated(timestamp: u64, key: i64) -> ReplicatedRow {
            ReplicatedRow {
                timestamp: ts(timestamp),
                change: write(key, "value", "v"),
            }
        }

        #[test]
        fn test_append_and_trim() {
            let mut log = LogStore::new();
            assert_eq!(log.append(replicated(10, 0)), 0);
            assert_eq!(log.append(replicated(20, 1)), 1);
            assert_eq!(log.append(replicated(30, 2)), 2);
            assert_eq!(log.trim_while(|r| r.timestamp <= ts(20)), 2);
            assert_eq!(log.trimmed_row_count(), 2);
            assert_eq!(log.total_row_count(), 3);
            assert_eq!(log.records().next().unwrap().row_index, 2);
            assert_eq!(log.append(replicated(40, 3)), 3);
        }

        #[test]
        fn test_select_materializes_timestamp() {
            let mut log = LogStore::new();
            log.append(replicated(10, 0));
            log.append(replicated(20, 1));
            let rows = log.select(ts(15), true);
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].get(TIMESTAMP_COLUMN), Some(&Value::Uint64(10)));
            assert!(log.select(Timestamp::MAX, false)[0].get(TIMESTAMP_COLUMN).is_none());
        }
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_apply_order_does_not_matter(
                writes in prop::collection::vec((0i64..4, 1u64..50, "[a-z]{1,3}"), 1..20),
                shuffle_seed in any::<u64>(),
            ) {
                let schema = TableSchema::simple_sorted();
                let mut forward = SortedStore::new();
                for (key, timestamp, value) in &writes {
                    forward.apply(ts(*timestamp), &write(*key, "value", value), &schema);
                }

                let mut shuffled = writes.clone();
                let len = shuffled.len();
                for i in 0..len {
                    let j = (shuffle_seed.wrapping_mul(i as u64 + 1) % len as u64) as usize;
                    shuffled.swap(i, j);
                }
                let mut backward = SortedStore::new();
                for (key, timestamp, value) in shuffled.iter().rev() {
                    backward.apply(ts(*timestamp), &write(*key, "value", value), &schema);
                }

                // Equal timestamps on one key are ambiguous; compare only unique ones.
                let mut seen = BTreeMap::new();
                for (key, timestamp, _) in &writes {
                    *seen.entry((*key, *timestamp)).or_insert(0) += 1;
                }
                if seen.values().all(|n| *n == 1) {
                    prop_assert_eq!(
                        forward.select(Timestamp::MAX, &schema),
                        backward.select(Timestamp::MAX, &schema)
                    );
                }
                prop_assert_eq!(forward.len(), backward.len());
            }
        }
    }
}
