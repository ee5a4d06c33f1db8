//! Table schemas, lock groups and replication compatibility.
//!
//! A schema is an ordered list of columns. Sorted tables start with a run
//! of key columns; ordered tables have none and address rows by tablet
//! index. Value columns may name a lock group: writes take the lock of the
//! groups they touch, and columns without a group share the primary lock.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use chaos_meta::error::{ChaosError, ChaosResult};
use chaos_meta::key::{Key, Value};

use crate::row::Row;

/// Commit timestamp materialized in ordered queue rows.
pub const TIMESTAMP_COLUMN: &str = "$timestamp";

/// Tablet index column of ordered table writes.
pub const TABLET_INDEX_COLUMN: &str = "$tablet_index";

/// Lock group of value columns that do not name one.
pub const PRIMARY_LOCK_GROUP: &str = "<primary>";

/// Column value type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// Signed 64-bit integer.
    Int64,
    /// Unsigned 64-bit integer.
    Uint64,
    /// Boolean.
    Boolean,
    /// UTF-8 string.
    String,
}

impl ColumnType {
    /// Whether `value` may be stored in a column of this type.
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (ColumnType::Int64, Value::Int64(_))
                | (ColumnType::Uint64, Value::Uint64(_))
                | (ColumnType::Boolean, Value::Boolean(_))
                | (ColumnType::String, Value::String(_))
        )
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Int64 => "int64",
            ColumnType::Uint64 => "uint64",
            ColumnType::Boolean => "boolean",
            ColumnType::String => "string",
        };
        f.write_str(name)
    }
}

/// Sort order of a key column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Ascending.
    Ascending,
}

/// One column.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Column name.
    pub name: String,
    /// Value type.
    pub column_type: ColumnType,
    /// Set on key columns.
    pub sort_order: Option<SortOrder>,
    /// Lock group of a value column.
    pub lock: Option<String>,
}

impl ColumnSchema {
    /// Key column.
    pub fn key(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            sort_order: Some(SortOrder::Ascending),
            lock: None,
        }
    }

    /// Value column in the primary lock group.
    pub fn value(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            sort_order: None,
            lock: None,
        }
    }

    /// Puts the column into lock group `lock`.
    pub fn with_lock(mut self, lock: &str) -> Self {
        self.lock = Some(lock.to_string());
        self
    }

    /// Whether this is a key column.
    pub fn is_key(&self) -> bool {
        self.sort_order.is_some()
    }
}

/// Ordered list of columns.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    columns: Vec<ColumnSchema>,
}

impl TableSchema {
    /// Validates and builds a schema.
    pub fn new(columns: Vec<ColumnSchema>) -> ChaosResult<Self> {
        if columns.is_empty() {
            return Err(ChaosError::validation("schema has no columns"));
        }
        let mut names = BTreeSet::new();
        let mut in_key_prefix = true;
        for column in &columns {
            if column.name.is_empty() || column.name.starts_with('$') {
                return Err(ChaosError::validation(format!(
                    "invalid column name {:?}",
                    column.name
                )));
            }
            if !names.insert(column.name.as_str()) {
                return Err(ChaosError::validation(format!(
                    "duplicate column {:?}",
                    column.name
                )));
            }
            if column.is_key() {
                if !in_key_prefix {
                    return Err(ChaosError::validation(format!(
                        "key column {:?} follows a value column",
                        column.name
                    )));
                }
                if column.lock.is_some() {
                    return Err(ChaosError::validation(format!(
                        "key column {:?} cannot have a lock group",
                        column.name
                    )));
                }
            } else {
                in_key_prefix = false;
            }
        }
        if columns.iter().all(|c| c.is_key()) && columns.iter().any(|c| c.is_key()) {
            return Err(ChaosError::validation("sorted schema has no value columns"));
        }
        Ok(Self { columns })
    }

    /// The `(key int64, value string)` schema used all over the tests and the demo.
    pub fn simple_sorted() -> Self {
        Self {
            columns: vec![
                ColumnSchema::key("key", ColumnType::Int64),
                ColumnSchema::value("value", ColumnType::String),
            ],
        }
    }

    /// The ordered `(key int64, value string)` schema.
    pub fn simple_ordered() -> Self {
        Self {
            columns: vec![
                ColumnSchema::value("key", ColumnType::Int64),
                ColumnSchema::value("value", ColumnType::String),
            ],
        }
    }

    /// All columns in order.
    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    /// Looks up a column.
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Whether the table is sorted (has key columns).
    pub fn is_sorted(&self) -> bool {
        self.columns.first().map(|c| c.is_key()).unwrap_or(false)
    }

    /// Key columns.
    pub fn key_columns(&self) -> impl Iterator<Item = &ColumnSchema> {
        self.columns.iter().filter(|c| c.is_key())
    }

    /// Value columns.
    pub fn value_columns(&self) -> impl Iterator<Item = &ColumnSchema> {
        self.columns.iter().filter(|c| !c.is_key())
    }

    /// Lock group of a value column.
    pub fn lock_group(&self, column: &str) -> &str {
        self.column(column)
            .and_then(|c| c.lock.as_deref())
            .unwrap_or(PRIMARY_LOCK_GROUP)
    }

    /// Every lock group of the schema.
    pub fn lock_groups(&self) -> BTreeSet<String> {
        self.value_columns()
            .map(|c| self.lock_group(&c.name).to_string())
            .collect()
    }

    /// Extracts the row key: key columns for sorted tables, the tablet
    /// index for ordered ones.
    pub fn key_of(&self, row: &Row) -> ChaosResult<Key> {
        if !self.is_sorted() {
            return match row.get(TABLET_INDEX_COLUMN) {
                None => Ok(Key::tablet(0)),
                Some(Value::Int64(index)) if *index >= 0 => Ok(Key::tablet(*index as usize)),
                Some(other) => Err(ChaosError::validation(format!(
                    "invalid {} value {}",
                    TABLET_INDEX_COLUMN, other
                ))),
            };
        }
        let mut values = Vec::new();
        for column in self.key_columns() {
            match row.get(&column.name) {
                Some(value) if *value != Value::Null && column.column_type.accepts(value) => {
                    values.push(value.clone())
                }
                Some(value) => {
                    return Err(ChaosError::validation(format!(
                        "invalid value {} for key column {:?} of type {}",
                        value, column.name, column.column_type
                    )))
                }
                None => {
                    return Err(ChaosError::validation(format!(
                        "missing key column {:?}",
                        column.name
                    )))
                }
            }
        }
        Ok(Key::new(values))
    }

    /// Checks that every written column exists and has the right type.
    pub fn validate_row(&self, row: &Row) -> ChaosResult<()> {
        for (name, value) in row.iter() {
            if name == TABLET_INDEX_COLUMN && !self.is_sorted() {
                continue;
            }
            let column = self
                .column(name)
                .ok_or_else(|| ChaosError::validation(format!("unknown column {:?}", name)))?;
            if !column.column_type.accepts(value) {
                return Err(ChaosError::validation(format!(
                    "invalid value {} for column {:?} of type {}",
                    value, name, column.column_type
                )));
            }
        }
        self.key_of(row).map(|_| ())
    }

    /// Value columns of `row` (everything except key and system columns).
    pub fn values_of(&self, row: &Row) -> Row {
        row.iter()
            .filter(|(name, _)| !name.starts_with('$'))
            .filter(|(name, _)| self.column(name).map(|c| !c.is_key()).unwrap_or(false))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

impl fmt::Display for TableSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<")?;
        for (i, column) in self.columns.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} {}", column.name, column.column_type)?;
            if column.is_key() {
                f.write_str(" key")?;
            }
        }
        f.write_str(">")
    }
}

/// Checks that rows of `source` can be replicated into `target`.
///
/// Sorted schemas need identical key columns and a target that contains
/// every source value column with the same type. Ordered schemas need
/// identical column lists.
pub fn check_replication_compatibility(source: &TableSchema, target: &TableSchema) -> ChaosResult<()> {
    let incompatible = |reason: String| {
        Err(ChaosError::SchemaIncompatible(format!(
            "Table schemas are incompatible: {} (source {}, target {})",
            reason, source, target
        )))
    };

    if source.is_sorted() != target.is_sorted() {
        return incompatible("sorted and ordered tables cannot replicate into each other".into());
    }

    if !source.is_sorted() {
        if source.columns.len() != target.columns.len() {
            return incompatible("ordered tables have different column counts".into());
        }
        for (s, t) in source.columns.iter().zip(&target.columns) {
            if s.name != t.name || s.column_type != t.column_type {
                return incompatible(format!("column {:?} differs", s.name));
            }
        }
        return Ok(());
    }

    let source_keys: Vec<_> = source.key_columns().collect();
    let target_keys: Vec<_> = target.key_columns().collect();
    if source_keys.len() != target_keys.len() {
        return incompatible("key column counts differ".into());
    }
    for (s, t) in source_keys.iter().zip(&target_keys) {
        if s.name != t.name || s.column_type != t.column_type || s.sort_order != t.sort_order {
            return incompatible(format!("key column {:?} differs from {:?}", s.name, t.name));
        }
    }
    for column in source.value_columns() {
        match target.column(&column.name) {
            Some(t) if !t.is_key() && t.column_type == column.column_type => {}
            Some(_) => return incompatible(format!("column {:?} has a different type", column.name)),
            None => return incompatible(format!("column {:?} is missing in target", column.name)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value2() -> TableSchema {
        TableSchema::new(vec![
            ColumnSchema::key("key", ColumnType::Int64),
            ColumnSchema::value("value", ColumnType::String),
            ColumnSchema::value("value2", ColumnType::String),
        ])
        .unwrap()
    }

    fn key2(inverted: bool) -> TableSchema {
        let (a, b) = if inverted { ("key2", "key") } else { ("key", "key2") };
        TableSchema::new(vec![
            ColumnSchema::key(a, ColumnType::Int64),
            ColumnSchema::key(b, ColumnType::Int64),
            ColumnSchema::value("value", ColumnType::String),
        ])
        .unwrap()
    }

    mod validation {
        use super::*;

        #[test]
        fn test_rejects_bad_schemas() {
            assert!(TableSchema::new(vec![]).is_err());
            assert!(TableSchema::new(vec![
                ColumnSchema::value("value", ColumnType::String),
                ColumnSchema::key("key", ColumnType::Int64),
            ])
            .is_err());
            assert!(TableSchema::new(vec![
                ColumnSchema::key("key", ColumnType::Int64),
                ColumnSchema::value("key", ColumnType::String),
            ])
            .is_err());
            assert!(TableSchema::new(vec![ColumnSchema::value("$x", ColumnType::String)]).is_err());
        }

        #[test]
        fn test_key_extraction() {
            let schema = TableSchema::simple_sorted();
            let row = Row::new().with("key", 3i64).with("value", "x");
            assert_eq!(schema.key_of(&row).unwrap(), Key::from(3));
            assert!(schema.key_of(&Row::new().with("value", "x")).is_err());
            assert!(schema.validate_row(&Row::new().with("key", "3")).is_err());
            assert!(schema.validate_row(&Row::new().with("key", 1i64).with("other", 1i64)).is_err());

            let ordered = TableSchema::simple_ordered();
            let row = Row::new().with(TABLET_INDEX_COLUMN, 2i64).with("key", 1i64);
            assert_eq!(ordered.key_of(&row).unwrap(), Key::tablet(2));
            assert_eq!(ordered.key_of(&Row::new()).unwrap(), Key::tablet(0));
        }

        #[test]
        fn test_lock_groups() {
            let schema = TableSchema::new(vec![
                ColumnSchema::key("key", ColumnType::Int64),
                ColumnSchema::value("a", ColumnType::String).with_lock("a"),
                ColumnSchema::value("b", ColumnType::String).with_lock("b"),
                ColumnSchema::value("c", ColumnType::String),
            ])
            .unwrap();
            assert_eq!(schema.lock_group("a"), "a");
            assert_eq!(schema.lock_group("c"), PRIMARY_LOCK_GROUP);
            assert_eq!(schema.lock_groups().len(), 3);
        }
    }

    mod compatibility {
        use super::*;

        #[test]
        fn test_superset_target_is_compatible() {
            assert!(check_replication_compatibility(&TableSchema::simple_sorted(), &value2()).is_ok());
            assert!(check_replication_compatibility(&TableSchema::simple_sorted(), &TableSchema::simple_sorted()).is_ok());
        }

        #[test]
        fn test_incompatible_pairs() {
            let simple = TableSchema::simple_sorted();
            assert!(check_replication_compatibility(&value2(), &simple).is_err());
            assert!(check_replication_compatibility(&key2(false), &simple).is_err());
            assert!(check_replication_compatibility(&key2(false), &key2(true)).is_err());
            let err = check_replication_compatibility(&simple, &TableSchema::simple_ordered()).unwrap_err();
            assert!(err.to_string().contains("Table schemas are incompatible"));
        }

        #[test]
        fn test_ordered_requires_identical_columns() {
            let ordered_int = TableSchema::new(vec![
                ColumnSchema::value("key", ColumnType::Int64),
                ColumnSchema::value("value", ColumnType::Int64),
            ])
            .unwrap();
            let ordered_value2 = TableSchema::new(vec![
                ColumnSchema::value("key", ColumnType::Int64),
                ColumnSchema::value("value", ColumnType::String),
                ColumnSchema::value("value2", ColumnType::String),
            ])
            .unwrap();
            let simple = TableSchema::simple_ordered();
            assert!(check_replication_compatibility(&simple, &simple).is_ok());
            assert!(check_replication_compatibility(&simple, &ordered_int).is_err());
            assert!(check_replication_compatibility(&simple, &ordered_value2).is_err());
        }
    }
}
