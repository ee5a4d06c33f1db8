//! Rows and replicated row changes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chaos_meta::key::{Key, Value};
use chaos_meta::types::Timestamp;

/// An unversioned row: column name to value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Row(BTreeMap<String, Value>);

impl Row {
    /// Empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.0.insert(column.to_string(), value.into());
        self
    }

    /// Sets a column.
    pub fn set(&mut self, column: &str, value: Value) {
        self.0.insert(column.to_string(), value);
    }

    /// Reads a column.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// Columns in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// JSON rendering used by the operator tooling.
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .0
            .iter()
            .map(|(name, value)| {
                let json = match value {
                    Value::Null | Value::Min | Value::Max => serde_json::Value::Null,
                    Value::Int64(v) => serde_json::Value::from(*v),
                    Value::Uint64(v) => serde_json::Value::from(*v),
                    Value::Boolean(v) => serde_json::Value::from(*v),
                    Value::String(v) => serde_json::Value::from(v.clone()),
                };
                (name.clone(), json)
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Row(iter.into_iter().collect())
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", name, value)?;
        }
        f.write_str("}")
    }
}

/// A change to one row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowChange {
    /// Sets the given value columns; other columns keep their values.
    Write {
        /// Row key.
        key: Key,
        /// Written value columns.
        values: Row,
    },
    /// Deletes the row.
    Delete {
        /// Row key.
        key: Key,
    },
    /// Takes shared locks on lock groups without changing values.
    Lock {
        /// Row key.
        key: Key,
        /// Locked groups.
        lock_groups: BTreeSet<String>,
    },
}

impl RowChange {
    /// Row key of the change.
    pub fn key(&self) -> &Key {
        match self {
            RowChange::Write { key, .. } | RowChange::Delete { key } | RowChange::Lock { key, .. } => key,
        }
    }
}

/// A committed change as stored in a replication log and shipped by pulls.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedRow {
    /// Commit timestamp.
    pub timestamp: Timestamp,
    /// The change.
    pub change: RowChange,
}

impl ReplicatedRow {
    /// Row key.
    pub fn key(&self) -> &Key {
        self.change.key()
    }
}
