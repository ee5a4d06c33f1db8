//! Typed row keys with a total order.
//!
//! Sorted tables use tuples of typed values. Ordered tables use a
//! one-element key holding the tablet index, so replication progress can be
//! expressed over both with the same machinery.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A typed value. Variant order defines the cross-type order, with the
/// `Min` and `Max` sentinels at the ends.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    /// Lower sentinel.
    Min,
    /// SQL-like null.
    Null,
    /// Signed integer.
    Int64(i64),
    /// Unsigned integer.
    Uint64(u64),
    /// Boolean.
    Boolean(bool),
    /// UTF-8 string.
    String(String),
    /// Upper sentinel.
    Max,
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Min => f.write_str("<min>"),
            Value::Null => f.write_str("#"),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Uint64(v) => write!(f, "{}u", v),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{:?}", v),
            Value::Max => f.write_str("<max>"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// A row key: lexicographically ordered tuple of values.
///
/// The empty key sorts before every other key; [`Key::max`] sorts after
/// every key that does not itself start with `Max`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key(Vec<Value>);

impl Key {
    /// Creates a key from values.
    pub fn new(values: Vec<Value>) -> Self {
        Key(values)
    }

    /// The smallest key.
    pub fn empty() -> Self {
        Key(Vec::new())
    }

    /// The upper sentinel key.
    pub fn max() -> Self {
        Key(vec![Value::Max])
    }

    /// Key of tablet `index` of an ordered table.
    pub fn tablet(index: usize) -> Self {
        if index == 0 {
            Key::empty()
        } else {
            Key(vec![Value::Int64(index as i64)])
        }
    }

    /// Tablet index encoded by an ordered-table key.
    pub fn tablet_index(&self) -> Option<usize> {
        match self.0.as_slice() {
            [] => Some(0),
            [Value::Int64(i)] if *i >= 0 => Some(*i as usize),
            _ => None,
        }
    }

    /// Whether this is the empty key.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether this is the upper sentinel.
    pub fn is_max(&self) -> bool {
        matches!(self.0.first(), Some(Value::Max))
    }

    /// Key values.
    pub fn values(&self) -> &[Value] {
        &self.0
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key(vec![Value::Int64(v)])
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", value)?;
        }
        f.write_str("]")
    }
}

/// Half-open key range `[lower, upper)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    /// Inclusive lower bound.
    pub lower: Key,
    /// Exclusive upper bound.
    pub upper: Key,
}

impl KeyRange {
    /// Creates a range.
    pub fn new(lower: Key, upper: Key) -> Self {
        Self { lower, upper }
    }

    /// The whole key space.
    pub fn full() -> Self {
        Self::new(Key::empty(), Key::max())
    }

    /// Range containing exactly one key.
    pub fn point(key: &Key) -> Self {
        let mut upper = key.0.clone();
        upper.push(Value::Min);
        Self::new(key.clone(), Key(upper))
    }

    /// Whether `key` lies in the range.
    pub fn contains(&self, key: &Key) -> bool {
        *key >= self.lower && *key < self.upper
    }

    /// Whether the range is empty.
    pub fn is_empty(&self) -> bool {
        self.lower >= self.upper
    }

    /// Intersection of two ranges.
    pub fn intersect(&self, other: &KeyRange) -> KeyRange {
        KeyRange::new(
            self.lower.clone().max(other.lower.clone()),
            self.upper.clone().min(other.upper.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels() {
        let k = Key::from(5);
        assert!(Key::empty() < k);
        assert!(k < Key::max());
        assert!(Key::new(vec![Value::String("z".into())]) < Key::max());
        assert!(Key::max().is_max());
    }

    #[test]
    fn test_lexicographic() {
        let a = Key::new(vec![Value::Int64(1), Value::Int64(2)]);
        let b = Key::new(vec![Value::Int64(1), Value::Int64(3)]);
        let c = Key::new(vec![Value::Int64(1)]);
        assert!(a < b);
        assert!(c < a);
    }

    #[test]
    fn test_tablet_keys() {
        assert_eq!(Key::tablet(0), Key::empty());
        assert_eq!(Key::tablet(2).tablet_index(), Some(2));
        assert_eq!(Key::empty().tablet_index(), Some(0));
        assert!(Key::tablet(1) < Key::tablet(2));
        assert_eq!(Key::from(-1).tablet_index(), None);
    }

    #[test]
    fn test_point_range() {
        let key = Key::from(3);
        let range = KeyRange::point(&key);
        assert!(range.contains(&key));
        assert!(!range.contains(&Key::from(4)));
        assert!(!range.contains(&Key::from(2)));
        assert!(range.contains(&Key::new(vec![Value::Int64(3), Value::Int64(1)])));
    }

    #[test]
    fn test_intersect() {
        let a = KeyRange::new(Key::from(1), Key::from(5));
        let b = KeyRange::new(Key::from(3), Key::max());
        let i = a.intersect(&b);
        assert_eq!(i, KeyRange::new(Key::from(3), Key::from(5)));
        assert!(!i.is_empty());
        let disjoint = KeyRange::new(Key::from(7), Key::from(9)).intersect(&a);
        assert!(disjoint.is_empty());
    }

    #[test]
    fn test_display() {
        let k = Key::new(vec![Value::Int64(1), Value::from("a")]);
        assert_eq!(k.to_string(), "[1, \"a\"]");
    }
}
