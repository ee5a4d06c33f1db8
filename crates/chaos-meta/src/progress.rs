//! Replication progress: a step function from keys to timestamps.
//!
//! A progress covers the half-open range `[segments[0].lower_key, upper_key)`.
//! Each segment holds the timestamp up to which the replica has every write
//! for keys from its lower key up to the next segment's lower key.
//!
//! Progress is the only replica state that survives restarts and card
//! migrations, and it never moves backward: every mutating operation here
//! takes the pointwise maximum.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ChaosError, ChaosResult};
use crate::key::{Key, KeyRange};
use crate::types::Timestamp;

/// One step of a progress function.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgressSegment {
    /// First key covered by this segment.
    pub lower_key: Key,
    /// Timestamp the replica has caught up to in this segment.
    pub timestamp: Timestamp,
}

impl ProgressSegment {
    /// Creates a segment.
    pub fn new(lower_key: Key, timestamp: Timestamp) -> Self {
        Self {
            lower_key,
            timestamp,
        }
    }
}

/// Replication progress of a replica over a key range.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicationProgress {
    segments: Vec<ProgressSegment>,
    upper_key: Key,
}

impl ReplicationProgress {
    /// Builds a progress from explicit segments, validating their order.
    pub fn new(segments: Vec<ProgressSegment>, upper_key: Key) -> ChaosResult<Self> {
        if segments.is_empty() {
            return Err(ChaosError::validation("replication progress has no segments"));
        }
        for pair in segments.windows(2) {
            if pair[0].lower_key >= pair[1].lower_key {
                return Err(ChaosError::validation(format!(
                    "replication progress segments are not sorted: {} >= {}",
                    pair[0].lower_key, pair[1].lower_key
                )));
            }
        }
        if let Some(last) = segments.last() {
            if last.lower_key >= upper_key {
                return Err(ChaosError::validation(format!(
                    "replication progress segment {} is not below upper key {}",
                    last.lower_key, upper_key
                )));
            }
        }
        Ok(Self {
            segments,
            upper_key,
        })
    }

    /// Progress holding `timestamp` over `[lower, upper)`.
    pub fn single(lower: Key, upper: Key, timestamp: Timestamp) -> Self {
        Self {
            segments: vec![ProgressSegment::new(lower, timestamp)],
            upper_key: upper,
        }
    }

    /// Progress holding `timestamp` over the whole key space.
    pub fn full(timestamp: Timestamp) -> Self {
        Self::single(Key::empty(), Key::max(), timestamp)
    }

    /// Progress over `range` at `timestamp`.
    pub fn over(range: &KeyRange, timestamp: Timestamp) -> Self {
        Self::single(range.lower.clone(), range.upper.clone(), timestamp)
    }

    /// Segments in key order.
    pub fn segments(&self) -> &[ProgressSegment] {
        &self.segments
    }

    /// Exclusive upper key.
    pub fn upper_key(&self) -> &Key {
        &self.upper_key
    }

    /// Inclusive lower key.
    pub fn lower_key(&self) -> &Key {
        &self.segments[0].lower_key
    }

    /// Covered key range.
    pub fn range(&self) -> KeyRange {
        KeyRange::new(self.lower_key().clone(), self.upper_key.clone())
    }

    /// Timestamp at `key`, or `None` when the key is outside the range.
    pub fn timestamp_at(&self, key: &Key) -> Option<Timestamp> {
        if *key < *self.lower_key() || *key >= self.upper_key {
            return None;
        }
        let index = self
            .segments
            .partition_point(|segment| segment.lower_key <= *key);
        Some(self.segments[index - 1].timestamp)
    }

    /// Minimum timestamp over the whole range.
    pub fn min_timestamp(&self) -> Timestamp {
        self.segments
            .iter()
            .map(|s| s.timestamp)
            .min()
            .unwrap_or(Timestamp::NULL)
    }

    /// Maximum timestamp over the whole range.
    pub fn max_timestamp(&self) -> Timestamp {
        self.segments
            .iter()
            .map(|s| s.timestamp)
            .max()
            .unwrap_or(Timestamp::NULL)
    }

    /// Minimum timestamp inside `range`, or `None` if the ranges are disjoint.
    pub fn min_timestamp_in(&self, range: &KeyRange) -> Option<Timestamp> {
        self.slice(range).map(|p| p.min_timestamp())
    }

    /// Restriction to `range`, or `None` if the ranges are disjoint.
    pub fn slice(&self, range: &KeyRange) -> Option<ReplicationProgress> {
        let clipped = self.range().intersect(range);
        if clipped.is_empty() {
            return None;
        }
        let mut segments = Vec::new();
        for (i, segment) in self.segments.iter().enumerate() {
            let end = self
                .segments
                .get(i + 1)
                .map(|s| &s.lower_key)
                .unwrap_or(&self.upper_key);
            if *end <= clipped.lower || segment.lower_key >= clipped.upper {
                continue;
            }
            let lower = if segment.lower_key < clipped.lower {
                clipped.lower.clone()
            } else {
                segment.lower_key.clone()
            };
            segments.push(ProgressSegment::new(lower, segment.timestamp));
        }
        Some(Self {
            segments,
            upper_key: clipped.upper,
        })
    }

    /// Pointwise combination over this progress' range. Keys not covered by
    /// `other` keep their current timestamp.
    pub fn combine<F>(&self, other: &ReplicationProgress, f: F) -> ReplicationProgress
    where
        F: Fn(Timestamp, Timestamp) -> Timestamp,
    {
        let range = self.range();
        let mut breakpoints: Vec<Key> = self
            .segments
            .iter()
            .map(|s| s.lower_key.clone())
            .chain(other.segments.iter().map(|s| s.lower_key.clone()))
            .chain(std::iter::once(other.upper_key.clone()))
            .filter(|k| range.contains(k))
            .collect();
        breakpoints.sort();
        breakpoints.dedup();

        let segments = breakpoints
            .into_iter()
            .filter_map(|key| {
                let mine = self.timestamp_at(&key)?;
                let value = match other.timestamp_at(&key) {
                    Some(theirs) => f(mine, theirs),
                    None => mine,
                };
                Some(ProgressSegment::new(key, value))
            })
            .collect();

        let mut result = Self {
            segments,
            upper_key: self.upper_key.clone(),
        };
        result.compact();
        result
    }

    /// Pointwise maximum with `other`.
    pub fn update(&mut self, other: &ReplicationProgress) {
        *self = self.combine(other, std::cmp::max);
    }

    /// Raises every key in `range` to at least `timestamp`.
    pub fn advance(&mut self, range: &KeyRange, timestamp: Timestamp) {
        if let Some(clipped) = self.slice(range) {
            self.update(&ReplicationProgress::over(&clipped.range(), timestamp));
        }
    }

    /// Raises the whole range to at least `timestamp`.
    pub fn advance_all(&mut self, timestamp: Timestamp) {
        let range = self.range();
        self.advance(&range, timestamp);
    }

    /// Pointwise minimum with `other` over this progress' range.
    pub fn gather_min(&self, other: &ReplicationProgress) -> ReplicationProgress {
        self.combine(other, std::cmp::min)
    }

    /// Pointwise minimum of several progresses, over the first one's range.
    pub fn gather_min_all<'a, I>(progresses: I) -> Option<ReplicationProgress>
    where
        I: IntoIterator<Item = &'a ReplicationProgress>,
    {
        let mut iter = progresses.into_iter();
        let first = iter.next()?.clone();
        Some(iter.fold(first, |acc, p| acc.gather_min(p)))
    }

    /// Whether this progress is at least `other` wherever both are defined.
    pub fn is_ge(&self, other: &ReplicationProgress) -> bool {
        let range = self.range().intersect(&other.range());
        if range.is_empty() {
            return true;
        }
        self.segments
            .iter()
            .chain(other.segments.iter())
            .map(|s| &s.lower_key)
            .chain(std::iter::once(&range.lower))
            .filter(|k| range.contains(k))
            .all(|k| match (self.timestamp_at(k), other.timestamp_at(k)) {
                (Some(mine), Some(theirs)) => mine >= theirs,
                _ => true,
            })
    }

    /// Whether every key of `range` is covered and at least `timestamp`.
    pub fn dominates_in(&self, range: &KeyRange, timestamp: Timestamp) -> bool {
        if range.is_empty() {
            return true;
        }
        if range.lower < *self.lower_key() || range.upper > self.upper_key {
            return false;
        }
        match self.min_timestamp_in(range) {
            Some(min) => min >= timestamp,
            None => false,
        }
    }

    /// Whether the whole range is at least `timestamp`.
    pub fn is_ge_timestamp(&self, timestamp: Timestamp) -> bool {
        self.min_timestamp() >= timestamp
    }

    /// Merges neighbouring segments with equal timestamps.
    pub fn compact(&mut self) {
        self.segments.dedup_by(|next, prev| next.timestamp == prev.timestamp);
    }
}

impl fmt::Display for ReplicationProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", segment.lower_key, segment.timestamp)?;
        }
        write!(f, "; upper {}}}", self.upper_key)
    }
}
