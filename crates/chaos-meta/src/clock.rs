//! Per-cluster timestamp clocks.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{ChaosError, ChaosResult};
use crate::types::{now_ms, ClusterTag, Timestamp};

/// Number of logical counter bits below the millisecond part.
pub const COUNTER_BITS: u32 = 20;

/// Converts wall time to the timestamp lower bound of that millisecond.
pub fn timestamp_from_ms(ms: u64) -> Timestamp {
    Timestamp::new(ms << COUNTER_BITS)
}

/// Converts a timestamp back to its wall time in milliseconds.
pub fn ms_from_timestamp(timestamp: Timestamp) -> u64 {
    timestamp.as_u64() >> COUNTER_BITS
}

/// A strictly monotonic timestamp source for one cluster.
#[derive(Debug)]
pub struct Clock {
    cluster_tag: ClusterTag,
    last: Mutex<u64>,
}

impl Clock {
    /// Creates a clock for `cluster_tag`.
    pub fn new(cluster_tag: ClusterTag) -> Self {
        Self {
            cluster_tag,
            last: Mutex::new(0),
        }
    }

    /// Cluster tag the clock belongs to.
    pub fn cluster_tag(&self) -> ClusterTag {
        self.cluster_tag
    }

    /// Generates a fresh timestamp, strictly greater than every earlier one.
    pub fn generate(&self) -> Timestamp {
        let mut last = self.last.lock();
        let physical = timestamp_from_ms(now_ms()).as_u64();
        let next = physical.max(*last + 1);
        *last = next;
        Timestamp::new(next)
    }

    /// Latest timestamp handed out, `NULL` if none.
    pub fn latest(&self) -> Timestamp {
        Timestamp::new(*self.last.lock())
    }
}

/// Clocks of every known cluster.
#[derive(Debug, Default)]
pub struct ClockRegistry {
    clocks: Mutex<BTreeMap<ClusterTag, Arc<Clock>>>,
}

impl ClockRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the clock for `tag`, creating it on first use.
    pub fn get_or_create(&self, tag: ClusterTag) -> Arc<Clock> {
        self.clocks
            .lock()
            .entry(tag)
            .or_insert_with(|| Arc::new(Clock::new(tag)))
            .clone()
    }

    /// Returns the clock for `tag`.
    pub fn get(&self, tag: ClusterTag) -> ChaosResult<Arc<Clock>> {
        self.clocks
            .lock()
            .get(&tag)
            .cloned()
            .ok_or_else(|| ChaosError::no_such("clock", tag.to_string()))
    }
}
