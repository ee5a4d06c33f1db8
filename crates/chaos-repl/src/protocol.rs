//! Request and response messages exchanged between tablet nodes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use chaos_meta::progress::ReplicationProgress;
use chaos_meta::types::{Era, ReplicaId, Timestamp};

use crate::row::ReplicatedRow;
use crate::schema::TableSchema;

/// Asks a queue replica for committed rows the caller has not seen yet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRowsRequest {
    /// Path of the queue replica table on the serving cluster.
    pub replica_path: String,
    /// Replica id the caller expects the queue to be bound to.
    pub upstream_replica_id: ReplicaId,
    /// Era of the caller's card.
    pub era: Era,
    /// Caller's progress; only rows above it are returned.
    pub progress: ReplicationProgress,
    /// Rows above this timestamp are not returned.
    pub upper_timestamp: Option<Timestamp>,
    /// Return rows merged across tablets in commit timestamp order.
    pub order_by_timestamp: bool,
    /// Soft cap on returned rows; rows sharing a timestamp are never split.
    pub row_limit: usize,
}

/// Rows served by a queue replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRowsResponse {
    /// Committed rows, in log order per tablet or by timestamp.
    pub rows: Vec<ReplicatedRow>,
    /// Progress the caller reaches once the rows are applied.
    pub progress: ReplicationProgress,
    /// Per served tablet, the row index after the last consumed row.
    pub end_row_indexes: BTreeMap<usize, u64>,
    /// Schema of the serving table.
    pub schema: TableSchema,
}

impl PullRowsResponse {
    /// Encodes the response for the wire.
    pub fn encode(&self) -> chaos_meta::ChaosResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes a response produced by [`PullRowsResponse::encode`].
    pub fn decode(bytes: &[u8]) -> chaos_meta::ChaosResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
