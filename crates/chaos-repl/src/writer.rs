//! Committing writes to every replica of a card's fanout.
//!
//! A write resolves every replica that receives writes at the card's era,
//! locks them in a global order, validates each one (era, clock, lock
//! conflicts, direct-write readiness), takes a commit timestamp from a
//! coordinator cell and applies the rows everywhere before unlocking.
//! Validation failures abort before any replica changes.

use std::sync::Arc;

use chaos_meta::card::ReplicationCard;
use chaos_meta::directory::Directory;
use chaos_meta::error::{ChaosError, ChaosResult};
use chaos_meta::types::{CardId, ClusterTag, ReplicaContentType, ReplicaId, Timestamp};
use tracing::{debug, info};

use crate::row::RowChange;
use crate::table::ReplicaTable;
use crate::transport::ReplicaTransport;

/// A batch of row changes committed atomically.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRequest {
    /// Card of the written table.
    pub card_id: CardId,
    /// Start timestamp of the transaction.
    pub start_timestamp: Timestamp,
    /// Cluster tag of the clock that issued the start timestamp.
    pub clock_cluster_tag: ClusterTag,
    /// Changes in submission order.
    pub changes: Vec<RowChange>,
    /// Replica the caller addressed directly, if any.
    pub direct_replica: Option<ReplicaId>,
}

#[derive(Clone, Debug)]
struct Participant {
    replica_id: ReplicaId,
    cluster_name: String,
    replica_path: String,
}

/// Commits writes into the fanout of a card.
#[derive(Debug, Clone)]
pub struct FanoutWriter {
    directory: Arc<Directory>,
    transport: Arc<dyn ReplicaTransport>,
}

impl FanoutWriter {
    /// Creates a writer.
    pub fn new(directory: Arc<Directory>, transport: Arc<dyn ReplicaTransport>) -> Self {
        Self {
            directory,
            transport,
        }
    }

    /// Commits `request` against `card` and returns the commit timestamp.
    pub async fn commit(&self, card: &ReplicationCard, request: &WriteRequest) -> ChaosResult<Timestamp> {
        if card.id != request.card_id {
            return Err(ChaosError::validation(format!(
                "write for card {} resolved card {}",
                request.card_id, card.id
            )));
        }
        if !card.is_writable() {
            return Err(ChaosError::NotWritable { card_id: card.id });
        }

        let mut participants: Vec<Participant> = card
            .fanout_replicas()
            .map(|(id, info)| Participant {
                replica_id: *id,
                cluster_name: info.cluster_name.clone(),
                replica_path: info.replica_path.clone(),
            })
            .collect();
        participants.sort_by(|a, b| {
            (&a.cluster_name, &a.replica_path).cmp(&(&b.cluster_name, &b.replica_path))
        });

        if let Some(direct) = request.direct_replica {
            if !participants.iter().any(|p| p.replica_id == direct) {
                return Err(ChaosError::ReplicaNotWritable {
                    replica_id: direct,
                    reason: "replica does not receive writes at this era".into(),
                });
            }
        }

        let mut tables = Vec::with_capacity(participants.len());
        for participant in &participants {
            let table = self
                .transport
                .prepare(&participant.cluster_name, &participant.replica_path, card.era)
                .await?;
            if table.replica_id() != participant.replica_id {
                return Err(ChaosError::UpstreamReplicaMismatch {
                    expected: Some(table.replica_id()),
                    actual: participant.replica_id,
                });
            }
            tables.push(table);
        }

        let timestamp = self.commit_locked(card, request, &tables)?;
        info!(
            card_id = %card.id,
            era = card.era,
            %timestamp,
            rows = request.changes.len(),
            replicas = tables.len(),
            "committed write"
        );
        Ok(timestamp)
    }

    fn commit_locked(
        &self,
        card: &ReplicationCard,
        request: &WriteRequest,
        tables: &[Arc<ReplicaTable>],
    ) -> ChaosResult<Timestamp> {
        let mut guards: Vec<_> = tables.iter().map(|t| t.lock()).collect();

        for (table, state) in tables.iter().zip(guards.iter()) {
            let direct = request.direct_replica == Some(table.replica_id());
            table.check_commit(
                state,
                card.era,
                request.clock_cluster_tag,
                request.start_timestamp,
                &request.changes,
                direct,
            )?;
        }

        let timestamp = self.generate_commit_timestamp(card)?;

        for (table, state) in tables.iter().zip(guards.iter_mut()) {
            table.apply_committed(state, timestamp, &request.changes);
            debug!(
                cluster = %table.cluster_name(),
                path = %table.path(),
                queue = table.content_type() == ReplicaContentType::Queue,
                %timestamp,
                "applied write"
            );
        }
        Ok(timestamp)
    }

    fn generate_commit_timestamp(&self, card: &ReplicationCard) -> ChaosResult<Timestamp> {
        let mut last_error = None;
        for cell_id in &card.coordinator_cell_ids {
            let attempt = self
                .directory
                .cell(*cell_id)
                .and_then(|cell| cell.generate_commit_timestamp(card.id, card.era));
            match attempt {
                Ok(timestamp) => return Ok(timestamp),
                Err(e) => {
                    debug!(card_id = %card.id, %cell_id, error = %e, "coordinator refused commit timestamp");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(ChaosError::NoCoordinator { card_id: card.id }))
    }
}
