//! JSON views of replication cards for operators.

use serde::Serialize;

use chaos_meta::card::{ReplicaInfo, ReplicationCard};
use chaos_meta::types::{Era, ReplicaId};

/// One replica as shown to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaSummary {
    /// Replica id.
    pub replica_id: String,
    /// Hosting cluster.
    pub cluster_name: String,
    /// Replica table path.
    pub replica_path: String,
    /// `data` or `queue`.
    pub content_type: String,
    /// Current mode.
    pub mode: String,
    /// Current state.
    pub state: String,
    /// Lowest timestamp the replica reported over its key range.
    pub min_progress_timestamp: u64,
    /// Number of history items.
    pub history_len: usize,
}

impl ReplicaSummary {
    fn new(replica_id: ReplicaId, info: &ReplicaInfo) -> Self {
        Self {
            replica_id: replica_id.to_string(),
            cluster_name: info.cluster_name.clone(),
            replica_path: info.replica_path.clone(),
            content_type: format!("{:?}", info.content_type).to_lowercase(),
            mode: info.mode.to_string(),
            state: info.state.to_string(),
            min_progress_timestamp: info.replication_progress.min_timestamp().as_u64(),
            history_len: info.history.len(),
        }
    }
}

/// A replication card as shown to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CardSummary {
    /// Card id.
    pub card_id: String,
    /// Current era.
    pub era: Era,
    /// Latest propagated timestamp.
    pub current_timestamp: u64,
    /// Cells holding a shortcut.
    pub coordinator_cell_ids: Vec<String>,
    /// Table the card was created for.
    pub table_path: String,
    /// Collocation, if any.
    pub collocation_id: Option<String>,
    /// Replicas ordered by id.
    pub replicas: Vec<ReplicaSummary>,
}

impl From<&ReplicationCard> for CardSummary {
    fn from(card: &ReplicationCard) -> Self {
        Self {
            card_id: card.id.to_string(),
            era: card.era,
            current_timestamp: card.current_timestamp.as_u64(),
            coordinator_cell_ids: card.coordinator_cell_ids.iter().map(|c| c.to_string()).collect(),
            table_path: card.table_path.clone(),
            collocation_id: card.collocation_id.map(|c| c.to_string()),
            replicas: card
                .replicas
                .iter()
                .map(|(id, info)| ReplicaSummary::new(*id, info))
                .collect(),
        }
    }
}
