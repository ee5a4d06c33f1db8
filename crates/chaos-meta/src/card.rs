//! Replication card data model.
//!
//! A [`ReplicationCard`] is the replicated content of a card: the part that
//! migrates between cells and that clients, pullers and the tracker read.
//! Cell-local bookkeeping (card state, migration pointers, shortcut states)
//! lives in [`crate::store::CardRecord`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{ChaosError, ChaosResult};
use crate::progress::ReplicationProgress;
use crate::types::{
    CardId, CellId, CollocationId, Era, ReplicaContentType, ReplicaId, ReplicaMode, ReplicaState,
    TableId, Timestamp,
};

/// Upper bound on replicas per card.
pub const MAX_REPLICAS_PER_CARD: usize = 128;

/// One entry of a replica's history: the replica's mode and state starting
/// at `timestamp`, as decided at era `era`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaHistoryItem {
    /// Era that recorded the item.
    pub era: Era,
    /// Barrier timestamp from which the item applies.
    pub timestamp: Timestamp,
    /// Mode from `timestamp` on.
    pub mode: ReplicaMode,
    /// State from `timestamp` on.
    pub state: ReplicaState,
}

impl ReplicaHistoryItem {
    /// Whether the replica received every write while this item applied.
    pub fn is_sync_like(&self) -> bool {
        self.mode.receives_writes() && self.state == ReplicaState::Enabled
    }
}

/// A replica of a replicated table as recorded in the card.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    /// Cluster hosting the replica table.
    pub cluster_name: String,
    /// Path of the replica table on its cluster.
    pub replica_path: String,
    /// Data or queue.
    pub content_type: ReplicaContentType,
    /// Requested mode (may be transitional).
    pub mode: ReplicaMode,
    /// Requested state (may be transitional).
    pub state: ReplicaState,
    /// Replication progress last reported by the replica.
    pub replication_progress: ReplicationProgress,
    /// Mode/state history, eras strictly increasing.
    pub history: Vec<ReplicaHistoryItem>,
    /// Whether the tracker may change this replica's mode.
    pub enable_replicated_table_tracker: bool,
}

impl ReplicaInfo {
    /// Index of the history item in effect at `timestamp`.
    pub fn find_history_item_index(&self, timestamp: Timestamp) -> Option<usize> {
        let index = self
            .history
            .partition_point(|item| item.timestamp <= timestamp);
        index.checked_sub(1)
    }

    /// History item in effect at `timestamp`.
    pub fn history_item_at(&self, timestamp: Timestamp) -> Option<&ReplicaHistoryItem> {
        self.find_history_item_index(timestamp)
            .map(|index| &self.history[index])
    }

    /// Most recent history item.
    pub fn last_history_item(&self) -> Option<&ReplicaHistoryItem> {
        self.history.last()
    }

    /// Mode and state in effect at the card's current era.
    pub fn effective(&self) -> Option<(ReplicaMode, ReplicaState)> {
        self.last_history_item().map(|item| (item.mode, item.state))
    }

    /// Whether writes are currently fanned out to this replica.
    pub fn is_in_fanout(&self) -> bool {
        self.last_history_item()
            .map(|item| item.is_sync_like())
            .unwrap_or(false)
    }

    /// Whether the replica is a sync enabled data replica at this era.
    pub fn is_sync_data(&self) -> bool {
        self.content_type == ReplicaContentType::Data
            && self.effective() == Some((ReplicaMode::Sync, ReplicaState::Enabled))
    }

    /// Whether the replica is a sync enabled queue replica at this era.
    pub fn is_sync_queue(&self) -> bool {
        self.content_type == ReplicaContentType::Queue
            && self.effective() == Some((ReplicaMode::Sync, ReplicaState::Enabled))
    }

    /// Whether the replica is enabled at this era.
    pub fn is_enabled(&self) -> bool {
        matches!(self.effective(), Some((_, ReplicaState::Enabled)))
    }

    /// Start of the trailing run of history items during which the replica
    /// received every write, or `None` if it does not receive writes now.
    pub fn sync_since(&self) -> Option<Timestamp> {
        let mut since = None;
        for item in self.history.iter().rev() {
            if !item.is_sync_like() {
                break;
            }
            since = Some(item.timestamp);
        }
        since
    }

    /// Timestamp of the first history item after `index` during which the
    /// replica stopped receiving every write.
    pub fn sync_until(&self, index: usize) -> Option<Timestamp> {
        self.history
            .iter()
            .skip(index + 1)
            .find(|item| !item.is_sync_like())
            .map(|item| item.timestamp)
    }

    /// Whether a mode or state transition is pending.
    pub fn is_transitioning(&self) -> bool {
        !self.mode.is_stable() || !self.state.is_stable()
    }
}

impl fmt::Display for ReplicaInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} ({:?}, {}, {}, progress {})",
            self.cluster_name,
            self.replica_path,
            self.content_type,
            self.mode,
            self.state,
            self.replication_progress
        )
    }
}

/// Per-card options read by the replicated table tracker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicatedTableOptions {
    /// Whether the tracker manages this card.
    pub enable_replicated_table_tracker: bool,
    /// Minimum number of sync data replicas (defaults to the maximum).
    pub min_sync_replica_count: Option<usize>,
    /// Maximum number of sync data replicas (defaults to the minimum, or one).
    pub max_sync_replica_count: Option<usize>,
    /// How long a bundle health answer stays fresh.
    pub tablet_cell_bundle_name_ttl_ms: u64,
    /// How long a failed bundle health probe is remembered.
    pub tablet_cell_bundle_name_failure_interval_ms: u64,
    /// Clusters whose replicas must never be sync.
    pub banned_replica_clusters: BTreeSet<String>,
}

impl Default for ReplicatedTableOptions {
    fn default() -> Self {
        Self {
            enable_replicated_table_tracker: false,
            min_sync_replica_count: None,
            max_sync_replica_count: None,
            tablet_cell_bundle_name_ttl_ms: 10_000,
            tablet_cell_bundle_name_failure_interval_ms: 60_000,
            banned_replica_clusters: BTreeSet::new(),
        }
    }
}

impl ReplicatedTableOptions {
    /// Effective maximum sync replica count.
    pub fn max_sync_replicas(&self) -> usize {
        self.max_sync_replica_count
            .unwrap_or_else(|| self.min_sync_replica_count.unwrap_or(1).max(1))
    }

    /// Effective minimum sync replica count, never above the maximum.
    pub fn min_sync_replicas(&self) -> usize {
        let max = self.max_sync_replicas();
        self.min_sync_replica_count.unwrap_or(max).min(max)
    }
}

/// Replicated content of a replication card.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationCard {
    /// Card id.
    pub id: CardId,
    /// Current era.
    pub era: Era,
    /// Replicas keyed by id.
    pub replicas: BTreeMap<ReplicaId, ReplicaInfo>,
    /// Cells currently holding a granted shortcut for this card.
    pub coordinator_cell_ids: Vec<CellId>,
    /// Id of the replicated table object.
    pub table_id: Option<TableId>,
    /// Path of the replicated table object.
    pub table_path: String,
    /// Cluster of the replicated table object.
    pub table_cluster_name: String,
    /// Collocation the card belongs to.
    pub collocation_id: Option<CollocationId>,
    /// Tracker options.
    pub replicated_table_options: ReplicatedTableOptions,
    /// Latest timestamp published by the coordinator.
    pub current_timestamp: Timestamp,
}

impl ReplicationCard {
    /// Looks up a replica.
    pub fn replica(&self, replica_id: ReplicaId) -> ChaosResult<&ReplicaInfo> {
        self.replicas
            .get(&replica_id)
            .ok_or(ChaosError::NoSuchReplica {
                card_id: self.id,
                replica_id,
            })
    }

    /// Looks up a replica for mutation.
    pub fn replica_mut(&mut self, replica_id: ReplicaId) -> ChaosResult<&mut ReplicaInfo> {
        let card_id = self.id;
        self.replicas
            .get_mut(&replica_id)
            .ok_or(ChaosError::NoSuchReplica {
                card_id,
                replica_id,
            })
    }

    /// Finds a replica by cluster and path.
    pub fn find_replica(&self, cluster_name: &str, replica_path: &str) -> Option<ReplicaId> {
        self.replicas
            .iter()
            .find(|(_, r)| r.cluster_name == cluster_name && r.replica_path == replica_path)
            .map(|(id, _)| *id)
    }

    /// Whether the card has a sync enabled queue at the current era.
    pub fn is_writable(&self) -> bool {
        self.replicas
            .values()
            .any(|r| r.content_type == ReplicaContentType::Queue && r.is_in_fanout())
    }

    /// Replicas receiving writes at the current era.
    pub fn fanout_replicas(&self) -> impl Iterator<Item = (&ReplicaId, &ReplicaInfo)> {
        self.replicas.iter().filter(|(_, r)| r.is_in_fanout())
    }

    /// Sync enabled data replicas at the current era.
    pub fn sync_data_replicas(&self) -> impl Iterator<Item = (&ReplicaId, &ReplicaInfo)> {
        self.replicas.iter().filter(|(_, r)| r.is_sync_data())
    }

    /// Pointwise minimum progress of every replica that has history.
    pub fn minimal_progress(&self) -> Option<ReplicationProgress> {
        ReplicationProgress::gather_min_all(
            self.replicas
                .values()
                .filter(|r| !r.history.is_empty())
                .map(|r| &r.replication_progress),
        )
    }

    /// Whether some replica has a pending mode or state transition.
    pub fn has_transitioning_replicas(&self) -> bool {
        self.replicas.values().any(|r| r.is_transitioning())
    }
}

impl fmt::Display for ReplicationCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "card {} era {} ({} replicas, current timestamp {})",
            self.id,
            self.era,
            self.replicas.len(),
            self.current_timestamp
        )
    }
}

/// Which parts of a card a reader wants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardFetchOptions {
    /// Include replica progress.
    pub include_progress: bool,
    /// Include replica history.
    pub include_history: bool,
    /// Include coordinator cells.
    pub include_coordinators: bool,
}

impl CardFetchOptions {
    /// Everything.
    pub fn all() -> Self {
        Self {
            include_progress: true,
            include_history: true,
            include_coordinators: true,
        }
    }

    /// Strips the parts of `card` that were not requested.
    pub fn apply(&self, mut card: ReplicationCard) -> ReplicationCard {
        for replica in card.replicas.values_mut() {
            if !self.include_progress {
                replica.replication_progress = ReplicationProgress::full(Timestamp::NULL);
            }
            if !self.include_history {
                replica.history.clear();
            }
        }
        if !self.include_coordinators {
            card.coordinator_cell_ids.clear();
        }
        card
    }
}

impl Default for CardFetchOptions {
    fn default() -> Self {
        Self::all()
    }
}

/// Attributes of a new card.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardAttributes {
    /// Id of the replicated table object.
    pub table_id: Option<TableId>,
    /// Path of the replicated table object.
    pub table_path: String,
    /// Cluster of the replicated table object.
    pub table_cluster_name: String,
    /// Tracker options.
    pub replicated_table_options: ReplicatedTableOptions,
    /// Collocation to join.
    pub collocation_id: Option<CollocationId>,
}

/// Patch applied by `alter_card`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardPatch {
    /// New tracker options.
    pub replicated_table_options: Option<ReplicatedTableOptions>,
    /// Toggles the tracker without replacing the other options.
    pub enable_replicated_table_tracker: Option<bool>,
    /// `Some(Some(id))` attaches, `Some(None)` detaches.
    pub collocation_id: Option<Option<CollocationId>>,
}

/// Specification of a new replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSpec {
    /// Cluster hosting the replica.
    pub cluster_name: String,
    /// Replica table path.
    pub replica_path: String,
    /// Data or queue.
    pub content_type: ReplicaContentType,
    /// Initial (stable) mode.
    pub mode: ReplicaMode,
    /// Whether to enable the replica right away.
    pub enabled: bool,
    /// Whether the replica must catch up on earlier writes.
    pub catchup: bool,
    /// Explicit starting progress (requires `catchup`).
    pub replication_progress: Option<ReplicationProgress>,
    /// Whether the tracker may manage the replica.
    pub enable_replicated_table_tracker: bool,
}

impl ReplicaSpec {
    /// Spec with catch-up on, tracker on and no explicit progress.
    pub fn new(
        cluster_name: impl Into<String>,
        replica_path: impl Into<String>,
        content_type: ReplicaContentType,
        mode: ReplicaMode,
        enabled: bool,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            replica_path: replica_path.into(),
            content_type,
            mode,
            enabled,
            catchup: true,
            replication_progress: None,
            enable_replicated_table_tracker: true,
        }
    }

    /// Sets the catch-up policy.
    pub fn with_catchup(mut self, catchup: bool) -> Self {
        self.catchup = catchup;
        self
    }

    /// Sets an explicit starting progress.
    pub fn with_progress(mut self, progress: ReplicationProgress) -> Self {
        self.replication_progress = Some(progress);
        self
    }
}

/// Patch applied by `alter_replica`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaPatch {
    /// Target stable mode.
    pub mode: Option<ReplicaMode>,
    /// Enable or disable.
    pub enabled: Option<bool>,
    /// Tracker flag.
    pub enable_replicated_table_tracker: Option<bool>,
    /// Catch up on enable; `false` skips to the card's current timestamp.
    pub catchup: Option<bool>,
}

impl ReplicaPatch {
    /// Patch changing the mode only.
    pub fn mode(mode: ReplicaMode) -> Self {
        Self {
            mode: Some(mode),
            ..Default::default()
        }
    }

    /// Patch changing the enabled flag only.
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ObjectId, ObjectType};

    fn card_id() -> CardId {
        CardId::from_object(ObjectId::new(ObjectType::ReplicationCard, 1, 0x5555_0000, 3)).unwrap()
    }

    fn item(era: Era, ts: u64, mode: ReplicaMode, state: ReplicaState) -> ReplicaHistoryItem {
        ReplicaHistoryItem {
            era,
            timestamp: Timestamp::new(ts),
            mode,
            state,
        }
    }

    fn replica(content_type: ReplicaContentType, history: Vec<ReplicaHistoryItem>) -> ReplicaInfo {
        let (mode, state) = history
            .last()
            .map(|i| (i.mode, i.state))
            .unwrap_or((ReplicaMode::Async, ReplicaState::Disabled));
        ReplicaInfo {
            cluster_name: "primary".into(),
            replica_path: "//t".into(),
            content_type,
            mode,
            state,
            replication_progress: ReplicationProgress::full(Timestamp::MIN),
            history,
            enable_replicated_table_tracker: true,
        }
    }

    mod history {
        use super::*;

        #[test]
        fn test_find_history_item_index() {
            let r = replica(
                ReplicaContentType::Queue,
                vec![
                    item(0, 1, ReplicaMode::Sync, ReplicaState::Enabled),
                    item(1, 100, ReplicaMode::Async, ReplicaState::Enabled),
                ],
            );
            assert_eq!(r.find_history_item_index(Timestamp::NULL), None);
            assert_eq!(r.find_history_item_index(Timestamp::new(50)), Some(0));
            assert_eq!(r.find_history_item_index(Timestamp::new(100)), Some(1));
            assert_eq!(r.find_history_item_index(Timestamp::MAX), Some(1));
        }

        #[test]
        fn test_sync_since_and_until() {
            let r = replica(
                ReplicaContentType::Queue,
                vec![
                    item(0, 1, ReplicaMode::Async, ReplicaState::Enabled),
                    item(1, 10, ReplicaMode::AsyncToSync, ReplicaState::Enabled),
                    item(2, 20, ReplicaMode::Sync, ReplicaState::Enabled),
                ],
            );
            assert_eq!(r.sync_since(), Some(Timestamp::new(10)));
            assert!(r.is_in_fanout());
            assert_eq!(r.sync_until(1), None);

            let downgraded = replica(
                ReplicaContentType::Queue,
                vec![
                    item(0, 1, ReplicaMode::Sync, ReplicaState::Enabled),
                    item(1, 30, ReplicaMode::SyncToAsync, ReplicaState::Enabled),
                ],
            );
            assert_eq!(downgraded.sync_since(), None);
            assert_eq!(downgraded.sync_until(0), Some(Timestamp::new(30)));
        }

        #[test]
        fn test_effective_mode() {
            let r = replica(
                ReplicaContentType::Data,
                vec![item(0, 1, ReplicaMode::Sync, ReplicaState::Enabled)],
            );
            assert!(r.is_sync_data());
            assert!(!r.is_sync_queue());
            let empty = replica(ReplicaContentType::Data, vec![]);
            assert!(!empty.is_enabled());
            assert_eq!(empty.sync_since(), None);
        }
    }

    mod card {
        use super::*;

        fn card_with(replicas: Vec<ReplicaInfo>) -> ReplicationCard {
            let id = card_id();
            ReplicationCard {
                id,
                era: 1,
                replicas: replicas
                    .into_iter()
                    .enumerate()
                    .map(|(i, r)| (ReplicaId::for_card(id, i as u16), r))
                    .collect(),
                coordinator_cell_ids: vec![],
                table_id: None,
                table_path: "//t".into(),
                table_cluster_name: "primary".into(),
                collocation_id: None,
                replicated_table_options: ReplicatedTableOptions::default(),
                current_timestamp: Timestamp::new(5),
            }
        }

        #[test]
        fn test_writable_requires_sync_queue() {
            let data = replica(
                ReplicaContentType::Data,
                vec![item(0, 1, ReplicaMode::Sync, ReplicaState::Enabled)],
            );
            let queue = replica(
                ReplicaContentType::Queue,
                vec![item(0, 1, ReplicaMode::Sync, ReplicaState::Enabled)],
            );
            assert!(!card_with(vec![data.clone()]).is_writable());
            assert!(card_with(vec![data, queue]).is_writable());
        }

        #[test]
        fn test_missing_replica() {
            let card = card_with(vec![]);
            let err = card.replica(ReplicaId::for_card(card.id, 9)).unwrap_err();
            assert!(matches!(err, ChaosError::NoSuchReplica { .. }));
        }

        #[test]
        fn test_fetch_options_strip() {
            let card = card_with(vec![replica(
                ReplicaContentType::Queue,
                vec![item(0, 1, ReplicaMode::Sync, ReplicaState::Enabled)],
            )]);
            let options = CardFetchOptions {
                include_progress: true,
                include_history: false,
                include_coordinators: false,
            };
            let stripped = options.apply(card);
            assert!(stripped.replicas.values().all(|r| r.history.is_empty()));
        }
    }

    #[test]
    fn test_sync_count_defaults() {
        let mut options = ReplicatedTableOptions::default();
        assert_eq!(options.max_sync_replicas(), 1);
        assert_eq!(options.min_sync_replicas(), 1);
        options.max_sync_replica_count = Some(3);
        assert_eq!(options.min_sync_replicas(), 3);
        options.min_sync_replica_count = Some(5);
        assert_eq!(options.min_sync_replicas(), 3);

        let options = ReplicatedTableOptions {
            min_sync_replica_count: Some(2),
            ..Default::default()
        };
        assert_eq!(options.max_sync_replicas(), 2);
        assert_eq!(options.min_sync_replicas(), 2);
    }
}
