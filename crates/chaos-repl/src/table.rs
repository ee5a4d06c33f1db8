//! Replica tables hosted by a tablet node.
//!
//! A [`ReplicaTable`] is one replica of a chaos replicated table: a set of
//! tablets, the replica's replication progress and the node's view of the
//! replication card. Every mutation (committed writes, pulled rows,
//! progress advances, trimming) happens under the table mutex, so readers
//! never observe rows without the matching progress or vice versa.

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chaos_meta::card::{ReplicaInfo, ReplicationCard};
use chaos_meta::error::{ChaosError, ChaosResult};
use chaos_meta::key::{Key, KeyRange};
use chaos_meta::progress::ReplicationProgress;
use chaos_meta::types::{
    now_ms, CardId, ClusterTag, Era, ReplicaContentType, ReplicaId, Timestamp, INITIAL_ERA,
};
use tracing::{debug, info};

use crate::protocol::{PullRowsRequest, PullRowsResponse};
use crate::row::{ReplicatedRow, Row, RowChange};
use crate::schema::TableSchema;
use crate::storage::{LogRecord, LogStore, SortedStore};

/// Snapshot format version.
pub const TABLE_SNAPSHOT_VERSION: u32 = 1;

/// How the key space is split into tablets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletLayout {
    /// Sorted tablets bounded by pivot keys; the first tablet starts at the
    /// empty key.
    Sorted {
        /// Lower keys of every tablet but the first, increasing.
        pivot_keys: Vec<Key>,
    },
    /// Ordered tablets addressed by index.
    Ordered {
        /// Number of tablets.
        tablet_count: usize,
    },
}

/// What a replica table looks like.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    /// Table path on its cluster.
    pub path: String,
    /// Table schema.
    pub schema: TableSchema,
    /// Data or queue.
    pub content_type: ReplicaContentType,
    /// Replica id the table is bound to.
    pub replica_id: ReplicaId,
    /// Tablet layout.
    pub layout: TabletLayout,
}

impl TableSpec {
    /// Single-tablet table.
    pub fn new(
        path: impl Into<String>,
        schema: TableSchema,
        content_type: ReplicaContentType,
        replica_id: ReplicaId,
    ) -> Self {
        let layout = if schema.is_sorted() {
            TabletLayout::Sorted {
                pivot_keys: Vec::new(),
            }
        } else {
            TabletLayout::Ordered { tablet_count: 1 }
        };
        Self {
            path: path.into(),
            schema,
            content_type,
            replica_id,
            layout,
        }
    }

    /// Splits a sorted table at `pivot_keys`.
    pub fn with_pivot_keys(mut self, pivot_keys: Vec<Key>) -> Self {
        self.layout = TabletLayout::Sorted { pivot_keys };
        self
    }

    /// Gives an ordered table `tablet_count` tablets.
    pub fn with_tablet_count(mut self, tablet_count: usize) -> Self {
        self.layout = TabletLayout::Ordered { tablet_count };
        self
    }

    fn tablet_ranges(&self) -> ChaosResult<Vec<KeyRange>> {
        let lowers = match (&self.layout, self.schema.is_sorted()) {
            (TabletLayout::Sorted { pivot_keys }, true) => {
                let mut lowers = vec![Key::empty()];
                for pivot in pivot_keys {
                    let previous = lowers.last().cloned().unwrap_or_default();
                    if *pivot <= previous {
                        return Err(ChaosError::validation(format!(
                            "pivot keys of table {:?} are not increasing at {}",
                            self.path, pivot
                        )));
                    }
                    lowers.push(pivot.clone());
                }
                lowers
            }
            (TabletLayout::Ordered { tablet_count }, false) => {
                if *tablet_count == 0 {
                    return Err(ChaosError::validation(format!(
                        "ordered table {:?} needs at least one tablet",
                        self.path
                    )));
                }
                (0..*tablet_count).map(Key::tablet).collect()
            }
            _ => {
                return Err(ChaosError::validation(format!(
                    "tablet layout of table {:?} does not match its schema",
                    self.path
                )))
            }
        };
        let uppers = lowers
            .iter()
            .skip(1)
            .cloned()
            .chain(std::iter::once(Key::max()));
        Ok(lowers
            .iter()
            .cloned()
            .zip(uppers)
            .map(|(lower, upper)| KeyRange::new(lower, upper))
            .collect())
    }

    fn uses_log_store(&self) -> bool {
        self.content_type == ReplicaContentType::Queue || !self.schema.is_sorted()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
enum TabletStore {
    Sorted(SortedStore),
    Log(LogStore),
}

/// One tablet of a replica table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tablet {
    index: usize,
    range: KeyRange,
    store: TabletStore,
}

impl Tablet {
    fn apply(&mut self, timestamp: Timestamp, change: &RowChange, schema: &TableSchema) {
        match &mut self.store {
            TabletStore::Sorted(store) => store.apply(timestamp, change, schema),
            TabletStore::Log(log) => {
                log.append(ReplicatedRow {
                    timestamp,
                    change: change.clone(),
                });
            }
        }
    }
}

/// Background activity that can fail without failing the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackgroundActivity {
    /// Pulling rows from a queue.
    Pull,
    /// Reporting progress to the card.
    ReportProgress,
}

impl fmt::Display for BackgroundActivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackgroundActivity::Pull => f.write_str("pull"),
            BackgroundActivity::ReportProgress => f.write_str("report_progress"),
        }
    }
}

/// A persistent background error, visible in tablet state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundError {
    /// Failing activity.
    pub activity: BackgroundActivity,
    /// Error message.
    pub message: String,
    /// Wall-clock time of the last occurrence.
    pub time_ms: u64,
}

/// Externally visible tablet state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TabletInfo {
    /// Tablet index.
    pub index: usize,
    /// Key range of the tablet.
    pub range: KeyRange,
    /// Rows ever appended (logs) or keys ever written (sorted).
    pub total_row_count: u64,
    /// Rows trimmed away.
    pub trimmed_row_count: u64,
    /// Replication progress restricted to the tablet.
    pub progress: ReplicationProgress,
    /// Background errors of the table.
    pub errors: Vec<BackgroundError>,
}

/// How a replica table accepts writes at the current era.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// Sync enabled data replica: writes land directly.
    Direct,
    /// Everything else: the table only receives fanned-out or pulled rows.
    Pull,
}

/// Mutable state of a replica table, guarded by the table mutex.
#[derive(Debug)]
pub struct TableState {
    card: Option<ReplicationCard>,
    tablets: Vec<Tablet>,
    progress: ReplicationProgress,
    errors: Vec<BackgroundError>,
}

impl TableState {
    fn tablet_for(&mut self, key: &Key) -> Option<&mut Tablet> {
        self.tablets.iter_mut().find(|t| t.range.contains(key))
    }

    fn era(&self) -> Era {
        self.card.as_ref().map(|c| c.era).unwrap_or(INITIAL_ERA)
    }
}

/// Serialized form of an unmounted table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableSnapshot {
    /// Format version.
    pub version: u32,
    /// Table spec.
    pub spec: TableSpec,
    /// Tablets with their rows.
    pub tablets: Vec<Tablet>,
    /// Replication progress.
    pub progress: ReplicationProgress,
    /// Last known card.
    pub card: Option<ReplicationCard>,
}

impl TableSnapshot {
    /// Encodes the snapshot.
    pub fn encode(&self) -> ChaosResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes a snapshot and checks its version.
    pub fn decode(bytes: &[u8]) -> ChaosResult<Self> {
        let snapshot: TableSnapshot = bincode::deserialize(bytes)?;
        if snapshot.version != TABLE_SNAPSHOT_VERSION {
            return Err(ChaosError::validation(format!(
                "unsupported table snapshot version {}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }
}

/// A replica table.
pub struct ReplicaTable {
    cluster_name: String,
    spec: TableSpec,
    trusted_clock_tag: Option<ClusterTag>,
    state: Mutex<TableState>,
}

impl fmt::Debug for ReplicaTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaTable")
            .field("cluster_name", &self.cluster_name)
            .field("path", &self.spec.path)
            .field("replica_id", &self.spec.replica_id)
            .finish()
    }
}

impl ReplicaTable {
    /// Creates an empty table. With `trusted_clock_tag` set, writes stamped
    /// by another clock are rejected.
    pub fn new(
        cluster_name: impl Into<String>,
        spec: TableSpec,
        trusted_clock_tag: Option<ClusterTag>,
    ) -> ChaosResult<Self> {
        let log = spec.uses_log_store();
        let tablets = spec
            .tablet_ranges()?
            .into_iter()
            .enumerate()
            .map(|(index, range)| Tablet {
                index,
                range,
                store: if log {
                    TabletStore::Log(LogStore::new())
                } else {
                    TabletStore::Sorted(SortedStore::new())
                },
            })
            .collect();
        Ok(Self {
            cluster_name: cluster_name.into(),
            spec,
            trusted_clock_tag,
            state: Mutex::new(TableState {
                card: None,
                tablets,
                progress: ReplicationProgress::full(Timestamp::NULL),
                errors: Vec::new(),
            }),
        })
    }

    /// Rebuilds a table from a snapshot.
    pub fn restore(
        cluster_name: impl Into<String>,
        snapshot: TableSnapshot,
        trusted_clock_tag: Option<ClusterTag>,
    ) -> ChaosResult<Self> {
        let expected = snapshot.spec.tablet_ranges()?;
        let actual: Vec<KeyRange> = snapshot.tablets.iter().map(|t| t.range.clone()).collect();
        if expected != actual {
            return Err(ChaosError::validation(format!(
                "snapshot of table {:?} does not match its tablet layout",
                snapshot.spec.path
            )));
        }
        Ok(Self {
            cluster_name: cluster_name.into(),
            spec: snapshot.spec,
            trusted_clock_tag,
            state: Mutex::new(TableState {
                card: snapshot.card,
                tablets: snapshot.tablets,
                progress: snapshot.progress,
                errors: Vec::new(),
            }),
        })
    }

    /// Captures the table for unmount.
    pub fn snapshot(&self) -> TableSnapshot {
        let state = self.state.lock();
        TableSnapshot {
            version: TABLE_SNAPSHOT_VERSION,
            spec: self.spec.clone(),
            tablets: state.tablets.clone(),
            progress: state.progress.clone(),
            card: state.card.clone(),
        }
    }

    /// Cluster hosting the table.
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Table path.
    pub fn path(&self) -> &str {
        &self.spec.path
    }

    /// Table spec.
    pub fn spec(&self) -> &TableSpec {
        &self.spec
    }

    /// Table schema.
    pub fn schema(&self) -> &TableSchema {
        &self.spec.schema
    }

    /// Data or queue.
    pub fn content_type(&self) -> ReplicaContentType {
        self.spec.content_type
    }

    /// Replica the table is bound to.
    pub fn replica_id(&self) -> ReplicaId {
        self.spec.replica_id
    }

    /// Card of the replica.
    pub fn card_id(&self) -> CardId {
        self.spec.replica_id.card_id()
    }

    /// Last card seen by the table.
    pub fn card(&self) -> Option<ReplicationCard> {
        self.state.lock().card.clone()
    }

    /// Era of the last card seen, if any.
    pub fn era(&self) -> Option<Era> {
        self.state.lock().card.as_ref().map(|c| c.era)
    }

    /// The table's replica as recorded in its card.
    pub fn replica_info(&self) -> Option<ReplicaInfo> {
        let state = self.state.lock();
        state
            .card
            .as_ref()
            .and_then(|c| c.replicas.get(&self.spec.replica_id).cloned())
    }

    /// Replication progress.
    pub fn progress(&self) -> ReplicationProgress {
        self.state.lock().progress.clone()
    }

    /// Installs a card fetched from the metadata plane. Older eras are
    /// ignored. Progress recorded in the card (for example a skip to the
    /// current timestamp on enable without catch-up) is adopted. Returns
    /// whether the era changed.
    pub fn refresh_card(&self, card: ReplicationCard) -> bool {
        let mut state = self.state.lock();
        let previous = state.card.as_ref().map(|c| c.era);
        if previous.map(|era| card.era < era).unwrap_or(false) {
            return false;
        }
        if let Some(info) = card.replicas.get(&self.spec.replica_id) {
            if !info.history.is_empty() {
                state.progress.update(&info.replication_progress);
            }
        }
        let era = card.era;
        state.card = Some(card);
        if previous != Some(era) {
            debug!(
                cluster = %self.cluster_name,
                path = %self.spec.path,
                era,
                "replica table observed new replication era"
            );
            return true;
        }
        false
    }

    /// Write mode at the current era.
    pub fn write_mode(&self) -> WriteMode {
        match self.replica_info() {
            Some(info) if info.is_sync_data() => WriteMode::Direct,
            _ => WriteMode::Pull,
        }
    }

    /// Tablet states.
    pub fn tablet_infos(&self) -> Vec<TabletInfo> {
        let state = self.state.lock();
        state
            .tablets
            .iter()
            .map(|tablet| {
                let (total, trimmed) = match &tablet.store {
                    TabletStore::Sorted(store) => (store.len() as u64, 0),
                    TabletStore::Log(log) => (log.total_row_count(), log.trimmed_row_count()),
                };
                TabletInfo {
                    index: tablet.index,
                    range: tablet.range.clone(),
                    total_row_count: total,
                    trimmed_row_count: trimmed,
                    progress: state
                        .progress
                        .slice(&tablet.range)
                        .unwrap_or_else(|| ReplicationProgress::over(&tablet.range, Timestamp::NULL)),
                    errors: state.errors.clone(),
                }
            })
            .collect()
    }

    /// Persistent background errors.
    pub fn background_errors(&self) -> Vec<BackgroundError> {
        self.state.lock().errors.clone()
    }

    /// Records (or refreshes) the error of a background activity.
    pub fn set_background_error(&self, activity: BackgroundActivity, error: &ChaosError) {
        let mut state = self.state.lock();
        let message = error.to_string();
        let time_ms = now_ms();
        match state.errors.iter_mut().find(|e| e.activity == activity) {
            Some(existing) => {
                existing.message = message;
                existing.time_ms = time_ms;
            }
            None => state.errors.push(BackgroundError {
                activity,
                message,
                time_ms,
            }),
        }
    }

    /// Clears the error of a background activity.
    pub fn clear_background_error(&self, activity: BackgroundActivity) {
        self.state.lock().errors.retain(|e| e.activity != activity);
    }

    /// Whether progress is at least `timestamp` at every key.
    pub fn progress_covers(&self, keys: &[Key], timestamp: Timestamp) -> bool {
        let state = self.state.lock();
        keys.iter().all(|key| {
            state
                .progress
                .timestamp_at(key)
                .map(|ts| ts >= timestamp)
                .unwrap_or(false)
        })
    }

    /// Reads rows of a sorted data table as of `timestamp`.
    pub fn lookup(&self, keys: &[Key], timestamp: Timestamp) -> ChaosResult<Vec<Option<Row>>> {
        let state = self.state.lock();
        keys.iter()
            .map(|key| {
                let tablet = state
                    .tablets
                    .iter()
                    .find(|t| t.range.contains(key))
                    .ok_or_else(|| ChaosError::validation(format!("key {} has no tablet", key)))?;
                match &tablet.store {
                    TabletStore::Sorted(store) => Ok(store.lookup(key, timestamp, &self.spec.schema)),
                    TabletStore::Log(_) => Err(ChaosError::validation(format!(
                        "table {:?} does not support lookups",
                        self.spec.path
                    ))),
                }
            })
            .collect()
    }

    /// Every visible row as of `timestamp`, tablet by tablet.
    pub fn select(&self, timestamp: Timestamp) -> Vec<Row> {
        let state = self.state.lock();
        let ordered_queue =
            self.spec.content_type == ReplicaContentType::Queue && !self.spec.schema.is_sorted();
        state
            .tablets
            .iter()
            .flat_map(|tablet| match &tablet.store {
                TabletStore::Sorted(store) => store.select(timestamp, &self.spec.schema),
                TabletStore::Log(log) => log.select(timestamp, ordered_queue),
            })
            .collect()
    }

    /// Serves a pull from this queue.
    ///
    /// Returns rows committed above the caller's progress and at or below
    /// both `upper_timestamp` and this queue's own progress, so the caller
    /// never advances past rows the queue has not received yet.
    ///
    /// Within a tablet, eligible rows go out in timestamp order whatever
    /// their log order. When `row_limit` is hit, the batch is closed at a
    /// timestamp boundary and the tablet's progress is capped at the last
    /// emitted timestamp; every eligible row at or below it was emitted.
    /// Tablets not visited keep the caller's progress. `end_row_indexes`
    /// holds, per tablet, the end of the longest log prefix the caller has
    /// now seen.
    pub fn serve_pull_rows(&self, request: &PullRowsRequest) -> ChaosResult<PullRowsResponse> {
        if self.spec.content_type != ReplicaContentType::Queue {
            return Err(ChaosError::validation(format!(
                "table {:?} is not a queue replica",
                self.spec.path
            )));
        }
        if request.upstream_replica_id != self.spec.replica_id {
            return Err(ChaosError::UpstreamReplicaMismatch {
                expected: Some(self.spec.replica_id),
                actual: request.upstream_replica_id,
            });
        }

        let state = self.state.lock();
        let era = state.era();
        if request.era != era {
            return Err(ChaosError::EraMismatch {
                expected: era,
                actual: request.era,
            });
        }

        let bound = request.upper_timestamp.unwrap_or(Timestamp::MAX);
        let mut progress = request.progress.clone();
        let mut rows = Vec::new();
        let mut end_row_indexes = BTreeMap::new();
        let mut budget = request.row_limit.max(1);

        for tablet in &state.tablets {
            if budget == 0 {
                break;
            }
            let (Some(requested), Some(own)) = (
                request.progress.slice(&tablet.range),
                state.progress.slice(&tablet.range),
            ) else {
                continue;
            };
            let TabletStore::Log(log) = &tablet.store else {
                continue;
            };

            // Pulled logs need not be in timestamp order.
            let mut eligible: Vec<&LogRecord> = Vec::new();
            let mut seen: BTreeSet<u64> = BTreeSet::new();
            for record in log.records() {
                let key = record.row.key();
                let (Some(from), Some(reach)) = (requested.timestamp_at(key), own.timestamp_at(key))
                else {
                    seen.insert(record.row_index);
                    continue;
                };
                let timestamp = record.row.timestamp;
                if timestamp <= from {
                    seen.insert(record.row_index);
                } else if timestamp <= bound.min(reach) {
                    eligible.push(record);
                }
            }
            eligible.sort_by_key(|record| record.row.timestamp);

            let mut emitted: Vec<ReplicatedRow> = Vec::new();
            let mut truncated_at = None;
            for record in eligible {
                if emitted.len() >= budget {
                    if let Some(last) = emitted.last().map(|r| r.timestamp) {
                        if record.row.timestamp != last {
                            truncated_at = Some(last);
                            break;
                        }
                    }
                }
                seen.insert(record.row_index);
                emitted.push(record.row.clone());
            }
            let end_index = log
                .records()
                .take_while(|record| seen.contains(&record.row_index))
                .last()
                .map(|record| record.row_index + 1)
                .unwrap_or_else(|| log.trimmed_row_count());

            let cap = bound.min(truncated_at.unwrap_or(Timestamp::MAX));
            let reached = own.gather_min(&ReplicationProgress::over(&tablet.range, cap));
            progress.update(&reached);
            end_row_indexes.insert(tablet.index, end_index);
            budget = budget.saturating_sub(emitted.len());
            if truncated_at.is_some() {
                budget = 0;
            }
            rows.extend(emitted);
        }

        if request.order_by_timestamp {
            rows.sort_by_key(|r| r.timestamp);
        }
        Ok(PullRowsResponse {
            rows,
            progress,
            end_row_indexes,
            schema: self.spec.schema.clone(),
        })
    }

    /// Applies pulled rows and the progress they reach in one step. The batch
    /// is dropped if the table moved to another era meanwhile.
    pub fn apply_pulled(
        &self,
        era: Era,
        rows: &[ReplicatedRow],
        progress: &ReplicationProgress,
    ) -> ChaosResult<()> {
        let mut state = self.state.lock();
        let current = state.era();
        if current != era {
            return Err(ChaosError::EraMismatch {
                expected: current,
                actual: era,
            });
        }
        let before = state.progress.clone();
        for row in rows {
            let from = before.timestamp_at(row.key()).unwrap_or(Timestamp::NULL);
            if row.timestamp <= from {
                continue;
            }
            if let Some(tablet) = state.tablet_for(row.key()) {
                tablet.apply(row.timestamp, &row.change, &self.spec.schema);
            }
        }
        state.progress.update(progress);
        Ok(())
    }

    /// Moves a caught-up sync replica's progress to the card's current
    /// timestamp. Returns the new minimum progress if it moved.
    pub fn advance_sync_progress(&self) -> Option<Timestamp> {
        let mut state = self.state.lock();
        let card = state.card.as_ref()?;
        let info = card.replicas.get(&self.spec.replica_id)?;
        let since = info.sync_since()?;
        let current = card.current_timestamp;
        if !state.progress.is_ge_timestamp(since) || state.progress.min_timestamp() >= current {
            return None;
        }
        state.progress.advance_all(current);
        Some(current)
    }

    /// Trims queue rows every other replica has already replicated.
    pub fn trim(&self, bound: &ReplicationProgress) -> usize {
        if self.spec.content_type != ReplicaContentType::Queue {
            return 0;
        }
        let mut state = self.state.lock();
        let mut trimmed = 0;
        for tablet in state.tablets.iter_mut() {
            if let TabletStore::Log(log) = &mut tablet.store {
                trimmed += log.trim_while(|row| {
                    bound
                        .timestamp_at(row.key())
                        .map(|replicated| row.timestamp <= replicated)
                        .unwrap_or(false)
                });
            }
        }
        if trimmed > 0 {
            info!(
                cluster = %self.cluster_name,
                path = %self.spec.path,
                trimmed,
                "trimmed replicated queue rows"
            );
        }
        trimmed
    }

    /// Locks the table for a commit.
    pub(crate) fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock()
    }

    /// Validates a commit participant under its lock.
    pub(crate) fn check_commit(
        &self,
        state: &TableState,
        era: Era,
        clock_cluster_tag: ClusterTag,
        start_timestamp: Timestamp,
        changes: &[RowChange],
        direct: bool,
    ) -> ChaosResult<()> {
        if let Some(trusted) = self.trusted_clock_tag {
            if trusted != clock_cluster_tag {
                return Err(ChaosError::ClockClusterTagMismatch {
                    expected: trusted,
                    actual: clock_cluster_tag,
                });
            }
        }

        let current = state.era();
        if current != era {
            return Err(ChaosError::EraMismatch {
                expected: current,
                actual: era,
            });
        }

        let info = state
            .card
            .as_ref()
            .and_then(|c| c.replicas.get(&self.spec.replica_id))
            .ok_or(ChaosError::NoSuchReplica {
                card_id: self.card_id(),
                replica_id: self.spec.replica_id,
            })?;
        if !info.is_in_fanout() {
            return Err(ChaosError::ReplicaNotWritable {
                replica_id: self.spec.replica_id,
                reason: "replica does not receive writes at this era".into(),
            });
        }
        if direct {
            if !info.is_sync_data() {
                return Err(ChaosError::ReplicaNotWritable {
                    replica_id: self.spec.replica_id,
                    reason: "replica is not a sync enabled data replica".into(),
                });
            }
            let since = info.sync_since().unwrap_or(Timestamp::MAX);
            let behind = changes.iter().any(|change| {
                state
                    .progress
                    .timestamp_at(change.key())
                    .map(|ts| ts < since)
                    .unwrap_or(true)
            });
            if behind {
                return Err(ChaosError::ReplicaNotWritable {
                    replica_id: self.spec.replica_id,
                    reason: format!("replica has not caught up to {}", since),
                });
            }
        }

        for change in changes {
            let Some(tablet) = state.tablets.iter().find(|t| t.range.contains(change.key())) else {
                continue;
            };
            let TabletStore::Sorted(store) = &tablet.store else {
                continue;
            };
            let groups = match change {
                RowChange::Write { values, .. } => values
                    .iter()
                    .map(|(column, _)| self.spec.schema.lock_group(column).to_string())
                    .collect(),
                RowChange::Delete { .. } => self.spec.schema.lock_groups(),
                RowChange::Lock { .. } => continue,
            };
            for group in groups {
                if store.last_lock_timestamp(change.key(), &group) > start_timestamp {
                    return Err(ChaosError::LockConflict {
                        key: change.key().to_string(),
                        lock_group: group,
                    });
                }
            }
        }
        Ok(())
    }

    /// Applies a committed transaction under the lock taken by [`Self::lock`].
    pub(crate) fn apply_committed(
        &self,
        state: &mut TableState,
        timestamp: Timestamp,
        changes: &[RowChange],
    ) {
        for change in changes {
            if let Some(tablet) = state.tablet_for(change.key()) {
                tablet.apply(timestamp, change, &self.spec.schema);
            }
        }
    }
}
