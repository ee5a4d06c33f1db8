//! Pulling rows from queue replicas.
//!
//! A replica that does not (or not yet) receive every write catches up by
//! pulling from a queue that did receive every write at the replica's
//! current progress. Rows and the progress they reach are applied in one
//! step; failures back off exponentially.

use parking_lot::Mutex;
use std::time::Instant;

use chaos_meta::card::ReplicationCard;
use chaos_meta::config::TabletNodeConfig;
use chaos_meta::error::ChaosResult;
use chaos_meta::types::{Era, ReplicaContentType, ReplicaId, Timestamp};
use tracing::{debug, warn};

use crate::protocol::PullRowsRequest;
use crate::retry::Backoff;
use crate::schema::check_replication_compatibility;
use crate::table::{BackgroundActivity, ReplicaTable};
use crate::transport::ReplicaTransport;

/// Queue chosen to pull from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PullSource {
    /// Replica id of the queue.
    pub replica_id: ReplicaId,
    /// Cluster hosting the queue.
    pub cluster_name: String,
    /// Path of the queue table.
    pub replica_path: String,
    /// End of the queue's sync period, if it ended.
    pub upper_timestamp: Option<Timestamp>,
}

/// Picks a queue that received every write at `from`.
///
/// Queues on `cluster_name` are preferred, then lower replica ids.
pub fn select_source(
    card: &ReplicationCard,
    target: ReplicaId,
    cluster_name: &str,
    from: Timestamp,
) -> Option<PullSource> {
    let from = from.max(Timestamp::MIN);
    card.replicas
        .iter()
        .filter(|(id, info)| **id != target && info.content_type == ReplicaContentType::Queue)
        .filter_map(|(id, info)| {
            let index = info.find_history_item_index(from)?;
            if !info.history[index].is_sync_like() {
                return None;
            }
            Some(PullSource {
                replica_id: *id,
                cluster_name: info.cluster_name.clone(),
                replica_path: info.replica_path.clone(),
                upper_timestamp: info.sync_until(index),
            })
        })
        .min_by_key(|source| (source.cluster_name != cluster_name, source.replica_id))
}

/// What one puller iteration did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PullOutcome {
    /// Nothing to do: caught up, disabled, or no card yet.
    Idle,
    /// No queue can serve the replica's progress.
    NoSource,
    /// Waiting for the backoff deadline.
    BackingOff,
    /// Rows were pulled and applied.
    Pulled {
        /// Rows applied.
        rows: usize,
        /// Minimum progress after the pull.
        progress: Timestamp,
    },
}

/// Pulls rows into one replica table.
#[derive(Debug)]
pub struct Puller {
    row_limit: usize,
    backoff: Mutex<Backoff>,
}

impl Puller {
    /// Puller using the node's pull limits and backoff.
    pub fn new(config: &TabletNodeConfig) -> Self {
        Self {
            row_limit: config.pull_row_limit,
            backoff: Mutex::new(Backoff::new(&config.backoff)),
        }
    }

    /// Runs one pull iteration for `table`.
    pub async fn run_once(
        &self,
        table: &ReplicaTable,
        transport: &dyn ReplicaTransport,
    ) -> ChaosResult<PullOutcome> {
        let Some(card) = table.card() else {
            return Ok(PullOutcome::Idle);
        };
        let info = card.replica(table.replica_id())?;
        if !info.is_enabled() {
            return Ok(PullOutcome::Idle);
        }

        let progress = table.progress();
        let from = progress.min_timestamp();
        let sync_since = if info.is_in_fanout() { info.sync_since() } else { None };
        if let Some(since) = sync_since {
            if from >= since {
                return Ok(PullOutcome::Idle);
            }
        }

        if !self.backoff.lock().ready(Instant::now()) {
            return Ok(PullOutcome::BackingOff);
        }

        let Some(source) = select_source(&card, table.replica_id(), table.cluster_name(), from) else {
            debug!(
                path = %table.path(),
                replica_id = %table.replica_id(),
                %from,
                "no queue replica can serve pulls"
            );
            return Ok(PullOutcome::NoSource);
        };

        let upper_timestamp = match (source.upper_timestamp, sync_since) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let request = PullRowsRequest {
            replica_path: source.replica_path.clone(),
            upstream_replica_id: source.replica_id,
            era: card.era,
            progress,
            upper_timestamp,
            order_by_timestamp: !table.schema().is_sorted(),
            row_limit: self.row_limit,
        };

        let result = self.pull(table, transport, &source, request, card.era).await;
        match &result {
            Ok(_) => self.backoff.lock().success(),
            Err(e) => {
                let delay = self.backoff.lock().failure(Instant::now());
                warn!(
                    path = %table.path(),
                    source = %source.cluster_name,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "pull failed"
                );
            }
        }
        result
    }

    async fn pull(
        &self,
        table: &ReplicaTable,
        transport: &dyn ReplicaTransport,
        source: &PullSource,
        request: PullRowsRequest,
        era: Era,
    ) -> ChaosResult<PullOutcome> {
        let response = transport.pull_rows(&source.cluster_name, request).await?;
        if let Err(e) = check_replication_compatibility(&response.schema, table.schema()) {
            table.set_background_error(BackgroundActivity::Pull, &e);
            return Err(e);
        }
        table.apply_pulled(era, &response.rows, &response.progress)?;
        table.clear_background_error(BackgroundActivity::Pull);
        let progress = table.progress().min_timestamp();
        debug!(
            path = %table.path(),
            source = %source.cluster_name,
            rows = response.rows.len(),
            %progress,
            "pulled rows"
        );
        Ok(PullOutcome::Pulled {
            rows: response.rows.len(),
            progress,
        })
    }

    /// Consecutive failed pulls.
    pub fn failures(&self) -> u32 {
        self.backoff.lock().failures()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaos_meta::card::{ReplicaHistoryItem, ReplicaInfo};
    use chaos_meta::progress::ReplicationProgress;
    use chaos_meta::types::{CardId, ObjectId, ObjectType, ReplicaMode, ReplicaState};

    fn card_id() -> CardId {
        CardId::from_object(ObjectId::new(ObjectType::ReplicationCard, 1, 0x3000_0000, 4)).unwrap()
    }

    fn item(era: Era, ts: u64, mode: ReplicaMode, state: ReplicaState) -> ReplicaHistoryItem {
        ReplicaHistoryItem {
            era,
            timestamp: Timestamp::new(ts),
            mode,
            state,
        }
    }

    fn queue(cluster: &str, history: Vec<ReplicaHistoryItem>) -> ReplicaInfo {
        ReplicaInfo {
            cluster_name: cluster.into(),
            replica_path: "//q".into(),
            content_type: ReplicaContentType::Queue,
            mode: ReplicaMode::Sync,
            state: ReplicaState::Enabled,
            replication_progress: ReplicationProgress::full(Timestamp::MIN),
            history,
            enable_replicated_table_tracker: false,
        }
    }

    fn card(replicas: Vec<ReplicaInfo>) -> ReplicationCard {
        ReplicationCard {
            id: card_id(),
            era: 3,
            replicas: replicas
                .into_iter()
                .enumerate()
                .map(|(i, r)| (ReplicaId::for_card(card_id(), i as u16), r))
                .collect(),
            coordinator_cell_ids: Vec::new(),
            table_id: None,
            table_path: "//crt".into(),
            table_cluster_name: "primary".into(),
            collocation_id: None,
            replicated_table_options: Default::default(),
            current_timestamp: Timestamp::new(100),
        }
    }

    #[test]
    fn test_prefers_same_cluster_then_lowest_id() {
        let sync = vec![item(1, 1, ReplicaMode::Sync, ReplicaState::Enabled)];
        let card = card(vec![
            queue("alpha", sync.clone()),
            queue("beta", sync.clone()),
            queue("beta", sync),
        ]);
        let target = ReplicaId::for_card(card_id(), 9);
        let source = select_source(&card, target, "beta", Timestamp::new(5)).unwrap();
        assert_eq!(source.replica_id, ReplicaId::for_card(card_id(), 1));
        let source = select_source(&card, target, "gamma", Timestamp::new(5)).unwrap();
        assert_eq!(source.replica_id, ReplicaId::for_card(card_id(), 0));
    }

    #[test]
    fn test_source_must_be_sync_at_progress() {
        let card = card(vec![
            queue(
                "alpha",
                vec![
                    item(1, 1, ReplicaMode::Async, ReplicaState::Enabled),
                    item(2, 50, ReplicaMode::Sync, ReplicaState::Enabled),
                ],
            ),
            queue(
                "beta",
                vec![
                    item(1, 1, ReplicaMode::Sync, ReplicaState::Enabled),
                    item(2, 60, ReplicaMode::Async, ReplicaState::Enabled),
                ],
            ),
        ]);
        let target = ReplicaId::for_card(card_id(), 7);
        let source = select_source(&card, target, "alpha", Timestamp::new(10)).unwrap();
        assert_eq!(source.cluster_name, "beta");
        assert_eq!(source.upper_timestamp, Some(Timestamp::new(60)));
        let source = select_source(&card, target, "beta", Timestamp::new(70)).unwrap();
        assert_eq!(source.cluster_name, "alpha");
        assert_eq!(source.upper_timestamp, None);
    }

    #[test]
    fn test_no_source_and_self_excluded() {
        let card = card(vec![queue(
            "alpha",
            vec![item(1, 1, ReplicaMode::Async, ReplicaState::Enabled)],
        )]);
        let target = ReplicaId::for_card(card_id(), 5);
        assert!(select_source(&card, target, "alpha", Timestamp::new(10)).is_none());

        let card = self::card(vec![queue(
            "alpha",
            vec![item(1, 1, ReplicaMode::Sync, ReplicaState::Enabled)],
        )]);
        let only = ReplicaId::for_card(card_id(), 0);
        assert!(select_source(&card, only, "alpha", Timestamp::new(10)).is_none());
    }
}
