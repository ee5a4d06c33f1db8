//! The replicated table tracker.
//!
//! Each tick reads every card whose tracker is enabled, groups collocated
//! cards, asks the health cache about their clusters and switches replica
//! modes through the card's owning cell. The tracker never changes replica
//! state and acts independently of writes.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chaos_meta::card::{CardFetchOptions, ReplicaPatch, ReplicationCard};
use chaos_meta::config::ReplicatedTableTrackerConfig;
use chaos_meta::directory::Directory;
use chaos_meta::types::{CardId, CollocationId};

use crate::health::{BundleHealthCache, ClusterStateProvider};
use crate::selection::{plan_mode_changes, ModeChange};

/// What one tracker tick did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TrackerTickReport {
    /// Cards with the tracker enabled.
    pub tracked_cards: usize,
    /// Mode switches issued successfully.
    pub switched: Vec<ModeChange>,
    /// Mode switches that failed.
    pub failed: usize,
}

/// Switches replica modes following cluster health.
#[derive(Debug)]
pub struct ReplicatedTableTracker {
    config: ReplicatedTableTrackerConfig,
    directory: Arc<Directory>,
    cluster_state: Arc<dyn ClusterStateProvider>,
    health: BundleHealthCache,
    banned_clusters: RwLock<BTreeSet<String>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicatedTableTracker {
    /// Creates a tracker over every card of `directory`.
    pub fn new(
        config: ReplicatedTableTrackerConfig,
        directory: Arc<Directory>,
        cluster_state: Arc<dyn ClusterStateProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            health: BundleHealthCache::new(&config.bundle_health_cache),
            config,
            directory,
            cluster_state,
            banned_clusters: RwLock::new(BTreeSet::new()),
            task: Mutex::new(None),
        })
    }

    /// Replaces the clusters banned for every card.
    pub fn set_banned_clusters(&self, clusters: BTreeSet<String>) {
        info!(banned = ?clusters, "replicated table tracker banned clusters updated");
        *self.banned_clusters.write() = clusters;
    }

    /// Health cache.
    pub fn health(&self) -> &BundleHealthCache {
        &self.health
    }

    fn tracked_cards(&self) -> Vec<ReplicationCard> {
        let mut card_ids = BTreeSet::new();
        for cell in self.directory.cells() {
            card_ids.extend(cell.card_ids());
        }
        let mut cards: BTreeMap<CardId, ReplicationCard> = BTreeMap::new();
        for card_id in card_ids {
            match self.directory.get_card(card_id, CardFetchOptions::all()) {
                Ok(card) if card.replicated_table_options.enable_replicated_table_tracker => {
                    cards.insert(card.id, card);
                }
                Ok(_) => {}
                Err(e) => debug!(%card_id, error = %e, "tracker skipped unreadable card"),
            }
        }
        cards.into_values().collect()
    }

    fn group(cards: Vec<ReplicationCard>) -> Vec<Vec<ReplicationCard>> {
        let mut collocated: BTreeMap<CollocationId, Vec<ReplicationCard>> = BTreeMap::new();
        let mut groups = Vec::new();
        for card in cards {
            match card.collocation_id {
                Some(collocation_id) => collocated.entry(collocation_id).or_default().push(card),
                None => groups.push(vec![card]),
            }
        }
        groups.extend(collocated.into_values());
        groups
    }

    /// Runs one tracker pass.
    pub async fn tick(&self) -> TrackerTickReport {
        let mut report = TrackerTickReport::default();
        if !self.config.use_new_tracker {
            return report;
        }
        let cards = self.tracked_cards();
        report.tracked_cards = cards.len();

        let now = Instant::now();
        let clusters: BTreeSet<String> = cards
            .iter()
            .flat_map(|card| card.replicas.values().map(|r| r.cluster_name.clone()))
            .collect();
        let mut healthy = BTreeMap::new();
        for cluster in clusters {
            let ok = self.health.health(&cluster, self.cluster_state.as_ref(), now).await;
            healthy.insert(cluster, ok);
        }
        let banned = self.banned_clusters.read().clone();
        let eligible = |card: &ReplicationCard, cluster: &str| {
            healthy.get(cluster).copied().unwrap_or(false)
                && !banned.contains(cluster)
                && !card.replicated_table_options.banned_replica_clusters.contains(cluster)
        };

        for group in Self::group(cards) {
            for change in plan_mode_changes(&group, eligible) {
                match self
                    .directory
                    .alter_replica(change.card_id, change.replica_id, ReplicaPatch::mode(change.to))
                {
                    Ok(era) => {
                        info!(
                            card_id = %change.card_id,
                            replica_id = %change.replica_id,
                            cluster = %change.cluster_name,
                            from = %change.from,
                            to = %change.to,
                            era,
                            "tracker switched replica mode"
                        );
                        report.switched.push(change);
                    }
                    Err(e) => {
                        warn!(
                            card_id = %change.card_id,
                            replica_id = %change.replica_id,
                            error = %e,
                            "tracker could not switch replica mode"
                        );
                        report.failed += 1;
                    }
                }
            }
        }
        report
    }

    /// Ticks in the background every `tick_period_ms`.
    pub fn start(self: &Arc<Self>) {
        let tracker = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.tick_period_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(tracker) = tracker.upgrade() else {
                    break;
                };
                tracker.tick().await;
            }
        });
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        info!("replicated table tracker started");
    }

    /// Stops background ticking.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for ReplicatedTableTracker {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ManualClusterState;
    use chaos_meta::card::{CardAttributes, ReplicaSpec, ReplicatedTableOptions};
    use chaos_meta::clock::ClockRegistry;
    use chaos_meta::config::{BundleHealthCacheConfig, ChaosCellConfig};
    use chaos_meta::progress::ReplicationProgress;
    use chaos_meta::types::{CellId, ClusterTag, ReplicaContentType, ReplicaId, ReplicaMode};

    fn directory() -> Arc<Directory> {
        let directory = Arc::new(Directory::new(Arc::new(ClockRegistry::new()), ChaosCellConfig::default()));
        directory
            .create_bundle("chaos", ClusterTag::new(1), vec!["primary".into(), "remote".into()])
            .unwrap();
        directory.create_cell("chaos", "default", 10).unwrap();
        directory
    }

    fn config() -> ReplicatedTableTrackerConfig {
        ReplicatedTableTrackerConfig {
            use_new_tracker: true,
            tick_period_ms: 10,
            bundle_health_cache: BundleHealthCacheConfig {
                refresh_time_ms: 0,
                expire_after_successful_update_time_ms: 1_000,
                expire_after_failed_update_time_ms: 1_000,
            },
        }
    }

    fn tracked_card(directory: &Directory) -> (CardId, Vec<ReplicaId>) {
        let card_id = directory
            .create_card(
                CellId::with_tag(10),
                CardAttributes {
                    replicated_table_options: ReplicatedTableOptions {
                        enable_replicated_table_tracker: true,
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )
            .unwrap();
        let cell = directory.locate_card(card_id).unwrap();
        let specs = [
            ("primary", "//q", ReplicaContentType::Queue, ReplicaMode::Sync),
            ("primary", "//t", ReplicaContentType::Data, ReplicaMode::Sync),
            ("remote", "//t", ReplicaContentType::Data, ReplicaMode::Async),
            ("remote", "//q", ReplicaContentType::Queue, ReplicaMode::Async),
        ];
        let ids = specs
            .into_iter()
            .map(|(cluster, path, content_type, mode)| {
                let id = cell
                    .create_replica(card_id, ReplicaSpec::new(cluster, path, content_type, mode, true))
                    .unwrap();
                directory.pump_messages();
                id
            })
            .collect();
        (card_id, ids)
    }

    fn mode(directory: &Directory, card_id: CardId, replica_id: ReplicaId) -> ReplicaMode {
        directory
            .get_card(card_id, CardFetchOptions::all())
            .unwrap()
            .replica(replica_id)
            .unwrap()
            .mode
    }

    // Stands in for tablet nodes: every replica reports the card's current timestamp.
    fn report_progress(directory: &Directory, card_id: CardId) {
        let card = directory.get_card(card_id, CardFetchOptions::all()).unwrap();
        let cell = directory.locate_card(card_id).unwrap();
        for (replica_id, info) in &card.replicas {
            if !info.history.is_empty() {
                let progress = ReplicationProgress::full(card.current_timestamp);
                cell.update_replica_progress(card_id, *replica_id, &progress).unwrap();
            }
        }
    }

    async fn settle(directory: &Directory, tracker: &ReplicatedTableTracker, card_id: CardId) {
        for _ in 0..6 {
            tracker.tick().await;
            directory.tick();
            report_progress(directory, card_id);
            directory.tick();
        }
    }

    #[tokio::test]
    async fn test_healthy_queues_become_sync() {
        let directory = directory();
        let (card_id, ids) = tracked_card(&directory);
        let tracker = ReplicatedTableTracker::new(config(), directory.clone(), Arc::new(ManualClusterState::new()));
        settle(&directory, &tracker, card_id).await;
        assert_eq!(mode(&directory, card_id, ids[3]), ReplicaMode::Sync);
        assert_eq!(mode(&directory, card_id, ids[1]), ReplicaMode::Sync);
        assert_eq!(mode(&directory, card_id, ids[2]), ReplicaMode::Async);
    }

    #[tokio::test]
    async fn test_unhealthy_cluster_loses_sync_replicas() {
        let directory = directory();
        let (card_id, ids) = tracked_card(&directory);
        let state = Arc::new(ManualClusterState::new());
        let tracker = ReplicatedTableTracker::new(config(), directory.clone(), state.clone());
        settle(&directory, &tracker, card_id).await;

        state.set_healthy("primary", false);
        tracker.health().clear();
        settle(&directory, &tracker, card_id).await;
        assert_eq!(mode(&directory, card_id, ids[0]), ReplicaMode::Async);
        assert_eq!(mode(&directory, card_id, ids[1]), ReplicaMode::Async);
        assert_eq!(mode(&directory, card_id, ids[2]), ReplicaMode::Sync);
        assert_eq!(mode(&directory, card_id, ids[3]), ReplicaMode::Sync);
    }

    #[tokio::test]
    async fn test_banned_cluster_demoted() {
        let directory = directory();
        let (card_id, ids) = tracked_card(&directory);
        let tracker = ReplicatedTableTracker::new(config(), directory.clone(), Arc::new(ManualClusterState::new()));
        tracker.set_banned_clusters(BTreeSet::from(["primary".to_string()]));
        settle(&directory, &tracker, card_id).await;
        assert_eq!(mode(&directory, card_id, ids[1]), ReplicaMode::Async);
        assert_eq!(mode(&directory, card_id, ids[2]), ReplicaMode::Sync);
    }

    #[tokio::test]
    async fn test_disabled_tracker_does_nothing() {
        let directory = directory();
        tracked_card(&directory);
        let tracker = ReplicatedTableTracker::new(
            ReplicatedTableTrackerConfig {
                use_new_tracker: false,
                ..config()
            },
            directory.clone(),
            Arc::new(ManualClusterState::new()),
        );
        let report = tracker.tick().await;
        assert_eq!(report, TrackerTickReport::default());
    }
}
