//! Directory of chaos bundles, areas and cells.
//!
//! The directory is the in-process stand-in for cell discovery and for the
//! hive transport: it resolves which cell hosts a card (following migration
//! tombstones and alien caches), delivers inter-cell messages and drives
//! periodic cell work.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::alien::{changed_eras, AlienSyncKind};
use crate::card::{CardAttributes, CardFetchOptions, ReplicaPatch, ReplicationCard};
use crate::cell::ChaosCell;
use crate::clock::{Clock, ClockRegistry};
use crate::config::ChaosCellConfig;
use crate::error::{ChaosError, ChaosResult};
use crate::faults::{FaultInjector, FaultPoint, NoFaults};
use crate::hive::Envelope;
use crate::store::CardState;
use crate::types::{now_ms, CardId, CellId, CellTag, ClusterTag, Era, ReplicaId};

/// Upper bound on message delivery rounds per pump.
const MAX_PUMP_ROUNDS: usize = 64;

/// Upper bound on migration hops followed while locating a card.
const MAX_LOCATE_HOPS: usize = 16;

/// A chaos cell bundle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleInfo {
    /// Bundle name.
    pub name: String,
    /// Clock the bundle trusts.
    pub clock_cluster_tag: ClusterTag,
    /// Clusters hosting replicas served by this bundle.
    pub peer_clusters: Vec<String>,
    /// Areas by name.
    pub areas: BTreeMap<String, AreaInfo>,
}

/// An area pins its cells to a home cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaInfo {
    /// Area name.
    pub name: String,
    /// Cluster the area's cells run on.
    pub home_cluster: String,
    /// Cells of the area.
    pub cell_ids: Vec<CellId>,
}

#[derive(Default)]
struct DirectoryInner {
    bundles: BTreeMap<String, BundleInfo>,
    cells: BTreeMap<CellId, Arc<ChaosCell>>,
    tags: BTreeMap<CellTag, CellId>,
}

/// Registry of every chaos cell.
pub struct Directory {
    clocks: Arc<ClockRegistry>,
    config: ChaosCellConfig,
    faults: Arc<dyn FaultInjector>,
    inner: RwLock<DirectoryInner>,
}

impl std::fmt::Debug for Directory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Directory")
            .field("bundles", &inner.bundles.keys().collect::<Vec<_>>())
            .field("cells", &inner.cells.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Directory {
    /// Creates an empty directory whose cells use `config`.
    pub fn new(clocks: Arc<ClockRegistry>, config: ChaosCellConfig) -> Self {
        Self {
            clocks,
            config,
            faults: Arc::new(NoFaults),
            inner: RwLock::new(DirectoryInner::default()),
        }
    }

    /// Replaces the fault injector used for commits and message delivery.
    pub fn with_faults(mut self, faults: Arc<dyn FaultInjector>) -> Self {
        self.faults = faults;
        self
    }

    /// Clock registry.
    pub fn clocks(&self) -> &Arc<ClockRegistry> {
        &self.clocks
    }

    /// Declares a bundle with its default area homed on the first peer cluster.
    pub fn create_bundle(
        &self,
        name: &str,
        clock_cluster_tag: ClusterTag,
        peer_clusters: Vec<String>,
    ) -> ChaosResult<()> {
        let mut inner = self.inner.write();
        if inner.bundles.contains_key(name) {
            return Err(ChaosError::validation(format!("bundle {:?} already exists", name)));
        }
        let home = peer_clusters
            .first()
            .cloned()
            .ok_or_else(|| ChaosError::validation(format!("bundle {:?} has no peer clusters", name)))?;
        self.clocks.get_or_create(clock_cluster_tag);
        let default_area = AreaInfo {
            name: "default".to_string(),
            home_cluster: home,
            cell_ids: Vec::new(),
        };
        inner.bundles.insert(
            name.to_string(),
            BundleInfo {
                name: name.to_string(),
                clock_cluster_tag,
                peer_clusters,
                areas: [(default_area.name.clone(), default_area)].into_iter().collect(),
            },
        );
        info!(bundle = name, %clock_cluster_tag, "chaos bundle created");
        Ok(())
    }

    /// Adds an area homed on one of the bundle's peer clusters.
    pub fn create_area(&self, bundle: &str, area: &str, home_cluster: &str) -> ChaosResult<()> {
        let mut inner = self.inner.write();
        let info = inner
            .bundles
            .get_mut(bundle)
            .ok_or_else(|| ChaosError::no_such("bundle", bundle))?;
        if !info.peer_clusters.iter().any(|c| c == home_cluster) {
            return Err(ChaosError::validation(format!(
                "cluster {:?} is not a peer of bundle {:?}",
                home_cluster, bundle
            )));
        }
        if info.areas.contains_key(area) {
            return Err(ChaosError::validation(format!("area {:?} already exists in bundle {:?}", area, bundle)));
        }
        info.areas.insert(
            area.to_string(),
            AreaInfo {
                name: area.to_string(),
                home_cluster: home_cluster.to_string(),
                cell_ids: Vec::new(),
            },
        );
        Ok(())
    }

    /// Creates a cell with an explicit, unique cell tag.
    pub fn create_cell(&self, bundle: &str, area: &str, cell_tag: CellTag) -> ChaosResult<Arc<ChaosCell>> {
        let (cell, peers) = {
            let mut inner = self.inner.write();
            if let Some(existing) = inner.tags.get(&cell_tag) {
                return Err(ChaosError::validation(format!(
                    "cell tag {} is already used by cell {}",
                    cell_tag, existing
                )));
            }
            let info = inner
                .bundles
                .get_mut(bundle)
                .ok_or_else(|| ChaosError::no_such("bundle", bundle))?;
            let clock = self.clocks.get_or_create(info.clock_cluster_tag);
            let area_info = info
                .areas
                .get_mut(area)
                .ok_or_else(|| ChaosError::no_such("area", area))?;
            let cell_id = CellId::with_tag(cell_tag);
            area_info.cell_ids.push(cell_id);
            let cell = Arc::new(
                ChaosCell::new(cell_id, bundle, clock, self.config.clone()).with_faults(self.faults.clone()),
            );
            inner.tags.insert(cell_tag, cell_id);
            inner.cells.insert(cell_id, cell.clone());
            let peers: Vec<Arc<ChaosCell>> = inner
                .cells
                .values()
                .filter(|c| c.bundle() == bundle)
                .cloned()
                .collect();
            (cell, peers)
        };
        let cell_ids: Vec<CellId> = peers.iter().map(|c| c.cell_id()).collect();
        for peer in &peers {
            peer.set_coordinator_cell_ids(cell_ids.clone());
        }
        info!(cell_id = %cell.cell_id(), bundle, area, "chaos cell created");
        Ok(cell)
    }

    /// Looks up a cell.
    pub fn cell(&self, cell_id: CellId) -> ChaosResult<Arc<ChaosCell>> {
        self.inner
            .read()
            .cells
            .get(&cell_id)
            .cloned()
            .ok_or(ChaosError::NoSuchCell { cell_id })
    }

    /// Looks up a cell by tag.
    pub fn cell_by_tag(&self, cell_tag: CellTag) -> ChaosResult<Arc<ChaosCell>> {
        let cell_id = CellId::with_tag(cell_tag);
        self.cell(cell_id)
    }

    /// Every cell.
    pub fn cells(&self) -> Vec<Arc<ChaosCell>> {
        self.inner.read().cells.values().cloned().collect()
    }

    /// Cells of a bundle.
    pub fn bundle_cells(&self, bundle: &str) -> Vec<Arc<ChaosCell>> {
        self.inner
            .read()
            .cells
            .values()
            .filter(|c| c.bundle() == bundle)
            .cloned()
            .collect()
    }

    /// Bundle description.
    pub fn bundle(&self, name: &str) -> ChaosResult<BundleInfo> {
        self.inner
            .read()
            .bundles
            .get(name)
            .cloned()
            .ok_or_else(|| ChaosError::no_such("bundle", name))
    }

    /// Clock a bundle trusts.
    pub fn bundle_clock(&self, name: &str) -> ChaosResult<Arc<Clock>> {
        let tag = self.bundle(name)?.clock_cluster_tag;
        self.clocks.get(tag)
    }

    /// Home cluster of a cell.
    pub fn home_cluster(&self, cell_id: CellId) -> ChaosResult<String> {
        let inner = self.inner.read();
        inner
            .bundles
            .values()
            .flat_map(|b| b.areas.values())
            .find(|a| a.cell_ids.contains(&cell_id))
            .map(|a| a.home_cluster.clone())
            .ok_or(ChaosError::NoSuchCell { cell_id })
    }

    /// Peer clusters of a cell's bundle other than its home cluster.
    pub fn alien_clusters(&self, cell_id: CellId) -> ChaosResult<Vec<String>> {
        let cell = self.cell(cell_id)?;
        let home = self.home_cluster(cell_id)?;
        let bundle = self.bundle(cell.bundle())?;
        Ok(bundle
            .peer_clusters
            .into_iter()
            .filter(|c| *c != home)
            .collect())
    }

    /// Finds the cell currently hosting `card_id`.
    pub fn locate_card(&self, card_id: CardId) -> ChaosResult<Arc<ChaosCell>> {
        let mut cell = match self.cell_by_tag(card_id.cell_tag()) {
            Ok(cell) => cell,
            Err(_) => self.locate_alien(card_id)?,
        };
        let mut visited = BTreeSet::new();
        for _ in 0..MAX_LOCATE_HOPS {
            visited.insert(cell.cell_id());
            let next = match cell.card_state(card_id) {
                Ok(CardState::Migrated) => cell
                    .card_record(card_id)?
                    .migration
                    .immigrated_to_cell_id
                    .ok_or(ChaosError::NoSuchCard { card_id })?,
                Ok(_) => return Ok(cell),
                Err(ChaosError::NoSuchCard { .. }) => self.locate_alien(card_id)?.cell_id(),
                Err(err) => return Err(err),
            };
            if visited.contains(&next) {
                debug!(%card_id, %next, "migration chain loops back to a visited cell");
                return Err(ChaosError::MigrationInProgress { card_id });
            }
            cell = self.cell(next)?;
        }
        Err(ChaosError::NoSuchCard { card_id })
    }

    fn locate_alien(&self, card_id: CardId) -> ChaosResult<Arc<ChaosCell>> {
        let hint = self
            .cells()
            .iter()
            .find_map(|c| c.alien_card(card_id))
            .ok_or(ChaosError::NoSuchCard { card_id })?;
        self.cell(hint.cell_id)
    }

    /// Reads a card from whichever cell hosts it.
    pub fn get_card(&self, card_id: CardId, options: CardFetchOptions) -> ChaosResult<ReplicationCard> {
        for _ in 0..2 {
            let cell = self.locate_card(card_id)?;
            match cell.get_card(card_id, options) {
                Err(ChaosError::CardMigrated { .. }) => continue,
                other => return other,
            }
        }
        Err(ChaosError::MigrationInProgress { card_id })
    }

    /// Creates a card on `cell_id`.
    pub fn create_card(&self, cell_id: CellId, attrs: CardAttributes) -> ChaosResult<CardId> {
        self.cell(cell_id)?.create_card(attrs)
    }

    /// Alters a replica and returns the card era once messages settle.
    pub fn alter_replica(&self, card_id: CardId, replica_id: ReplicaId, patch: ReplicaPatch) -> ChaosResult<Era> {
        let cell = self.locate_card(card_id)?;
        cell.alter_replica(card_id, replica_id, patch)?;
        self.pump_messages();
        Ok(cell.get_card(card_id, CardFetchOptions::all())?.era)
    }

    /// Migrates cards hosted by one cell to `destination` of the same bundle.
    pub fn migrate_cards(&self, card_ids: &[CardId], destination: CellId) -> ChaosResult<()> {
        let first = card_ids
            .first()
            .ok_or_else(|| ChaosError::validation("no replication cards to migrate"))?;
        let source = self.locate_card(*first)?;
        for card_id in card_ids {
            if self.locate_card(*card_id)?.cell_id() != source.cell_id() {
                return Err(ChaosError::validation(format!(
                    "replication card {} is not hosted by cell {}",
                    card_id,
                    source.cell_id()
                )));
            }
        }
        let target = self.cell(destination)?;
        if target.bundle() != source.bundle() {
            return Err(ChaosError::validation(format!(
                "cannot migrate from bundle {:?} to bundle {:?}",
                source.bundle(),
                target.bundle()
            )));
        }
        source.migrate_cards(card_ids, destination)?;
        self.pump_messages();
        Ok(())
    }

    /// Suspends the coordinator role of a cell.
    pub fn suspend_coordinator(&self, cell_id: CellId) -> ChaosResult<()> {
        self.cell(cell_id)?.suspend_coordinator()?;
        self.pump_messages();
        Ok(())
    }

    /// Resumes the coordinator role of a cell.
    pub fn resume_coordinator(&self, cell_id: CellId) -> ChaosResult<()> {
        self.cell(cell_id)?.resume_coordinator()?;
        self.pump_messages();
        Ok(())
    }

    /// Delivers queued inter-cell messages until none can make progress.
    /// Returns the number of delivered messages.
    pub fn pump_messages(&self) -> usize {
        let mut delivered = 0;
        for _ in 0..MAX_PUMP_ROUNDS {
            let mut round = 0;
            for sender in self.cells() {
                let envelopes = sender.drain_outbox();
                if envelopes.is_empty() {
                    continue;
                }
                let mut blocked = BTreeSet::new();
                let mut undelivered = Vec::new();
                for envelope in envelopes {
                    if blocked.contains(&envelope.to) {
                        undelivered.push(envelope);
                        continue;
                    }
                    match self.deliver(&envelope) {
                        Ok(()) => round += 1,
                        Err(err) => {
                            debug!(from = %envelope.from, to = %envelope.to, error = %err, "cell message delivery deferred");
                            blocked.insert(envelope.to);
                            undelivered.push(envelope);
                        }
                    }
                }
                sender.requeue(undelivered);
            }
            delivered += round;
            if round == 0 {
                break;
            }
        }
        delivered
    }

    fn deliver(&self, envelope: &Envelope) -> ChaosResult<()> {
        self.faults.check(&FaultPoint::CellMessage { to: envelope.to })?;
        let target = self.cell(envelope.to)?;
        target.handle_message(envelope.from, envelope.message.clone())
    }

    /// Synchronizes alien card caches that are due.
    pub fn sync_alien_cells(&self, now_ms: u64) {
        let cells = self.cells();
        for cell in &cells {
            let Some(kind) = cell.alien_sync_due(now_ms) else {
                continue;
            };
            for peer in cells.iter().filter(|p| p.cell_id() != cell.cell_id() && p.bundle() == cell.bundle()) {
                if !peer.is_available() {
                    continue;
                }
                let hosted = peer.card_eras();
                let reported = match kind {
                    AlienSyncKind::Full => hosted,
                    AlienSyncKind::Incremental => changed_eras(&hosted, &cell.known_alien_eras(peer.cell_id())),
                };
                cell.apply_alien_report(peer.cell_id(), kind, reported);
            }
            cell.finish_alien_sync(kind, now_ms);
        }
    }

    /// Runs periodic work of every available cell and settles messages.
    pub fn tick(&self) {
        for cell in self.cells() {
            if let Err(err) = cell.tick() {
                warn!(cell_id = %cell.cell_id(), error = %err, "chaos cell tick failed");
            }
        }
        self.sync_alien_cells(now_ms());
        self.pump_messages();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::ReplicaSpec;
    use crate::faults::{FaultController, FaultMode, FaultTarget};
    use crate::types::{ReplicaContentType, ReplicaMode};

    fn directory() -> Directory {
        let directory = Directory::new(Arc::new(ClockRegistry::new()), ChaosCellConfig::default());
        directory
            .create_bundle("chaos", ClusterTag::new(1), vec!["primary".into(), "remote".into()])
            .unwrap();
        directory.create_area("chaos", "beta", "remote").unwrap();
        directory.create_cell("chaos", "default", 10).unwrap();
        directory.create_cell("chaos", "beta", 11).unwrap();
        directory
    }

    fn writable_card(directory: &Directory) -> CardId {
        let card_id = directory
            .create_card(CellId::with_tag(10), CardAttributes::default())
            .unwrap();
        directory
            .cell_by_tag(10)
            .unwrap()
            .create_replica(
                card_id,
                ReplicaSpec::new("primary", "//q", ReplicaContentType::Queue, ReplicaMode::Sync, true),
            )
            .unwrap();
        directory.pump_messages();
        card_id
    }

    mod cells {
        use super::*;

        #[test]
        fn test_unique_tags_and_coordinators() {
            let directory = directory();
            assert!(directory.create_cell("chaos", "default", 10).is_err());
            let cell = directory.cell_by_tag(10).unwrap();
            assert_eq!(
                cell.coordinator_cell_ids(),
                vec![CellId::with_tag(10), CellId::with_tag(11)]
            );
            assert_eq!(directory.alien_clusters(CellId::with_tag(10)).unwrap(), vec!["remote".to_string()]);
            assert_eq!(directory.home_cluster(CellId::with_tag(11)).unwrap(), "remote");
        }

        #[test]
        fn test_area_home_must_be_peer() {
            let directory = directory();
            assert!(directory.create_area("chaos", "gamma", "elsewhere").is_err());
        }
    }

    mod shortcuts {
        use super::*;

        #[test]
        fn test_shortcuts_granted_to_every_cell() {
            let directory = directory();
            let card_id = writable_card(&directory);
            let card = directory.get_card(card_id, CardFetchOptions::all()).unwrap();
            assert_eq!(card.coordinator_cell_ids.len(), 2);
            let remote = directory.cell_by_tag(11).unwrap();
            assert!(remote.generate_commit_timestamp(card_id, card.era).is_ok());
        }

        #[test]
        fn test_suspended_coordinator_loses_shortcuts() {
            let directory = directory();
            let card_id = writable_card(&directory);
            directory.suspend_coordinator(CellId::with_tag(11)).unwrap();
            let card = directory.get_card(card_id, CardFetchOptions::all()).unwrap();
            assert_eq!(card.coordinator_cell_ids, vec![CellId::with_tag(10)]);
            directory.resume_coordinator(CellId::with_tag(11)).unwrap();
            let card = directory.get_card(card_id, CardFetchOptions::all()).unwrap();
            assert_eq!(card.coordinator_cell_ids.len(), 2);
        }

        #[test]
        fn test_unavailable_peer_delays_era() {
            let directory = directory();
            let card_id = writable_card(&directory);
            let remote = directory.cell_by_tag(11).unwrap();
            remote.set_available(false);
            let replica_id = directory
                .get_card(card_id, CardFetchOptions::all())
                .unwrap()
                .replicas
                .keys()
                .copied()
                .next()
                .unwrap();
            let era = directory
                .alter_replica(card_id, replica_id, ReplicaPatch {
                    enable_replicated_table_tracker: Some(false),
                    ..Default::default()
                })
                .unwrap();
            assert_eq!(era, 1);

            let data = ReplicaSpec::new("remote", "//d", ReplicaContentType::Data, ReplicaMode::Async, true);
            directory.cell_by_tag(10).unwrap().create_replica(card_id, data).unwrap();
            directory.pump_messages();
            assert_eq!(directory.get_card(card_id, CardFetchOptions::all()).unwrap().era, 1);

            remote.set_available(true);
            directory.pump_messages();
            assert_eq!(directory.get_card(card_id, CardFetchOptions::all()).unwrap().era, 2);
        }

        #[test]
        fn test_message_fault_is_retried() {
            let faults = Arc::new(FaultController::new());
            let directory = Directory::new(Arc::new(ClockRegistry::new()), ChaosCellConfig::default())
                .with_faults(faults.clone());
            directory
                .create_bundle("chaos", ClusterTag::new(1), vec!["primary".into()])
                .unwrap();
            directory.create_cell("chaos", "default", 10).unwrap();
            faults.inject(
                FaultTarget::Point(FaultPoint::CellMessage { to: CellId::with_tag(10) }),
                FaultMode::Times(3),
            );
            let card_id = writable_card(&directory);
            for _ in 0..3 {
                directory.pump_messages();
            }
            assert_eq!(faults.injected_count(), 3);
            let card = directory.get_card(card_id, CardFetchOptions::all()).unwrap();
            assert_eq!(card.coordinator_cell_ids, vec![CellId::with_tag(10)]);
        }
    }

    mod migration {
        use super::*;
        use crate::migration::CardSnapshot;

        #[test]
        fn test_migrate_and_locate() {
            let directory = directory();
            let card_id = writable_card(&directory);
            let before = CardSnapshot::capture(&directory.get_card(card_id, CardFetchOptions::all()).unwrap());

            directory.migrate_cards(&[card_id], CellId::with_tag(11)).unwrap();
            assert_eq!(directory.locate_card(card_id).unwrap().cell_id(), CellId::with_tag(11));
            let source = directory.cell_by_tag(10).unwrap();
            assert_eq!(source.card_state(card_id).unwrap(), CardState::Migrated);
            assert!(matches!(
                source.get_card(card_id, CardFetchOptions::all()),
                Err(ChaosError::CardMigrated { .. })
            ));

            let moved = directory.get_card(card_id, CardFetchOptions::all()).unwrap();
            assert_eq!(moved.coordinator_cell_ids.len(), 2);
            assert_eq!(CardSnapshot::capture(&moved), before);

            directory.migrate_cards(&[card_id], CellId::with_tag(10)).unwrap();
            let back = directory.get_card(card_id, CardFetchOptions::all()).unwrap();
            assert_eq!(
                CardSnapshot::capture(&back).to_bytes().unwrap(),
                before.to_bytes().unwrap()
            );
        }

        #[test]
        fn test_migration_rejects_foreign_bundle() {
            let directory = directory();
            directory
                .create_bundle("other", ClusterTag::new(2), vec!["primary".into()])
                .unwrap();
            directory.create_cell("other", "default", 20).unwrap();
            let card_id = writable_card(&directory);
            assert!(directory.migrate_cards(&[card_id], CellId::with_tag(20)).is_err());
        }

        #[test]
        fn test_alien_sync_tracks_hosting_cell() {
            let directory = directory();
            let card_id = writable_card(&directory);
            directory.sync_alien_cells(now_ms());
            let remote = directory.cell_by_tag(11).unwrap();
            let alien = remote.alien_card(card_id).unwrap();
            assert_eq!(alien.cell_id, CellId::with_tag(10));
        }
    }
}
