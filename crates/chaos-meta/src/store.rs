//! Replication card store of one chaos cell.
//!
//! The store validates and applies card and replica mutations. It never
//! talks to other cells: operations that require a new era report it to the
//! caller, which drives the coordinator state machine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::card::{
    CardAttributes, CardPatch, ReplicaHistoryItem, ReplicaInfo, ReplicaPatch, ReplicaSpec,
    ReplicationCard, MAX_REPLICAS_PER_CARD,
};
use crate::collocation::Collocation;
use crate::error::{ChaosError, ChaosResult};
use crate::migration::MigrationInfo;
use crate::progress::ReplicationProgress;
use crate::types::{
    CardId, CellId, CollocationId, IdGenerator, ObjectType, ReplicaId, ReplicaMode, ReplicaState,
    Timestamp, INITIAL_ERA,
};

/// Cell-local lifecycle state of a card.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardState {
    /// Serving; shortcuts granted.
    Normal,
    /// Waiting for shortcut revocations before a new era.
    RevokingShortcutsForAlter,
    /// Waiting for shortcut revocations before emigrating.
    RevokingShortcutsForMigration,
    /// Waiting for a timestamp (and a sync queue) to commence the next era.
    GeneratingTimestampForNewEra,
    /// The card lives on another cell now.
    Migrated,
}

/// State of a shortcut held by a coordinator cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortcutState {
    /// Grant sent, not yet acknowledged.
    Granting,
    /// Coordinator serves the card.
    Granted,
    /// Revocation sent, not yet acknowledged.
    Revoking,
}

/// A card plus the bookkeeping its hosting cell keeps about it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CardRecord {
    /// Replicated card content.
    pub card: ReplicationCard,
    /// Lifecycle state.
    pub state: CardState,
    /// Migration pointers.
    pub migration: MigrationInfo,
    /// Shortcut state per coordinator cell.
    pub coordinators: BTreeMap<CellId, ShortcutState>,
    /// Next replica index to try.
    pub next_replica_index: u16,
    /// Destination while revoking for migration.
    pub migrate_to: Option<CellId>,
}

impl CardRecord {
    /// Rebuilds `card.coordinator_cell_ids` from granted shortcuts.
    pub fn refresh_coordinator_cell_ids(&mut self) {
        self.card.coordinator_cell_ids = self
            .coordinators
            .iter()
            .filter(|(_, state)| **state == ShortcutState::Granted)
            .map(|(cell_id, _)| *cell_id)
            .collect();
    }

    fn ensure_mutable(&self) -> ChaosResult<()> {
        match self.state {
            CardState::Migrated => Err(ChaosError::CardMigrated {
                card_id: self.card.id,
                immigrated_to: self
                    .migration
                    .immigrated_to_cell_id
                    .unwrap_or_else(|| CellId::with_tag(self.card.id.cell_tag())),
            }),
            CardState::RevokingShortcutsForMigration => Err(ChaosError::MigrationInProgress {
                card_id: self.card.id,
            }),
            _ => Ok(()),
        }
    }
}

/// Outcome of a replica mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplicaChange {
    /// Affected replica.
    pub replica_id: ReplicaId,
    /// Whether the card must move to a new era.
    pub needs_new_era: bool,
}

/// Cards and collocations hosted by one cell.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CardStore {
    cell_id: CellId,
    pub(crate) cards: BTreeMap<CardId, CardRecord>,
    pub(crate) collocations: BTreeMap<CollocationId, Collocation>,
    pub(crate) ids: IdGenerator,
}

impl CardStore {
    /// Creates an empty store for `cell_id`.
    pub fn new(cell_id: CellId) -> Self {
        Self {
            cell_id,
            cards: BTreeMap::new(),
            collocations: BTreeMap::new(),
            ids: IdGenerator::new(cell_id.cell_tag()),
        }
    }

    /// Owning cell.
    pub fn cell_id(&self) -> CellId {
        self.cell_id
    }

    /// Record of a card in any state.
    pub fn find(&self, card_id: CardId) -> Option<&CardRecord> {
        self.cards.get(&card_id)
    }

    /// Mutable record of a card in any state.
    pub fn find_mut(&mut self, card_id: CardId) -> Option<&mut CardRecord> {
        self.cards.get_mut(&card_id)
    }

    /// Record of a card hosted here; migrated cards redirect.
    pub fn get(&self, card_id: CardId) -> ChaosResult<&CardRecord> {
        let record = self
            .cards
            .get(&card_id)
            .ok_or(ChaosError::NoSuchCard { card_id })?;
        if record.state == CardState::Migrated {
            record.ensure_mutable()?;
        }
        Ok(record)
    }

    /// Mutable record of a card that accepts mutations.
    pub fn get_mutable(&mut self, card_id: CardId) -> ChaosResult<&mut CardRecord> {
        let record = self
            .cards
            .get_mut(&card_id)
            .ok_or(ChaosError::NoSuchCard { card_id })?;
        record.ensure_mutable()?;
        Ok(record)
    }

    /// Whether the card is hosted here and not migrated away.
    pub fn exists(&self, card_id: CardId) -> bool {
        self.get(card_id).is_ok()
    }

    /// Ids of hosted (non-migrated) cards.
    pub fn card_ids(&self) -> Vec<CardId> {
        self.cards
            .values()
            .filter(|r| r.state != CardState::Migrated)
            .map(|r| r.card.id)
            .collect()
    }

    /// Iterates over hosted (non-migrated) records.
    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut CardRecord> {
        self.cards
            .values_mut()
            .filter(|r| r.state != CardState::Migrated)
    }

    /// Iterates over every record.
    pub fn records(&self) -> impl Iterator<Item = &CardRecord> {
        self.cards.values()
    }

    /// Creates a card at the initial era.
    pub fn create_card(
        &mut self,
        attrs: CardAttributes,
        current_timestamp: Timestamp,
    ) -> ChaosResult<CardId> {
        if let Some(collocation_id) = attrs.collocation_id {
            if !self.collocations.contains_key(&collocation_id) {
                return Err(ChaosError::NoSuchCollocation { collocation_id });
            }
        }
        let card_id = CardId::from_object(self.ids.next(ObjectType::ReplicationCard))?;
        let card = ReplicationCard {
            id: card_id,
            era: INITIAL_ERA,
            replicas: BTreeMap::new(),
            coordinator_cell_ids: Vec::new(),
            table_id: attrs.table_id,
            table_path: attrs.table_path,
            table_cluster_name: attrs.table_cluster_name,
            collocation_id: None,
            replicated_table_options: attrs.replicated_table_options,
            current_timestamp,
        };
        self.cards.insert(
            card_id,
            CardRecord {
                card,
                state: CardState::Normal,
                migration: MigrationInfo::created_at(self.cell_id),
                coordinators: BTreeMap::new(),
                next_replica_index: 0,
                migrate_to: None,
            },
        );
        if let Some(collocation_id) = attrs.collocation_id {
            self.attach_to_collocation(card_id, collocation_id)?;
        }
        debug!(%card_id, cell_id = %self.cell_id, "replication card created");
        Ok(card_id)
    }

    /// Applies a card patch. Never changes the era.
    pub fn alter_card(&mut self, card_id: CardId, patch: CardPatch) -> ChaosResult<()> {
        self.get_mutable(card_id)?;
        if let Some(Some(collocation_id)) = patch.collocation_id {
            if !self.collocations.contains_key(&collocation_id) {
                return Err(ChaosError::NoSuchCollocation { collocation_id });
            }
        }
        let record = self.get_mutable(card_id)?;
        if let Some(options) = patch.replicated_table_options {
            record.card.replicated_table_options = options;
        }
        if let Some(enabled) = patch.enable_replicated_table_tracker {
            record
                .card
                .replicated_table_options
                .enable_replicated_table_tracker = enabled;
        }
        match patch.collocation_id {
            Some(Some(collocation_id)) => self.attach_to_collocation(card_id, collocation_id)?,
            Some(None) => self.detach_from_collocation(card_id)?,
            None => {}
        }
        debug!(%card_id, "replication card altered");
        Ok(())
    }

    /// Removes a card in the normal state.
    pub fn remove_card(&mut self, card_id: CardId) -> ChaosResult<ReplicationCard> {
        let record = self.get_mutable(card_id)?;
        if record.state != CardState::Normal {
            return Err(ChaosError::validation(format!(
                "replication card {} cannot be removed in state {:?}",
                card_id, record.state
            )));
        }
        self.detach_from_collocation(card_id)?;
        let record = self
            .cards
            .remove(&card_id)
            .ok_or(ChaosError::NoSuchCard { card_id })?;
        debug!(%card_id, "replication card removed");
        Ok(record.card)
    }

    /// Creates a replica.
    pub fn create_replica(
        &mut self,
        card_id: CardId,
        spec: ReplicaSpec,
    ) -> ChaosResult<ReplicaChange> {
        if !spec.mode.is_stable() {
            return Err(ChaosError::validation(format!(
                "invalid replica mode {}",
                spec.mode
            )));
        }
        let record = self.get_mutable(card_id)?;
        let card = &record.card;

        if card.replicas.len() >= MAX_REPLICAS_PER_CARD {
            return Err(ChaosError::validation(format!(
                "replication card {} already has too many replicas (limit {})",
                card_id, MAX_REPLICAS_PER_CARD
            )));
        }
        if let Some(existing) = card.find_replica(&spec.cluster_name, &spec.replica_path) {
            return Err(ChaosError::validation(format!(
                "replica {} already exists at {}:{}",
                existing, spec.cluster_name, spec.replica_path
            )));
        }
        if !spec.catchup && spec.replication_progress.is_some() {
            return Err(ChaosError::validation(
                "replication progress specified while replica is not to be caught up",
            ));
        }

        let minimal = card.minimal_progress();
        let progress = match (&spec.replication_progress, &minimal) {
            (Some(explicit), _) => explicit.clone(),
            (None, Some(min)) if spec.catchup => min.clone(),
            _ => ReplicationProgress::full(Timestamp::MIN),
        };
        if spec.catchup && card.era != INITIAL_ERA {
            if let Some(min) = &minimal {
                if !progress.is_ge(min) {
                    return Err(ChaosError::validation(format!(
                        "could not create replica since all other replicas already left it behind (progress {})",
                        progress
                    )));
                }
            }
        }

        let writable = card.is_writable();
        let era = card.era;
        let replica_id = next_replica_id(record)?;
        let mut history = Vec::new();
        if spec.catchup {
            let state = if spec.enabled && era == INITIAL_ERA && !writable {
                ReplicaState::Enabled
            } else {
                ReplicaState::Disabled
            };
            history.push(ReplicaHistoryItem {
                era,
                timestamp: Timestamp::MIN,
                mode: spec.mode,
                state,
            });
        }
        let state = if spec.enabled {
            ReplicaState::Enabling
        } else {
            ReplicaState::Disabled
        };
        let info = ReplicaInfo {
            cluster_name: spec.cluster_name,
            replica_path: spec.replica_path,
            content_type: spec.content_type,
            mode: spec.mode,
            state,
            replication_progress: progress,
            history,
            enable_replicated_table_tracker: spec.enable_replicated_table_tracker,
        };
        debug!(%card_id, %replica_id, replica = %info, "table replica created");
        record.card.replicas.insert(replica_id, info);
        Ok(ReplicaChange {
            replica_id,
            needs_new_era: state == ReplicaState::Enabling,
        })
    }

    /// Alters a replica's mode, state or tracker flag.
    pub fn alter_replica(
        &mut self,
        card_id: CardId,
        replica_id: ReplicaId,
        patch: ReplicaPatch,
    ) -> ChaosResult<ReplicaChange> {
        if let Some(mode) = patch.mode {
            if !mode.is_stable() {
                return Err(ChaosError::validation(format!("invalid replica mode {}", mode)));
            }
        }
        let record = self.get_mutable(card_id)?;
        let current_timestamp = record.card.current_timestamp;
        let replica = record.card.replica_mut(replica_id)?;

        if !replica.mode.is_stable() {
            return Err(ChaosError::validation(format!(
                "replica {} mode is transitioning ({})",
                replica_id, replica.mode
            )));
        }
        if !replica.state.is_stable() {
            return Err(ChaosError::validation(format!(
                "replica {} state is transitioning ({})",
                replica_id, replica.state
            )));
        }

        let mut needs_new_era = false;
        if let Some(mode) = patch.mode {
            if mode != replica.mode {
                replica.mode = match replica.mode {
                    ReplicaMode::Sync => ReplicaMode::SyncToAsync,
                    _ => ReplicaMode::AsyncToSync,
                };
                needs_new_era = true;
            }
        }
        if let Some(enabled) = patch.enabled {
            let currently_enabled = replica.state == ReplicaState::Enabled;
            if enabled != currently_enabled {
                if enabled {
                    replica.state = ReplicaState::Enabling;
                    if patch.catchup == Some(false) && !replica.history.is_empty() {
                        replica.replication_progress.advance_all(current_timestamp);
                    }
                } else {
                    replica.state = ReplicaState::Disabling;
                }
                needs_new_era = true;
            }
        }
        if let Some(tracker) = patch.enable_replicated_table_tracker {
            replica.enable_replicated_table_tracker = tracker;
        }
        debug!(%card_id, %replica_id, replica = %replica, needs_new_era, "table replica altered");
        Ok(ReplicaChange {
            replica_id,
            needs_new_era,
        })
    }

    /// Removes a disabled replica.
    pub fn remove_replica(&mut self, card_id: CardId, replica_id: ReplicaId) -> ChaosResult<()> {
        let record = self.get_mutable(card_id)?;
        let replica = record.card.replica(replica_id)?;
        if replica.state != ReplicaState::Disabled {
            return Err(ChaosError::validation(format!(
                "could not remove replica {} since it is not disabled (state {})",
                replica_id, replica.state
            )));
        }
        record.card.replicas.remove(&replica_id);
        debug!(%card_id, %replica_id, "table replica removed");
        Ok(())
    }

    /// Merges reported progress into the card (pointwise maximum).
    pub fn update_replica_progress(
        &mut self,
        card_id: CardId,
        replica_id: ReplicaId,
        progress: &ReplicationProgress,
    ) -> ChaosResult<()> {
        let record = self.get_mutable(card_id)?;
        let replica = record.card.replica_mut(replica_id)?;
        if replica.history.is_empty() {
            return Err(ChaosError::validation(format!(
                "replication progress update of replica {} is prohibited because its history has not been started yet",
                replica_id
            )));
        }
        replica.replication_progress.update(progress);
        Ok(())
    }

    /// Drops history items older than the item covering `retain` for every
    /// replica of `card_id`. Returns the number of dropped items.
    pub fn remove_expired_replica_history(&mut self, card_id: CardId, retain: Timestamp) -> usize {
        let Some(record) = self.cards.get_mut(&card_id) else {
            return 0;
        };
        if record.state == CardState::Migrated {
            return 0;
        }
        let mut removed = 0;
        for (replica_id, replica) in record.card.replicas.iter_mut() {
            if let Some(index) = replica.find_history_item_index(retain) {
                if index > 0 {
                    replica.history.drain(..index);
                    removed += index;
                    debug!(%card_id, %replica_id, %retain, index, "forsaken old replica history items");
                }
            }
        }
        removed
    }
}

fn next_replica_id(record: &mut CardRecord) -> ChaosResult<ReplicaId> {
    for _ in 0..=u16::MAX as u32 {
        let index = record.next_replica_index;
        record.next_replica_index = record.next_replica_index.wrapping_add(1);
        let candidate = ReplicaId::for_card(record.card.id, index);
        if !record.card.replicas.contains_key(&candidate) {
            return Ok(candidate);
        }
    }
    Err(ChaosError::validation(format!(
        "replication card {} ran out of replica ids",
        record.card.id
    )))
}
