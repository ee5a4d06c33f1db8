//! Card migration between chaos cells.
//!
//! A migrating card first revokes every shortcut, then leaves its cell as a
//! [`CardSnapshot`] and is re-installed by the destination at the same era.
//! The source keeps a `Migrated` tombstone pointing at the destination so
//! readers can follow the card.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::card::ReplicationCard;
use crate::collocation::Collocation;
use crate::error::{ChaosError, ChaosResult};
use crate::store::{CardRecord, CardState, CardStore};
use crate::types::{CardId, CellId, CollocationId};

/// Where a card came from and where it went.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationInfo {
    /// Cell that created the card.
    pub origin_cell_id: Option<CellId>,
    /// Cell the card moved to, while this cell holds a tombstone.
    pub immigrated_to_cell_id: Option<CellId>,
    /// Cell the card last arrived from.
    pub emigrated_from_cell_id: Option<CellId>,
    /// When the card arrived here.
    pub immigration_time_ms: Option<u64>,
    /// When the card last left a cell.
    pub emigration_time_ms: Option<u64>,
}

impl MigrationInfo {
    /// Info of a card created on `cell_id`.
    pub fn created_at(cell_id: CellId) -> Self {
        Self {
            origin_cell_id: Some(cell_id),
            ..Default::default()
        }
    }
}

/// Replicated content of a card as shipped between cells.
///
/// Coordinator cells are cell-local and are not part of the snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardSnapshot {
    card: ReplicationCard,
}

impl CardSnapshot {
    /// Captures the replicated content of `card`.
    pub fn capture(card: &ReplicationCard) -> Self {
        let mut card = card.clone();
        card.coordinator_cell_ids.clear();
        Self { card }
    }

    /// Snapshot content.
    pub fn card(&self) -> &ReplicationCard {
        &self.card
    }

    /// Consumes the snapshot.
    pub fn into_card(self) -> ReplicationCard {
        self.card
    }

    /// Encodes the snapshot with bincode.
    pub fn to_bytes(&self) -> ChaosResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes a snapshot produced by [`CardSnapshot::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> ChaosResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// A card in flight to another cell.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImmigratingCard {
    /// Card content.
    pub snapshot: CardSnapshot,
    /// Replica index allocation counter.
    pub next_replica_index: u16,
    /// Cell that created the card.
    pub origin_cell_id: CellId,
}

/// A collocation in flight to another cell.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollocationSnapshot {
    /// Collocation id.
    pub id: CollocationId,
    /// Member cards.
    pub card_ids: BTreeSet<CardId>,
}

impl CardStore {
    /// Checks that `card_ids` may start migrating to `destination`.
    pub fn validate_migration(&self, card_ids: &[CardId], destination: CellId) -> ChaosResult<()> {
        if destination == self.cell_id() {
            return Err(ChaosError::validation(format!(
                "cannot migrate replication cards to their own cell {}",
                destination
            )));
        }
        let requested: BTreeSet<CardId> = card_ids.iter().copied().collect();
        for card_id in card_ids {
            let record = self.get(*card_id)?;
            if record.state != CardState::Normal {
                return Err(ChaosError::validation(format!(
                    "trying to migrate replication card {} while it is in {:?} state",
                    card_id, record.state
                )));
            }
            if let Some(collocation_id) = record.card.collocation_id {
                let collocation = self.collocation(collocation_id)?;
                if let Some(missing) = collocation
                    .card_ids
                    .iter()
                    .find(|id| !requested.contains(id))
                {
                    return Err(ChaosError::validation(format!(
                        "trying to move incomplete collocation {}: replication card {} is missing",
                        collocation_id, missing
                    )));
                }
            }
        }
        Ok(())
    }

    /// Turns a card whose shortcuts are all revoked into a tombstone and
    /// returns what must be shipped to the destination.
    pub fn emigrate(
        &mut self,
        card_id: CardId,
        now_ms: u64,
    ) -> ChaosResult<(CellId, ImmigratingCard, Option<CollocationSnapshot>)> {
        let cell_id = self.cell_id();
        let record = self
            .cards
            .get_mut(&card_id)
            .ok_or(ChaosError::NoSuchCard { card_id })?;
        if record.state != CardState::RevokingShortcutsForMigration || !record.coordinators.is_empty() {
            return Err(ChaosError::validation(format!(
                "replication card {} is not ready to emigrate (state {:?})",
                card_id, record.state
            )));
        }
        let destination = record.migrate_to.take().ok_or_else(|| {
            ChaosError::validation(format!("replication card {} has no migration destination", card_id))
        })?;

        let immigrating = ImmigratingCard {
            snapshot: CardSnapshot::capture(&record.card),
            next_replica_index: record.next_replica_index,
            origin_cell_id: record.migration.origin_cell_id.unwrap_or(cell_id),
        };
        record.state = CardState::Migrated;
        record.migration.immigrated_to_cell_id = Some(destination);
        record.migration.emigration_time_ms = Some(now_ms);
        let collocation_id = record.card.collocation_id;

        let collocation = match collocation_id {
            Some(collocation_id) => self.take_collocation_if_emigrated(collocation_id),
            None => None,
        };
        info!(%card_id, %destination, "replication card emigrated");
        Ok((destination, immigrating, collocation))
    }

    fn take_collocation_if_emigrated(
        &mut self,
        collocation_id: CollocationId,
    ) -> Option<CollocationSnapshot> {
        let collocation = self.collocations.get(&collocation_id)?;
        let all_gone = collocation.card_ids.iter().all(|id| {
            self.cards
                .get(id)
                .map(|r| r.state == CardState::Migrated)
                .unwrap_or(true)
        });
        if !all_gone {
            return None;
        }
        let collocation = self.collocations.remove(&collocation_id)?;
        debug!(%collocation_id, "collocation emigrated with its last member");
        Some(CollocationSnapshot {
            id: collocation.id,
            card_ids: collocation.card_ids,
        })
    }

    /// Installs a card arriving from `from`. Replaces a migrated tombstone.
    pub fn immigrate(
        &mut self,
        immigrating: ImmigratingCard,
        from: CellId,
        now_ms: u64,
    ) -> ChaosResult<CardId> {
        let card = immigrating.snapshot.into_card();
        let card_id = card.id;
        if let Some(existing) = self.cards.get(&card_id) {
            if existing.state != CardState::Migrated {
                return Err(ChaosError::validation(format!(
                    "replication card {} immigrated while already hosted in state {:?}",
                    card_id, existing.state
                )));
            }
        }
        let migration = MigrationInfo {
            origin_cell_id: Some(immigrating.origin_cell_id),
            immigrated_to_cell_id: None,
            emigrated_from_cell_id: Some(from),
            immigration_time_ms: Some(now_ms),
            emigration_time_ms: None,
        };
        info!(%card_id, %from, era = card.era, "replication card immigrated");
        self.cards.insert(
            card_id,
            CardRecord {
                card,
                state: CardState::Normal,
                migration,
                coordinators: BTreeMap::new(),
                next_replica_index: immigrating.next_replica_index,
                migrate_to: None,
            },
        );
        Ok(card_id)
    }

    /// Installs a collocation that followed its members.
    pub fn immigrate_collocation(&mut self, snapshot: CollocationSnapshot) {
        debug!(collocation_id = %snapshot.id, cards = snapshot.card_ids.len(), "collocation immigrated");
        self.collocations.insert(
            snapshot.id,
            Collocation {
                id: snapshot.id,
                card_ids: snapshot.card_ids,
            },
        );
    }
}
