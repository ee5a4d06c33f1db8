//! Alien cell synchronizer state.
//!
//! Every cell keeps a cache of which peer cell hosts which card and at
//! which era. The cache is refreshed incrementally every `sync_period` (only
//! cards whose era changed are shipped) and fully every `full_sync_period`
//! (entries the peer no longer reports are dropped).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::AlienCellSynchronizerConfig;
use crate::types::{CardId, CellId, Era};

/// What a peer cell reported about one of its cards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlienCard {
    /// Cell hosting the card.
    pub cell_id: CellId,
    /// Card era as last reported.
    pub era: Era,
}

/// Kind of synchronization that is due.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlienSyncKind {
    /// Ship only changed eras.
    Incremental,
    /// Ship everything and drop stale entries.
    Full,
}

/// Per-cell alien card cache.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AlienCards {
    cards: BTreeMap<CardId, AlienCard>,
    last_sync_ms: u64,
    last_full_sync_ms: u64,
}

impl AlienCards {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached info about a card.
    pub fn get(&self, card_id: CardId) -> Option<AlienCard> {
        self.cards.get(&card_id).copied()
    }

    /// Eras this cache knows for cards of `cell_id`.
    pub fn known_eras(&self, cell_id: CellId) -> BTreeMap<CardId, Era> {
        self.cards
            .iter()
            .filter(|(_, card)| card.cell_id == cell_id)
            .map(|(id, card)| (*id, card.era))
            .collect()
    }

    /// Which synchronization is due at `now_ms`, if any.
    pub fn due(&self, now_ms: u64, config: &AlienCellSynchronizerConfig) -> Option<AlienSyncKind> {
        if now_ms.saturating_sub(self.last_full_sync_ms) >= config.full_sync_period_ms {
            Some(AlienSyncKind::Full)
        } else if now_ms.saturating_sub(self.last_sync_ms) >= config.sync_period_ms {
            Some(AlienSyncKind::Incremental)
        } else {
            None
        }
    }

    /// Records that a synchronization of `kind` finished at `now_ms`.
    pub fn mark_synced(&mut self, kind: AlienSyncKind, now_ms: u64) {
        self.last_sync_ms = now_ms;
        if kind == AlienSyncKind::Full {
            self.last_full_sync_ms = now_ms;
        }
    }

    /// Applies what `cell_id` reported. A full report also drops entries of
    /// `cell_id` that it no longer hosts.
    pub fn apply(&mut self, cell_id: CellId, kind: AlienSyncKind, reported: BTreeMap<CardId, Era>) -> usize {
        if kind == AlienSyncKind::Full {
            self.cards
                .retain(|id, card| card.cell_id != cell_id || reported.contains_key(id));
        }
        let updated = reported.len();
        for (card_id, era) in reported {
            self.cards.insert(card_id, AlienCard { cell_id, era });
        }
        updated
    }

    /// Number of cached cards.
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

/// Cards of `hosted` whose era differs from what the requester `known`.
pub fn changed_eras(
    hosted: &BTreeMap<CardId, Era>,
    known: &BTreeMap<CardId, Era>,
) -> BTreeMap<CardId, Era> {
    hosted
        .iter()
        .filter(|(id, era)| known.get(id) != Some(era))
        .map(|(id, era)| (*id, *era))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ObjectId, ObjectType};

    fn card(n: u64) -> CardId {
        CardId::from_object(ObjectId::new(ObjectType::ReplicationCard, 1, 0, n)).unwrap()
    }

    #[test]
    fn test_due_schedule() {
        let config = AlienCellSynchronizerConfig {
            sync_period_ms: 10,
            full_sync_period_ms: 100,
        };
        let mut cache = AlienCards::new();
        assert_eq!(cache.due(100, &config), Some(AlienSyncKind::Full));
        cache.mark_synced(AlienSyncKind::Full, 100);
        assert_eq!(cache.due(105, &config), None);
        assert_eq!(cache.due(110, &config), Some(AlienSyncKind::Incremental));
        cache.mark_synced(AlienSyncKind::Incremental, 110);
        assert_eq!(cache.due(200, &config), Some(AlienSyncKind::Full));
    }

    #[test]
    fn test_incremental_and_full() {
        let peer = CellId::with_tag(2);
        let mut cache = AlienCards::new();
        let hosted: BTreeMap<_, _> = [(card(1), 1), (card(2), 4)].into_iter().collect();
        let delta = changed_eras(&hosted, &cache.known_eras(peer));
        assert_eq!(cache.apply(peer, AlienSyncKind::Incremental, delta), 2);

        let hosted: BTreeMap<_, _> = [(card(1), 2), (card(2), 4)].into_iter().collect();
        let delta = changed_eras(&hosted, &cache.known_eras(peer));
        assert_eq!(delta.len(), 1);
        cache.apply(peer, AlienSyncKind::Incremental, delta);
        assert_eq!(cache.get(card(1)).unwrap().era, 2);

        let hosted: BTreeMap<_, _> = [(card(2), 5)].into_iter().collect();
        cache.apply(peer, AlienSyncKind::Full, hosted);
        assert!(cache.get(card(1)).is_none());
        assert_eq!(cache.len(), 1);
    }
}
