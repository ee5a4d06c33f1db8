//! Replication card collocations.
//!
//! A collocation groups cards that the tracker switches together and that
//! always migrate together. Every member lives on the collocation's cell and
//! a card belongs to at most one collocation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use crate::error::{ChaosError, ChaosResult};
use crate::store::{CardState, CardStore};
use crate::types::{CardId, CollocationId, ObjectType};

/// A replication card collocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collocation {
    /// Collocation id.
    pub id: CollocationId,
    /// Member cards.
    pub card_ids: BTreeSet<CardId>,
}

impl Collocation {
    /// Collocation type name.
    pub const TYPE: &'static str = "replication";
}

impl CardStore {
    /// Creates a collocation over cards hosted by this cell.
    pub fn create_collocation(&mut self, card_ids: &[CardId]) -> ChaosResult<CollocationId> {
        for card_id in card_ids {
            let record = self.get(*card_id)?;
            if record.state == CardState::RevokingShortcutsForMigration {
                return Err(ChaosError::MigrationInProgress { card_id: *card_id });
            }
            if let Some(existing) = record.card.collocation_id {
                return Err(ChaosError::validation(format!(
                    "replication card {} already belongs to collocation {}",
                    card_id, existing
                )));
            }
        }
        let collocation_id = CollocationId::from_object(self.ids.next(ObjectType::ReplicationCardCollocation))?;
        self.collocations.insert(
            collocation_id,
            Collocation {
                id: collocation_id,
                card_ids: BTreeSet::new(),
            },
        );
        for card_id in card_ids {
            self.attach_to_collocation(*card_id, collocation_id)?;
        }
        debug!(%collocation_id, cards = card_ids.len(), "collocation created");
        Ok(collocation_id)
    }

    /// Looks up a collocation.
    pub fn collocation(&self, collocation_id: CollocationId) -> ChaosResult<&Collocation> {
        self.collocations
            .get(&collocation_id)
            .ok_or(ChaosError::NoSuchCollocation { collocation_id })
    }

    /// Every collocation hosted here.
    pub fn collocations(&self) -> impl Iterator<Item = &Collocation> {
        self.collocations.values()
    }

    pub(crate) fn attach_to_collocation(
        &mut self,
        card_id: CardId,
        collocation_id: CollocationId,
    ) -> ChaosResult<()> {
        let current = self.get(card_id)?.card.collocation_id;
        match current {
            Some(existing) if existing == collocation_id => return Ok(()),
            Some(existing) => {
                return Err(ChaosError::validation(format!(
                    "replication card {} already belongs to collocation {}",
                    card_id, existing
                )))
            }
            None => {}
        }
        let collocation = self
            .collocations
            .get_mut(&collocation_id)
            .ok_or(ChaosError::NoSuchCollocation { collocation_id })?;
        collocation.card_ids.insert(card_id);
        if let Some(record) = self.cards.get_mut(&card_id) {
            record.card.collocation_id = Some(collocation_id);
        }
        Ok(())
    }

    /// Removes the card from its collocation; an emptied collocation is removed.
    pub(crate) fn detach_from_collocation(&mut self, card_id: CardId) -> ChaosResult<()> {
        let Some(record) = self.cards.get_mut(&card_id) else {
            return Err(ChaosError::NoSuchCard { card_id });
        };
        let Some(collocation_id) = record.card.collocation_id.take() else {
            return Ok(());
        };
        if let Some(collocation) = self.collocations.get_mut(&collocation_id) {
            collocation.card_ids.remove(&card_id);
            if collocation.card_ids.is_empty() {
                self.collocations.remove(&collocation_id);
                debug!(%collocation_id, "empty collocation removed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::{CardAttributes, CardPatch};
    use crate::types::{CellId, Timestamp};

    fn store_with_cards(n: usize) -> (CardStore, Vec<CardId>) {
        let mut store = CardStore::new(CellId::with_tag(4));
        let ids = (0..n)
            .map(|_| store.create_card(CardAttributes::default(), Timestamp::MIN).unwrap())
            .collect();
        (store, ids)
    }

    #[test]
    fn test_create_sets_membership() {
        let (mut store, ids) = store_with_cards(2);
        let collocation_id = store.create_collocation(&ids).unwrap();
        for id in &ids {
            assert_eq!(store.get(*id).unwrap().card.collocation_id, Some(collocation_id));
        }
        assert_eq!(store.collocation(collocation_id).unwrap().card_ids.len(), 2);
    }

    #[test]
    fn test_card_in_one_collocation_only() {
        let (mut store, ids) = store_with_cards(2);
        store.create_collocation(&ids[..1]).unwrap();
        assert!(store.create_collocation(&ids).is_err());
    }

    #[test]
    fn test_remove_card_shrinks_and_gcs() {
        let (mut store, ids) = store_with_cards(2);
        let collocation_id = store.create_collocation(&ids).unwrap();
        store.remove_card(ids[0]).unwrap();
        assert_eq!(store.collocation(collocation_id).unwrap().card_ids.len(), 1);
        store
            .alter_card(
                ids[1],
                CardPatch {
                    collocation_id: Some(None),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(store.collocation(collocation_id).is_err());
        assert_eq!(store.get(ids[1]).unwrap().card.collocation_id, None);
    }

    #[test]
    fn test_attach_through_alter_and_create() {
        let (mut store, ids) = store_with_cards(1);
        let collocation_id = store.create_collocation(&ids).unwrap();
        let joined = store
            .create_card(
                CardAttributes {
                    collocation_id: Some(collocation_id),
                    ..Default::default()
                },
                Timestamp::MIN,
            )
            .unwrap();
        assert!(store
            .collocation(collocation_id)
            .unwrap()
            .card_ids
            .contains(&joined));
    }
}
