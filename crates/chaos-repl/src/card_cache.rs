//! Client-side cache of replication cards.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use chaos_meta::card::{CardFetchOptions, ReplicationCard};
use chaos_meta::directory::Directory;
use chaos_meta::error::ChaosResult;
use chaos_meta::types::{CardId, Era};

/// Cards by id, each valid until an error reveals a newer era.
#[derive(Debug)]
pub struct CardCache {
    directory: Arc<Directory>,
    cards: RwLock<HashMap<CardId, ReplicationCard>>,
}

impl CardCache {
    /// Empty cache over `directory`.
    pub fn new(directory: Arc<Directory>) -> Self {
        Self {
            directory,
            cards: RwLock::new(HashMap::new()),
        }
    }

    /// Cached card, fetched on a miss.
    pub fn get(&self, card_id: CardId) -> ChaosResult<ReplicationCard> {
        if let Some(card) = self.cards.read().get(&card_id) {
            return Ok(card.clone());
        }
        self.refresh(card_id)
    }

    /// Fetches the card and replaces the cached copy.
    pub fn refresh(&self, card_id: CardId) -> ChaosResult<ReplicationCard> {
        let card = self.directory.get_card(card_id, CardFetchOptions::all())?;
        self.cards.write().insert(card_id, card.clone());
        Ok(card)
    }

    /// Drops the cached card if it is older than `era`.
    pub fn observe_era(&self, card_id: CardId, era: Era) {
        let mut cards = self.cards.write();
        if cards.get(&card_id).map(|c| c.era < era).unwrap_or(false) {
            cards.remove(&card_id);
        }
    }

    /// Drops the cached card.
    pub fn invalidate(&self, card_id: CardId) {
        self.cards.write().remove(&card_id);
    }

    /// Era of the cached card.
    pub fn cached_era(&self, card_id: CardId) -> Option<Era> {
        self.cards.read().get(&card_id).map(|c| c.era)
    }
}
