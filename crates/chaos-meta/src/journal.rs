//! Mutation journal of a chaos cell.
//!
//! Records committed cell mutations in sequence order. The journal stands in
//! for the quorum log: every successful mutation is appended before its
//! effects become visible, and tests tail it to observe what a cell did.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::types::{now_ms, CardId, CellId, CollocationId, Era, ReplicaId, Timestamp};

/// A committed cell mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    /// A card was created.
    CreateCard {
        /// New card.
        card_id: CardId,
    },
    /// Card options or collocation changed.
    AlterCard {
        /// Altered card.
        card_id: CardId,
    },
    /// A card was removed.
    RemoveCard {
        /// Removed card.
        card_id: CardId,
    },
    /// A replica was created.
    CreateReplica {
        /// Replica id.
        replica_id: ReplicaId,
    },
    /// A replica's mode, state or tracker flag changed.
    AlterReplica {
        /// Replica id.
        replica_id: ReplicaId,
    },
    /// A replica was removed.
    RemoveReplica {
        /// Replica id.
        replica_id: ReplicaId,
    },
    /// A replica reported progress.
    UpdateReplicaProgress {
        /// Replica id.
        replica_id: ReplicaId,
    },
    /// A card started revoking shortcuts.
    RevokeShortcuts {
        /// Card id.
        card_id: CardId,
        /// Era being revoked.
        era: Era,
    },
    /// A card commenced a new era.
    CommenceEra {
        /// Card id.
        card_id: CardId,
        /// New era.
        era: Era,
        /// Barrier timestamp.
        timestamp: Timestamp,
    },
    /// Current timestamps were propagated.
    PropagateTimestamps {
        /// Number of cards updated.
        cards: usize,
    },
    /// Old replica history items were forsaken.
    RemoveExpiredReplicaHistory {
        /// Number of items dropped.
        items: usize,
    },
    /// This cell granted or revoked a coordinator shortcut.
    Shortcut {
        /// Card id.
        card_id: CardId,
        /// Granted era, or `None` for a revocation.
        era: Option<Era>,
    },
    /// A coordinator cell was suspended.
    SuspendCoordinator {
        /// Suspended coordinator.
        cell_id: CellId,
    },
    /// A coordinator cell was resumed.
    ResumeCoordinator {
        /// Resumed coordinator.
        cell_id: CellId,
    },
    /// The coordinator cell list changed.
    UpdateCoordinatorCells {
        /// New list.
        cell_ids: Vec<CellId>,
    },
    /// Cards started emigrating.
    MigrateCards {
        /// Migrating cards.
        card_ids: Vec<CardId>,
        /// Destination cell.
        destination: CellId,
    },
    /// A card left this cell.
    Emigrate {
        /// Card id.
        card_id: CardId,
    },
    /// A card arrived at this cell.
    Immigrate {
        /// Card id.
        card_id: CardId,
    },
    /// A collocation was created or changed.
    Collocation {
        /// Collocation id.
        collocation_id: CollocationId,
    },
    /// A write timestamp was issued.
    GenerateCommitTimestamp {
        /// Card id.
        card_id: CardId,
        /// Issued timestamp.
        timestamp: Timestamp,
    },
}

/// A journal entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// The committed mutation.
    pub mutation: Mutation,
    /// Commit wall time.
    pub committed_at_ms: u64,
}

/// Append-only log of committed mutations with bounded in-memory retention.
#[derive(Debug, Clone)]
pub struct CellJournal {
    entries: VecDeque<JournalEntry>,
    next_sequence: u64,
    max_entries: usize,
}

impl CellJournal {
    /// Creates an empty journal.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            next_sequence: 1,
            max_entries,
        }
    }

    /// Creates a journal continuing after `last_sequence`.
    pub fn resume(max_entries: usize, last_sequence: u64) -> Self {
        Self {
            entries: VecDeque::new(),
            next_sequence: last_sequence + 1,
            max_entries,
        }
    }

    /// Appends a mutation and returns its sequence number.
    pub fn append(&mut self, mutation: Mutation) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.push_back(JournalEntry {
            sequence,
            mutation,
            committed_at_ms: now_ms(),
        });
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
        sequence
    }

    /// Up to `limit` entries starting at `from_sequence`.
    pub fn read_from(&self, from_sequence: u64, limit: usize) -> Vec<JournalEntry> {
        self.entries
            .iter()
            .filter(|e| e.sequence >= from_sequence)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Sequence number of the latest entry, zero if none.
    pub fn latest_sequence(&self) -> u64 {
        self.next_sequence.saturating_sub(1)
    }

    /// Entries retained in memory.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are retained.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
