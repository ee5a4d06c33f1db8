//! Inter-cell messages.
//!
//! Cells never call each other directly. A mutation that needs to talk to
//! another cell posts an [`Envelope`] into its [`Mailbox`]; the directory
//! drains mailboxes and delivers envelopes outside every cell lock.
//! Undeliverable envelopes go back to the mailbox and are retried on the
//! next pump.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::migration::{CollocationSnapshot, ImmigratingCard};
use crate::types::{CardId, CellId, Era};

/// Message exchanged between chaos cells.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellMessage {
    /// Owner asks a coordinator to start serving `card_id` at `era`.
    GrantShortcut {
        /// Card id.
        card_id: CardId,
        /// Era of the shortcut.
        era: Era,
    },
    /// Coordinator acknowledges a grant.
    ShortcutGranted {
        /// Card id.
        card_id: CardId,
        /// Era of the shortcut.
        era: Era,
        /// Whether the coordinator is suspended and did not install it.
        suspended: bool,
    },
    /// Owner asks a coordinator to stop serving `card_id`.
    RevokeShortcut {
        /// Card id.
        card_id: CardId,
        /// Era being revoked.
        era: Era,
    },
    /// Coordinator acknowledges a revocation.
    ShortcutRevoked {
        /// Card id.
        card_id: CardId,
        /// Era that was revoked.
        era: Era,
    },
    /// The sending coordinator was suspended.
    CoordinatorSuspended,
    /// The sending coordinator was resumed.
    CoordinatorResumed,
    /// Cards (and possibly their collocation) moving to the receiver.
    ImmigrateCards {
        /// Migrated cards.
        cards: Vec<ImmigratingCard>,
        /// Collocation shipped with its last member.
        collocation: Option<CollocationSnapshot>,
    },
}

/// A message with routing information.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender cell.
    pub from: CellId,
    /// Receiver cell.
    pub to: CellId,
    /// Payload.
    pub message: CellMessage,
}

/// Outgoing message queue of a cell.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Mailbox {
    pending: VecDeque<Envelope>,
}

impl Mailbox {
    /// Creates an empty mailbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a message.
    pub fn post(&mut self, from: CellId, to: CellId, message: CellMessage) {
        tracing::trace!(%from, %to, ?message, "posting cell message");
        self.pending.push_back(Envelope { from, to, message });
    }

    /// Takes every queued message.
    pub fn drain(&mut self) -> Vec<Envelope> {
        self.pending.drain(..).collect()
    }

    /// Puts back messages that could not be delivered, ahead of newer ones.
    pub fn requeue(&mut self, envelopes: Vec<Envelope>) {
        for envelope in envelopes.into_iter().rev() {
            self.pending.push_front(envelope);
        }
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
