//! Chaos coordinator: shortcuts, the card state machine and era commencement.
//!
//! Every cell plays two roles. As the *owner* of a card it runs the card
//! state machine:
//!
//! ```text
//! Normal -> RevokingShortcutsForAlter -> GeneratingTimestampForNewEra -> Normal
//! Normal -> RevokingShortcutsForMigration -> Migrated
//! ```
//!
//! As a *coordinator* it holds shortcuts `(card, era)` granted by owners and
//! stamps commit timestamps only for the era of its shortcut. An era never
//! changes while any coordinator still holds a shortcut for the previous one.
//!
//! Mode changes take two eras. The first era records the transitional mode
//! with its barrier timestamp; once every transitional replica has caught up
//! to its barrier, a coordinator tick starts the second era that records the
//! final mode.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::card::{ReplicaHistoryItem, ReplicaInfo, ReplicationCard};
use crate::cell::CellState;
use crate::error::{ChaosError, ChaosResult};
use crate::hive::CellMessage;
use crate::journal::Mutation;
use crate::progress::ReplicationProgress;
use crate::store::{CardState, ShortcutState};
use crate::types::{
    CardId, CellId, Era, ReplicaContentType, ReplicaMode, ReplicaState, Timestamp,
};

/// Coordinator side of shortcuts held by a cell.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorRole {
    suspended: bool,
    shortcuts: BTreeMap<CardId, Era>,
}

impl CoordinatorRole {
    /// Whether the role is suspended.
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Era of the shortcut held for `card_id`.
    pub fn shortcut(&self, card_id: CardId) -> Option<Era> {
        self.shortcuts.get(&card_id).copied()
    }

    /// Every held shortcut.
    pub fn shortcuts(&self) -> &BTreeMap<CardId, Era> {
        &self.shortcuts
    }

    /// Installs a shortcut unless suspended.
    pub(crate) fn install(&mut self, card_id: CardId, era: Era) -> bool {
        if self.suspended {
            return false;
        }
        self.shortcuts.insert(card_id, era);
        true
    }

    pub(crate) fn remove(&mut self, card_id: CardId) -> Option<Era> {
        self.shortcuts.remove(&card_id)
    }

    /// Suspends the role and drops every shortcut.
    pub(crate) fn suspend(&mut self) -> usize {
        self.suspended = true;
        let dropped = self.shortcuts.len();
        self.shortcuts.clear();
        dropped
    }

    pub(crate) fn resume(&mut self) {
        self.suspended = false;
    }

    /// Fails unless this role may stamp writes of `card_id` at `era`.
    pub fn check_shortcut(&self, cell_id: CellId, card_id: CardId, era: Era) -> ChaosResult<()> {
        if self.suspended {
            return Err(ChaosError::CoordinatorSuspended { cell_id });
        }
        match self.shortcuts.get(&card_id) {
            None => Err(ChaosError::NoCoordinator { card_id }),
            Some(held) if *held != era => Err(ChaosError::EraMismatch {
                expected: *held,
                actual: era,
            }),
            Some(_) => Ok(()),
        }
    }
}

/// Why shortcuts are being revoked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RevokeReason {
    /// A new era must be commenced.
    Alter,
    /// The card is leaving the cell.
    Migration,
}

/// Whether the first phase of a replica's pending transition is done.
///
/// A replica that is not enabled at the current era has nothing to flush.
/// Otherwise the current era must already record the transitional mode and
/// the replica must have caught up to that era's barrier.
pub fn is_phase_one_done(replica: &ReplicaInfo) -> bool {
    match replica.last_history_item() {
        None => true,
        Some(item) if item.state != ReplicaState::Enabled => true,
        Some(item) => {
            item.mode == replica.mode
                && replica
                    .replication_progress
                    .is_ge_timestamp(item.timestamp)
        }
    }
}

/// Whether a normal card should start the second phase of its pending mode
/// transitions.
pub fn is_ready_for_final_modes(card: &ReplicationCard) -> bool {
    let mut pending = card
        .replicas
        .values()
        .filter(|r| !r.mode.is_stable())
        .peekable();
    pending.peek().is_some() && pending.all(is_phase_one_done)
}

fn next_mode(replica: &ReplicaInfo) -> ReplicaMode {
    match replica.mode {
        ReplicaMode::SyncToAsync if is_phase_one_done(replica) => ReplicaMode::Async,
        ReplicaMode::AsyncToSync if is_phase_one_done(replica) => ReplicaMode::Sync,
        mode => mode,
    }
}

fn next_state(replica: &ReplicaInfo) -> ReplicaState {
    match replica.state {
        ReplicaState::Enabling => ReplicaState::Enabled,
        ReplicaState::Disabling => ReplicaState::Disabled,
        state => state,
    }
}

impl CellState {
    /// Moves a normal card towards a new era. Cards already on their way to
    /// one pick up the change when they commence.
    pub(crate) fn request_new_era(&mut self, card_id: CardId, timestamp: impl FnMut() -> Timestamp, now_ms: u64) {
        let Some(record) = self.store.find(card_id) else {
            return;
        };
        if record.state != CardState::Normal {
            debug!(%card_id, state = ?record.state, "skipping replication card state update");
            return;
        }
        self.revoke_shortcuts(card_id, RevokeReason::Alter, timestamp, now_ms);
    }

    /// Revokes every shortcut of a normal card.
    pub(crate) fn revoke_shortcuts(
        &mut self,
        card_id: CardId,
        reason: RevokeReason,
        timestamp: impl FnMut() -> Timestamp,
        now_ms: u64,
    ) {
        let cell_id = self.cell_id;
        let Some(record) = self.store.find_mut(card_id) else {
            return;
        };
        record.state = match reason {
            RevokeReason::Alter => CardState::RevokingShortcutsForAlter,
            RevokeReason::Migration => CardState::RevokingShortcutsForMigration,
        };
        let era = record.card.era;
        for (coordinator, state) in record.coordinators.iter_mut() {
            if *state == ShortcutState::Revoking {
                continue;
            }
            *state = ShortcutState::Revoking;
            self.mailbox
                .post(cell_id, *coordinator, CellMessage::RevokeShortcut { card_id, era });
            debug!(%card_id, era, %coordinator, "revoking shortcut");
        }
        record.refresh_coordinator_cell_ids();
        self.journal.append(Mutation::RevokeShortcuts { card_id, era });
        self.handle_state_transition(card_id, timestamp, now_ms);
    }

    /// Advances the card state machine after its coordinator set changed.
    pub(crate) fn handle_state_transition(
        &mut self,
        card_id: CardId,
        mut timestamp: impl FnMut() -> Timestamp,
        now_ms: u64,
    ) {
        let Some(record) = self.store.find_mut(card_id) else {
            return;
        };
        if !record.coordinators.is_empty() {
            return;
        }
        match record.state {
            CardState::RevokingShortcutsForAlter => {
                record.state = CardState::GeneratingTimestampForNewEra;
                let ts = timestamp();
                self.commence_new_era(card_id, ts);
            }
            CardState::GeneratingTimestampForNewEra => {
                let ts = timestamp();
                self.commence_new_era(card_id, ts);
            }
            CardState::RevokingShortcutsForMigration => self.emigrate_card(card_id, now_ms),
            CardState::Normal | CardState::Migrated => {}
        }
    }

    /// Commences the next era of a card waiting for one. Returns whether an
    /// era was commenced.
    pub(crate) fn commence_new_era(&mut self, card_id: CardId, timestamp: Timestamp) -> bool {
        let Some(record) = self.store.find_mut(card_id) else {
            return false;
        };
        if timestamp > record.card.current_timestamp {
            record.card.current_timestamp = timestamp;
        }
        if record.state != CardState::GeneratingTimestampForNewEra {
            return false;
        }

        let next: BTreeMap<_, _> = record
            .card
            .replicas
            .iter()
            .map(|(id, r)| (*id, (next_mode(r), next_state(r))))
            .collect();
        let has_sync_queue = record.card.replicas.iter().any(|(id, r)| {
            let (mode, state) = next[id];
            r.content_type == ReplicaContentType::Queue
                && mode.receives_writes()
                && state == ReplicaState::Enabled
        });
        if !has_sync_queue {
            debug!(%card_id, "will not commence new replication era since there would be no sync queue replicas");
            return false;
        }

        let era = record.card.era + 1;
        record.card.era = era;
        record.card.current_timestamp = timestamp;
        for (replica_id, replica) in record.card.replicas.iter_mut() {
            let (mode, state) = next[replica_id];
            replica.mode = mode;
            replica.state = state;
            let changed = match replica.last_history_item() {
                Some(last) => (last.mode, last.state) != (mode, state),
                None => state != ReplicaState::Disabled,
            };
            if !changed {
                continue;
            }
            if replica.history.is_empty() {
                replica.replication_progress = ReplicationProgress::full(timestamp);
            }
            replica.history.push(ReplicaHistoryItem {
                era,
                timestamp,
                mode,
                state,
            });
            debug!(%card_id, %replica_id, era, %mode, %state, "replica history item recorded");
        }
        record.state = CardState::Normal;
        info!(%card_id, era, %timestamp, "starting new replication era");
        self.journal.append(Mutation::CommenceEra {
            card_id,
            era,
            timestamp,
        });
        self.grant_shortcuts(card_id, None);
        true
    }

    /// Grants shortcuts of a normal card to non-suspended coordinators, or
    /// to `only` if given.
    pub(crate) fn grant_shortcuts(&mut self, card_id: CardId, only: Option<CellId>) {
        let cell_id = self.cell_id;
        let Some(record) = self.store.find_mut(card_id) else {
            return;
        };
        if record.state != CardState::Normal {
            return;
        }
        let era = record.card.era;
        for coordinator in self.coordinator_cell_ids.iter().copied() {
            if only.is_some_and(|only| only != coordinator)
                || self.suspended_coordinators.contains(&coordinator)
                || record.coordinators.contains_key(&coordinator)
            {
                continue;
            }
            record
                .coordinators
                .insert(coordinator, ShortcutState::Granting);
            self.mailbox
                .post(cell_id, coordinator, CellMessage::GrantShortcut { card_id, era });
            debug!(%card_id, era, %coordinator, "granting shortcut to coordinator");
        }
    }

    /// Applies an inter-cell message.
    pub(crate) fn handle_message(
        &mut self,
        from: CellId,
        message: CellMessage,
        mut timestamp: impl FnMut() -> Timestamp,
        now_ms: u64,
    ) {
        let cell_id = self.cell_id;
        match message {
            CellMessage::GrantShortcut { card_id, era } => {
                let installed = self.role.install(card_id, era);
                if installed {
                    self.journal.append(Mutation::Shortcut {
                        card_id,
                        era: Some(era),
                    });
                    debug!(%card_id, era, owner = %from, "shortcut granted");
                }
                self.mailbox.post(
                    cell_id,
                    from,
                    CellMessage::ShortcutGranted {
                        card_id,
                        era,
                        suspended: !installed,
                    },
                );
            }
            CellMessage::RevokeShortcut { card_id, era } => {
                if self.role.remove(card_id).is_some() {
                    self.journal.append(Mutation::Shortcut { card_id, era: None });
                }
                debug!(%card_id, era, owner = %from, "shortcut revoked");
                self.mailbox
                    .post(cell_id, from, CellMessage::ShortcutRevoked { card_id, era });
            }
            CellMessage::ShortcutGranted {
                card_id,
                era,
                suspended,
            } => {
                let Some(record) = self.store.find_mut(card_id) else {
                    return;
                };
                if record.card.era != era {
                    return;
                }
                let current = record.coordinators.get(&from).copied();
                match current {
                    Some(ShortcutState::Granting) if suspended => {
                        record.coordinators.remove(&from);
                    }
                    Some(ShortcutState::Granting) => {
                        record.coordinators.insert(from, ShortcutState::Granted);
                    }
                    _ => {}
                }
                record.refresh_coordinator_cell_ids();
            }
            CellMessage::ShortcutRevoked { card_id, .. } => {
                let Some(record) = self.store.find_mut(card_id) else {
                    return;
                };
                if record.coordinators.get(&from) != Some(&ShortcutState::Revoking) {
                    return;
                }
                record.coordinators.remove(&from);
                record.refresh_coordinator_cell_ids();
                self.handle_state_transition(card_id, &mut timestamp, now_ms);
            }
            CellMessage::CoordinatorSuspended => self.on_coordinator_suspended(from),
            CellMessage::CoordinatorResumed => self.on_coordinator_resumed(from),
            CellMessage::ImmigrateCards { cards, collocation } => {
                for card in cards {
                    match self.store.immigrate(card, from, now_ms) {
                        Ok(card_id) => {
                            self.journal.append(Mutation::Immigrate { card_id });
                            self.grant_shortcuts(card_id, None);
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, from = %from, "rejected immigrating card")
                        }
                    }
                }
                if let Some(collocation) = collocation {
                    let collocation_id = collocation.id;
                    self.store.immigrate_collocation(collocation);
                    self.journal.append(Mutation::Collocation { collocation_id });
                }
            }
        }
    }

    pub(crate) fn on_coordinator_suspended(&mut self, coordinator: CellId) {
        if !self.suspended_coordinators.insert(coordinator) {
            return;
        }
        for record in self.store.records_mut() {
            if record.state == CardState::Normal && record.coordinators.remove(&coordinator).is_some() {
                record.refresh_coordinator_cell_ids();
            }
        }
        self.journal
            .append(Mutation::SuspendCoordinator { cell_id: coordinator });
        info!(%coordinator, owner = %self.cell_id, "coordinator suspended");
    }

    pub(crate) fn on_coordinator_resumed(&mut self, coordinator: CellId) {
        if !self.suspended_coordinators.remove(&coordinator) {
            return;
        }
        self.journal
            .append(Mutation::ResumeCoordinator { cell_id: coordinator });
        for card_id in self.store.card_ids() {
            self.grant_shortcuts(card_id, Some(coordinator));
        }
        info!(%coordinator, owner = %self.cell_id, "coordinator resumed");
    }

    /// Ships a card whose shortcuts are all revoked to its destination.
    fn emigrate_card(&mut self, card_id: CardId, now_ms: u64) {
        match self.store.emigrate(card_id, now_ms) {
            Ok((destination, card, collocation)) => {
                self.journal.append(Mutation::Emigrate { card_id });
                self.mailbox.post(
                    self.cell_id,
                    destination,
                    CellMessage::ImmigrateCards {
                        cards: vec![card],
                        collocation,
                    },
                );
            }
            Err(err) => tracing::warn!(%card_id, error = %err, "replication card emigration failed"),
        }
    }

    /// Publishes `timestamp` as the current timestamp of every hosted card
    /// and retries eras that could not commence.
    pub(crate) fn propagate_current_timestamp(&mut self, timestamp: Timestamp) -> usize {
        let card_ids = self.store.card_ids();
        for card_id in &card_ids {
            self.commence_new_era(*card_id, timestamp);
        }
        card_ids.len()
    }

    /// Starts the second phase of pending mode transitions that are ready.
    pub(crate) fn finalize_transitions(&mut self, mut timestamp: impl FnMut() -> Timestamp, now_ms: u64) {
        let ready: Vec<CardId> = self
            .store
            .records()
            .filter(|r| r.state == CardState::Normal && is_ready_for_final_modes(&r.card))
            .map(|r| r.card.id)
            .collect();
        for card_id in ready {
            debug!(%card_id, "replicas caught up to transition barrier");
            self.revoke_shortcuts(card_id, RevokeReason::Alter, &mut timestamp, now_ms);
        }
    }
}
