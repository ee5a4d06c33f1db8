//! Chaos cell: a single-threaded replicated state machine hosting cards.
//!
//! The quorum protocol is modelled by one mutex around [`CellState`], an
//! availability switch and a [`CellJournal`] every mutation is appended to.
//! Outgoing inter-cell traffic is queued in the cell's [`Mailbox`] and
//! delivered by the directory outside the cell lock.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::alien::{AlienCard, AlienCards, AlienSyncKind};
use crate::card::{CardAttributes, CardFetchOptions, CardPatch, ReplicaPatch, ReplicaSpec, ReplicationCard};
use crate::clock::{timestamp_from_ms, Clock};
use crate::collocation::Collocation;
use crate::config::ChaosCellConfig;
use crate::coordinator::{CoordinatorRole, RevokeReason};
use crate::error::{ChaosError, ChaosResult};
use crate::faults::{FaultInjector, FaultPoint, NoFaults};
use crate::hive::{CellMessage, Envelope, Mailbox};
use crate::journal::{CellJournal, JournalEntry, Mutation};
use crate::progress::ReplicationProgress;
use crate::snapshot::CellSnapshot;
use crate::store::{CardRecord, CardState, CardStore};
use crate::types::{now_ms, CardId, CellId, CollocationId, Era, ReplicaId, Timestamp};

/// Mutable state of a cell, guarded by the cell lock.
#[derive(Debug)]
pub(crate) struct CellState {
    pub(crate) cell_id: CellId,
    pub(crate) store: CardStore,
    pub(crate) role: CoordinatorRole,
    pub(crate) coordinator_cell_ids: Vec<CellId>,
    pub(crate) suspended_coordinators: BTreeSet<CellId>,
    pub(crate) mailbox: Mailbox,
    pub(crate) journal: CellJournal,
    pub(crate) alien: AlienCards,
}

/// A chaos cell.
pub struct ChaosCell {
    cell_id: CellId,
    bundle: String,
    clock: Arc<Clock>,
    config: ChaosCellConfig,
    faults: Arc<dyn FaultInjector>,
    available: AtomicBool,
    state: Mutex<CellState>,
}

impl fmt::Debug for ChaosCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChaosCell")
            .field("cell_id", &self.cell_id)
            .field("bundle", &self.bundle)
            .field("available", &self.is_available())
            .finish()
    }
}

impl ChaosCell {
    /// Creates an empty cell of `bundle` stamping with `clock`.
    pub fn new(cell_id: CellId, bundle: impl Into<String>, clock: Arc<Clock>, config: ChaosCellConfig) -> Self {
        let journal = CellJournal::new(config.journal_max_entries);
        Self::from_state(
            bundle.into(),
            clock,
            config,
            CellState {
                cell_id,
                store: CardStore::new(cell_id),
                role: CoordinatorRole::default(),
                coordinator_cell_ids: vec![cell_id],
                suspended_coordinators: BTreeSet::new(),
                mailbox: Mailbox::new(),
                journal,
                alien: AlienCards::new(),
            },
        )
    }

    /// Recreates a cell from a snapshot.
    pub fn restore(
        snapshot: CellSnapshot,
        bundle: impl Into<String>,
        clock: Arc<Clock>,
        config: ChaosCellConfig,
    ) -> Self {
        let journal = CellJournal::resume(config.journal_max_entries, snapshot.journal_sequence);
        info!(cell_id = %snapshot.cell_id, cards = snapshot.store.card_ids().len(), "restoring chaos cell from snapshot");
        Self::from_state(
            bundle.into(),
            clock,
            config,
            CellState {
                cell_id: snapshot.cell_id,
                store: snapshot.store,
                role: snapshot.role,
                coordinator_cell_ids: snapshot.coordinator_cell_ids,
                suspended_coordinators: snapshot.suspended_coordinators,
                mailbox: Mailbox::new(),
                journal,
                alien: AlienCards::new(),
            },
        )
    }

    fn from_state(bundle: String, clock: Arc<Clock>, config: ChaosCellConfig, state: CellState) -> Self {
        Self {
            cell_id: state.cell_id,
            bundle,
            clock,
            config,
            faults: Arc::new(NoFaults),
            available: AtomicBool::new(true),
            state: Mutex::new(state),
        }
    }

    /// Replaces the fault injector.
    pub fn with_faults(mut self, faults: Arc<dyn FaultInjector>) -> Self {
        self.faults = faults;
        self
    }

    /// Cell id.
    pub fn cell_id(&self) -> CellId {
        self.cell_id
    }

    /// Bundle name.
    pub fn bundle(&self) -> &str {
        &self.bundle
    }

    /// Clock of the bundle.
    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    /// Whether the cell can commit.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Turns quorum loss on or off.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        info!(cell_id = %self.cell_id, available, "chaos cell availability changed");
    }

    fn ensure_available(&self) -> ChaosResult<()> {
        if !self.is_available() {
            return Err(ChaosError::QuorumUnavailable {
                cell_id: self.cell_id,
            });
        }
        Ok(())
    }

    fn ensure_committable(&self) -> ChaosResult<()> {
        self.ensure_available()?;
        self.faults.check(&FaultPoint::CellCommit {
            cell_id: self.cell_id,
        })
    }

    fn timestamps(&self) -> impl FnMut() -> Timestamp + '_ {
        move || self.clock.generate()
    }

    /// Creates a card.
    pub fn create_card(&self, attrs: CardAttributes) -> ChaosResult<CardId> {
        self.ensure_committable()?;
        let mut state = self.state.lock();
        let card_id = state.store.create_card(attrs, self.clock.latest())?;
        state.journal.append(Mutation::CreateCard { card_id });
        Ok(card_id)
    }

    /// Reads a card.
    pub fn get_card(&self, card_id: CardId, options: CardFetchOptions) -> ChaosResult<ReplicationCard> {
        self.ensure_available()?;
        let state = self.state.lock();
        let record = state.store.get(card_id)?;
        Ok(options.apply(record.card.clone()))
    }

    /// Reads a card together with its cell-local bookkeeping.
    pub fn card_record(&self, card_id: CardId) -> ChaosResult<CardRecord> {
        self.ensure_available()?;
        let state = self.state.lock();
        state
            .store
            .find(card_id)
            .cloned()
            .ok_or(ChaosError::NoSuchCard { card_id })
    }

    /// Lifecycle state of a card, including migrated tombstones.
    pub fn card_state(&self, card_id: CardId) -> ChaosResult<CardState> {
        let state = self.state.lock();
        state
            .store
            .find(card_id)
            .map(|r| r.state)
            .ok_or(ChaosError::NoSuchCard { card_id })
    }

    /// Whether the card is hosted here.
    pub fn exists(&self, card_id: CardId) -> bool {
        self.state.lock().store.exists(card_id)
    }

    /// Ids of hosted cards.
    pub fn card_ids(&self) -> Vec<CardId> {
        self.state.lock().store.card_ids()
    }

    /// Alters card options or collocation membership.
    pub fn alter_card(&self, card_id: CardId, patch: CardPatch) -> ChaosResult<()> {
        self.ensure_committable()?;
        let mut state = self.state.lock();
        state.store.alter_card(card_id, patch)?;
        state.journal.append(Mutation::AlterCard { card_id });
        Ok(())
    }

    /// Removes a normal card and revokes its shortcuts.
    pub fn remove_card(&self, card_id: CardId) -> ChaosResult<()> {
        self.ensure_committable()?;
        let mut state = self.state.lock();
        let coordinators: Vec<CellId> = state.store.get_mutable(card_id)?.coordinators.keys().copied().collect();
        let card = state.store.remove_card(card_id)?;
        for coordinator in coordinators {
            state.mailbox.post(
                self.cell_id,
                coordinator,
                CellMessage::RevokeShortcut { card_id, era: card.era },
            );
        }
        state.journal.append(Mutation::RemoveCard { card_id });
        Ok(())
    }

    /// Creates a replica; enabling replicas move the card to a new era.
    pub fn create_replica(&self, card_id: CardId, spec: ReplicaSpec) -> ChaosResult<ReplicaId> {
        self.ensure_committable()?;
        let mut state = self.state.lock();
        let change = state.store.create_replica(card_id, spec)?;
        state.journal.append(Mutation::CreateReplica {
            replica_id: change.replica_id,
        });
        if change.needs_new_era {
            state.request_new_era(card_id, self.timestamps(), now_ms());
        }
        Ok(change.replica_id)
    }

    /// Alters a replica; mode and state changes move the card to a new era.
    pub fn alter_replica(&self, card_id: CardId, replica_id: ReplicaId, patch: ReplicaPatch) -> ChaosResult<()> {
        self.ensure_committable()?;
        let mut state = self.state.lock();
        let change = state.store.alter_replica(card_id, replica_id, patch)?;
        state.journal.append(Mutation::AlterReplica { replica_id });
        if change.needs_new_era {
            state.request_new_era(card_id, self.timestamps(), now_ms());
        }
        Ok(())
    }

    /// Removes a disabled replica.
    pub fn remove_replica(&self, card_id: CardId, replica_id: ReplicaId) -> ChaosResult<()> {
        self.ensure_committable()?;
        let mut state = self.state.lock();
        state.store.remove_replica(card_id, replica_id)?;
        state.journal.append(Mutation::RemoveReplica { replica_id });
        Ok(())
    }

    /// Merges progress reported by a replica.
    pub fn update_replica_progress(
        &self,
        card_id: CardId,
        replica_id: ReplicaId,
        progress: &ReplicationProgress,
    ) -> ChaosResult<()> {
        self.ensure_committable()?;
        let mut state = self.state.lock();
        state.store.update_replica_progress(card_id, replica_id, progress)?;
        state
            .journal
            .append(Mutation::UpdateReplicaProgress { replica_id });
        Ok(())
    }

    /// Creates a collocation of hosted cards.
    pub fn create_collocation(&self, card_ids: &[CardId]) -> ChaosResult<CollocationId> {
        self.ensure_committable()?;
        let mut state = self.state.lock();
        let collocation_id = state.store.create_collocation(card_ids)?;
        state.journal.append(Mutation::Collocation { collocation_id });
        Ok(collocation_id)
    }

    /// Reads a collocation.
    pub fn get_collocation(&self, collocation_id: CollocationId) -> ChaosResult<Collocation> {
        self.ensure_available()?;
        self.state.lock().store.collocation(collocation_id).cloned()
    }

    /// Starts migrating `card_ids` to `destination`.
    pub fn migrate_cards(&self, card_ids: &[CardId], destination: CellId) -> ChaosResult<()> {
        self.ensure_committable()?;
        let mut state = self.state.lock();
        if !state.coordinator_cell_ids.contains(&destination) {
            return Err(ChaosError::validation(format!(
                "trying to migrate replication cards to unknown cell {}",
                destination
            )));
        }
        state.store.validate_migration(card_ids, destination)?;
        state.journal.append(Mutation::MigrateCards {
            card_ids: card_ids.to_vec(),
            destination,
        });
        let now = now_ms();
        for card_id in card_ids {
            if let Some(record) = state.store.find_mut(*card_id) {
                record.migrate_to = Some(destination);
            }
            state.revoke_shortcuts(*card_id, RevokeReason::Migration, self.timestamps(), now);
        }
        info!(cell_id = %self.cell_id, %destination, cards = card_ids.len(), "replication card migration started");
        Ok(())
    }

    /// Issues a commit timestamp for a write of `card_id` at `era`.
    pub fn generate_commit_timestamp(&self, card_id: CardId, era: Era) -> ChaosResult<Timestamp> {
        self.ensure_available()?;
        let mut state = self.state.lock();
        state.role.check_shortcut(self.cell_id, card_id, era)?;
        let timestamp = self.clock.generate();
        state
            .journal
            .append(Mutation::GenerateCommitTimestamp { card_id, timestamp });
        Ok(timestamp)
    }

    /// Suspends the coordinator role of this cell.
    pub fn suspend_coordinator(&self) -> ChaosResult<()> {
        self.ensure_committable()?;
        let mut state = self.state.lock();
        if state.role.is_suspended() {
            return Ok(());
        }
        let dropped = state.role.suspend();
        let cell_id = self.cell_id;
        state.on_coordinator_suspended(cell_id);
        for peer in state.coordinator_cell_ids.clone() {
            if peer != cell_id {
                state.mailbox.post(cell_id, peer, CellMessage::CoordinatorSuspended);
            }
        }
        info!(%cell_id, dropped, "coordinator role suspended");
        Ok(())
    }

    /// Resumes the coordinator role of this cell.
    pub fn resume_coordinator(&self) -> ChaosResult<()> {
        self.ensure_committable()?;
        let mut state = self.state.lock();
        if !state.role.is_suspended() {
            return Ok(());
        }
        state.role.resume();
        let cell_id = self.cell_id;
        state.on_coordinator_resumed(cell_id);
        for peer in state.coordinator_cell_ids.clone() {
            if peer != cell_id {
                state.mailbox.post(cell_id, peer, CellMessage::CoordinatorResumed);
            }
        }
        info!(%cell_id, "coordinator role resumed");
        Ok(())
    }

    /// Coordinator role snapshot.
    pub fn coordinator_role(&self) -> CoordinatorRole {
        self.state.lock().role.clone()
    }

    /// Coordinators this cell considers suspended.
    pub fn suspended_coordinators(&self) -> BTreeSet<CellId> {
        self.state.lock().suspended_coordinators.clone()
    }

    /// Coordinator cells of the bundle.
    pub fn coordinator_cell_ids(&self) -> Vec<CellId> {
        self.state.lock().coordinator_cell_ids.clone()
    }

    /// Replaces the coordinator cell list and grants shortcuts to new cells.
    pub fn set_coordinator_cell_ids(&self, cell_ids: Vec<CellId>) {
        let mut state = self.state.lock();
        let added: Vec<CellId> = cell_ids
            .iter()
            .copied()
            .filter(|id| !state.coordinator_cell_ids.contains(id))
            .collect();
        state.coordinator_cell_ids = cell_ids.clone();
        state
            .journal
            .append(Mutation::UpdateCoordinatorCells { cell_ids });
        for card_id in state.store.card_ids() {
            for cell_id in &added {
                state.grant_shortcuts(card_id, Some(*cell_id));
            }
        }
    }

    /// Periodic work: current timestamp propagation, retries of pending
    /// eras, second phases of mode transitions and history expiry.
    pub fn tick(&self) -> ChaosResult<()> {
        self.ensure_committable()?;
        let now = now_ms();
        let mut state = self.state.lock();

        let propagated = state.propagate_current_timestamp(self.clock.generate());
        state
            .journal
            .append(Mutation::PropagateTimestamps { cards: propagated });

        state.finalize_transitions(self.timestamps(), now);

        let horizon = timestamp_from_ms(now.saturating_sub(self.config.replica_history_retention_ms));
        let mut forsaken = 0;
        for card_id in state.store.card_ids() {
            let retain = state
                .store
                .find(card_id)
                .and_then(|r| r.card.minimal_progress())
                .map(|p| p.min_timestamp().min(horizon))
                .unwrap_or(horizon);
            forsaken += state.store.remove_expired_replica_history(card_id, retain);
        }
        if forsaken > 0 {
            state
                .journal
                .append(Mutation::RemoveExpiredReplicaHistory { items: forsaken });
        }
        Ok(())
    }

    /// Applies an inter-cell message. Fails if the cell cannot commit, in
    /// which case the sender retries.
    pub fn handle_message(&self, from: CellId, message: CellMessage) -> ChaosResult<()> {
        self.ensure_committable()?;
        let mut state = self.state.lock();
        state.handle_message(from, message, self.timestamps(), now_ms());
        Ok(())
    }

    /// Takes every queued outgoing message.
    pub fn drain_outbox(&self) -> Vec<Envelope> {
        self.state.lock().mailbox.drain()
    }

    /// Puts back undeliverable messages.
    pub fn requeue(&self, envelopes: Vec<Envelope>) {
        if envelopes.is_empty() {
            return;
        }
        debug!(cell_id = %self.cell_id, count = envelopes.len(), "requeueing undelivered cell messages");
        self.state.lock().mailbox.requeue(envelopes);
    }

    /// Number of queued outgoing messages.
    pub fn outbox_len(&self) -> usize {
        self.state.lock().mailbox.len()
    }

    /// Journal entries starting at `from_sequence`.
    pub fn journal(&self, from_sequence: u64, limit: usize) -> Vec<JournalEntry> {
        self.state.lock().journal.read_from(from_sequence, limit)
    }

    /// Latest journal sequence number.
    pub fn journal_sequence(&self) -> u64 {
        self.state.lock().journal.latest_sequence()
    }

    /// Eras of hosted cards, as served to alien synchronizers.
    pub fn card_eras(&self) -> BTreeMap<CardId, Era> {
        let state = self.state.lock();
        state
            .store
            .records()
            .filter(|r| r.state != CardState::Migrated)
            .map(|r| (r.card.id, r.card.era))
            .collect()
    }

    /// Which alien synchronization is due.
    pub fn alien_sync_due(&self, now_ms: u64) -> Option<AlienSyncKind> {
        self.state
            .lock()
            .alien
            .due(now_ms, &self.config.alien_cell_synchronizer)
    }

    /// Eras this cell knows for cards of `peer`.
    pub fn known_alien_eras(&self, peer: CellId) -> BTreeMap<CardId, Era> {
        self.state.lock().alien.known_eras(peer)
    }

    /// Stores what `peer` reported.
    pub fn apply_alien_report(&self, peer: CellId, kind: AlienSyncKind, reported: BTreeMap<CardId, Era>) {
        let updated = self.state.lock().alien.apply(peer, kind, reported);
        if updated > 0 {
            debug!(cell_id = %self.cell_id, %peer, ?kind, updated, "alien cards synchronized");
        }
    }

    /// Records a finished alien synchronization round.
    pub fn finish_alien_sync(&self, kind: AlienSyncKind, now_ms: u64) {
        self.state.lock().alien.mark_synced(kind, now_ms);
    }

    /// Cached location of a card hosted by a peer.
    pub fn alien_card(&self, card_id: CardId) -> Option<AlienCard> {
        self.state.lock().alien.get(card_id)
    }

    /// Captures a snapshot of the cell.
    pub fn snapshot(&self) -> CellSnapshot {
        let state = self.state.lock();
        if !state.mailbox.is_empty() {
            warn!(cell_id = %self.cell_id, pending = state.mailbox.len(), "snapshot taken with undelivered messages");
        }
        CellSnapshot::new(
            state.store.clone(),
            state.role.clone(),
            state.coordinator_cell_ids.clone(),
            state.suspended_coordinators.clone(),
            state.journal.latest_sequence(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faults::{FaultController, FaultMode, FaultTarget};
    use crate::types::{ClusterTag, ReplicaContentType, ReplicaMode, ReplicaState, INITIAL_ERA};

    fn cell() -> ChaosCell {
        ChaosCell::new(
            CellId::with_tag(1),
            "chaos",
            Arc::new(Clock::new(ClusterTag::new(1))),
            ChaosCellConfig::default(),
        )
    }

    fn pump(cell: &ChaosCell) {
        loop {
            let envelopes = cell.drain_outbox();
            if envelopes.is_empty() {
                break;
            }
            for envelope in envelopes {
                assert_eq!(envelope.to, cell.cell_id());
                cell.handle_message(envelope.from, envelope.message).unwrap();
            }
        }
    }

    fn queue() -> ReplicaSpec {
        ReplicaSpec::new("a", "//q", ReplicaContentType::Queue, ReplicaMode::Sync, true)
    }

    mod eras {
        use super::*;

        #[test]
        fn test_first_replica_commences_era() {
            let cell = cell();
            let card_id = cell.create_card(CardAttributes::default()).unwrap();
            let replica_id = cell.create_replica(card_id, queue()).unwrap();
            let card = cell.get_card(card_id, CardFetchOptions::all()).unwrap();
            assert_eq!(card.era, INITIAL_ERA + 1);
            assert!(card.is_writable());
            assert_eq!(card.replica(replica_id).unwrap().state, ReplicaState::Enabled);

            pump(&cell);
            let card = cell.get_card(card_id, CardFetchOptions::all()).unwrap();
            assert_eq!(card.coordinator_cell_ids, vec![cell.cell_id()]);
            assert!(cell.generate_commit_timestamp(card_id, card.era).is_ok());
        }

        #[test]
        fn test_era_waits_for_revocation() {
            let cell = cell();
            let card_id = cell.create_card(CardAttributes::default()).unwrap();
            cell.create_replica(card_id, queue()).unwrap();
            pump(&cell);

            let data = ReplicaSpec::new("b", "//d", ReplicaContentType::Data, ReplicaMode::Async, true);
            cell.create_replica(card_id, data).unwrap();
            assert_eq!(cell.card_state(card_id).unwrap(), CardState::RevokingShortcutsForAlter);
            assert!(matches!(
                cell.generate_commit_timestamp(card_id, 1),
                Ok(_) | Err(ChaosError::NoCoordinator { .. })
            ));

            pump(&cell);
            let card = cell.get_card(card_id, CardFetchOptions::all()).unwrap();
            assert_eq!(card.era, 2);
            assert_eq!(cell.card_state(card_id).unwrap(), CardState::Normal);
            assert!(matches!(
                cell.generate_commit_timestamp(card_id, 1),
                Err(ChaosError::EraMismatch { .. })
            ));
        }

        #[test]
        fn test_no_era_without_sync_queue() {
            let cell = cell();
            let card_id = cell.create_card(CardAttributes::default()).unwrap();
            let data = ReplicaSpec::new("b", "//d", ReplicaContentType::Data, ReplicaMode::Sync, true);
            cell.create_replica(card_id, data).unwrap();
            assert_eq!(
                cell.card_state(card_id).unwrap(),
                CardState::GeneratingTimestampForNewEra
            );
            cell.tick().unwrap();
            assert_eq!(cell.get_card(card_id, CardFetchOptions::all()).unwrap().era, INITIAL_ERA);

            cell.create_replica(card_id, queue()).unwrap();
            cell.tick().unwrap();
            assert_eq!(cell.get_card(card_id, CardFetchOptions::all()).unwrap().era, 1);
        }
    }

    mod coordinator {
        use super::*;

        #[test]
        fn test_suspend_and_resume() {
            let cell = cell();
            let card_id = cell.create_card(CardAttributes::default()).unwrap();
            cell.create_replica(card_id, queue()).unwrap();
            pump(&cell);

            cell.suspend_coordinator().unwrap();
            pump(&cell);
            let card = cell.get_card(card_id, CardFetchOptions::all()).unwrap();
            assert!(card.coordinator_cell_ids.is_empty());
            let err = cell.generate_commit_timestamp(card_id, card.era).unwrap_err();
            assert!(err.is_retryable());

            cell.resume_coordinator().unwrap();
            pump(&cell);
            let card = cell.get_card(card_id, CardFetchOptions::all()).unwrap();
            assert_eq!(card.coordinator_cell_ids, vec![cell.cell_id()]);
            assert!(cell.generate_commit_timestamp(card_id, card.era).is_ok());
        }
    }

    mod quorum {
        use super::*;

        #[test]
        fn test_unavailable_cell_rejects_mutations() {
            let cell = cell();
            cell.set_available(false);
            let err = cell.create_card(CardAttributes::default()).unwrap_err();
            assert!(matches!(err, ChaosError::QuorumUnavailable { .. }));
            assert!(err.is_retryable());
            cell.set_available(true);
            assert!(cell.create_card(CardAttributes::default()).is_ok());
        }

        #[test]
        fn test_commit_fault() {
            let faults = Arc::new(FaultController::new());
            let cell = cell().with_faults(faults.clone());
            faults.inject(FaultTarget::Any, FaultMode::Times(1));
            assert!(cell.create_card(CardAttributes::default()).is_err());
            assert!(cell.create_card(CardAttributes::default()).is_ok());
            assert_eq!(cell.journal_sequence(), 1);
        }
    }

    #[test]
    fn test_snapshot_restore() {
        let cell = cell();
        let card_id = cell.create_card(CardAttributes::default()).unwrap();
        cell.create_replica(card_id, queue()).unwrap();
        pump(&cell);
        let snapshot = cell.snapshot();
        let bytes = snapshot.to_bytes().unwrap();
        let restored = ChaosCell::restore(
            CellSnapshot::from_bytes(&bytes).unwrap(),
            "chaos",
            cell.clock().clone(),
            ChaosCellConfig::default(),
        );
        assert_eq!(
            restored.get_card(card_id, CardFetchOptions::all()).unwrap(),
            cell.get_card(card_id, CardFetchOptions::all()).unwrap()
        );
        assert_eq!(restored.journal_sequence(), cell.journal_sequence());
        assert_eq!(restored.coordinator_role(), cell.coordinator_role());
    }

    #[test]
    fn test_tick_propagates_current_timestamp() {
        let cell = cell();
        let card_id = cell.create_card(CardAttributes::default()).unwrap();
        cell.create_replica(card_id, queue()).unwrap();
        let before = cell.get_card(card_id, CardFetchOptions::all()).unwrap().current_timestamp;
        cell.tick().unwrap();
        let after = cell.get_card(card_id, CardFetchOptions::all()).unwrap().current_timestamp;
        assert!(after > before);
    }
}
