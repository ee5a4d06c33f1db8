//! Error types shared by every chaos replication subsystem.

use thiserror::Error;

use crate::types::{CardId, CellId, ClusterTag, CollocationId, Era, ReplicaId, Timestamp};

/// Coarse classification of [`ChaosError`] used by retry loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A card, replica, cell or table id could not be resolved.
    Resolve,
    /// The caller used a replica id that no longer matches the card.
    UpstreamReplicaMismatch,
    /// The request was issued for a stale era.
    EraMismatch,
    /// No coordinator is currently able to order writes for the card.
    NoCoordinator,
    /// The transaction clock does not match the bundle clock.
    ClockClusterTagMismatch,
    /// Source and target schemas are incompatible.
    SchemaIncompatible,
    /// The chaos cell cannot commit mutations.
    QuorumUnavailable,
    /// The card has moved (or is moving) to another cell.
    Migration,
    /// The request is malformed or violates an invariant.
    Validation,
    /// A concurrent transaction holds a conflicting lock.
    Conflict,
    /// RPC level failure (injected fault, timeout, transport).
    Transport,
    /// Serialization or I/O failure.
    Internal,
}

/// Errors that can occur in the chaos replication subsystem.
#[derive(Debug, Error)]
pub enum ChaosError {
    /// No such replication card.
    #[error("no such replication card {card_id}")]
    NoSuchCard {
        /// The missing card.
        card_id: CardId,
    },

    /// No such replica in the card.
    #[error("no such replica {replica_id} in replication card {card_id}")]
    NoSuchReplica {
        /// The card that was searched.
        card_id: CardId,
        /// The missing replica.
        replica_id: ReplicaId,
    },

    /// No such chaos cell.
    #[error("no such chaos cell {cell_id}")]
    NoSuchCell {
        /// The missing cell.
        cell_id: CellId,
    },

    /// No such replication card collocation.
    #[error("no such replication card collocation {collocation_id}")]
    NoSuchCollocation {
        /// The missing collocation.
        collocation_id: CollocationId,
    },

    /// A named object (cluster, bundle, area, table) is unknown.
    #[error("no such {what} {name:?}")]
    NoSuchObject {
        /// Object kind.
        what: &'static str,
        /// Object name or path.
        name: String,
    },

    /// An id could not be parsed or carries the wrong type.
    #[error("malformed id {text:?}: {reason}")]
    MalformedId {
        /// The offending text or id.
        text: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Generic validation failure.
    #[error("{0}")]
    Validation(String),

    /// A mutation hit a card that has been migrated away.
    #[error("replication card {card_id} has been migrated to cell {immigrated_to}")]
    CardMigrated {
        /// The migrated card.
        card_id: CardId,
        /// Cell that now hosts the card.
        immigrated_to: CellId,
    },

    /// A mutation hit a card that is in the middle of a migration.
    #[error("replication card {card_id} is being migrated")]
    MigrationInProgress {
        /// The migrating card.
        card_id: CardId,
    },

    /// Pull or write arrived with a stale upstream replica id.
    #[error("upstream replica id mismatch: expected {expected:?}, got {actual}")]
    UpstreamReplicaMismatch {
        /// Replica id bound to the serving table.
        expected: Option<ReplicaId>,
        /// Replica id carried by the request.
        actual: ReplicaId,
    },

    /// Request era does not match the tablet era.
    #[error("replication era mismatch: expected {expected}, got {actual}")]
    EraMismatch {
        /// Era known to the serving side.
        expected: Era,
        /// Era carried by the request.
        actual: Era,
    },

    /// Nobody coordinates writes for the card at the moment.
    #[error("no coordinator available for replication card {card_id}")]
    NoCoordinator {
        /// The card being written.
        card_id: CardId,
    },

    /// The coordinator cell role is suspended.
    #[error("coordinator cell {cell_id} is suspended")]
    CoordinatorSuspended {
        /// The suspended coordinator cell.
        cell_id: CellId,
    },

    /// Transaction clock does not match the bundle clock.
    #[error("clock cluster tag mismatch: bundle trusts {expected}, transaction uses {actual}")]
    ClockClusterTagMismatch {
        /// Clock cluster tag declared by the bundle.
        expected: ClusterTag,
        /// Clock cluster tag of the transaction.
        actual: ClusterTag,
    },

    /// Schemas are incompatible for replication.
    #[error("schema incompatible: {0}")]
    SchemaIncompatible(String),

    /// The chaos cell cannot commit.
    #[error("chaos cell {cell_id} quorum is unavailable")]
    QuorumUnavailable {
        /// The unavailable cell.
        cell_id: CellId,
    },

    /// The card has no sync enabled queue replica.
    #[error("replication card {card_id} is not writable")]
    NotWritable {
        /// The card being written.
        card_id: CardId,
    },

    /// A replica does not accept direct writes.
    #[error("replica {replica_id} does not accept direct writes: {reason}")]
    ReplicaNotWritable {
        /// The replica.
        replica_id: ReplicaId,
        /// Why it refused.
        reason: String,
    },

    /// No replica can serve a read at the requested timestamp.
    #[error("no in-sync replica of replication card {card_id} for timestamp {timestamp}")]
    NoInSyncReplica {
        /// The card being read.
        card_id: CardId,
        /// Requested read timestamp.
        timestamp: Timestamp,
    },

    /// A concurrent transaction committed a conflicting lock.
    #[error("transaction lock conflict on key {key} lock group {lock_group:?}")]
    LockConflict {
        /// Row key in display form.
        key: String,
        /// Lock group that conflicted.
        lock_group: String,
    },

    /// A fault injector failed the operation.
    #[error("injected fault at {point}")]
    InjectedFault {
        /// Fault point description.
        point: String,
    },

    /// RPC deadline expired.
    #[error("deadline exceeded: {what}")]
    Timeout {
        /// Operation that timed out.
        what: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl ChaosError {
    /// Shorthand for a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        ChaosError::Validation(msg.into())
    }

    /// Shorthand for an unknown named object.
    pub fn no_such(what: &'static str, name: impl Into<String>) -> Self {
        ChaosError::NoSuchObject {
            what,
            name: name.into(),
        }
    }

    /// Returns the error classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChaosError::NoSuchCard { .. }
            | ChaosError::NoSuchReplica { .. }
            | ChaosError::NoSuchCell { .. }
            | ChaosError::NoSuchCollocation { .. }
            | ChaosError::NoSuchObject { .. }
            | ChaosError::NoInSyncReplica { .. } => ErrorKind::Resolve,
            ChaosError::MalformedId { .. }
            | ChaosError::Validation(_)
            | ChaosError::NotWritable { .. }
            | ChaosError::ReplicaNotWritable { .. } => ErrorKind::Validation,
            ChaosError::CardMigrated { .. } | ChaosError::MigrationInProgress { .. } => {
                ErrorKind::Migration
            }
            ChaosError::UpstreamReplicaMismatch { .. } => ErrorKind::UpstreamReplicaMismatch,
            ChaosError::EraMismatch { .. } => ErrorKind::EraMismatch,
            ChaosError::NoCoordinator { .. } | ChaosError::CoordinatorSuspended { .. } => {
                ErrorKind::NoCoordinator
            }
            ChaosError::ClockClusterTagMismatch { .. } => ErrorKind::ClockClusterTagMismatch,
            ChaosError::SchemaIncompatible(_) => ErrorKind::SchemaIncompatible,
            ChaosError::QuorumUnavailable { .. } => ErrorKind::QuorumUnavailable,
            ChaosError::LockConflict { .. } => ErrorKind::Conflict,
            ChaosError::InjectedFault { .. } | ChaosError::Timeout { .. } => ErrorKind::Transport,
            ChaosError::Serialization(_) | ChaosError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether infrastructure should retry the failed operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::EraMismatch
                | ErrorKind::NoCoordinator
                | ErrorKind::QuorumUnavailable
                | ErrorKind::Migration
                | ErrorKind::Transport
                | ErrorKind::UpstreamReplicaMismatch
        )
    }
}

/// Result alias used throughout the chaos crates.
pub type ChaosResult<T> = Result<T, ChaosError>;
