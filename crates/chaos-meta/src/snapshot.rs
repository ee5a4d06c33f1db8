//! Chaos cell snapshot and restore.
//!
//! Captures everything a cell needs to resume after a restart: hosted cards
//! and collocations, the coordinator role, the coordinator cell list and the
//! journal position. Encoded with bincode.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

use crate::coordinator::CoordinatorRole;
use crate::error::{ChaosError, ChaosResult};
use crate::store::CardStore;
use crate::types::{now_ms, CellId};

const SNAPSHOT_VERSION: u32 = 1;

/// Serializable state of one chaos cell.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CellSnapshot {
    /// Snapshot format version.
    pub version: u32,
    /// Cell that produced the snapshot.
    pub cell_id: CellId,
    /// Wall time of capture.
    pub created_at_ms: u64,
    /// Cards, collocations and the id counter.
    pub store: CardStore,
    /// Coordinator role.
    pub role: CoordinatorRole,
    /// Coordinator cells of the bundle.
    pub coordinator_cell_ids: Vec<CellId>,
    /// Coordinators known to be suspended.
    pub suspended_coordinators: BTreeSet<CellId>,
    /// Last journal sequence number included.
    pub journal_sequence: u64,
}

impl CellSnapshot {
    pub(crate) fn new(
        store: CardStore,
        role: CoordinatorRole,
        coordinator_cell_ids: Vec<CellId>,
        suspended_coordinators: BTreeSet<CellId>,
        journal_sequence: u64,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            cell_id: store.cell_id(),
            created_at_ms: now_ms(),
            store,
            role,
            coordinator_cell_ids,
            suspended_coordinators,
            journal_sequence,
        }
    }

    /// Encodes the snapshot.
    pub fn to_bytes(&self) -> ChaosResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes a snapshot, rejecting unknown versions.
    pub fn from_bytes(bytes: &[u8]) -> ChaosResult<Self> {
        let snapshot: CellSnapshot = bincode::deserialize(bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(ChaosError::validation(format!(
                "unsupported cell snapshot version {} (expected {})",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }
        Ok(snapshot)
    }

    /// Writes the snapshot to `path`.
    pub fn save(&self, path: &Path) -> ChaosResult<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// Reads a snapshot from `path`.
    pub fn load(path: &Path) -> ChaosResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}
