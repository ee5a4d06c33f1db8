//! Identifiers, timestamps and replica enums shared by the chaos subsystems.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ChaosError;

/// A 64-bit timestamp issued by the clock of one cluster.
///
/// Timestamps from different clocks are not comparable; callers must keep
/// track of the clock cluster tag separately.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Absent timestamp.
    pub const NULL: Timestamp = Timestamp(0);
    /// Smallest valid timestamp.
    pub const MIN: Timestamp = Timestamp(1);
    /// Largest valid timestamp ("latest available").
    pub const MAX: Timestamp = Timestamp(0x3fff_ffff_ffff_ff00);

    /// Creates a timestamp from a raw value.
    pub fn new(raw: u64) -> Self {
        Timestamp(raw)
    }

    /// Returns the raw value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// The immediately preceding timestamp, saturating at `NULL`.
    pub fn prev(self) -> Self {
        Timestamp(self.0.saturating_sub(1))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Monotonic generation number of a replication card.
pub type Era = u64;

/// Era of a freshly created replication card.
pub const INITIAL_ERA: Era = 0;

/// Tag identifying a cluster (and its clock).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterTag(u16);

impl ClusterTag {
    /// Creates a cluster tag.
    pub fn new(tag: u16) -> Self {
        ClusterTag(tag)
    }

    /// Returns the raw tag.
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for ClusterTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cell tag embedded into every object id.
pub type CellTag = u16;

/// Object types that carry chaos ids.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u16)]
pub enum ObjectType {
    /// A chaos cell.
    ChaosCell = 1200,
    /// A replication card.
    ReplicationCard = 1201,
    /// A replica inside a replication card.
    ChaosTableReplica = 1202,
    /// A replication card collocation.
    ReplicationCardCollocation = 1203,
    /// A chaos replicated table.
    ChaosReplicatedTable = 1204,
    /// A client transaction.
    Transaction = 1205,
}

impl ObjectType {
    fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            1200 => Some(ObjectType::ChaosCell),
            1201 => Some(ObjectType::ReplicationCard),
            1202 => Some(ObjectType::ChaosTableReplica),
            1203 => Some(ObjectType::ReplicationCardCollocation),
            1204 => Some(ObjectType::ChaosReplicatedTable),
            1205 => Some(ObjectType::Transaction),
            _ => None,
        }
    }
}

/// 128-bit object id.
///
/// Layout (low to high): object type (16 bits), cell tag (16 bits),
/// entropy (32 bits), counter (64 bits). Text form is four hex `u32`
/// parts `a-b-c-d`, most significant first.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(u128);

impl ObjectId {
    /// Assembles an id from its fields.
    pub fn new(object_type: ObjectType, cell_tag: CellTag, entropy: u32, counter: u64) -> Self {
        let raw = (counter as u128) << 64
            | (entropy as u128) << 32
            | (cell_tag as u128) << 16
            | object_type as u16 as u128;
        ObjectId(raw)
    }

    /// Wraps a raw value without validation.
    pub fn from_raw(raw: u128) -> Self {
        ObjectId(raw)
    }

    /// Returns the raw value.
    pub fn as_u128(&self) -> u128 {
        self.0
    }

    /// Returns the object type, if the type field is known.
    pub fn object_type(&self) -> Option<ObjectType> {
        ObjectType::from_u16((self.0 & 0xffff) as u16)
    }

    /// Returns the embedded cell tag.
    pub fn cell_tag(&self) -> CellTag {
        ((self.0 >> 16) & 0xffff) as u16
    }

    /// Returns the entropy field.
    pub fn entropy(&self) -> u32 {
        ((self.0 >> 32) & 0xffff_ffff) as u32
    }

    /// Returns the counter field.
    pub fn counter(&self) -> u64 {
        (self.0 >> 64) as u64
    }

    fn parts(&self) -> [u32; 4] {
        [
            (self.0 >> 96) as u32,
            (self.0 >> 64) as u32,
            (self.0 >> 32) as u32,
            self.0 as u32,
        ]
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.parts();
        write!(f, "{:x}-{:x}-{:x}-{:x}", a, b, c, d)
    }
}

impl FromStr for ObjectId {
    type Err = ChaosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: &str| ChaosError::MalformedId {
            text: s.to_string(),
            reason: reason.to_string(),
        };
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 4 {
            return Err(malformed("expected four dash-separated parts"));
        }
        let mut raw: u128 = 0;
        for part in parts {
            if part.is_empty() || part.len() > 8 {
                return Err(malformed("part must be 1 to 8 hex digits"));
            }
            let value = u32::from_str_radix(part, 16).map_err(|_| malformed("invalid hex digit"))?;
            raw = raw << 32 | value as u128;
        }
        Ok(ObjectId(raw))
    }
}

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident, $ty:expr) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(ObjectId);

        impl $name {
            /// Expected object type of this id.
            pub const OBJECT_TYPE: ObjectType = $ty;

            /// Wraps an object id, checking its type field.
            pub fn from_object(id: ObjectId) -> Result<Self, ChaosError> {
                if id.object_type() != Some($ty) {
                    return Err(ChaosError::MalformedId {
                        text: id.to_string(),
                        reason: format!("expected object type {:?}", $ty),
                    });
                }
                Ok($name(id))
            }

            /// Returns the underlying object id.
            pub fn object_id(&self) -> ObjectId {
                self.0
            }

            /// Returns the embedded cell tag.
            pub fn cell_tag(&self) -> CellTag {
                self.0.cell_tag()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = ChaosError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $name::from_object(s.parse()?)
            }
        }
    };
}

typed_id!(
    /// Id of a chaos cell; its cell tag is unique among cells.
    CellId,
    ObjectType::ChaosCell
);
typed_id!(
    /// Id of a replication card; its cell tag names the origin cell.
    CardId,
    ObjectType::ReplicationCard
);
typed_id!(
    /// Id of a replica; the card id is recoverable from it.
    ReplicaId,
    ObjectType::ChaosTableReplica
);
typed_id!(
    /// Id of a replication card collocation.
    CollocationId,
    ObjectType::ReplicationCardCollocation
);
typed_id!(
    /// Id of a chaos replicated table.
    TableId,
    ObjectType::ChaosReplicatedTable
);
typed_id!(
    /// Id of a client transaction.
    TransactionId,
    ObjectType::Transaction
);

impl CellId {
    /// Builds a chaos cell id for a cell tag (explicit cell ids carry a zero counter).
    pub fn with_tag(cell_tag: CellTag) -> Self {
        CellId(ObjectId::new(ObjectType::ChaosCell, cell_tag, 0, 0))
    }
}

impl ReplicaId {
    /// Derives the id of replica number `index` of `card_id`.
    pub fn for_card(card_id: CardId, index: u16) -> Self {
        let card = card_id.object_id();
        ReplicaId(ObjectId::new(
            ObjectType::ChaosTableReplica,
            card.cell_tag(),
            (card.entropy() & 0xffff_0000) | index as u32,
            card.counter(),
        ))
    }

    /// Returns the card this replica belongs to.
    pub fn card_id(&self) -> CardId {
        CardId(ObjectId::new(
            ObjectType::ReplicationCard,
            self.0.cell_tag(),
            self.0.entropy() & 0xffff_0000,
            self.0.counter(),
        ))
    }

    /// Returns the replica index inside the card.
    pub fn index(&self) -> u16 {
        (self.0.entropy() & 0xffff) as u16
    }
}

/// Generates ids for objects created by one cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdGenerator {
    cell_tag: CellTag,
    counter: u64,
}

impl IdGenerator {
    /// Creates a generator for ids carrying `cell_tag`.
    pub fn new(cell_tag: CellTag) -> Self {
        Self {
            cell_tag,
            counter: 0,
        }
    }

    /// Returns a fresh id of the given type.
    ///
    /// The low 16 entropy bits are left zero so replica indexes can be embedded.
    pub fn next(&mut self, object_type: ObjectType) -> ObjectId {
        self.counter += 1;
        let entropy = rand::random::<u32>() & 0xffff_0000;
        ObjectId::new(object_type, self.cell_tag, entropy, self.counter)
    }
}

/// Content kind of a replica.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaContentType {
    /// Keyed storage (sorted) or appended rows (ordered).
    Data,
    /// Replication log.
    Queue,
}

/// Replication mode of a replica.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaMode {
    /// Receives writes inside the writing transaction.
    Sync,
    /// Catches up by pulling from queues.
    Async,
    /// Downgrade pending.
    SyncToAsync,
    /// Upgrade pending.
    AsyncToSync,
}

impl ReplicaMode {
    /// Whether no transition is pending.
    pub fn is_stable(&self) -> bool {
        matches!(self, ReplicaMode::Sync | ReplicaMode::Async)
    }

    /// Whether the replica receives writes from the writing transaction.
    pub fn receives_writes(&self) -> bool {
        matches!(self, ReplicaMode::Sync | ReplicaMode::AsyncToSync)
    }
}

impl fmt::Display for ReplicaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplicaMode::Sync => "sync",
            ReplicaMode::Async => "async",
            ReplicaMode::SyncToAsync => "sync_to_async",
            ReplicaMode::AsyncToSync => "async_to_sync",
        };
        f.write_str(name)
    }
}

/// Enablement state of a replica.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    /// Not replicating.
    Disabled,
    /// Enable requested, waiting for the next era.
    Enabling,
    /// Replicating.
    Enabled,
    /// Disable requested, waiting for the next era.
    Disabling,
}

impl ReplicaState {
    /// Whether no transition is pending.
    pub fn is_stable(&self) -> bool {
        matches!(self, ReplicaState::Disabled | ReplicaState::Enabled)
    }
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplicaState::Disabled => "disabled",
            ReplicaState::Enabling => "enabling",
            ReplicaState::Enabled => "enabled",
            ReplicaState::Disabling => "disabling",
        };
        f.write_str(name)
    }
}

/// Current wall time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
