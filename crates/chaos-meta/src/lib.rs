#![warn(missing_docs)]

//! Chaos replication metadata: replication cards, chaos cells, the era coordinator, collocations and migration

pub mod alien;
pub mod card;
pub mod cell;
pub mod clock;
pub mod collocation;
pub mod config;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod faults;
pub mod hive;
pub mod journal;
pub mod key;
pub mod migration;
pub mod progress;
pub mod snapshot;
pub mod store;
pub mod types;

pub use card::{
    CardAttributes, CardFetchOptions, CardPatch, ReplicaHistoryItem, ReplicaInfo, ReplicaPatch,
    ReplicaSpec, ReplicatedTableOptions, ReplicationCard,
};
pub use cell::ChaosCell;
pub use clock::{Clock, ClockRegistry};
pub use config::ChaosConfig;
pub use directory::Directory;
pub use error::{ChaosError, ChaosResult, ErrorKind};
pub use key::{Key, KeyRange, Value};
pub use progress::ReplicationProgress;
pub use types::{
    CardId, CellId, ClusterTag, CollocationId, Era, ReplicaContentType, ReplicaId, ReplicaMode,
    ReplicaState, TableId, Timestamp,
};
