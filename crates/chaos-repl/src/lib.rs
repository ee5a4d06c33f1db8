#![warn(missing_docs)]

//! Chaos replication data path: replica tables, pullers, the fanout writer and the chaos replicated table client

pub mod card_cache;
pub mod client;
pub mod node;
pub mod protocol;
pub mod puller;
pub mod retry;
pub mod row;
pub mod schema;
pub mod storage;
pub mod table;
pub mod transport;
pub mod writer;

pub use client::{
    Catalog, ChaosReplicatedTable, ChaosTableReplica, Client, LookupOptions, ReplicaConsistency,
    TableRef, Transaction,
};
pub use node::{TableTickReport, TabletNode};
pub use protocol::{PullRowsRequest, PullRowsResponse};
pub use puller::{PullOutcome, Puller};
pub use retry::{RetryConfig, RetryExecutor};
pub use row::{ReplicatedRow, Row, RowChange};
pub use schema::{check_replication_compatibility, ColumnSchema, ColumnType, TableSchema};
pub use table::{ReplicaTable, TableSnapshot, TableSpec, WriteMode};
pub use transport::{LocalTransport, ReplicaTransport};
pub use writer::{FanoutWriter, WriteRequest};
