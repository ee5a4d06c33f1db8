//! Client API over chaos replicated tables.
//!
//! A chaos replicated table (CRT) is the client-visible table object: a
//! path bound to a replication card and a schema. Writes go to the card's
//! fanout through [`FanoutWriter`]; reads pick a replica that is in sync
//! for the requested timestamp.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use chaos_meta::card::{
    CardAttributes, CardFetchOptions, ReplicaInfo, ReplicaPatch, ReplicaSpec, ReplicationCard,
};
use chaos_meta::clock::Clock;
use chaos_meta::directory::Directory;
use chaos_meta::error::{ChaosError, ChaosResult};
use chaos_meta::key::{Key, Value};
use chaos_meta::types::{CardId, ClusterTag, Era, ReplicaContentType, ReplicaId, Timestamp};

use crate::card_cache::CardCache;
use crate::protocol::{PullRowsRequest, PullRowsResponse};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::row::{Row, RowChange};
use crate::schema::{check_replication_compatibility, TableSchema};
use crate::table::ReplicaTable;
use crate::transport::ReplicaTransport;
use crate::writer::{FanoutWriter, WriteRequest};

/// The client-visible replicated table object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChaosReplicatedTable {
    /// Table path.
    pub path: String,
    /// Bound replication card.
    pub card_id: CardId,
    /// Table schema.
    pub schema: TableSchema,
    /// Bundle whose cells host the card.
    pub bundle: String,
    /// Whether the card was created with the table and is removed with it.
    pub owns_card: bool,
}

/// Handle of a replica created through the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChaosTableReplica {
    /// Replica id.
    pub replica_id: ReplicaId,
    /// Card of the replica.
    pub card_id: CardId,
    /// Cluster hosting the replica table.
    pub cluster_name: String,
    /// Replica table path.
    pub replica_path: String,
    /// Data or queue.
    pub content_type: ReplicaContentType,
}

/// Registry of chaos replicated tables shared by the clients of an installation.
#[derive(Debug, Default)]
pub struct Catalog {
    tables: RwLock<BTreeMap<String, ChaosReplicatedTable>>,
}

impl Catalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a table.
    pub fn get(&self, path: &str) -> ChaosResult<ChaosReplicatedTable> {
        self.tables
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| ChaosError::no_such("chaos replicated table", path))
    }

    /// Every table.
    pub fn list(&self) -> Vec<ChaosReplicatedTable> {
        self.tables.read().values().cloned().collect()
    }

    fn insert(&self, table: ChaosReplicatedTable) -> ChaosResult<()> {
        let mut tables = self.tables.write();
        if tables.contains_key(&table.path) {
            return Err(ChaosError::validation(format!(
                "chaos replicated table {:?} already exists",
                table.path
            )));
        }
        tables.insert(table.path.clone(), table);
        Ok(())
    }
}

/// What a read or write addresses.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TableRef {
    /// A chaos replicated table by path.
    Chaos(String),
    /// One replica table.
    Replica {
        /// Hosting cluster.
        cluster: String,
        /// Table path.
        path: String,
    },
}

impl TableRef {
    /// Reference to a chaos replicated table.
    pub fn chaos(path: impl Into<String>) -> Self {
        TableRef::Chaos(path.into())
    }

    /// Reference to a replica table.
    pub fn replica(cluster: impl Into<String>, path: impl Into<String>) -> Self {
        TableRef::Replica {
            cluster: cluster.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableRef::Chaos(path) => f.write_str(path),
            TableRef::Replica { cluster, path } => write!(f, "{}:{}", cluster, path),
        }
    }
}

/// Consistency a read requires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReplicaConsistency {
    /// Any replica in sync for the timestamp.
    #[default]
    None,
    /// Only replicas receiving every write.
    Sync,
}

/// Read options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LookupOptions {
    /// Read timestamp; `Timestamp::MAX` reads the latest data.
    pub timestamp: Timestamp,
    /// Required replica consistency.
    pub replica_consistency: ReplicaConsistency,
}

impl Default for LookupOptions {
    fn default() -> Self {
        Self {
            timestamp: Timestamp::MAX,
            replica_consistency: ReplicaConsistency::None,
        }
    }
}

impl LookupOptions {
    /// Latest data from a sync replica.
    pub fn sync() -> Self {
        Self {
            replica_consistency: ReplicaConsistency::Sync,
            ..Self::default()
        }
    }

    /// Data as of `timestamp`.
    pub fn at(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            ..Self::default()
        }
    }
}

struct ResolvedTarget {
    card_id: CardId,
    schema: TableSchema,
    replica_id: Option<ReplicaId>,
}

/// Client of one cluster.
pub struct Client {
    cluster_name: String,
    clock: Arc<Clock>,
    directory: Arc<Directory>,
    transport: Arc<dyn ReplicaTransport>,
    catalog: Arc<Catalog>,
    cards: CardCache,
    writer: FanoutWriter,
    retry: RetryExecutor,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("cluster_name", &self.cluster_name)
            .field("clock_cluster_tag", &self.clock.cluster_tag())
            .finish()
    }
}

impl Client {
    /// Creates a client. Transactions are stamped with `clock`.
    pub fn new(
        cluster_name: impl Into<String>,
        clock: Arc<Clock>,
        directory: Arc<Directory>,
        transport: Arc<dyn ReplicaTransport>,
        catalog: Arc<Catalog>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            clock,
            cards: CardCache::new(directory.clone()),
            writer: FanoutWriter::new(directory.clone(), transport.clone()),
            directory,
            transport,
            catalog,
            retry: RetryExecutor::new(retry),
        }
    }

    /// Cluster of the client.
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Tag of the clock stamping this client's transactions.
    pub fn clock_cluster_tag(&self) -> ClusterTag {
        self.clock.cluster_tag()
    }

    /// Creates a chaos replicated table. Without `card_id` a card is created
    /// on the bundle's first cell and owned by the table.
    pub fn create_chaos_replicated_table(
        &self,
        path: &str,
        schema: TableSchema,
        bundle: &str,
        card_id: Option<CardId>,
    ) -> ChaosResult<ChaosReplicatedTable> {
        if self.catalog.get(path).is_ok() {
            return Err(ChaosError::validation(format!(
                "chaos replicated table {:?} already exists",
                path
            )));
        }
        self.directory.bundle(bundle)?;
        let (card_id, owns_card) = match card_id {
            Some(card_id) => {
                self.directory.get_card(card_id, CardFetchOptions::all())?;
                (card_id, false)
            }
            None => {
                let cell = self
                    .directory
                    .bundle_cells(bundle)
                    .into_iter()
                    .next()
                    .ok_or_else(|| ChaosError::no_such("chaos cell of bundle", bundle))?;
                let card_id = cell.create_card(CardAttributes {
                    table_path: path.to_string(),
                    table_cluster_name: self.cluster_name.clone(),
                    ..Default::default()
                })?;
                self.directory.pump_messages();
                (card_id, true)
            }
        };
        let table = ChaosReplicatedTable {
            path: path.to_string(),
            card_id,
            schema,
            bundle: bundle.to_string(),
            owns_card,
        };
        self.catalog.insert(table.clone())?;
        info!(%path, %card_id, owns_card, "chaos replicated table created");
        Ok(table)
    }

    /// Removes a chaos replicated table and the card it owns.
    pub fn remove_chaos_replicated_table(&self, path: &str) -> ChaosResult<()> {
        let table = self.catalog.get(path)?;
        if table.owns_card {
            self.directory
                .locate_card(table.card_id)?
                .remove_card(table.card_id)?;
            self.directory.pump_messages();
            self.cards.invalidate(table.card_id);
        }
        self.catalog.tables.write().remove(path);
        info!(%path, "chaos replicated table removed");
        Ok(())
    }

    /// Replaces the schema; existing rows must remain valid under it.
    pub fn alter_chaos_replicated_table_schema(&self, path: &str, schema: TableSchema) -> ChaosResult<()> {
        let mut tables = self.catalog.tables.write();
        let table = tables
            .get_mut(path)
            .ok_or_else(|| ChaosError::no_such("chaos replicated table", path))?;
        check_replication_compatibility(&table.schema, &schema)?;
        table.schema = schema;
        Ok(())
    }

    /// Looks up a chaos replicated table.
    pub fn chaos_replicated_table(&self, path: &str) -> ChaosResult<ChaosReplicatedTable> {
        self.catalog.get(path)
    }

    /// Fresh replication card of a chaos replicated table, following migration.
    pub fn replication_card(&self, path: &str) -> ChaosResult<ReplicationCard> {
        let table = self.catalog.get(path)?;
        self.directory.get_card(table.card_id, CardFetchOptions::all())
    }

    /// Adds a replica to the table's card.
    pub fn create_table_replica(&self, path: &str, spec: ReplicaSpec) -> ChaosResult<ChaosTableReplica> {
        let table = self.catalog.get(path)?;
        let cluster_name = spec.cluster_name.clone();
        let replica_path = spec.replica_path.clone();
        let content_type = spec.content_type;
        let replica_id = self
            .directory
            .locate_card(table.card_id)?
            .create_replica(table.card_id, spec)?;
        self.directory.pump_messages();
        self.cards.invalidate(table.card_id);
        Ok(ChaosTableReplica {
            replica_id,
            card_id: table.card_id,
            cluster_name,
            replica_path,
            content_type,
        })
    }

    /// Changes a replica's mode or state. Returns the card era afterwards.
    pub fn alter_table_replica(&self, replica: &ChaosTableReplica, patch: ReplicaPatch) -> ChaosResult<Era> {
        let era = self
            .directory
            .alter_replica(replica.card_id, replica.replica_id, patch)?;
        self.cards.observe_era(replica.card_id, era);
        Ok(era)
    }

    /// Removes a disabled replica.
    pub fn remove_table_replica(&self, replica: &ChaosTableReplica) -> ChaosResult<()> {
        self.directory
            .locate_card(replica.card_id)?
            .remove_replica(replica.card_id, replica.replica_id)?;
        self.directory.pump_messages();
        self.cards.invalidate(replica.card_id);
        Ok(())
    }

    /// Starts a transaction stamped by the client's clock.
    pub fn start_transaction(&self) -> Transaction<'_> {
        Transaction {
            client: self,
            start_timestamp: self.clock.generate(),
            clock_cluster_tag: self.clock.cluster_tag(),
            target: None,
            pending: Vec::new(),
        }
    }

    /// Inserts rows in a transaction of their own.
    pub async fn insert_rows(&self, target: &TableRef, rows: Vec<Row>) -> ChaosResult<Timestamp> {
        let mut tx = self.start_transaction();
        tx.insert_rows(target, rows)?;
        tx.commit().await
    }

    /// Deletes rows in a transaction of their own.
    pub async fn delete_rows(&self, target: &TableRef, keys: Vec<Row>) -> ChaosResult<Timestamp> {
        let mut tx = self.start_transaction();
        tx.delete_rows(target, keys)?;
        tx.commit().await
    }

    async fn resolve(&self, target: &TableRef) -> ChaosResult<ResolvedTarget> {
        match target {
            TableRef::Chaos(path) => {
                let table = self.catalog.get(path)?;
                Ok(ResolvedTarget {
                    card_id: table.card_id,
                    schema: table.schema,
                    replica_id: None,
                })
            }
            TableRef::Replica { cluster, path } => {
                let table = self.transport.table(cluster, path).await?;
                Ok(ResolvedTarget {
                    card_id: table.card_id(),
                    schema: table.schema().clone(),
                    replica_id: Some(table.replica_id()),
                })
            }
        }
    }

    async fn commit(&self, tx: Transaction<'_>) -> ChaosResult<Timestamp> {
        let Some(target) = tx.target else {
            return Ok(tx.start_timestamp);
        };
        let resolved = self.resolve(&target).await?;
        let changes = build_changes(&resolved.schema, tx.pending)?;
        let request = WriteRequest {
            card_id: resolved.card_id,
            start_timestamp: tx.start_timestamp,
            clock_cluster_tag: tx.clock_cluster_tag,
            changes,
            direct_replica: resolved.replica_id,
        };

        let cards = &self.cards;
        let writer = &self.writer;
        let request = &request;
        let addressed = resolved.replica_id;
        let card_id = resolved.card_id;
        self.retry
            .execute(
                move || async move {
                    let mut card = cards.get(card_id)?;
                    // A replica addressed directly may have just been promoted.
                    let stale_direct = addressed.map_or(false, |id| {
                        card.replicas.get(&id).map_or(true, |r| !r.is_sync_data())
                    });
                    if !card.is_writable() || stale_direct {
                        card = cards.refresh(card_id)?;
                    }
                    writer.commit(&card, request).await
                },
                |e| {
                    debug!(%card_id, error = %e, "write failed, refreshing card");
                    cards.invalidate(card_id);
                },
            )
            .await
    }

    /// Reads rows by key.
    ///
    /// For a chaos replicated table the replica is chosen by `options`; for
    /// a replica table the table itself is read unless sync consistency is
    /// required and it is not a caught-up sync replica.
    pub async fn lookup_rows(
        &self,
        target: &TableRef,
        keys: &[Row],
        options: &LookupOptions,
    ) -> ChaosResult<Vec<Option<Row>>> {
        let (table, schema) = self.read_source(target, keys, options).await?;
        let key_list = keys
            .iter()
            .map(|k| schema.key_of(k))
            .collect::<ChaosResult<Vec<Key>>>()?;
        let rows = table.lookup(&key_list, options.timestamp)?;
        Ok(rows
            .into_iter()
            .map(|row| row.map(|r| project(r, &schema)))
            .collect())
    }

    /// Reads every row visible at `options.timestamp`.
    pub async fn select_rows(&self, target: &TableRef, options: &LookupOptions) -> ChaosResult<Vec<Row>> {
        let (table, schema) = self.read_source(target, &[], options).await?;
        let rows = table.select(options.timestamp);
        if table.schema().is_sorted() {
            Ok(rows.into_iter().map(|r| project(r, &schema)).collect())
        } else {
            Ok(rows)
        }
    }

    async fn read_source(
        &self,
        target: &TableRef,
        keys: &[Row],
        options: &LookupOptions,
    ) -> ChaosResult<(Arc<ReplicaTable>, TableSchema)> {
        match target {
            TableRef::Chaos(path) => {
                let crt = self.catalog.get(path)?;
                let key_list = keys
                    .iter()
                    .map(|k| crt.schema.key_of(k))
                    .collect::<ChaosResult<Vec<Key>>>()?;
                let card = self.directory.get_card(crt.card_id, CardFetchOptions::all())?;
                let table = self.choose_replica(&card, &key_list, options, None).await?;
                check_replication_compatibility(table.schema(), &crt.schema)?;
                Ok((table, crt.schema))
            }
            TableRef::Replica { cluster, path } => {
                let table = self.transport.table(cluster, path).await?;
                let schema = table.schema().clone();
                if options.replica_consistency == ReplicaConsistency::None {
                    return Ok((table, schema));
                }
                let key_list = keys
                    .iter()
                    .map(|k| schema.key_of(k))
                    .collect::<ChaosResult<Vec<Key>>>()?;
                let card = self.directory.get_card(table.card_id(), CardFetchOptions::all())?;
                let source = self
                    .choose_replica(&card, &key_list, options, Some(table.replica_id()))
                    .await?;
                if source.replica_id() != table.replica_id() {
                    check_replication_compatibility(source.schema(), &schema)?;
                }
                Ok((source, schema))
            }
        }
    }

    async fn choose_replica(
        &self,
        card: &ReplicationCard,
        keys: &[Key],
        options: &LookupOptions,
        preferred: Option<ReplicaId>,
    ) -> ChaosResult<Arc<ReplicaTable>> {
        let sync_required = options.replica_consistency == ReplicaConsistency::Sync;
        let mut candidates: Vec<(&ReplicaId, &ReplicaInfo)> = card
            .replicas
            .iter()
            .filter(|(_, info)| info.content_type == ReplicaContentType::Data && info.is_enabled())
            .filter(|(_, info)| !sync_required || info.is_sync_data())
            .collect();
        candidates.sort_by_key(|(id, info)| {
            (
                Some(**id) != preferred,
                !info.is_sync_data(),
                info.cluster_name != self.cluster_name,
                **id,
            )
        });

        for (id, info) in candidates {
            let table = match self.transport.table(&info.cluster_name, &info.replica_path).await {
                Ok(table) => table,
                Err(e) => {
                    debug!(replica_id = %id, error = %e, "replica unavailable for reads");
                    continue;
                }
            };
            let required = if options.timestamp == Timestamp::MAX {
                if sync_required {
                    info.sync_since()
                } else {
                    None
                }
            } else {
                Some(options.timestamp)
            };
            let in_sync = match required {
                None => true,
                Some(ts) if keys.is_empty() => table.progress().is_ge_timestamp(ts),
                Some(ts) => table.progress_covers(keys, ts),
            };
            if in_sync {
                return Ok(table);
            }
        }
        Err(ChaosError::NoInSyncReplica {
            card_id: card.id,
            timestamp: options.timestamp,
        })
    }

    /// Data replicas of the table that are in sync at `timestamp`, judged by
    /// the progress recorded in the card. With `timestamp == MAX` only sync
    /// replicas caught up with their sync start qualify.
    pub fn get_in_sync_replicas(
        &self,
        path: &str,
        timestamp: Timestamp,
        keys: Option<&[Row]>,
    ) -> ChaosResult<Vec<ReplicaId>> {
        let crt = self.catalog.get(path)?;
        let key_list = match keys {
            Some(keys) => Some(
                keys.iter()
                    .map(|k| crt.schema.key_of(k))
                    .collect::<ChaosResult<Vec<Key>>>()?,
            ),
            None => None,
        };
        let card = self.directory.get_card(crt.card_id, CardFetchOptions::all())?;
        let covers = |info: &ReplicaInfo, ts: Timestamp| match &key_list {
            Some(keys) => keys.iter().all(|k| {
                info.replication_progress
                    .timestamp_at(k)
                    .map(|at| at >= ts)
                    .unwrap_or(false)
            }),
            None => info.replication_progress.is_ge_timestamp(ts),
        };
        Ok(card
            .replicas
            .iter()
            .filter(|(_, info)| info.content_type == ReplicaContentType::Data)
            .filter(|(_, info)| {
                if timestamp == Timestamp::MAX {
                    info.is_sync_data()
                        && info.sync_since().map(|since| covers(info, since)).unwrap_or(false)
                } else {
                    info.is_enabled() && covers(info, timestamp)
                }
            })
            .map(|(id, _)| *id)
            .collect())
    }

    /// Pulls rows from a queue replica directly.
    pub async fn pull_rows(&self, cluster: &str, request: PullRowsRequest) -> ChaosResult<PullRowsResponse> {
        self.transport.pull_rows(cluster, request).await
    }
}

enum PendingChange {
    Insert(Row),
    Delete(Row),
    Lock(Row, BTreeSet<String>),
}

/// Buffered writes to one table, committed atomically.
pub struct Transaction<'a> {
    client: &'a Client,
    start_timestamp: Timestamp,
    clock_cluster_tag: ClusterTag,
    target: Option<TableRef>,
    pending: Vec<PendingChange>,
}

impl<'a> Transaction<'a> {
    /// Start timestamp.
    pub fn start_timestamp(&self) -> Timestamp {
        self.start_timestamp
    }

    fn bind(&mut self, target: &TableRef) -> ChaosResult<()> {
        match &self.target {
            None => {
                self.target = Some(target.clone());
                Ok(())
            }
            Some(bound) if bound == target => Ok(()),
            Some(bound) => Err(ChaosError::validation(format!(
                "transaction already writes {}, cannot also write {}",
                bound, target
            ))),
        }
    }

    /// Buffers inserts. Unspecified value columns keep their values.
    pub fn insert_rows(&mut self, target: &TableRef, rows: Vec<Row>) -> ChaosResult<()> {
        self.bind(target)?;
        self.pending.extend(rows.into_iter().map(PendingChange::Insert));
        Ok(())
    }

    /// Buffers deletes of the given key rows.
    pub fn delete_rows(&mut self, target: &TableRef, keys: Vec<Row>) -> ChaosResult<()> {
        self.bind(target)?;
        self.pending.extend(keys.into_iter().map(PendingChange::Delete));
        Ok(())
    }

    /// Buffers shared locks on `lock_groups` of the given key rows.
    pub fn lock_rows(&mut self, target: &TableRef, keys: Vec<Row>, lock_groups: &[&str]) -> ChaosResult<()> {
        self.bind(target)?;
        let groups: BTreeSet<String> = lock_groups.iter().map(|g| g.to_string()).collect();
        self.pending
            .extend(keys.into_iter().map(|k| PendingChange::Lock(k, groups.clone())));
        Ok(())
    }

    /// Commits the buffered changes and returns the commit timestamp.
    pub async fn commit(self) -> ChaosResult<Timestamp> {
        let client = self.client;
        client.commit(self).await
    }
}

fn build_changes(schema: &TableSchema, pending: Vec<PendingChange>) -> ChaosResult<Vec<RowChange>> {
    pending
        .into_iter()
        .map(|change| match change {
            PendingChange::Insert(row) => {
                schema.validate_row(&row)?;
                Ok(RowChange::Write {
                    key: schema.key_of(&row)?,
                    values: schema.values_of(&row),
                })
            }
            PendingChange::Delete(row) => {
                if !schema.is_sorted() {
                    return Err(ChaosError::validation("ordered tables do not support deletes"));
                }
                Ok(RowChange::Delete {
                    key: schema.key_of(&row)?,
                })
            }
            PendingChange::Lock(row, lock_groups) => {
                if !schema.is_sorted() {
                    return Err(ChaosError::validation("ordered tables do not support locks"));
                }
                let known = schema.lock_groups();
                if let Some(unknown) = lock_groups.iter().find(|g| !known.contains(*g)) {
                    return Err(ChaosError::validation(format!("unknown lock group {:?}", unknown)));
                }
                Ok(RowChange::Lock {
                    key: schema.key_of(&row)?,
                    lock_groups,
                })
            }
        })
        .collect()
}

fn project(row: Row, schema: &TableSchema) -> Row {
    schema
        .columns()
        .iter()
        .map(|c| (c.name.clone(), row.get(&c.name).cloned().unwrap_or(Value::Null)))
        .collect()
}
