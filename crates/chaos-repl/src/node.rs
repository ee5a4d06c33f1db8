//! Tablet node: hosts replica tables of one cluster.
//!
//! Every tick the node refreshes each table's card, advances caught-up sync
//! replicas to the card's current timestamp, runs the puller, trims queue
//! rows that every other replica already has and reports progress back to
//! the card. [`TabletNode::start`] runs the ticks on background tasks, one
//! per table.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chaos_meta::card::CardFetchOptions;
use chaos_meta::config::TabletNodeConfig;
use chaos_meta::directory::Directory;
use chaos_meta::error::{ChaosError, ChaosResult};
use chaos_meta::progress::ReplicationProgress;
use chaos_meta::types::{ClusterTag, Era};

use crate::protocol::{PullRowsRequest, PullRowsResponse};
use crate::puller::{PullOutcome, Puller};
use crate::table::{BackgroundActivity, ReplicaTable, TableSnapshot, TableSpec};
use crate::transport::ReplicaTransport;

struct MountedTable {
    table: Arc<ReplicaTable>,
    puller: Puller,
    reported: Mutex<Option<ReplicationProgress>>,
}

/// What one tick did to one table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableTickReport {
    /// Rows pulled.
    pub pulled_rows: usize,
    /// Queue rows trimmed.
    pub trimmed_rows: usize,
    /// Whether the sync progress advanced.
    pub advanced: bool,
    /// Whether new progress was reported to the card.
    pub reported: bool,
}

/// Hosts the replica tables of one cluster.
pub struct TabletNode {
    cluster_name: String,
    clock_cluster_tag: ClusterTag,
    config: TabletNodeConfig,
    directory: Arc<Directory>,
    transport: Arc<dyn ReplicaTransport>,
    tables: RwLock<BTreeMap<String, Arc<MountedTable>>>,
    tasks: Mutex<BTreeMap<String, JoinHandle<()>>>,
    running: AtomicBool,
}

impl fmt::Debug for TabletNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TabletNode")
            .field("cluster_name", &self.cluster_name)
            .field("tables", &self.tables.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TabletNode {
    /// Creates a node. `clock_cluster_tag` is the clock its bundle trusts.
    pub fn new(
        cluster_name: impl Into<String>,
        clock_cluster_tag: ClusterTag,
        config: TabletNodeConfig,
        directory: Arc<Directory>,
        transport: Arc<dyn ReplicaTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cluster_name: cluster_name.into(),
            clock_cluster_tag,
            config,
            directory,
            transport,
            tables: RwLock::new(BTreeMap::new()),
            tasks: Mutex::new(BTreeMap::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Cluster served by the node.
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Node configuration.
    pub fn config(&self) -> &TabletNodeConfig {
        &self.config
    }

    /// Mounts a new empty table.
    pub fn mount_table(self: &Arc<Self>, spec: TableSpec) -> ChaosResult<Arc<ReplicaTable>> {
        let table = ReplicaTable::new(self.cluster_name.clone(), spec, self.trusted_clock_tag())?;
        self.mount(table)
    }

    /// Mounts a table from an unmount snapshot.
    pub fn mount_snapshot(self: &Arc<Self>, snapshot: TableSnapshot) -> ChaosResult<Arc<ReplicaTable>> {
        let table = ReplicaTable::restore(self.cluster_name.clone(), snapshot, self.trusted_clock_tag())?;
        self.mount(table)
    }

    fn trusted_clock_tag(&self) -> Option<ClusterTag> {
        self.config
            .reject_incorrect_clock_cluster_tag
            .then_some(self.clock_cluster_tag)
    }

    fn mount(self: &Arc<Self>, table: ReplicaTable) -> ChaosResult<Arc<ReplicaTable>> {
        let table = Arc::new(table);
        let path = table.path().to_string();
        {
            let mut tables = self.tables.write();
            if tables.contains_key(&path) {
                return Err(ChaosError::validation(format!(
                    "table {:?} is already mounted on cluster {:?}",
                    path, self.cluster_name
                )));
            }
            tables.insert(
                path.clone(),
                Arc::new(MountedTable {
                    table: table.clone(),
                    puller: Puller::new(&self.config),
                    reported: Mutex::new(None),
                }),
            );
        }
        if let Err(e) = self.refresh_table(&table) {
            debug!(cluster = %self.cluster_name, %path, error = %e, "card not available at mount");
        }
        info!(
            cluster = %self.cluster_name,
            %path,
            replica_id = %table.replica_id(),
            "mounted replica table"
        );
        if self.running.load(Ordering::SeqCst) {
            self.spawn_table_task(&path);
        }
        Ok(table)
    }

    /// Unmounts a table and returns its snapshot.
    pub fn unmount_table(&self, path: &str) -> ChaosResult<TableSnapshot> {
        if let Some(task) = self.tasks.lock().remove(path) {
            task.abort();
        }
        let mounted = self
            .tables
            .write()
            .remove(path)
            .ok_or_else(|| ChaosError::no_such("table", path))?;
        info!(cluster = %self.cluster_name, %path, "unmounted replica table");
        Ok(mounted.table.snapshot())
    }

    /// Resolves a mounted table.
    pub fn table(&self, path: &str) -> ChaosResult<Arc<ReplicaTable>> {
        self.mounted(path).map(|m| m.table.clone())
    }

    /// Every mounted table.
    pub fn tables(&self) -> Vec<Arc<ReplicaTable>> {
        self.tables.read().values().map(|m| m.table.clone()).collect()
    }

    fn mounted(&self, path: &str) -> ChaosResult<Arc<MountedTable>> {
        self.tables
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| ChaosError::no_such("table", format!("{}:{}", self.cluster_name, path)))
    }

    /// Re-reads the table's card. Returns whether the era changed.
    pub fn refresh_table(&self, table: &ReplicaTable) -> ChaosResult<bool> {
        let card = self.directory.get_card(table.card_id(), CardFetchOptions::all())?;
        Ok(table.refresh_card(card))
    }

    fn refresh_if_behind(&self, table: &ReplicaTable, era: Era) {
        if table.era().map(|current| current < era).unwrap_or(true) {
            if let Err(e) = self.refresh_table(table) {
                debug!(path = %table.path(), era, error = %e, "card refresh failed");
            }
        }
    }

    /// Resolves a commit participant, catching up with `era` first.
    pub fn prepare_table(&self, path: &str, era: Era) -> ChaosResult<Arc<ReplicaTable>> {
        let table = self.table(path)?;
        self.refresh_if_behind(&table, era);
        Ok(table)
    }

    /// Serves a pull from a mounted queue.
    pub fn serve_pull_rows(&self, request: &PullRowsRequest) -> ChaosResult<PullRowsResponse> {
        let table = self.table(&request.replica_path)?;
        self.refresh_if_behind(&table, request.era);
        table.serve_pull_rows(request)
    }

    /// Runs one tick over every table.
    pub async fn tick(&self) -> BTreeMap<String, TableTickReport> {
        let mounted: Vec<(String, Arc<MountedTable>)> = self
            .tables
            .read()
            .iter()
            .map(|(path, m)| (path.clone(), m.clone()))
            .collect();
        let mut reports = BTreeMap::new();
        for (path, mounted) in mounted {
            reports.insert(path, self.tick_mounted(&mounted).await);
        }
        reports
    }

    /// Runs one tick over one table.
    pub async fn tick_table(&self, path: &str) -> ChaosResult<TableTickReport> {
        let mounted = self.mounted(path)?;
        Ok(self.tick_mounted(&mounted).await)
    }

    async fn tick_mounted(&self, mounted: &MountedTable) -> TableTickReport {
        let table = &mounted.table;
        let mut report = TableTickReport::default();

        if let Err(e) = self.refresh_table(table) {
            debug!(cluster = %self.cluster_name, path = %table.path(), error = %e, "card refresh failed");
        }
        report.advanced |= table.advance_sync_progress().is_some();

        if let Ok(PullOutcome::Pulled { rows, .. }) =
            mounted.puller.run_once(table, self.transport.as_ref()).await
        {
            report.pulled_rows = rows;
            report.advanced |= table.advance_sync_progress().is_some();
        }

        report.trimmed_rows = self.trim(table);
        report.reported = self.report_progress(mounted);
        report
    }

    fn trim(&self, table: &ReplicaTable) -> usize {
        let Some(card) = table.card() else {
            return 0;
        };
        let bound = ReplicationProgress::gather_min_all(
            card.replicas
                .iter()
                .filter(|(id, info)| **id != table.replica_id() && !info.history.is_empty())
                .map(|(_, info)| &info.replication_progress),
        );
        bound.map(|bound| table.trim(&bound)).unwrap_or(0)
    }

    fn report_progress(&self, mounted: &MountedTable) -> bool {
        let table = &mounted.table;
        let progress = table.progress();
        if mounted.reported.lock().as_ref() == Some(&progress) {
            return false;
        }
        let card_id = table.card_id();
        let result = self
            .directory
            .locate_card(card_id)
            .and_then(|cell| cell.update_replica_progress(card_id, table.replica_id(), &progress));
        match result {
            Ok(()) => {
                table.clear_background_error(BackgroundActivity::ReportProgress);
                *mounted.reported.lock() = Some(progress);
                true
            }
            Err(e) => {
                debug!(path = %table.path(), error = %e, "progress report failed");
                if e.is_retryable() {
                    table.set_background_error(BackgroundActivity::ReportProgress, &e);
                }
                false
            }
        }
    }

    /// Starts background ticking of every mounted table.
    pub fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let paths: Vec<String> = self.tables.read().keys().cloned().collect();
        for path in paths {
            self.spawn_table_task(&path);
        }
        info!(cluster = %self.cluster_name, "tablet node started");
    }

    fn spawn_table_task(self: &Arc<Self>, path: &str) {
        let node = Arc::downgrade(self);
        let period = self.config.tick_period();
        let task_path = path.to_string();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(node) = node.upgrade() else {
                    break;
                };
                if let Err(e) = node.tick_table(&task_path).await {
                    warn!(path = %task_path, error = %e, "table tick stopped");
                    break;
                }
            }
        });
        if let Some(previous) = self.tasks.lock().insert(path.to_string(), handle) {
            previous.abort();
        }
    }

    /// Stops background ticking.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for (_, task) in std::mem::take(&mut *self.tasks.lock()) {
            task.abort();
        }
        info!(cluster = %self.cluster_name, "tablet node stopped");
    }
}

impl Drop for TabletNode {
    fn drop(&mut self) {
        for (_, task) in std::mem::take(&mut *self.tasks.lock()) {
            task.abort();
        }
    }
}
