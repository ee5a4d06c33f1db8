//! In-process multi-cluster installation.
//!
//! An [`Environment`] wires one chaos bundle, a tablet node and a client per
//! cluster, a shared transport with fault injection and the replicated
//! table tracker. Nothing runs in the background unless [`Environment::start`]
//! is called; [`Environment::settle`] drives every component by hand.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use chaos_meta::card::ReplicaSpec;
use chaos_meta::clock::ClockRegistry;
use chaos_meta::config::ChaosConfig;
use chaos_meta::directory::Directory;
use chaos_meta::error::{ChaosError, ChaosResult};
use chaos_meta::faults::FaultController;
use chaos_meta::types::{CellId, CellTag, ClusterTag};
use chaos_repl::client::{Catalog, ChaosTableReplica, Client};
use chaos_repl::node::TabletNode;
use chaos_repl::retry::RetryConfig;
use chaos_repl::table::{TableSpec, TabletLayout};
use chaos_repl::transport::LocalTransport;
use chaos_tracker::health::ManualClusterState;
use chaos_tracker::tracker::ReplicatedTableTracker;

/// Shape of an environment.
#[derive(Debug, Clone)]
pub struct EnvironmentSpec {
    /// Peer clusters; the first one homes the bundle's default area.
    pub clusters: Vec<String>,
    /// Chaos bundle name.
    pub bundle: String,
    /// Clock tag trusted by the bundle.
    pub clock_cluster_tag: ClusterTag,
    /// Chaos cells of the bundle, all in its default area.
    pub cell_tags: Vec<CellTag>,
    /// Knobs.
    pub config: ChaosConfig,
    /// Write retries before a client gives up.
    pub max_write_retries: u32,
}

impl Default for EnvironmentSpec {
    fn default() -> Self {
        Self {
            clusters: vec!["primary".into(), "remote_0".into(), "remote_1".into()],
            bundle: "chaos".into(),
            clock_cluster_tag: ClusterTag::new(1),
            cell_tags: vec![10],
            config: ChaosConfig::default(),
            max_write_retries: 5,
        }
    }
}

/// A running in-process installation.
pub struct Environment {
    spec: EnvironmentSpec,
    directory: Arc<Directory>,
    faults: Arc<FaultController>,
    transport: Arc<LocalTransport>,
    catalog: Arc<Catalog>,
    nodes: BTreeMap<String, Arc<TabletNode>>,
    clients: BTreeMap<String, Client>,
    cluster_state: Arc<ManualClusterState>,
    tracker: Arc<ReplicatedTableTracker>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("clusters", &self.spec.clusters)
            .field("bundle", &self.spec.bundle)
            .field("cells", &self.spec.cell_tags)
            .finish()
    }
}

impl Environment {
    /// Builds the installation described by `spec`.
    pub fn new(spec: EnvironmentSpec) -> ChaosResult<Self> {
        if spec.clusters.is_empty() {
            return Err(ChaosError::validation("environment needs at least one cluster"));
        }
        let faults = Arc::new(FaultController::new());
        let directory = Arc::new(
            Directory::new(Arc::new(ClockRegistry::new()), spec.config.chaos_cell.clone())
                .with_faults(faults.clone()),
        );
        directory.create_bundle(&spec.bundle, spec.clock_cluster_tag, spec.clusters.clone())?;
        for cell_tag in &spec.cell_tags {
            directory.create_cell(&spec.bundle, "default", *cell_tag)?;
        }

        let transport = Arc::new(LocalTransport::with_faults(
            faults.clone(),
            spec.config.tablet_node.rpc_timeout(),
        ));
        let catalog = Arc::new(Catalog::new());
        let clock = directory.clocks().get_or_create(spec.clock_cluster_tag);
        let retry = RetryConfig::from_backoff(&spec.config.tablet_node.backoff, spec.max_write_retries);

        let mut nodes = BTreeMap::new();
        let mut clients = BTreeMap::new();
        for cluster in &spec.clusters {
            let node = TabletNode::new(
                cluster.clone(),
                spec.clock_cluster_tag,
                spec.config.tablet_node.clone(),
                directory.clone(),
                transport.clone(),
            );
            transport.register(&node);
            nodes.insert(cluster.clone(), node);
            clients.insert(
                cluster.clone(),
                Client::new(
                    cluster.clone(),
                    clock.clone(),
                    directory.clone(),
                    transport.clone(),
                    catalog.clone(),
                    retry.clone(),
                ),
            );
        }

        let cluster_state = Arc::new(ManualClusterState::new());
        let tracker = ReplicatedTableTracker::new(
            spec.config.replicated_table_tracker.clone(),
            directory.clone(),
            cluster_state.clone(),
        );
        info!(clusters = ?spec.clusters, bundle = %spec.bundle, "environment ready");
        Ok(Self {
            spec,
            directory,
            faults,
            transport,
            catalog,
            nodes,
            clients,
            cluster_state,
            tracker,
        })
    }

    /// Shape of the environment.
    pub fn spec(&self) -> &EnvironmentSpec {
        &self.spec
    }

    /// Chaos bundle name.
    pub fn bundle(&self) -> &str {
        &self.spec.bundle
    }

    /// Cell directory.
    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    /// Fault controller shared by cells and the transport.
    pub fn faults(&self) -> &Arc<FaultController> {
        &self.faults
    }

    /// Shared transport.
    pub fn transport(&self) -> &Arc<LocalTransport> {
        &self.transport
    }

    /// Shared catalog of chaos replicated tables.
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Cluster health fed to the tracker.
    pub fn cluster_state(&self) -> &Arc<ManualClusterState> {
        &self.cluster_state
    }

    /// The replicated table tracker.
    pub fn tracker(&self) -> &Arc<ReplicatedTableTracker> {
        &self.tracker
    }

    /// Cell with the given tag.
    pub fn cell_id(&self, cell_tag: CellTag) -> CellId {
        CellId::with_tag(cell_tag)
    }

    /// Tablet node of `cluster`.
    pub fn node(&self, cluster: &str) -> ChaosResult<&Arc<TabletNode>> {
        self.nodes
            .get(cluster)
            .ok_or_else(|| ChaosError::no_such("cluster", cluster))
    }

    /// Client of `cluster`.
    pub fn client(&self, cluster: &str) -> ChaosResult<&Client> {
        self.clients
            .get(cluster)
            .ok_or_else(|| ChaosError::no_such("cluster", cluster))
    }

    /// Adds a replica to the card of `crt_path` and mounts a single-tablet
    /// replica table for it.
    pub fn create_replica(&self, crt_path: &str, spec: ReplicaSpec) -> ChaosResult<ChaosTableReplica> {
        self.create_replica_with_layout(crt_path, spec, None)
    }

    /// Like [`Environment::create_replica`] with an explicit tablet layout.
    pub fn create_replica_with_layout(
        &self,
        crt_path: &str,
        spec: ReplicaSpec,
        layout: Option<TabletLayout>,
    ) -> ChaosResult<ChaosTableReplica> {
        let node = self.node(&spec.cluster_name)?;
        let client = self.client(&spec.cluster_name)?;
        let schema = client.chaos_replicated_table(crt_path)?.schema;
        let replica = client.create_table_replica(crt_path, spec)?;
        let mut table_spec = TableSpec::new(
            replica.replica_path.clone(),
            schema,
            replica.content_type,
            replica.replica_id,
        );
        if let Some(layout) = layout {
            table_spec.layout = layout;
        }
        node.mount_table(table_spec)?;
        Ok(replica)
    }

    /// Makes `cluster` unreachable for pulls and writes, and unhealthy for
    /// the tracker.
    pub fn isolate(&self, cluster: &str) {
        self.transport.unregister(cluster);
        self.cluster_state.set_healthy(cluster, false);
        self.tracker.health().clear();
    }

    /// Undoes [`Environment::isolate`].
    pub fn reconnect(&self, cluster: &str) -> ChaosResult<()> {
        self.transport.register(self.node(cluster)?);
        self.cluster_state.set_healthy(cluster, true);
        self.tracker.health().clear();
        Ok(())
    }

    /// One round of chaos cell and tablet node work.
    pub async fn tick(&self) {
        self.directory.tick();
        for node in self.nodes.values() {
            node.tick().await;
        }
    }

    /// Runs `rounds` ticks, pausing between them so backoffs elapse.
    pub async fn settle(&self, rounds: usize) {
        let pause = Duration::from_millis(self.spec.config.tablet_node.backoff.max_ms.min(5));
        for _ in 0..rounds {
            self.tick().await;
            tokio::time::sleep(pause).await;
        }
    }

    /// Runs one tracker pass followed by enough ticks for its mode switches
    /// to finish.
    pub async fn run_tracker_cycle(&self) {
        self.tracker.tick().await;
        self.settle(4).await;
    }

    /// Starts background ticking of tablet nodes and the tracker.
    pub fn start(&self) {
        for node in self.nodes.values() {
            node.start();
        }
        self.tracker.start();
    }

    /// Stops background ticking.
    pub fn stop(&self) {
        for node in self.nodes.values() {
            node.stop();
        }
        self.tracker.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaos_meta::config::BackoffConfig;
    use chaos_meta::types::{ReplicaContentType, ReplicaMode};
    use chaos_repl::client::{LookupOptions, TableRef};
    use chaos_repl::row::Row;
    use chaos_repl::schema::TableSchema;

    fn fast() -> EnvironmentSpec {
        let mut spec = EnvironmentSpec::default();
        spec.config.tablet_node.backoff = BackoffConfig {
            initial_ms: 1,
            max_ms: 4,
            multiplier: 2.0,
        };
        spec
    }

    #[test]
    fn test_builds_node_and_client_per_cluster() {
        let env = Environment::new(fast()).unwrap();
        for cluster in ["primary", "remote_0", "remote_1"] {
            assert_eq!(env.node(cluster).unwrap().cluster_name(), cluster);
            assert_eq!(env.client(cluster).unwrap().cluster_name(), cluster);
        }
        assert!(env.node("elsewhere").is_err());
        assert_eq!(env.directory().cells().len(), 1);
    }

    #[test]
    fn test_rejects_empty_cluster_list() {
        let spec = EnvironmentSpec {
            clusters: Vec::new(),
            ..fast()
        };
        assert!(Environment::new(spec).is_err());
    }

    #[tokio::test]
    async fn test_replicates_between_clusters() {
        let env = Environment::new(fast()).unwrap();
        let client = env.client("primary").unwrap();
        client
            .create_chaos_replicated_table("//crt", TableSchema::simple_sorted(), env.bundle(), None)
            .unwrap();
        env.create_replica(
            "//crt",
            ReplicaSpec::new("primary", "//q", ReplicaContentType::Queue, ReplicaMode::Sync, true),
        )
        .unwrap();
        env.create_replica(
            "//crt",
            ReplicaSpec::new("remote_0", "//t", ReplicaContentType::Data, ReplicaMode::Async, true),
        )
        .unwrap();
        env.settle(4).await;

        let row = Row::new().with("key", 7i64).with("value", "seven");
        client
            .insert_rows(&TableRef::chaos("//crt"), vec![row.clone()])
            .await
            .unwrap();
        env.settle(6).await;

        let rows = env
            .client("remote_0")
            .unwrap()
            .lookup_rows(
                &TableRef::replica("remote_0", "//t"),
                &[Row::new().with("key", 7i64)],
                &LookupOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(rows, vec![Some(row)]);
    }
}
