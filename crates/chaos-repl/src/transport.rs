//! Transport between tablet nodes and clients.
//!
//! [`ReplicaTransport`] is the seam every cross-cluster call goes through:
//! pulls, write prepares and reads. [`LocalTransport`] routes calls to
//! in-process tablet nodes, consulting a fault injector first and applying
//! the RPC deadline.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chaos_meta::error::{ChaosError, ChaosResult};
use chaos_meta::faults::{FaultInjector, FaultPoint, NoFaults};
use chaos_meta::types::Era;

use crate::node::TabletNode;
use crate::protocol::{PullRowsRequest, PullRowsResponse};
use crate::table::ReplicaTable;

/// Calls into tablet nodes of other clusters.
#[async_trait]
pub trait ReplicaTransport: Send + Sync + fmt::Debug {
    /// Pulls rows from a queue replica hosted on `cluster`.
    async fn pull_rows(&self, cluster: &str, request: PullRowsRequest) -> ChaosResult<PullRowsResponse>;

    /// Resolves a commit participant on `cluster`, making sure the table has
    /// seen at least `era`.
    async fn prepare(&self, cluster: &str, path: &str, era: Era) -> ChaosResult<Arc<ReplicaTable>>;

    /// Resolves a table for reading.
    async fn table(&self, cluster: &str, path: &str) -> ChaosResult<Arc<ReplicaTable>>;
}

/// In-process transport over registered tablet nodes.
pub struct LocalTransport {
    nodes: RwLock<BTreeMap<String, Weak<TabletNode>>>,
    faults: Arc<dyn FaultInjector>,
    rpc_timeout: Duration,
}

impl fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransport")
            .field("clusters", &self.nodes.read().keys().cloned().collect::<Vec<_>>())
            .field("rpc_timeout", &self.rpc_timeout)
            .finish()
    }
}

impl LocalTransport {
    /// Transport without faults.
    pub fn new(rpc_timeout: Duration) -> Self {
        Self::with_faults(Arc::new(NoFaults), rpc_timeout)
    }

    /// Transport consulting `faults` before every call.
    pub fn with_faults(faults: Arc<dyn FaultInjector>, rpc_timeout: Duration) -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            faults,
            rpc_timeout,
        }
    }

    /// Makes `node` reachable under its cluster name.
    pub fn register(&self, node: &Arc<TabletNode>) {
        self.nodes
            .write()
            .insert(node.cluster_name().to_string(), Arc::downgrade(node));
    }

    /// Makes a cluster unreachable.
    pub fn unregister(&self, cluster: &str) {
        self.nodes.write().remove(cluster);
    }

    fn node(&self, cluster: &str) -> ChaosResult<Arc<TabletNode>> {
        self.nodes
            .read()
            .get(cluster)
            .and_then(Weak::upgrade)
            .ok_or_else(|| ChaosError::no_such("cluster", cluster))
    }

    async fn with_deadline<T, F>(&self, what: String, call: F) -> ChaosResult<T>
    where
        F: std::future::Future<Output = ChaosResult<T>>,
    {
        match tokio::time::timeout(self.rpc_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ChaosError::Timeout { what }),
        }
    }
}

#[async_trait]
impl ReplicaTransport for LocalTransport {
    async fn pull_rows(&self, cluster: &str, request: PullRowsRequest) -> ChaosResult<PullRowsResponse> {
        self.faults.check(&FaultPoint::PullRows {
            cluster: cluster.to_string(),
        })?;
        let node = self.node(cluster)?;
        let what = format!("pull_rows {}:{}", cluster, request.replica_path);
        self.with_deadline(what, async move { node.serve_pull_rows(&request) })
            .await
    }

    async fn prepare(&self, cluster: &str, path: &str, era: Era) -> ChaosResult<Arc<ReplicaTable>> {
        self.faults.check(&FaultPoint::Prepare {
            cluster: cluster.to_string(),
        })?;
        let node = self.node(cluster)?;
        let what = format!("prepare {}:{}", cluster, path);
        self.with_deadline(what, async move { node.prepare_table(path, era) })
            .await
    }

    async fn table(&self, cluster: &str, path: &str) -> ChaosResult<Arc<ReplicaTable>> {
        self.node(cluster)?.table(path)
    }
}
