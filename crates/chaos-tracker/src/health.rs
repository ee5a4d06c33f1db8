//! Cluster health as seen by the tracker.
//!
//! Health answers come from a [`ClusterStateProvider`] and are cached per
//! cluster. A cached answer is served until it is older than the refresh
//! time; after that the provider is asked again, and if it cannot answer
//! the old answer survives until it expires.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use chaos_meta::config::BundleHealthCacheConfig;
use chaos_meta::error::ChaosResult;

/// Source of per-cluster health.
#[async_trait]
pub trait ClusterStateProvider: Send + Sync + fmt::Debug {
    /// Whether the bundle serving replica tables on `cluster` is healthy.
    /// An error means the cluster could not be asked.
    async fn probe_bundle_health(&self, cluster: &str) -> ChaosResult<bool>;
}

/// Health set by hand. Clusters never marked are healthy.
#[derive(Debug, Default)]
pub struct ManualClusterState {
    unhealthy: RwLock<BTreeSet<String>>,
    unreachable: RwLock<BTreeSet<String>>,
}

impl ManualClusterState {
    /// Every cluster healthy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a cluster healthy or unhealthy.
    pub fn set_healthy(&self, cluster: &str, healthy: bool) {
        let mut unhealthy = self.unhealthy.write();
        if healthy {
            unhealthy.remove(cluster);
        } else {
            unhealthy.insert(cluster.to_string());
        }
    }

    /// Makes probes of a cluster fail.
    pub fn set_reachable(&self, cluster: &str, reachable: bool) {
        let mut unreachable = self.unreachable.write();
        if reachable {
            unreachable.remove(cluster);
        } else {
            unreachable.insert(cluster.to_string());
        }
    }
}

#[async_trait]
impl ClusterStateProvider for ManualClusterState {
    async fn probe_bundle_health(&self, cluster: &str) -> ChaosResult<bool> {
        if self.unreachable.read().contains(cluster) {
            return Err(chaos_meta::error::ChaosError::Timeout {
                what: format!("bundle health probe of {}", cluster),
            });
        }
        Ok(!self.unhealthy.read().contains(cluster))
    }
}

#[derive(Clone, Copy, Debug)]
struct CachedHealth {
    healthy: bool,
    updated_at: Instant,
    probe_failed: bool,
}

/// Per-cluster cache of bundle health.
#[derive(Debug)]
pub struct BundleHealthCache {
    refresh_time: Duration,
    expire_after_success: Duration,
    expire_after_failure: Duration,
    entries: Mutex<BTreeMap<String, CachedHealth>>,
}

impl BundleHealthCache {
    /// Empty cache with the given TTLs.
    pub fn new(config: &BundleHealthCacheConfig) -> Self {
        Self {
            refresh_time: Duration::from_millis(config.refresh_time_ms),
            expire_after_success: Duration::from_millis(config.expire_after_successful_update_time_ms),
            expire_after_failure: Duration::from_millis(config.expire_after_failed_update_time_ms),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Cached answer for `cluster`, if it has not expired.
    pub fn cached(&self, cluster: &str, now: Instant) -> Option<bool> {
        let entries = self.entries.lock();
        let entry = entries.get(cluster)?;
        let ttl = if entry.probe_failed {
            self.expire_after_failure
        } else {
            self.expire_after_success
        };
        (now.saturating_duration_since(entry.updated_at) < ttl).then_some(entry.healthy)
    }

    fn needs_refresh(&self, cluster: &str, now: Instant) -> bool {
        self.entries
            .lock()
            .get(cluster)
            .map(|e| now.saturating_duration_since(e.updated_at) >= self.refresh_time)
            .unwrap_or(true)
    }

    /// Health of `cluster`, probing when the cached answer is stale.
    /// A cluster with no live answer counts as unhealthy.
    pub async fn health(&self, cluster: &str, provider: &dyn ClusterStateProvider, now: Instant) -> bool {
        if self.needs_refresh(cluster, now) {
            match provider.probe_bundle_health(cluster).await {
                Ok(healthy) => {
                    self.entries.lock().insert(
                        cluster.to_string(),
                        CachedHealth {
                            healthy,
                            updated_at: now,
                            probe_failed: false,
                        },
                    );
                    debug!(%cluster, healthy, "bundle health refreshed");
                }
                Err(e) => {
                    warn!(%cluster, error = %e, "bundle health probe failed");
                    let mut entries = self.entries.lock();
                    let expired = entries
                        .get(cluster)
                        .map(|entry| {
                            !entry.probe_failed
                                && now.saturating_duration_since(entry.updated_at) >= self.expire_after_success
                        })
                        .unwrap_or(true);
                    if expired {
                        entries.insert(
                            cluster.to_string(),
                            CachedHealth {
                                healthy: false,
                                updated_at: now,
                                probe_failed: true,
                            },
                        );
                    }
                }
            }
        }
        self.cached(cluster, now).unwrap_or(false)
    }

    /// Drops every cached answer.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
