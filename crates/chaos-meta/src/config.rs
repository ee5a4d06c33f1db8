//! Configuration knobs of the chaos replication subsystem.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Exponential backoff parameters for retried RPCs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First retry delay.
    pub initial_ms: u64,
    /// Delay cap.
    pub max_ms: u64,
    /// Growth factor between retries.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 100,
            max_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

/// Tablet node knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TabletNodeConfig {
    /// Reject transactions stamped by a clock the bundle does not trust.
    pub reject_incorrect_clock_cluster_tag: bool,
    /// Puller and progress reporting cadence.
    pub replication_progress_update_tick_period_ms: u64,
    /// Maximum rows returned by one pull.
    pub pull_row_limit: usize,
    /// Deadline of every tablet node RPC.
    pub rpc_timeout_ms: u64,
    /// Retry policy of failed pulls.
    pub backoff: BackoffConfig,
}

impl Default for TabletNodeConfig {
    fn default() -> Self {
        Self {
            reject_incorrect_clock_cluster_tag: true,
            replication_progress_update_tick_period_ms: 100,
            pull_row_limit: 1_000,
            rpc_timeout_ms: 5_000,
            backoff: BackoffConfig::default(),
        }
    }
}

impl TabletNodeConfig {
    /// Tick period as a duration.
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.replication_progress_update_tick_period_ms)
    }

    /// RPC deadline as a duration.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Alien cell synchronizer cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlienCellSynchronizerConfig {
    /// Incremental sync period.
    pub sync_period_ms: u64,
    /// Full sync period.
    pub full_sync_period_ms: u64,
}

impl Default for AlienCellSynchronizerConfig {
    fn default() -> Self {
        Self {
            sync_period_ms: 1_000,
            full_sync_period_ms: 60_000,
        }
    }
}

/// Chaos cell knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaosCellConfig {
    /// How often every card's current timestamp is bumped.
    pub current_timestamp_propagation_period_ms: u64,
    /// Replica history younger than this is never forsaken.
    pub replica_history_retention_ms: u64,
    /// Maximum journal entries kept in memory.
    pub journal_max_entries: usize,
    /// Alien cell synchronizer cadence.
    pub alien_cell_synchronizer: AlienCellSynchronizerConfig,
}

impl Default for ChaosCellConfig {
    fn default() -> Self {
        Self {
            current_timestamp_propagation_period_ms: 100,
            replica_history_retention_ms: 600_000,
            journal_max_entries: 10_000,
            alien_cell_synchronizer: AlienCellSynchronizerConfig::default(),
        }
    }
}

/// Bundle health cache TTLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleHealthCacheConfig {
    /// Age after which a cached answer is refreshed.
    pub refresh_time_ms: u64,
    /// Age after which a successful answer is dropped.
    pub expire_after_successful_update_time_ms: u64,
    /// Age after which a failed answer is dropped.
    pub expire_after_failed_update_time_ms: u64,
}

impl Default for BundleHealthCacheConfig {
    fn default() -> Self {
        Self {
            refresh_time_ms: 1_000,
            expire_after_successful_update_time_ms: 10_000,
            expire_after_failed_update_time_ms: 5_000,
        }
    }
}

/// Replicated table tracker knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicatedTableTrackerConfig {
    /// Master switch.
    pub use_new_tracker: bool,
    /// Tick cadence.
    pub tick_period_ms: u64,
    /// Bundle health cache TTLs.
    pub bundle_health_cache: BundleHealthCacheConfig,
}

impl Default for ReplicatedTableTrackerConfig {
    fn default() -> Self {
        Self {
            use_new_tracker: true,
            tick_period_ms: 1_000,
            bundle_health_cache: BundleHealthCacheConfig::default(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaosConfig {
    /// Tablet node knobs.
    pub tablet_node: TabletNodeConfig,
    /// Chaos cell knobs.
    pub chaos_cell: ChaosCellConfig,
    /// Tracker knobs.
    pub replicated_table_tracker: ReplicatedTableTrackerConfig,
}

impl ChaosConfig {
    /// Loads a config from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ChaosConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks knob consistency.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tablet_node.replication_progress_update_tick_period_ms == 0 {
            anyhow::bail!("tablet_node.replication_progress_update_tick_period_ms must be positive");
        }
        if self.tablet_node.pull_row_limit == 0 {
            anyhow::bail!("tablet_node.pull_row_limit must be positive");
        }
        let backoff = &self.tablet_node.backoff;
        if backoff.multiplier < 1.0 || backoff.initial_ms > backoff.max_ms {
            anyhow::bail!("tablet_node.backoff must grow from initial_ms up to max_ms");
        }
        let alien = &self.chaos_cell.alien_cell_synchronizer;
        if alien.full_sync_period_ms < alien.sync_period_ms {
            anyhow::bail!(
                "chaos_cell.alien_cell_synchronizer.full_sync_period_ms must not be below sync_period_ms"
            );
        }
        let cache = &self.replicated_table_tracker.bundle_health_cache;
        if cache.refresh_time_ms > cache.expire_after_successful_update_time_ms {
            anyhow::bail!(
                "replicated_table_tracker.bundle_health_cache.refresh_time_ms exceeds expiration"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = ChaosConfig::default();
        assert!(config.tablet_node.reject_incorrect_clock_cluster_tag);
        assert_eq!(config.tablet_node.replication_progress_update_tick_period_ms, 100);
        assert!(config.replicated_table_tracker.use_new_tracker);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "tablet_node": {{ "pull_row_limit": 7, "reject_incorrect_clock_cluster_tag": false }},
                "replicated_table_tracker": {{ "use_new_tracker": false }}
            }}"#
        )
        .unwrap();

        let config = ChaosConfig::from_file(file.path()).unwrap();
        assert_eq!(config.tablet_node.pull_row_limit, 7);
        assert!(!config.tablet_node.reject_incorrect_clock_cluster_tag);
        assert!(!config.replicated_table_tracker.use_new_tracker);
        assert_eq!(config.tablet_node.rpc_timeout_ms, 5_000);
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[chaos_cell]
current_timestamp_propagation_period_ms = 50

[chaos_cell.alien_cell_synchronizer]
sync_period_ms = 200
full_sync_period_ms = 2000

[replicated_table_tracker.bundle_health_cache]
refresh_time_ms = 300
"#
        )
        .unwrap();

        let config = ChaosConfig::from_file(file.path()).unwrap();
        assert_eq!(config.chaos_cell.current_timestamp_propagation_period_ms, 50);
        assert_eq!(config.chaos_cell.alien_cell_synchronizer.sync_period_ms, 200);
        assert_eq!(
            config.replicated_table_tracker.bundle_health_cache.refresh_time_ms,
            300
        );
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(ChaosConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_periods() {
        let mut config = ChaosConfig::default();
        config.chaos_cell.alien_cell_synchronizer.full_sync_period_ms = 10;
        assert!(config.validate().is_err());
    }
}
