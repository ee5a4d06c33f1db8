//! Test harness: environments with fast backoff, polling helpers and row builders.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::future::Future;
use std::sync::Once;
use std::time::{Duration, Instant};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chaos_meta::config::{BackoffConfig, BundleHealthCacheConfig};
use chaos_meta::types::CellTag;
use chaos_mgmt::environment::{Environment, EnvironmentSpec};
use chaos_repl::client::{LookupOptions, TableRef};
use chaos_repl::row::Row;

static TRACING: Once = Once::new();

/// Installs a test subscriber once per process. Honors `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer())
            .with(EnvFilter::from_default_env())
            .try_init();
    });
}

/// Environment spec with millisecond backoffs and an always-refreshing
/// health cache.
pub fn fast_spec(clusters: &[&str], cell_tags: &[CellTag]) -> EnvironmentSpec {
    let mut spec = EnvironmentSpec {
        clusters: clusters.iter().map(|c| c.to_string()).collect(),
        cell_tags: cell_tags.to_vec(),
        max_write_retries: 8,
        ..Default::default()
    };
    spec.config.tablet_node.backoff = BackoffConfig {
        initial_ms: 1,
        max_ms: 4,
        multiplier: 2.0,
    };
    spec.config.replicated_table_tracker.bundle_health_cache = BundleHealthCacheConfig {
        refresh_time_ms: 0,
        expire_after_successful_update_time_ms: 60_000,
        expire_after_failed_update_time_ms: 60_000,
    };
    spec
}

/// Builds an environment from [`fast_spec`].
pub fn environment(clusters: &[&str], cell_tags: &[CellTag]) -> Environment {
    init_tracing();
    match Environment::new(fast_spec(clusters, cell_tags)) {
        Ok(env) => env,
        Err(e) => panic!("environment setup failed: {}", e),
    }
}

/// Ticks `env` until `condition` holds or `timeout` passes. Returns
/// whether the condition held.
pub async fn wait_for<F, Fut>(env: &Environment, timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        env.tick().await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Default timeout of [`wait_for`] calls in scenarios.
pub const WAIT: Duration = Duration::from_secs(10);

/// Row of the simple sorted schema.
pub fn row(key: i64, value: &str) -> Row {
    Row::new().with("key", key).with("value", value)
}

/// Key row of the simple sorted schema.
pub fn key(key: i64) -> Row {
    Row::new().with("key", key)
}

/// Reads one key from a replica table as seen by `cluster`'s client.
pub async fn lookup(env: &Environment, cluster: &str, path: &str, k: i64) -> Option<Row> {
    let client = env.client(cluster).ok()?;
    client
        .lookup_rows(&TableRef::replica(cluster, path), &[key(k)], &LookupOptions::default())
        .await
        .ok()?
        .into_iter()
        .next()
        .flatten()
}

/// Every row of a replica table at the latest timestamp.
pub async fn select_all(env: &Environment, cluster: &str, path: &str) -> Vec<Row> {
    match env.client(cluster) {
        Ok(client) => client
            .select_rows(&TableRef::replica(cluster, path), &LookupOptions::default())
            .await
            .unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

/// `count` rows with distinct keys drawn from `seed`.
pub fn random_rows(seed: u64, count: usize) -> Vec<Row> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut keys: Vec<i64> = Vec::with_capacity(count);
    while keys.len() < count {
        let k = rng.gen_range(0..10_000);
        if !keys.contains(&k) {
            keys.push(k);
        }
    }
    keys.into_iter()
        .map(|k| row(k, &format!("v{}", rng.gen::<u32>())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_rows_distinct_and_reproducible() {
        let a = random_rows(7, 20);
        let b = random_rows(7, 20);
        assert_eq!(a, b);
        let mut keys: Vec<_> = a.iter().map(|r| format!("{:?}", r.get("key"))).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 20);
    }

    #[test]
    fn test_fast_spec_shapes_environment() {
        let spec = fast_spec(&["a", "b"], &[10, 11]);
        assert_eq!(spec.clusters, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(spec.cell_tags, vec![10, 11]);
        assert!(spec.config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let env = environment(&["a"], &[10]);
        let held = wait_for(&env, Duration::from_millis(20), || async { false }).await;
        assert!(!held);
        assert!(wait_for(&env, Duration::from_millis(20), || async { true }).await);
    }
}
