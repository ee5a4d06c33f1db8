use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::info;

use chaos_meta::card::ReplicaSpec;
use chaos_meta::config::ChaosConfig;
use chaos_meta::key::Value;
use chaos_meta::types::{ReplicaContentType, ReplicaMode};
use chaos_repl::client::{LookupOptions, TableRef};
use chaos_repl::row::Row;
use chaos_repl::schema::TableSchema;

use crate::environment::{Environment, EnvironmentSpec};
use crate::summary::CardSummary;

/// Operator CLI of the chaos replication control plane.
#[derive(Parser)]
#[command(name = "chaosctl")]
#[command(about = "Chaos replication control plane CLI", long_about = None)]
pub struct Cli {
    /// Configuration file (.toml or .json).
    #[arg(short, long, env = "CHAOS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Loads a config file, validates it and prints the effective config.
    ValidateConfig {
        /// Config file to check.
        path: PathBuf,
        /// Print JSON instead of TOML.
        #[arg(long)]
        json: bool,
    },
    /// Boots a three-cluster environment, replicates one row and prints the card.
    Demo {
        /// Seconds to wait for the async replica to catch up.
        #[arg(long, default_value = "10")]
        timeout_secs: u64,
    },
}

impl Cli {
    /// Runs the selected subcommand.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::ValidateConfig { ref path, json } => {
                println!("{}", render_config(path, json)?);
                Ok(())
            }
            Command::Demo { timeout_secs } => {
                let config = match &self.config {
                    Some(path) => ChaosConfig::from_file(path)
                        .with_context(|| format!("loading {}", path.display()))?,
                    None => ChaosConfig::default(),
                };
                let report = run_demo(config, Duration::from_secs(timeout_secs)).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                Ok(())
            }
        }
    }
}

/// Loads and validates `path`, rendering the effective config.
pub fn render_config(path: &Path, json: bool) -> Result<String> {
    let config = ChaosConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?;
    if json {
        Ok(serde_json::to_string_pretty(&config)?)
    } else {
        Ok(toml::to_string_pretty(&config)?)
    }
}

/// Outcome of the demo.
#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    /// The card after replication.
    pub card: CardSummary,
    /// Value read back from each data replica, by cluster.
    pub values: BTreeMap<String, Option<String>>,
    /// Milliseconds until the async replica had the row.
    pub catch_up_ms: u128,
}

/// Three clusters: sync data on the first, a sync queue on the second and
/// async data on the third. One row is written through the chaos replicated
/// table and read back from both data replicas.
pub async fn run_demo(config: ChaosConfig, timeout: Duration) -> Result<DemoReport> {
    let env = Environment::new(EnvironmentSpec {
        config,
        ..Default::default()
    })?;
    let clusters = env.spec().clusters.clone();
    let [sync_data, sync_queue, async_data] = match clusters.as_slice() {
        [a, b, c, ..] => [a.clone(), b.clone(), c.clone()],
        _ => anyhow::bail!("demo needs three clusters"),
    };

    let client = env.client(&sync_data)?;
    client.create_chaos_replicated_table("//demo/crt", TableSchema::simple_sorted(), env.bundle(), None)?;
    for (cluster, path, content_type, mode) in [
        (&sync_data, "//demo/t", ReplicaContentType::Data, ReplicaMode::Sync),
        (&sync_queue, "//demo/q", ReplicaContentType::Queue, ReplicaMode::Sync),
        (&async_data, "//demo/t", ReplicaContentType::Data, ReplicaMode::Async),
    ] {
        env.create_replica("//demo/crt", ReplicaSpec::new(cluster.as_str(), path, content_type, mode, true))?;
    }
    env.settle(3).await;

    let row = Row::new().with("key", 0i64).with("value", "0");
    let ts = client
        .insert_rows(&TableRef::chaos("//demo/crt"), vec![row])
        .await?;
    info!(commit_timestamp = %ts, "demo row written");

    let key = [Row::new().with("key", 0i64)];
    let started = Instant::now();
    let mut values = BTreeMap::new();
    for cluster in [&sync_data, &async_data] {
        let reader = env.client(cluster)?;
        let target = TableRef::replica(cluster.as_str(), "//demo/t");
        let value = loop {
            let rows = reader.lookup_rows(&target, &key, &LookupOptions::default()).await?;
            let found = rows.into_iter().flatten().next().and_then(|r| match r.get("value") {
                Some(Value::String(s)) => Some(s.clone()),
                _ => None,
            });
            if found.is_some() || started.elapsed() >= timeout {
                break found;
            }
            env.tick().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        values.insert(cluster.clone(), value);
    }
    let catch_up_ms = started.elapsed().as_millis();

    let card = client.replication_card("//demo/crt")?;
    Ok(DemoReport {
        card: CardSummary::from(&card),
        values,
        catch_up_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaos_meta::config::BackoffConfig;
    use std::io::Write;

    #[test]
    fn test_render_config_toml_and_json() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[tablet_node]\npull_row_limit = 7").unwrap();
        let toml_out = render_config(file.path(), false).unwrap();
        assert!(toml_out.contains("pull_row_limit = 7"));
        let json_out = render_config(file.path(), true).unwrap();
        assert!(json_out.contains("\"pull_row_limit\": 7"));
    }

    #[test]
    fn test_render_config_rejects_invalid() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(file, r#"{{"tablet_node": {{"pull_row_limit": 0}}}}"#).unwrap();
        assert!(render_config(file.path(), false).is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["chaosctl", "validate-config", "/tmp/c.toml", "--json"]).unwrap();
        assert!(matches!(cli.command, Command::ValidateConfig { json: true, .. }));
        let cli = Cli::try_parse_from(["chaosctl", "demo", "--timeout-secs", "3"]).unwrap();
        assert!(matches!(cli.command, Command::Demo { timeout_secs: 3 }));
    }

    #[tokio::test]
    async fn test_demo_replicates_row_everywhere() {
        let mut config = ChaosConfig::default();
        config.tablet_node.backoff = BackoffConfig {
            initial_ms: 1,
            max_ms: 4,
            multiplier: 2.0,
        };
        let report = run_demo(config, Duration::from_secs(5)).await.unwrap();
        assert_eq!(report.values.len(), 2);
        assert!(report.values.values().all(|v| v.as_deref() == Some("0")));
        assert_eq!(report.card.replicas.len(), 3);
        assert!(report.card.era > 0);
    }
}
