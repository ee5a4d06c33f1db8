//! System-level properties of chaos replication.

use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chaos_meta::card::{CardFetchOptions, CardPatch, ReplicaPatch, ReplicaSpec, ReplicatedTableOptions};
use chaos_meta::clock::ClockRegistry;
use chaos_meta::config::ChaosCellConfig;
use chaos_meta::directory::Directory;
use chaos_meta::migration::CardSnapshot;
use chaos_meta::types::{CellId, ClusterTag, ReplicaContentType, ReplicaMode, ReplicaState};
use chaos_meta::ChaosError;
use chaos_mgmt::environment::Environment;
use chaos_repl::client::{Client, TableRef};
use chaos_repl::retry::RetryConfig;
use chaos_repl::row::Row;
use chaos_repl::schema::TableSchema;
use chaos_tests::{environment, lookup, random_rows, row, select_all, wait_for, WAIT};

const A: &str = "primary";
const B: &str = "remote_0";
const C: &str = "remote_1";

fn replicated_table(env: &Environment, path: &str) {
    env.client(A)
        .unwrap()
        .create_chaos_replicated_table(path, TableSchema::simple_sorted(), env.bundle(), None)
        .unwrap();
}

fn replica(env: &Environment, crt: &str, spec: ReplicaSpec) -> chaos_meta::types::ReplicaId {
    env.create_replica(crt, spec).unwrap().replica_id
}

fn sorted_by_key(mut rows: Vec<Row>) -> Vec<Row> {
    rows.sort_by_key(|r| format!("{:020?}", r.get("key")));
    rows
}

#[tokio::test]
async fn test_progress_never_decreases() {
    let owned = environment(&[A, B], &[10]);
    let env = &owned;
    replicated_table(env, "//crt");
    replica(env, "//crt", ReplicaSpec::new(A, "//q", ReplicaContentType::Queue, ReplicaMode::Sync, true));
    replica(env, "//crt", ReplicaSpec::new(A, "//t", ReplicaContentType::Data, ReplicaMode::Sync, true));
    replica(env, "//crt", ReplicaSpec::new(B, "//t", ReplicaContentType::Data, ReplicaMode::Async, true));

    let client = env.client(A).unwrap();
    let mut observed: BTreeMap<(String, String), chaos_meta::ReplicationProgress> = BTreeMap::new();
    for (i, batch) in random_rows(11, 40).chunks(4).enumerate() {
        client
            .insert_rows(&TableRef::chaos("//crt"), batch.to_vec())
            .await
            .unwrap();
        if i % 3 == 0 {
            // Flip the remote replica off and on to move it across eras.
            let card = client.replication_card("//crt").unwrap();
            if let Some((id, info)) = card.replicas.iter().find(|(_, r)| r.cluster_name == B) {
                let enable = info.state != ReplicaState::Enabled;
                let _ = env.directory().alter_replica(card.id, *id, ReplicaPatch::enabled(enable));
            }
        }
        env.tick().await;
        for (cluster, path) in [(A, "//q"), (A, "//t"), (B, "//t")] {
            let progress = env.node(cluster).unwrap().table(path).unwrap().progress();
            if let Some(previous) = observed.get(&(cluster.to_string(), path.to_string())) {
                assert!(
                    progress.is_ge(previous),
                    "progress of {}:{} went back from {} to {}",
                    cluster,
                    path,
                    previous,
                    progress
                );
            }
            observed.insert((cluster.to_string(), path.to_string()), progress);
        }
    }
}

#[tokio::test]
async fn test_sync_queues_cover_committed_writes() {
    let owned = environment(&[A, B, C], &[10]);
    let env = &owned;
    replicated_table(env, "//crt");
    replica(env, "//crt", ReplicaSpec::new(A, "//t", ReplicaContentType::Data, ReplicaMode::Sync, true));
    replica(env, "//crt", ReplicaSpec::new(B, "//q", ReplicaContentType::Queue, ReplicaMode::Sync, true));
    replica(env, "//crt", ReplicaSpec::new(C, "//q", ReplicaContentType::Queue, ReplicaMode::Sync, true));
    env.settle(2).await;

    let client = env.client(A).unwrap();
    let schema = TableSchema::simple_sorted();
    let mut commits = Vec::new();
    for r in random_rows(3, 10) {
        let ts = client
            .insert_rows(&TableRef::chaos("//crt"), vec![r.clone()])
            .await
            .unwrap();
        commits.push((schema.key_of(&r).unwrap(), ts));
    }

    let commits = &commits;
    let covered = wait_for(env, WAIT, || async move {
        let Ok(card) = env.client(A).unwrap().replication_card("//crt") else {
            return false;
        };
        card.replicas
            .values()
            .filter(|r| r.content_type == ReplicaContentType::Queue && r.mode == ReplicaMode::Sync)
            .all(|queue| {
                commits.iter().all(|(key, ts)| {
                    queue
                        .replication_progress
                        .timestamp_at(key)
                        .map(|at| at >= *ts)
                        .unwrap_or(false)
                })
            })
    })
    .await;
    assert!(covered, "sync queues never reported the committed writes");
}

#[tokio::test]
async fn test_enabled_replica_round_trips_written_rows() {
    for seed in [1u64, 2, 3] {
        let owned = environment(&[A, B], &[10]);
        let env = &owned;
        replicated_table(env, "//crt");
        replica(env, "//crt", ReplicaSpec::new(A, "//q", ReplicaContentType::Queue, ReplicaMode::Sync, true));
        replica(env, "//crt", ReplicaSpec::new(A, "//t", ReplicaContentType::Data, ReplicaMode::Sync, true));
        let late = env
            .create_replica(
                "//crt",
                ReplicaSpec::new(B, "//t", ReplicaContentType::Data, ReplicaMode::Async, false),
            )
            .unwrap();
        env.settle(2).await;

        let rows = random_rows(seed, 25);
        let client = env.client(A).unwrap();
        for chunk in rows.chunks(5) {
            client
                .insert_rows(&TableRef::chaos("//crt"), chunk.to_vec())
                .await
                .unwrap();
        }
        client
            .alter_table_replica(&late, ReplicaPatch::enabled(true))
            .unwrap();

        let expected = sorted_by_key(rows.clone());
        let expected = &expected;
        let complete = wait_for(env, WAIT, || async move {
            sorted_by_key(select_all(env, B, "//t").await) == *expected
        })
        .await;
        assert!(complete, "seed {}: enabled replica did not converge", seed);
    }
}

#[tokio::test]
async fn test_migration_there_and_back_preserves_card() {
    let owned = environment(&[A, B], &[10, 11]);
    let env = &owned;
    replicated_table(env, "//crt");
    replica(env, "//crt", ReplicaSpec::new(A, "//q", ReplicaContentType::Queue, ReplicaMode::Sync, true));
    replica(env, "//crt", ReplicaSpec::new(A, "//t", ReplicaContentType::Data, ReplicaMode::Sync, true));
    replica(env, "//crt", ReplicaSpec::new(B, "//t", ReplicaContentType::Data, ReplicaMode::Async, true));
    env.settle(2).await;
    let client = env.client(A).unwrap();
    client
        .insert_rows(&TableRef::chaos("//crt"), vec![row(1, "1")])
        .await
        .unwrap();
    env.settle(2).await;

    let card_id = client.chaos_replicated_table("//crt").unwrap().card_id;
    let before = CardSnapshot::capture(&env.directory().get_card(card_id, CardFetchOptions::all()).unwrap());
    env.directory().migrate_cards(&[card_id], CellId::with_tag(11)).unwrap();
    assert_eq!(env.directory().locate_card(card_id).unwrap().cell_id(), CellId::with_tag(11));
    env.directory().migrate_cards(&[card_id], CellId::with_tag(10)).unwrap();
    let after = CardSnapshot::capture(&env.directory().get_card(card_id, CardFetchOptions::all()).unwrap());
    assert_eq!(after.to_bytes().unwrap(), before.to_bytes().unwrap());

    client
        .insert_rows(&TableRef::chaos("//crt"), vec![row(2, "2")])
        .await
        .unwrap();
    let replicated = wait_for(env, WAIT, || async move { lookup(env, B, "//t", 2).await.is_some() }).await;
    assert!(replicated, "replication stalled after migrating back");
}

#[tokio::test]
async fn test_collocated_cards_fail_over_jointly() {
    for banned in [A, B] {
        let owned = environment(&[A, B, C], &[10]);
        let env = &owned;
        let mut card_ids = Vec::new();
        for crt in ["//x", "//y", "//z"] {
            replicated_table(env, crt);
            let queue = format!("{}_q", crt);
            let data = format!("{}_t", crt);
            for (cluster, mode) in [(A, ReplicaMode::Sync), (B, ReplicaMode::Sync), (C, ReplicaMode::Async)] {
                replica(env, crt, ReplicaSpec::new(cluster, &queue, ReplicaContentType::Queue, mode, true));
                replica(env, crt, ReplicaSpec::new(cluster, &data, ReplicaContentType::Data, mode, true));
            }
            card_ids.push(env.client(A).unwrap().chaos_replicated_table(crt).unwrap().card_id);
        }
        let cell = env.directory().locate_card(card_ids[0]).unwrap();
        cell.create_collocation(&card_ids).unwrap();
        for card_id in &card_ids {
            cell.alter_card(
                *card_id,
                CardPatch {
                    replicated_table_options: Some(ReplicatedTableOptions {
                        enable_replicated_table_tracker: true,
                        min_sync_replica_count: Some(1),
                        max_sync_replica_count: Some(2),
                        banned_replica_clusters: BTreeSet::from([banned.to_string()]),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .unwrap();
        }
        env.settle(3).await;
        env.run_tracker_cycle().await;

        let sets: Vec<BTreeSet<String>> = card_ids
            .iter()
            .map(|card_id| {
                env.directory()
                    .get_card(*card_id, CardFetchOptions::all())
                    .unwrap()
                    .replicas
                    .values()
                    .filter(|r| r.content_type == ReplicaContentType::Data && r.mode.receives_writes())
                    .map(|r| r.cluster_name.clone())
                    .collect()
            })
            .collect();
        assert!(sets.windows(2).all(|w| w[0] == w[1]), "banned {}: {:?}", banned, sets);
        assert!(!sets[0].contains(banned));
        assert!(!sets[0].is_empty());
    }
}

#[tokio::test]
async fn test_foreign_clock_write_leaves_no_state() {
    let owned = environment(&[A, B], &[10]);
    let env = &owned;
    replicated_table(env, "//crt");
    replica(env, "//crt", ReplicaSpec::new(A, "//q", ReplicaContentType::Queue, ReplicaMode::Sync, true));
    replica(env, "//crt", ReplicaSpec::new(B, "//t", ReplicaContentType::Data, ReplicaMode::Sync, true));
    env.settle(2).await;

    let foreign = Client::new(
        A,
        env.directory().clocks().get_or_create(ClusterTag::new(2)),
        env.directory().clone(),
        env.transport().clone(),
        env.catalog().clone(),
        RetryConfig::from_backoff(&env.spec().config.tablet_node.backoff, 2),
    );
    let queue_rows = env.node(A).unwrap().table("//q").unwrap().tablet_infos()[0].total_row_count;
    let err = foreign
        .insert_rows(&TableRef::chaos("//crt"), vec![row(9, "9")])
        .await
        .unwrap_err();
    assert!(matches!(err, ChaosError::ClockClusterTagMismatch { .. }), "{}", err);

    assert_eq!(lookup(env, B, "//t", 9).await, None);
    assert_eq!(
        env.node(A).unwrap().table("//q").unwrap().tablet_infos()[0].total_row_count,
        queue_rows
    );
    env.settle(2).await;
    assert!(select_all(env, B, "//t").await.is_empty());
}

fn directory() -> Directory {
    let directory = Directory::new(Arc::new(ClockRegistry::new()), ChaosCellConfig::default());
    directory
        .create_bundle("chaos", ClusterTag::new(1), vec![A.into(), B.into()])
        .unwrap();
    directory.create_cell("chaos", "default", 10).unwrap();
    directory
}

#[derive(Debug, Clone)]
enum Alteration {
    Toggle(usize),
    Mode(usize),
}

fn alteration() -> impl Strategy<Value = Alteration> {
    prop_oneof![
        (0usize..3).prop_map(Alteration::Toggle),
        (0usize..3).prop_map(Alteration::Mode),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_era_increases_with_every_committed_alteration(ops in prop::collection::vec(alteration(), 1..12)) {
        let directory = directory();
        let card_id = directory
            .create_card(CellId::with_tag(10), Default::default())
            .unwrap();
        let cell = directory.locate_card(card_id).unwrap();
        cell.create_replica(card_id, ReplicaSpec::new(A, "//q", ReplicaContentType::Queue, ReplicaMode::Sync, true))
            .unwrap();
        let mut ids = Vec::new();
        for (cluster, path) in [(A, "//t"), (B, "//t"), (B, "//q")] {
            let content_type = if path == "//q" { ReplicaContentType::Queue } else { ReplicaContentType::Data };
            ids.push(
                cell.create_replica(card_id, ReplicaSpec::new(cluster, path, content_type, ReplicaMode::Async, true))
                    .unwrap(),
            );
        }
        directory.tick();

        let mut era = directory.get_card(card_id, CardFetchOptions::all()).unwrap().era;
        for op in ops {
            let card = directory.get_card(card_id, CardFetchOptions::all()).unwrap();
            let (replica_id, patch) = match op {
                Alteration::Toggle(i) => {
                    let info = card.replica(ids[i]).unwrap();
                    (ids[i], ReplicaPatch::enabled(info.state != ReplicaState::Enabled))
                }
                Alteration::Mode(i) => {
                    let info = card.replica(ids[i]).unwrap();
                    let to = if info.mode == ReplicaMode::Sync { ReplicaMode::Async } else { ReplicaMode::Sync };
                    (ids[i], ReplicaPatch::mode(to))
                }
            };
            let committed = directory.alter_replica(card_id, replica_id, patch);
            let now = directory.get_card(card_id, CardFetchOptions::all()).unwrap().era;
            match committed {
                Ok(_) => prop_assert!(now >= era),
                Err(_) => prop_assert_eq!(now, era),
            }
            if now != era {
                prop_assert!(now > era);
            }
            era = now;

            // Let transitions finish so the next alteration is accepted.
            for _ in 0..3 {
                directory.tick();
                let card = directory.get_card(card_id, CardFetchOptions::all()).unwrap();
                for (id, info) in &card.replicas {
                    if !info.history.is_empty() {
                        let progress = chaos_meta::ReplicationProgress::full(card.current_timestamp);
                        let _ = cell.update_replica_progress(card_id, *id, &progress);
                    }
                }
            }
            let settled = directory.get_card(card_id, CardFetchOptions::all()).unwrap().era;
            prop_assert!(settled >= era);
            era = settled;
        }
    }
}
