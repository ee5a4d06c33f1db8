//! End-to-end scenarios over an in-process multi-cluster installation.

use std::collections::BTreeSet;

use chaos_meta::card::{CardPatch, ReplicaPatch, ReplicaSpec, ReplicationCard};
use chaos_meta::progress::ReplicationProgress;
use chaos_meta::types::{CardId, CellId, ReplicaContentType, ReplicaMode, ReplicaState, Timestamp};
use chaos_meta::ChaosError;
use chaos_mgmt::environment::Environment;
use chaos_repl::client::TableRef;
use chaos_repl::protocol::PullRowsRequest;
use chaos_repl::schema::TableSchema;
use chaos_repl::table::TabletLayout;
use chaos_tests::{environment, key, lookup, row, select_all, wait_for, WAIT};

const A: &str = "primary";
const B: &str = "remote_0";
const C: &str = "remote_1";

fn create_crt(env: &Environment, path: &str) -> CardId {
    env.client(A)
        .unwrap()
        .create_chaos_replicated_table(path, TableSchema::simple_sorted(), env.bundle(), None)
        .unwrap()
        .card_id
}

fn spec(cluster: &str, path: &str, content_type: ReplicaContentType, mode: ReplicaMode) -> ReplicaSpec {
    ReplicaSpec::new(cluster, path, content_type, mode, true)
}

fn card(env: &Environment, crt: &str) -> ReplicationCard {
    env.client(A).unwrap().replication_card(crt).unwrap()
}

fn sync_data_clusters(card: &ReplicationCard) -> BTreeSet<String> {
    card.replicas
        .values()
        .filter(|r| r.content_type == ReplicaContentType::Data && r.mode.receives_writes())
        .map(|r| r.cluster_name.clone())
        .collect()
}

#[tokio::test]
async fn test_basic_three_cluster_replication() {
    let owned = environment(&[A, B, C], &[10]);
    let env = &owned;
    create_crt(env, "//crt");
    env.create_replica("//crt", spec(A, "//t", ReplicaContentType::Data, ReplicaMode::Sync))
        .unwrap();
    env.create_replica("//crt", spec(B, "//q", ReplicaContentType::Queue, ReplicaMode::Sync))
        .unwrap();
    env.create_replica("//crt", spec(C, "//t", ReplicaContentType::Data, ReplicaMode::Async))
        .unwrap();
    env.settle(3).await;

    env.client(A)
        .unwrap()
        .insert_rows(&TableRef::chaos("//crt"), vec![row(0, "0")])
        .await
        .unwrap();
    assert_eq!(lookup(env, A, "//t", 0).await, Some(row(0, "0")));

    let replicated = wait_for(env, WAIT, || async move { lookup(env, C, "//t", 0).await.is_some() }).await;
    assert!(replicated, "async replica never caught up");
    assert_eq!(lookup(env, C, "//t", 0).await, Some(row(0, "0")));
}

#[tokio::test]
async fn test_sync_to_async_downgrade() {
    let owned = environment(&[A, B, C], &[10]);
    let env = &owned;
    create_crt(env, "//crt");
    let downgraded = env
        .create_replica("//crt", spec(A, "//t", ReplicaContentType::Data, ReplicaMode::Sync))
        .unwrap();
    env.create_replica("//crt", spec(B, "//q", ReplicaContentType::Queue, ReplicaMode::Sync))
        .unwrap();
    env.create_replica("//crt", spec(C, "//t", ReplicaContentType::Data, ReplicaMode::Sync))
        .unwrap();
    env.settle(3).await;

    let downgraded_id = downgraded.replica_id;
    let client = env.client(A).unwrap();
    let era = card(env, "//crt").era;
    let altered = client
        .alter_table_replica(&downgraded, ReplicaPatch::mode(ReplicaMode::Async))
        .unwrap();
    assert!(altered > era);
    let finished = wait_for(env, WAIT, || async move {
        card(env, "//crt").replica(downgraded_id).unwrap().mode == ReplicaMode::Async
    })
    .await;
    assert!(finished, "sync to async transition never finished");

    client
        .insert_rows(&TableRef::chaos("//crt"), vec![row(1, "1")])
        .await
        .unwrap();
    assert_eq!(lookup(env, A, "//t", 1).await, None);
    assert_eq!(lookup(env, C, "//t", 1).await, Some(row(1, "1")));

    let err = client
        .insert_rows(&TableRef::replica(A, "//t"), vec![row(2, "2")])
        .await
        .unwrap_err();
    assert!(matches!(err, ChaosError::ReplicaNotWritable { .. }));
}

#[tokio::test]
async fn test_resharded_queue_pull_ordered_by_timestamp() {
    let owned = environment(&[A, B], &[10]);
    let env = &owned;
    create_crt(env, "//crt");
    let schema = TableSchema::simple_sorted();
    let pivots = vec![schema.key_of(&key(1)).unwrap(), schema.key_of(&key(2)).unwrap()];
    let queue = env
        .create_replica_with_layout(
            "//crt",
            spec(A, "//q", ReplicaContentType::Queue, ReplicaMode::Sync),
            Some(TabletLayout::Sorted { pivot_keys: pivots }),
        )
        .unwrap();
    assert_eq!(env.node(A).unwrap().table("//q").unwrap().tablet_infos().len(), 3);
    env.settle(2).await;

    let client = env.client(A).unwrap();
    let mut last = Timestamp::MIN;
    for k in [1, 2, 0, 4, 3] {
        last = client
            .insert_rows(&TableRef::chaos("//crt"), vec![row(k, &k.to_string())])
            .await
            .unwrap();
    }
    let caught_up = wait_for(env, WAIT, || async move {
        env.node(A)
            .unwrap()
            .table("//q")
            .unwrap()
            .progress()
            .is_ge_timestamp(last)
    })
    .await;
    assert!(caught_up);

    let response = client
        .pull_rows(
            A,
            PullRowsRequest {
                replica_path: "//q".into(),
                upstream_replica_id: queue.replica_id,
                era: card(env, "//crt").era,
                progress: ReplicationProgress::full(Timestamp::MIN),
                upper_timestamp: None,
                order_by_timestamp: true,
                row_limit: 100,
            },
        )
        .await
        .unwrap();
    assert_eq!(response.rows.len(), 5);
    assert!(response.rows.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    assert_eq!(response.end_row_indexes.len(), 3);
}

#[tokio::test]
async fn test_new_replica_without_catchup_sees_only_new_rows() {
    let owned = environment(&[A, B], &[10]);
    let env = &owned;
    create_crt(env, "//crt");
    env.create_replica("//crt", spec(A, "//q", ReplicaContentType::Queue, ReplicaMode::Sync))
        .unwrap();
    env.create_replica("//crt", spec(A, "//t", ReplicaContentType::Data, ReplicaMode::Sync))
        .unwrap();
    env.settle(2).await;
    let client = env.client(A).unwrap();
    client
        .insert_rows(&TableRef::chaos("//crt"), vec![row(0, "0")])
        .await
        .unwrap();
    env.settle(2).await;

    let fresh = env
        .create_replica(
            "//crt",
            spec(B, "//t", ReplicaContentType::Data, ReplicaMode::Async).with_catchup(false),
        )
        .unwrap();
    let fresh_id = fresh.replica_id;
    let enabled = wait_for(env, WAIT, || async move {
        card(env, "//crt").replica(fresh_id).unwrap().state == ReplicaState::Enabled
    })
    .await;
    assert!(enabled);

    client
        .insert_rows(&TableRef::chaos("//crt"), vec![row(1, "1")])
        .await
        .unwrap();
    let pulled = wait_for(env, WAIT, || async move { lookup(env, B, "//t", 1).await.is_some() }).await;
    assert!(pulled);
    env.settle(3).await;
    assert_eq!(select_all(env, B, "//t").await, vec![row(1, "1")]);
}

#[tokio::test]
async fn test_coordinator_suspension_and_resume() {
    let owned = environment(&[A, B], &[10, 11]);
    let env = &owned;
    let card_id = create_crt(env, "//crt");
    env.create_replica("//crt", spec(A, "//q", ReplicaContentType::Queue, ReplicaMode::Sync))
        .unwrap();
    env.settle(1).await;
    let both: BTreeSet<CellId> = [CellId::with_tag(10), CellId::with_tag(11)].into_iter().collect();
    let coordinators = |env: &Environment| -> BTreeSet<CellId> {
        card(env, "//crt").coordinator_cell_ids.into_iter().collect()
    };
    assert_eq!(coordinators(env), both);

    env.directory().suspend_coordinator(CellId::with_tag(11)).unwrap();
    env.tick().await;
    assert_eq!(
        card(env, "//crt").coordinator_cell_ids,
        vec![CellId::with_tag(10)]
    );
    env.client(A)
        .unwrap()
        .insert_rows(&TableRef::chaos("//crt"), vec![row(5, "5")])
        .await
        .unwrap();

    env.directory().resume_coordinator(CellId::with_tag(11)).unwrap();
    env.tick().await;
    assert_eq!(coordinators(env), both);
    assert_eq!(
        env.directory().locate_card(card_id).unwrap().cell_id(),
        CellId::with_tag(10)
    );
}

#[tokio::test]
async fn test_collocation_fails_over_together() {
    let owned = environment(&[A, B], &[10]);
    let env = &owned;
    let mut card_ids = Vec::new();
    for crt in ["//a", "//b"] {
        card_ids.push(create_crt(env, crt));
        let queue = format!("{}_q", crt);
        let data = format!("{}_t", crt);
        for (cluster, mode) in [(A, ReplicaMode::Sync), (B, ReplicaMode::Async)] {
            env.create_replica(crt, spec(cluster, &queue, ReplicaContentType::Queue, mode))
                .unwrap();
            env.create_replica(crt, spec(cluster, &data, ReplicaContentType::Data, mode))
                .unwrap();
        }
    }
    let cell = env.directory().locate_card(card_ids[0]).unwrap();
    cell.create_collocation(&card_ids).unwrap();
    for card_id in &card_ids {
        cell.alter_card(
            *card_id,
            CardPatch {
                enable_replicated_table_tracker: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
    }
    env.settle(3).await;
    assert_eq!(sync_data_clusters(&card(env, "//a")), BTreeSet::from([A.to_string()]));

    env.tracker()
        .set_banned_clusters(BTreeSet::from([A.to_string()]));
    env.run_tracker_cycle().await;

    let a = sync_data_clusters(&card(env, "//a"));
    let b = sync_data_clusters(&card(env, "//b"));
    assert_eq!(a, b);
    assert!(!a.contains(A));
    assert_eq!(a, BTreeSet::from([B.to_string()]));
}
