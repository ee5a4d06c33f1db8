//! Choosing which replicas should be sync.
//!
//! Selection works on clusters: every card of a collocation group switches
//! the same set of clusters, and replicas of one card on one cluster switch
//! together. Only tracked replicas are switched; a replica is tracked when
//! the tracker is enabled for both its card and itself, it is enabled, and
//! its mode is not transitioning. Untracked replicas that receive writes
//! still count towards the sync replica limits.

use serde::Serialize;
use std::cmp::Reverse;
use std::collections::BTreeSet;

use chaos_meta::card::{ReplicaInfo, ReplicationCard};
use chaos_meta::types::{CardId, ReplicaContentType, ReplicaId, ReplicaMode, ReplicaState};

/// A mode switch the tracker wants to issue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ModeChange {
    /// Card of the replica.
    pub card_id: CardId,
    /// Replica to switch.
    pub replica_id: ReplicaId,
    /// Cluster of the replica.
    pub cluster_name: String,
    /// Data or queue.
    pub content_type: ReplicaContentType,
    /// Mode being left.
    pub from: ReplicaMode,
    /// Mode being entered.
    pub to: ReplicaMode,
}

/// Whether the tracker may switch `info`.
pub fn is_tracked(card: &ReplicationCard, info: &ReplicaInfo) -> bool {
    card.replicated_table_options.enable_replicated_table_tracker
        && info.enable_replicated_table_tracker
        && info.state == ReplicaState::Enabled
        && info.mode.is_stable()
}

fn tracked<'a>(
    card: &'a ReplicationCard,
    content_type: ReplicaContentType,
) -> impl Iterator<Item = (&'a ReplicaId, &'a ReplicaInfo)> + 'a {
    card.replicas
        .iter()
        .filter(move |(_, info)| info.content_type == content_type && is_tracked(card, info))
}

fn fixed_sync_clusters(card: &ReplicationCard, content_type: ReplicaContentType) -> usize {
    card.replicas
        .values()
        .filter(|info| info.content_type == content_type && !is_tracked(card, info))
        .filter(|info| info.state == ReplicaState::Enabled && info.mode.receives_writes())
        .map(|info| info.cluster_name.as_str())
        .collect::<BTreeSet<_>>()
        .len()
}

/// Clusters whose tracked replicas of `content_type` should be sync.
///
/// `eligible(card, cluster)` says whether a cluster may host sync replicas
/// of a card: healthy and not banned.
pub fn choose_sync_clusters<F>(
    group: &[ReplicationCard],
    content_type: ReplicaContentType,
    eligible: F,
) -> BTreeSet<String>
where
    F: Fn(&ReplicationCard, &str) -> bool,
{
    let per_card: Vec<BTreeSet<&str>> = group
        .iter()
        .map(|card| {
            tracked(card, content_type)
                .map(|(_, info)| info.cluster_name.as_str())
                .collect()
        })
        .collect();
    let Some(first) = per_card.first() else {
        return BTreeSet::new();
    };
    let common: Vec<&str> = first
        .iter()
        .copied()
        .filter(|cluster| per_card.iter().all(|clusters| clusters.contains(cluster)))
        .collect();

    let sync_in = |cluster: &str| {
        group
            .iter()
            .filter(|card| {
                tracked(card, content_type)
                    .any(|(_, info)| info.cluster_name == cluster && info.mode == ReplicaMode::Sync)
            })
            .count()
    };
    let fixed = group
        .iter()
        .map(|card| fixed_sync_clusters(card, content_type))
        .min()
        .unwrap_or(0);

    let (mut healthy, mut unhealthy): (Vec<&str>, Vec<&str>) = common
        .into_iter()
        .partition(|cluster| group.iter().all(|card| eligible(card, *cluster)));
    healthy.sort_by_key(|cluster| (Reverse(sync_in(*cluster)), *cluster));
    unhealthy.retain(|cluster| sync_in(*cluster) > 0);
    unhealthy.sort_by_key(|cluster| (Reverse(sync_in(*cluster)), *cluster));

    let mut chosen: Vec<&str> = Vec::new();
    match content_type {
        ReplicaContentType::Data => {
            let max = group
                .iter()
                .map(|card| card.replicated_table_options.max_sync_replicas())
                .min()
                .unwrap_or(1);
            let min = group
                .iter()
                .map(|card| card.replicated_table_options.min_sync_replicas())
                .max()
                .unwrap_or(0)
                .min(max);
            chosen.extend(healthy.into_iter().take(max.saturating_sub(fixed)));
            for cluster in unhealthy {
                if chosen.len() + fixed >= min {
                    break;
                }
                chosen.push(cluster);
            }
        }
        ReplicaContentType::Queue => {
            chosen.extend(healthy);
            if chosen.is_empty() && fixed == 0 {
                chosen.extend(unhealthy.into_iter().take(1));
            }
        }
    }
    chosen.into_iter().map(str::to_string).collect()
}

/// Mode switches that bring a collocation group (or a single card) to the
/// chosen sync clusters. Promotions come first so that a card never passes
/// through an era without a sync queue.
pub fn plan_mode_changes<F>(group: &[ReplicationCard], eligible: F) -> Vec<ModeChange>
where
    F: Fn(&ReplicationCard, &str) -> bool,
{
    let mut changes = Vec::new();
    for content_type in [ReplicaContentType::Data, ReplicaContentType::Queue] {
        let chosen = choose_sync_clusters(group, content_type, &eligible);
        for card in group {
            for (replica_id, info) in tracked(card, content_type) {
                let to = if chosen.contains(&info.cluster_name) {
                    ReplicaMode::Sync
                } else {
                    ReplicaMode::Async
                };
                if to != info.mode {
                    changes.push(ModeChange {
                        card_id: card.id,
                        replica_id: *replica_id,
                        cluster_name: info.cluster_name.clone(),
                        content_type,
                        from: info.mode,
                        to,
                    });
                }
            }
        }
    }
    changes.sort_by_key(|change| change.to != ReplicaMode::Sync);
    changes
}
