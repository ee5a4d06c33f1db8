#![warn(missing_docs)]

//! Replicated table tracker: switches chaos replica modes following cluster health

pub mod health;
pub mod selection;
pub mod tracker;

pub use health::{BundleHealthCache, ClusterStateProvider, ManualClusterState};
pub use selection::{choose_sync_clusters, is_tracked, plan_mode_changes, ModeChange};
pub use tracker::{ReplicatedTableTracker, TrackerTickReport};
