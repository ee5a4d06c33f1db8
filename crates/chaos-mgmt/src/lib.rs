#![warn(missing_docs)]

//! Chaos replication operations: in-process environment bootstrap and the chaosctl CLI

pub mod cli;
pub mod environment;
pub mod summary;

pub use environment::{Environment, EnvironmentSpec};
pub use summary::{CardSummary, ReplicaSummary};
