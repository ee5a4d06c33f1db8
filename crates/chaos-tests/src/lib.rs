//! Chaos replication test infrastructure
//!
//! In-process multi-cluster environments and helpers shared by the
//! end-to-end scenarios and property tests under `tests/`.

pub mod harness;

pub use harness::{environment, fast_spec, init_tracing, key, lookup, random_rows, row, select_all, wait_for, WAIT};
