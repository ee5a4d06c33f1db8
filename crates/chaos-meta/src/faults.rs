//! Fault injection around RPCs and commit paths.
//!
//! Every RPC-like call (pulls, direct-write prepares, inter-cell messages)
//! and every chaos cell commit asks an injected [`FaultInjector`] whether it
//! should fail. Production wiring uses [`NoFaults`]; tests use
//! [`FaultController`] to fail specific points or to fail randomly.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::fmt;

use crate::error::{ChaosError, ChaosResult};
use crate::types::CellId;

/// A place where a fault may be injected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// `PullRows` served by a tablet node of `cluster`.
    PullRows {
        /// Cluster serving the pull.
        cluster: String,
    },
    /// Direct-write prepare on a tablet node of `cluster`.
    Prepare {
        /// Cluster of the participant.
        cluster: String,
    },
    /// Mutation commit in a chaos cell.
    CellCommit {
        /// Committing cell.
        cell_id: CellId,
    },
    /// Delivery of an inter-cell message.
    CellMessage {
        /// Destination cell.
        to: CellId,
    },
}

impl fmt::Display for FaultPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultPoint::PullRows { cluster } => write!(f, "pull_rows@{}", cluster),
            FaultPoint::Prepare { cluster } => write!(f, "prepare@{}", cluster),
            FaultPoint::CellCommit { cell_id } => write!(f, "commit@{}", cell_id),
            FaultPoint::CellMessage { to } => write!(f, "message@{}", to),
        }
    }
}

/// Decides whether an operation at a fault point fails.
pub trait FaultInjector: Send + Sync + fmt::Debug {
    /// Returns an error if the operation at `point` must fail.
    fn check(&self, point: &FaultPoint) -> ChaosResult<()>;
}

/// Injector that never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaults;

impl FaultInjector for NoFaults {
    fn check(&self, _point: &FaultPoint) -> ChaosResult<()> {
        Ok(())
    }
}

/// Which points a fault applies to.
#[derive(Debug, Clone, PartialEq)]
pub enum FaultTarget {
    /// Exactly this point.
    Point(FaultPoint),
    /// Every pull served by this cluster.
    PullsFrom(String),
    /// Every point touching this cluster.
    Cluster(String),
    /// Every point.
    Any,
}

impl FaultTarget {
    fn matches(&self, point: &FaultPoint) -> bool {
        match (self, point) {
            (FaultTarget::Any, _) => true,
            (FaultTarget::Point(p), point) => p == point,
            (FaultTarget::PullsFrom(c), FaultPoint::PullRows { cluster }) => c == cluster,
            (FaultTarget::Cluster(c), FaultPoint::PullRows { cluster })
            | (FaultTarget::Cluster(c), FaultPoint::Prepare { cluster }) => c == cluster,
            _ => false,
        }
    }
}

/// How often a matching operation fails.
#[derive(Debug, Clone, PartialEq)]
pub enum FaultMode {
    /// Every time.
    Always,
    /// The next `n` times, then the fault expires.
    Times(u32),
    /// With the given probability.
    Random {
        /// Failure probability in `[0, 1]`.
        rate: f64,
    },
}

/// Opaque handle to remove a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FaultHandle(u64);

#[derive(Debug)]
struct FaultRule {
    target: FaultTarget,
    mode: FaultMode,
}

#[derive(Debug)]
struct ControllerState {
    rules: HashMap<FaultHandle, FaultRule>,
    next_handle: u64,
    rng: StdRng,
    injected: u64,
}

/// Scriptable injector used by tests and the demo.
#[derive(Debug)]
pub struct FaultController {
    state: Mutex<ControllerState>,
}

impl FaultController {
    /// Creates a controller with no active faults.
    pub fn new() -> Self {
        Self::with_seed(0x5eed)
    }

    /// Creates a controller whose random faults follow `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: Mutex::new(ControllerState {
                rules: HashMap::new(),
                next_handle: 0,
                rng: StdRng::seed_from_u64(seed),
                injected: 0,
            }),
        }
    }

    /// Injects a fault and returns a handle to remove it.
    pub fn inject(&self, target: FaultTarget, mode: FaultMode) -> FaultHandle {
        let mut state = self.state.lock();
        let handle = FaultHandle(state.next_handle);
        state.next_handle += 1;
        tracing::debug!(?target, ?mode, "fault injected");
        state.rules.insert(handle, FaultRule { target, mode });
        handle
    }

    /// Removes a fault.
    pub fn clear(&self, handle: FaultHandle) {
        self.state.lock().rules.remove(&handle);
    }

    /// Removes every fault.
    pub fn clear_all(&self) {
        self.state.lock().rules.clear();
    }

    /// Number of active faults.
    pub fn active_faults(&self) -> usize {
        self.state.lock().rules.len()
    }

    /// Number of failures injected so far.
    pub fn injected_count(&self) -> u64 {
        self.state.lock().injected
    }
}

impl Default for FaultController {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultInjector for FaultController {
    fn check(&self, point: &FaultPoint) -> ChaosResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut fail = false;
        let mut expired = Vec::new();
        for (handle, rule) in state.rules.iter_mut() {
            if !rule.target.matches(point) {
                continue;
            }
            match &mut rule.mode {
                FaultMode::Always => fail = true,
                FaultMode::Times(n) => {
                    if *n > 0 {
                        *n -= 1;
                        fail = true;
                    }
                    if *n == 0 {
                        expired.push(*handle);
                    }
                }
                FaultMode::Random { rate } => {
                    if state.rng.gen_bool(rate.clamp(0.0, 1.0)) {
                        fail = true;
                    }
                }
            }
            if fail {
                break;
            }
        }
        for handle in expired {
            state.rules.remove(&handle);
        }
        if fail {
            state.injected += 1;
            tracing::debug!(%point, "injecting fault");
            return Err(ChaosError::InjectedFault {
                point: point.to_string(),
            });
        }
        Ok(())
    }
}
