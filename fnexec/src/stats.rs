//! Counters and point-in-time snapshots of engine and pool state.

use crate::types::{FunctionId, Outcome, StartKind};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

/// Sandbox counts of one function partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FunctionPoolStats {
    pub generation: u64,
    pub warm: usize,
    pub frozen: usize,
    pub busy: usize,
    pub creating: usize,
    pub waiting: usize,
    pub ceiling: usize,
}

impl FunctionPoolStats {
    /// Everything counted against the ceiling.
    pub fn total(&self) -> usize {
        self.warm + self.frozen + self.busy + self.creating
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub functions: BTreeMap<FunctionId, FunctionPoolStats>,
}

impl PoolStats {
    pub fn total_sandboxes(&self) -> usize {
        self.functions.values().map(FunctionPoolStats::total).sum()
    }

    pub fn function(&self, id: &str) -> Option<&FunctionPoolStats> {
        self.functions.get(id)
    }
}

/// Lifetime invocation counters, updated lock-free.
#[derive(Debug, Default)]
pub(crate) struct InvocationCounters {
    invocations: AtomicU64,
    success: AtomicU64,
    user_fault: AtomicU64,
    system_fault: AtomicU64,
    timed_out: AtomicU64,
    cold_starts: AtomicU64,
    warm_starts: AtomicU64,
}

impl InvocationCounters {
    pub fn record(&self, outcome: &Outcome, start: Option<StartKind>) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            Outcome::Success { .. } => &self.success,
            Outcome::UserFault { .. } => &self.user_fault,
            Outcome::SystemFault { .. } => &self.system_fault,
            Outcome::TimedOut { .. } => &self.timed_out,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        match start {
            Some(StartKind::Cold) => {
                self.cold_starts.fetch_add(1, Ordering::Relaxed);
            }
            Some(StartKind::Warm) => {
                self.warm_starts.fetch_add(1, Ordering::Relaxed);
            }
            None => {}
        }
    }

    pub fn snapshot(&self, in_flight: usize, pool: PoolStats) -> EngineStats {
        EngineStats {
            invocations: self.invocations.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            user_fault: self.user_fault.load(Ordering::Relaxed),
            system_fault: self.system_fault.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cold_starts: self.cold_starts.load(Ordering::Relaxed),
            warm_starts: self.warm_starts.load(Ordering::Relaxed),
            in_flight,
            pool,
        }
    }
}

/// Engine-wide statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub invocations: u64,
    pub success: u64,
    pub user_fault: u64,
    pub system_fault: u64,
    pub timed_out: u64,
    pub cold_starts: u64,
    pub warm_starts: u64,
    pub in_flight: usize,
    pub pool: PoolStats,
}
