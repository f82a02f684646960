//! # Sandbox Pool
//!
//! Owns every sandbox the engine creates, partitioned per function. Each partition keeps its
//! entries behind its own [`StateMachine`] lock, and the partition map sits behind a
//! read-mostly `RwLock`, so functions never contend with each other.
//!
//! ## Capacity
//!
//! A partition hands out at most `max_sandboxes_per_function` leases at a time through an
//! earliest-deadline-first [`AdmissionQueue`]. A lease covers a busy sandbox or one still being
//! created. Holders of a slot always take an idle sandbox when one exists and only cold-start
//! otherwise, so warm + frozen + busy + creating never exceeds the ceiling. The queue of an
//! undeployed function is kept while its leases are outstanding, and a redeploy of the same id
//! takes it over, so the ceiling holds across undeploy and redeploy.
//!
//! ## Generations
//!
//! Every deploy that changes a function's spec moves the function to a new generation. Idle
//! sandboxes of the old generation are destroyed before `deploy` returns; busy ones are
//! destroyed when released and never reused.
//!
//! ## Eviction
//!
//! * At release, the least recently used idle sandboxes are destroyed while the function holds
//!   more than `max_warm_per_function` of them.
//! * [`SandboxPool::sweep_once`] destroys idle sandboxes older than `idle_ttl` and freezes those
//!   older than `freeze_after` when the driver supports it. Busy sandboxes are never touched.

use crate::admission::{AdmissionError, AdmissionPermit, AdmissionQueue};
use crate::config::PoolConfig;
use crate::driver::{DriverError, SandboxDriver, SandboxHandle};
use crate::events::{self, EventSink, ExecutionEvent};
use crate::stats::{FunctionPoolStats, PoolStats};
use crate::types::{Disposition, FunctionId, FunctionSpec, SandboxId, SpecError, StartKind};
use fnexec_common::StateMachine;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};
use tokio::{sync::oneshot, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors surfaced by pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("function '{0}' is not deployed")]
    NotFound(FunctionId),

    #[error("deadline passed while waiting for a sandbox")]
    TimedOut,

    #[error("sandbox capacity for function '{0}' is exhausted")]
    Exhausted(FunctionId),

    #[error("sandbox pool is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    InvalidSpec(#[from] SpecError),
}

impl PoolError {
    /// Check if this error represents a potentially recoverable condition
    pub fn is_recoverable(&self) -> bool {
        match self {
            PoolError::Exhausted(_) | PoolError::TimedOut => true,
            PoolError::Driver(e) => e.is_recoverable(),
            PoolError::NotFound(_) | PoolError::ShuttingDown | PoolError::InvalidSpec(_) => false,
        }
    }

    /// Get error category for programmatic handling
    pub fn error_category(&self) -> &'static str {
        match self {
            PoolError::NotFound(_) => "NOT_FOUND",
            PoolError::TimedOut => "TIMEOUT",
            PoolError::Exhausted(_) => "RESOURCE",
            PoolError::ShuttingDown => "SHUTDOWN",
            PoolError::Driver(e) => e.error_category(),
            PoolError::InvalidSpec(_) => "CONFIG",
        }
    }
}

/// Why a sandbox was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    /// Released with [`Disposition::Destroy`].
    Discarded,
    /// Belongs to a superseded deployment.
    Stale,
    /// Least recently used beyond the warm budget.
    Evicted,
    IdleTimeout,
    Undeployed,
    Shutdown,
    /// Lease dropped while the sandbox was in use.
    Abandoned,
    FreezeFailed,
    ResumeFailed,
}

impl DestroyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestroyReason::Discarded => "discarded",
            DestroyReason::Stale => "stale_generation",
            DestroyReason::Evicted => "evicted_lru",
            DestroyReason::IdleTimeout => "idle_ttl",
            DestroyReason::Undeployed => "undeployed",
            DestroyReason::Shutdown => "shutdown",
            DestroyReason::Abandoned => "abandoned",
            DestroyReason::FreezeFailed => "freeze_failed",
            DestroyReason::ResumeFailed => "resume_failed",
        }
    }
}

impl fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one sweep pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub destroyed: usize,
    pub frozen: usize,
}

/// A pooled sandbox and its bookkeeping.
#[derive(Debug)]
pub(crate) struct PoolEntry {
    handle: Arc<SandboxHandle>,
    generation: u64,
    last_used: Instant,
    /// 1 while leased (or being frozen), 0 while idle.
    ref_count: u8,
    frozen: bool,
}

impl PoolEntry {
    fn is_idle(&self) -> bool {
        self.ref_count == 0
    }
}

type Victim = (Arc<SandboxHandle>, DestroyReason);

struct PartitionState {
    spec: Arc<FunctionSpec>,
    generation: u64,
    removed: bool,
    entries: HashMap<SandboxId, PoolEntry>,
    creating: usize,
}

impl PartitionState {
    /// Lease the most recently used idle entry of the current generation.
    fn take_idle(&mut self) -> Option<(Arc<SandboxHandle>, bool)> {
        let generation = self.generation;
        let entry = self
            .entries
            .values_mut()
            .filter(|e| e.is_idle() && e.generation == generation)
            .max_by_key(|e| e.last_used)?;
        entry.ref_count = 1;
        Some((entry.handle.clone(), entry.frozen))
    }

    /// Remove idle entries, least recently used first, until at most `budget` remain.
    fn evict_lru(&mut self, budget: usize) -> Vec<Victim> {
        let mut idle: Vec<(Instant, SandboxId)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_idle())
            .map(|(id, e)| (e.last_used, id.clone()))
            .collect();
        if idle.len() <= budget {
            return Vec::new();
        }
        idle.sort_by_key(|(last_used, _)| *last_used);
        let excess = idle.len() - budget;
        idle.into_iter()
            .take(excess)
            .filter_map(|(_, id)| self.entries.remove(&id))
            .map(|e| (e.handle, DestroyReason::Evicted))
            .collect()
    }

    fn drain_idle(&mut self, reason: DestroyReason) -> Vec<Victim> {
        let ids: Vec<SandboxId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_idle())
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.entries.remove(id))
            .map(|e| (e.handle, reason))
            .collect()
    }

    fn stats(&self) -> FunctionPoolStats {
        let mut stats = FunctionPoolStats {
            generation: self.generation,
            creating: self.creating,
            ..Default::default()
        };
        for entry in self.entries.values() {
            match (entry.is_idle(), entry.frozen) {
                (false, _) => stats.busy += 1,
                (true, true) => stats.frozen += 1,
                (true, false) => stats.warm += 1,
            }
        }
        stats
    }
}

struct FunctionPool {
    id: FunctionId,
    slots: AdmissionQueue,
    state: StateMachine<PartitionState>,
}

struct PoolInner {
    driver: Arc<dyn SandboxDriver>,
    config: PoolConfig,
    events: Arc<dyn EventSink>,
    partitions: RwLock<HashMap<FunctionId, Arc<FunctionPool>>>,
    /// Closed queues of undeployed functions whose leases have not all come back.
    retired: Mutex<HashMap<FunctionId, AdmissionQueue>>,
    generations: AtomicU64,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl PoolInner {
    fn retired(&self) -> std::sync::MutexGuard<'_, HashMap<FunctionId, AdmissionQueue>> {
        self.retired.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The slot queue for a newly deployed `id`: the retired one while it still has holders.
    fn slots_for(&self, id: &FunctionId) -> AdmissionQueue {
        match self.retired().remove(id) {
            Some(slots) if slots.in_use() > 0 => {
                debug!(
                    "function {} redeployed with {} leases still out",
                    id,
                    slots.in_use()
                );
                slots.reopen();
                slots
            }
            _ => AdmissionQueue::new(
                self.config.max_sandboxes_per_function,
                self.config.max_waiters_per_function,
            ),
        }
    }

    fn partitions(&self) -> Vec<Arc<FunctionPool>> {
        self.partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn partition(&self, id: &FunctionId) -> Result<Arc<FunctionPool>, PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::ShuttingDown);
        }
        self.partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| PoolError::NotFound(id.clone()))
    }

    fn admission_error(&self, partition: &FunctionPool, error: AdmissionError) -> PoolError {
        match error {
            AdmissionError::TimedOut => PoolError::TimedOut,
            AdmissionError::QueueFull => PoolError::Exhausted(partition.id.clone()),
            AdmissionError::Closed if self.closed.load(Ordering::Acquire) => {
                PoolError::ShuttingDown
            }
            AdmissionError::Closed => PoolError::NotFound(partition.id.clone()),
        }
    }

    /// Put a leased sandbox back, or take it out of the pool. Returns what must be destroyed.
    fn return_entry(
        &self,
        partition: &FunctionPool,
        handle: &Arc<SandboxHandle>,
        generation: u64,
        disposition: Disposition,
    ) -> Vec<Victim> {
        let closed = self.closed.load(Ordering::Acquire);
        partition.state.transition(|s| {
            let reason = if disposition == Disposition::Destroy {
                Some(DestroyReason::Discarded)
            } else if closed {
                Some(DestroyReason::Shutdown)
            } else if s.removed {
                Some(DestroyReason::Undeployed)
            } else if generation != s.generation {
                Some(DestroyReason::Stale)
            } else {
                None
            };

            if let Some(reason) = reason {
                s.entries.remove(handle.id());
                return vec![(handle.clone(), reason)];
            }

            match s.entries.get_mut(handle.id()) {
                Some(entry) => {
                    entry.ref_count = 0;
                    entry.last_used = Instant::now();
                    entry.frozen = false;
                    let _ = handle.lifecycle().mark_warm();
                    s.evict_lru(self.config.max_warm_per_function)
                }
                None => vec![(handle.clone(), DestroyReason::Discarded)],
            }
        })
    }

    async fn destroy(&self, handle: &SandboxHandle, reason: DestroyReason) {
        if !handle.lifecycle().mark_destroyed(reason.as_str()) {
            return;
        }
        debug!("destroying sandbox {} ({})", handle.id(), reason);
        if let Err(e) = self.driver.destroy(handle).await {
            warn!("failed to destroy sandbox {}: {}", handle.id(), e);
        }
        events::emit(
            self.events.as_ref(),
            ExecutionEvent::SandboxDestroyed {
                function_id: handle.function_id().to_string(),
                sandbox_id: handle.id().to_string(),
                reason: reason.to_string(),
            },
        )
        .await;
    }

    async fn destroy_all(&self, victims: Vec<Victim>) {
        for (handle, reason) in victims {
            self.destroy(&handle, reason).await;
        }
    }
}

/// A sandbox borrowed from the pool for one invocation.
///
/// Hand it back with [`SandboxPool::release`]. A lease dropped without release destroys its
/// sandbox if the sandbox was put to use, and returns it to the pool otherwise.
pub struct SandboxLease {
    handle: Arc<SandboxHandle>,
    spec: Arc<FunctionSpec>,
    generation: u64,
    start: StartKind,
    partition: Arc<FunctionPool>,
    pool: Arc<PoolInner>,
    permit: Option<AdmissionPermit>,
    dirty: bool,
    returned: bool,
}

impl fmt::Debug for SandboxLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxLease")
            .field("sandbox", self.handle.id())
            .field("function", &self.spec.id)
            .field("generation", &self.generation)
            .field("start", &self.start)
            .finish()
    }
}

impl SandboxLease {
    fn new(
        handle: Arc<SandboxHandle>,
        spec: Arc<FunctionSpec>,
        generation: u64,
        start: StartKind,
        partition: Arc<FunctionPool>,
        pool: Arc<PoolInner>,
        permit: AdmissionPermit,
    ) -> Self {
        Self {
            handle,
            spec,
            generation,
            start,
            partition,
            pool,
            permit: Some(permit),
            dirty: false,
            returned: false,
        }
    }

    pub fn handle(&self) -> &SandboxHandle {
        &self.handle
    }

    /// The spec the sandbox was created from; stays valid across redeploys.
    pub fn spec(&self) -> &Arc<FunctionSpec> {
        &self.spec
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn start(&self) -> StartKind {
        self.start
    }

    fn is_current(&self) -> bool {
        !self.pool.closed.load(Ordering::Acquire)
            && self
                .partition
                .state
                .read(|s| !s.removed && s.generation == self.generation)
    }

    fn finish(&mut self, disposition: Disposition) -> Vec<Victim> {
        self.returned = true;
        let victims =
            self.pool
                .return_entry(&self.partition, &self.handle, self.generation, disposition);
        self.permit.take();
        victims
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        let disposition = if self.dirty {
            Disposition::Destroy
        } else {
            Disposition::Reuse
        };
        let victims: Vec<Victim> = self
            .finish(disposition)
            .into_iter()
            .map(|(handle, reason)| {
                let reason = if reason == DestroyReason::Discarded {
                    DestroyReason::Abandoned
                } else {
                    reason
                };
                (handle, reason)
            })
            .collect();
        if victims.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let pool = self.pool.clone();
                runtime.spawn(async move { pool.destroy_all(victims).await });
            }
            Err(_) => {
                for (handle, reason) in victims {
                    warn!(
                        "no runtime to destroy sandbox {} ({}); backend resources may leak",
                        handle.id(),
                        reason
                    );
                    handle.lifecycle().mark_destroyed(reason.as_str());
                }
            }
        }
    }
}

enum Placement {
    Warm {
        handle: Arc<SandboxHandle>,
        frozen: bool,
        spec: Arc<FunctionSpec>,
        generation: u64,
    },
    Cold {
        spec: Arc<FunctionSpec>,
        generation: u64,
    },
}

type ColdStartResult = Result<SandboxLease, DriverError>;

/// Per-function pools of sandboxes over one driver.
#[derive(Clone)]
pub struct SandboxPool {
    inner: Arc<PoolInner>,
}

impl SandboxPool {
    pub fn new(
        driver: Arc<dyn SandboxDriver>,
        config: PoolConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                driver,
                config,
                events,
                partitions: RwLock::new(HashMap::new()),
                retired: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn driver(&self) -> &Arc<dyn SandboxDriver> {
        &self.inner.driver
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Register `spec` or replace the deployed version. Returns the function's generation,
    /// which is unchanged when `spec` equals the deployed spec.
    pub async fn deploy(&self, spec: FunctionSpec) -> Result<u64, PoolError> {
        spec.validate()?;
        if self.is_shutting_down() {
            return Err(PoolError::ShuttingDown);
        }

        let id = spec.id.clone();
        let (generation, victims) = {
            let mut partitions = self
                .inner
                .partitions
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            match partitions.get(&id) {
                Some(partition) => partition.state.transition(|s| {
                    if *s.spec == spec {
                        (s.generation, Vec::new())
                    } else {
                        s.generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
                        s.spec = Arc::new(spec);
                        (s.generation, s.drain_idle(DestroyReason::Stale))
                    }
                }),
                None => {
                    let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
                    let partition = FunctionPool {
                        id: id.clone(),
                        slots: self.inner.slots_for(&id),
                        state: StateMachine::new(PartitionState {
                            spec: Arc::new(spec),
                            generation,
                            removed: false,
                            entries: HashMap::new(),
                            creating: 0,
                        }),
                    };
                    partitions.insert(id.clone(), Arc::new(partition));
                    (generation, Vec::new())
                }
            }
        };

        info!(
            "deployed function {} at generation {} ({} stale sandboxes)",
            id,
            generation,
            victims.len()
        );
        self.inner.destroy_all(victims).await;
        Ok(generation)
    }

    /// Remove a function. Queued acquirers fail with `NotFound`; idle sandboxes are destroyed
    /// now and busy ones when released.
    pub async fn undeploy(&self, id: &FunctionId) -> Result<(), PoolError> {
        let partition = self
            .inner
            .partitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .ok_or_else(|| PoolError::NotFound(id.clone()))?;

        let victims = partition.state.transition(|s| {
            s.removed = true;
            s.drain_idle(DestroyReason::Undeployed)
        });
        partition.slots.close();
        {
            let mut retired = self.inner.retired();
            retired.retain(|_, slots| slots.in_use() > 0);
            if partition.slots.in_use() > 0 {
                retired.insert(id.clone(), partition.slots.clone());
            }
        }
        info!("undeployed function {}", id);
        self.inner.destroy_all(victims).await;
        Ok(())
    }

    /// Currently deployed spec of a function.
    pub fn spec(&self, id: &FunctionId) -> Option<Arc<FunctionSpec>> {
        self.inner
            .partition(id)
            .ok()
            .map(|p| p.state.read(|s| s.spec.clone()))
    }

    pub fn specs(&self) -> Vec<Arc<FunctionSpec>> {
        let mut specs: Vec<_> = self
            .inner
            .partitions()
            .iter()
            .map(|p| p.state.read(|s| s.spec.clone()))
            .collect();
        specs.sort_by(|a, b| a.id.cmp(&b.id));
        specs
    }

    /// Lease a sandbox for `id`, waiting no later than `deadline`.
    ///
    /// Prefers an idle sandbox (resuming it if frozen), otherwise cold-starts one within the
    /// ceiling, otherwise queues earliest-deadline-first. A cold start still running when the
    /// deadline passes completes in the background and joins the idle set.
    pub async fn acquire(
        &self,
        id: &FunctionId,
        deadline: Instant,
    ) -> Result<SandboxLease, PoolError> {
        loop {
            let partition = self.inner.partition(id)?;
            let permit = partition
                .slots
                .acquire(deadline)
                .await
                .map_err(|e| self.inner.admission_error(&partition, e))?;

            let placement = partition.state.transition(|s| {
                if s.removed {
                    return Err(PoolError::NotFound(id.clone()));
                }
                Ok(match s.take_idle() {
                    Some((handle, frozen)) => Placement::Warm {
                        handle,
                        frozen,
                        spec: s.spec.clone(),
                        generation: s.generation,
                    },
                    None => {
                        s.creating += 1;
                        Placement::Cold {
                            spec: s.spec.clone(),
                            generation: s.generation,
                        }
                    }
                })
            })?;

            let lease = match placement {
                Placement::Warm {
                    handle,
                    frozen,
                    spec,
                    generation,
                } => {
                    let mut lease = SandboxLease::new(
                        handle,
                        spec,
                        generation,
                        StartKind::Warm,
                        partition,
                        self.inner.clone(),
                        permit,
                    );
                    if frozen && !self.resume(&mut lease, deadline).await? {
                        continue;
                    }
                    lease
                }
                Placement::Cold { spec, generation } => {
                    let ready = self.spawn_cold_start(partition, spec, generation, permit);
                    let lease = match tokio::time::timeout_at(deadline, ready).await {
                        Err(_) => {
                            debug!("cold start for {} outlived its caller's deadline", id);
                            return Err(PoolError::TimedOut);
                        }
                        Ok(Err(_)) => {
                            return Err(PoolError::Driver(DriverError::Crashed(
                                "cold start task aborted".into(),
                            )));
                        }
                        Ok(Ok(result)) => result?,
                    };
                    if !lease.is_current() {
                        debug!("cold start for {} finished stale, retrying", id);
                        self.release(lease, Disposition::Reuse).await;
                        continue;
                    }
                    lease
                }
            };

            return Ok(self.hand_out(lease));
        }
    }

    fn hand_out(&self, mut lease: SandboxLease) -> SandboxLease {
        if let Err(e) = lease.handle.lifecycle().mark_busy() {
            warn!("sandbox {} leased out of order: {}", lease.handle.id(), e);
        }
        lease.dirty = true;
        lease
    }

    /// Resume a frozen sandbox. `Ok(false)` means the sandbox was discarded and the caller
    /// should try again.
    async fn resume(&self, lease: &mut SandboxLease, deadline: Instant) -> Result<bool, PoolError> {
        // An interrupted resume leaves the backend in an unknown state.
        lease.dirty = true;
        match tokio::time::timeout_at(deadline, self.inner.driver.resume(&lease.handle)).await {
            Ok(Ok(())) => {
                let _ = lease.handle.lifecycle().mark_warm();
                Ok(true)
            }
            Ok(Err(e)) => {
                warn!("failed to resume sandbox {}: {}", lease.handle.id(), e);
                let victims = lease
                    .finish(Disposition::Destroy)
                    .into_iter()
                    .map(|(h, _)| (h, DestroyReason::ResumeFailed))
                    .collect();
                self.inner.destroy_all(victims).await;
                Ok(false)
            }
            Err(_) => Err(PoolError::TimedOut),
        }
    }

    fn spawn_cold_start(
        &self,
        partition: Arc<FunctionPool>,
        spec: Arc<FunctionSpec>,
        generation: u64,
        permit: AdmissionPermit,
    ) -> oneshot::Receiver<ColdStartResult> {
        let (tx, rx) = oneshot::channel();
        let inner = self.inner.clone();
        let pool = self.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            let created = inner.driver.create(&spec).await;

            let handle = match created {
                Ok(handle) => Arc::new(handle),
                Err(e) => {
                    warn!("cold start for {} failed: {}", spec.id, e);
                    partition.state.transition(|s| s.creating -= 1);
                    drop(permit);
                    let _ = tx.send(Err(e));
                    return;
                }
            };

            let _ = handle.lifecycle().mark_warm();
            partition.state.transition(|s| {
                s.creating -= 1;
                s.entries.insert(
                    handle.id().clone(),
                    PoolEntry {
                        handle: handle.clone(),
                        generation,
                        last_used: Instant::now(),
                        ref_count: 1,
                        frozen: false,
                    },
                );
            });
            events::emit(
                inner.events.as_ref(),
                ExecutionEvent::SandboxCreated {
                    function_id: spec.id.to_string(),
                    sandbox_id: handle.id().to_string(),
                    generation,
                    backend: inner.driver.name().to_string(),
                    duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                },
            )
            .await;

            let lease = SandboxLease::new(
                handle,
                spec,
                generation,
                StartKind::Cold,
                partition,
                inner,
                permit,
            );
            if let Err(Ok(orphan)) = tx.send(Ok(lease)) {
                debug!("adopting sandbox {} as warm", orphan.handle.id());
                pool.release(orphan, Disposition::Reuse).await;
            }
        });

        rx
    }

    /// Return a lease. `Reuse` puts the sandbox back as warm unless its generation is stale;
    /// `Destroy` tears it down.
    pub async fn release(&self, mut lease: SandboxLease, disposition: Disposition) {
        let victims = lease.finish(disposition);
        self.inner.destroy_all(victims).await;
    }

    /// One eviction pass over every function.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let ttl = self.inner.config.idle_ttl;
        let freeze_after = self
            .inner
            .config
            .freeze_after
            .filter(|_| self.inner.driver.supports_freeze());

        for partition in self.inner.partitions() {
            let now = Instant::now();
            let (expired, to_freeze) = partition.state.transition(|s| {
                let expired_ids: Vec<SandboxId> = s
                    .entries
                    .iter()
                    .filter(|(_, e)| e.is_idle() && now.duration_since(e.last_used) >= ttl)
                    .map(|(id, _)| id.clone())
                    .collect();
                let expired: Vec<Victim> = expired_ids
                    .iter()
                    .filter_map(|id| s.entries.remove(id))
                    .map(|e| (e.handle, DestroyReason::IdleTimeout))
                    .collect();

                let mut to_freeze = Vec::new();
                if let Some(after) = freeze_after {
                    for entry in s.entries.values_mut() {
                        if !entry.is_idle()
                            || entry.frozen
                            || now.duration_since(entry.last_used) < after
                        {
                            continue;
                        }
                        // The entry counts as leased while it is being frozen.
                        let Some(permit) = partition.slots.try_acquire() else {
                            break;
                        };
                        entry.ref_count = 1;
                        to_freeze.push((entry.handle.clone(), entry.generation, permit));
                    }
                }
                (expired, to_freeze)
            });

            report.destroyed += expired.len();
            self.inner.destroy_all(expired).await;

            for (handle, generation, permit) in to_freeze {
                let frozen = self.inner.driver.freeze(&handle).await;
                let victims = partition.state.transition(|s| {
                    let stale = s.removed
                        || s.generation != generation
                        || self.inner.closed.load(Ordering::Acquire);
                    match (&frozen, stale) {
                        (Ok(()), false) => {
                            if let Some(entry) = s.entries.get_mut(handle.id()) {
                                entry.ref_count = 0;
                                entry.frozen = true;
                            }
                            let _ = handle.lifecycle().mark_frozen();
                            Vec::new()
                        }
                        (Ok(()), true) => {
                            s.entries.remove(handle.id());
                            vec![(handle.clone(), DestroyReason::Stale)]
                        }
                        (Err(_), _) => {
                            s.entries.remove(handle.id());
                            vec![(handle.clone(), DestroyReason::FreezeFailed)]
                        }
                    }
                });
                drop(permit);
                if let Err(e) = &frozen {
                    warn!("failed to freeze sandbox {}: {}", handle.id(), e);
                } else if victims.is_empty() {
                    report.frozen += 1;
                }
                report.destroyed += victims.len();
                self.inner.destroy_all(victims).await;
            }
        }

        if report != SweepReport::default() {
            debug!(
                "sweep destroyed {} and froze {} sandboxes",
                report.destroyed, report.frozen
            );
        }
        report
    }

    /// Run [`Self::sweep_once`] every `sweep_interval` until shutdown.
    pub fn start_background_sweep(&self) -> JoinHandle<()> {
        let pool = self.clone();
        let token = self.inner.shutdown.clone();
        let period = self.inner.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("sandbox sweep stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        pool.sweep_once().await;
                    }
                }
            }
        })
    }

    pub fn stats(&self) -> PoolStats {
        let functions = self
            .inner
            .partitions()
            .into_iter()
            .map(|p| {
                let mut stats = p.state.read(PartitionState::stats);
                stats.waiting = p.slots.waiting();
                stats.ceiling = p.slots.capacity();
                (p.id.clone(), stats)
            })
            .collect();
        PoolStats { functions }
    }

    /// Stop the pool: queued and future acquirers fail with `ShuttingDown`, idle sandboxes are
    /// destroyed now, leased ones when released.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();
        for partition in self.inner.partitions() {
            partition.slots.close();
            let victims = partition
                .state
                .transition(|s| s.drain_idle(DestroyReason::Shutdown));
            self.inner.destroy_all(victims).await;
        }
        info!("sandbox pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::channel_sink;
    use crate::test_utils::{ScriptedDriver, spec};
    use crate::utils::logging::init_test_logging;
    use fnexec_common::SandboxState;
    use std::time::Duration;

    fn config() -> PoolConfig {
        PoolConfig {
            max_sandboxes_per_function: 2,
            max_warm_per_function: 2,
            max_waiters_per_function: 8,
            idle_ttl: Duration::from_secs(60),
            freeze_after: None,
            sweep_interval: Duration::from_secs(5),
        }
    }

    fn pool_with(driver: &Arc<ScriptedDriver>, config: PoolConfig) -> SandboxPool {
        SandboxPool::new(driver.clone(), config, events::no_events())
    }

    fn in_secs(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_then_warm_reuses_same_sandbox() {
        init_test_logging();
        let driver = Arc::new(ScriptedDriver::new());
        let pool = pool_with(&driver, config());
        pool.deploy(spec("hello")).await.unwrap();

        let lease = pool.acquire(&"hello".into(), in_secs(5)).await.unwrap();
        assert_eq!(lease.start(), StartKind::Cold);
        assert_eq!(lease.handle().state(), SandboxState::Busy);
        let first = (lease.handle().id().clone(), lease.handle().created_at());
        pool.release(lease, Disposition::Reuse).await;
        assert_eq!(pool.stats().function("hello").unwrap().warm, 1);

        let lease = pool.acquire(&"hello".into(), in_secs(5)).await.unwrap();
        assert_eq!(lease.start(), StartKind::Warm);
        assert_eq!(
            (lease.handle().id().clone(), lease.handle().created_at()),
            first
        );
        assert_eq!(driver.creates(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_disposition_removes_sandbox() {
        let driver = Arc::new(ScriptedDriver::new());
        let pool = pool_with(&driver, config());
        pool.deploy(spec("hello")).await.unwrap();

        let lease = pool.acquire(&"hello".into(), in_secs(5)).await.unwrap();
        let lifecycle = lease.handle().lifecycle().clone();
        pool.release(lease, Disposition::Destroy).await;

        assert!(lifecycle.is_terminal());
        assert_eq!(pool.stats().function("hello").unwrap().total(), 0);
        assert_eq!(driver.destroys(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_function_is_not_found() {
        let driver = Arc::new(ScriptedDriver::new());
        let pool = pool_with(&driver, config());
        let err = pool.acquire(&"ghost".into(), in_secs(5)).await.unwrap_err();
        assert!(matches!(err, PoolError::NotFound(_)));
        assert_eq!(err.error_category(), "NOT_FOUND");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling_queues_then_times_out() {
        let driver = Arc::new(ScriptedDriver::new());
        let pool = pool_with(
            &driver,
            PoolConfig {
                max_sandboxes_per_function: 1,
                ..config()
            },
        );
        pool.deploy(spec("hello")).await.unwrap();

        let _held = pool.acquire(&"hello".into(), in_secs(5)).await.unwrap();
        let err = pool.acquire(&"hello".into(), in_secs(1)).await.unwrap_err();
        assert!(matches!(err, PoolError::TimedOut));
        assert_eq!(pool.stats().function("hello").unwrap().busy, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_waiters_reports_exhausted() {
        let driver = Arc::new(ScriptedDriver::new());
        let pool = pool_with(
            &driver,
            PoolConfig {
                max_sandboxes_per_function: 1,
                max_waiters_per_function: 0,
                ..config()
            },
        );
        pool.deploy(spec("hello")).await.unwrap();

        let _held = pool.acquire(&"hello".into(), in_secs(5)).await.unwrap();
        let err = pool.acquire(&"hello".into(), in_secs(5)).await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted(_)));
        assert!(err.is_recoverable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_cold_start_is_adopted_after_deadline() {
        let driver = Arc::new(ScriptedDriver::new().with_create_delay(Duration::from_secs(6)));
        let pool = pool_with(&driver, config());
        pool.deploy(spec("hello")).await.unwrap();

        let err = pool.acquire(&"hello".into(), in_secs(5)).await.unwrap_err();
        assert!(matches!(err, PoolError::TimedOut));
        assert_eq!(pool.stats().function("hello").unwrap().creating, 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let stats = pool.stats();
        let stats = stats.function("hello").unwrap();
        assert_eq!((stats.creating, stats.warm), (0, 1));
        assert_eq!(driver.execs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_failure_frees_slot() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.fail_next_creates(1);
        let pool = pool_with(
            &driver,
            PoolConfig {
                max_sandboxes_per_function: 1,
                ..config()
            },
        );
        pool.deploy(spec("hello")).await.unwrap();

        let err = pool.acquire(&"hello".into(), in_secs(5)).await.unwrap_err();
        assert!(matches!(err, PoolError::Driver(DriverError::Provision(_))));
        let stats = pool.stats();
        assert_eq!(stats.function("hello").unwrap().total(), 0);

        let lease = pool.acquire(&"hello".into(), in_secs(5)).await.unwrap();
        assert_eq!(lease.start(), StartKind::Cold);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redeploy_destroys_idle_and_stale_busy() {
        let driver = Arc::new(ScriptedDriver::new());
        let pool = pool_with(&driver, config());
        let v1 = pool.deploy(spec("hello")).await.unwrap();
        // Same spec again is a no-op.
        assert_eq!(pool.deploy(spec("hello")).await.unwrap(), v1);

        let idle = pool.acquire(&"hello".into(), in_secs(5)).await.unwrap();
        let busy = pool.acquire(&"hello".into(), in_secs(5)).await.unwrap();
        let idle_state = idle.handle().lifecycle().clone();
        let busy_state = busy.handle().lifecycle().clone();
        pool.release(idle, Disposition::Reuse).await;

        let v2 = pool
            .deploy(spec("hello").with_env("VERSION", "2"))
            .await
            .unwrap();
        assert!(v2 > v1);
        assert!(idle_state.is_terminal());
        assert!(!busy_state.is_terminal());

        pool.release(busy, Disposition::Reuse).await;
        assert!(busy_state.is_terminal());

        let lease = pool.acquire(&"hello".into(), in_secs(5)).await.unwrap();
        assert_eq!(lease.start(), StartKind::Cold);
        assert_eq!(lease.generation(), v2);
        assert_eq!(lease.spec().env["VERSION"], "2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_warm_budget_evicts_least_recently_used() {
        let driver = Arc::new(ScriptedDriver::new());
        let pool = pool_with(
            &driver,
            PoolConfig {
                max_sandboxes_per_function: 3,
                max_warm_per_function: 1,
                ..config()
            },
        );
        pool.deploy(spec("hello")).await.unwrap();

        let a = pool.acquire(&"hello".into(), in_secs(5)).await.unwrap();
        let b = pool.acquire(&"hello".into(), in_secs(5)).await.unwrap();
        let (a_state, b_state) = (a.handle().lifecycle().clone(), b.handle().lifecycle().clone());

        pool.release(a, Disposition::Reuse).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        pool.release(b, Disposition::Reuse).await;

        assert!(a_state.is_terminal());
        assert_eq!(b_state.current(), SandboxState::Warm);
        assert_eq!(pool.stats().function("hello").unwrap().warm, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_destroys_expired_idle_only() {
        let driver = Arc::new(ScriptedDriver::new());
        let pool = pool_with(&driver, config());
        pool.deploy(spec("hello")).await.unwrap();

        let idle = pool.acquire(&"hello".into(), in_secs(5)).await.unwrap();
        let busy = pool.acquire(&"hello".into(), in_secs(5)).await.unwrap();
        pool.release(idle, Disposition::Reuse).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        let report = pool.sweep_once().await;
        assert_eq!(report.destroyed, 1);
        assert_eq!(busy.handle().state(), SandboxState::Busy);
        let stats = pool.stats();
        assert_eq!(stats.function("hello").unwrap().warm, 0);
        assert_eq!(stats.function("hello").unwrap().busy, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_freeze_then_resume_on_acquire() {
        let driver = Arc::new(ScriptedDriver::new().with_freeze());
        let pool = pool_with(
            &driver,
            PoolConfig {
                freeze_after: Some(Duration::from_secs(1)),
                ..config()
            },
        );
        pool.deploy(spec("hello")).await.unwrap();

        let lease = pool.acquire(&"hello".into(), in_secs(5)).await.unwrap();
        let lifecycle = lease.handle().lifecycle().clone();
        pool.release(lease, Disposition::Reuse).await;

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(pool.sweep_once().await.frozen, 1);
        assert_eq!(lifecycle.current(), SandboxState::Frozen);
        assert_eq!(pool.stats().function("hello").unwrap().frozen, 1);

        let lease = pool.acquire(&"hello".into(), in_secs(5)).await.unwrap();
        assert_eq!(lease.start(), StartKind::Warm);
        assert_eq!(lease.handle().state(), SandboxState::Busy);
        assert_eq!(driver.resumes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_lease_destroys_busy_sandbox() {
        let driver = Arc::new(ScriptedDriver::new());
        let pool = pool_with(&driver, config());
        pool.deploy(spec("hello")).await.unwrap();

        let lease = pool.acquire(&"hello".into(), in_secs(5)).await.unwrap();
        let lifecycle = lease.handle().lifecycle().clone();
        drop(lease);

        assert_eq!(
            lifecycle.wait_for_terminal().await,
            SandboxState::Destroyed {
                reason: "abandoned".into()
            }
        );
        assert_eq!(pool.stats().function("hello").unwrap().total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undeploy_wakes_waiters_and_destroys_on_release() {
        let driver = Arc::new(ScriptedDriver::new());
        let pool = pool_with(
            &driver,
            PoolConfig {
                max_sandboxes_per_function: 1,
                ..config()
            },
        );
        pool.deploy(spec("hello")).await.unwrap();
        let held = pool.acquire(&"hello".into(), in_secs(5)).await.unwrap();
        let lifecycle = held.handle().lifecycle().clone();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(&"hello".into(), in_secs(5)).await })
        };
        tokio::task::yield_now().await;

        pool.undeploy(&"hello".into()).await.unwrap();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(PoolError::NotFound(_))
        ));

        pool.release(held, Disposition::Reuse).await;
        assert_eq!(
            lifecycle.current(),
            SandboxState::Destroyed {
                reason: "undeployed".into()
            }
        );
        assert!(pool.stats().function("hello").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_redeploy_after_undeploy_keeps_ceiling() {
        let driver = Arc::new(ScriptedDriver::new());
        let pool = pool_with(
            &driver,
            PoolConfig {
                max_sandboxes_per_function: 1,
                ..config()
            },
        );
        pool.deploy(spec("hello")).await.unwrap();
        let old = pool.acquire(&"hello".into(), in_secs(5)).await.unwrap();

        pool.undeploy(&"hello".into()).await.unwrap();
        pool.deploy(spec("hello")).await.unwrap();
        assert!(matches!(
            pool.acquire(&"hello".into(), in_secs(1)).await,
            Err(PoolError::TimedOut)
        ));

        let next = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(&"hello".into(), in_secs(5)).await })
        };
        tokio::task::yield_now().await;
        let old_id = old.handle().id().clone();
        pool.release(old, Disposition::Reuse).await;

        let next = next.await.unwrap().unwrap();
        assert_ne!(next.handle().id(), &old_id);
        assert!(driver.was_destroyed(&old_id));
        assert_eq!(pool.stats().function("hello").unwrap().busy, 1);
        pool.release(next, Disposition::Reuse).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_destroys_idle_and_rejects() {
        let driver = Arc::new(ScriptedDriver::new());
        let (events, mut rx) = channel_sink();
        let pool = SandboxPool::new(driver.clone(), config(), events);
        pool.deploy(spec("hello")).await.unwrap();

        let lease = pool.acquire(&"hello".into(), in_secs(5)).await.unwrap();
        pool.release(lease, Disposition::Reuse).await;
        pool.shutdown().await;

        assert!(matches!(
            pool.acquire(&"hello".into(), in_secs(5)).await,
            Err(PoolError::ShuttingDown)
        ));
        assert!(matches!(
            pool.deploy(spec("other")).await,
            Err(PoolError::ShuttingDown)
        ));
        assert_eq!(driver.destroys(), 1);

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        assert_eq!(names, ["sandbox_created", "sandbox_destroyed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_stops_on_shutdown() {
        let driver = Arc::new(ScriptedDriver::new());
        let pool = pool_with(
            &driver,
            PoolConfig {
                idle_ttl: Duration::from_secs(2),
                sweep_interval: Duration::from_secs(1),
                ..config()
            },
        );
        pool.deploy(spec("hello")).await.unwrap();
        let sweeper = pool.start_background_sweep();

        let lease = pool.acquire(&"hello".into(), in_secs(5)).await.unwrap();
        pool.release(lease, Disposition::Reuse).await;

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(pool.stats().function("hello").unwrap().warm, 0);

        pool.shutdown().await;
        sweeper.await.unwrap();
    }
}
