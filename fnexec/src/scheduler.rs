//! # Invocation Scheduler
//!
//! Turns one [`InvocationRequest`] into one [`InvocationResult`]:
//!
//! 1. A request whose deadline has already passed is rejected as `TimedOut{Queued}`.
//! 2. Admission through the per-function gate (when configured) and then the global gate,
//!    both earliest-deadline-first. Running out of time here is `TimedOut{Queued}`.
//! 3. A sandbox lease from the pool, bounded by the deadline (`TimedOut{Acquire}`); the
//!    function body has not run.
//! 4. The driver exec, bounded by the earlier of the deadline and the function's own timeout.
//!    On expiry the exec token is cancelled, the driver gets `kill_grace` to confirm the kill,
//!    the sandbox is destroyed and the result is `TimedOut{Execute}`.
//! 5. Release with the disposition the outcome implies.
//!
//! A caller cancellation follows the same paths and yields `SystemFault(cancelled)`.
//! Driver-reported faults pass through unchanged; the scheduler only adds timing and sandbox
//! metadata.

use crate::admission::{AdmissionError, AdmissionPermit, AdmissionQueue};
use crate::config::SchedulerConfig;
use crate::driver::{DriverError, ExecOutcome};
use crate::events::{self, EventSink, ExecutionEvent};
use crate::pool::{PoolError, SandboxPool};
use crate::stats::InvocationCounters;
use crate::types::{
    FunctionId, InvocationRequest, InvocationResult, Outcome, SandboxId, StartKind,
    SystemFaultReason, TimeoutStage,
};
use fnexec_common::StateMachine;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn cancelled() -> Outcome {
    Outcome::system(SystemFaultReason::Cancelled, "invocation cancelled by caller")
}

fn timed_out(stage: TimeoutStage) -> Outcome {
    Outcome::TimedOut { stage }
}

/// Map a pool failure onto the outcome a caller sees.
fn pool_outcome(error: PoolError) -> Outcome {
    let detail = error.to_string();
    match error {
        PoolError::TimedOut => timed_out(TimeoutStage::Acquire),
        PoolError::NotFound(_) => Outcome::system(SystemFaultReason::FunctionNotFound, detail),
        PoolError::Exhausted(_) => Outcome::system(SystemFaultReason::PoolExhausted, detail),
        PoolError::ShuttingDown => Outcome::system(SystemFaultReason::ShuttingDown, detail),
        PoolError::Driver(e) => Outcome::system(e.fault_reason(), detail),
        PoolError::InvalidSpec(_) => Outcome::system(SystemFaultReason::ProvisionError, detail),
    }
}

/// Per-invocation bookkeeping filled in as the request progresses.
#[derive(Default)]
struct Placement {
    start: Option<StartKind>,
    sandbox_id: Option<SandboxId>,
}

enum ExecEnd {
    Finished(Result<ExecOutcome, DriverError>),
    Deadline,
    Cancelled,
}

pub struct Scheduler {
    pool: SandboxPool,
    config: SchedulerConfig,
    global: AdmissionQueue,
    per_function: StateMachine<HashMap<FunctionId, AdmissionQueue>>,
    events: Arc<dyn EventSink>,
    counters: InvocationCounters,
    closed: AtomicBool,
}

impl Scheduler {
    pub fn new(pool: SandboxPool, config: SchedulerConfig, events: Arc<dyn EventSink>) -> Self {
        let global = AdmissionQueue::new(
            config.max_concurrent_invocations,
            config.max_queued_invocations,
        );
        Self {
            pool,
            config,
            global,
            per_function: StateMachine::default(),
            events,
            counters: InvocationCounters::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &SandboxPool {
        &self.pool
    }

    pub(crate) fn counters(&self) -> &InvocationCounters {
        &self.counters
    }

    /// Invocations currently admitted past the global gate.
    pub fn running(&self) -> usize {
        self.global.capacity() - self.global.available()
    }

    pub fn queued(&self) -> usize {
        self.global.waiting()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.pool.is_shutting_down()
    }

    fn function_gate(&self, id: &FunctionId) -> Option<AdmissionQueue> {
        let limit = self.config.max_concurrent_per_function?;
        let max_waiters = self.config.max_queued_invocations;
        Some(self.per_function.transition(|gates| {
            gates
                .entry(id.clone())
                .or_insert_with(|| AdmissionQueue::new(limit, max_waiters))
                .clone()
        }))
    }

    /// Close the per-function gate of an undeployed function.
    pub fn forget(&self, id: &FunctionId) {
        if let Some(gate) = self.per_function.transition(|gates| gates.remove(id)) {
            gate.close();
        }
    }

    /// Close every gate; queued and future requests fail with `shutting_down`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.global.close();
        let gates: Vec<AdmissionQueue> =
            self.per_function.transition(|gates| gates.drain().map(|(_, g)| g).collect());
        for gate in gates {
            gate.close();
        }
    }

    async fn admit(
        &self,
        gate: &AdmissionQueue,
        request: &InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<AdmissionPermit, Outcome> {
        let admitted = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            admitted = gate.acquire(request.deadline) => admitted,
        };
        admitted.map_err(|e| match e {
            AdmissionError::TimedOut => timed_out(TimeoutStage::Queued),
            AdmissionError::QueueFull => Outcome::system(
                SystemFaultReason::PoolExhausted,
                format!("too many invocations queued for '{}'", request.function_id),
            ),
            AdmissionError::Closed if self.is_closed() => {
                Outcome::system(SystemFaultReason::ShuttingDown, e.to_string())
            }
            AdmissionError::Closed => Outcome::system(
                SystemFaultReason::FunctionNotFound,
                format!("function '{}' was undeployed", request.function_id),
            ),
        })
    }

    /// Run one invocation to a result. Never fails; every failure is an outcome.
    #[instrument(
        level = "debug",
        skip_all,
        fields(request_id = %request.request_id, function = %request.function_id)
    )]
    pub async fn run(&self, request: InvocationRequest, cancel: CancellationToken) -> InvocationResult {
        let started = Instant::now();
        let mut placement = Placement::default();

        let outcome = match self.execute(&request, &cancel, &mut placement).await {
            Ok(outcome) | Err(outcome) => outcome,
        };

        let result = InvocationResult {
            request_id: request.request_id,
            function_id: request.function_id,
            outcome,
            duration: started.elapsed(),
            finished_at: SystemTime::now(),
            start: placement.start,
            sandbox_id: placement.sandbox_id,
        };

        self.counters.record(&result.outcome, result.start);
        debug!(
            "invocation finished: {} in {}ms",
            result.outcome.kind().as_str(),
            millis(result.duration)
        );
        events::emit(
            self.events.as_ref(),
            ExecutionEvent::InvocationFinished {
                request_id: result.request_id.clone(),
                function_id: result.function_id.to_string(),
                sandbox_id: result.sandbox_id.as_ref().map(ToString::to_string),
                start: result.start,
                outcome: result.outcome.kind(),
                duration_ms: millis(result.duration),
            },
        )
        .await;
        result
    }

    async fn execute(
        &self,
        request: &InvocationRequest,
        cancel: &CancellationToken,
        placement: &mut Placement,
    ) -> Result<Outcome, Outcome> {
        if request.remaining().is_none() {
            return Err(timed_out(TimeoutStage::Queued));
        }
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        if self.pool.spec(&request.function_id).is_none() {
            return Err(pool_outcome(if self.pool.is_shutting_down() {
                PoolError::ShuttingDown
            } else {
                PoolError::NotFound(request.function_id.clone())
            }));
        }

        let _function_permit = match self.function_gate(&request.function_id) {
            Some(gate) => Some(self.admit(&gate, request, cancel).await?),
            None => None,
        };
        let _global_permit = self.admit(&self.global, request, cancel).await?;

        let lease = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            lease = self.pool.acquire(&request.function_id, request.deadline) => {
                lease.map_err(pool_outcome)?
            }
        };

        placement.start = Some(lease.start());
        placement.sandbox_id = Some(lease.handle().id().clone());
        events::emit(
            self.events.as_ref(),
            ExecutionEvent::InvocationStarted {
                request_id: request.request_id.clone(),
                function_id: request.function_id.to_string(),
                sandbox_id: lease.handle().id().to_string(),
                start: lease.start(),
            },
        )
        .await;

        let spec = lease.spec().clone();
        let exec_deadline = request.deadline.min(Instant::now() + spec.limits.timeout);
        let token = CancellationToken::new();

        let outcome = {
            let exec = self
                .pool
                .driver()
                .exec(lease.handle(), &spec, &request.payload, token.clone());
            tokio::pin!(exec);

            let end = tokio::select! {
                biased;
                result = &mut exec => ExecEnd::Finished(result),
                _ = cancel.cancelled() => ExecEnd::Cancelled,
                _ = tokio::time::sleep_until(exec_deadline) => ExecEnd::Deadline,
            };

            let finished = match end {
                ExecEnd::Finished(result) => Ok(result),
                ExecEnd::Deadline => Err(timed_out(TimeoutStage::Execute)),
                ExecEnd::Cancelled => Err(cancelled()),
            };

            match finished {
                Ok(Ok(ExecOutcome::Success(payload))) => Outcome::Success { payload },
                Ok(Ok(ExecOutcome::UserFault {
                    message,
                    exit_code,
                    signal,
                })) => Outcome::UserFault {
                    message,
                    exit_code,
                    signal,
                },
                Ok(Err(e)) => {
                    warn!("sandbox {} failed: {}", lease.handle().id(), e);
                    Outcome::system(e.fault_reason(), e.to_string())
                }
                Err(interrupted) => {
                    token.cancel();
                    match tokio::time::timeout(self.config.kill_grace, &mut exec).await {
                        Ok(_) => debug!("driver confirmed kill of {}", lease.handle().id()),
                        Err(_) => warn!(
                            "driver did not confirm kill of {} within {}ms",
                            lease.handle().id(),
                            millis(self.config.kill_grace)
                        ),
                    }
                    interrupted
                }
            }
        };

        self.pool.release(lease, outcome.disposition()).await;
        Ok(outcome)
    }
}
