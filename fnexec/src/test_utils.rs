//! Test helpers for the engine.
//!
//! [`ScriptedDriver`] is an in-memory [`SandboxDriver`] whose behaviour is steered by the
//! invocation payload, so pool and scheduler tests run on a paused clock without spawning
//! processes. These APIs are intended for test-only code paths.
//!
//! Payload keys understood by `exec` (all optional):
//!
//! * `"sleep_ms": n`: take `n` milliseconds before answering
//! * `"exit": code`: fail like a process exiting with `code`
//! * `"crash": true`: fail as if the sandbox runtime died
//! * `"garbage": true`: produce malformed output
//!
//! Anything else succeeds with a payload describing what ran:
//! `{"echo": <input>, "sandbox_id": .., "function_id": .., "version": <env VERSION>}`.

use crate::driver::{DriverError, ExecOutcome, SandboxDriver, SandboxHandle};
use crate::types::{ArtifactRef, FunctionSpec, SandboxId};
use async_trait::async_trait;
use fnexec_common::StateMachine;
use serde_json::{Value, json};
use std::{
    collections::HashSet,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A function spec the [`ScriptedDriver`] can run.
pub fn spec(id: &str) -> FunctionSpec {
    FunctionSpec::new(id, ArtifactRef::new("scripted", vec!["handler".into()]))
}

/// The interval during which one exec occupied a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecWindow {
    pub sandbox_id: SandboxId,
    pub start: Instant,
    pub end: Instant,
}

impl ExecWindow {
    pub fn overlaps(&self, other: &ExecWindow) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Default)]
struct Recorded {
    active: HashSet<SandboxId>,
    destroyed: HashSet<SandboxId>,
    windows: Vec<ExecWindow>,
    peak_concurrency: usize,
    double_leases: usize,
    execs_on_destroyed: usize,
}

/// In-memory driver for tests.
#[derive(Debug, Default)]
pub struct ScriptedDriver {
    create_delay: Duration,
    kill_delay: Duration,
    freeze: bool,
    fail_creates: AtomicUsize,
    fail_resumes: AtomicUsize,
    creates: AtomicUsize,
    execs: AtomicUsize,
    destroys: AtomicUsize,
    freezes: AtomicUsize,
    resumes: AtomicUsize,
    cancels: AtomicUsize,
    recorded: StateMachine<Recorded>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every cold start takes `delay`.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Time between cancellation and the confirmed kill.
    pub fn with_kill_delay(mut self, delay: Duration) -> Self {
        self.kill_delay = delay;
        self
    }

    pub fn with_freeze(mut self) -> Self {
        self.freeze = true;
        self
    }

    /// Make the next `n` creates fail with a provisioning error.
    pub fn fail_next_creates(&self, n: usize) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_resumes(&self, n: usize) {
        self.fail_resumes.store(n, Ordering::SeqCst);
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Execs that reached the function body.
    pub fn execs(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    pub fn freezes(&self) -> usize {
        self.freezes.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    /// Completed exec windows in completion order.
    pub fn windows(&self) -> Vec<ExecWindow> {
        self.recorded.read(|r| r.windows.clone())
    }

    /// Highest number of execs observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.recorded.read(|r| r.peak_concurrency)
    }

    /// Execs that started on a sandbox already running one.
    pub fn double_leases(&self) -> usize {
        self.recorded.read(|r| r.double_leases)
    }

    /// Execs that started on a sandbox that had been destroyed.
    pub fn execs_on_destroyed(&self) -> usize {
        self.recorded.read(|r| r.execs_on_destroyed)
    }

    pub fn was_destroyed(&self, id: &SandboxId) -> bool {
        self.recorded.read(|r| r.destroyed.contains(id))
    }

    fn begin(&self, id: &SandboxId) {
        self.recorded.transition(|r| {
            if r.destroyed.contains(id) {
                r.execs_on_destroyed += 1;
            }
            if !r.active.insert(id.clone()) {
                r.double_leases += 1;
            }
            r.peak_concurrency = r.peak_concurrency.max(r.active.len());
        });
    }

    fn end(&self, id: &SandboxId, start: Instant) {
        self.recorded.transition(|r| {
            r.active.remove(id);
            r.windows.push(ExecWindow {
                sandbox_id: id.clone(),
                start,
                end: Instant::now(),
            });
        });
    }

    fn answer(handle: &SandboxHandle, spec: &FunctionSpec, input: &Value) -> Result<ExecOutcome, DriverError> {
        if input.get("crash").and_then(Value::as_bool) == Some(true) {
            return Err(DriverError::Crashed("scripted runtime crash".into()));
        }
        if let Some(code) = input.get("exit").and_then(Value::as_i64) {
            return Ok(ExecOutcome::UserFault {
                message: format!("function exited with code {code}"),
                exit_code: i32::try_from(code).ok(),
                signal: None,
            });
        }
        if input.get("garbage").and_then(Value::as_bool) == Some(true) {
            return Ok(ExecOutcome::UserFault {
                message: "malformed output: expected value at line 1 column 1".into(),
                exit_code: Some(0),
                signal: None,
            });
        }
        Ok(ExecOutcome::Success(json!({
            "echo": input,
            "sandbox_id": handle.id().as_str(),
            "function_id": spec.id.as_str(),
            "version": spec.env.get("VERSION"),
        })))
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SandboxDriver for ScriptedDriver {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn create(&self, spec: &FunctionSpec) -> Result<SandboxHandle, DriverError> {
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        if Self::take_failure(&self.fail_creates) {
            return Err(DriverError::Provision("scripted create failure".into()));
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        let id = SandboxId::next();
        let backend_ref = format!("scripted-{id}");
        Ok(SandboxHandle::new(id, spec.id.clone(), backend_ref))
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        spec: &FunctionSpec,
        input: &Value,
        cancel: CancellationToken,
    ) -> Result<ExecOutcome, DriverError> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();
        self.begin(handle.id());

        let work = input
            .get("sleep_ms")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or_default();

        let result = tokio::select! {
            _ = tokio::time::sleep(work) => Self::answer(handle, spec, input),
            _ = cancel.cancelled() => {
                self.cancels.fetch_add(1, Ordering::SeqCst);
                if !self.kill_delay.is_zero() {
                    tokio::time::sleep(self.kill_delay).await;
                }
                Err(DriverError::Cancelled)
            }
        };

        self.end(handle.id(), start);
        result
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), DriverError> {
        let first = self
            .recorded
            .transition(|r| r.destroyed.insert(handle.id().clone()));
        if first {
            self.destroys.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn supports_freeze(&self) -> bool {
        self.freeze
    }

    async fn freeze(&self, _handle: &SandboxHandle) -> Result<(), DriverError> {
        if !self.freeze {
            return Err(DriverError::Unsupported("freeze"));
        }
        self.freezes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self, handle: &SandboxHandle) -> Result<(), DriverError> {
        if !self.freeze {
            return Err(DriverError::Unsupported("resume"));
        }
        if Self::take_failure(&self.fail_resumes) {
            return Err(DriverError::Crashed(format!("{} did not resume", handle.id())));
        }
        self.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
