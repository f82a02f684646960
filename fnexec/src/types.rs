//! Core data model: function descriptors, invocation requests and results.

use crate::utils::time;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    borrow::Borrow,
    collections::BTreeMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime},
};
use tokio::time::Instant;

static SANDBOX_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identifier of a deployed function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionId(String);

impl FunctionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FunctionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for FunctionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for FunctionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Engine-assigned identifier of one sandbox instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(String);

impl SandboxId {
    /// Allocate a fresh, process-unique sandbox id.
    pub fn next() -> Self {
        Self(format!(
            "sbx-{}",
            SANDBOX_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the function's code lives and how to start it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactRef {
    /// Container image for container backends; working-directory seed for the process backend.
    pub image: String,
    /// Entry point executed once per invocation inside the sandbox.
    pub command: Vec<String>,
}

impl ArtifactRef {
    pub fn new(image: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            image: image.into(),
            command,
        }
    }
}

/// Per-function resource ceilings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceLimits {
    /// Relative CPU weight (docker `--cpu-shares`).
    #[serde(default = "default_cpu_shares")]
    pub cpu_shares: u32,
    /// Memory ceiling in MiB.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    /// Wall-clock limit applied when the caller does not supply a tighter deadline.
    #[serde(default = "default_timeout", with = "time::millis", rename = "timeout_ms")]
    pub timeout: Duration,
}

fn default_cpu_shares() -> u32 {
    1024
}

fn default_memory_mb() -> u64 {
    128
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_shares: default_cpu_shares(),
            memory_mb: default_memory_mb(),
            timeout: default_timeout(),
        }
    }
}

/// Errors raised while validating a [`FunctionSpec`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("function id must not be empty")]
    EmptyId,
    #[error("function '{0}' has an empty artifact image")]
    EmptyImage(FunctionId),
    #[error("function '{0}' has no entry command")]
    EmptyCommand(FunctionId),
    #[error("function '{0}' must have a non-zero timeout")]
    ZeroTimeout(FunctionId),
    #[error("function '{0}' must have a non-zero memory ceiling")]
    ZeroMemory(FunctionId),
}

/// Immutable function descriptor, created at deploy time and shared as `Arc<FunctionSpec>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FunctionSpec {
    pub id: FunctionId,
    pub artifact: ArtifactRef,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Free-form runtime label (e.g. "python"); informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
}

impl FunctionSpec {
    pub fn new(id: impl Into<FunctionId>, artifact: ArtifactRef) -> Self {
        Self {
            id: id.into(),
            artifact,
            limits: ResourceLimits::default(),
            env: BTreeMap::new(),
            runtime: None,
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.limits.timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = Some(runtime.into());
        self
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        if self.id.as_str().trim().is_empty() {
            return Err(SpecError::EmptyId);
        }
        if self.artifact.image.trim().is_empty() {
            return Err(SpecError::EmptyImage(self.id.clone()));
        }
        if self.artifact.command.is_empty() {
            return Err(SpecError::EmptyCommand(self.id.clone()));
        }
        if self.limits.timeout.is_zero() {
            return Err(SpecError::ZeroTimeout(self.id.clone()));
        }
        if self.limits.memory_mb == 0 {
            return Err(SpecError::ZeroMemory(self.id.clone()));
        }
        Ok(())
    }
}

/// Whether an invocation ran on a freshly created or a reused sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartKind {
    Cold,
    Warm,
}

/// A request to run one function once. The request id is carried through for correlation
/// only; the engine never deduplicates on it.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub request_id: String,
    pub function_id: FunctionId,
    pub payload: Value,
    pub deadline: Instant,
}

impl InvocationRequest {
    pub fn new(
        request_id: impl Into<String>,
        function_id: impl Into<FunctionId>,
        payload: Value,
        deadline: Instant,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            function_id: function_id.into(),
            payload,
            deadline,
        }
    }

    /// Build a request with a generated request id and a deadline `timeout` from now.
    pub fn with_timeout(
        function_id: impl Into<FunctionId>,
        payload: Value,
        timeout: Duration,
    ) -> Self {
        let request_id = format!(
            "req-{}",
            REQUEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        Self::new(request_id, function_id, payload, Instant::now() + timeout)
    }

    /// Time left before the deadline, `None` once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
    }
}

/// Stage at which an invocation ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutStage {
    /// Waiting for a concurrency slot, or already expired on arrival.
    Queued,
    /// Waiting for a sandbox (warm slot or cold start).
    Acquire,
    /// The function body was running and was killed.
    Execute,
}

/// Machine-readable cause of a system fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemFaultReason {
    ProvisionError,
    SandboxCrashed,
    PoolExhausted,
    FunctionNotFound,
    ShuttingDown,
    Cancelled,
    IoError,
}

impl SystemFaultReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemFaultReason::ProvisionError => "provision_error",
            SystemFaultReason::SandboxCrashed => "sandbox_crashed",
            SystemFaultReason::PoolExhausted => "pool_exhausted",
            SystemFaultReason::FunctionNotFound => "function_not_found",
            SystemFaultReason::ShuttingDown => "shutting_down",
            SystemFaultReason::Cancelled => "cancelled",
            SystemFaultReason::IoError => "io_error",
        }
    }

    /// Faults a caller may reasonably retry; the engine itself never does.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SystemFaultReason::ProvisionError
                | SystemFaultReason::SandboxCrashed
                | SystemFaultReason::PoolExhausted
                | SystemFaultReason::IoError
        )
    }
}

impl fmt::Display for SystemFaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The deterministic result of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        payload: Value,
    },
    /// The artifact failed: non-zero exit, signal, out-of-memory kill or malformed output.
    UserFault {
        message: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
    /// The host or isolation layer failed.
    SystemFault {
        reason: SystemFaultReason,
        detail: String,
    },
    TimedOut {
        stage: TimeoutStage,
    },
}

/// Outcome tag without payload, for events and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    UserFault,
    SystemFault,
    TimedOut,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::UserFault => "user_fault",
            OutcomeKind::SystemFault => "system_fault",
            OutcomeKind::TimedOut => "timed_out",
        }
    }
}

/// What the pool does with a sandbox once an invocation is done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Return to the warm set.
    Reuse,
    /// Tear down; the sandbox state can no longer be trusted.
    Destroy,
}

impl Outcome {
    pub fn system(reason: SystemFaultReason, detail: impl Into<String>) -> Self {
        Outcome::SystemFault {
            reason,
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Success { .. } => OutcomeKind::Success,
            Outcome::UserFault { .. } => OutcomeKind::UserFault,
            Outcome::SystemFault { .. } => OutcomeKind::SystemFault,
            Outcome::TimedOut { .. } => OutcomeKind::TimedOut,
        }
    }

    /// User faults leave the environment intact; everything else after a failure does not.
    pub fn disposition(&self) -> Disposition {
        match self {
            Outcome::Success { .. } | Outcome::UserFault { .. } => Disposition::Reuse,
            Outcome::SystemFault { .. } | Outcome::TimedOut { .. } => Disposition::Destroy,
        }
    }
}

/// Outcome annotated with timing and sandbox metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResult {
    pub request_id: String,
    pub function_id: FunctionId,
    #[serde(flatten)]
    pub outcome: Outcome,
    #[serde(with = "time::millis", rename = "duration_ms")]
    pub duration: Duration,
    /// Wall-clock completion time, RFC 3339 on the wire.
    #[serde(with = "time")]
    pub finished_at: SystemTime,
    /// Cold or warm; `None` when no sandbox was acquired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<StartKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<SandboxId>,
}

impl InvocationResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self.outcome, Outcome::TimedOut { .. })
    }
}
