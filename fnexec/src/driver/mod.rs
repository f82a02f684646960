//! # Sandbox Drivers
//!
//! A driver is the only code that talks to an isolation technology. The pool and scheduler
//! see nothing but the [`SandboxDriver`] capability set:
//!
//! * `create`: provision an environment for a function (cold start).
//! * `exec`: run the function entry point once inside it, honouring a cancellation token.
//! * `destroy`: tear it down; idempotent.
//! * `freeze` / `resume`: optional suspension of idle sandboxes.
//!
//! Backends:
//!
//! * [`ProcessDriver`]: a private scratch directory per sandbox, one child process per
//!   invocation. Wall-clock limits only.
//! * [`ContainerDriver`]: a long-lived container per sandbox driven through the `docker`
//!   CLI (optionally with the gVisor `runsc` runtime), CPU and memory limits enforced by the
//!   container runtime, freeze via `docker pause`.
//!
//! ## Invocation contract
//!
//! The input event is written as JSON to the entry point's stdin. The entry point prints one
//! JSON document to stdout and exits 0. Anything else is a user fault: non-zero exit, death by
//! signal, out-of-memory kill, or stdout that is not JSON.

mod child;
mod container;
mod process;

pub use container::{ContainerDriver, ContainerSettings};
pub use process::ProcessDriver;

use crate::config::{DriverConfig, DriverKind};
use crate::types::{FunctionId, FunctionSpec, SandboxId, SystemFaultReason};
use async_trait::async_trait;
use fnexec_common::{SandboxLifecycle, SandboxState};
use serde_json::Value;
use std::{process::ExitStatus, sync::Arc, time::SystemTime};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Environment variables every invocation sees in addition to the function's own.
pub const ENV_FUNCTION_ID: &str = "FNEXEC_FUNCTION_ID";
pub const ENV_SANDBOX_ID: &str = "FNEXEC_SANDBOX_ID";

/// Opaque reference to one live sandbox, bound for life to the function it was created for.
#[derive(Debug)]
pub struct SandboxHandle {
    id: SandboxId,
    function_id: FunctionId,
    backend_ref: String,
    created_at: Instant,
    created_wall: SystemTime,
    lifecycle: SandboxLifecycle,
}

impl SandboxHandle {
    pub fn new(id: SandboxId, function_id: FunctionId, backend_ref: impl Into<String>) -> Self {
        Self {
            id,
            function_id,
            backend_ref: backend_ref.into(),
            created_at: Instant::now(),
            created_wall: SystemTime::now(),
            lifecycle: SandboxLifecycle::new(),
        }
    }

    pub fn id(&self) -> &SandboxId {
        &self.id
    }

    pub fn function_id(&self) -> &FunctionId {
        &self.function_id
    }

    /// Backend-specific reference: container id, scratch directory, ...
    pub fn backend_ref(&self) -> &str {
        &self.backend_ref
    }

    /// Monotonic creation instant; unchanged across warm reuse.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn created_wall(&self) -> SystemTime {
        self.created_wall
    }

    pub fn lifecycle(&self) -> &SandboxLifecycle {
        &self.lifecycle
    }

    pub fn state(&self) -> SandboxState {
        self.lifecycle.current()
    }
}

/// Result of an exec that reached the function: either it produced output or it failed
/// on its own terms.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutcome {
    Success(Value),
    UserFault {
        message: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Failures of the isolation layer itself.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("failed to provision sandbox: {0}")]
    Provision(String),

    #[error("sandbox crashed: {0}")]
    Crashed(String),

    #[error("sandbox {0} no longer exists")]
    Gone(SandboxId),

    #[error("sandbox I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("execution cancelled and sandbox process killed")]
    Cancelled,

    #[error("operation '{0}' is not supported by this driver")]
    Unsupported(&'static str),
}

impl DriverError {
    /// Check if this error represents a potentially recoverable condition
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DriverError::Provision(_) | DriverError::Crashed(_) | DriverError::Io(_)
        )
    }

    /// Get error category for programmatic handling
    pub fn error_category(&self) -> &'static str {
        match self {
            DriverError::Provision(_) => "PROVISION",
            DriverError::Crashed(_) | DriverError::Gone(_) => "SANDBOX",
            DriverError::Io(_) => "IO",
            DriverError::Cancelled => "CANCELLED",
            DriverError::Unsupported(_) => "UNSUPPORTED",
        }
    }

    /// The system fault this error surfaces as.
    pub fn fault_reason(&self) -> SystemFaultReason {
        match self {
            DriverError::Provision(_) | DriverError::Unsupported(_) => {
                SystemFaultReason::ProvisionError
            }
            DriverError::Crashed(_) | DriverError::Gone(_) => SystemFaultReason::SandboxCrashed,
            DriverError::Io(_) => SystemFaultReason::IoError,
            DriverError::Cancelled => SystemFaultReason::Cancelled,
        }
    }
}

/// Capability set every isolation backend implements.
#[async_trait]
pub trait SandboxDriver: Send + Sync {
    /// Short backend name for logs and events.
    fn name(&self) -> &'static str;

    /// Provision a sandbox for `spec`. The returned handle is in the `Creating` state.
    async fn create(&self, spec: &FunctionSpec) -> Result<SandboxHandle, DriverError>;

    /// Run the entry point of `spec` inside `handle` with `input`.
    ///
    /// When `cancel` fires the driver must kill whatever it started and return
    /// [`DriverError::Cancelled`] only once the kill is confirmed.
    async fn exec(
        &self,
        handle: &SandboxHandle,
        spec: &FunctionSpec,
        input: &Value,
        cancel: CancellationToken,
    ) -> Result<ExecOutcome, DriverError>;

    /// Tear the sandbox down. Destroying an already destroyed sandbox is a no-op.
    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), DriverError>;

    fn supports_freeze(&self) -> bool {
        false
    }

    async fn freeze(&self, _handle: &SandboxHandle) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("freeze"))
    }

    async fn resume(&self, _handle: &SandboxHandle) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("resume"))
    }
}

/// Build the driver selected by the configuration.
pub fn build_driver(config: &DriverConfig) -> Arc<dyn SandboxDriver> {
    match config.kind {
        DriverKind::Process => Arc::new(ProcessDriver::new(config.clone())),
        DriverKind::Docker => Arc::new(ContainerDriver::new(
            ContainerSettings::docker(&config.container),
            config.max_output_bytes,
        )),
        DriverKind::Gvisor => Arc::new(ContainerDriver::new(
            ContainerSettings::gvisor(&config.container),
            config.max_output_bytes,
        )),
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

fn last_line(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Turn a finished entry-point process into an [`ExecOutcome`].
///
/// Exit 0 with empty stdout is a success with a `null` payload.
pub(crate) fn interpret_output(output: &child::ChildOutput, max_output_bytes: usize) -> ExecOutcome {
    let exit_code = output.status.code();
    let signal = exit_signal(&output.status);

    if !output.status.success() {
        let message = last_line(&output.stderr).unwrap_or_else(|| match (exit_code, signal) {
            (Some(code), _) => format!("function exited with code {code}"),
            (None, Some(sig)) => format!("function killed by signal {sig}"),
            (None, None) => "function terminated abnormally".to_string(),
        });
        return ExecOutcome::UserFault {
            message,
            exit_code,
            signal,
        };
    }

    if output.stdout_truncated {
        return ExecOutcome::UserFault {
            message: format!("malformed output: exceeded {max_output_bytes} bytes"),
            exit_code,
            signal: None,
        };
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return ExecOutcome::Success(Value::Null);
    }
    match serde_json::from_str(trimmed) {
        Ok(value) => ExecOutcome::Success(value),
        Err(e) => ExecOutcome::UserFault {
            message: format!("malformed output: {e}"),
            exit_code,
            signal: None,
        },
    }
}
