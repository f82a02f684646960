//! # fnexec
//!
//! The execution core of a serverless platform: it runs short-lived, stateless functions inside
//! isolated sandboxes, keeps sandboxes warm between invocations to avoid cold starts, and
//! enforces per-invocation deadlines.
//!
//! ## Architecture
//!
//! ```text
//! ExecutionEngine ── invoke ──> Scheduler ── acquire/release ──> SandboxPool ──> SandboxDriver
//!        │                        │ (EDF admission, deadlines)        │ (warm/frozen reuse,      │
//!        └── deploy/undeploy ─────┴───────────────────────────────────┘  generations, ceilings) │
//!                                                                            process / docker / gvisor
//! ```
//!
//! - **Driver** (`driver`): backend capability trait. Creates, executes in, freezes, resumes and
//!   destroys sandboxes. Ships a local process backend and a container backend (Docker, or
//!   Docker with the gVisor runtime).
//! - **Pool** (`pool`): per-function partitions of sandboxes with a hard ceiling, a warm
//!   budget with LRU eviction, idle TTL, optional freezing and deploy generations so stale
//!   sandboxes never run a new request.
//! - **Scheduler** (`scheduler`): per-request state machine. Admission (earliest deadline
//!   first), acquisition, execution and release, each bounded by the request deadline. Every
//!   request ends in exactly one [`Outcome`].
//! - **Engine** (`engine`): the facade callers hold. Deployment, invocation with optional
//!   cancellation, statistics and graceful shutdown.
//!
//! ## Outcomes
//!
//! - `Success`: the function produced a JSON result.
//! - `UserFault`: the function itself failed (non-zero exit, bad output). The sandbox is reused.
//! - `SystemFault`: the platform failed (provisioning, crashed runtime, shutdown). The sandbox
//!   is destroyed. The engine never retries; see [`retry`] for a caller-side helper.
//! - `TimedOut`: the deadline passed while queued, acquiring or executing.
//!
//! ## Modules
//!
//! - **`admission`**: deadline-ordered counting gate used for slots and concurrency limits.
//! - **`config`**: TOML configuration for the engine and function manifests.
//! - **`events`**: execution events and the sinks they are delivered to.
//! - **`stats`**: counters and pool snapshots.
//! - **`test_utils`**: an in-memory scripted driver for tests.

pub mod admission;
pub mod cli;
pub mod config;
pub mod driver;
pub mod engine;
pub mod events;
pub mod pool;
pub mod retry;
pub mod scheduler;
pub mod stats;
pub mod types;
pub mod utils;

// Test utilities
pub mod test_utils;

// Re-export main types for easier use
pub use config::{EngineConfig, FunctionManifest};
pub use driver::{SandboxDriver, SandboxHandle};
pub use engine::ExecutionEngine;
pub use events::{EventSink, ExecutionEvent};
pub use pool::{PoolError, SandboxPool};
pub use stats::EngineStats;
pub use types::{
    FunctionId, FunctionSpec, InvocationRequest, InvocationResult, Outcome, SystemFaultReason,
    TimeoutStage,
};
