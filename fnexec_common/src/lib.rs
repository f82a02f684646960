//! Shared primitives for the fnexec workspace.
//!
//! - [`state_machine::StateMachine`]: a mutex-guarded state with closure-based transitions,
//!   used for per-function pool partitions.
//! - [`sandbox_state::SandboxLifecycle`]: the observable lifecycle of a single sandbox.

pub mod sandbox_state;
pub mod state_machine;

pub use sandbox_state::{InvalidTransition, SandboxLifecycle, SandboxState};
pub use state_machine::StateMachine;
