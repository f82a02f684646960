//! Observable lifecycle of a single sandbox.
//!
//! Every sandbox handle owns one [`SandboxLifecycle`]. The pool drives it through
//! `Creating → Warm → Busy → Warm → ... → Destroyed` (or `Creating → Failed`), with an
//! optional `Warm ⇄ Frozen` detour on backends that can suspend a sandbox. State is held
//! in a `tokio::sync::watch` channel so observers are notified on change without polling.
//!
//! # Example
//!
//! ```rust
//! use fnexec_common::sandbox_state::{SandboxLifecycle, SandboxState};
//!
//! let lifecycle = SandboxLifecycle::new();
//! lifecycle.mark_warm().unwrap();
//! lifecycle.mark_busy().unwrap();
//! assert!(lifecycle.mark_busy().is_err());
//! lifecycle.mark_warm().unwrap();
//! assert!(lifecycle.mark_destroyed("idle ttl"));
//! assert!(!lifecycle.mark_destroyed("again"));
//! assert!(matches!(lifecycle.current(), SandboxState::Destroyed { .. }));
//! ```

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Sandbox lifecycle states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxState {
    /// The isolation backend is provisioning the environment.
    Creating,
    /// Idle and ready to serve an invocation.
    Warm,
    /// Suspended by the backend; must be resumed before use.
    Frozen,
    /// Leased to exactly one invocation.
    Busy,
    /// Provisioning failed; the sandbox never became usable.
    Failed { error: String },
    /// Torn down; host resources reclaimed.
    Destroyed { reason: String },
}

impl SandboxState {
    pub fn name(&self) -> &'static str {
        match self {
            SandboxState::Creating => "creating",
            SandboxState::Warm => "warm",
            SandboxState::Frozen => "frozen",
            SandboxState::Busy => "busy",
            SandboxState::Failed { .. } => "failed",
            SandboxState::Destroyed { .. } => "destroyed",
        }
    }

    /// Returns true if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SandboxState::Failed { .. } | SandboxState::Destroyed { .. }
        )
    }

    /// Returns true if the sandbox is idle in the pool (warm or frozen).
    pub fn is_idle(&self) -> bool {
        matches!(self, SandboxState::Warm | SandboxState::Frozen)
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rejected lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: &'static str,
    pub to: &'static str,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid sandbox transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// Observable sandbox state machine backed by a watch channel.
#[derive(Clone)]
pub struct SandboxLifecycle {
    sender: Arc<watch::Sender<SandboxState>>,
    // Keep a receiver to ensure the channel stays alive
    _receiver: watch::Receiver<SandboxState>,
}

impl fmt::Debug for SandboxLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SandboxLifecycle")
            .field(&*self.sender.borrow())
            .finish()
    }
}

impl SandboxLifecycle {
    /// Create a lifecycle in the `Creating` state.
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(SandboxState::Creating);
        Self {
            sender: Arc::new(sender),
            _receiver: receiver,
        }
    }

    /// Get the current state without blocking
    pub fn current(&self) -> SandboxState {
        self.sender.borrow().clone()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<SandboxState> {
        self.sender.subscribe()
    }

    fn transition(
        &self,
        to: &'static str,
        allowed: impl Fn(&SandboxState) -> bool,
        next: SandboxState,
    ) -> Result<(), InvalidTransition> {
        let mut from = "";
        let transitioned = self.sender.send_if_modified(|state| {
            from = state.name();
            if allowed(state) {
                *state = next;
                true
            } else {
                false
            }
        });
        if transitioned {
            Ok(())
        } else {
            Err(InvalidTransition { from, to })
        }
    }

    /// Creating, Busy or Frozen -> Warm
    pub fn mark_warm(&self) -> Result<(), InvalidTransition> {
        self.transition(
            "warm",
            |s| {
                matches!(
                    s,
                    SandboxState::Creating | SandboxState::Busy | SandboxState::Frozen
                )
            },
            SandboxState::Warm,
        )
    }

    /// Warm -> Busy
    pub fn mark_busy(&self) -> Result<(), InvalidTransition> {
        self.transition(
            "busy",
            |s| matches!(s, SandboxState::Warm),
            SandboxState::Busy,
        )
    }

    /// Warm -> Frozen
    pub fn mark_frozen(&self) -> Result<(), InvalidTransition> {
        self.transition(
            "frozen",
            |s| matches!(s, SandboxState::Warm),
            SandboxState::Frozen,
        )
    }

    /// Creating -> Failed
    pub fn mark_failed(&self, error: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition(
            "failed",
            |s| matches!(s, SandboxState::Creating),
            SandboxState::Failed {
                error: error.into(),
            },
        )
    }

    /// Any non-terminal state -> Destroyed.
    ///
    /// Returns false if the sandbox was already terminal, which makes repeated
    /// destruction a no-op.
    pub fn mark_destroyed(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.sender.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = SandboxState::Destroyed {
                    reason: reason.clone(),
                };
                true
            }
        })
    }

    /// Wait until the sandbox reaches a terminal state and return it.
    pub async fn wait_for_terminal(&self) -> SandboxState {
        let mut rx = self.sender.subscribe();
        loop {
            {
                let state = rx.borrow_and_update();
                if state.is_terminal() {
                    return state.clone();
                }
            }
            if rx.changed().await.is_err() {
                return self.current();
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.sender.borrow().is_terminal()
    }
}

impl Default for SandboxLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_warm_busy_cycle() {
        let lifecycle = SandboxLifecycle::new();
        assert_eq!(lifecycle.current(), SandboxState::Creating);

        lifecycle.mark_warm().unwrap();
        lifecycle.mark_busy().unwrap();
        assert_eq!(lifecycle.current(), SandboxState::Busy);
        lifecycle.mark_warm().unwrap();
        lifecycle.mark_busy().unwrap();
        lifecycle.mark_warm().unwrap();
        assert_eq!(lifecycle.current(), SandboxState::Warm);
    }

    #[test]
    fn test_busy_requires_warm() {
        let lifecycle = SandboxLifecycle::new();
        let err = lifecycle.mark_busy().unwrap_err();
        assert_eq!(err.from, "creating");
        assert_eq!(err.to, "busy");

        lifecycle.mark_warm().unwrap();
        lifecycle.mark_frozen().unwrap();
        assert!(lifecycle.mark_busy().is_err());
        lifecycle.mark_warm().unwrap();
        assert!(lifecycle.mark_busy().is_ok());
    }

    #[test]
    fn test_failed_only_from_creating() {
        let lifecycle = SandboxLifecycle::new();
        lifecycle.mark_failed("image missing").unwrap();
        assert!(lifecycle.is_terminal());
        assert!(lifecycle.mark_warm().is_err());
        assert!(!lifecycle.mark_destroyed("cleanup"));

        let warm = SandboxLifecycle::new();
        warm.mark_warm().unwrap();
        assert!(warm.mark_failed("late").is_err());
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let lifecycle = SandboxLifecycle::new();
        lifecycle.mark_warm().unwrap();
        lifecycle.mark_busy().unwrap();
        assert!(lifecycle.mark_destroyed("timed out"));
        assert!(!lifecycle.mark_destroyed("timed out"));
        assert_eq!(
            lifecycle.current(),
            SandboxState::Destroyed {
                reason: "timed out".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_wait_for_terminal() {
        let lifecycle = SandboxLifecycle::new();
        let clone = lifecycle.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            clone.mark_warm().unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            clone.mark_destroyed("evicted");
        });

        let state = timeout(Duration::from_secs(1), lifecycle.wait_for_terminal())
            .await
            .unwrap();
        assert_eq!(
            state,
            SandboxState::Destroyed {
                reason: "evicted".to_string()
            }
        );
    }

    #[test]
    fn test_subscribe_receives_updates() {
        let lifecycle = SandboxLifecycle::new();
        let mut rx = lifecycle.subscribe();
        assert_eq!(*rx.borrow(), SandboxState::Creating);

        lifecycle.mark_warm().unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), SandboxState::Warm);
    }
}
