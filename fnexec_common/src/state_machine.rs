use std::sync::{Mutex, MutexGuard, PoisonError};

/// A generic state machine wrapper ensuring thread-safe state transitions.
///
/// This struct wraps a state `S` in a `Mutex` and provides a `transition` method
/// to perform atomic state updates and return an action/result. The lock is a
/// plain `std::sync::Mutex`: closures must not await, so critical sections stay short.
///
/// A poisoned lock is recovered rather than propagated; every transition leaves
/// the state consistent before it can panic.
///
/// # Example
///
/// ```rust
/// use fnexec_common::state_machine::StateMachine;
///
/// enum Slot {
///     Idle,
///     Leased,
/// }
///
/// let machine = StateMachine::new(Slot::Idle);
///
/// let action = machine.transition(|state| match state {
///     Slot::Idle => {
///         *state = Slot::Leased;
///         "leased"
///     }
///     Slot::Leased => "already leased",
/// });
/// assert_eq!(action, "leased");
/// ```
#[derive(Debug)]
pub struct StateMachine<S> {
    state: Mutex<S>,
}

impl<S> StateMachine<S> {
    /// Creates a new `StateMachine` in the given initial state.
    pub fn new(initial_state: S) -> Self {
        Self {
            state: Mutex::new(initial_state),
        }
    }

    /// Access the underlying state directly via a MutexGuard.
    ///
    /// Use this for simple reads. For transitions, prefer `transition`.
    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Perform an atomic transition on the state.
    ///
    /// The closure `f` is called with a mutable reference to the current state.
    /// The lock is held for the duration of the closure.
    pub fn transition<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut state = self.lock();
        f(&mut state)
    }

    /// Read a value out of the state without mutating it.
    pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        let state = self.lock();
        f(&state)
    }
}

impl<S: Default> Default for StateMachine<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}
