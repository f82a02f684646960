//! Deadline-ordered admission gate.
//!
//! An [`AdmissionQueue`] hands out a fixed number of [`AdmissionPermit`]s. When none are free,
//! callers queue and are served earliest-deadline-first (ties in arrival order). A waiter whose
//! deadline passes leaves the queue with [`AdmissionError::TimedOut`]; once the number of
//! waiters reaches the configured depth, new callers are rejected with
//! [`AdmissionError::QueueFull`].
//!
//! A freed permit is handed directly to the next live waiter, so a waiter that arrives later
//! can never overtake one already queued. Permits are returned on drop, including permits that
//! were granted to a waiter that gave up before receiving them.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::{sync::oneshot, time::Instant};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("deadline passed while waiting for admission")]
    TimedOut,
    #[error("admission queue is full")]
    QueueFull,
    #[error("admission queue is closed")]
    Closed,
}

impl AdmissionError {
    /// Get error category for programmatic handling
    pub fn error_category(&self) -> &'static str {
        match self {
            AdmissionError::TimedOut => "TIMEOUT",
            AdmissionError::QueueFull => "RESOURCE",
            AdmissionError::Closed => "CLOSED",
        }
    }
}

struct Waiter {
    deadline: Instant,
    seq: u64,
    grant: oneshot::Sender<AdmissionPermit>,
}

// BinaryHeap is a max-heap: the earliest deadline, then the lowest sequence, compares greatest.
impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Waiter {}

struct QueueState {
    available: usize,
    waiters: BinaryHeap<Waiter>,
    next_seq: u64,
    closed: bool,
}

struct Shared {
    capacity: usize,
    max_waiters: usize,
    state: Mutex<QueueState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(self: &Arc<Self>) {
        let mut state = self.lock();
        while let Some(waiter) = state.waiters.pop() {
            let permit = AdmissionPermit {
                queue: Some(self.clone()),
            };
            match waiter.grant.send(permit) {
                Ok(()) => return,
                // The waiter gave up; disarm the permit so dropping it does not recurse.
                Err(mut unsent) => unsent.queue = None,
            }
        }
        state.available += 1;
    }
}

/// Counting gate with earliest-deadline-first queueing.
#[derive(Clone)]
pub struct AdmissionQueue {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for AdmissionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionQueue")
            .field("capacity", &self.shared.capacity)
            .field("available", &self.available())
            .field("waiting", &self.waiting())
            .finish()
    }
}

impl AdmissionQueue {
    /// `capacity` permits, at most `max_waiters` queued callers (0 rejects instead of queueing).
    pub fn new(capacity: usize, max_waiters: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                capacity,
                max_waiters,
                state: Mutex::new(QueueState {
                    available: capacity,
                    waiters: BinaryHeap::new(),
                    next_seq: 0,
                    closed: false,
                }),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn available(&self) -> usize {
        self.shared.lock().available
    }

    /// Permits currently held, including ones handed out before a [`close`](Self::close).
    pub fn in_use(&self) -> usize {
        self.shared.capacity - self.available()
    }

    /// Number of callers currently queued.
    pub fn waiting(&self) -> usize {
        self.shared
            .lock()
            .waiters
            .iter()
            .filter(|w| !w.grant.is_closed())
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Take a permit without waiting.
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        let mut state = self.shared.lock();
        if state.closed || state.available == 0 {
            return None;
        }
        state.available -= 1;
        Some(AdmissionPermit {
            queue: Some(self.shared.clone()),
        })
    }

    /// Take a permit, queueing until one frees up or `deadline` passes.
    pub async fn acquire(&self, deadline: Instant) -> Result<AdmissionPermit, AdmissionError> {
        let mut grant = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(AdmissionError::Closed);
            }
            if state.available > 0 {
                state.available -= 1;
                return Ok(AdmissionPermit {
                    queue: Some(self.shared.clone()),
                });
            }
            state.waiters.retain(|w| !w.grant.is_closed());
            if state.waiters.len() >= self.shared.max_waiters {
                return Err(AdmissionError::QueueFull);
            }
            let (tx, rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiters.push(Waiter {
                deadline,
                seq,
                grant: tx,
            });
            rx
        };

        match tokio::time::timeout_at(deadline, &mut grant).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(AdmissionError::Closed),
            // A permit granted in the meantime is dropped with the receiver and released.
            Err(_) => Err(AdmissionError::TimedOut),
        }
    }

    /// Reject all queued and future acquirers. Outstanding permits stay valid.
    pub fn close(&self) {
        let waiters = {
            let mut state = self.shared.lock();
            state.closed = true;
            std::mem::take(&mut state.waiters)
        };
        // Dropping the senders wakes the waiters with `Closed`.
        drop(waiters);
    }

    /// Accept acquirers again after [`close`](Self::close). Permits held across the close
    /// still count against the capacity.
    pub fn reopen(&self) {
        self.shared.lock().closed = false;
    }
}

/// One unit of admitted capacity, returned to its queue on drop.
pub struct AdmissionPermit {
    queue: Option<Arc<Shared>>,
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit").finish_non_exhaustive()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            queue.release();
        }
    }
}
