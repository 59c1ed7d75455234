//! Per-session FIFO delivery lock.
//!
//! Each session name gets a ticket queue: callers take the next ticket and
//! wait until it is being served, so concurrent senders to one session are
//! admitted strictly in arrival order. A waiter that times out or is
//! cancelled marks its ticket abandoned and the queue skips it.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Upper bound on one condvar wait, so cancellation is noticed promptly.
const WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    TimedOut { waited: Duration },
    Cancelled,
}

#[derive(Debug, Default)]
struct QueueState {
    next_ticket: u64,
    serving: u64,
    abandoned: BTreeSet<u64>,
}

impl QueueState {
    fn idle(&self) -> bool {
        self.serving == self.next_ticket
    }

    fn advance(&mut self) {
        self.serving += 1;
        while self.abandoned.remove(&self.serving) {
            self.serving += 1;
        }
    }
}

#[derive(Debug, Default)]
struct TicketQueue {
    state: Mutex<QueueState>,
    turn: Condvar,
}

impl TicketQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Process-wide table of per-session queues.
#[derive(Debug, Default)]
pub struct SessionLocks {
    queues: Mutex<HashMap<String, Arc<TicketQueue>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, name: &str) -> Arc<TicketQueue> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        // Drop queues nobody holds or waits on.
        queues.retain(|_, q| Arc::strong_count(q) > 1 || !q.lock().idle());
        Arc::clone(queues.entry(name.to_string()).or_default())
    }

    /// Wait for exclusive delivery rights on `name`, in FIFO order.
    pub fn acquire(
        &self,
        name: &str,
        timeout: Duration,
        stop: &AtomicBool,
    ) -> Result<SessionGuard, AcquireError> {
        let queue = self.queue(name);
        let start = Instant::now();
        let deadline = start + timeout;

        let mut state = queue.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;

        loop {
            if state.serving == ticket {
                drop(state);
                return Ok(SessionGuard { queue, ticket });
            }

            let now = Instant::now();
            let outcome = if stop.load(Ordering::SeqCst) {
                Some(AcquireError::Cancelled)
            } else if now >= deadline {
                Some(AcquireError::TimedOut {
                    waited: now - start,
                })
            } else {
                None
            };
            if let Some(err) = outcome {
                state.abandoned.insert(ticket);
                return Err(err);
            }

            let nap = WAIT_SLICE.min(deadline - now);
            state = queue
                .turn
                .wait_timeout(state, nap)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// Number of callers holding or waiting for `name`.
    pub fn queued(&self, name: &str) -> u64 {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .get(name)
            .map(|q| {
                let s = q.lock();
                s.next_ticket - s.serving - s.abandoned.len() as u64
            })
            .unwrap_or(0)
    }
}

/// Delivery rights on one session; released on drop.
#[derive(Debug)]
pub struct SessionGuard {
    queue: Arc<TicketQueue>,
    ticket: u64,
}

impl SessionGuard {
    pub fn ticket(&self) -> u64 {
        self.ticket
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut state = self.queue.lock();
        state.advance();
        drop(state);
        self.queue.turn.notify_all();
    }
}
