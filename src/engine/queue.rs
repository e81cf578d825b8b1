//! Shared task queue
//!
//! Pending tasks live in one unordered collection. Extraction picks uniformly at
//! random and marks the task in flight under the same lock, so a worker that sees
//! an empty queue with nothing in flight knows the run is over.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error};

use crate::engine::task::{TaskBody, TaskId, TaskRecord};

/// Budgets at or below this are treated as exhausted
pub const BUDGET_EPSILON: f64 = 1e-9;

/// Default attempt budget for new tasks
pub const DEFAULT_TASK_BUDGET: f64 = 10.0;

/// Result of waiting for work
#[derive(Debug)]
pub enum Extraction {
    /// A task is now in flight for the caller
    Task(TaskLease),
    /// Nothing pending and nothing in flight; the run is over
    Drained,
    /// The queue was closed
    Closed,
}

enum Take {
    Task(TaskLease),
    Empty,
    Drained,
    Closed,
}

/// What happened to a task handed back after a failure
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RequeueOutcome {
    Requeued { remaining: f64 },
    Abandoned,
}

/// Queue counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub enqueued: u64,
    pub abandoned: u64,
}

struct QueueState {
    pending: Vec<TaskRecord>,
    in_flight: usize,
    peak_in_flight: usize,
    enqueued: u64,
    abandoned: u64,
    closed: bool,
}

/// Unordered multiset of pending tasks shared by all workers
pub struct TaskQueue {
    state: Mutex<QueueState>,
    changed: Notify,
    next_id: AtomicU64,
    permits: Arc<Semaphore>,
}

impl TaskQueue {
    /// Create a queue that allows at most `max_in_flight` tasks out at once
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: Vec::new(),
                in_flight: 0,
                peak_in_flight: 0,
                enqueued: 0,
                abandoned: 0,
                closed: false,
            }),
            changed: Notify::new(),
            next_id: AtomicU64::new(1),
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    /// Add a task with the given attempt budget
    pub fn enqueue(&self, body: Arc<dyn TaskBody>, budget: f64) -> TaskId {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(task = %id, description = %body.describe(), budget, "Enqueued task");

        {
            let mut state = self.state.lock();
            state.pending.push(TaskRecord {
                id,
                body,
                attempts_remaining: budget,
                attempts: 0,
            });
            state.enqueued += 1;
        }

        self.changed.notify_waiters();
        id
    }

    /// Take a random pending task without waiting.
    ///
    /// Returns `None` when nothing is pending or the in-flight cap is reached.
    pub fn extract_one(self: &Arc<Self>) -> Option<TaskLease> {
        let permit = self.permits.clone().try_acquire_owned().ok()?;
        match self.extract_with(permit) {
            Take::Task(lease) => Some(lease),
            Take::Empty | Take::Drained | Take::Closed => None,
        }
    }

    /// Wait until a task can be taken, the queue drains, or the queue is closed
    pub async fn next(self: &Arc<Self>) -> Extraction {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state.lock().closed {
                return Extraction::Closed;
            }

            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Extraction::Closed,
            };

            match self.extract_with(permit) {
                Take::Task(lease) => return Extraction::Task(lease),
                Take::Drained => {
                    // Wake the other idle workers so they observe the drain too
                    self.changed.notify_waiters();
                    return Extraction::Drained;
                }
                Take::Closed => return Extraction::Closed,
                // A task in flight may still spawn children or be requeued
                Take::Empty => notified.await,
            }
        }
    }

    fn extract_with(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> Take {
        let mut state = self.state.lock();
        if state.closed {
            return Take::Closed;
        }
        if state.pending.is_empty() {
            return if state.in_flight == 0 {
                Take::Drained
            } else {
                Take::Empty
            };
        }

        let index = rand::thread_rng().gen_range(0..state.pending.len());
        let mut record = state.pending.swap_remove(index);
        record.attempts += 1;
        state.in_flight += 1;
        state.peak_in_flight = state.peak_in_flight.max(state.in_flight);

        Take::Task(TaskLease {
            queue: Arc::clone(self),
            record: Some(record),
            _permit: permit,
        })
    }

    /// Hand a leased task back. `requeue` goes back to pending in the same critical
    /// section that ends the lease.
    fn settle(&self, requeue: Option<TaskRecord>) {
        {
            let mut state = self.state.lock();
            if let Some(record) = requeue {
                state.pending.push(record);
            }
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.changed.notify_waiters();
    }

    fn count_abandoned(&self) {
        self.state.lock().abandoned += 1;
    }

    /// Stop handing out tasks and wake every waiter
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.permits.close();
        self.changed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of pending tasks
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            pending: state.pending.len(),
            in_flight: state.in_flight,
            peak_in_flight: state.peak_in_flight,
            enqueued: state.enqueued,
            abandoned: state.abandoned,
        }
    }
}

/// Exclusive claim on one in-flight task.
///
/// Consuming the lease through `complete`, `requeue` or `release` ends the claim.
/// Dropping it unconsumed (a crashed worker) ends the claim and loses the task.
pub struct TaskLease {
    queue: Arc<TaskQueue>,
    record: Option<TaskRecord>,
    _permit: OwnedSemaphorePermit,
}

impl TaskLease {
    pub fn record(&self) -> &TaskRecord {
        // Only `take`n by the consuming methods, which never return the lease
        self.record.as_ref().unwrap_or_else(|| unreachable!("lease already settled"))
    }

    pub fn id(&self) -> TaskId {
        self.record().id
    }

    /// The task succeeded; it leaves the queue for good
    pub fn complete(mut self) {
        self.record.take();
        self.queue.settle(None);
    }

    /// The task failed; charge `penalty` against its budget and requeue it if any
    /// budget is left
    pub fn requeue(mut self, penalty: f64) -> RequeueOutcome {
        let Some(mut record) = self.record.take() else {
            return RequeueOutcome::Abandoned;
        };

        record.attempts_remaining -= penalty.max(0.0);
        if record.attempts_remaining <= BUDGET_EPSILON {
            self.queue.count_abandoned();
            self.queue.settle(None);
            return RequeueOutcome::Abandoned;
        }

        let remaining = record.attempts_remaining;
        self.queue.settle(Some(record));
        RequeueOutcome::Requeued { remaining }
    }

    /// Put the task back untouched (used when shutting down mid-execution)
    pub fn release(mut self) {
        let record = self.record.take();
        self.queue.settle(record);
    }
}

impl fmt::Debug for TaskLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskLease").field("record", &self.record).finish()
    }
}

impl Drop for TaskLease {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            error!(task = %record.id, description = %record.body.describe(), "Task lost with its worker");
            self.queue.count_abandoned();
            self.queue.settle(None);
        }
    }
}

/// Handle for enqueueing tasks, shared with task bodies
#[derive(Clone)]
pub struct TaskFactory {
    queue: Arc<TaskQueue>,
    default_budget: f64,
}

impl TaskFactory {
    pub fn new(queue: Arc<TaskQueue>, default_budget: f64) -> Self {
        Self {
            queue,
            default_budget,
        }
    }

    /// Enqueue with the default budget
    pub fn spawn<T: TaskBody + 'static>(&self, body: T) -> TaskId {
        self.queue.enqueue(Arc::new(body), self.default_budget)
    }

    pub fn spawn_with_budget<T: TaskBody + 'static>(&self, body: T, budget: f64) -> TaskId {
        self.queue.enqueue(Arc::new(body), budget)
    }

    pub fn spawn_arc(&self, body: Arc<dyn TaskBody>) -> TaskId {
        self.queue.enqueue(body, self.default_budget)
    }

    pub fn default_budget(&self) -> f64 {
        self.default_budget
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }
}
