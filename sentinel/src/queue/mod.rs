//! The in-memory hand-off between the AQ listener and the worker pool.

pub mod listener;
pub mod worker;

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use sentinel_db::{Event, LogRow};

/// What a task asks a worker to do.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskKind {
    LogBatch,
    StatusUpdate,
    HeartbeatCheck,
    ProcessEvent,
    CleanupExpired,
    Custom,
}

/// The data riding along with a task. Opaque to the queue itself.
pub enum TaskPayload {
    Empty,
    Event(Event),
    Rows(Vec<LogRow>),
    Json(serde_json::Value),
}

/// Invoked after execution with `true` on success. The submitter owns the
/// task until it is pushed; after that the queue owns it until a worker pops
/// it.
pub type CompletionCallback = Box<dyn FnOnce(bool) + Send>;

pub struct Task {
    pub kind: TaskKind,
    pub payload: TaskPayload,
    pub on_complete: Option<CompletionCallback>,
}

impl Task {
    pub fn new(kind: TaskKind, payload: TaskPayload) -> Self {
        Self {
            kind,
            payload,
            on_complete: None,
        }
    }

    pub fn with_callback(mut self, callback: CompletionCallback) -> Self {
        self.on_complete = Some(callback);
        self
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("kind", &self.kind)
            .field("has_callback", &self.on_complete.is_some())
            .finish()
    }
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum PushError {
    #[error("task queue is full")]
    QueueFull,
    #[error("task queue is closed")]
    Closed,
}

/// Result of a timed pop.
pub enum Popped {
    Task(Task),
    Timeout,
    Closed,
}

struct QueueState {
    items: VecDeque<Task>,
    closed: bool,
}

/// Bounded MPMC FIFO. `push` never blocks; `pop` blocks up to its timeout.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.max(1)),
                closed: false,
            }),
            available: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, task: Task) -> Result<(), PushError> {
        let mut state = self.state.lock().expect("task queue poisoned");
        if state.closed {
            return Err(PushError::Closed);
        }
        if state.items.len() >= self.capacity {
            return Err(PushError::QueueFull);
        }
        state.items.push_back(task);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Pops the oldest task, waiting up to `timeout` for one to arrive.
    pub fn pop(&self, timeout: Duration) -> Popped {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("task queue poisoned");
        loop {
            if let Some(task) = state.items.pop_front() {
                return Popped::Task(task);
            }
            if state.closed {
                return Popped::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return Popped::Timeout;
            }
            let (next, wait_result) = self
                .available
                .wait_timeout(state, deadline - now)
                .expect("task queue poisoned");
            state = next;
            if wait_result.timed_out() && state.items.is_empty() {
                return if state.closed {
                    Popped::Closed
                } else {
                    Popped::Timeout
                };
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("task queue poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks the queue closed and wakes every waiting consumer. Remaining
    /// tasks stay poppable; new pushes fail.
    pub fn close(&self) {
        self.state.lock().expect("task queue poisoned").closed = true;
        self.available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn task(kind: TaskKind) -> Task {
        Task::new(kind, TaskPayload::Empty)
    }

    #[test]
    fn pops_are_fifo_across_pushes() {
        let queue = TaskQueue::new(8);
        queue.push(task(TaskKind::ProcessEvent)).unwrap();
        queue.push(task(TaskKind::LogBatch)).unwrap();
        queue.push(task(TaskKind::CleanupExpired)).unwrap();

        let kinds: Vec<TaskKind> = (0..3)
            .map(|_| match queue.pop(Duration::from_millis(10)) {
                Popped::Task(t) => t.kind,
                _ => panic!("expected a task"),
            })
            .collect();
        assert_eq!(
            kinds,
            [TaskKind::ProcessEvent, TaskKind::LogBatch, TaskKind::CleanupExpired]
        );
    }

    #[test]
    fn push_fails_fast_when_full() {
        let queue = TaskQueue::new(2);
        queue.push(task(TaskKind::Custom)).unwrap();
        queue.push(task(TaskKind::Custom)).unwrap();
        assert_eq!(
            queue.push(task(TaskKind::Custom)).unwrap_err(),
            PushError::QueueFull
        );
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn pop_times_out_after_roughly_the_requested_wait() {
        let queue = TaskQueue::new(2);
        let started = Instant::now();
        assert!(matches!(
            queue.pop(Duration::from_millis(50)),
            Popped::Timeout
        ));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(50), "{:?}", waited);
        assert!(waited < Duration::from_millis(500), "{:?}", waited);
    }

    #[test]
    fn concurrent_pops_receive_distinct_tasks() {
        let queue = Arc::new(TaskQueue::new(16));
        let popped = Arc::new(AtomicUsize::new(0));

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let popped = Arc::clone(&popped);
                thread::spawn(move || {
                    while let Popped::Task(_) = queue.pop(Duration::from_millis(200)) {
                        popped.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for _ in 0..20 {
            queue.push(task(TaskKind::ProcessEvent)).unwrap();
        }
        for consumer in consumers {
            consumer.join().unwrap();
        }
        assert_eq!(popped.load(Ordering::SeqCst), 20);
        assert!(queue.is_empty());
    }

    #[test]
    fn close_wakes_waiting_consumers_and_rejects_pushes() {
        let queue = Arc::new(TaskQueue::new(4));
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || matches!(queue.pop(Duration::from_secs(5)), Popped::Closed))
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert!(waiter.join().unwrap());
        assert_eq!(
            queue.push(task(TaskKind::Custom)).unwrap_err(),
            PushError::Closed
        );
    }

    #[test]
    fn remaining_tasks_stay_poppable_after_close() {
        let queue = TaskQueue::new(4);
        queue.push(task(TaskKind::LogBatch)).unwrap();
        queue.close();
        assert!(matches!(
            queue.pop(Duration::from_millis(10)),
            Popped::Task(_)
        ));
        assert!(matches!(queue.pop(Duration::from_millis(10)), Popped::Closed));
    }

    #[test]
    fn callbacks_ride_along_with_their_task() {
        let queue = TaskQueue::new(4);
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&fired);
        queue
            .push(
                task(TaskKind::Custom)
                    .with_callback(Box::new(move |ok| {
                        if ok {
                            handle.fetch_add(1, Ordering::SeqCst);
                        }
                    })),
            )
            .unwrap();

        match queue.pop(Duration::from_millis(10)) {
            Popped::Task(mut t) => {
                let callback = t.on_complete.take().unwrap();
                callback(true);
            }
            _ => panic!("expected a task"),
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
