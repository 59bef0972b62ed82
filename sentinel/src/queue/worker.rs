//! Worker pool: fixed threads, each pinning one pooled session for its
//! lifetime, draining the task queue.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use sentinel_common::Metrics;
use sentinel_db::{queries, DbError, DbErrorKind, LogFlusher, Session, SessionPool};

use super::{Popped, Task, TaskKind, TaskPayload, TaskQueue};

/// RUNNING processes are flagged STALLED once their heartbeat is older than
/// this.
const HEARTBEAT_STALE_SECS: u64 = 300;

/// Terminal live-status rows are removed after the queue's retention window.
const STATUS_RETENTION_SECS: u64 = 86_400;

/// Executes popped tasks. One instance lives per worker thread.
pub trait TaskExecutor: Send {
    fn execute(&mut self, task: Task) -> Result<(), DbError>;

    /// Called when a pop times out with nothing to do.
    fn on_idle(&mut self) {}
}

#[derive(Clone, Copy, Debug)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub task_timeout: Duration,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WorkerPoolStats {
    pub configured: usize,
    pub active_workers: usize,
    pub completed: u64,
    pub failed: u64,
    pub total_duration_ns: u64,
}

#[derive(Debug, Default)]
struct SharedCounters {
    completed: AtomicU64,
    failed: AtomicU64,
    total_duration_ns: AtomicU64,
    failed_workers: AtomicU64,
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    tasks: Arc<TaskQueue>,
    counters: Arc<SharedCounters>,
    configured: usize,
}

impl WorkerPool {
    /// Spawns the configured number of workers. Start-up is all-or-nothing:
    /// if a thread fails to spawn, the shutdown flag is raised, the workers
    /// spawned so far are joined, and the error is returned.
    pub fn start<E, F>(
        config: WorkerPoolConfig,
        tasks: Arc<TaskQueue>,
        metrics: Metrics,
        make_executor: F,
    ) -> Result<WorkerPool, DbError>
    where
        E: TaskExecutor + 'static,
        F: Fn(usize) -> Result<E, DbError> + Send + Sync + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(SharedCounters::default());
        let make_executor = Arc::new(make_executor);

        let mut handles = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let spawned = thread::Builder::new()
                .name(format!("sentinel-worker-{}", index))
                .spawn({
                    let tasks = Arc::clone(&tasks);
                    let shutdown = Arc::clone(&shutdown);
                    let counters = Arc::clone(&counters);
                    let metrics = metrics.clone();
                    let make_executor = Arc::clone(&make_executor);
                    move || {
                        worker_loop(
                            index,
                            config.task_timeout,
                            &tasks,
                            &shutdown,
                            &counters,
                            &metrics,
                            make_executor.as_ref(),
                        )
                    }
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    shutdown.store(true, Ordering::SeqCst);
                    tasks.close();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(DbError::internal(&format!(
                        "failed to spawn worker {}: {}",
                        index, e
                    )));
                }
            }
        }

        Ok(WorkerPool {
            handles,
            shutdown,
            tasks,
            counters,
            configured: config.workers,
        })
    }

    pub fn stats(&self) -> WorkerPoolStats {
        let failed_workers = self.counters.failed_workers.load(Ordering::Relaxed) as usize;
        WorkerPoolStats {
            configured: self.configured,
            active_workers: self.configured.saturating_sub(failed_workers),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            total_duration_ns: self.counters.total_duration_ns.load(Ordering::Relaxed),
        }
    }

    /// Raises the shutdown flag and joins workers until `budget` elapses;
    /// threads still running past the deadline are abandoned.
    pub fn shutdown(mut self, budget: Duration) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.tasks.close();

        let deadline = Instant::now() + budget;
        let mut abandoned = 0usize;
        for handle in self.handles.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            warn!("abandoned {} worker thread(s) past the join budget", abandoned);
        }
    }
}

fn worker_loop<E, F>(
    index: usize,
    task_timeout: Duration,
    tasks: &TaskQueue,
    shutdown: &AtomicBool,
    counters: &SharedCounters,
    metrics: &Metrics,
    make_executor: &F,
) where
    E: TaskExecutor,
    F: Fn(usize) -> Result<E, DbError>,
{
    let mut executor = match make_executor(index) {
        Ok(executor) => executor,
        Err(e) => {
            counters.failed_workers.fetch_add(1, Ordering::Relaxed);
            error!("worker {} failed to acquire a session: {}", index, e);
            return;
        }
    };
    debug!("worker {} started", index);

    while !shutdown.load(Ordering::SeqCst) {
        match tasks.pop(task_timeout) {
            Popped::Task(mut task) => {
                let on_complete = task.on_complete.take();
                let kind = task.kind;

                metrics.worker_tasks_in_progress.inc();
                let started = Instant::now();
                let result = executor.execute(task);
                let elapsed = started.elapsed();
                metrics.worker_tasks_in_progress.dec();
                metrics.worker_tasks_total.inc();
                metrics.worker_task_duration.observe(elapsed.as_secs_f64());

                counters
                    .total_duration_ns
                    .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
                match &result {
                    Ok(()) => {
                        counters.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!("worker {} task {:?} failed: {}", index, kind, e);
                    }
                }
                if let Some(callback) = on_complete {
                    callback(result.is_ok());
                }
            }
            Popped::Timeout => executor.on_idle(),
            Popped::Closed => break,
        }
    }
    debug!("worker {} exiting", index);
}

/// The production executor: one pooled session held for the worker's
/// lifetime, replaced only after it has been retired by a dead-session
/// error.
pub struct DbExecutor {
    pool: Arc<SessionPool>,
    session: Option<Session>,
    flusher: Arc<LogFlusher>,
    metrics: Metrics,
    flush_interval: Duration,
}

impl DbExecutor {
    pub fn new(
        pool: Arc<SessionPool>,
        flusher: Arc<LogFlusher>,
        metrics: Metrics,
        flush_interval: Duration,
    ) -> Result<Self, DbError> {
        let session = pool.acquire()?;
        Ok(Self {
            pool,
            session: Some(session),
            flusher,
            metrics,
            flush_interval,
        })
    }

    fn ensure_session(&mut self) -> Result<(), DbError> {
        if self.session.is_none() {
            self.session = Some(self.pool.acquire()?);
        }
        Ok(())
    }

    fn run(&mut self, task: Task) -> Result<(), DbError> {
        self.ensure_session()?;
        let session = self.session.as_ref().expect("session just ensured");

        let result = match (task.kind, task.payload) {
            (TaskKind::ProcessEvent, TaskPayload::Event(event)) => {
                queries::apply_event(session, &self.metrics, &event)?;
                self.flusher.append(sentinel_db::LogRow::for_event(&event));
                if self.flusher.should_flush() {
                    self.flusher.flush(session).map(drop)
                } else {
                    Ok(())
                }
            }
            (TaskKind::StatusUpdate, TaskPayload::Event(event)) => {
                queries::apply_event(session, &self.metrics, &event)
            }
            (TaskKind::LogBatch, payload) => {
                if let TaskPayload::Rows(rows) = payload {
                    for row in rows {
                        self.flusher.append(row);
                    }
                }
                self.flusher.flush(session).map(drop)
            }
            (TaskKind::HeartbeatCheck, _) => {
                queries::mark_stalled(session, &self.metrics, HEARTBEAT_STALE_SECS).map(drop)
            }
            (TaskKind::CleanupExpired, _) => {
                queries::delete_expired(session, &self.metrics, STATUS_RETENTION_SECS).map(drop)
            }
            (TaskKind::Custom, _) => Ok(()),
            (kind, _) => Err(DbError::internal(&format!(
                "task {:?} arrived without its expected payload",
                kind
            ))),
        };

        if let Err(e) = &result {
            if let DbErrorKind::Oracle(driver_error) = e.kind() {
                session.note_error(driver_error);
            }
        }
        if session.is_retired() {
            self.session = None;
        }
        result
    }
}

impl TaskExecutor for DbExecutor {
    fn execute(&mut self, task: Task) -> Result<(), DbError> {
        self.run(task)
    }

    fn on_idle(&mut self) {
        // Time-based counterpart of `should_flush`: rows must not sit in the
        // buffer past the flush interval just because traffic went quiet.
        if !self.flusher.is_empty() && self.flusher.since_last_flush() >= self.flush_interval {
            if self.ensure_session().is_err() {
                return;
            }
            let session = self.session.as_ref().expect("session just ensured");
            let _ = self.flusher.flush(session);
            if session.is_retired() {
                self.session = None;
            }
        }
    }
}
