//! Wires the runtime subsystems together and owns their shutdown order.
//!
//! The session pool is the root resource: the listener, the workers, and the
//! flusher hold non-owning references to it and are stopped before it is
//! closed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use sentinel_common::Metrics;
use sentinel_db::{DbError, LogFlusher, SessionPool};
use sentinel_settings::Settings;

use crate::queue::listener::{AqListener, ListenerConfig};
use crate::queue::worker::{DbExecutor, WorkerPool, WorkerPoolConfig};
use crate::queue::TaskQueue;

/// Soft budget for joining the listener and the workers at shutdown; threads
/// still running past it are abandoned.
pub const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

/// Seconds between gauge refreshes.
const REPORT_INTERVAL: Duration = Duration::from_secs(10);

pub struct Engine {
    pool: Arc<SessionPool>,
    flusher: Arc<LogFlusher>,
    listener: AqListener,
    workers: WorkerPool,
    reporter_stop: Arc<AtomicBool>,
    reporter: Option<JoinHandle<()>>,
}

impl Engine {
    pub fn start(
        settings: &Settings,
        pool: Arc<SessionPool>,
        metrics: Metrics,
    ) -> Result<Engine, DbError> {
        let flusher = Arc::new(LogFlusher::new(settings.sentinel_log_batch_size));
        let tasks = Arc::new(TaskQueue::new(settings.sentinel_task_queue_capacity));

        let workers = WorkerPool::start(
            WorkerPoolConfig {
                workers: settings.sentinel_worker_threads,
                task_timeout: settings.task_timeout(),
            },
            Arc::clone(&tasks),
            metrics.clone(),
            {
                let pool = Arc::clone(&pool);
                let flusher = Arc::clone(&flusher);
                let metrics = metrics.clone();
                let flush_interval = settings.flush_interval();
                move |_| {
                    DbExecutor::new(
                        Arc::clone(&pool),
                        Arc::clone(&flusher),
                        metrics.clone(),
                        flush_interval,
                    )
                }
            },
        )?;

        let listener = match AqListener::start(
            ListenerConfig::new(&settings.sentinel_queue_name, settings.dequeue_wait()),
            Arc::clone(&pool),
            Arc::clone(&tasks),
            metrics.clone(),
        ) {
            Ok(listener) => listener,
            Err(e) => {
                workers.shutdown(SHUTDOWN_BUDGET);
                return Err(e);
            }
        };

        let reporter_stop = Arc::new(AtomicBool::new(false));
        let reporter = spawn_gauge_reporter(
            Arc::clone(&pool),
            Arc::clone(&tasks),
            metrics,
            Arc::clone(&reporter_stop),
        );

        Ok(Engine {
            pool,
            flusher,
            listener,
            workers,
            reporter_stop,
            reporter,
        })
    }

    /// Stops everything in the documented order: listener, workers, final
    /// flush, reporter, pool.
    pub fn shutdown(mut self) {
        info!("engine shutting down");
        let deadline = Instant::now() + SHUTDOWN_BUDGET;

        let listener_errors = self.listener.errors();
        self.listener.stop();

        let remaining = deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(100));
        let worker_stats = self.workers.stats();
        self.workers.shutdown(remaining);

        if !self.flusher.is_empty() {
            match self.pool.acquire() {
                Ok(session) => match self.flusher.flush(&session) {
                    Ok(written) => info!("final flush wrote {} log rows", written),
                    Err(e) => warn!("final flush failed: {}", e),
                },
                Err(e) => warn!("no session for the final flush: {}", e),
            }
        }

        self.reporter_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reporter.take() {
            let _ = handle.join();
        }

        self.pool.close();
        let flush_stats = self.flusher.stats();
        info!("engine stopped";
            "tasks_completed" => worker_stats.completed,
            "tasks_failed" => worker_stats.failed,
            "rows_flushed" => flush_stats.flushed_rows,
            "rows_dropped" => flush_stats.dropped_rows,
            "listener_errors" => listener_errors);
    }
}

fn spawn_gauge_reporter(
    pool: Arc<SessionPool>,
    tasks: Arc<TaskQueue>,
    metrics: Metrics,
    stop: Arc<AtomicBool>,
) -> Option<JoinHandle<()>> {
    thread::Builder::new()
        .name("sentinel-gauges".to_owned())
        .spawn(move || {
            let mut last_report: Option<Instant> = None;
            while !stop.load(Ordering::SeqCst) {
                if last_report.map_or(true, |at| at.elapsed() >= REPORT_INTERVAL) {
                    let stats = pool.stats();
                    metrics.pool_open_connections.set(stats.open as i64);
                    metrics.pool_busy_connections.set(stats.busy as i64);
                    metrics.queue_depth.set(tasks.len() as i64);
                    last_report = Some(Instant::now());
                }
                thread::sleep(Duration::from_millis(250));
            }
        })
        .map_err(|e| warn!("gauge reporter failed to start: {}", e))
        .ok()
}
