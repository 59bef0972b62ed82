//! AQ listener: a single thread dequeuing typed event objects under
//! visibility-on-commit and handing them to the worker pool.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use oracle::aq::{DeqNavigation, Queue, Visibility};
use oracle::sql_type::Object;

use sentinel_common::Metrics;
use sentinel_db::{DbError, DbErrorKind, Event, Session, SessionPool};

use super::{PushError, Task, TaskKind, TaskPayload, TaskQueue};

/// Back-off after a dequeue failure or a failed acquire.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Push maintenance tasks after this many consecutive empty wait windows
/// (60 windows at the default 5 s wait is roughly every five minutes).
const MAINTENANCE_IDLE_CYCLES: u32 = 60;

#[derive(Clone, Debug)]
pub struct ListenerConfig {
    pub queue_name: String,
    pub payload_type: String,
    pub wait: Duration,
}

impl ListenerConfig {
    pub fn new(queue_name: &str, wait: Duration) -> Self {
        Self {
            queue_name: queue_name.to_owned(),
            payload_type: "SENTINEL_EVENT_T".to_owned(),
            wait,
        }
    }
}

pub struct AqListener {
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    errors: Arc<AtomicU64>,
    wait: Duration,
}

impl AqListener {
    pub fn start(
        config: ListenerConfig,
        pool: Arc<SessionPool>,
        tasks: Arc<TaskQueue>,
        metrics: Metrics,
    ) -> Result<AqListener, DbError> {
        let running = Arc::new(AtomicBool::new(true));
        let errors = Arc::new(AtomicU64::new(0));
        let wait = config.wait;

        let handle = thread::Builder::new()
            .name("sentinel-aq-listener".to_owned())
            .spawn({
                let running = Arc::clone(&running);
                let errors = Arc::clone(&errors);
                move || run(config, pool, tasks, metrics, running, errors)
            })
            .map_err(|e| DbError::internal(&format!("failed to spawn listener: {}", e)))?;

        Ok(AqListener {
            handle: Some(handle),
            running,
            errors,
            wait,
        })
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Raises the stop flag and joins. Worst case the loop is blocked in a
    /// dequeue for the full wait window plus the error back-off, so the join
    /// deadline is `wait + 1 s` on top of the caller's budget.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let deadline = Instant::now() + self.wait + ERROR_BACKOFF;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("abandoning listener thread past its join deadline");
            }
        }
    }
}

fn run(
    config: ListenerConfig,
    pool: Arc<SessionPool>,
    tasks: Arc<TaskQueue>,
    metrics: Metrics,
    running: Arc<AtomicBool>,
    errors: Arc<AtomicU64>,
) {
    info!("queue listener started"; "queue" => &config.queue_name);
    let mut idle_cycles = 0u32;

    while running.load(Ordering::SeqCst) {
        let session = match pool.acquire() {
            Ok(session) => session,
            Err(e) => {
                // Exhaustion is back-pressure, not a fault; everything else
                // counts.
                if !e.is_pool_exhausted() {
                    errors.fetch_add(1, Ordering::Relaxed);
                }
                warn!("listener could not acquire a session: {}", e);
                thread::sleep(ERROR_BACKOFF);
                continue;
            }
        };

        if let Err(e) = serve_session(
            &config,
            &session,
            &tasks,
            &metrics,
            &running,
            &mut idle_cycles,
        ) {
            errors.fetch_add(1, Ordering::Relaxed);
            if let DbErrorKind::Oracle(driver_error) = e.kind() {
                session.note_error(driver_error);
            }
            error!("listener dequeue cycle failed: {}", e);
            thread::sleep(ERROR_BACKOFF);
        }
        // The session guard drops here: back to the pool, or discarded when
        // the error retired it.
    }
    info!("queue listener stopped");
}

/// Runs dequeue iterations on one borrowed session until the stop flag is
/// raised or the session errors out.
fn serve_session(
    config: &ListenerConfig,
    session: &Session,
    tasks: &TaskQueue,
    metrics: &Metrics,
    running: &AtomicBool,
    idle_cycles: &mut u32,
) -> Result<(), DbError> {
    // The object type descriptor is cached per session by the driver, so the
    // lookup is only a round trip on the first iteration.
    let payload_type = session.object_type(&config.payload_type)?;
    let mut queue: Queue<Object> = Queue::new(session.conn(), &config.queue_name, &payload_type)?;
    {
        let options = queue.deq_options()?;
        options.set_navigation(&DeqNavigation::FirstMessage)?;
        options.set_visibility(&Visibility::OnCommit)?;
        options.set_wait(&config.wait)?;
    }

    while running.load(Ordering::SeqCst) {
        // Dequeue-many exists, but one message per iteration keeps the
        // commit boundary and queue ordering trivially aligned.
        let message = match queue.dequeue() {
            Ok(message) => message,
            Err(e) => {
                let e: DbError = e.into();
                if e.is_dequeue_timeout() {
                    *idle_cycles += 1;
                    if *idle_cycles % MAINTENANCE_IDLE_CYCLES == 0 {
                        push_maintenance(tasks);
                    }
                    continue;
                }
                return Err(e);
            }
        };

        metrics.queue_events_received_total.inc();
        *idle_cycles = 0;

        let event = match Event::from_object(&message.payload()?) {
            Ok(event) => event,
            Err(e) => {
                // Roll back so redelivery counts against the queue's retry
                // budget and the message lands in the dead-letter queue.
                metrics.queue_events_failed_total.inc();
                warn!("malformed event returned to the queue: {}", e);
                session.rollback()?;
                thread::sleep(ERROR_BACKOFF);
                continue;
            }
        };

        match dispatch_event(event, tasks, metrics) {
            Ok(()) => {
                // The commit is what removes the message from the queue.
                session.commit()?;
                metrics.queue_events_processed_total.inc();
            }
            Err(e) => {
                metrics.queue_events_failed_total.inc();
                warn!("task queue rejected event, message returned to the queue: {}", e);
                session.rollback()?;
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
    Ok(())
}

/// Hands a dequeued event to the worker pool.
pub(crate) fn dispatch_event(
    event: Event,
    tasks: &TaskQueue,
    metrics: &Metrics,
) -> Result<(), PushError> {
    tasks.push(Task::new(TaskKind::ProcessEvent, TaskPayload::Event(event)))?;
    metrics.queue_depth.set(tasks.len() as i64);
    Ok(())
}

fn push_maintenance(tasks: &TaskQueue) {
    for kind in [TaskKind::HeartbeatCheck, TaskKind::CleanupExpired] {
        if tasks.push(Task::new(kind, TaskPayload::Empty)).is_err() {
            // A full queue means the workers are busy; maintenance waits for
            // the next idle window.
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Popped;
    use chrono::{TimeZone, Utc};
    use sentinel_db::EventType;

    fn sample_event() -> Event {
        Event {
            event_id: "E1".to_owned(),
            event_type: EventType::Completed,
            process_id: "P1".to_owned(),
            tenant_id: "T1".to_owned(),
            timestamp_utc: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            payload: None,
        }
    }

    #[test]
    fn dispatch_pushes_a_process_event_task() {
        let tasks = TaskQueue::new(4);
        let metrics = Metrics::new().unwrap();

        dispatch_event(sample_event(), &tasks, &metrics).unwrap();
        assert_eq!(metrics.queue_depth.get(), 1);

        match tasks.pop(Duration::from_millis(10)) {
            Popped::Task(task) => {
                assert_eq!(task.kind, TaskKind::ProcessEvent);
                match task.payload {
                    TaskPayload::Event(event) => assert_eq!(event.event_id, "E1"),
                    _ => panic!("expected an event payload"),
                }
            }
            _ => panic!("expected a task"),
        }
    }

    #[test]
    fn dispatch_surfaces_queue_overflow() {
        let tasks = TaskQueue::new(1);
        let metrics = Metrics::new().unwrap();

        dispatch_event(sample_event(), &tasks, &metrics).unwrap();
        assert_eq!(
            dispatch_event(sample_event(), &tasks, &metrics).unwrap_err(),
            PushError::QueueFull
        );
    }

    #[test]
    fn maintenance_pushes_both_housekeeping_tasks() {
        let tasks = TaskQueue::new(4);
        push_maintenance(&tasks);
        assert_eq!(tasks.len(), 2);

        let kinds: Vec<TaskKind> = (0..2)
            .map(|_| match tasks.pop(Duration::from_millis(10)) {
                Popped::Task(t) => t.kind,
                _ => panic!("expected a task"),
            })
            .collect();
        assert_eq!(kinds, [TaskKind::HeartbeatCheck, TaskKind::CleanupExpired]);
    }
}
