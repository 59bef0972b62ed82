//! Bulk log flusher: buffers rows, writes them with one array-DML round trip.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use oracle::Connection;

use crate::error::DbError;
use crate::models::LogRow;

const INSERT_LOG_ROW: &str = "INSERT INTO process_logs \
     (process_id, tenant_id, log_level, event_type, component, message, \
      details_json, stack_trace, correlation_id, span_id, trace_id, \
      event_duration_us, logged_at) \
     VALUES (:1, :2, :3, :4, :5, :6, :7, :8, :9, :10, :11, :12, SYSTIMESTAMP)";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlushStats {
    pub appended: u64,
    pub flushed_rows: u64,
    pub flushes: u64,
    pub flush_errors: u64,
    pub dropped_rows: u64,
}

#[derive(Debug, Default)]
struct FlushCounters {
    appended: AtomicU64,
    flushed_rows: AtomicU64,
    flushes: AtomicU64,
    flush_errors: AtomicU64,
    dropped_rows: AtomicU64,
}

pub struct LogFlusher {
    buffer: Mutex<Vec<LogRow>>,
    batch_size: usize,
    /// Serializes flushes so only one batch is in flight at a time.
    flush_serial: Mutex<()>,
    last_flush: Mutex<Instant>,
    counters: FlushCounters,
}

impl LogFlusher {
    pub fn new(batch_size: usize) -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            batch_size: batch_size.max(1),
            flush_serial: Mutex::new(()),
            last_flush: Mutex::new(Instant::now()),
            counters: FlushCounters::default(),
        }
    }

    /// Appends an owned copy of the row; the producer keeps its original.
    pub fn append(&self, row: LogRow) {
        self.counters.appended.fetch_add(1, Ordering::Relaxed);
        self.buffer.lock().expect("log buffer poisoned").push(row);
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().expect("log buffer poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn should_flush(&self) -> bool {
        self.len() >= self.batch_size
    }

    /// Seconds since the last successful or attempted flush.
    pub fn since_last_flush(&self) -> std::time::Duration {
        self.last_flush.lock().expect("flush clock poisoned").elapsed()
    }

    /// Writes the current buffer in one execute-many round trip and commits.
    /// The batch either lands wholly or is dropped; a dropped batch only
    /// surfaces through `flush_errors` and `dropped_rows`.
    pub fn flush(&self, conn: &Connection) -> Result<usize, DbError> {
        let _serial = self.flush_serial.lock().expect("flush serial poisoned");
        let rows = {
            let mut buffer = self.buffer.lock().expect("log buffer poisoned");
            std::mem::take(&mut *buffer)
        };
        *self.last_flush.lock().expect("flush clock poisoned") = Instant::now();
        if rows.is_empty() {
            return Ok(0);
        }

        match self.execute_batch(conn, &rows) {
            Ok(written) => {
                self.counters.flushes.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .flushed_rows
                    .fetch_add(written as u64, Ordering::Relaxed);
                Ok(written)
            }
            Err(e) => {
                self.counters.flush_errors.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .dropped_rows
                    .fetch_add(rows.len() as u64, Ordering::Relaxed);
                let _ = conn.rollback();
                warn!("log batch dropped"; "rows" => rows.len(), "error" => %e);
                Err(e)
            }
        }
    }

    fn execute_batch(&self, conn: &Connection, rows: &[LogRow]) -> Result<usize, DbError> {
        let mut batch = conn.batch(INSERT_LOG_ROW, rows.len()).build()?;
        for row in rows {
            batch.append_row(&[
                &row.process_id,
                &row.tenant_id,
                &row.log_level.as_str(),
                &row.event_type,
                &row.component,
                &row.message,
                &row.details_json,
                &row.stack_trace,
                &row.correlation_id,
                &row.span_id,
                &row.trace_id,
                &row.event_duration_us,
            ])?;
        }
        batch.execute()?;
        conn.commit()?;
        Ok(rows.len())
    }

    pub fn stats(&self) -> FlushStats {
        FlushStats {
            appended: self.counters.appended.load(Ordering::Relaxed),
            flushed_rows: self.counters.flushed_rows.load(Ordering::Relaxed),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
            flush_errors: self.counters.flush_errors.load(Ordering::Relaxed),
            dropped_rows: self.counters.dropped_rows.load(Ordering::Relaxed),
        }
    }

    /// Takes ownership of the buffered rows, leaving an empty buffer behind.
    #[cfg(test)]
    fn take_batch(&self) -> Vec<LogRow> {
        let mut buffer = self.buffer.lock().expect("log buffer poisoned");
        std::mem::take(&mut *buffer)
    }
}
