//! Tenant-scoped reads for the HTTP surface and the writes the workers issue.
//!
//! Every read goes through the tenant guard; every operation observes
//! `db_query_duration` and counts toward `db_queries_total`.

use chrono::{DateTime, Utc};
use oracle::Connection;
use serde::Serialize;

use sentinel_common::{Metrics, TenantContext};

use crate::error::DbError;
use crate::guard::guard_query;
use crate::models::Event;

pub const STATUS_SQL: &str = "SELECT process_id, tenant_id, status, last_heartbeat, updated_at \
     FROM process_live_status WHERE process_id = :pid";

pub const PROCESSES_SQL: &str = "SELECT process_id, tenant_id, process_name, status, started_at, updated_at \
     FROM process_registry ORDER BY updated_at DESC FETCH FIRST :lim ROWS ONLY";

pub const LOGS_SQL: &str = "SELECT log_level, event_type, component, message, details_json, \
      correlation_id, logged_at \
     FROM process_logs WHERE process_id = :pid \
     ORDER BY logged_at DESC FETCH FIRST :lim ROWS ONLY";

const UPSERT_LIVE_STATUS_SQL: &str = "MERGE INTO process_live_status t \
     USING (SELECT :pid AS process_id, :tenant AS tenant_id FROM dual) s \
     ON (t.process_id = s.process_id AND t.tenant_id = s.tenant_id) \
     WHEN MATCHED THEN UPDATE SET \
       t.status = :status, t.last_heartbeat = :event_ts, t.updated_at = SYSTIMESTAMP \
     WHEN NOT MATCHED THEN INSERT \
       (process_id, tenant_id, status, last_heartbeat, created_at, updated_at) \
       VALUES (s.process_id, s.tenant_id, :status, :event_ts, SYSTIMESTAMP, SYSTIMESTAMP)";

const REGISTRY_TRANSITION_SQL: &str = "UPDATE process_registry SET status = :status, updated_at = SYSTIMESTAMP \
     WHERE process_id = :pid AND tenant_id = :tenant";

const RECORD_METRIC_SQL: &str = "MERGE INTO process_metrics t \
     USING (SELECT :pid AS process_id, :tenant AS tenant_id, :name AS metric_name FROM dual) s \
     ON (t.process_id = s.process_id AND t.tenant_id = s.tenant_id \
         AND t.metric_name = s.metric_name) \
     WHEN MATCHED THEN UPDATE SET \
       t.metric_value = t.metric_value + :increment, t.updated_at = SYSTIMESTAMP \
     WHEN NOT MATCHED THEN INSERT \
       (process_id, tenant_id, metric_name, metric_value, updated_at) \
       VALUES (s.process_id, s.tenant_id, s.metric_name, :increment, SYSTIMESTAMP)";

const MARK_STALLED_SQL: &str = "UPDATE process_live_status SET status = 'STALLED', updated_at = SYSTIMESTAMP \
     WHERE status = 'RUNNING' \
       AND last_heartbeat < SYSTIMESTAMP - NUMTODSINTERVAL(:secs, 'SECOND')";

const DELETE_EXPIRED_SQL: &str = "DELETE FROM process_live_status \
     WHERE status IN ('COMPLETED', 'FAILED', 'STALLED') \
       AND updated_at < SYSTIMESTAMP - NUMTODSINTERVAL(:secs, 'SECOND')";

#[derive(Clone, Debug, Serialize)]
pub struct ProcessStatus {
    pub process_id: String,
    pub tenant_id: String,
    pub status: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProcessSummary {
    pub process_id: String,
    pub tenant_id: String,
    pub process_name: Option<String>,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct LogEntry {
    pub log_level: String,
    pub event_type: Option<String>,
    pub component: Option<String>,
    pub message: String,
    pub details_json: Option<String>,
    pub correlation_id: Option<String>,
    pub logged_at: Option<DateTime<Utc>>,
}

pub fn fetch_status(
    conn: &Connection,
    metrics: &Metrics,
    context: &TenantContext,
    target_tenant: &str,
    process_id: &str,
) -> Result<Option<ProcessStatus>, DbError> {
    let guarded = guard_query(STATUS_SQL, context, target_tenant)?;
    let _timer = metrics.db_query_timer();

    let rows = conn.query_named(
        &guarded.sql,
        &[("tenant_id", &guarded.tenant_id), ("pid", &process_id)],
    )?;
    for row_result in rows {
        let row = row_result?;
        return Ok(Some(ProcessStatus {
            process_id: row.get("PROCESS_ID")?,
            tenant_id: row.get("TENANT_ID")?,
            status: row.get("STATUS")?,
            last_heartbeat: row.get("LAST_HEARTBEAT")?,
            updated_at: row.get("UPDATED_AT")?,
        }));
    }
    Ok(None)
}

pub fn fetch_processes(
    conn: &Connection,
    metrics: &Metrics,
    context: &TenantContext,
    target_tenant: &str,
    limit: u32,
) -> Result<Vec<ProcessSummary>, DbError> {
    let guarded = guard_query(PROCESSES_SQL, context, target_tenant)?;
    let _timer = metrics.db_query_timer();

    let mut processes = Vec::new();
    let rows = conn.query_named(
        &guarded.sql,
        &[("tenant_id", &guarded.tenant_id), ("lim", &limit)],
    )?;
    for row_result in rows {
        let row = row_result?;
        processes.push(ProcessSummary {
            process_id: row.get("PROCESS_ID")?,
            tenant_id: row.get("TENANT_ID")?,
            process_name: row.get("PROCESS_NAME")?,
            status: row.get("STATUS")?,
            started_at: row.get("STARTED_AT")?,
            updated_at: row.get("UPDATED_AT")?,
        });
    }
    Ok(processes)
}

pub fn fetch_logs(
    conn: &Connection,
    metrics: &Metrics,
    context: &TenantContext,
    target_tenant: &str,
    process_id: &str,
    limit: u32,
) -> Result<Vec<LogEntry>, DbError> {
    let guarded = guard_query(LOGS_SQL, context, target_tenant)?;
    let _timer = metrics.db_query_timer();

    let mut entries = Vec::new();
    let rows = conn.query_named(
        &guarded.sql,
        &[
            ("tenant_id", &guarded.tenant_id),
            ("pid", &process_id),
            ("lim", &limit),
        ],
    )?;
    for row_result in rows {
        let row = row_result?;
        entries.push(LogEntry {
            log_level: row.get("LOG_LEVEL")?,
            event_type: row.get("EVENT_TYPE")?,
            component: row.get("COMPONENT")?,
            message: row.get("MESSAGE")?,
            details_json: row.get("DETAILS_JSON")?,
            correlation_id: row.get("CORRELATION_ID")?,
            logged_at: row.get("LOGGED_AT")?,
        });
    }
    Ok(entries)
}

/// Applies a lifecycle event: upserts `process_live_status`, mirrors the
/// transition into `process_registry`, and bumps the per-process event
/// counter in `process_metrics`. All three writes ride one transaction.
/// The status rows are idempotent under redelivery; the aggregation counter
/// is approximate, same stance as dropped log batches.
pub fn apply_event(conn: &Connection, metrics: &Metrics, event: &Event) -> Result<(), DbError> {
    let _timer = metrics.db_query_timer();
    let status = event.event_type.live_status();
    let metric_name = format!("events_{}", event.event_type.as_str().to_lowercase());

    conn.execute_named(
        UPSERT_LIVE_STATUS_SQL,
        &[
            ("pid", &event.process_id),
            ("tenant", &event.tenant_id),
            ("status", &status),
            ("event_ts", &event.timestamp_utc),
        ],
    )?;
    conn.execute_named(
        REGISTRY_TRANSITION_SQL,
        &[
            ("status", &status),
            ("pid", &event.process_id),
            ("tenant", &event.tenant_id),
        ],
    )?;
    conn.execute_named(
        RECORD_METRIC_SQL,
        &[
            ("pid", &event.process_id),
            ("tenant", &event.tenant_id),
            ("name", &metric_name),
            ("increment", &1i64),
        ],
    )?;
    conn.commit()?;
    Ok(())
}

/// Flags RUNNING processes whose heartbeat went quiet. Returns the number of
/// rows transitioned.
pub fn mark_stalled(
    conn: &Connection,
    metrics: &Metrics,
    stale_after_secs: u64,
) -> Result<u64, DbError> {
    let _timer = metrics.db_query_timer();
    let stmt = conn.execute_named(MARK_STALLED_SQL, &[("secs", &(stale_after_secs as i64))])?;
    let transitioned = stmt.row_count()?;
    conn.commit()?;
    Ok(transitioned)
}

/// Removes terminal live-status rows older than the retention window.
pub fn delete_expired(
    conn: &Connection,
    metrics: &Metrics,
    retention_secs: u64,
) -> Result<u64, DbError> {
    let _timer = metrics.db_query_timer();
    let stmt = conn.execute_named(DELETE_EXPIRED_SQL, &[("secs", &(retention_secs as i64))])?;
    let removed = stmt.row_count()?;
    conn.commit()?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::guard_query;

    #[test]
    fn status_template_scopes_before_the_existing_predicate() {
        let ctx = TenantContext::new("T1");
        let guarded = guard_query(STATUS_SQL, &ctx, "T1").unwrap();
        assert!(guarded
            .sql
            .contains("WHERE tenant_id = :tenant_id AND process_id = :pid"));
    }

    #[test]
    fn process_template_scopes_before_order_by() {
        let ctx = TenantContext::new("T1");
        let guarded = guard_query(PROCESSES_SQL, &ctx, "T1").unwrap();
        let where_at = guarded.sql.find("WHERE tenant_id = :tenant_id").unwrap();
        let order_at = guarded.sql.find("ORDER BY").unwrap();
        assert!(where_at < order_at, "{}", guarded.sql);
    }

    #[test]
    fn log_template_keeps_its_fetch_clause_after_scoping() {
        let ctx = TenantContext::new("T1");
        let guarded = guard_query(LOGS_SQL, &ctx, "T1").unwrap();
        assert!(guarded.sql.contains("tenant_id = :tenant_id AND process_id = :pid"));
        assert!(guarded.sql.ends_with("FETCH FIRST :lim ROWS ONLY"));
    }
}
