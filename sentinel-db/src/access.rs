//! The read surface the HTTP layer talks to.
//!
//! Handlers depend on this trait instead of the session pool so the web
//! layer can be exercised without a database behind it.

use std::sync::Arc;

use sentinel_common::{Metrics, TenantContext};

use crate::error::DbError;
use crate::pool::{PoolStats, SessionPool};
use crate::queries::{self, LogEntry, ProcessStatus, ProcessSummary};

pub trait Db: Send + Sync {
    /// Readiness probe: checks out a session and returns it immediately.
    fn check(&self) -> Result<(), DbError>;

    fn get_status(
        &self,
        context: &TenantContext,
        target_tenant: &str,
        process_id: &str,
    ) -> Result<Option<ProcessStatus>, DbError>;

    fn get_processes(
        &self,
        context: &TenantContext,
        target_tenant: &str,
        limit: u32,
    ) -> Result<Vec<ProcessSummary>, DbError>;

    fn get_logs(
        &self,
        context: &TenantContext,
        target_tenant: &str,
        process_id: &str,
        limit: u32,
    ) -> Result<Vec<LogEntry>, DbError>;

    fn pool_stats(&self) -> PoolStats;
}

/// Production implementation: every call borrows a pooled session for its
/// own duration.
pub struct OracleDb {
    pool: Arc<SessionPool>,
    metrics: Metrics,
}

impl OracleDb {
    pub fn new(pool: Arc<SessionPool>, metrics: Metrics) -> Self {
        Self { pool, metrics }
    }
}

impl Db for OracleDb {
    fn check(&self) -> Result<(), DbError> {
        self.pool.acquire().map(drop)
    }

    fn get_status(
        &self,
        context: &TenantContext,
        target_tenant: &str,
        process_id: &str,
    ) -> Result<Option<ProcessStatus>, DbError> {
        let session = self.pool.acquire()?;
        queries::fetch_status(&session, &self.metrics, context, target_tenant, process_id)
    }

    fn get_processes(
        &self,
        context: &TenantContext,
        target_tenant: &str,
        limit: u32,
    ) -> Result<Vec<ProcessSummary>, DbError> {
        let session = self.pool.acquire()?;
        queries::fetch_processes(&session, &self.metrics, context, target_tenant, limit)
    }

    fn get_logs(
        &self,
        context: &TenantContext,
        target_tenant: &str,
        process_id: &str,
        limit: u32,
    ) -> Result<Vec<LogEntry>, DbError> {
        let session = self.pool.acquire()?;
        queries::fetch_logs(
            &session,
            &self.metrics,
            context,
            target_tenant,
            process_id,
            limit,
        )
    }

    fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}
