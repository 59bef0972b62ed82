//! Oracle-facing layer: session pool, bulk log flusher, tenant guard, and
//! the queries the service issues.

#[macro_use]
extern crate slog_scope;

pub mod access;
pub mod error;
pub mod flusher;
pub mod guard;
pub mod models;
pub mod pool;
pub mod queries;

pub use access::{Db, OracleDb};
pub use error::{retires_session, DbError, DbErrorKind};
pub use queries::{LogEntry, ProcessStatus, ProcessSummary};
pub use flusher::{FlushStats, LogFlusher};
pub use guard::{guard_query, inject_tenant_filter, GuardedQuery, TENANT_COLUMN};
pub use models::{Event, EventType, LogLevel, LogRow};
pub use pool::{AcquireMode, PoolConfig, PoolStats, Session, SessionPool};
