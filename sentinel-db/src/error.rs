use std::fmt;

use backtrace::Backtrace;
use http::StatusCode;
use sentinel_common::{impl_fmt_display, InternalError, ReportableError};
use thiserror::Error;

/// ORA codes that mean the session itself is gone and must not be reused.
const DEAD_SESSION_CODES: &[i32] = &[28, 1012, 1089, 3113, 3114, 3135, 12170, 12537, 12541];

/// ORA-25228: timeout or end-of-fetch during message dequeue. The expected
/// "no message in the wait window" signal, never an error.
const DEQ_TIMEOUT_CODES: &[i32] = &[25228, 25254];

/// ORA codes raised when a session pool acquire gives up waiting.
const POOL_WAIT_CODES: &[i32] = &[24457, 24459, 24496];

#[derive(Debug)]
pub struct DbError {
    kind: DbErrorKind,
    pub status: StatusCode,
    pub backtrace: Backtrace,
}

#[derive(Debug, Error)]
pub enum DbErrorKind {
    #[error("database error: {}", _0)]
    Oracle(oracle::Error),

    #[error("no free session within the acquire timeout")]
    PoolExhausted,

    #[error("the session pool has been closed")]
    PoolClosed,

    #[error("no message within the dequeue wait window")]
    DequeueTimeout,

    #[error("row not found")]
    NotFound,

    #[error("access to another tenant's rows was denied")]
    CrossTenantAccess,

    #[error("tenant guard misuse: {}", _0)]
    Guard(String),

    #[error("malformed queue event: {}", _0)]
    MalformedEvent(String),

    #[error("unexpected error: {}", _0)]
    Internal(String),
}

impl DbError {
    pub fn internal(msg: &str) -> Self {
        DbErrorKind::Internal(msg.to_owned()).into()
    }

    pub fn kind(&self) -> &DbErrorKind {
        &self.kind
    }

    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self.kind, DbErrorKind::PoolExhausted)
    }

    pub fn is_dequeue_timeout(&self) -> bool {
        matches!(self.kind, DbErrorKind::DequeueTimeout)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, DbErrorKind::NotFound)
    }

    pub fn is_cross_tenant(&self) -> bool {
        matches!(self.kind, DbErrorKind::CrossTenantAccess)
    }
}

impl From<DbErrorKind> for DbError {
    fn from(kind: DbErrorKind) -> Self {
        let status = match kind {
            DbErrorKind::NotFound => StatusCode::NOT_FOUND,
            DbErrorKind::CrossTenantAccess => StatusCode::FORBIDDEN,
            DbErrorKind::PoolExhausted | DbErrorKind::PoolClosed | DbErrorKind::Oracle(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        Self {
            kind,
            status,
            backtrace: Backtrace::new(),
        }
    }
}

impl From<oracle::Error> for DbError {
    fn from(err: oracle::Error) -> Self {
        match err.db_error().map(|db| db.code()) {
            Some(code) if DEQ_TIMEOUT_CODES.contains(&code) => DbErrorKind::DequeueTimeout.into(),
            Some(code) if POOL_WAIT_CODES.contains(&code) => DbErrorKind::PoolExhausted.into(),
            _ => DbErrorKind::Oracle(err).into(),
        }
    }
}

/// Whether the error means the session is unusable and should be dropped
/// instead of returned to the pool. The driver's recoverable flag marks a
/// dead-but-replayable session; known disconnect codes cover older servers
/// that never set it.
pub fn retires_session(err: &oracle::Error) -> bool {
    err.db_error()
        .map(|db| db.is_recoverable() || DEAD_SESSION_CODES.contains(&db.code()))
        .unwrap_or(false)
}

impl std::error::Error for DbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            DbErrorKind::Oracle(e) => Some(e),
            _ => None,
        }
    }
}

impl_fmt_display!(DbError, DbErrorKind);

impl InternalError for DbError {
    fn internal_error(message: String) -> Self {
        DbErrorKind::Internal(message).into()
    }
}

impl ReportableError for DbError {
    fn error_backtrace(&self) -> String {
        format!("{:#?}", self.backtrace)
    }

    fn metric_label(&self) -> Option<String> {
        match self.kind {
            DbErrorKind::PoolExhausted => Some("db.error.pool_exhausted".to_owned()),
            DbErrorKind::CrossTenantAccess => Some("db.error.cross_tenant".to_owned()),
            _ => None,
        }
    }
}
