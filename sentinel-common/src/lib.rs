#[macro_use]
extern crate slog_scope;

mod metrics;
pub mod trace;

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use actix_web::web;
use serde::{Deserialize, Serialize};

pub use metrics::{Metrics, MetricsError};

#[macro_export]
macro_rules! from_error {
    ($from:ty, $to:ty, $to_kind:expr) => {
        impl From<$from> for $to {
            fn from(inner: $from) -> $to {
                $to_kind(inner).into()
            }
        }
    };
}

#[macro_export]
macro_rules! impl_fmt_display {
    ($error:ty, $kind:ty) => {
        impl fmt::Display for $error {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.kind, formatter)
            }
        }
    };
}

pub trait ReportableError {
    fn error_backtrace(&self) -> String;
    fn metric_label(&self) -> Option<String>;
}

/// Types that implement this trait can represent internal errors.
pub trait InternalError {
    /// Constructs an internal error with the given error message.
    fn internal_error(message: String) -> Self;
}

/// The identity a request acts under, derived from a validated bearer token.
///
/// A context with `is_system` set, or whose roles include `admin`, may cross
/// tenant boundaries; every other context is confined to its own tenant.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct TenantContext {
    pub tenant_id: String,
    pub user_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub is_system: bool,
}

impl TenantContext {
    pub fn new(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_owned(),
            ..Default::default()
        }
    }

    /// Whether this context may read or write rows belonging to `tenant_id`.
    pub fn can_access(&self, tenant_id: &str) -> bool {
        self.is_system
            || self.roles.iter().any(|role| role == "admin")
            || self.tenant_id == tenant_id
    }
}

/// A threadpool on which callers can spawn non-CPU-bound tasks that block their thread (this is
/// mostly useful for running I/O tasks). `BlockingThreadpool` intentionally does not implement
/// `Clone`: `Arc`s are not used internally, so a `BlockingThreadpool` should be instantiated once
/// and shared by passing around `Arc<BlockingThreadpool>`s.
#[derive(Debug, Default)]
pub struct BlockingThreadpool {
    spawned_tasks: AtomicU64,
}

impl BlockingThreadpool {
    /// Runs a function as a task on the blocking threadpool.
    ///
    /// WARNING: Spawning a blocking task through means other than calling this method will
    /// result in inaccurate threadpool metrics being reported. If you want to spawn a task on
    /// the blocking threadpool, you **must** use this function.
    pub async fn spawn<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: fmt::Debug + Send + InternalError + 'static,
    {
        self.spawned_tasks.fetch_add(1, Ordering::Relaxed);

        let result = web::block(f).await.unwrap_or_else(|_| {
            Err(E::internal_error(
                "Blocking threadpool operation canceled".to_owned(),
            ))
        });

        self.spawned_tasks.fetch_sub(1, Ordering::Relaxed);

        result
    }

    pub fn active_threads(&self) -> u64 {
        self.spawned_tasks.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::TenantContext;

    #[test]
    fn own_tenant_access_is_permitted() {
        let ctx = TenantContext::new("T1");
        assert!(ctx.can_access("T1"));
        assert!(!ctx.can_access("T2"));
    }

    #[test]
    fn admin_role_crosses_tenants() {
        let ctx = TenantContext {
            roles: vec!["viewer".to_owned(), "admin".to_owned()],
            ..TenantContext::new("T1")
        };
        assert!(ctx.can_access("T2"));
    }

    #[test]
    fn system_context_crosses_tenants() {
        let ctx = TenantContext {
            is_system: true,
            ..TenantContext::new("ops")
        };
        assert!(ctx.can_access("T2"));
    }
}
