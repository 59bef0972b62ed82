//! Session pool (wallet-authenticated, bounded, homogeneous).
//!
//! Wraps the driver's OCI session pool: the driver owns every native handle
//! and performs ping-on-idle and max-lifetime retirement; this layer adds the
//! acquire/release accounting, the exhaustion classification, and retirement
//! tagging for sessions that observed a dead-session error.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use oracle::conn::CloseMode as ConnCloseMode;
use oracle::pool::{CloseMode, GetMode, Pool, PoolBuilder, PoolType};
use oracle::Connection;

use sentinel_settings::Settings;

use crate::error::{retires_session, DbError, DbErrorKind};

/// How callers wait when the pool is at `max_sessions`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AcquireMode {
    Wait,
    NoWait,
    #[default]
    TimedWait,
    ForceGet,
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub tns_name: String,
    /// Empty credentials select external (wallet) authentication.
    pub username: String,
    pub password: String,
    pub wallet_directory: PathBuf,
    pub min_sessions: u32,
    pub max_sessions: u32,
    pub session_increment: u32,
    pub ping_interval: Duration,
    pub wait_timeout: Duration,
    pub max_lifetime_session: Duration,
    pub get_mode: AcquireMode,
    pub homogeneous: bool,
}

impl PoolConfig {
    pub fn from_settings(settings: &Settings, wallet_directory: &Path) -> Self {
        Self {
            tns_name: settings.oracle_tns_name.clone().unwrap_or_default(),
            username: settings.oracle_user.clone().unwrap_or_default(),
            password: settings.oracle_password.clone().unwrap_or_default(),
            wallet_directory: wallet_directory.to_path_buf(),
            min_sessions: settings.oracle_pool_min_sessions,
            max_sessions: settings.oracle_pool_max_sessions,
            session_increment: settings.oracle_pool_session_increment,
            ping_interval: Duration::from_secs(settings.oracle_pool_ping_interval_seconds),
            wait_timeout: Duration::from_millis(settings.oracle_pool_wait_timeout_ms),
            max_lifetime_session: Duration::from_secs(
                settings.oracle_pool_max_lifetime_session_seconds,
            ),
            get_mode: AcquireMode::TimedWait,
            homogeneous: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
    pub open: u32,
    pub busy: u32,
    pub acquired_total: u64,
    pub released_total: u64,
    pub error_total: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    acquired_total: AtomicU64,
    released_total: AtomicU64,
    error_total: AtomicU64,
}

pub struct SessionPool {
    inner: Pool,
    counters: Arc<PoolCounters>,
    closed: AtomicBool,
}

impl SessionPool {
    /// Builds the pool. `TNS_ADMIN` must already point at the wallet
    /// directory so the alias in `tns_name` resolves; startup sets it from
    /// the resolved wallet before the first driver call.
    pub fn new(config: &PoolConfig) -> Result<Self, DbError> {
        let mut builder = PoolBuilder::new(
            config.username.as_str(),
            config.password.as_str(),
            config.tns_name.as_str(),
        );
        builder
            .min_connections(config.min_sessions)
            .max_connections(config.max_sessions)
            .connection_increment(config.session_increment);
        builder.ping_interval(Some(config.ping_interval))?;
        builder.max_lifetime_connection(config.max_lifetime_session)?;
        builder.get_mode(match config.get_mode {
            AcquireMode::Wait => GetMode::Wait,
            AcquireMode::NoWait => GetMode::NoWait,
            AcquireMode::TimedWait => GetMode::TimedWait(config.wait_timeout),
            AcquireMode::ForceGet => GetMode::ForceGet,
        });

        if config.username.is_empty() {
            // OCI requires a heterogeneous pool for externally authenticated
            // (auto-login wallet) sessions.
            builder.external_auth(true);
            builder.pool_type(PoolType::Heterogeneous);
        } else if config.homogeneous {
            builder.pool_type(PoolType::Homogeneous);
        }

        let inner = builder.build()?;
        Ok(Self {
            inner,
            counters: Arc::default(),
            closed: AtomicBool::new(false),
        })
    }

    /// Checks out a healthy session, waiting up to the configured timeout.
    pub fn acquire(&self) -> Result<Session, DbError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbErrorKind::PoolClosed.into());
        }

        match self.inner.get() {
            Ok(conn) => {
                self.counters.acquired_total.fetch_add(1, Ordering::Relaxed);
                Ok(Session {
                    conn: Some(conn),
                    retired: AtomicBool::new(false),
                    counters: Arc::clone(&self.counters),
                })
            }
            Err(e) => {
                self.counters.error_total.fetch_add(1, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            open: self.inner.open_count().unwrap_or(0),
            busy: self.inner.busy_count().unwrap_or(0),
            acquired_total: self.counters.acquired_total.load(Ordering::Relaxed),
            released_total: self.counters.released_total.load(Ordering::Relaxed),
            error_total: self.counters.error_total.load(Ordering::Relaxed),
        }
    }

    /// Drains outstanding sessions best-effort and destroys the pool.
    /// Subsequent `acquire` calls fail with `PoolClosed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Err(e) = self.inner.close(&CloseMode::Force) {
            warn!("session pool close reported: {}", e);
        }
    }
}

/// A short borrow of one pooled session. Dropping the guard returns the
/// session to the pool, or discards it when it has been tagged for
/// retirement.
pub struct Session {
    conn: Option<Connection>,
    retired: AtomicBool,
    counters: Arc<PoolCounters>,
}

impl Session {
    pub fn conn(&self) -> &Connection {
        self.conn.as_ref().expect("session already released")
    }

    /// Tags the session so release discards it instead of pooling it.
    pub fn mark_retired(&self) {
        self.retired.store(true, Ordering::Relaxed);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Relaxed)
    }

    /// Inspects a driver error and tags the session when the error means the
    /// underlying connection is gone.
    pub fn note_error(&self, err: &oracle::Error) {
        if retires_session(err) {
            self.mark_retired();
        }
    }
}

impl Deref for Session {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.counters.released_total.fetch_add(1, Ordering::Relaxed);
            if self.retired.load(Ordering::Relaxed) {
                if let Err(e) = conn.close_with_mode(ConnCloseMode::Drop) {
                    warn!("failed to drop retired session: {}", e);
                }
            }
            // A healthy session goes back to the pool on drop.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_carries_the_contract_defaults() {
        let settings = Settings::default();
        let config = PoolConfig::from_settings(&settings, Path::new("/wallet"));
        assert_eq!(config.min_sessions, 2);
        assert_eq!(config.max_sessions, 10);
        assert_eq!(config.ping_interval, Duration::from_secs(60));
        assert_eq!(config.wait_timeout, Duration::from_millis(5000));
        assert_eq!(config.max_lifetime_session, Duration::from_secs(3600));
        assert_eq!(config.get_mode, AcquireMode::TimedWait);
        assert!(config.homogeneous);
    }

    #[test]
    fn empty_credentials_select_external_auth() {
        let settings = Settings::default();
        let config = PoolConfig::from_settings(&settings, Path::new("/wallet"));
        assert!(config.username.is_empty());
        assert!(config.password.is_empty());
    }
}
