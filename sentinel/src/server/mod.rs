//! Main application server.

use std::env;
use std::sync::Arc;

use actix_web::{dev, web, App, HttpServer};

use sentinel_auth::{Verifier, VerifyToken};
use sentinel_common::{BlockingThreadpool, Metrics};
use sentinel_db::pool::PoolConfig;
use sentinel_db::{Db, OracleDb, SessionPool};
use sentinel_settings::{wallet, Settings};

use crate::engine::Engine;
use crate::error::{ApiError, ApiErrorKind};

/// This is the global HTTP state object that will be made available to all
/// HTTP API calls.
#[derive(Clone)]
pub struct ServerState {
    pub db: Arc<dyn Db>,

    pub verifier: Arc<dyn VerifyToken>,

    /// Metric reporting
    pub metrics: Metrics,

    pub blocking_threadpool: Arc<BlockingThreadpool>,
}

#[macro_export]
macro_rules! build_app {
    ($state:expr) => {
        actix_web::App::new()
            .app_data(actix_web::web::Data::new($state))
            .wrap_fn($crate::web::track_http_metrics)
            .service(
                actix_web::web::resource("/health")
                    .route(actix_web::web::get().to($crate::web::handlers::health)),
            )
            .service(
                actix_web::web::resource("/healthz")
                    .route(actix_web::web::get().to($crate::web::handlers::health)),
            )
            .service(
                actix_web::web::resource("/ready")
                    .route(actix_web::web::get().to($crate::web::handlers::ready)),
            )
            .service(
                actix_web::web::resource("/readyz")
                    .route(actix_web::web::get().to($crate::web::handlers::ready)),
            )
            .service(
                actix_web::web::resource("/metrics")
                    .route(actix_web::web::get().to($crate::web::handlers::metrics)),
            )
            .service(
                actix_web::web::resource("/status/{process_id}")
                    .route(actix_web::web::get().to($crate::web::handlers::get_status)),
            )
            .service(
                actix_web::web::resource("/processes")
                    .route(actix_web::web::get().to($crate::web::handlers::list_processes)),
            )
            .service(
                actix_web::web::resource("/logs/{process_id}")
                    .route(actix_web::web::get().to($crate::web::handlers::get_logs)),
            )
    };
}

/// Everything `Server::with_settings` leaves running.
pub struct RunningService {
    pub server: dev::Server,
    pub metrics_server: dev::Server,
    pub engine: Engine,
}

pub struct Server;

impl Server {
    pub async fn with_settings(settings: Settings) -> Result<RunningService, ApiError> {
        let metrics = Metrics::new()?;

        let wallet = wallet::resolve_wallet(&settings)
            .map_err(|e| ApiError::from(ApiErrorKind::Internal(format!("wallet: {}", e))))?;
        // The driver resolves the TNS alias through the wallet directory.
        env::set_var("TNS_ADMIN", &wallet.directory);
        if !settings.ssl_server_dn_match() {
            warn!("server certificate DN matching is disabled");
        }

        let pool = Arc::new(SessionPool::new(&PoolConfig::from_settings(
            &settings,
            &wallet.directory,
        ))?);
        let verifier: Arc<dyn VerifyToken> = Arc::new(Verifier::new(
            settings.oauth2_jwk_set_uri.as_deref().unwrap_or_default(),
            settings.oauth2_issuer_uri.as_deref().unwrap_or_default(),
            &settings.oauth2_audience,
            settings.oauth2_enforce_signature,
        )?);

        let engine = Engine::start(&settings, Arc::clone(&pool), metrics.clone())?;

        let state = ServerState {
            db: Arc::new(OracleDb::new(Arc::clone(&pool), metrics.clone())),
            verifier,
            metrics: metrics.clone(),
            blocking_threadpool: Arc::new(BlockingThreadpool::default()),
        };

        let host = settings.sentinel_http_host.clone();
        let app_state = state.clone();
        let server = match HttpServer::new(move || build_app!(app_state.clone()))
            .bind((host.as_str(), settings.sentinel_http_port))
        {
            Ok(server) => server.run(),
            Err(e) => {
                engine.shutdown();
                return Err(e.into());
            }
        };

        // A bare second listener for the scrape port: metrics only.
        let scrape_state = state.clone();
        let metrics_server = match HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(scrape_state.clone()))
                .service(
                    web::resource("/metrics")
                        .route(web::get().to(crate::web::handlers::metrics)),
                )
        })
        .disable_signals()
        .bind((host.as_str(), settings.prometheus_metrics_port))
        {
            Ok(server) => server.run(),
            Err(e) => {
                engine.shutdown();
                return Err(e.into());
            }
        };

        Ok(RunningService {
            server,
            metrics_server,
            engine,
        })
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    use sentinel_common::TenantContext;
    use sentinel_db::{
        guard_query, queries::LOGS_SQL, queries::PROCESSES_SQL, queries::STATUS_SQL, DbError,
        DbErrorKind, LogEntry, PoolStats, ProcessStatus, ProcessSummary,
    };

    /// Canned data for the web layer: one RUNNING process `P1` per tenant.
    pub struct MockDb {
        pub fail: bool,
    }

    impl Db for MockDb {
        fn check(&self) -> Result<(), DbError> {
            if self.fail {
                Err(DbErrorKind::PoolExhausted.into())
            } else {
                Ok(())
            }
        }

        fn get_status(
            &self,
            context: &TenantContext,
            target_tenant: &str,
            process_id: &str,
        ) -> Result<Option<ProcessStatus>, DbError> {
            // Run the real guard so the access rule is enforced in tests too.
            let guarded = guard_query(STATUS_SQL, context, target_tenant)?;
            if process_id != "P1" {
                return Ok(None);
            }
            Ok(Some(ProcessStatus {
                process_id: process_id.to_owned(),
                tenant_id: guarded.tenant_id,
                status: "RUNNING".to_owned(),
                last_heartbeat: None,
                updated_at: None,
            }))
        }

        fn get_processes(
            &self,
            context: &TenantContext,
            target_tenant: &str,
            _limit: u32,
        ) -> Result<Vec<ProcessSummary>, DbError> {
            let guarded = guard_query(PROCESSES_SQL, context, target_tenant)?;
            Ok(vec![ProcessSummary {
                process_id: "P1".to_owned(),
                tenant_id: guarded.tenant_id,
                process_name: Some("nightly-import".to_owned()),
                status: "RUNNING".to_owned(),
                started_at: None,
                updated_at: None,
            }])
        }

        fn get_logs(
            &self,
            context: &TenantContext,
            target_tenant: &str,
            process_id: &str,
            limit: u32,
        ) -> Result<Vec<LogEntry>, DbError> {
            let _ = guard_query(LOGS_SQL, context, target_tenant)?;
            let rows = vec![
                LogEntry {
                    log_level: "INFO".to_owned(),
                    event_type: Some("STARTED".to_owned()),
                    component: Some("queue-listener".to_owned()),
                    message: format!("process event STARTED for {}", process_id),
                    details_json: None,
                    correlation_id: Some("E1".to_owned()),
                    logged_at: None,
                },
                LogEntry {
                    log_level: "INFO".to_owned(),
                    event_type: Some("COMPLETED".to_owned()),
                    component: Some("queue-listener".to_owned()),
                    message: format!("process event COMPLETED for {}", process_id),
                    details_json: None,
                    correlation_id: Some("E2".to_owned()),
                    logged_at: None,
                },
            ];
            Ok(rows.into_iter().take(limit as usize).collect())
        }

        fn pool_stats(&self) -> PoolStats {
            PoolStats::default()
        }
    }

    pub fn make_state(verifier: Arc<dyn VerifyToken>) -> ServerState {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        slog_scope::set_global_logger(logger).cancel_reset();

        ServerState {
            db: Arc::new(MockDb { fail: false }),
            verifier,
            metrics: Metrics::new().expect("metric registration failed"),
            blocking_threadpool: Arc::new(BlockingThreadpool::default()),
        }
    }

    pub fn failing_state() -> ServerState {
        use sentinel_auth::MockVerifier;

        ServerState {
            db: Arc::new(MockDb { fail: true }),
            ..make_state(Arc::new(MockVerifier {
                valid: true,
                context: TenantContext::new("T1"),
            }))
        }
    }
}
