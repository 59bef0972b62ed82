//! Process entry point: configuration, logging, and the run/shutdown cycle.
#[macro_use]
extern crate slog_scope;

use std::error::Error;

use sentinel::logging::{init_logging, reset_logging};
use sentinel::server::{RunningService, Server};
use sentinel_settings::{parse_bool_flag, Settings};

#[actix_web::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Logging comes up before settings so configuration failures are logged.
    let human_logs = std::env::var("HUMAN_LOGS")
        .ok()
        .as_deref()
        .and_then(parse_bool_flag)
        .unwrap_or(false);
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    init_logging(!human_logs, &log_level).expect("Logging failed to initialize");
    debug!("Starting up...");

    let settings = Settings::with_env()?;

    // Setup and run the server
    let RunningService {
        server,
        metrics_server,
        engine,
    } = Server::with_settings(settings.clone()).await?;
    info!("Server running on {}", settings.banner());

    let metrics_handle = metrics_server.handle();
    let metrics_task = tokio::spawn(metrics_server);

    // Resolves once SIGINT/SIGTERM stops the acceptor.
    let served = server.await;

    metrics_handle.stop(true).await;
    let _ = metrics_task.await;
    engine.shutdown();

    info!("Server closing");
    reset_logging();
    served?;

    Ok(())
}
