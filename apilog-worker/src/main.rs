//! Marks API request logs as processed, in batches, and exposes the worker's health.

use std::process::ExitCode;

use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use apilog_common::database::{ConnectionManager, PgConnector};
use apilog_common::logging::init_tracing;
use apilog_common::metrics::setup_metrics_recorder;
use apilog_common::server::Listener;
use apilog_common::shutdown::{shutdown_signal, ShutdownCoordinator};
use apilog_worker::config::Config;
use apilog_worker::error::WorkerError;
use apilog_worker::handlers;
use apilog_worker::worker::BackgroundProcessor;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::init_from_env().map_err(WorkerError::from) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{error}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(config.log_format);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(error = %error, "worker failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), WorkerError> {
    let interval = config.interval()?;
    let batch_size = config.batch_size()?;

    let manager = ConnectionManager::new();
    match config.database.dsn() {
        Some(dsn) => {
            manager
                .connect(
                    &PgConnector::without_migrations(),
                    dsn,
                    &config.database.retry_policy(),
                )
                .await?
        }
        None => warn!("DB_DSN not set, worker will not process logs"),
    }

    let recorder = match setup_metrics_recorder() {
        Ok(handle) => Some(handle),
        Err(error) => {
            warn!(error = %error, "failed to install metrics recorder");
            None
        }
    };

    let token = CancellationToken::new();
    let (processor, probe) = BackgroundProcessor::new(manager.handle(), interval, batch_size);
    let app = handlers::app(manager.handle(), probe, recorder);

    let listener = Listener::bind(
        "health",
        &config.bind(),
        app,
        config.shutdown_timeout.0,
        &token,
    )
    .await?;
    info!(port = config.port, env = %config.app_env, "health server started");

    let processor = processor.spawn(token.clone(), config.shutdown_timeout.0);

    let mut coordinator = ShutdownCoordinator::new(token);
    coordinator.register(listener);
    coordinator.register(processor);

    let report = coordinator.run_until(shutdown_signal()).await;
    manager.close().await;

    if report.is_clean() {
        info!("worker stopped gracefully");
    } else {
        warn!(outcomes = ?report.outcomes(), "worker stopped with errors");
    }

    Ok(())
}
