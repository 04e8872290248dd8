use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use governor::clock::DefaultClock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use apilog_api::config::Config;
use apilog_api::handlers;
use apilog_common::database::{ConnectionManager, PgConnector};
use apilog_common::limiter::RequestLimiter;
use apilog_common::logging::init_tracing;
use apilog_common::metrics::setup_metrics_recorder;
use apilog_common::pipeline::RequestPipeline;
use apilog_common::server::Listener;
use apilog_common::shutdown::{shutdown_signal, ShutdownCoordinator};
use apilog_common::sink::{log_sink, LOG_QUEUE_CAPACITY};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;
    init_tracing(config.log_format);

    let manager = ConnectionManager::new();
    match config.database.dsn() {
        Some(dsn) => manager
            .connect(
                &PgConnector::with_migrations(),
                dsn,
                &config.database.retry_policy(),
            )
            .await
            .wrap_err("failed to connect to database")?,
        None => warn!("DB_DSN not set, running without database logging"),
    }

    let recorder = match setup_metrics_recorder() {
        Ok(handle) => Some(handle),
        Err(error) => {
            warn!(error = %error, "failed to install metrics recorder");
            None
        }
    };

    let token = CancellationToken::new();
    let (sink, drain) = log_sink(LOG_QUEUE_CAPACITY, manager.handle());
    let drain_task = drain.spawn(token.clone(), config.log_drain_timeout.0);

    let limiter: RequestLimiter<DefaultClock> = RequestLimiter::new(config.rate_limit);
    let pipeline = RequestPipeline::with_sink(sink);

    let internal = handlers::with_request_layers(
        handlers::internal_router(manager.handle(), recorder),
        limiter.clone(),
        pipeline.clone(),
    );
    let public = handlers::with_request_layers(
        handlers::public_router(&config.app_env),
        limiter,
        pipeline,
    );

    let grace = config.shutdown_timeout.0;
    let internal = Listener::bind("internal", &config.bind(), internal, grace, &token)
        .await
        .wrap_err_with(|| format!("failed to bind internal listener on {}", config.bind()))?;
    info!(port = config.port, env = %config.app_env, "internal api server started");

    let public = Listener::bind("public", &config.public_bind(), public, grace, &token)
        .await
        .wrap_err_with(|| format!("failed to bind public listener on {}", config.public_bind()))?;
    info!(port = config.public_port, env = %config.app_env, "public api server started");

    let mut coordinator = ShutdownCoordinator::new(token);
    coordinator.register(internal);
    coordinator.register(public);
    coordinator.register(drain_task);

    let report = coordinator.run_until(shutdown_signal()).await;
    manager.close().await;

    if report.is_clean() {
        info!("servers stopped gracefully");
    } else {
        warn!(outcomes = ?report.outcomes(), "servers stopped with errors");
    }

    Ok(())
}
