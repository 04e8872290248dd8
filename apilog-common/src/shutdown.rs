//! Ordered, bounded shutdown of a service's long-lived components.
//!
//! A service registers its components with a [`ShutdownCoordinator`] in the order they must be
//! stopped. When the termination signal arrives the coordinator cancels the shared token, then
//! stops each component under its own grace period. A component that fails or overruns its grace
//! period is logged and reported, and the next one still runs.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::signal::unix::SignalKind;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("task failed to complete: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

/// A long-lived component that knows how to stop itself.
#[async_trait]
pub trait Shutdownable {
    fn name(&self) -> &str;

    /// Upper bound on how long `shutdown` may run before the coordinator moves on.
    fn grace_period(&self) -> Duration;

    /// Finish outstanding work and release resources. The shared token is already cancelled
    /// when this is called.
    async fn shutdown(self: Box<Self>) -> Result<(), ShutdownError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentOutcome {
    Stopped,
    Failed(String),
    TimedOut,
}

/// What happened to each component, in the order they were stopped.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    outcomes: Vec<(String, ComponentOutcome)>,
}

impl ShutdownReport {
    pub fn outcomes(&self) -> &[(String, ComponentOutcome)] {
        &self.outcomes
    }

    pub fn outcome(&self, name: &str) -> Option<&ComponentOutcome> {
        self.outcomes
            .iter()
            .find(|(component, _)| component == name)
            .map(|(_, outcome)| outcome)
    }

    /// True if every component stopped within its grace period.
    pub fn is_clean(&self) -> bool {
        self.outcomes
            .iter()
            .all(|(_, outcome)| *outcome == ComponentOutcome::Stopped)
    }
}

pub struct ShutdownCoordinator {
    token: CancellationToken,
    components: Vec<Box<dyn Shutdownable + Send>>,
}

impl ShutdownCoordinator {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            components: Vec::new(),
        }
    }

    /// The shared token. Components derive their own tokens from it.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Components are stopped in registration order.
    pub fn register<S>(&mut self, component: S)
    where
        S: Shutdownable + Send + 'static,
    {
        self.components.push(Box::new(component));
    }

    /// Wait for `signal`, or for the shared token to be cancelled from elsewhere, then shut down.
    pub async fn run_until<F>(self, signal: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = signal => info!("shutdown signal received"),
            _ = self.token.cancelled() => info!("shutdown requested by a component"),
        }

        self.shutdown().await
    }

    /// Cancel the shared token and stop every registered component.
    pub async fn shutdown(self) -> ShutdownReport {
        self.token.cancel();

        let mut report = ShutdownReport::default();
        for component in self.components {
            let name = component.name().to_owned();
            let grace = component.grace_period();
            let started = Instant::now();

            let outcome = match tokio::time::timeout(grace, component.shutdown()).await {
                Ok(Ok(())) => {
                    info!(component = %name, elapsed = ?started.elapsed(), "component stopped");
                    ComponentOutcome::Stopped
                }
                Ok(Err(error)) => {
                    error!(component = %name, error = %error, "component failed to stop cleanly");
                    ComponentOutcome::Failed(error.to_string())
                }
                Err(_) => {
                    warn!(component = %name, grace = ?grace, "component did not stop in time, abandoning it");
                    ComponentOutcome::TimedOut
                }
            };
            report.outcomes.push((name, outcome));
        }

        report
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let sigterm = async {
        match tokio::signal::unix::signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                error!(error = %error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(error = %error, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = sigterm => info!("received SIGTERM"),
    }
}
