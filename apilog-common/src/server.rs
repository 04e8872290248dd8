use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::shutdown::{ShutdownError, Shutdownable};

/// An HTTP listener serving a `Router` on its own task.
///
/// The socket is bound by the caller before the task starts, so a port conflict surfaces as an
/// error at startup instead of a dead task.
pub struct Listener {
    name: String,
    local_addr: SocketAddr,
    grace: Duration,
    join: JoinHandle<std::io::Result<()>>,
}

impl Listener {
    /// Bind `addr` and start serving `router` on it.
    ///
    /// The listener stops accepting connections once `shutdown` is cancelled and waits for
    /// in-flight requests to complete. If serving fails, `shutdown` is cancelled so the rest of
    /// the process stops too.
    pub async fn bind(
        name: &str,
        addr: &str,
        router: Router,
        grace: Duration,
        shutdown: &CancellationToken,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Self::spawn(name, listener, router, grace, shutdown)
    }

    /// Start serving `router` on an already bound socket.
    pub fn spawn(
        name: &str,
        listener: TcpListener,
        router: Router,
        grace: Duration,
        shutdown: &CancellationToken,
    ) -> std::io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let stop = shutdown.child_token();
        let trigger = shutdown.clone();
        let task_name = name.to_owned();

        info!(listener = %name, addr = %local_addr, "listening");

        let join = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await;

            if let Err(ref error) = result {
                error!(listener = %task_name, error = %error, "server failed, shutting down");
                trigger.cancel();
            }
            result
        });

        Ok(Self {
            name: name.to_owned(),
            local_addr,
            grace,
            join,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Shutdownable for Listener {
    fn name(&self) -> &str {
        &self.name
    }

    fn grace_period(&self) -> Duration {
        self.grace
    }

    async fn shutdown(self: Box<Self>) -> Result<(), ShutdownError> {
        // Cancellation of the shared token already told the server to stop accepting.
        self.join.await??;
        Ok(())
    }
}
