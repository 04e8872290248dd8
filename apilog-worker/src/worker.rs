use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use apilog_common::database::StoreHandle;
use apilog_common::shutdown::{ShutdownError, Shutdownable};

/// Pause between batches while there is a backlog.
pub const DRAIN_YIELD: Duration = Duration::from_millis(100);

/// A processor is unhealthy once its last iteration is older than this many intervals.
const STALE_INTERVALS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// Nothing was claimed: wait a full interval.
    Idle,
    /// A batch was claimed: there may be more, come back quickly.
    Draining,
    Stopped,
}

/// Result of one claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    Claimed(u64),
    Empty,
    Failed,
    NotConfigured,
}

impl IterationOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, IterationOutcome::Claimed(_) | IterationOutcome::Empty)
    }
}

impl ProcessorState {
    /// The state the processor moves to after an iteration.
    pub fn after(outcome: IterationOutcome) -> Self {
        match outcome {
            IterationOutcome::Claimed(count) if count > 0 => ProcessorState::Draining,
            _ => ProcessorState::Idle,
        }
    }

    /// How long to wait before the next iteration, or None once stopped.
    pub fn pause(self, interval: Duration) -> Option<Duration> {
        match self {
            ProcessorState::Idle => Some(interval),
            ProcessorState::Draining => Some(DRAIN_YIELD),
            ProcessorState::Stopped => None,
        }
    }
}

/// Snapshot of the processor's health, published after every iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerHealth {
    pub interval: Duration,
    pub last_iteration_at: Option<Instant>,
    pub last_outcome_ok: bool,
}

impl WorkerHealth {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_iteration_at: None,
            last_outcome_ok: true,
        }
    }

    pub fn is_healthy_at(&self, now: Instant) -> bool {
        match self.last_iteration_at {
            None => true,
            Some(at)
                if now.saturating_duration_since(at)
                    > self.interval.saturating_mul(STALE_INTERVALS) =>
            {
                false
            }
            Some(_) => self.last_outcome_ok,
        }
    }
}

/// Read side of the processor's health, held by the health handlers.
#[derive(Clone)]
pub struct WorkerHealthProbe {
    receiver: watch::Receiver<WorkerHealth>,
}

impl WorkerHealthProbe {
    pub fn snapshot(&self) -> WorkerHealth {
        *self.receiver.borrow()
    }

    pub fn is_healthy(&self) -> bool {
        self.snapshot().is_healthy_at(Instant::now())
    }
}

/// Marks request logs as processed, in batches, until cancelled.
pub struct BackgroundProcessor {
    store: StoreHandle,
    interval: Duration,
    batch_size: i64,
    state: ProcessorState,
    health: watch::Sender<WorkerHealth>,
}

impl BackgroundProcessor {
    pub fn new(
        store: StoreHandle,
        interval: Duration,
        batch_size: i64,
    ) -> (Self, WorkerHealthProbe) {
        let (health, receiver) = watch::channel(WorkerHealth::new(interval));
        let processor = Self {
            store,
            interval,
            batch_size,
            state: ProcessorState::Idle,
            health,
        };
        (processor, WorkerHealthProbe { receiver })
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    /// Claim one batch and publish the resulting health.
    pub async fn iterate(&mut self) -> IterationOutcome {
        let outcome = match self.store.get() {
            None => {
                warn!("db not connected, skipping log processing");
                IterationOutcome::NotConfigured
            }
            Some(store) => {
                let started = Instant::now();
                let result = store.claim_batch(self.batch_size).await;
                metrics::histogram!("worker_processing_duration_seconds")
                    .record(started.elapsed().as_secs_f64());

                match result {
                    Ok(0) => IterationOutcome::Empty,
                    Ok(count) => {
                        metrics::counter!("worker_logs_processed_total").increment(count);
                        info!(count, "processed api logs");
                        IterationOutcome::Claimed(count)
                    }
                    Err(error) => {
                        metrics::counter!("worker_batch_errors_total").increment(1);
                        error!(error = %error, "failed to process logs");
                        IterationOutcome::Failed
                    }
                }
            }
        };

        self.state = ProcessorState::after(outcome);
        self.health.send_replace(WorkerHealth {
            interval: self.interval,
            last_iteration_at: Some(Instant::now()),
            last_outcome_ok: outcome.is_ok(),
        });
        outcome
    }

    /// Poll until `shutdown` is cancelled. An iteration already in flight is allowed to
    /// finish, a new one is never started after cancellation.
    pub async fn run(mut self, shutdown: CancellationToken) -> Self {
        info!(interval = ?self.interval, batch_size = self.batch_size, "worker started");

        while !shutdown.is_cancelled() {
            self.iterate().await;

            let Some(pause) = self.state.pause(self.interval) else {
                break;
            };
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        self.state = ProcessorState::Stopped;
        info!("worker stopping");
        self
    }

    pub fn spawn(self, shutdown: CancellationToken, grace: Duration) -> ProcessorTask {
        ProcessorTask {
            join: tokio::spawn(self.run(shutdown)),
            grace,
        }
    }
}

/// The running processor, awaited by the shutdown coordinator.
pub struct ProcessorTask {
    join: JoinHandle<BackgroundProcessor>,
    grace: Duration,
}

#[async_trait]
impl Shutdownable for ProcessorTask {
    fn name(&self) -> &str {
        "background-processor"
    }

    fn grace_period(&self) -> Duration {
        self.grace
    }

    async fn shutdown(self: Box<Self>) -> Result<(), ShutdownError> {
        let processor = self.join.await?;
        debug_assert_eq!(processor.state(), ProcessorState::Stopped);
        Ok(())
    }
}
