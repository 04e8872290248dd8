//! Non-blocking persistence of request logs.
//!
//! Request handlers push `LogRecord`s into a bounded queue through a `LogSink`; they never
//! wait for the database and never fail because of it. A single `LogDrain` task pops records
//! in enqueue order and writes one row per record. When the queue is full, records are
//! dropped and counted.
//!
//! On cancellation the drain stops waiting for new records, empties what is buffered and
//! hands its receiver back, so the shutdown step can persist records from requests that
//! were still completing while the listeners stopped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::database::StoreHandle;
use crate::model::LogRecord;
use crate::shutdown::{ShutdownError, Shutdownable};

pub const LOG_QUEUE_CAPACITY: usize = 1024;

/// Counters shared by both ends of the queue.
#[derive(Debug, Default)]
pub struct SinkStats {
    dropped: AtomicU64,
    persisted: AtomicU64,
    failed: AtomicU64,
}

impl SinkStats {
    /// Records refused because the queue was full or the drain was gone.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Records written to the store.
    pub fn persisted(&self) -> u64 {
        self.persisted.load(Ordering::SeqCst)
    }

    /// Records discarded after a failed write.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }
}

/// Create the producer and consumer ends of a log queue holding at most `capacity` records.
pub fn log_sink(capacity: usize, store: StoreHandle) -> (LogSink, LogDrain) {
    let (sender, receiver) = mpsc::channel(capacity);
    let stats = Arc::new(SinkStats::default());

    let sink = LogSink {
        sender,
        stats: stats.clone(),
    };
    let drain = LogDrain {
        receiver,
        store,
        stats,
    };
    (sink, drain)
}

/// Producer end of the log queue. Cheap to clone, one per request handler.
#[derive(Clone)]
pub struct LogSink {
    sender: mpsc::Sender<LogRecord>,
    stats: Arc<SinkStats>,
}

impl LogSink {
    /// Queue a record without waiting. Returns false if the record was dropped.
    pub fn enqueue(&self, record: LogRecord) -> bool {
        match self.sender.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.record_drop("full");
                warn!("log buffer full, dropping log entry");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.record_drop("closed");
                debug!("log drain stopped, dropping log entry");
                false
            }
        }
    }

    /// Records dropped since the sink was created.
    pub fn dropped(&self) -> u64 {
        self.stats.dropped()
    }

    pub fn stats(&self) -> &SinkStats {
        &self.stats
    }

    /// Number of records currently buffered.
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    fn record_drop(&self, reason: &'static str) {
        self.stats.dropped.fetch_add(1, Ordering::SeqCst);
        metrics::counter!("log_sink_dropped_total", "reason" => reason).increment(1);
    }
}

/// Consumer end of the log queue.
pub struct LogDrain {
    receiver: mpsc::Receiver<LogRecord>,
    store: StoreHandle,
    stats: Arc<SinkStats>,
}

impl LogDrain {
    /// Persist records as they arrive until `shutdown` is cancelled or every sink is dropped,
    /// then persist whatever is still buffered. Returns self so a later call to `drain` can
    /// pick up records that arrived after this returned.
    pub async fn run(mut self, shutdown: CancellationToken) -> Self {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                record = self.receiver.recv() => match record {
                    Some(record) => self.persist(record).await,
                    None => {
                        debug!("every log sink dropped, log drain stopping");
                        return self;
                    }
                },
            }
        }

        let drained = self.drain().await;
        info!(drained, "log drain stopping after shutdown signal");
        self
    }

    /// Persist every record currently buffered without waiting for new ones.
    /// Returns how many records were taken from the queue.
    pub async fn drain(&mut self) -> usize {
        let mut drained = 0;
        while let Ok(record) = self.receiver.try_recv() {
            self.persist(record).await;
            drained += 1;
        }
        drained
    }

    /// Records written to the store so far.
    pub fn persisted(&self) -> u64 {
        self.stats.persisted()
    }

    pub fn stats(&self) -> &SinkStats {
        &self.stats
    }

    /// Run the drain on its own task.
    pub fn spawn(self, shutdown: CancellationToken, grace: Duration) -> DrainTask {
        DrainTask {
            join: tokio::spawn(self.run(shutdown)),
            grace,
        }
    }

    async fn persist(&self, record: LogRecord) {
        let Some(store) = self.store.get() else {
            // Persistence is disabled, the record only goes to the request log line.
            return;
        };

        match store.insert_log(&record).await {
            Ok(()) => {
                self.stats.persisted.fetch_add(1, Ordering::SeqCst);
                metrics::counter!("log_sink_persisted_total").increment(1);
            }
            Err(error) => {
                self.stats.failed.fetch_add(1, Ordering::SeqCst);
                metrics::counter!("log_sink_write_errors_total").increment(1);
                error!(error = %error, endpoint = %record.endpoint, "failed to log request to db");
            }
        }
    }
}

/// The running drain, stopped by the shutdown coordinator after the listeners.
pub struct DrainTask {
    join: JoinHandle<LogDrain>,
    grace: Duration,
}

#[async_trait]
impl Shutdownable for DrainTask {
    fn name(&self) -> &str {
        "log-drain"
    }

    fn grace_period(&self) -> Duration {
        self.grace
    }

    async fn shutdown(self: Box<Self>) -> Result<(), ShutdownError> {
        let mut drain = self.join.await?;
        let late = drain.drain().await;
        if late > 0 {
            info!(late, "persisted log entries queued while listeners were stopping");
        }
        info!(
            persisted = drain.persisted(),
            dropped = drain.stats().dropped(),
            failed = drain.stats().failed(),
            "log drain stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::database::ConnectionManager;
    use crate::test_utils::recorded_metrics;
    use crate::test_utils::MemoryLogStore;

    fn record(endpoint: &str) -> LogRecord {
        LogRecord::new(
            "GET",
            endpoint,
            200,
            Duration::from_millis(3),
            "127.0.0.1:5000",
        )
    }

    fn memory_sink(capacity: usize) -> (Arc<MemoryLogStore>, ConnectionManager, LogSink, LogDrain) {
        let store = Arc::new(MemoryLogStore::new());
        let manager = ConnectionManager::with_store(store.clone());
        let (sink, drain) = log_sink(capacity, manager.handle());
        (store, manager, sink, drain)
    }

    async fn wait_for_rows(store: &MemoryLogStore, count: usize) {
        for _ in 0..200 {
            if store.rows().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} rows, found {}", store.rows().len());
    }

    #[test]
    fn test_drops_are_counted_by_reason() {
        let (_store, _manager, sink, drain) = memory_sink(2);

        let (accepted, recorded) = recorded_metrics::capture(|| {
            let mut accepted: Vec<bool> = (0..5)
                .map(|i| sink.enqueue(record(&format!("/r/{i}"))))
                .collect();
            drop(drain);
            accepted.push(sink.enqueue(record("/late")));
            accepted
        });

        assert_eq!(accepted, vec![true, true, false, false, false, false]);
        assert_eq!(
            recorded_metrics::counter(&recorded, "log_sink_dropped_total", &[("reason", "full")]),
            3
        );
        assert_eq!(
            recorded_metrics::counter(&recorded, "log_sink_dropped_total", &[("reason", "closed")]),
            1
        );
        assert_eq!(sink.dropped(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overflow_drops_without_blocking() {
        let (store, _manager, sink, drain) = memory_sink(LOG_QUEUE_CAPACITY);
        let producers = 2 * LOG_QUEUE_CAPACITY;

        let handles: Vec<_> = (0..producers)
            .map(|i| {
                let sink = sink.clone();
                tokio::spawn(async move { sink.enqueue(record(&format!("/r/{i}"))) })
            })
            .collect();
        let accepted = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|result| result.expect("producer task panicked"))
            .filter(|accepted| *accepted)
            .count();

        assert_eq!(accepted, LOG_QUEUE_CAPACITY);
        assert_eq!(sink.dropped(), (producers - LOG_QUEUE_CAPACITY) as u64);
        assert_eq!(sink.queued(), LOG_QUEUE_CAPACITY);

        let token = CancellationToken::new();
        token.cancel();
        let drain = drain.run(token).await;

        assert_eq!(store.rows().len(), LOG_QUEUE_CAPACITY);
        assert_eq!(drain.persisted(), LOG_QUEUE_CAPACITY as u64);
    }

    #[tokio::test]
    async fn test_cancelled_drain_persists_buffer_once_in_order() {
        let (store, _manager, sink, drain) = memory_sink(LOG_QUEUE_CAPACITY);
        for i in 0..100 {
            assert!(sink.enqueue(record(&format!("/r/{i}"))));
        }

        let token = CancellationToken::new();
        token.cancel();
        let mut drain = drain.run(token).await;

        let endpoints: Vec<String> = store.rows().into_iter().map(|row| row.endpoint).collect();
        let expected: Vec<String> = (0..100).map(|i| format!("/r/{i}")).collect();
        assert_eq!(endpoints, expected);

        // Nothing left to persist a second time.
        assert_eq!(drain.drain().await, 0);
        assert_eq!(store.rows().len(), 100);
    }

    #[tokio::test]
    async fn test_running_drain_persists_as_records_arrive() {
        let (store, _manager, sink, drain) = memory_sink(16);
        let token = CancellationToken::new();
        let task = drain.spawn(token.clone(), Duration::from_secs(5));

        assert!(sink.enqueue(record("/live")));
        assert!(sink.enqueue(record("/ready")));
        wait_for_rows(&store, 2).await;

        token.cancel();
        Box::new(task).shutdown().await.expect("drain should stop");

        let rows = store.rows();
        assert_eq!(rows[0].endpoint, "/live");
        assert_eq!(rows[1].endpoint, "/ready");
        assert!(rows.iter().all(|row| row.processed_at.is_none()));
    }

    #[tokio::test]
    async fn test_final_drain_persists_late_records() {
        let (store, _manager, sink, drain) = memory_sink(16);
        let token = CancellationToken::new();
        let task = drain.spawn(token.clone(), Duration::from_secs(5));

        assert!(sink.enqueue(record("/before")));
        token.cancel();
        // Produced by a request finishing after the drain saw the cancellation.
        assert!(sink.enqueue(record("/after")));

        Box::new(task).shutdown().await.expect("drain should stop");

        let endpoints: Vec<String> = store.rows().into_iter().map(|row| row.endpoint).collect();
        assert_eq!(endpoints, vec!["/before".to_owned(), "/after".to_owned()]);
    }

    #[tokio::test]
    async fn test_write_failures_discard_the_record() {
        let (store, _manager, sink, drain) = memory_sink(16);
        store.set_fail_inserts(true);
        assert!(sink.enqueue(record("/a")));
        assert!(sink.enqueue(record("/b")));

        let token = CancellationToken::new();
        token.cancel();
        let mut drain = drain.run(token).await;

        assert!(store.rows().is_empty());
        assert_eq!(drain.stats().failed(), 2);

        // The store recovering does not bring discarded records back.
        store.set_fail_inserts(false);
        assert!(sink.enqueue(record("/c")));
        assert_eq!(drain.drain().await, 1);
        let rows = store.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].endpoint, "/c");
    }

    #[tokio::test]
    async fn test_unconfigured_store_discards_silently() {
        let (sink, drain) = log_sink(4, StoreHandle::unconfigured());
        assert!(sink.enqueue(record("/live")));

        let token = CancellationToken::new();
        token.cancel();
        let drain = drain.run(token).await;

        assert_eq!(drain.stats().persisted(), 0);
        assert_eq!(drain.stats().failed(), 0);
        assert_eq!(sink.queued(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_after_drain_is_gone_counts_a_drop() {
        let (_store, _manager, sink, drain) = memory_sink(4);
        drop(drain);

        assert!(!sink.enqueue(record("/live")));
        assert_eq!(sink.stats().dropped(), 1);
    }

    #[tokio::test]
    async fn test_drain_stops_when_every_sink_is_dropped() {
        let (store, _manager, sink, drain) = memory_sink(4);
        assert!(sink.enqueue(record("/live")));
        drop(sink);

        let drain = drain.run(CancellationToken::new()).await;

        assert_eq!(drain.stats().persisted(), 1);
        assert_eq!(store.rows().len(), 1);
    }
}
