use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Connection;
use thiserror::Error;
use tracing::{info, warn};

use crate::model::LogRecord;
use crate::retry::RetryPolicy;

/// Enumeration of errors for operations against the log store.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {0}")]
    ConnectionError(sqlx::Error),
    #[error("{command} query failed with: {error}")]
    QueryError {
        command: &'static str,
        error: sqlx::Error,
    },
    #[error("migration failed with: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Initial connection setup failed; fatal for both services.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("failed to connect after {attempts} attempts: {source}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("the retry policy allows no connection attempts")]
    NoAttempts,
}

/// Why the store cannot currently serve requests.
#[derive(Error, Debug)]
pub enum PingError {
    #[error("db not configured")]
    NotConfigured,
    #[error("db unreachable: {0}")]
    Unreachable(StoreError),
}

impl PingError {
    /// Short message exposed by the readiness probe.
    pub fn message(&self) -> &'static str {
        match self {
            PingError::NotConfigured => "db not configured",
            PingError::Unreachable(_) => "db unreachable",
        }
    }
}

/// The durable side of the log pipeline: one fixed table of request logs.
#[async_trait]
pub trait LogStore {
    /// Check that the store is reachable right now.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Persist one record as one row.
    async fn insert_log(&self, record: &LogRecord) -> Result<(), StoreError>;

    /// Mark up to `batch_size` unprocessed rows as processed, lowest ids first, in one
    /// atomic statement. Returns the number of rows claimed.
    async fn claim_batch(&self, batch_size: i64) -> Result<u64, StoreError>;

    /// Release every connection held by the store.
    async fn close(&self);
}

pub type SharedStore = Arc<dyn LogStore + Send + Sync>;

/// Acquires a store from a connection string. One call is one connection attempt.
#[async_trait]
pub trait Connector {
    async fn connect(&self, dsn: &str) -> Result<SharedStore, StoreError>;
}

/// Fixed pool limits, applied regardless of load.
#[derive(Debug, Clone, Copy)]
pub struct PoolPolicy {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// sqlx cannot cap the number of idle connections, so idle ones are reaped instead.
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

pub const DEFAULT_POOL_POLICY: PoolPolicy = PoolPolicy {
    max_connections: 25,
    acquire_timeout: Duration::from_secs(5),
    idle_timeout: Duration::from_secs(60),
    max_lifetime: Duration::from_secs(300),
};

/// Opens a `PgPool` for the `api_logs` table.
#[derive(Debug, Clone)]
pub struct PgConnector {
    policy: PoolPolicy,
    run_migrations: bool,
}

impl PgConnector {
    /// A connector that creates the schema if needed. Used by the service writing logs.
    pub fn with_migrations() -> Self {
        Self {
            policy: DEFAULT_POOL_POLICY,
            run_migrations: true,
        }
    }

    /// A connector that only verifies connectivity.
    pub fn without_migrations() -> Self {
        Self {
            policy: DEFAULT_POOL_POLICY,
            run_migrations: false,
        }
    }

    pub fn policy(mut self, policy: PoolPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self, dsn: &str) -> Result<SharedStore, StoreError> {
        // connect() opens a first connection, so an unreachable server fails here.
        let pool = PgPoolOptions::new()
            .max_connections(self.policy.max_connections)
            .acquire_timeout(self.policy.acquire_timeout)
            .idle_timeout(self.policy.idle_timeout)
            .max_lifetime(self.policy.max_lifetime)
            .test_before_acquire(true)
            .connect(dsn)
            .await
            .map_err(StoreError::ConnectionError)?;

        if self.run_migrations {
            if let Err(error) = sqlx::migrate!("../migrations").run(&pool).await {
                pool.close().await;
                return Err(error.into());
            }
        }

        Ok(Arc::new(PgLogStore::new(pool)))
    }
}

/// `LogStore` backed by the `api_logs` table in PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgLogStore {
    pool: PgPool,
}

impl PgLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LogStore for PgLogStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(StoreError::ConnectionError)?;

        conn.ping().await.map_err(StoreError::ConnectionError)
    }

    async fn insert_log(&self, record: &LogRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO api_logs
    (method, endpoint, status, duration_ms, remote_addr)
VALUES
    ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&record.method)
        .bind(&record.endpoint)
        .bind(i32::from(record.status))
        .bind(record.duration_ms)
        .bind(&record.remote_addr)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "INSERT",
            error,
        })?;

        Ok(())
    }

    async fn claim_batch(&self, batch_size: i64) -> Result<u64, StoreError> {
        // SKIP LOCKED lets concurrent processors claim disjoint batches.
        let result = sqlx::query(
            r#"
WITH unprocessed AS (
    SELECT
        id
    FROM
        api_logs
    WHERE
        processed_at IS NULL
    ORDER BY
        id
    LIMIT $1
    FOR UPDATE SKIP LOCKED
)
UPDATE
    api_logs
SET
    processed_at = NOW()
FROM
    unprocessed
WHERE
    api_logs.id = unprocessed.id
    AND api_logs.processed_at IS NULL
            "#,
        )
        .bind(batch_size)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "UPDATE",
            error,
        })?;

        Ok(result.rows_affected())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Owner of the single shared store. Only the manager replaces the store, every
/// other component reads it through a `StoreHandle`.
#[derive(Default)]
pub struct ConnectionManager {
    slot: Arc<RwLock<Option<SharedStore>>>,
}

impl ConnectionManager {
    /// A manager with no store configured; persistence stays disabled until `connect` succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// A manager owning an already acquired store.
    pub fn with_store(store: SharedStore) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Some(store))),
        }
    }

    /// A read-only view of the store, for every component that is not the owner.
    pub fn handle(&self) -> StoreHandle {
        StoreHandle {
            slot: self.slot.clone(),
        }
    }

    /// Try to acquire the store, backing off exponentially between failed attempts.
    /// No delay is taken after the final attempt.
    pub async fn connect<C>(
        &self,
        connector: &C,
        dsn: &str,
        policy: &RetryPolicy,
    ) -> Result<(), ConnectionError>
    where
        C: Connector + ?Sized,
    {
        let max_attempts = policy.max_attempts();
        let mut last_error = None;

        for attempt in 0..max_attempts {
            match connector.connect(dsn).await {
                Ok(store) => {
                    if let Some(previous) = self.replace(Some(store)) {
                        previous.close().await;
                    }
                    info!(attempt = attempt + 1, "connected to postgres successfully");
                    return Ok(());
                }
                Err(error) => {
                    if attempt + 1 < max_attempts {
                        let delay = policy.time_until_next_retry(attempt);
                        warn!(
                            attempt = attempt + 1,
                            max = max_attempts,
                            delay = ?delay,
                            error = %error,
                            "db connection failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        warn!(
                            attempt = attempt + 1,
                            max = max_attempts,
                            error = %error,
                            "db connection failed, no attempts left"
                        );
                    }
                    last_error = Some(error);
                }
            }
        }

        match last_error {
            Some(source) => Err(ConnectionError::ExhaustedRetries {
                attempts: max_attempts,
                source,
            }),
            None => Err(ConnectionError::NoAttempts),
        }
    }

    /// Take the store out of the shared slot and close it.
    pub async fn close(&self) {
        if let Some(store) = self.replace(None) {
            store.close().await;
            info!("closed postgres connections");
        }
    }

    fn replace(&self, store: Option<SharedStore>) -> Option<SharedStore> {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, store)
    }
}

/// Shared read access to the store owned by a `ConnectionManager`.
#[derive(Clone)]
pub struct StoreHandle {
    slot: Arc<RwLock<Option<SharedStore>>>,
}

impl StoreHandle {
    /// A handle that never has a store, for running without persistence.
    pub fn unconfigured() -> Self {
        Self {
            slot: Arc::new(RwLock::new(None)),
        }
    }

    /// The current store, if one is configured. The read lock is released before returning.
    pub fn get(&self) -> Option<SharedStore> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_configured(&self) -> bool {
        self.get().is_some()
    }

    /// Report reachability without changing any state.
    pub async fn ping(&self) -> Result<(), PingError> {
        let store = self.get().ok_or(PingError::NotConfigured)?;
        store.ping().await.map_err(PingError::Unreachable)
    }
}
