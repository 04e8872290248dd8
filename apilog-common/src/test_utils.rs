use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use crate::database::{LogStore, StoreError};
use crate::model::{DurableLogRow, LogRecord};

#[derive(Default)]
struct MemoryState {
    rows: Vec<DurableLogRow>,
    claimed_batches: Vec<Vec<i64>>,
    next_id: i64,
}

/// An in-memory `api_logs` table with failure injection, for tests that cannot reach Postgres.
/// Every operation runs under one mutex, mirroring the atomicity of the SQL statements.
#[derive(Default)]
pub struct MemoryLogStore {
    state: Mutex<MemoryState>,
    unreachable: AtomicBool,
    fail_inserts: AtomicBool,
    fail_claims: AtomicBool,
    closed: AtomicBool,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_claims(&self, fail: bool) {
        self.fail_claims.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Snapshot of every row, in id order.
    pub fn rows(&self) -> Vec<DurableLogRow> {
        self.lock().rows.clone()
    }

    /// The ids claimed by each successful `claim_batch` call, in call order.
    pub fn claimed_batches(&self) -> Vec<Vec<i64>> {
        self.lock().claimed_batches.clone()
    }

    pub fn unprocessed_count(&self) -> usize {
        self.lock()
            .rows
            .iter()
            .filter(|row| !row.is_processed())
            .count()
    }

    /// Seed `count` unprocessed rows, as if the API had logged that many requests.
    pub fn seed(&self, count: usize) {
        let mut state = self.lock();
        for _ in 0..count {
            let record = LogRecord {
                method: "GET".to_owned(),
                endpoint: "/live".to_owned(),
                status: 200,
                duration_ms: 1.0,
                remote_addr: "127.0.0.1:1".to_owned(),
            };
            push_row(&mut state, &record);
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.unreachable.load(Ordering::SeqCst) || self.is_closed() {
            Err(StoreError::Unavailable("connection refused".to_owned()))
        } else {
            Ok(())
        }
    }
}

fn push_row(state: &mut MemoryState, record: &LogRecord) {
    state.next_id += 1;
    let row = DurableLogRow {
        id: state.next_id,
        method: record.method.clone(),
        endpoint: record.endpoint.clone(),
        status: i32::from(record.status),
        duration_ms: record.duration_ms,
        remote_addr: record.remote_addr.clone(),
        created_at: Utc::now(),
        processed_at: None,
    };
    state.rows.push(row);
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check_reachable()
    }

    async fn insert_log(&self, record: &LogRecord) -> Result<(), StoreError> {
        self.check_reachable()?;
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("insert rejected".to_owned()));
        }

        push_row(&mut self.lock(), record);
        Ok(())
    }

    async fn claim_batch(&self, batch_size: i64) -> Result<u64, StoreError> {
        self.check_reachable()?;
        if self.fail_claims.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("update rejected".to_owned()));
        }

        let limit = usize::try_from(batch_size).unwrap_or(0);
        let now = Utc::now();
        let mut state = self.lock();
        let claimed: Vec<i64> = state
            .rows
            .iter_mut()
            .filter(|row| row.processed_at.is_none())
            .take(limit)
            .map(|row| {
                row.processed_at = Some(now);
                row.id
            })
            .collect();

        let count = claimed.len() as u64;
        if !claimed.is_empty() {
            state.claimed_batches.push(claimed);
        }
        Ok(count)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
