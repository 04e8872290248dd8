use std::time::Duration;

use chrono::{DateTime, Utc};

/// Column widths of the `api_logs` table, see `migrations/`.
const METHOD_MAX_CHARS: usize = 10;
const TEXT_MAX_CHARS: usize = 255;

/// A completed request, waiting in the log sink to be persisted as one `api_logs` row.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub method: String,
    pub endpoint: String,
    pub status: u16,
    pub duration_ms: f64,
    pub remote_addr: String,
}

impl LogRecord {
    /// Build a record, truncating text fields to the width of their columns so an
    /// oversized request line cannot make the insert fail.
    pub fn new(
        method: &str,
        endpoint: &str,
        status: u16,
        duration: Duration,
        remote_addr: &str,
    ) -> Self {
        Self {
            method: truncate_chars(method, METHOD_MAX_CHARS),
            endpoint: truncate_chars(endpoint, TEXT_MAX_CHARS),
            status,
            duration_ms: duration.as_secs_f64() * 1000.0,
            remote_addr: truncate_chars(remote_addr, TEXT_MAX_CHARS),
        }
    }
}

/// A persisted `api_logs` row.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct DurableLogRow {
    pub id: i64,
    pub method: String,
    pub endpoint: String,
    pub status: i32,
    pub duration_ms: f64,
    pub remote_addr: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl DurableLogRow {
    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((byte_index, _)) => value[..byte_index].to_owned(),
        None => value.to_owned(),
    }
}
