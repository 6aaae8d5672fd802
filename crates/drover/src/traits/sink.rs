//! Sink trait

use super::subject::Record;
use crate::error::StoreResult;
use async_trait::async_trait;

/// Result of a flush against one sink
#[derive(Debug, Clone, Default)]
pub struct WriteResult {
    /// Number of records written
    pub records_written: u64,
    /// Number of records that failed
    pub records_failed: u64,
    /// Error messages for failed batches
    pub errors: Vec<String>,
}

impl WriteResult {
    /// Create a new write result
    pub fn new() -> Self {
        Self::default()
    }

    /// Add successful records
    pub fn add_success(&mut self, records: u64) {
        self.records_written += records;
    }

    /// Add failed records
    pub fn add_failure(&mut self, records: u64, error: impl Into<String>) {
        self.records_failed += records;
        self.errors.push(error.into());
    }

    /// Fold another result into this one
    pub fn merge(&mut self, other: WriteResult) {
        self.records_written += other.records_written;
        self.records_failed += other.records_failed;
        self.errors.extend(other.errors);
    }

    /// Check if there were any failures
    pub fn has_failures(&self) -> bool {
        self.records_failed > 0
    }
}

/// Store adapter that persists records.
///
/// `insert_batch` is all-or-nothing per call and never retries internally.
#[async_trait]
pub trait Sink<R: Record>: Send + Sync {
    /// Human-readable name used in logs
    fn name(&self) -> &str;

    /// Destination table
    fn table(&self) -> &str;

    /// Execute a `CREATE TABLE` statement
    async fn init_table(&self, ddl: &str) -> StoreResult<()>;

    /// Insert all rows in one server-side batch
    async fn insert_batch(&self, rows: &[R]) -> StoreResult<()>;
}
