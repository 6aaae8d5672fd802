//! Testing utilities for pipelines
//!
//! In-memory [`Source`] and [`Sink`] implementations so stages can be driven
//! without a running store.
//!
//! # Example
//!
//! ```rust,ignore
//! use drover::testing::*;
//!
//! #[tokio::test]
//! async fn drains_two_batches() {
//!     let source = MockSource::new()
//!         .with_batch(vec![row(1), row(2)])
//!         .with_batch(vec![row(3)]);
//!     let sink = MockSink::new("results");
//!
//!     // ... run the pipeline ...
//!
//!     assert_eq!(sink.rows().len(), 3);
//!     assert_eq!(source.queries().len(), 3);
//! }
//! ```

use super::sink::Sink;
use super::source::Source;
use super::subject::{Params, Record};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// Mock Source
// ============================================================================

/// One recorded `get_next_batch` call
#[derive(Debug, Clone)]
pub struct QueryCall {
    pub sql: String,
    pub at: Instant,
}

/// A scripted source for testing.
///
/// Each call pops the next scripted reply; once the script is exhausted every
/// call returns an empty batch.
#[derive(Debug, Clone)]
pub struct MockSource<P> {
    script: Arc<Mutex<VecDeque<StoreResult<Vec<P>>>>>,
    calls: Arc<Mutex<Vec<QueryCall>>>,
}

impl<P> Default for MockSource<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> MockSource<P> {
    /// Create a new mock source with an empty script
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Append a batch to the script
    pub fn with_batch(self, rows: Vec<P>) -> Self {
        self.script.lock().push_back(Ok(rows));
        self
    }

    /// Append an empty batch to the script
    pub fn with_empty(self) -> Self {
        self.with_batch(Vec::new())
    }

    /// Append an error to the script
    pub fn with_error(self, error: StoreError) -> Self {
        self.script.lock().push_back(Err(error));
        self
    }

    /// Append `times` transient (retryable) failures to the script
    pub fn fail_times(self, times: usize, message: &str) -> Self {
        {
            let mut script = self.script.lock();
            for _ in 0..times {
                script.push_back(Err(StoreError::unavailable(message)));
            }
        }
        self
    }

    /// All SQL statements received so far, in order
    pub fn queries(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.sql.clone()).collect()
    }

    /// All calls with their timestamps
    pub fn calls(&self) -> Vec<QueryCall> {
        self.calls.lock().clone()
    }

    /// Number of scripted replies not yet consumed
    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

#[async_trait]
impl<P: Params> Source<P> for MockSource<P> {
    fn name(&self) -> &str {
        "mock-source"
    }

    async fn get_next_batch(&self, sql: &str) -> StoreResult<Vec<P>> {
        self.calls.lock().push(QueryCall {
            sql: sql.to_string(),
            at: Instant::now(),
        });
        self.script.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

// ============================================================================
// Mock Sink
// ============================================================================

/// An in-memory sink for testing
#[derive(Debug, Clone)]
pub struct MockSink<R> {
    table: String,
    rows: Arc<Mutex<Vec<R>>>,
    batches: Arc<Mutex<Vec<usize>>>,
    ddl: Arc<Mutex<Vec<String>>>,
    fail_message: Arc<Mutex<Option<String>>>,
    delay: Arc<Mutex<Option<Duration>>>,
    blocked: Arc<tokio::sync::Notify>,
    block_inserts: Arc<Mutex<bool>>,
}

impl<R> MockSink<R> {
    /// Create a new mock sink writing to `table`
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            rows: Arc::new(Mutex::new(Vec::new())),
            batches: Arc::new(Mutex::new(Vec::new())),
            ddl: Arc::new(Mutex::new(Vec::new())),
            fail_message: Arc::new(Mutex::new(None)),
            delay: Arc::new(Mutex::new(None)),
            blocked: Arc::new(tokio::sync::Notify::new()),
            block_inserts: Arc::new(Mutex::new(false)),
        }
    }

    /// Make every insert fail with an error
    pub fn fail_with(self, message: impl Into<String>) -> Self {
        *self.fail_message.lock() = Some(message.into());
        self
    }

    /// Delay every insert by `delay`
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = Some(delay);
        self
    }

    /// Hold every insert until [`MockSink::unblock`] is called
    pub fn blocked(self) -> Self {
        *self.block_inserts.lock() = true;
        self
    }

    /// Release held inserts
    pub fn unblock(&self) {
        *self.block_inserts.lock() = false;
        self.blocked.notify_waiters();
    }

    /// Stop failing inserts
    pub fn recover(&self) {
        *self.fail_message.lock() = None;
    }

    /// Rows written so far, in insert order
    pub fn rows(&self) -> Vec<R>
    where
        R: Clone,
    {
        self.rows.lock().clone()
    }

    /// Sizes of the batches inserted so far
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().clone()
    }

    /// DDL statements executed so far
    pub fn ddl(&self) -> Vec<String> {
        self.ddl.lock().clone()
    }
}

#[async_trait]
impl<R: Record + Clone> Sink<R> for MockSink<R> {
    fn name(&self) -> &str {
        "mock-sink"
    }

    fn table(&self) -> &str {
        &self.table
    }

    async fn init_table(&self, ddl: &str) -> StoreResult<()> {
        self.ddl.lock().push(ddl.to_string());
        Ok(())
    }

    async fn insert_batch(&self, rows: &[R]) -> StoreResult<()> {
        loop {
            let notified = self.blocked.notified();
            if !*self.block_inserts.lock() {
                break;
            }
            notified.await;
        }

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(msg) = self.fail_message.lock().clone() {
            return Err(StoreError::unavailable(msg));
        }

        self.batches.lock().push(rows.len());
        self.rows.lock().extend_from_slice(rows);
        Ok(())
    }
}
