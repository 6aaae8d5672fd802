//! Writer stage
//!
//! Single consumer of the result channel. Records are buffered and flushed to
//! every sink once `insert_batch_size` is reached. Each flush fans out to the
//! sinks concurrently; a failing sink is logged and its copy of the batch is
//! discarded without holding up the others.
//!
//! When the channel closes or cancellation fires, everything still queued is
//! drained and flushed under `db_save_timeout`, one batch at a time, so the
//! buffer never holds more than `insert_batch_size` records. Whatever is left
//! when the timeout fires is logged as dropped.

use crate::traits::{Record, Sink, WriteResult};
use futures::future::join_all;
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Writer settings
#[derive(Debug, Clone)]
pub struct WriterSettings {
    /// Records per insert
    pub insert_batch_size: usize,
    /// Cap on the final flush at shutdown
    pub db_save_timeout: Duration,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            insert_batch_size: 1000,
            db_save_timeout: Duration::from_secs(30),
        }
    }
}

/// Counters reported when the writer stops
#[derive(Debug, Clone, Default)]
pub struct WriterStats {
    /// Records received from the channel
    pub received: u64,
    /// Flushes performed (one flush covers every sink)
    pub flushes: u64,
    /// Per-sink write outcome, summed over all sinks
    pub write: WriteResult,
    /// Records dropped because the final flush timed out
    pub dropped: u64,
}

/// Batched fan-out writer
pub struct Writer<R: Record> {
    sinks: Vec<Arc<dyn Sink<R>>>,
    settings: WriterSettings,
}

impl<R: Record> Writer<R> {
    pub fn new(sinks: Vec<Arc<dyn Sink<R>>>, settings: WriterSettings) -> Self {
        Self { sinks, settings }
    }

    /// Start the writer on its own task
    pub fn spawn(
        self,
        results: mpsc::Receiver<R>,
        cancel: CancellationToken,
    ) -> JoinHandle<WriterStats> {
        tokio::spawn(self.run(results, cancel))
    }

    /// Consume `results` until it closes or `cancel` fires, then flush the tail
    pub async fn run(
        self,
        mut results: mpsc::Receiver<R>,
        cancel: CancellationToken,
    ) -> WriterStats {
        let batch_size = self.settings.insert_batch_size.max(1);
        let mut stats = WriterStats::default();
        let mut batch: Vec<R> = Vec::with_capacity(batch_size);

        info!(sinks = self.sinks.len(), batch_size, "Writer started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Writer cancelled, draining");
                    break;
                }
                next = results.recv() => match next {
                    Some(record) => {
                        stats.received += 1;
                        batch.push(record);
                        if batch.len() >= batch_size {
                            let full =
                                std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                            self.flush(&full, &mut stats).await;
                        }
                    }
                    None => break,
                },
            }
        }

        // no new sends from here on; flush what is already queued
        results.close();
        self.final_flush(&mut results, batch, &mut stats).await;

        info!(
            received = stats.received,
            written = stats.write.records_written,
            failed = stats.write.records_failed,
            dropped = stats.dropped,
            "Writer stopped"
        );
        stats
    }

    async fn final_flush(
        &self,
        results: &mut mpsc::Receiver<R>,
        mut batch: Vec<R>,
        stats: &mut WriterStats,
    ) {
        let batch_size = self.settings.insert_batch_size.max(1);
        let mut in_flight = 0usize;

        let outcome = tokio::time::timeout(self.settings.db_save_timeout, async {
            loop {
                while batch.len() < batch_size {
                    match results.try_recv() {
                        Ok(record) => {
                            stats.received += 1;
                            batch.push(record);
                        }
                        Err(_) => break,
                    }
                }
                if batch.is_empty() {
                    break;
                }
                let chunk = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                in_flight = chunk.len();
                self.flush(&chunk, stats).await;
                in_flight = 0;
            }
        })
        .await;

        if outcome.is_err() {
            let mut dropped = (in_flight + batch.len()) as u64;
            while results.try_recv().is_ok() {
                stats.received += 1;
                dropped += 1;
            }
            stats.dropped += dropped;
            counter!("drover.writer.dropped").increment(dropped);
            error!(
                dropped,
                timeout_secs = self.settings.db_save_timeout.as_secs_f64(),
                "Final flush timed out, records dropped"
            );
        }
    }

    async fn flush(&self, rows: &[R], stats: &mut WriterStats) {
        let started = Instant::now();
        let outcomes = join_all(self.sinks.iter().map(|sink| async move {
            let mut result = WriteResult::new();
            match sink.insert_batch(rows).await {
                Ok(()) => result.add_success(rows.len() as u64),
                Err(e) => {
                    warn!(
                        sink = sink.name(),
                        table = sink.table(),
                        rows = rows.len(),
                        "Insert failed, batch discarded: {}",
                        e
                    );
                    result.add_failure(rows.len() as u64, format!("{}: {}", sink.name(), e));
                }
            }
            result
        }))
        .await;

        for outcome in outcomes {
            if outcome.has_failures() {
                counter!("drover.writer.batches_failed").increment(1);
                counter!("drover.writer.records_failed").increment(outcome.records_failed);
            } else {
                counter!("drover.writer.batches").increment(1);
                counter!("drover.writer.records").increment(outcome.records_written);
            }
            stats.write.merge(outcome);
        }
        stats.flushes += 1;
        histogram!("drover.writer.flush_seconds").record(started.elapsed().as_secs_f64());
        debug!(rows = rows.len(), "Batch flushed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::MockSink;

    #[derive(Debug, Clone, PartialEq)]
    struct Row(u64);

    impl Record for Row {}

    fn writer(sinks: Vec<Arc<dyn Sink<Row>>>, batch: usize) -> Writer<Row> {
        Writer::new(
            sinks,
            WriterSettings {
                insert_batch_size: batch,
                db_save_timeout: Duration::from_secs(1),
            },
        )
    }

    #[tokio::test]
    async fn test_flushes_full_batches_in_order() {
        let sink = MockSink::new("out");
        let (tx, rx) = mpsc::channel(16);
        let handle = writer(vec![Arc::new(sink.clone())], 2).spawn(rx, CancellationToken::new());

        for i in 1..=5 {
            tx.send(Row(i)).await.unwrap();
        }
        drop(tx);
        let stats = handle.await.unwrap();

        assert_eq!(sink.rows(), (1..=5).map(Row).collect::<Vec<_>>());
        assert_eq!(sink.batch_sizes(), vec![2, 2, 1]);
        assert_eq!(stats.received, 5);
        assert_eq!(stats.write.records_written, 5);
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_block_others() {
        let good = MockSink::new("good");
        let bad = MockSink::new("bad").fail_with("connection refused");
        let (tx, rx) = mpsc::channel(16);
        let handle = writer(vec![Arc::new(bad.clone()), Arc::new(good.clone())], 3)
            .spawn(rx, CancellationToken::new());

        for i in 1..=3 {
            tx.send(Row(i)).await.unwrap();
        }
        drop(tx);
        let stats = handle.await.unwrap();

        assert_eq!(good.rows().len(), 3);
        assert!(bad.rows().is_empty());
        assert_eq!(stats.write.records_written, 3);
        assert_eq!(stats.write.records_failed, 3);
    }

    #[tokio::test]
    async fn test_cancel_drains_queued_records() {
        let sink = MockSink::new("out");
        let (tx, rx) = mpsc::channel(16);
        for i in 1..=3 {
            tx.send(Row(i)).await.unwrap();
        }
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stats = writer(vec![Arc::new(sink.clone())], 100).run(rx, cancel).await;

        assert_eq!(sink.rows().len(), 3);
        assert_eq!(stats.dropped, 0);
        // the channel is closed for senders once the writer drains
        assert!(tx.send(Row(4)).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_drain_flushes_in_batches() {
        let sink = MockSink::new("out");
        let (tx, rx) = mpsc::channel(16);
        for i in 1..=7 {
            tx.send(Row(i)).await.unwrap();
        }
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stats = writer(vec![Arc::new(sink.clone())], 2).run(rx, cancel).await;

        assert_eq!(sink.batch_sizes(), vec![2, 2, 2, 1]);
        assert_eq!(sink.rows(), (1..=7).map(Row).collect::<Vec<_>>());
        assert_eq!(stats.received, 7);
        assert_eq!(stats.dropped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_flush_timeout_counts_queued_records() {
        let sink = MockSink::new("slow").with_delay(Duration::from_secs(5));
        let (tx, rx) = mpsc::channel(16);
        for i in 1..=5 {
            tx.send(Row(i)).await.unwrap();
        }
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stats = writer(vec![Arc::new(sink.clone())], 2).run(rx, cancel).await;

        // one batch of 2 in flight when the timeout fires, 3 never pulled
        assert!(sink.rows().is_empty());
        assert_eq!(stats.received, 5);
        assert_eq!(stats.dropped, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_flush_timeout_drops_tail() {
        let sink = MockSink::new("slow").with_delay(Duration::from_secs(5));
        let (tx, rx) = mpsc::channel(16);
        for i in 1..=4 {
            tx.send(Row(i)).await.unwrap();
        }
        drop(tx);

        let stats = writer(vec![Arc::new(sink.clone())], 10)
            .run(rx, CancellationToken::new())
            .await;

        assert!(sink.rows().is_empty());
        assert_eq!(stats.dropped, 4);
    }
}
