//! Provider stage
//!
//! Pages through the source with a [`QueryBuilder`] and turns every row into a
//! [`Request`]. The provider is the only sender on the request channel; it
//! closes the channel by returning. Consumers hanging up before the provider
//! is done (and without cancellation) is a stage failure.

use crate::error::{DroverError, Result};
use crate::query::{Mode, QueryBuilder};
use crate::request::{BodyMutator, Request, Target};
use crate::traits::{retry, Params, RetryConfig, Source};
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Provider settings
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    /// Rows per SELECT; also sizes the request channel
    pub select_batch_size: usize,
    /// Retry policy around each SELECT
    pub select_retry: RetryConfig,
    /// Quiesce time after an empty batch in continuous mode
    pub sleep_time: Duration,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            select_batch_size: 1000,
            select_retry: RetryConfig::window(3, Duration::from_secs(1), Duration::from_secs(30)),
            sleep_time: Duration::from_secs(60),
        }
    }
}

/// Counters reported when the provider stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderStats {
    /// Non-empty batches selected
    pub batches: u64,
    /// Requests pushed onto the channel
    pub requests: u64,
    /// Empty polls (continuous mode quiesce count)
    pub empty_polls: u64,
    /// Rows that received the body template
    pub bodies_applied: u64,
}

/// Lazily produces requests from paged store queries
pub struct Provider<P: Params> {
    source: Arc<dyn Source<P>>,
    query: Box<dyn QueryBuilder<P>>,
    mutator: BodyMutator,
    target: Arc<Target>,
    settings: ProviderSettings,
}

impl<P: Params> Provider<P> {
    pub fn new(
        source: Arc<dyn Source<P>>,
        query: Box<dyn QueryBuilder<P>>,
        mutator: BodyMutator,
        target: Arc<Target>,
        settings: ProviderSettings,
    ) -> Self {
        Self {
            source,
            query,
            mutator,
            target,
            settings,
        }
    }

    /// Start the provider on its own task and hand back the request channel
    pub fn spawn(
        self,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<Request<P>>, JoinHandle<Result<ProviderStats>>) {
        let (tx, rx) = mpsc::channel(super::request_capacity(self.settings.select_batch_size));
        let handle = tokio::spawn(self.run(tx, cancel));
        (rx, handle)
    }

    /// Run until the source is drained (two-table) or `cancel` fires.
    ///
    /// Returns an error when the SELECT retries run out or the request
    /// channel is closed underneath a live provider.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<Request<P>>,
        cancel: CancellationToken,
    ) -> Result<ProviderStats> {
        let mode = self.query.mode();
        let mut stats = ProviderStats::default();
        info!(
            source = self.source.name(),
            mode = %mode,
            batch_size = self.settings.select_batch_size,
            body_template = self.mutator.is_active(),
            "Provider started"
        );

        'outer: loop {
            let sql = self.query.render();
            let source = &self.source;
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = retry(&self.settings.select_retry, || source.get_next_batch(&sql)) => res,
            };

            let attempts = fetched.attempts;
            let mut batch = match fetched.into_result() {
                Ok(batch) => batch,
                Err(e) => {
                    counter!("drover.provider.select_failed").increment(1);
                    error!(attempts, "Source SELECT failed, stopping provider: {}", e);
                    return Err(e.into());
                }
            };

            if batch.is_empty() {
                stats.empty_polls += 1;
                match mode {
                    Mode::TwoTable => {
                        info!(requests = stats.requests, "Source drained");
                        break;
                    }
                    Mode::Continuous => {
                        debug!(
                            sleep_secs = self.settings.sleep_time.as_secs_f64(),
                            "No eligible rows, quiescing"
                        );
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(self.settings.sleep_time) => {}
                        }
                        self.query.reset();
                        continue;
                    }
                }
            }

            self.query.absorb(&batch);
            stats.bodies_applied += self.mutator.apply_all(&mut batch) as u64;
            stats.batches += 1;
            counter!("drover.provider.rows").increment(batch.len() as u64);
            debug!(rows = batch.len(), "Batch selected");

            for params in batch {
                let request = Request::new(self.target.clone(), params);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'outer,
                    sent = tx.send(request) => {
                        if sent.is_err() {
                            if cancel.is_cancelled() {
                                break 'outer;
                            }
                            error!(
                                requests = stats.requests,
                                "Request channel closed while rows were pending"
                            );
                            return Err(DroverError::stage(
                                "provider",
                                "request channel closed before the source was drained",
                            ));
                        }
                    }
                }
                stats.requests += 1;
            }
            gauge!("drover.provider.queue_capacity").set(tx.capacity() as f64);
        }

        info!(
            batches = stats.batches,
            requests = stats.requests,
            empty_polls = stats.empty_polls,
            "Provider stopped"
        );
        Ok(stats)
    }
}
