//! Fetcher stage
//!
//! A pool of workers sharing the request channel. Each worker executes one
//! request at a time and converts every attempt into a record through the
//! subject's response adapter.
//!
//! Workers below `min_workers` start at once; the rest start after a random
//! delay within the warm-up window. The first `min_workers` (at least one)
//! are resident and leave only when the request channel closes or
//! cancellation fires. Surplus workers also retire after `idle_time` without
//! a request, so a quiet provider shrinks the pool without ending it.
//!
//! The pool supervisor holds the result sender until every worker has exited
//! and then drops it, which closes the result channel exactly once.

use crate::http::{ExecuteError, HttpExecutor};
use crate::request::Request;
use crate::traits::{AttemptContext, Subject};
use metrics::{counter, gauge};
use rand::Rng;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Fetcher pool settings
#[derive(Debug, Clone)]
pub struct FetcherSettings {
    /// Workers started immediately
    pub min_workers: usize,
    /// Pool size
    pub max_workers: usize,
    /// Warm-up window for workers above `min_workers`; `None` starts all at once
    pub warmup: Option<Duration>,
    /// Surplus workers retire after this long without a request
    pub idle_time: Duration,
    /// How often the active-requests gauge is logged
    pub stats_interval: Duration,
    /// Pause after a breaker rejection
    pub breaker_pause: Duration,
    /// Result channel capacity
    pub result_capacity: usize,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 8,
            warmup: None,
            idle_time: Duration::from_secs(30),
            stats_interval: Duration::from_secs(10),
            breaker_pause: Duration::from_secs(30),
            result_capacity: super::result_capacity(1000),
        }
    }
}

/// Counters reported when the pool stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetcherStats {
    /// Requests executed (at least one attempt)
    pub requests: u64,
    /// Records pushed onto the result channel
    pub records: u64,
    /// Requests turned away by the circuit breaker
    pub rejected: u64,
    /// Records lost because shutdown interrupted the push
    pub dropped: u64,
    /// Surplus workers retired after `idle_time` without a request
    pub idle_exits: u64,
}

impl FetcherStats {
    fn merge(&mut self, other: FetcherStats) {
        self.requests += other.requests;
        self.records += other.records;
        self.rejected += other.rejected;
        self.dropped += other.dropped;
        self.idle_exits += other.idle_exits;
    }
}

type SharedRequests<P> = Arc<Mutex<mpsc::Receiver<Request<P>>>>;

/// Pool of request executors
pub struct FetcherPool<S: Subject> {
    executor: Arc<HttpExecutor>,
    settings: FetcherSettings,
    tag: Arc<str>,
    _subject: PhantomData<fn() -> S>,
}

impl<S: Subject> FetcherPool<S> {
    pub fn new(
        executor: Arc<HttpExecutor>,
        settings: FetcherSettings,
        tag: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            executor,
            settings,
            tag: tag.into(),
            _subject: PhantomData,
        }
    }

    /// Start the workers and hand back the result channel
    pub fn spawn(
        self,
        requests: mpsc::Receiver<Request<S::Params>>,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<S::Record>, JoinHandle<FetcherStats>) {
        let (tx, rx) = mpsc::channel(self.settings.result_capacity.max(1));
        let handle = tokio::spawn(self.supervise(requests, tx, cancel));
        (rx, handle)
    }

    async fn supervise(
        self,
        requests: mpsc::Receiver<Request<S::Params>>,
        tx: mpsc::Sender<S::Record>,
        cancel: CancellationToken,
    ) -> FetcherStats {
        let requests: SharedRequests<S::Params> = Arc::new(Mutex::new(requests));
        let active = Arc::new(AtomicU64::new(0));
        let pool_size = self.settings.max_workers.max(1);

        let mut workers = JoinSet::new();
        for index in 0..pool_size {
            let worker = Worker::<S> {
                index,
                executor: self.executor.clone(),
                settings: self.settings.clone(),
                tag: self.tag.clone(),
                requests: requests.clone(),
                results: tx.clone(),
                active: active.clone(),
                _subject: PhantomData,
            };
            workers.spawn(worker.run(cancel.clone()));
        }
        info!(
            workers = pool_size,
            resident = resident_workers(&self.settings).min(pool_size),
            warmup_secs = self.settings.warmup.map(|w| w.as_secs_f64()),
            "Fetcher pool started"
        );

        let mut stats = FetcherStats::default();
        let mut ticker =
            tokio::time::interval(self.settings.stats_interval.max(Duration::from_millis(1)));
        ticker.tick().await;

        loop {
            tokio::select! {
                joined = workers.join_next() => match joined {
                    Some(Ok(worker_stats)) => stats.merge(worker_stats),
                    Some(Err(e)) => error!("Fetcher worker terminated abnormally: {}", e),
                    None => break,
                },
                _ = ticker.tick() => {
                    info!(
                        active_requests = active.load(Ordering::Relaxed),
                        workers = workers.len(),
                        records = stats.records,
                        "Fetcher pool stats"
                    );
                }
            }
        }

        // all workers are gone; dropping the last sender closes the result channel
        drop(tx);
        info!(
            requests = stats.requests,
            records = stats.records,
            rejected = stats.rejected,
            dropped = stats.dropped,
            idle_exits = stats.idle_exits,
            "Fetcher pool stopped"
        );
        stats
    }
}

/// Workers that never idle out
fn resident_workers(settings: &FetcherSettings) -> usize {
    settings.min_workers.max(1)
}

/// Start delay for worker `index`: zero below `min_workers` or without
/// warm-up, otherwise uniform in `[0, warmup]`
fn startup_delay(settings: &FetcherSettings, index: usize) -> Duration {
    match settings.warmup {
        Some(window) if index >= settings.min_workers => {
            let max_ms = window.as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
        }
        _ => Duration::ZERO,
    }
}

struct Worker<S: Subject> {
    index: usize,
    executor: Arc<HttpExecutor>,
    settings: FetcherSettings,
    tag: Arc<str>,
    requests: SharedRequests<S::Params>,
    results: mpsc::Sender<S::Record>,
    active: Arc<AtomicU64>,
    _subject: PhantomData<fn() -> S>,
}

impl<S: Subject> Worker<S> {
    async fn run(self, cancel: CancellationToken) -> FetcherStats {
        let mut stats = FetcherStats::default();
        let resident = self.index < resident_workers(&self.settings);

        let delay = startup_delay(&self.settings, self.index);
        if !delay.is_zero() {
            debug!(worker = self.index, delay_ms = delay.as_millis() as u64, "Worker warming up");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return stats,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        'outer: loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = tokio::time::timeout(self.settings.idle_time, async {
                    self.requests.lock().await.recv().await
                }) => next,
            };

            let request = match next {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(_) if resident => continue,
                Err(_) => {
                    debug!(worker = self.index, "Worker idle, retiring");
                    stats.idle_exits += 1;
                    break;
                }
            };

            let in_flight = self.active.fetch_add(1, Ordering::Relaxed) + 1;
            gauge!("drover.requests.active").set(in_flight as f64);
            let outcome = self
                .executor
                .execute::<S::Params, S::Response>(&request, &cancel)
                .await;
            let in_flight = self.active.fetch_sub(1, Ordering::Relaxed) - 1;
            gauge!("drover.requests.active").set(in_flight as f64);

            let attempts = match outcome {
                Ok(attempts) => attempts,
                Err(ExecuteError::Cancelled) => break,
                Err(rejection) => {
                    stats.rejected += 1;
                    debug!(
                        worker = self.index,
                        pause_ms = self.settings.breaker_pause.as_millis() as u64,
                        "Request dropped: {}",
                        rejection
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.breaker_pause) => {}
                    }
                    continue;
                }
            };

            stats.requests += 1;
            for (pushed, attempt) in attempts.iter().enumerate() {
                let ctx = AttemptContext {
                    attempt: attempt.number,
                    status_code: attempt.status_code(),
                    elapsed: attempt.elapsed,
                    tag: &self.tag,
                    url: request.url(),
                };
                let record = S::into_record(request.params(), attempt, &ctx);

                tokio::select! {
                    biased;
                    sent = self.results.send(record) => {
                        if sent.is_err() {
                            stats.dropped += (attempts.len() - pushed) as u64;
                            warn!(worker = self.index, "Result channel closed, records dropped");
                            break 'outer;
                        }
                    }
                    _ = cancel.cancelled() => {
                        stats.dropped += (attempts.len() - pushed) as u64;
                        break 'outer;
                    }
                }
                stats.records += 1;
                counter!("drover.fetcher.records").increment(1);
            }
        }

        debug!(worker = self.index, requests = stats.requests, "Worker stopped");
        stats
    }
}
