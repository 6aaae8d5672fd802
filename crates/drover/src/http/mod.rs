//! HTTP executor
//!
//! Sends one [`Request`] to the subject and returns every attempt it took.
//!
//! ```text
//! allow? ──▶ attempt 1 ──▶ 5xx / no response ──▶ backoff ──▶ attempt 2 ──▶ ...
//!   │            │
//!   │            └──▶ 2xx-3xx: decode body │ 4xx (429 included): stop
//!   └──▶ open / busy: ExecuteError, no attempts
//! ```
//!
//! The circuit breaker sees one outcome per request, taken from the last
//! attempt. A request cancelled mid-flight reports nothing and gives its
//! breaker slot back.

pub mod attempt;

pub use attempt::{Attempt, StatusClass, TRANSPORT_FAILURE_STATUS};

use crate::error::{DroverError, Result};
use crate::request::{Method, Request};
use crate::traits::{CircuitBreakerError, Params, RetryConfig, SharedCircuitBreaker};
use bytes::Bytes;
use metrics::{counter, histogram};
use rand::Rng;
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Reasons a request produced no attempts
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteError {
    /// Circuit breaker is open
    #[error("circuit breaker is open")]
    BreakerOpen,
    /// Circuit breaker is half-open and all probes are in flight
    #[error("circuit breaker is half-open and busy")]
    BreakerBusy,
    /// Shutdown was requested mid-flight
    #[error("request cancelled")]
    Cancelled,
}

impl ExecuteError {
    /// Whether the request was turned away by the breaker
    pub fn is_breaker_rejection(&self) -> bool {
        matches!(self, Self::BreakerOpen | Self::BreakerBusy)
    }
}

/// Executor settings
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Timeout for one attempt, from connect to end of body
    pub attempt_timeout: Duration,
    /// Retry count and backoff window
    pub retry: RetryConfig,
    /// Idle connections kept per host
    pub pool_max_idle_per_host: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(10),
            retry: RetryConfig::window(3, Duration::from_millis(100), Duration::from_secs(5)),
            pool_max_idle_per_host: 32,
        }
    }
}

/// Retrying HTTP client with an optional circuit breaker
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: reqwest::Client,
    config: ExecutorConfig,
    breaker: Option<SharedCircuitBreaker>,
}

impl HttpExecutor {
    pub fn new(config: ExecutorConfig, breaker: Option<SharedCircuitBreaker>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()
            .map_err(|e| DroverError::config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            config,
            breaker,
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn breaker(&self) -> Option<&SharedCircuitBreaker> {
        self.breaker.as_ref()
    }

    /// Execute `request`, returning all attempts in order (never empty on `Ok`)
    pub async fn execute<P, R>(
        &self,
        request: &Request<P>,
        cancel: &CancellationToken,
    ) -> std::result::Result<Vec<Attempt<R>>, ExecuteError>
    where
        P: Params,
        R: DeserializeOwned + Default,
    {
        let admission = match &self.breaker {
            Some(breaker) => match breaker.admit() {
                Ok(admission) => Some(admission),
                Err(CircuitBreakerError::Busy) => {
                    counter!("drover.breaker.rejected", "reason" => "busy").increment(1);
                    return Err(ExecuteError::BreakerBusy);
                }
                Err(CircuitBreakerError::Open) => {
                    counter!("drover.breaker.rejected", "reason" => "open").increment(1);
                    return Err(ExecuteError::BreakerOpen);
                }
            },
            None => None,
        };

        let max_attempts = self.config.retry.max_retries + 1;
        let mut attempts: Vec<Attempt<R>> = Vec::with_capacity(1);

        for number in 1..=max_attempts {
            if number > 1 {
                let delay = self.backoff(number - 1);
                debug!(
                    attempt = number,
                    delay_ms = delay.as_millis() as u64,
                    url = request.url(),
                    "Retrying request"
                );
                counter!("drover.requests.retried").increment(1);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ExecuteError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ExecuteError::Cancelled),
                attempt = self.attempt(request, number) => attempt,
            };

            let class = attempt.class();
            counter!("drover.attempts.total", "class" => class.as_str()).increment(1);
            histogram!("drover.attempts.duration_seconds").record(attempt.elapsed.as_secs_f64());

            if let Some(err) = &attempt.error {
                warn!(attempt = number, url = request.url(), "Request failed: {}", err);
            } else if class.is_retryable() {
                warn!(
                    attempt = number,
                    status = attempt.status,
                    url = request.url(),
                    "Server error"
                );
            }

            attempts.push(attempt);
            if !class.is_retryable() {
                break;
            }
        }

        let last_class = attempts
            .last()
            .map(|a| a.class())
            .unwrap_or(StatusClass::Transport);
        if let Some(admission) = admission {
            admission.record(!last_class.is_breaker_failure());
        }
        counter!("drover.requests.total", "class" => last_class.as_str()).increment(1);

        Ok(attempts)
    }

    /// One exchange, bounded by the attempt timeout
    async fn attempt<P, R>(&self, request: &Request<P>, number: u32) -> Attempt<R>
    where
        P: Params,
        R: DeserializeOwned + Default,
    {
        let start = Instant::now();
        let exchange = async {
            let mut builder = self
                .client
                .request(request.method().as_reqwest(), request.url());
            if request.method() == Method::Post {
                builder = builder.header(reqwest::header::CONTENT_TYPE, "application/json");
                if let Some(body) = request.body() {
                    builder = builder.body(body.clone());
                }
            }
            let response = builder.send().await?;
            let status = response.status().as_u16();
            let raw = response.bytes().await?;
            Ok::<(u16, Bytes), reqwest::Error>((status, raw))
        };

        match tokio::time::timeout(self.config.attempt_timeout, exchange).await {
            Ok(Ok((status, raw))) => {
                let (response, decoded) = decode::<R>(status, &raw, request.url());
                Attempt {
                    number,
                    response,
                    decoded,
                    raw,
                    error: None,
                    status,
                    elapsed: start.elapsed(),
                }
            }
            Ok(Err(e)) => Attempt::transport_failure(number, e.to_string(), start.elapsed()),
            Err(_) => Attempt::transport_failure(
                number,
                format!("timed out after {:?}", self.config.attempt_timeout),
                start.elapsed(),
            ),
        }
    }

    /// Exponential backoff within the configured window, plus random jitter
    fn backoff(&self, retry: u32) -> Duration {
        let window = &self.config.retry;
        let base = window.clone().with_jitter(0.0).delay_for_attempt(retry);
        let base_ms = base.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=(base_ms / 4).max(1));
        Duration::from_millis(base_ms.saturating_add(jitter)).min(window.max_delay)
    }
}

fn decode<R: DeserializeOwned + Default>(status: u16, raw: &[u8], url: &str) -> (R, bool) {
    if StatusClass::classify(status) != StatusClass::Success {
        return (R::default(), false);
    }
    match serde_json::from_slice::<R>(raw) {
        Ok(value) => (value, true),
        Err(e) => {
            debug!(status, url, "Response body did not decode: {}", e);
            counter!("drover.attempts.decode_failed").increment(1);
            (R::default(), false)
        }
    }
}
