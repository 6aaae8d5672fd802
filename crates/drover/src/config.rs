//! Configuration for the drover binary
//!
//! One YAML file describes the subject, the source, the sinks and the stage
//! settings. `${VAR}` and `${VAR:-default}` are expanded before parsing.
//! Store credentials never appear in the file; see [`DroverConfig::source_credentials`]
//! and [`DroverConfig::sink_credentials`].
//!
//! ```yaml
//! mode: two-table
//! api:
//!   host: geocoder.internal
//!   port: 8080
//!   endpoint: /v1/lookup
//!   method: GET
//! provider:
//!   select_batch_size: 500
//!   source:
//!     host: ${CLICKHOUSE_HOST:-localhost}
//!     database: jobs
//!     select_table: addresses
//! writer:
//!   insert_batch_size: 1000
//!   sinks:
//!     - host: ${CLICKHOUSE_HOST:-localhost}
//!       database: jobs
//!       insert_table: geocoded
//! ```

use crate::error::{DroverError, Result};
use crate::http::ExecutorConfig;
use crate::pipeline::{
    result_capacity, FetcherSettings, PipelineSettings, ProviderSettings, WriterSettings,
};
use crate::query::{ContinuousQuery, Mode, QueryBuilder, SqlTemplate, TwoTableQuery};
use crate::request::{BodyMutator, Method, Target};
use crate::store::{validate_table_name, ClickHouseEndpoint};
use crate::traits::{CircuitBreakerConfig, Params, RetryConfig};
use crate::types::Credentials;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::warn;
use validator::Validate;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Environment prefix for source credentials
pub const SOURCE_CREDENTIALS_PREFIX: &str = "DROVER_SOURCE";

/// Environment prefix for sink credentials shared by all sinks
pub const SINK_CREDENTIALS_PREFIX: &str = "DROVER_SINK";

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DroverConfig {
    /// Pipeline mode
    #[serde(default)]
    pub mode: Mode,

    /// Subject endpoint and retry policy
    #[validate(nested)]
    pub api: ApiConfig,

    /// Source and paging settings
    #[validate(nested)]
    pub provider: ProviderConfig,

    /// Worker pool settings
    #[serde(default)]
    #[validate(nested)]
    pub fetcher: FetcherConfig,

    /// Sinks and batching
    #[validate(nested)]
    pub writer: WriterConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,

    #[serde(default)]
    pub log: LogConfig,
}

/// Subject endpoint
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ApiConfig {
    #[serde(default = "default_scheme")]
    pub scheme: String,

    #[validate(length(min = 1, max = 255))]
    pub host: String,

    #[serde(default = "default_api_port")]
    #[validate(range(min = 1))]
    pub port: u16,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub method: Method,

    /// Per-attempt timeout
    #[serde(default = "default_timeout_ms")]
    #[validate(range(min = 1))]
    pub timeout_ms: u64,

    /// Retries after the first attempt
    #[serde(default = "default_num_retries")]
    #[validate(range(max = 100))]
    pub num_retries: u32,

    /// Lower bound of the backoff window
    #[serde(default = "default_min_wait_ms")]
    pub min_wait_ms: u64,

    /// Upper bound of the backoff window
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// JSON file injected as the body of every POST
    #[serde(default)]
    pub body_file_path: Option<PathBuf>,

    /// Static query parameters added to every request
    #[serde(default)]
    pub extra_params: BTreeMap<String, String>,
}

fn default_scheme() -> String {
    "http".to_string()
}
fn default_api_port() -> u16 {
    80
}
fn default_endpoint() -> String {
    "/".to_string()
}
fn default_timeout_ms() -> u64 {
    10_000
}
fn default_num_retries() -> u32 {
    3
}
fn default_min_wait_ms() -> u64 {
    100
}
fn default_max_wait_ms() -> u64 {
    5_000
}

/// Provider settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ProviderConfig {
    /// Quiesce time after an empty poll (continuous mode)
    #[serde(default = "default_sleep_time_secs")]
    pub sleep_time_secs: u64,

    #[serde(default = "default_select_batch_size")]
    #[validate(range(min = 1, max = 1_000_000))]
    pub select_batch_size: usize,

    /// Retries around each SELECT
    #[serde(default = "default_select_retries")]
    pub select_retries: u32,

    #[validate(nested)]
    pub source: SourceConfig,

    /// Required in continuous mode
    #[serde(default)]
    #[validate(nested)]
    pub continuous: Option<ContinuousConfig>,
}

fn default_sleep_time_secs() -> u64 {
    60
}
fn default_select_batch_size() -> usize {
    1000
}
fn default_select_retries() -> u32 {
    3
}

/// Source store and table
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SourceConfig {
    #[serde(flatten)]
    #[validate(nested)]
    pub endpoint: ClickHouseEndpoint,

    /// Reference table
    #[validate(length(min = 1))]
    pub select_table: String,

    /// Custom SELECT template
    #[serde(default)]
    pub select_sql_path: Option<PathBuf>,
}

/// Continuous mode settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ContinuousConfig {
    /// Rows processed within this window are not selected again
    #[serde(default = "default_freshness_secs")]
    #[validate(range(min = 1))]
    pub freshness_secs: u64,

    /// Table holding the latest processing time per key
    #[validate(length(min = 1))]
    pub status_table: String,
}

fn default_freshness_secs() -> u64 {
    3600
}

/// Fetcher pool settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct FetcherConfig {
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,

    #[serde(default = "default_max_workers")]
    #[validate(range(min = 1, max = 10_000))]
    pub max_workers: usize,

    /// Start delay window for workers above `min_workers`
    #[serde(default)]
    pub warmup_secs: u64,

    #[serde(default)]
    pub enable_warmup: bool,

    #[serde(default = "default_idle_time_secs")]
    #[validate(range(min = 1))]
    pub idle_time_secs: u64,

    #[serde(default = "default_stats_interval_secs")]
    #[validate(range(min = 1))]
    pub stats_interval_secs: u64,

    #[serde(default)]
    pub circuit_breaker: BreakerConfig,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            warmup_secs: 0,
            enable_warmup: false,
            idle_time_secs: default_idle_time_secs(),
            stats_interval_secs: default_stats_interval_secs(),
            circuit_breaker: BreakerConfig::default(),
        }
    }
}

fn default_min_workers() -> usize {
    1
}
fn default_max_workers() -> usize {
    8
}
fn default_idle_time_secs() -> u64 {
    30
}
fn default_stats_interval_secs() -> u64 {
    10
}

/// Circuit breaker around the subject
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Half-open probes
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    #[serde(default = "default_consecutive_failures")]
    pub consecutive_failures: u32,

    /// 0 disables the rule
    #[serde(default)]
    pub total_failures_per_interval: u32,

    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Open duration, also the pause a worker takes after a rejection
    #[serde(default = "default_breaker_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: default_max_requests(),
            consecutive_failures: default_consecutive_failures(),
            total_failures_per_interval: 0,
            interval_secs: default_interval_secs(),
            timeout_secs: default_breaker_timeout_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_requests() -> u32 {
    1
}
fn default_consecutive_failures() -> u32 {
    5
}
fn default_interval_secs() -> u64 {
    60
}
fn default_breaker_timeout_secs() -> u64 {
    30
}

/// Writer settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct WriterConfig {
    #[serde(default = "default_insert_batch_size")]
    #[validate(range(min = 1, max = 1_000_000))]
    pub insert_batch_size: usize,

    /// Run label stored on every record; `--tag` overrides it
    #[serde(default)]
    pub save_tag: String,

    #[validate(length(min = 1), nested)]
    pub sinks: Vec<SinkConfig>,
}

fn default_insert_batch_size() -> usize {
    1000
}

/// One sink store and table
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SinkConfig {
    #[serde(flatten)]
    #[validate(nested)]
    pub endpoint: ClickHouseEndpoint,

    #[validate(length(min = 1))]
    pub insert_table: String,
}

/// Shutdown timing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShutdownConfig {
    /// How long the process waits for the stages after a signal
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    /// Cap on the writer's final flush
    #[serde(default = "default_db_save_timeout_secs")]
    pub db_save_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            db_save_timeout_secs: default_db_save_timeout_secs(),
        }
    }
}

fn default_grace_period_secs() -> u64 {
    30
}
fn default_db_save_timeout_secs() -> u64 {
    20
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogEncoding {
    #[default]
    Console,
    Json,
}

/// Logging settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub encoding: LogEncoding,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            encoding: LogEncoding::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DroverConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DroverError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| DroverError::config(format!("failed to parse config: {}", e)))?;
        config.check()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Structural rules plus cross-field checks
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| DroverError::config(format!("validation failed: {}", e)))?;

        if !matches!(self.api.scheme.as_str(), "http" | "https") {
            return Err(DroverError::config(format!(
                "api.scheme must be http or https, got '{}'",
                self.api.scheme
            )));
        }
        if self.api.min_wait_ms > self.api.max_wait_ms {
            return Err(DroverError::config(
                "api.min_wait_ms must not exceed api.max_wait_ms",
            ));
        }
        if self.fetcher.min_workers > self.fetcher.max_workers {
            return Err(DroverError::config(
                "fetcher.min_workers must not exceed fetcher.max_workers",
            ));
        }
        if self.fetcher.enable_warmup && self.fetcher.warmup_secs == 0 {
            return Err(DroverError::config(
                "fetcher.warmup_secs must be positive when warm-up is enabled",
            ));
        }

        validate_table_name(&self.provider.source.select_table).map_err(table_error)?;
        for sink in &self.writer.sinks {
            validate_table_name(&sink.insert_table).map_err(table_error)?;
        }

        match self.mode {
            Mode::TwoTable => {
                let source = &self.provider.source;
                let clash = self.writer.sinks.iter().any(|sink| {
                    sink.endpoint.host == source.endpoint.host
                        && sink.endpoint.port == source.endpoint.port
                        && sink.endpoint.database == source.endpoint.database
                        && sink.insert_table == source.select_table
                });
                if clash {
                    return Err(DroverError::config(
                        "two-table mode needs a sink table distinct from the source table",
                    ));
                }
            }
            Mode::Continuous => {
                let continuous = self.provider.continuous.as_ref().ok_or_else(|| {
                    DroverError::config("continuous mode requires a provider.continuous section")
                })?;
                validate_table_name(&continuous.status_table).map_err(table_error)?;
                if self.fetcher.idle_time_secs <= self.provider.sleep_time_secs {
                    warn!(
                        idle_time_secs = self.fetcher.idle_time_secs,
                        sleep_time_secs = self.provider.sleep_time_secs,
                        resident_workers = self.fetcher.min_workers.max(1),
                        "Surplus fetchers retire during every quiesce"
                    );
                }
            }
        }

        if self.api.body_file_path.is_some() && self.api.method == Method::Get {
            warn!("api.body_file_path is ignored for GET requests");
        }
        if self.shutdown.db_save_timeout_secs > self.shutdown.grace_period_secs {
            warn!(
                db_save_timeout_secs = self.shutdown.db_save_timeout_secs,
                grace_period_secs = self.shutdown.grace_period_secs,
                "Final flush may be cut short by the grace period"
            );
        }
        Ok(())
    }

    /// Subject target
    pub fn target(&self) -> Result<Target> {
        Target::new(
            &self.api.scheme,
            &self.api.host,
            self.api.port,
            &self.api.endpoint,
            self.api.method,
            self.api
                .extra_params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            attempt_timeout: Duration::from_millis(self.api.timeout_ms),
            retry: RetryConfig::window(
                self.api.num_retries,
                Duration::from_millis(self.api.min_wait_ms),
                Duration::from_millis(self.api.max_wait_ms),
            ),
            pool_max_idle_per_host: self.fetcher.max_workers,
        }
    }

    /// Breaker settings, `None` when disabled
    pub fn breaker_config(&self) -> Option<CircuitBreakerConfig> {
        let cb = &self.fetcher.circuit_breaker;
        cb.enabled.then(|| CircuitBreakerConfig {
            max_requests: cb.max_requests.max(1),
            interval: Duration::from_secs(cb.interval_secs),
            timeout: Duration::from_secs(cb.timeout_secs),
            consecutive_failures: cb.consecutive_failures,
            total_failures_per_interval: cb.total_failures_per_interval,
        })
    }

    /// Stage settings; `tag` overrides `writer.save_tag`
    pub fn pipeline_settings(&self, tag: Option<&str>) -> PipelineSettings {
        PipelineSettings {
            tag: tag.unwrap_or(&self.writer.save_tag).to_string(),
            provider: ProviderSettings {
                select_batch_size: self.provider.select_batch_size,
                select_retry: RetryConfig::window(
                    self.provider.select_retries,
                    Duration::from_secs(1),
                    Duration::from_secs(30),
                ),
                sleep_time: Duration::from_secs(self.provider.sleep_time_secs),
            },
            fetcher: FetcherSettings {
                min_workers: self.fetcher.min_workers,
                max_workers: self.fetcher.max_workers,
                warmup: self
                    .fetcher
                    .enable_warmup
                    .then(|| Duration::from_secs(self.fetcher.warmup_secs)),
                idle_time: Duration::from_secs(self.fetcher.idle_time_secs),
                stats_interval: Duration::from_secs(self.fetcher.stats_interval_secs),
                breaker_pause: Duration::from_secs(self.fetcher.circuit_breaker.timeout_secs),
                result_capacity: result_capacity(self.writer.insert_batch_size),
            },
            writer: WriterSettings {
                insert_batch_size: self.writer.insert_batch_size,
                db_save_timeout: Duration::from_secs(self.shutdown.db_save_timeout_secs),
            },
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown.grace_period_secs)
    }

    /// Query builder for the configured mode, with the custom template if any
    pub fn query_builder<P: Params>(&self) -> Result<Box<dyn QueryBuilder<P>>> {
        let source = &self.provider.source;
        let limit = self.provider.select_batch_size;
        let text = source
            .select_sql_path
            .as_ref()
            .map(|path| {
                std::fs::read_to_string(path).map_err(|e| {
                    DroverError::config(format!("failed to read {}: {}", path.display(), e))
                })
            })
            .transpose()?;

        match self.mode {
            Mode::TwoTable => {
                let query = match text {
                    Some(text) => TwoTableQuery::with_template(
                        TwoTableQuery::parse_template(&text)?,
                        &source.select_table,
                        limit,
                    ),
                    None => TwoTableQuery::new(&source.select_table, limit),
                };
                Ok(Box::new(query))
            }
            Mode::Continuous => {
                let continuous = self.provider.continuous.as_ref().ok_or_else(|| {
                    DroverError::config("continuous mode requires a provider.continuous section")
                })?;
                let freshness = Duration::from_secs(continuous.freshness_secs);
                let template: Option<SqlTemplate> = text
                    .map(|t| ContinuousQuery::parse_template(&t))
                    .transpose()?;
                let query = match template {
                    Some(template) => ContinuousQuery::with_template(
                        template,
                        &source.select_table,
                        &continuous.status_table,
                        limit,
                        freshness,
                    ),
                    None => ContinuousQuery::new(
                        &source.select_table,
                        &continuous.status_table,
                        limit,
                        freshness,
                    ),
                };
                Ok(Box::new(query))
            }
        }
    }

    /// Body template, inactive when no file is configured
    pub fn body_mutator(&self) -> Result<BodyMutator> {
        BodyMutator::from_optional(self.api.body_file_path.as_deref())
    }

    /// `DROVER_SOURCE_USER` / `DROVER_SOURCE_PASSWORD`
    pub fn source_credentials(&self) -> Credentials {
        Credentials::from_env(SOURCE_CREDENTIALS_PREFIX, None)
    }

    /// `DROVER_SINK_<index>_*`, falling back to `DROVER_SINK_*`
    pub fn sink_credentials(&self, index: usize) -> Credentials {
        Credentials::from_env(
            &format!("{}_{}", SINK_CREDENTIALS_PREFIX, index),
            Some(SINK_CREDENTIALS_PREFIX),
        )
    }
}

fn table_error(err: crate::error::StoreError) -> DroverError {
    DroverError::config(err.to_string())
}
