//! ClickHouse store adapter
//!
//! One [`ClickHouseStore`] is bound to one table. It acts as a [`Source`]
//! (rendered SELECT, rows bound to the Params type) or as a [`Sink`]
//! (`INSERT INTO <table>` in `RowBinary`, one server-side insert per batch).
//!
//! Neither side retries; failures are classified into [`StoreError`] and the
//! caller decides.
//!
//! # Configuration
//!
//! ```yaml
//! host: clickhouse.internal
//! port: 8123
//! database: analytics
//! compression: lz4
//! ```
//!
//! Credentials are supplied separately (see [`Credentials::from_env`]).
//!
//! # Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `drover.store.selects` | Counter | SELECT statements executed |
//! | `drover.store.rows_selected` | Counter | Rows bound from SELECTs |
//! | `drover.store.inserts` | Counter | Insert batches committed |
//! | `drover.store.errors` | Counter | Failed store operations, by `op` |
//! | `drover.store.duration_seconds` | Histogram | Store round-trip latency, by `op` |

use crate::error::{StoreError, StoreResult};
use crate::traits::{Params, Record, Sink, Source};
use crate::types::Credentials;
use async_trait::async_trait;
use clickhouse::Client;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use validator::Validate;

/// Compression used on the wire
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClickHouseCompression {
    /// No compression
    None,
    /// LZ4 compression (ClickHouse native)
    #[default]
    Lz4,
}

/// Connection settings for one ClickHouse endpoint
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ClickHouseEndpoint {
    /// Server host name
    #[validate(length(min = 1, max = 255))]
    pub host: String,

    /// HTTP interface port
    #[serde(default = "default_port")]
    #[validate(range(min = 1))]
    pub port: u16,

    /// Database name
    #[serde(default = "default_database")]
    #[validate(length(min = 1, max = 255))]
    pub database: String,

    /// Use HTTPS
    #[serde(default)]
    pub secure: bool,

    /// Compression algorithm
    #[serde(default)]
    pub compression: ClickHouseCompression,
}

fn default_port() -> u16 {
    8123
}

fn default_database() -> String {
    "default".to_string()
}

impl ClickHouseEndpoint {
    /// Endpoint on `host` with defaults for everything else
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            database: default_database(),
            secure: false,
            compression: ClickHouseCompression::default(),
        }
    }

    /// HTTP(S) URL of the endpoint
    pub fn url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Pre-compiled identifier pattern for database and table names
static IDENTIFIER_PATTERN: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| {
        regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
            .expect("identifier regex pattern is invalid - this is a bug")
    });

/// Validate a database name
pub fn validate_database_name(name: &str) -> StoreResult<()> {
    if name.contains('.') || !IDENTIFIER_PATTERN.is_match(name) {
        return Err(StoreError::Invalid(format!(
            "Invalid database name '{}': must match [A-Za-z_][A-Za-z0-9_]*",
            name
        )));
    }
    Ok(())
}

/// Validate a table name, optionally qualified as `database.table`
pub fn validate_table_name(name: &str) -> StoreResult<()> {
    if !IDENTIFIER_PATTERN.is_match(name) {
        return Err(StoreError::Invalid(format!(
            "Invalid table name '{}': must match [A-Za-z_][A-Za-z0-9_]*, \
             optionally prefixed by 'database.'",
            name
        )));
    }
    Ok(())
}

/// Classify a `clickhouse::error::Error` into a [`StoreError`].
fn classify_clickhouse_error(err: &clickhouse::error::Error) -> StoreError {
    let msg = err.to_string();
    let lower = msg.to_lowercase();

    if lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection")
        || lower.contains("network")
        || lower.contains("broken pipe")
        || lower.contains("reset by peer")
        || lower.contains("service_unavailable")
        || lower.contains("too many requests")
    {
        StoreError::Unavailable(msg)
    } else if lower.contains("no such column")
        || lower.contains("type mismatch")
        || lower.contains("expected column")
        || lower.contains("expected '")
        || lower.contains("not enough data")
        || lower.contains("deserialize")
    {
        StoreError::Decode(msg)
    } else {
        StoreError::Query(msg)
    }
}

/// Generate a session ID for structured logging correlation.
fn generate_session_id() -> String {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros();
    format!("drover-ch-{}-{}", std::process::id(), micros)
}

/// ClickHouse client bound to one table
#[derive(Clone)]
pub struct ClickHouseStore {
    client: Client,
    name: String,
    table: String,
    session_id: String,
}

impl std::fmt::Debug for ClickHouseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClickHouseStore")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl ClickHouseStore {
    /// Build a client without contacting the server
    pub fn new(
        endpoint: &ClickHouseEndpoint,
        table: &str,
        credentials: &Credentials,
    ) -> StoreResult<Self> {
        validate_database_name(&endpoint.database)?;
        validate_table_name(table)?;

        let mut client = Client::default()
            .with_url(endpoint.url())
            .with_database(&endpoint.database)
            .with_user(&credentials.user);

        if let Some(ref password) = credentials.password {
            client = client.with_password(password.expose_secret());
        }

        match endpoint.compression {
            ClickHouseCompression::Lz4 => {
                client = client.with_compression(clickhouse::Compression::Lz4);
            }
            ClickHouseCompression::None => {
                client = client.with_compression(clickhouse::Compression::None);
            }
        }

        Ok(Self {
            client,
            name: format!("{}/{}", endpoint.url(), table),
            table: table.to_string(),
            session_id: generate_session_id(),
        })
    }

    /// Build a client and verify the server answers `SELECT version()`
    pub async fn connect(
        endpoint: &ClickHouseEndpoint,
        table: &str,
        credentials: &Credentials,
    ) -> StoreResult<Self> {
        let store = Self::new(endpoint, table, credentials)?;
        let version = store.version().await?;
        info!(
            session_id = %store.session_id,
            url = %endpoint.url(),
            database = %endpoint.database,
            table = %store.table,
            version = %version,
            "Connected to ClickHouse"
        );
        Ok(store)
    }

    /// Server version string
    pub async fn version(&self) -> StoreResult<String> {
        self.client
            .query("SELECT version()")
            .fetch_one::<String>()
            .await
            .map_err(|e| match classify_clickhouse_error(&e) {
                StoreError::Query(msg) | StoreError::Decode(msg) => {
                    StoreError::Unavailable(format!("handshake failed: {}", msg))
                }
                other => other,
            })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

fn record_failure(op: &'static str, started: Instant, err: &StoreError) {
    counter!("drover.store.errors", "op" => op).increment(1);
    histogram!("drover.store.duration_seconds", "op" => op).record(started.elapsed().as_secs_f64());
    warn!(op, "ClickHouse operation failed: {}", err);
}

#[async_trait]
impl<P> Source<P> for ClickHouseStore
where
    P: Params + clickhouse::RowOwned + clickhouse::RowRead,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_next_batch(&self, sql: &str) -> StoreResult<Vec<P>> {
        let started = Instant::now();
        debug!(session_id = %self.session_id, sql, "Selecting batch");

        match self.client.query(sql).fetch_all::<P>().await {
            Ok(rows) => {
                counter!("drover.store.selects").increment(1);
                counter!("drover.store.rows_selected").increment(rows.len() as u64);
                histogram!("drover.store.duration_seconds", "op" => "select")
                    .record(started.elapsed().as_secs_f64());
                Ok(rows)
            }
            Err(e) => {
                let err = classify_clickhouse_error(&e);
                record_failure("select", started, &err);
                Err(err)
            }
        }
    }
}

#[async_trait]
impl<R> Sink<R> for ClickHouseStore
where
    R: Record + clickhouse::RowOwned + clickhouse::RowWrite,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn table(&self) -> &str {
        &self.table
    }

    async fn init_table(&self, ddl: &str) -> StoreResult<()> {
        let started = Instant::now();
        self.client.query(ddl).execute().await.map_err(|e| {
            let err = classify_clickhouse_error(&e);
            record_failure("ddl", started, &err);
            err
        })?;
        info!(session_id = %self.session_id, table = %self.table, "Table initialised");
        Ok(())
    }

    async fn insert_batch(&self, rows: &[R]) -> StoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let started = Instant::now();

        let result = async {
            let mut insert = self
                .client
                .insert::<R>(&self.table)
                .await
                .map_err(|e| StoreError::unavailable(format!("Failed to begin insert: {}", e)))?;

            for row in rows {
                insert
                    .write(row)
                    .await
                    .map_err(|e| classify_clickhouse_error(&e))?;
            }

            insert.end().await.map_err(|e| classify_clickhouse_error(&e))
        }
        .await;

        match result {
            Ok(()) => {
                counter!("drover.store.inserts").increment(1);
                histogram!("drover.store.duration_seconds", "op" => "insert")
                    .record(started.elapsed().as_secs_f64());
                debug!(
                    session_id = %self.session_id,
                    table = %self.table,
                    rows = rows.len(),
                    "Batch inserted"
                );
                Ok(())
            }
            Err(err) => {
                record_failure("insert", started, &err);
                Err(err)
            }
        }
    }
}
