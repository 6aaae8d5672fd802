//! Continuous polling for stale rows
//!
//! Each pass starts at `start_ts`. A row is eligible when its latest status
//! timestamp is older than `start_ts - freshness` and its `(ts, id)` pair is
//! past the cursor. Rows never seen in the status table have `ts = 0`.
//!
//! The cursor moves to the lexicographic maximum `(ts, key)` of every batch,
//! so a batch that straddles a timestamp boundary resumes within that
//! timestamp at the next key. Pages are cut in `(ts, id)` order so nothing
//! below the cursor is left behind; only the final row order is hashed.

use super::template::{SqlTemplate, TemplateError};
use super::{Mode, QueryBuilder};
use crate::traits::Params;
use std::time::Duration;

/// Default SELECT for continuous mode
pub const DEFAULT_TEMPLATE: &str = r#"
WITH
    latest AS (
        SELECT id, max(toUnixTimestamp(created_at)) AS ts
        FROM {status_table}
        GROUP BY id
    ),
    stale AS (
        SELECT ref.id AS id, latest.ts AS ts
        FROM {table} AS ref
        LEFT JOIN latest ON latest.id = ref.id
        WHERE latest.ts < {start_ts} - {freshness}
    ),
    page AS (
        SELECT id, ts
        FROM stale
        WHERE (ts, id) > ({last_ts}, {last_key})
        ORDER BY ts, id
        LIMIT {limit}
    )
SELECT ref.* EXCEPT (ts), page.ts AS ts
FROM {table} AS ref
INNER JOIN page ON page.id = ref.id
ORDER BY cityHash64(ref.id)
"#;

/// Placeholders accepted in continuous templates
pub const PLACEHOLDERS: &[&str] = &[
    "table",
    "status_table",
    "limit",
    "last_key",
    "start_ts",
    "last_ts",
    "freshness",
];

/// `(start_ts, last_ts, last_key)` cursor
#[derive(Debug, Clone)]
pub struct ContinuousQuery {
    template: SqlTemplate,
    table: String,
    status_table: String,
    limit: usize,
    freshness: Duration,
    start_ts: i64,
    last_ts: i64,
    last_key: u64,
}

impl ContinuousQuery {
    /// Builder using the default template; the first pass starts now
    pub fn new(
        table: impl Into<String>,
        status_table: impl Into<String>,
        limit: usize,
        freshness: Duration,
    ) -> Self {
        Self::with_template(
            SqlTemplate::builtin(DEFAULT_TEMPLATE),
            table,
            status_table,
            limit,
            freshness,
        )
    }

    /// Builder using a custom template
    pub fn with_template(
        template: SqlTemplate,
        table: impl Into<String>,
        status_table: impl Into<String>,
        limit: usize,
        freshness: Duration,
    ) -> Self {
        Self {
            template,
            table: table.into(),
            status_table: status_table.into(),
            limit,
            freshness,
            start_ts: now(),
            last_ts: 0,
            last_key: 0,
        }
    }

    /// Parse a custom template for this mode
    pub fn parse_template(text: &str) -> Result<SqlTemplate, TemplateError> {
        SqlTemplate::parse(text, PLACEHOLDERS, &["start_ts"])
    }

    /// Current `(start_ts, last_ts, last_key)`
    pub fn cursor(&self) -> (i64, i64, u64) {
        (self.start_ts, self.last_ts, self.last_key)
    }

    /// Start a new pass at `start_ts`
    pub fn reset_at(&mut self, start_ts: i64) {
        self.start_ts = start_ts;
        self.last_ts = 0;
        self.last_key = 0;
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl<P: Params> QueryBuilder<P> for ContinuousQuery {
    fn mode(&self) -> Mode {
        Mode::Continuous
    }

    fn render(&self) -> String {
        self.template.render(&[
            ("table", self.table.clone()),
            ("status_table", self.status_table.clone()),
            ("limit", self.limit.to_string()),
            ("last_key", self.last_key.to_string()),
            ("start_ts", self.start_ts.to_string()),
            ("last_ts", self.last_ts.to_string()),
            ("freshness", self.freshness.as_secs().to_string()),
        ])
    }

    fn absorb(&mut self, batch: &[P]) {
        let current = (self.last_ts, self.last_key);
        let next = batch
            .iter()
            .map(|p| (p.cursor_ts().unwrap_or(0), p.key()))
            .fold(current, |acc, item| acc.max(item));
        (self.last_ts, self.last_key) = next;
    }

    fn reset(&mut self) {
        self.reset_at(now());
    }
}
