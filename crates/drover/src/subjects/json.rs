//! Generic JSON subject
//!
//! Drives any JSON API from a reference table of the shape
//!
//! ```sql
//! CREATE TABLE requests (id UInt64, payload String, ts Int64) ENGINE = MergeTree ORDER BY id
//! ```
//!
//! where `payload` is a JSON object. For GET its top-level members become
//! query parameters; for POST the object is sent as the body (unless a body
//! template is configured). `ts` is only read in continuous mode, where the
//! default SELECT fills it from the status table.
//!
//! Every attempt is stored as one [`JsonRecord`].

use crate::http::Attempt;
use crate::request::QueryValue;
use crate::traits::{AttemptContext, Params, Record, SettableBody, Subject};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One reference row
#[derive(Debug, Clone, Default, PartialEq, clickhouse::Row, Serialize, Deserialize)]
pub struct JsonParams {
    pub id: u64,
    /// JSON object with the request fields
    pub payload: String,
    /// Last processing time (unix seconds), continuous mode only
    pub ts: i64,
    #[serde(skip)]
    body: Option<Bytes>,
}

impl JsonParams {
    pub fn new(id: u64, payload: impl Into<String>) -> Self {
        Self {
            id,
            payload: payload.into(),
            ts: 0,
            body: None,
        }
    }

    pub fn with_ts(mut self, ts: i64) -> Self {
        self.ts = ts;
        self
    }

    /// Payload members; anything other than a JSON object yields nothing
    fn fields(&self) -> Map<String, Value> {
        match serde_json::from_str::<Value>(&self.payload) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

impl SettableBody for JsonParams {
    fn set_body(&mut self, body: Bytes) {
        self.body = Some(body);
    }
}

impl Params for JsonParams {
    fn key(&self) -> u64 {
        self.id
    }

    fn cursor_ts(&self) -> Option<i64> {
        Some(self.ts)
    }

    fn query(&self) -> Vec<(String, QueryValue)> {
        self.fields()
            .iter()
            .map(|(k, v)| (k.clone(), QueryValue::from(v)))
            .collect()
    }

    fn body(&self) -> Map<String, Value> {
        self.fields()
    }

    fn raw_body(&self) -> Option<Bytes> {
        self.body.clone()
    }

    fn as_settable_body(&mut self) -> Option<&mut dyn SettableBody> {
        Some(self)
    }
}

/// One stored attempt
#[derive(Debug, Clone, PartialEq, clickhouse::Row, Serialize, Deserialize)]
pub struct JsonRecord {
    pub id: u64,
    pub attempt: u32,
    pub status_code: u16,
    pub elapsed_ms: u64,
    pub tag: String,
    pub url: String,
    /// Decoded body re-encoded as JSON, or the raw body when it did not decode
    pub response: String,
    /// Transport error, empty when a response was received
    pub error: String,
    /// Unix seconds
    pub created_at: u32,
}

impl Record for JsonRecord {
    fn create_table_ddl(table: &str) -> Option<String> {
        Some(format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             id UInt64, \
             attempt UInt32, \
             status_code UInt16, \
             elapsed_ms UInt64, \
             tag String, \
             url String, \
             response String, \
             error String, \
             created_at DateTime\
             ) ENGINE = MergeTree ORDER BY (id, created_at)",
            table
        ))
    }
}

/// Built-in subject used by the `drover` binary
pub struct JsonSubject;

impl Subject for JsonSubject {
    type Params = JsonParams;
    type Response = Value;
    type Record = JsonRecord;

    fn into_record(
        params: &JsonParams,
        attempt: &Attempt<Value>,
        ctx: &AttemptContext<'_>,
    ) -> JsonRecord {
        let response = if attempt.decoded {
            attempt.response.to_string()
        } else {
            attempt.raw_text()
        };
        JsonRecord {
            id: params.id,
            attempt: ctx.attempt,
            status_code: ctx.status_code,
            elapsed_ms: ctx.elapsed.as_millis() as u64,
            tag: ctx.tag.to_string(),
            url: ctx.url.to_string(),
            response,
            error: attempt.error.clone().unwrap_or_default(),
            created_at: chrono::Utc::now().timestamp().max(0) as u32,
        }
    }
}
