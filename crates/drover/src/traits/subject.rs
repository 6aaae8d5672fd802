//! Subject trait surface
//!
//! A *subject* is the remote HTTP service being driven. Each subject supplies
//! three row types and a response adapter:
//!
//! - [`Params`]: one row pulled from the store, rendered into a request
//! - [`Response`]: the decoded JSON body of one attempt
//! - [`Record`]: one row written back to the store, one per attempt
//!
//! # Example
//!
//! ```rust,ignore
//! use drover::prelude::*;
//!
//! struct Geocoder;
//!
//! impl Subject for Geocoder {
//!     type Params = AddressRow;
//!     type Response = GeocodeBody;
//!     type Record = GeocodeRecord;
//!
//!     fn into_record(
//!         params: &AddressRow,
//!         attempt: &Attempt<GeocodeBody>,
//!         ctx: &AttemptContext<'_>,
//!     ) -> GeocodeRecord {
//!         GeocodeRecord::new(params.id, ctx.status_code, ctx.attempt, ctx.tag, ctx.url, attempt)
//!     }
//! }
//! ```

use crate::http::Attempt;
use crate::request::QueryValue;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Capability for Params that accept a body template loaded at startup.
pub trait SettableBody {
    /// Replace the request body with the given JSON bytes
    fn set_body(&mut self, body: Bytes);
}

/// Input row describing one subject invocation.
pub trait Params: Clone + Send + Sync + 'static {
    /// Cursor key; must be unique and totally ordered for two-table paging
    fn key(&self) -> u64;

    /// Last processing time (unix seconds); continuous mode cursor column
    fn cursor_ts(&self) -> Option<i64> {
        None
    }

    /// Fields rendered into the URL query string, in order
    fn query(&self) -> Vec<(String, QueryValue)> {
        Vec::new()
    }

    /// Fields assembled into the JSON body for POST requests
    fn body(&self) -> serde_json::Map<String, serde_json::Value> {
        serde_json::Map::new()
    }

    /// Raw body bytes; when present they take precedence over [`Params::body`]
    fn raw_body(&self) -> Option<Bytes> {
        None
    }

    /// Probe for the settable-body capability
    fn as_settable_body(&mut self) -> Option<&mut dyn SettableBody> {
        None
    }
}

/// Decoded subject response body.
pub trait Response: DeserializeOwned + Default + Send + Sync + 'static {}

// Blanket implementation
impl<T> Response for T where T: DeserializeOwned + Default + Send + Sync + 'static {}

/// Output row written to the sinks.
pub trait Record: Send + Sync + 'static {
    /// `CREATE TABLE` statement for the given table, used in two-table mode
    fn create_table_ddl(_table: &str) -> Option<String> {
        None
    }
}

/// Per-attempt metadata handed to the response adapter.
#[derive(Debug, Clone, Copy)]
pub struct AttemptContext<'a> {
    /// 1-based attempt index within the request
    pub attempt: u32,
    /// Status code after substitution (transport failures become 599)
    pub status_code: u16,
    /// Wall-clock time spent on this attempt
    pub elapsed: Duration,
    /// Operator-supplied run label
    pub tag: &'a str,
    /// Fully rendered request URL
    pub url: &'a str,
}

/// A remote service driven by the pipeline.
pub trait Subject: Send + Sync + 'static {
    /// Input row type
    type Params: Params;
    /// Decoded response type
    type Response: Response;
    /// Stored row type
    type Record: Record;

    /// Convert one attempt into a stored row.
    ///
    /// Must return a row even when the response is zero-valued and must take
    /// the status from `ctx`, never from the response body.
    fn into_record(
        params: &Self::Params,
        attempt: &Attempt<Self::Response>,
        ctx: &AttemptContext<'_>,
    ) -> Self::Record;
}
