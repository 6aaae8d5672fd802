//! drover - drive an HTTP API from ClickHouse rows
//!
//! Rows are paged out of a reference table, turned into requests against a
//! *subject* service, and every attempt is written back as a record.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────┐   ┌──────────────┐   ┌──────────┐   ┌────────────┐
//! │ ClickHouse │──▶│ Provider │──▶│ Fetcher pool │──▶│  Writer  │──▶│ ClickHouse │
//! │  (source)  │   │  paging  │   │ retry + CB   │   │ batching │   │  (sinks)   │
//! └────────────┘   └──────────┘   └──────────────┘   └──────────┘   └────────────┘
//! ```
//!
//! # Library Usage
//!
//! ```rust,ignore
//! use drover::prelude::*;
//!
//! let source = ClickHouseStore::connect(&endpoint, "addresses", &creds).await?;
//! let sink = ClickHouseStore::connect(&endpoint, "geocoded", &creds).await?;
//! let runner = Runner::<Geocoder>::new(
//!     Arc::new(source),
//!     vec![Arc::new(sink)],
//!     Box::new(TwoTableQuery::new("addresses", 500)),
//!     Arc::new(target),
//!     Arc::new(HttpExecutor::new(ExecutorConfig::default(), None)?),
//!     PipelineSettings::default(),
//! );
//! let report = runner.run(CancellationToken::new()).await?;
//! ```
//!
//! # CLI Usage (Binary)
//!
//! ```bash
//! # Run the pipeline
//! drover -c drover.yaml
//!
//! # Validate configuration
//! drover -c drover.yaml validate
//! ```

// Core traits (subject, source, sink, breaker, retry)
pub mod traits;

// Common types (SensitiveString, Credentials)
pub mod types;

// Error types
pub mod error;

// Runtime modules
pub mod config;
pub mod http;
pub mod logging;
pub mod pipeline;
pub mod query;
pub mod request;
pub mod store;
pub mod subjects;

pub use types::{Credentials, SensitiveString};

pub use error::{DroverError, Result, StoreError, StoreResult};

pub use config::DroverConfig;

pub use pipeline::{PipelineSettings, RunReport, Runner};

/// In-memory sources and sinks for tests
pub mod testing {
    pub use crate::traits::testing::{MockSink, MockSource, QueryCall};
}

/// Everything needed to implement and run a subject
pub mod prelude {
    pub use crate::error::{DroverError, Result, StoreError, StoreResult};
    pub use crate::http::{Attempt, ExecuteError, ExecutorConfig, HttpExecutor, StatusClass};
    pub use crate::pipeline::{PipelineSettings, RunReport, Runner};
    pub use crate::query::{ContinuousQuery, Mode, QueryBuilder, SqlTemplate, TwoTableQuery};
    pub use crate::request::{BodyMutator, Method, QueryValue, Request, Target};
    pub use crate::store::{ClickHouseEndpoint, ClickHouseStore};
    pub use crate::traits::{
        AttemptContext, CircuitBreakerConfig, Params, Record, Response, SettableBody,
        SharedCircuitBreaker, Sink, Source, Subject,
    };
    pub use crate::types::Credentials;
    pub use bytes::Bytes;
    pub use std::sync::Arc;
    pub use tokio_util::sync::CancellationToken;
}
