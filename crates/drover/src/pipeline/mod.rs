//! Three-stage pipeline
//!
//! ```text
//! ┌────────┐   ┌──────────┐  Request  ┌──────────────┐  Record  ┌──────────┐   ┌────────┐
//! │ Source │──▶│ Provider │──────────▶│ Fetcher pool │─────────▶│  Writer  │──▶│ Sinks  │
//! └────────┘   └──────────┘  bounded  └──────────────┘  bounded └──────────┘   └────────┘
//! ```
//!
//! Each stage is the only sender on the channel it writes to, so closing
//! propagates downstream: the provider drops its sender when the source is
//! drained, the fetcher supervisor drops its sender once every worker has
//! exited, and the writer flushes what is left when its channel closes.
//! Cancellation is observed by every stage at each blocking point.

pub mod fetcher;
pub mod provider;
pub mod runner;
pub mod writer;

pub use fetcher::{FetcherPool, FetcherSettings, FetcherStats};
pub use provider::{Provider, ProviderSettings, ProviderStats};
pub use runner::{PipelineSettings, RunReport, Runner};
pub use writer::{Writer, WriterSettings, WriterStats};

/// Capacity of the request channel for a given SELECT batch size
pub fn request_capacity(select_batch_size: usize) -> usize {
    (2 * select_batch_size).max(1)
}

/// Capacity of the result channel for a given insert batch size
pub fn result_capacity(insert_batch_size: usize) -> usize {
    2 * insert_batch_size + 1
}
