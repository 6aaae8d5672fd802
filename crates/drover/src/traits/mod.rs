//! Core traits and building blocks
//!
//! - [`Subject`] with its [`Params`], [`Response`] and [`Record`] row types
//! - [`Source`] and [`Sink`] store adapters
//! - [`CircuitBreaker`] and [`RetryConfig`] used by the HTTP executor and
//!   the provider

pub mod circuit_breaker;
pub mod retry;
pub mod sink;
pub mod source;
pub mod subject;
pub mod testing;

// Subject surface
pub use subject::{AttemptContext, Params, Record, Response, SettableBody, Subject};

// Store adapters
pub use sink::{Sink, WriteResult};
pub use source::Source;

// Resilience
pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState, Counts,
    Permit, SharedCircuitBreaker,
};
pub use retry::{retry, RetryConfig, RetryResult};

// Testing
pub use testing::{MockSink, MockSource, QueryCall};
