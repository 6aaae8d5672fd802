//! Source trait
//!
//! A source executes one rendered SELECT and binds the returned rows to the
//! subject's `Params` type. Sources never retry; the provider owns the policy.

use super::subject::Params;
use crate::error::StoreResult;
use async_trait::async_trait;

/// Store adapter that yields parameter rows.
#[async_trait]
pub trait Source<P: Params>: Send + Sync {
    /// Human-readable name used in logs
    fn name(&self) -> &str;

    /// Execute `sql` and return the bound rows
    ///
    /// Fails with `StoreError::Unavailable` on transport errors and
    /// `StoreError::Decode` on column-to-field mismatch.
    async fn get_next_batch(&self, sql: &str) -> StoreResult<Vec<P>>;
}
