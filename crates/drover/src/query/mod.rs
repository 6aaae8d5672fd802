//! Query builders
//!
//! A [`QueryBuilder`] renders the next SELECT and advances its cursor from
//! each batch the source returns.
//!
//! | Mode | Cursor | Empty batch |
//! |------|--------|-------------|
//! | [`Mode::TwoTable`] | `last_key` watermark | source drained, provider stops |
//! | [`Mode::Continuous`] | `(start_ts, last_ts, last_key)` | quiesce, reset, poll again |

pub mod continuous;
pub mod template;
pub mod two_table;

pub use continuous::ContinuousQuery;
pub use template::{SqlTemplate, TemplateError};
pub use two_table::TwoTableQuery;

use crate::traits::Params;
use serde::{Deserialize, Serialize};

/// Pipeline mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Read a source table once, write to a distinct sink table, then exit
    #[default]
    TwoTable,
    /// Poll for stale rows forever
    Continuous,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TwoTable => write!(f, "two-table"),
            Self::Continuous => write!(f, "continuous"),
        }
    }
}

/// Renders paged SELECT statements and tracks the cursor between them
pub trait QueryBuilder<P: Params>: Send + Sync {
    /// Mode this builder implements
    fn mode(&self) -> Mode;

    /// SQL for the next batch
    fn render(&self) -> String;

    /// Advance the cursor past `batch`
    fn absorb(&mut self, batch: &[P]);

    /// Start a new pass
    fn reset(&mut self);
}

impl<P: Params> QueryBuilder<P> for Box<dyn QueryBuilder<P>> {
    fn mode(&self) -> Mode {
        (**self).mode()
    }

    fn render(&self) -> String {
        (**self).render()
    }

    fn absorb(&mut self, batch: &[P]) {
        (**self).absorb(batch)
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}
