//! Built-in subjects
//!
//! Library users implement [`Subject`](crate::traits::Subject) for their own
//! row types; the binary ships with the generic [`JsonSubject`].

pub mod json;

pub use json::{JsonParams, JsonRecord, JsonSubject};
