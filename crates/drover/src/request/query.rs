//! URL query values
//!
//! A field contributes `key=value` to the query string only when it is
//! non-null and non-empty.

use std::fmt;

/// A single query-string value taken from a Params row
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    /// Kept narrow so it renders in its own shortest form
    Float32(f32),
    Str(String),
}

impl QueryValue {
    /// Rendered form, or `None` when the field must be skipped
    pub fn render(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Str(s) if s.is_empty() => None,
            Self::Str(s) => Some(s.clone()),
            Self::Bool(b) => Some(b.to_string()),
            Self::Int(i) => Some(i.to_string()),
            Self::UInt(u) => Some(u.to_string()),
            // Display for f64 is the shortest representation that round-trips
            Self::Float(f) => Some(f.to_string()),
            Self::Float32(f) => Some(f.to_string()),
        }
    }
}

impl fmt::Display for QueryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.render() {
            Some(s) => f.write_str(&s),
            None => Ok(()),
        }
    }
}

macro_rules! impl_from {
    ($variant:ident, $conv:ty; $($t:ty),*) => {
        $(
            impl From<$t> for QueryValue {
                fn from(value: $t) -> Self {
                    Self::$variant(value as $conv)
                }
            }
        )*
    };
}

impl_from!(Int, i64; i8, i16, i32, i64);
impl_from!(UInt, u64; u8, u16, u32, u64, usize);
impl_from!(Float, f64; f64);
impl_from!(Float32, f32; f32);

impl From<bool> for QueryValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<String> for QueryValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&str> for QueryValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl<T: Into<QueryValue>> From<Option<T>> for QueryValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

impl From<&serde_json::Value> for QueryValue {
    fn from(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    Self::UInt(u)
                } else if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    n.as_f64().map(Self::Float).unwrap_or(Self::Null)
                }
            }
            Value::String(s) => Self::Str(s.clone()),
            // nested values are sent as their JSON text
            other => Self::Str(other.to_string()),
        }
    }
}

/// Render `fields` as `(key, value)` pairs, dropping null and empty values
pub fn render_pairs(fields: &[(String, QueryValue)]) -> Vec<(&str, String)> {
    fields
        .iter()
        .filter_map(|(k, v)| v.render().map(|rendered| (k.as_str(), rendered)))
        .collect()
}
