//! Common types for drover
//!
//! Credentials never travel through the YAML file; they are read from the
//! environment and held in [`SensitiveString`] so they cannot leak through
//! `Debug` output or config dumps.

use secrecy::{ExposeSecret, SecretString};
use serde::{Serialize, Serializer};

/// A wrapper around `SecretString` that redacts its value in `Debug`,
/// `Display` and serialized output.
#[derive(Clone)]
pub struct SensitiveString(SecretString);

impl SensitiveString {
    /// Create a new sensitive string from any string-like value
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::new(value.into().into_boxed_str()))
    }

    /// Expose the secret value.
    ///
    /// Use sparingly - only when the actual value is needed (e.g., for authentication).
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl From<String> for SensitiveString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SensitiveString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Serialize for SensitiveString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

/// User / password pair for a store endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    pub user: String,
    pub password: Option<SensitiveString>,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            user: "default".to_string(),
            password: None,
        }
    }
}

impl Credentials {
    /// Read `<PREFIX>_USER` and `<PREFIX>_PASSWORD`, falling back to
    /// `fallback_prefix` for whichever variable is missing.
    pub fn from_env(prefix: &str, fallback_prefix: Option<&str>) -> Self {
        let lookup = |suffix: &str| -> Option<String> {
            std::env::var(format!("{}_{}", prefix, suffix))
                .ok()
                .or_else(|| {
                    fallback_prefix
                        .and_then(|fallback| std::env::var(format!("{}_{}", fallback, suffix)).ok())
                })
                .filter(|v| !v.is_empty())
        };

        Self {
            user: lookup("USER").unwrap_or_else(|| "default".to_string()),
            password: lookup("PASSWORD").map(SensitiveString::new),
        }
    }
}
