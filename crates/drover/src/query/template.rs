//! SQL templates with `{placeholder}` substitution
//!
//! ## Supported Placeholders
//!
//! | Placeholder | Mode | Value |
//! |-------------|------|-------|
//! | `{table}` | both | source (reference) table |
//! | `{limit}` | both | `select_batch_size` |
//! | `{last_key}` | both | cursor key |
//! | `{status_table}` | continuous | table holding processing timestamps |
//! | `{start_ts}` | continuous | unix seconds of the current pass |
//! | `{last_ts}` | continuous | cursor timestamp |
//! | `{freshness}` | continuous | minimum age in seconds |
//!
//! Placeholders are checked when the template is loaded, so a typo fails at
//! startup instead of producing broken SQL at runtime.

use crate::error::DroverError;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;
use thiserror::Error;

static PLACEHOLDER_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\{([a-z_][a-z0-9_]*)\}")
        .expect("placeholder regex pattern is invalid - this is a bug")
});

/// Template validation errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("SQL template is empty")]
    Empty,

    #[error("unknown placeholder '{{{name}}}' (supported: {supported})")]
    UnknownPlaceholder { name: String, supported: String },

    #[error("SQL template must reference '{{{0}}}'")]
    MissingPlaceholder(String),

    #[error("cannot read SQL template '{path}': {message}")]
    Io { path: String, message: String },
}

impl From<TemplateError> for DroverError {
    fn from(err: TemplateError) -> Self {
        DroverError::Config(err.to_string())
    }
}

/// A validated SQL template
#[derive(Debug, Clone)]
pub struct SqlTemplate {
    text: String,
    placeholders: BTreeSet<String>,
}

impl SqlTemplate {
    /// Parse `text`, accepting only `allowed` placeholders and requiring each
    /// of `required` to appear at least once.
    pub fn parse(text: &str, allowed: &[&str], required: &[&str]) -> Result<Self, TemplateError> {
        if text.trim().is_empty() {
            return Err(TemplateError::Empty);
        }

        let placeholders: BTreeSet<String> = PLACEHOLDER_REGEX
            .captures_iter(text)
            .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
            .collect();

        if let Some(unknown) = placeholders.iter().find(|p| !allowed.contains(&p.as_str())) {
            return Err(TemplateError::UnknownPlaceholder {
                name: unknown.clone(),
                supported: allowed
                    .iter()
                    .map(|p| format!("{{{}}}", p))
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }

        if let Some(missing) = required.iter().find(|r| !placeholders.contains(**r)) {
            return Err(TemplateError::MissingPlaceholder(missing.to_string()));
        }

        Ok(Self {
            text: text.trim().to_string(),
            placeholders,
        })
    }

    /// Template shipped with the crate; placeholders are not checked
    pub(crate) fn builtin(text: &'static str) -> Self {
        Self {
            text: text.trim().to_string(),
            placeholders: PLACEHOLDER_REGEX
                .captures_iter(text)
                .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
                .collect(),
        }
    }

    /// Load and parse a template file
    pub fn from_file(
        path: impl AsRef<Path>,
        allowed: &[&str],
        required: &[&str],
    ) -> Result<Self, TemplateError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| TemplateError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::parse(&text, allowed, required)
    }

    /// Placeholders referenced by the template
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.placeholders.iter().map(String::as_str)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Substitute placeholders; names without a value are left untouched
    pub fn render(&self, values: &[(&str, String)]) -> String {
        PLACEHOLDER_REGEX
            .replace_all(&self.text, |caps: &regex::Captures<'_>| {
                let name = &caps[1];
                values
                    .iter()
                    .find(|(k, _)| *k == name)
                    .map(|(_, v)| v.clone())
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const ALLOWED: &[&str] = &["table", "limit", "last_key"];

    #[test]
    fn test_render() {
        let tpl = SqlTemplate::parse(
            "SELECT * FROM {table} WHERE id > {last_key} LIMIT {limit}",
            ALLOWED,
            &["last_key"],
        )
        .unwrap();
        let sql = tpl.render(&[
            ("table", "db.src".into()),
            ("last_key", "10".into()),
            ("limit", "5".into()),
        ]);
        assert_eq!(sql, "SELECT * FROM db.src WHERE id > 10 LIMIT 5");
        assert_eq!(
            tpl.placeholders().collect::<Vec<_>>(),
            vec!["last_key", "limit", "table"]
        );
    }

    #[test]
    fn test_unknown_placeholder() {
        let err = SqlTemplate::parse("SELECT {tabel}", ALLOWED, &[]).unwrap_err();
        assert!(matches!(
            err,
            TemplateError::UnknownPlaceholder { ref name, .. } if name == "tabel"
        ));
        assert!(err.to_string().contains("{table}"));
    }

    #[test]
    fn test_missing_required() {
        let err = SqlTemplate::parse("SELECT * FROM {table}", ALLOWED, &["last_key"]).unwrap_err();
        assert_eq!(err, TemplateError::MissingPlaceholder("last_key".into()));
    }

    #[test]
    fn test_ignores_non_placeholder_braces() {
        let tpl = SqlTemplate::parse(
            "SELECT map('a', 1) AS m, {'k': 1} FROM {table} WHERE id > {last_key}",
            ALLOWED,
            &[],
        )
        .unwrap();
        assert_eq!(tpl.placeholders().count(), 2);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "SELECT * FROM {{table}} WHERE id > {{last_key}}").unwrap();
        let tpl = SqlTemplate::from_file(file.path(), ALLOWED, &["last_key"]).unwrap();
        assert_eq!(tpl.text(), "SELECT * FROM {table} WHERE id > {last_key}");

        let err = SqlTemplate::from_file("/nonexistent.sql", ALLOWED, &[]).unwrap_err();
        assert!(matches!(err, TemplateError::Io { .. }));
    }

    #[test]
    fn test_empty() {
        assert_eq!(SqlTemplate::parse("  \n", ALLOWED, &[]).unwrap_err(), TemplateError::Empty);
    }
}
