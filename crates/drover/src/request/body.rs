//! Body-from-file templating
//!
//! The template is read and validated once at startup. Every Params row that
//! exposes the settable-body capability receives a handle to the same bytes.

use crate::error::{DroverError, Result};
use crate::traits::Params;
use bytes::Bytes;
use std::path::{Path, PathBuf};

/// Injects a fixed JSON body into Params rows
#[derive(Debug, Clone, Default)]
pub struct BodyMutator {
    template: Option<Bytes>,
    path: Option<PathBuf>,
}

impl BodyMutator {
    /// A mutator that leaves every row untouched
    pub fn noop() -> Self {
        Self::default()
    }

    /// Load the template from `path`, rejecting anything that is not JSON
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|e| {
            DroverError::config(format!("cannot read body file '{}': {}", path.display(), e))
        })?;
        let body = Self::from_bytes(raw).map_err(|e| {
            DroverError::config(format!("body file '{}': {}", path.display(), e))
        })?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            ..body
        })
    }

    /// Build a mutator from in-memory JSON
    pub fn from_bytes(raw: impl Into<Bytes>) -> Result<Self> {
        let raw = raw.into();
        serde_json::from_slice::<serde_json::Value>(&raw)
            .map_err(|e| DroverError::config(format!("template is not valid JSON: {}", e)))?;
        Ok(Self {
            template: Some(raw),
            path: None,
        })
    }

    /// Load from an optional path; `None` yields a no-op mutator
    pub fn from_optional(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::noop()),
        }
    }

    /// Whether a template is loaded
    pub fn is_active(&self) -> bool {
        self.template.is_some()
    }

    /// The loaded template bytes
    pub fn template(&self) -> Option<&Bytes> {
        self.template.as_ref()
    }

    /// Path the template was loaded from
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Inject the template into `params`.
    ///
    /// Returns `true` when the row accepted the body.
    pub fn apply<P: Params>(&self, params: &mut P) -> bool {
        let Some(template) = &self.template else {
            return false;
        };
        match params.as_settable_body() {
            Some(target) => {
                target.set_body(template.clone());
                true
            }
            None => false,
        }
    }

    /// Inject the template into every row of a batch
    pub fn apply_all<P: Params>(&self, batch: &mut [P]) -> usize {
        if !self.is_active() {
            return 0;
        }
        batch.iter_mut().map(|p| self.apply(p)).filter(|applied| *applied).count()
    }
}
