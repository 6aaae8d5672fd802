//! Request shape
//!
//! Turns a Params row plus a fixed [`Target`] into the URL and body of one
//! outbound call. Both are computed on first use and cached on the
//! [`Request`].
//!
//! - `GET`: extra params and the row's query fields go into the query string
//! - `POST`: extra params go into the query string, the row's body (or raw
//!   body override) is sent as `application/json`

pub mod body;
pub mod query;

pub use body::BodyMutator;
pub use query::QueryValue;

use crate::error::{DroverError, Result};
use crate::traits::Params;
use bytes::Bytes;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

/// HTTP method used against the subject
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
}

impl Method {
    pub fn as_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
        }
    }
}

/// Fixed part of every request: base URL, method and static query params
#[derive(Debug, Clone)]
pub struct Target {
    base: Url,
    method: Method,
    extra_params: Vec<(String, String)>,
}

impl Target {
    /// Build a target from its parts; the resulting base URL is validated once
    pub fn new(
        scheme: &str,
        host: &str,
        port: u16,
        endpoint: &str,
        method: Method,
        extra_params: Vec<(String, String)>,
    ) -> Result<Self> {
        if !matches!(scheme, "http" | "https") {
            return Err(DroverError::config(format!(
                "unsupported scheme '{}' (expected http or https)",
                scheme
            )));
        }
        if host.is_empty() {
            return Err(DroverError::config("api host must not be empty"));
        }

        let mut base = Url::parse(&format!("{}://{}:{}", scheme, host, port))
            .map_err(|e| DroverError::config(format!("invalid api address: {}", e)))?;
        let endpoint = if endpoint.starts_with('/') {
            endpoint.to_string()
        } else {
            format!("/{}", endpoint)
        };
        base.set_path(&endpoint);

        Ok(Self {
            base,
            method,
            extra_params,
        })
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Base URL without any query string
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn extra_params(&self) -> &[(String, String)] {
        &self.extra_params
    }
}

/// One outbound call, immutable once built
#[derive(Debug)]
pub struct Request<P> {
    target: Arc<Target>,
    params: P,
    url: OnceLock<String>,
    body: OnceLock<Option<Bytes>>,
}

impl<P: Params> Request<P> {
    pub fn new(target: Arc<Target>, params: P) -> Self {
        Self {
            target,
            params,
            url: OnceLock::new(),
            body: OnceLock::new(),
        }
    }

    pub fn params(&self) -> &P {
        &self.params
    }

    pub fn method(&self) -> Method {
        self.target.method
    }

    /// Fully rendered URL
    pub fn url(&self) -> &str {
        self.url.get_or_init(|| {
            let mut url = self.target.base.clone();
            let fields = match self.target.method {
                Method::Get => self.params.query(),
                Method::Post => Vec::new(),
            };
            let pairs = query::render_pairs(&fields);

            if !self.target.extra_params.is_empty() || !pairs.is_empty() {
                let mut serializer = url.query_pairs_mut();
                for (k, v) in &self.target.extra_params {
                    serializer.append_pair(k, v);
                }
                for (k, v) in &pairs {
                    serializer.append_pair(k, v);
                }
            }
            url.to_string()
        })
    }

    /// Serialized JSON body; `None` for GET requests
    pub fn body(&self) -> Option<&Bytes> {
        self.body
            .get_or_init(|| match self.target.method {
                Method::Get => None,
                Method::Post => Some(self.params.raw_body().unwrap_or_else(|| {
                    let object = serde_json::Value::Object(self.params.body());
                    Bytes::from(serde_json::to_vec(&object).unwrap_or_default())
                })),
            })
            .as_ref()
    }
}
