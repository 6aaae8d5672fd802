//! Single HTTP exchange with the subject

use bytes::Bytes;
use std::time::Duration;

/// Status recorded for attempts that produced no HTTP response
pub const TRANSPORT_FAILURE_STATUS: u16 = 599;

/// How a status code is treated by the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 200-399, body is decoded
    Success,
    /// 4xx other than 429, never retried
    ClientError,
    /// 429, never retried or decoded
    Overloaded,
    /// 5xx, retried
    ServerError,
    /// No response (connect error, reset, timeout), retried
    Transport,
}

impl StatusClass {
    /// Classify a raw status; `0` means no response was received
    pub fn classify(status: u16) -> Self {
        match status {
            0 => Self::Transport,
            200..=399 => Self::Success,
            429 => Self::Overloaded,
            400..=499 => Self::ClientError,
            _ => Self::ServerError,
        }
    }

    /// Whether another attempt should be made
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ServerError | Self::Transport)
    }

    /// Whether the attempt counts as a subject failure for the circuit breaker
    pub fn is_breaker_failure(&self) -> bool {
        !matches!(self, Self::Success)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ClientError => "client_error",
            Self::Overloaded => "overloaded",
            Self::ServerError => "server_error",
            Self::Transport => "transport",
        }
    }
}

/// Outcome of one exchange with the subject.
///
/// `response` is always present; it holds `R::default()` whenever the body
/// was not decoded (non-2xx/3xx status, transport error or malformed body).
#[derive(Debug, Clone)]
pub struct Attempt<R> {
    /// 1-based index within the request
    pub number: u32,
    /// Decoded body, or the zero value
    pub response: R,
    /// Whether `response` was decoded from the body
    pub decoded: bool,
    /// Raw response body
    pub raw: Bytes,
    /// Transport error, when no response was received
    pub error: Option<String>,
    /// HTTP status as received; `0` when no response was received
    pub status: u16,
    /// Wall-clock time spent on this attempt
    pub elapsed: Duration,
}

impl<R: Default> Attempt<R> {
    /// An attempt that received no HTTP response
    pub fn transport_failure(number: u32, error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            number,
            response: R::default(),
            decoded: false,
            raw: Bytes::new(),
            error: Some(error.into()),
            status: 0,
            elapsed,
        }
    }
}

impl<R> Attempt<R> {
    /// Status to store: transport failures become [`TRANSPORT_FAILURE_STATUS`]
    pub fn status_code(&self) -> u16 {
        if self.status == 0 {
            TRANSPORT_FAILURE_STATUS
        } else {
            self.status
        }
    }

    pub fn class(&self) -> StatusClass {
        StatusClass::classify(self.status)
    }

    /// Raw body as lossy UTF-8
    pub fn raw_text(&self) -> String {
        String::from_utf8_lossy(&self.raw).into_owned()
    }
}
