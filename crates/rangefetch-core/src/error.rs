//! Error types for rangefetch core
//!
//! [`FetchError`] is the raw failure produced by transports, file
//! operations and planning. The [`ErrorClassifier`](crate::ErrorClassifier)
//! turns it into a [`DownloadError`], which carries everything the retry
//! policy and the caller need: kind, severity, retryability, backoff and
//! remediation text.

use rangefetch_types::{ErrorKind, ErrorReport, ErrorSeverity};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Raw failures that can occur while fetching
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP {status} from {url}")]
    HttpStatus {
        status: u16,
        url: String,
        retry_after: Option<Duration>,
    },

    #[error("Server ignored range request starting at byte {start}")]
    RangeNotHonored { start: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Planning failed: {0}")]
    Planning(String),

    #[error("Size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Download was cancelled")]
    Cancelled,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl FetchError {
    pub fn http_status(status: u16, url: impl Into<String>) -> Self {
        FetchError::HttpStatus {
            status,
            url: url.into(),
            retry_after: None,
        }
    }
}

/// Delay strategy attached to a classified error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Not retryable
    None,
    /// Same delay every attempt
    Fixed(Duration),
    /// `base * 2^(attempt-1)`, capped
    Exponential { base: Duration, cap: Duration },
}

impl Backoff {
    /// Delay before retry number `attempt` (1-indexed), without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, cap } => {
                let exponent = attempt.saturating_sub(1).min(20);
                base.saturating_mul(1u32 << exponent).min(cap)
            }
        }
    }

    pub fn cap(&self) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { cap, .. } => cap,
        }
    }
}

/// A classified download failure
#[derive(Debug, Clone)]
pub struct DownloadError {
    pub(crate) kind: ErrorKind,
    pub(crate) severity: ErrorSeverity,
    pub(crate) retryable: bool,
    pub(crate) backoff: Backoff,
    pub(crate) retry_after: Option<Duration>,
    pub(crate) status: Option<u16>,
    pub(crate) message: String,
    pub(crate) suggestions: Vec<String>,
    pub(crate) cause: Option<Arc<FetchError>>,
}

impl DownloadError {
    /// Build an error directly, bypassing classification
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: ErrorSeverity::High,
            retryable: false,
            backoff: Backoff::None,
            retry_after: None,
            status: None,
            message: message.into(),
            suggestions: Vec::new(),
            cause: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn severity(&self) -> ErrorSeverity {
        self.severity
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Delay before the first retry
    pub fn retry_delay(&self) -> Duration {
        self.backoff.delay_for(1)
    }

    /// Server-requested delay from a `Retry-After` header
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// HTTP status, when the failure came from a response
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn suggestions(&self) -> &[String] {
        &self.suggestions
    }

    pub fn cause(&self) -> Option<&FetchError> {
        self.cause.as_deref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind,
            severity: self.severity,
            message: self.message.clone(),
            retryable: self.retryable,
            suggestions: self.suggestions.clone(),
        }
    }
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

impl std::error::Error for DownloadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}
