//! Error classification and retry decisions
//!
//! Every failure a worker hits goes through [`ErrorClassifier::classify`],
//! which maps it onto an [`ErrorKind`] with a severity, a retryable flag,
//! a backoff strategy and remediation text. [`RetryPolicy::decide`] then
//! turns the classified error plus the chunk's retry count into an
//! explicit [`RetryDecision`]. A timed-out chunk on a multi-worker run that
//! exhausts its budget asks for a single-thread fallback instead of aborting.
//!
//! | Kind | Retryable | Backoff |
//! |------|-----------|---------|
//! | NetworkConnection | yes | exponential from 1s, cap 30s |
//! | HttpError 403/404 | no | - |
//! | HttpError other 4xx | yes | exponential from 2s, cap 30s |
//! | ServerError 5xx | yes | exponential from 1s, cap 60s |
//! | Timeout | yes | exponential from 1s, cap 30s |
//! | FileIo disk full / permission | no | - |
//! | FileIo file in use | yes | fixed 2.5s |
//! | Cancelled, Configuration, Verification | no | - |
//! | Unknown | yes | fixed 1s |

use crate::error::{Backoff, DownloadError, FetchError};
use rand::Rng;
use rangefetch_types::{ErrorKind, ErrorSeverity};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const NETWORK_BACKOFF: Backoff = Backoff::Exponential {
    base: Duration::from_secs(1),
    cap: Duration::from_secs(30),
};
const CLIENT_ERROR_BACKOFF: Backoff = Backoff::Exponential {
    base: Duration::from_secs(2),
    cap: Duration::from_secs(30),
};
const SERVER_ERROR_BACKOFF: Backoff = Backoff::Exponential {
    base: Duration::from_secs(1),
    cap: Duration::from_secs(60),
};
const FILE_IN_USE_BACKOFF: Backoff = Backoff::Fixed(Duration::from_millis(2500));
const UNKNOWN_BACKOFF: Backoff = Backoff::Fixed(Duration::from_secs(1));

/// Upper bound of the random jitter added to retry delays
const MAX_JITTER: Duration = Duration::from_millis(250);

#[cfg(unix)]
mod os_codes {
    pub const DISK_FULL: &[i32] = &[28, 122]; // ENOSPC, EDQUOT
    pub const IN_USE: &[i32] = &[16, 26]; // EBUSY, ETXTBSY
}

#[cfg(windows)]
mod os_codes {
    pub const DISK_FULL: &[i32] = &[39, 112]; // ERROR_HANDLE_DISK_FULL, ERROR_DISK_FULL
    pub const IN_USE: &[i32] = &[32, 33]; // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
}

#[cfg(not(any(unix, windows)))]
mod os_codes {
    pub const DISK_FULL: &[i32] = &[];
    pub const IN_USE: &[i32] = &[];
}

/// Maps raw failures to classified [`DownloadError`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn classify(err: FetchError) -> DownloadError {
        let message = err.to_string();
        let mut classified = match &err {
            FetchError::Network(source) => Self::classify_reqwest(source),
            FetchError::Connection(_) => network_error(),
            FetchError::Timeout(_) => timeout_error(),
            FetchError::HttpStatus {
                status,
                retry_after,
                ..
            } => {
                let mut classified = Self::classify_status(*status);
                classified.retry_after = *retry_after;
                classified
            }
            FetchError::RangeNotHonored { .. } => {
                let mut classified = shell(ErrorKind::HttpError, ErrorSeverity::High, false, Backoff::None);
                classified.status = Some(200);
                classified.suggestions = vec![
                    "The server ignored the Range header; retry with a single thread".to_string(),
                ];
                classified
            }
            FetchError::Io(source) => Self::classify_io(source),
            FetchError::InvalidUrl(_) | FetchError::Configuration(_) | FetchError::Planning(_) => {
                let mut classified = shell(
                    ErrorKind::Configuration,
                    ErrorSeverity::High,
                    false,
                    Backoff::None,
                );
                classified.suggestions =
                    vec!["Check the URL and the download configuration values".to_string()];
                classified
            }
            FetchError::SizeMismatch { .. } => {
                let mut classified = shell(
                    ErrorKind::Verification,
                    ErrorSeverity::High,
                    false,
                    Backoff::None,
                );
                classified.suggestions = vec![
                    "The remote file may have changed during transfer; delete the .part file and download again"
                        .to_string(),
                ];
                classified
            }
            FetchError::Cancelled => {
                shell(ErrorKind::Cancelled, ErrorSeverity::Low, false, Backoff::None)
            }
            FetchError::Unknown(_) => unknown_error(),
        };

        classified.message = message;
        classified.cause = Some(Arc::new(err));
        debug!(
            "Classified error as {:?} (retryable: {}): {}",
            classified.kind, classified.retryable, classified.message
        );
        classified
    }

    /// Classify an HTTP status that was not a success
    pub fn classify_status(status: u16) -> DownloadError {
        let mut classified = match status {
            403 | 404 => {
                let mut classified =
                    shell(ErrorKind::HttpError, ErrorSeverity::High, false, Backoff::None);
                classified.suggestions = if status == 404 {
                    vec!["Check that the URL is correct and the file still exists".to_string()]
                } else {
                    vec!["The server refused access; check credentials or mirror permissions".to_string()]
                };
                classified
            }
            500..=599 => {
                let mut classified = shell(
                    ErrorKind::ServerError,
                    ErrorSeverity::Medium,
                    true,
                    SERVER_ERROR_BACKOFF,
                );
                classified.suggestions =
                    vec!["The server is having trouble; try again later or use another mirror".to_string()];
                classified
            }
            _ => {
                let mut classified = shell(
                    ErrorKind::HttpError,
                    ErrorSeverity::Medium,
                    true,
                    CLIENT_ERROR_BACKOFF,
                );
                if status == 429 {
                    classified.suggestions =
                        vec!["The server is rate limiting; lower the thread count or set a speed limit".to_string()];
                }
                classified
            }
        };
        classified.status = Some(status);
        classified
    }

    fn classify_reqwest(source: &reqwest::Error) -> DownloadError {
        if source.is_timeout() {
            return timeout_error();
        }
        if let Some(status) = source.status() {
            return Self::classify_status(status.as_u16());
        }
        if source.is_builder() {
            return shell(ErrorKind::Configuration, ErrorSeverity::High, false, Backoff::None);
        }
        if source.is_connect() || source.is_request() || source.is_body() || source.is_decode() {
            return network_error();
        }
        unknown_error()
    }

    fn classify_io(source: &io::Error) -> DownloadError {
        if let Some(code) = source.raw_os_error() {
            if os_codes::DISK_FULL.contains(&code) {
                let mut classified =
                    shell(ErrorKind::FileIo, ErrorSeverity::Critical, false, Backoff::None);
                classified.suggestions = vec!["Free up disk space on the destination drive".to_string()];
                return classified;
            }
            if os_codes::IN_USE.contains(&code) {
                return file_in_use_error();
            }
        }

        match source.kind() {
            io::ErrorKind::PermissionDenied => {
                let mut classified =
                    shell(ErrorKind::FileIo, ErrorSeverity::Critical, false, Backoff::None);
                classified.suggestions =
                    vec!["Check write permissions for the destination directory".to_string()];
                classified
            }
            io::ErrorKind::TimedOut => timeout_error(),
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => network_error(),
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => file_in_use_error(),
            _ => {
                let mut classified =
                    shell(ErrorKind::FileIo, ErrorSeverity::High, false, Backoff::None);
                classified.suggestions =
                    vec!["Check that the destination path is valid and writable".to_string()];
                classified
            }
        }
    }
}

fn shell(kind: ErrorKind, severity: ErrorSeverity, retryable: bool, backoff: Backoff) -> DownloadError {
    DownloadError {
        kind,
        severity,
        retryable,
        backoff,
        retry_after: None,
        status: None,
        message: String::new(),
        suggestions: Vec::new(),
        cause: None,
    }
}

fn network_error() -> DownloadError {
    let mut classified = shell(
        ErrorKind::NetworkConnection,
        ErrorSeverity::Medium,
        true,
        NETWORK_BACKOFF,
    );
    classified.suggestions = vec!["Check the network connection".to_string()];
    classified
}

fn timeout_error() -> DownloadError {
    let mut classified = shell(ErrorKind::Timeout, ErrorSeverity::Medium, true, NETWORK_BACKOFF);
    classified.suggestions = vec![
        "Increase timeout_ms".to_string(),
        "Reduce thread_count on slow or congested links".to_string(),
    ];
    classified
}

fn file_in_use_error() -> DownloadError {
    let mut classified = shell(ErrorKind::FileIo, ErrorSeverity::Low, true, FILE_IN_USE_BACKOFF);
    classified.suggestions =
        vec!["Close other programs that have the destination file open".to_string()];
    classified
}

fn unknown_error() -> DownloadError {
    shell(ErrorKind::Unknown, ErrorSeverity::Medium, true, UNKNOWN_BACKOFF)
}

/// Decision on whether to retry a failed chunk attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after `delay`; `attempt` is the retry number about to run
    Retry { delay: Duration, attempt: u32 },
    /// Retries exhausted on timeouts; re-run the rest with one worker
    Fallback { reason: String },
    /// Give up on the chunk
    Abort { reason: String },
}

/// Per-chunk retry budget and delay calculation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    jitter: bool,
    fallback: bool,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            jitter: true,
            fallback: false,
        }
    }

    /// Answer [`RetryDecision::Fallback`] when timeouts exhaust the budget
    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.fallback = enabled;
        self
    }

    /// Disable random jitter (deterministic delays)
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decide what to do after a failure
    ///
    /// `retries_so_far` is how many retries the chunk already used.
    pub fn decide(&self, error: &DownloadError, retries_so_far: u32) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::Abort {
                reason: format!("{} errors are not retryable", error.kind()),
            };
        }

        if retries_so_far >= self.max_retries {
            if self.fallback && error.kind() == ErrorKind::Timeout {
                return RetryDecision::Fallback {
                    reason: format!("timed out {} times", retries_so_far + 1),
                };
            }
            return RetryDecision::Abort {
                reason: format!("max retries ({}) exhausted", self.max_retries),
            };
        }

        let attempt = retries_so_far + 1;
        let backoff = error.backoff();
        let mut delay = backoff.delay_for(attempt);
        if let Some(retry_after) = error.retry_after() {
            delay = delay.max(retry_after.min(backoff.cap().max(delay)));
        }
        if self.jitter {
            let jitter_ms = rand::thread_rng().gen_range(0..=MAX_JITTER.as_millis() as u64);
            delay += Duration::from_millis(jitter_ms);
        }

        RetryDecision::Retry { delay, attempt }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(rangefetch_types::Configuration::default().max_retries)
    }
}

/// Parse a `Retry-After` header value (delta-seconds or HTTP-date)
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(std::time::SystemTime::now()).unwrap_or(Duration::ZERO))
}
