//! Shared types for rangefetch
//!
//! This crate contains the data structures shared by the download
//! engine and the CLI: configuration, statuses, statistics snapshots,
//! health reports and engine events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Configuration
// ============================================================================

/// Smallest chunk size the planner accepts (64 KiB)
pub const MIN_CHUNK_SIZE: u64 = 64 * 1024;
/// Smallest read/write buffer (4 KiB)
pub const MIN_BUFFER_SIZE: usize = 4 * 1024;
/// Shortest request/read timeout in milliseconds
pub const MIN_TIMEOUT_MS: u64 = 5_000;
/// Upper bound for worker threads per job
pub const MAX_THREAD_COUNT: u32 = 32;

/// Per-job download configuration
///
/// Immutable once a job starts. Every field has a default so partial
/// JSON config files deserialize cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Number of concurrent workers (clamped to 1..=32)
    pub thread_count: u32,
    /// Target chunk size in bytes (at least 64 KiB)
    pub chunk_size: u64,
    /// Read/write buffer size in bytes (at least 4 KiB)
    pub buffer_size: usize,
    /// Retries allowed per chunk before the job fails
    pub max_retries: u32,
    /// Timeout in milliseconds (at least 5000) for sending each request and
    /// for each body read. It bounds idle time, not a whole chunk attempt.
    pub timeout_ms: u64,
    /// Speed limit in bytes per second (0 = unlimited)
    pub speed_limit: u64,
    /// Reuse `.part` files left by interrupted runs
    pub enable_resume_support: bool,
    /// Size the temp file to the full length before workers start
    pub pre_allocate_file: bool,
    /// Let the adaptive scheduler pick concurrency and split slow chunks
    pub adaptive: bool,
    /// Progress monitor sampling interval in milliseconds
    pub monitor_interval_ms: u64,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            thread_count: 4,
            chunk_size: 4 * 1024 * 1024,
            buffer_size: 64 * 1024,
            max_retries: 5,
            timeout_ms: 30_000,
            speed_limit: 0,
            enable_resume_support: true,
            pre_allocate_file: true,
            adaptive: false,
            monitor_interval_ms: 1_000,
        }
    }
}

impl Configuration {
    /// Return a copy with the thread count clamped into range
    pub fn normalized(&self) -> Self {
        let mut config = self.clone();
        config.thread_count = config.thread_count.clamp(1, MAX_THREAD_COUNT);
        if config.monitor_interval_ms == 0 {
            config.monitor_interval_ms = 1_000;
        }
        config
    }

    /// Check the remaining bounds, returning the first violation
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(format!(
                "chunk_size must be at least {} bytes (got {})",
                MIN_CHUNK_SIZE, self.chunk_size
            ));
        }
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(format!(
                "buffer_size must be at least {} bytes (got {})",
                MIN_BUFFER_SIZE, self.buffer_size
            ));
        }
        if self.timeout_ms < MIN_TIMEOUT_MS {
            return Err(format!(
                "timeout_ms must be at least {} (got {})",
                MIN_TIMEOUT_MS, self.timeout_ms
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }
}

// ============================================================================
// Status Types
// ============================================================================

/// Overall status of a download job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Probing,
    Downloading,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Status of a single chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Waiting,
    Downloading,
    Completed,
    Failed,
}

// ============================================================================
// Error Reporting Types
// ============================================================================

/// Failure classification used by the retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkConnection,
    HttpError,
    ServerError,
    Timeout,
    FileIo,
    Cancelled,
    Configuration,
    Verification,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::NetworkConnection => "network connection",
            ErrorKind::HttpError => "http error",
            ErrorKind::ServerError => "server error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::FileIo => "file i/o",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Verification => "verification",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// How bad a failure is for the job
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// User-facing view of a classified download error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub retryable: bool,
    pub suggestions: Vec<String>,
}

// ============================================================================
// Statistics & Monitoring Types
// ============================================================================

/// Eventually-consistent snapshot of a job's counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadStatistics {
    /// Total size in bytes (0 when unknown)
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    /// Bytes per second over the last sample interval
    pub current_speed: u64,
    pub average_speed: u64,
    pub peak_speed: u64,
    pub active_threads: u32,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DownloadStatistics {
    /// Fraction complete in 0.0..=1.0 (0.0 when the size is unknown)
    pub fn progress(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.downloaded_bytes as f64 / self.total_bytes as f64).clamp(0.0, 1.0)
    }

    /// Seconds left at the current speed
    pub fn eta_secs(&self) -> Option<u64> {
        if self.total_bytes == 0 || self.current_speed == 0 {
            return None;
        }
        Some(self.total_bytes.saturating_sub(self.downloaded_bytes) / self.current_speed)
    }
}

/// One sample taken by the progress monitor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadMetrics {
    pub bytes_per_second: u64,
    pub average_speed: u64,
    pub peak_speed: u64,
    pub active_connections: u32,
    pub retry_count: u32,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub fraction: f64,
}

/// Connection health grade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

/// Advisory diagnosis produced by the progress monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub metrics: DownloadMetrics,
    /// Expected speed for a file of this size, bytes per second
    pub expected_speed: u64,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

// ============================================================================
// API Types
// ============================================================================

/// Information about a remote resource (from probing)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeInfo {
    pub url: String,
    pub final_url: Option<String>,
    pub filename: String,
    pub size: Option<u64>,
    pub content_type: Option<String>,
    pub supports_range: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Final outcome of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadResult {
    pub job_id: Uuid,
    pub file_path: PathBuf,
    /// Size of the finished file (0 when unknown and not completed)
    pub total_size: u64,
    /// Bytes on disk for this job, including a resumed prefix
    pub downloaded_bytes: u64,
    /// Bytes fetched over the network during this run
    pub transferred_bytes: u64,
    pub duration: Duration,
    /// Bytes per second over the run
    pub average_speed: u64,
    pub status: JobStatus,
    pub is_success: bool,
    pub error_message: Option<String>,
    pub error: Option<ErrorReport>,
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the engine to observers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EngineEvent {
    JobAdded {
        job_id: Uuid,
        url: String,
        destination: PathBuf,
    },
    JobStatusChanged {
        job_id: Uuid,
        status: JobStatus,
        error: Option<String>,
    },
    Progress {
        job_id: Uuid,
        fraction: f64,
        stats: DownloadStatistics,
    },
    ChunkRetry {
        job_id: Uuid,
        chunk_id: u32,
        attempt: u32,
        kind: ErrorKind,
        delay_ms: u64,
    },
    ChunkSplit {
        job_id: Uuid,
        chunk_id: u32,
        new_chunk_id: u32,
        split_at: u64,
    },
    Health {
        job_id: Uuid,
        report: HealthReport,
    },
}

impl EngineEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            EngineEvent::JobAdded { job_id, .. }
            | EngineEvent::JobStatusChanged { job_id, .. }
            | EngineEvent::Progress { job_id, .. }
            | EngineEvent::ChunkRetry { job_id, .. }
            | EngineEvent::ChunkSplit { job_id, .. }
            | EngineEvent::Health { job_id, .. } => *job_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_clamps_thread_count() {
        let config = Configuration {
            thread_count: 0,
            ..Default::default()
        };
        assert_eq!(config.normalized().thread_count, 1);

        let config = Configuration {
            thread_count: 200,
            ..Default::default()
        };
        assert_eq!(config.normalized().thread_count, MAX_THREAD_COUNT);
    }

    #[test]
    fn test_validate_rejects_small_chunks() {
        let config = Configuration {
            chunk_size: 1024,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("chunk_size"));
        assert!(Configuration::default().validate().is_ok());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Configuration =
            serde_json::from_str(r#"{ "thread_count": 8, "speed_limit": 1048576 }"#).unwrap();
        assert_eq!(config.thread_count, 8);
        assert_eq!(config.speed_limit, 1_048_576);
        assert_eq!(config.buffer_size, Configuration::default().buffer_size);
        assert!(config.enable_resume_support);
    }

    #[test]
    fn test_statistics_progress() {
        let stats = DownloadStatistics {
            total_bytes: 200,
            downloaded_bytes: 50,
            current_speed: 10,
            ..Default::default()
        };
        assert!((stats.progress() - 0.25).abs() < f64::EPSILON);
        assert_eq!(stats.eta_secs(), Some(15));
        assert_eq!(DownloadStatistics::default().progress(), 0.0);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = EngineEvent::JobStatusChanged {
            job_id: Uuid::nil(),
            status: JobStatus::Cancelled,
            error: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "JobStatusChanged");
        assert_eq!(json["payload"]["status"], "cancelled");
    }
}
