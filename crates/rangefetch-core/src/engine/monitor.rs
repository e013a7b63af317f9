//! Progress monitor - periodic speed sampling and connection health
//!
//! The monitor reads the job's [`StatsCounters`], writes back the speed
//! fields, and broadcasts `Progress` and `Health` events. Health reports are
//! advisory only; nothing here changes how the job runs.

use crate::engine::stats::StatsCounters;
use rangefetch_types::{DownloadMetrics, EngineEvent, HealthReport, HealthStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;

/// Emit a health report at least every this many samples
const HEALTH_EVERY: u64 = 5;
/// Files this large should not be fetched over one connection
const LARGE_FILE: u64 = 100 * MB;
const EXCESSIVE_RETRIES: u32 = 10;

pub struct ProgressMonitor {
    job_id: Uuid,
    stats: Arc<StatsCounters>,
    interval: Duration,
    workers: u32,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl ProgressMonitor {
    pub fn new(
        job_id: Uuid,
        stats: Arc<StatsCounters>,
        interval: Duration,
        workers: u32,
        event_tx: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            job_id,
            stats,
            interval,
            workers,
            event_tx,
        }
    }

    /// Speed a healthy connection should reach for a file of `total` bytes
    pub fn expected_speed(total: u64) -> u64 {
        match total {
            t if t < MB => 500 * KB,
            t if t < 100 * MB => 2 * MB,
            _ => 5 * MB,
        }
    }

    /// Grade one sample and attach issues and recommendations
    pub fn diagnose(metrics: &DownloadMetrics, workers: u32) -> HealthReport {
        let expected_speed = Self::expected_speed(metrics.total_bytes);
        let ratio = metrics.bytes_per_second as f64 / expected_speed as f64;

        let mut issues = Vec::new();
        let mut recommendations = Vec::new();

        let status = if metrics.active_connections == 0 || metrics.bytes_per_second == 0 {
            issues.push("No active connections".to_string());
            recommendations.push("Check the network connection and the server status".to_string());
            HealthStatus::Critical
        } else if ratio >= 0.8 {
            HealthStatus::Excellent
        } else if ratio >= 0.5 {
            HealthStatus::Good
        } else if ratio >= 0.2 {
            HealthStatus::Fair
        } else {
            issues.push(format!(
                "Speed well below expectation ({} B/s, expected {} B/s)",
                metrics.bytes_per_second, expected_speed
            ));
            recommendations.push("Try another mirror or a different time of day".to_string());
            HealthStatus::Poor
        };

        if metrics.total_bytes >= LARGE_FILE && workers <= 1 {
            issues.push("Large file on a single thread".to_string());
            recommendations.push("Increase thread_count if the server accepts ranges".to_string());
        }
        if metrics.retry_count >= EXCESSIVE_RETRIES {
            issues.push(format!("Retry count excessive ({})", metrics.retry_count));
            recommendations.push("Lower thread_count or set a speed limit".to_string());
        }

        HealthReport {
            status,
            metrics: metrics.clone(),
            expected_speed,
            issues,
            recommendations,
        }
    }

    /// Sample until `cancel` fires
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            let started = Instant::now();
            let mut last_time = started;
            let mut last_transferred: u64 = 0;
            let mut samples: u64 = 0;
            let mut last_status: Option<HealthStatus> = None;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let now = Instant::now();
                let transferred = self.stats.transferred();
                let elapsed = now.duration_since(last_time).as_secs_f64();
                let current = if elapsed > 0.0 {
                    (transferred.saturating_sub(last_transferred) as f64 / elapsed) as u64
                } else {
                    0
                };
                let total_elapsed = now.duration_since(started).as_secs_f64();
                let average = if total_elapsed > 0.0 {
                    (transferred as f64 / total_elapsed) as u64
                } else {
                    0
                };
                self.stats.record_speed(current, average);
                last_time = now;
                last_transferred = transferred;
                samples += 1;

                let stats = self.stats.snapshot();
                let fraction = stats.progress();
                let metrics = DownloadMetrics {
                    bytes_per_second: current,
                    average_speed: average,
                    peak_speed: stats.peak_speed,
                    active_connections: stats.active_threads,
                    retry_count: stats.retry_count,
                    downloaded_bytes: stats.downloaded_bytes,
                    total_bytes: stats.total_bytes,
                    fraction,
                };
                let _ = self.event_tx.send(EngineEvent::Progress {
                    job_id: self.job_id,
                    fraction,
                    stats,
                });

                let report = Self::diagnose(&metrics, self.workers);
                if samples % HEALTH_EVERY == 0 || last_status != Some(report.status) {
                    if report.status == HealthStatus::Critical && last_status.is_some() {
                        warn!("Job {} health critical: {:?}", self.job_id, report.issues);
                    } else {
                        debug!("Job {} health {:?}", self.job_id, report.status);
                    }
                    last_status = Some(report.status);
                    let _ = self.event_tx.send(EngineEvent::Health {
                        job_id: self.job_id,
                        report,
                    });
                }
            }
        })
    }
}
