//! Progress bar for a running download

use crate::output::format_speed;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use rangefetch_types::{EngineEvent, HealthStatus, JobStatus};
use uuid::Uuid;

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}";
const SPINNER_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] {bytes} ({bytes_per_sec}) {msg}";

/// Renders engine events for one job
pub struct DownloadProgress {
    job_id: Uuid,
    bar: ProgressBar,
}

impl DownloadProgress {
    pub fn new(job_id: Uuid, name: &str) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(spinner_style());
        bar.set_message(name.to_string());
        bar.enable_steady_tick(std::time::Duration::from_millis(120));
        Self { job_id, bar }
    }

    /// Apply one event; returns `true` once the job is terminal
    pub fn handle_event(&self, event: &EngineEvent) -> bool {
        if event.job_id() != self.job_id {
            return false;
        }
        match event {
            EngineEvent::Progress { stats, .. } => {
                if stats.total_bytes > 0 && self.bar.length() != Some(stats.total_bytes) {
                    self.bar.set_length(stats.total_bytes);
                    self.bar.set_style(bar_style());
                }
                self.bar.set_position(stats.downloaded_bytes);
            }

            EngineEvent::ChunkRetry {
                chunk_id,
                attempt,
                kind,
                ..
            } => {
                self.bar.set_message(format!(
                    "{} chunk {} retry {} ({})",
                    style("↻").yellow(),
                    chunk_id,
                    attempt,
                    kind
                ));
            }

            EngineEvent::Health { report, .. } => match report.status {
                HealthStatus::Poor | HealthStatus::Critical => {
                    self.bar.set_message(format!(
                        "{} {:?} connection ({})",
                        style("!").red().bold(),
                        report.status,
                        format_speed(report.metrics.bytes_per_second)
                    ));
                }
                _ => self.bar.set_message(String::new()),
            },

            EngineEvent::JobStatusChanged { status, .. } => match status {
                JobStatus::Probing => self.bar.set_message("probing"),
                JobStatus::Verifying => self.bar.set_message("verifying"),
                status if status.is_terminal() => {
                    self.bar.finish_and_clear();
                    return true;
                }
                _ => {}
            },

            _ => {}
        }
        false
    }

    pub fn clear(&self) {
        self.bar.finish_and_clear();
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓▒░  ")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template(SPINNER_TEMPLATE).unwrap_or_else(|_| ProgressStyle::default_spinner())
}
