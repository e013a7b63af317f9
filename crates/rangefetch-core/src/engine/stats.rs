//! Lock-free job counters
//!
//! Workers bump the byte and retry counters on the hot path; the progress
//! monitor owns the speed fields. [`StatsCounters::snapshot`] reads every
//! field independently, so a snapshot is eventually consistent.

use chrono::{DateTime, TimeZone, Utc};
use rangefetch_types::DownloadStatistics;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct StatsCounters {
    total_bytes: AtomicU64,
    /// Bytes on disk, including any resumed prefix
    downloaded_bytes: AtomicU64,
    /// Bytes fetched over the network this run
    transferred_bytes: AtomicU64,
    current_speed: AtomicU64,
    average_speed: AtomicU64,
    peak_speed: AtomicU64,
    active_threads: AtomicU32,
    retry_count: AtomicU32,
    /// Unix millis, 0 when unset
    started_at: AtomicI64,
    finished_at: AtomicI64,
}

impl StatsCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_total(&self, total: u64) {
        self.total_bytes.store(total, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Seed the on-disk counter with a resumed prefix
    pub fn set_downloaded(&self, bytes: u64) {
        self.downloaded_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Record bytes a worker just wrote
    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.transferred_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded_bytes.load(Ordering::Relaxed)
    }

    pub fn transferred(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }

    pub fn record_retry(&self) {
        self.retry_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retries(&self) -> u32 {
        self.retry_count.load(Ordering::Relaxed)
    }

    pub fn worker_started(&self) {
        self.active_threads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_finished(&self) {
        let _ = self
            .active_threads
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn active_threads(&self) -> u32 {
        self.active_threads.load(Ordering::Relaxed)
    }

    /// Store the latest sampled speeds, tracking the peak
    pub fn record_speed(&self, current: u64, average: u64) {
        self.current_speed.store(current, Ordering::Relaxed);
        self.average_speed.store(average, Ordering::Relaxed);
        self.peak_speed.fetch_max(current, Ordering::Relaxed);
    }

    pub fn mark_started(&self) {
        self.started_at
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn mark_finished(&self) {
        self.finished_at
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.current_speed.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DownloadStatistics {
        DownloadStatistics {
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            downloaded_bytes: self.downloaded_bytes.load(Ordering::Relaxed),
            current_speed: self.current_speed.load(Ordering::Relaxed),
            average_speed: self.average_speed.load(Ordering::Relaxed),
            peak_speed: self.peak_speed.load(Ordering::Relaxed),
            active_threads: self.active_threads.load(Ordering::Relaxed),
            retry_count: self.retry_count.load(Ordering::Relaxed),
            started_at: millis_to_datetime(self.started_at.load(Ordering::Relaxed)),
            finished_at: millis_to_datetime(self.finished_at.load(Ordering::Relaxed)),
        }
    }
}

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    if millis == 0 {
        return None;
    }
    Utc.timestamp_millis_opt(millis).single()
}
