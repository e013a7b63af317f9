//! Adaptive concurrency and chunk splitting
//!
//! One [`AdaptiveScheduler`] lives in each `DownloadManager`. It keeps a
//! rolling average of finished-job speeds, picks the starting worker count
//! for new jobs, and decides which running chunks are slow enough to split.

use crate::engine::chunk::Chunk;
use rangefetch_types::{ChunkStatus, MIN_CHUNK_SIZE};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;

/// Rolling average above which new jobs start with twice the workers
pub const HIGH_SPEED_THRESHOLD: u64 = 10 * MB;

/// Weight of the newest sample in the rolling average
const EMA_ALPHA: f64 = 0.3;

/// Per-chunk speed measured by the pool between two ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpeed {
    pub id: u32,
    pub bytes_per_second: u64,
}

#[derive(Debug, Default)]
pub struct AdaptiveScheduler {
    /// Exponential moving average of finished-job speeds, bytes/s
    average_speed: AtomicU64,
}

impl AdaptiveScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Worker count for a new job, never above `limit`
    pub fn initial_concurrency(&self, total_size: Option<u64>, limit: u32) -> u32 {
        let limit = limit.max(1);
        let Some(total) = total_size else {
            return 1;
        };
        let base: u32 = match total {
            t if t < MB => 1,
            t if t < 10 * MB => 2,
            t if t < 100 * MB => 4,
            t if t < GB => 8,
            _ => 16,
        };
        let average = self.rolling_average();
        let wanted = if average > HIGH_SPEED_THRESHOLD {
            base * 2
        } else {
            base
        };
        debug!(
            "Adaptive concurrency for {} bytes: {} (rolling average {} B/s, limit {})",
            total, wanted, average, limit
        );
        wanted.min(limit)
    }

    /// Fold a finished job's average speed into the rolling average
    pub fn record_job_speed(&self, bytes_per_second: u64) {
        if bytes_per_second == 0 {
            return;
        }
        let _ = self
            .average_speed
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                if current == 0 {
                    Some(bytes_per_second)
                } else {
                    let next = EMA_ALPHA * bytes_per_second as f64
                        + (1.0 - EMA_ALPHA) * current as f64;
                    Some(next.round() as u64)
                }
            });
    }

    pub fn rolling_average(&self) -> u64 {
        self.average_speed.load(Ordering::Relaxed)
    }

    /// Chunk size below which splitting is not worth a new request
    pub fn optimal_chunk_size(chunk_size: u64) -> u64 {
        chunk_size.max(MIN_CHUNK_SIZE)
    }

    /// Running chunks worth splitting, slowest first
    ///
    /// A chunk qualifies when at least two optimal chunks remain and it runs
    /// below half the mean speed of all running chunks.
    pub fn split_candidates(chunks: &[Chunk], speeds: &[ChunkSpeed], optimal: u64) -> Vec<u32> {
        let running: Vec<&ChunkSpeed> = speeds
            .iter()
            .filter(|s| {
                chunks
                    .iter()
                    .any(|c| c.id == s.id && c.status() == ChunkStatus::Downloading)
            })
            .collect();
        if running.len() < 2 {
            // Nothing to compare against
            return Vec::new();
        }
        let average =
            running.iter().map(|s| s.bytes_per_second).sum::<u64>() as f64 / running.len() as f64;

        let mut slow: Vec<&ChunkSpeed> = running
            .into_iter()
            .filter(|s| (s.bytes_per_second as f64) < 0.5 * average)
            .filter(|s| {
                chunks
                    .iter()
                    .find(|c| c.id == s.id)
                    .and_then(Chunk::remaining)
                    .is_some_and(|remaining| remaining >= 2 * optimal)
            })
            .collect();
        slow.sort_by_key(|s| s.bytes_per_second);
        slow.into_iter().map(|s| s.id).collect()
    }

    /// Where to cut `chunk`: halfway through what's left early on, three
    /// quarters once 30% is done
    pub fn split_point(chunk: &Chunk) -> Option<u64> {
        let remaining = chunk.remaining()?;
        if remaining < 2 {
            return None;
        }
        let offset = if chunk.progress() < 0.3 {
            remaining / 2
        } else {
            remaining * 3 / 4
        };
        Some(chunk.position() + offset.max(1))
    }
}
