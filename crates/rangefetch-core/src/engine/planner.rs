//! Chunk planner - computes the initial or resume chunk layout

use crate::engine::chunk::{Chunk, OPEN_END};
use crate::error::FetchError;
use rangefetch_types::{Configuration, MAX_THREAD_COUNT};
use tracing::debug;

pub struct ChunkPlanner;

impl ChunkPlanner {
    /// Plan the chunks covering `[already_downloaded, total_size)`
    ///
    /// Falls back to one chunk when ranges are unsupported, the size is
    /// unknown or the file fits in one chunk. Errors when there is nothing
    /// to plan rather than returning an empty set.
    pub fn plan(
        total_size: Option<u64>,
        supports_range: bool,
        already_downloaded: u64,
        config: &Configuration,
    ) -> Result<Vec<Chunk>, FetchError> {
        let Some(total) = total_size else {
            debug!("Unknown size, planning one open-ended chunk from {}", already_downloaded);
            return Ok(vec![Chunk::new(0, already_downloaded, OPEN_END)]);
        };

        if already_downloaded >= total {
            return Err(FetchError::Planning(format!(
                "no bytes left to plan: {} of {} already downloaded",
                already_downloaded, total
            )));
        }

        if !supports_range || total <= config.chunk_size {
            return Ok(vec![Chunk::new(0, already_downloaded, total - 1)]);
        }

        let chunk_size = config.chunk_size.max(1);
        let remaining = total - already_downloaded;
        let threads = u64::from(config.thread_count.clamp(1, MAX_THREAD_COUNT));
        let count = threads.min(remaining.div_ceil(chunk_size));
        if count == 0 {
            return Err(FetchError::Planning(format!(
                "computed zero chunks for {} remaining bytes",
                remaining
            )));
        }

        let base = remaining / count;
        let chunks: Vec<Chunk> = (0..count)
            .map(|i| {
                let start = already_downloaded + i * base;
                let end = if i == count - 1 {
                    total - 1
                } else {
                    start + base - 1
                };
                Chunk::new(i as u32, start, end)
            })
            .collect();

        debug!(
            "Planned {} chunks of ~{} bytes over [{}, {})",
            chunks.len(),
            base,
            already_downloaded,
            total
        );
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MIB: u64 = 1024 * 1024;

    fn config(threads: u32, chunk_size: u64) -> Configuration {
        Configuration {
            thread_count: threads,
            chunk_size,
            ..Default::default()
        }
    }

    fn assert_partition(chunks: &[Chunk], from: u64, total: u64) {
        assert!(!chunks.is_empty());
        assert_eq!(chunks[0].start, from);
        assert_eq!(chunks.last().unwrap().end, total - 1);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end + 1, pair[1].start, "gap or overlap");
        }
    }

    #[test]
    fn test_ten_mib_four_threads() {
        let chunks = ChunkPlanner::plan(Some(10 * MIB), true, 0, &config(4, 2 * MIB)).unwrap();
        assert_eq!(chunks.len(), 4);
        assert_partition(&chunks, 0, 10 * MIB);
        let total: u64 = chunks.iter().map(|c| c.size()).sum();
        assert_eq!(total, 10 * MIB);
    }

    #[test]
    fn test_ten_mib_enough_threads_gives_five_chunks() {
        let chunks = ChunkPlanner::plan(Some(10 * MIB), true, 0, &config(8, 2 * MIB)).unwrap();
        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| c.size() == 2 * MIB));
    }

    #[test]
    fn test_remainder_goes_to_last_chunk() {
        let chunks = ChunkPlanner::plan(Some(1_000_003), true, 0, &config(4, 65_536)).unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].size(), 250_000);
        assert_eq!(chunks[3].size(), 250_003);
    }

    #[test]
    fn test_no_range_support_is_single_stream() {
        let chunks = ChunkPlanner::plan(Some(50 * MIB), false, 0, &config(8, MIB)).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!((chunks[0].start, chunks[0].end), (0, 50 * MIB - 1));
    }

    #[test]
    fn test_small_file_is_single_stream() {
        let chunks = ChunkPlanner::plan(Some(MIB), true, 0, &config(8, 2 * MIB)).unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_unknown_size_is_open_ended() {
        let chunks = ChunkPlanner::plan(None, true, 0, &config(8, MIB)).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_open_ended());
    }

    #[test]
    fn test_resume_plans_only_remaining_range() {
        let chunks = ChunkPlanner::plan(Some(10 * MIB), true, 3 * MIB, &config(4, MIB)).unwrap();
        assert_eq!(chunks.len(), 4);
        assert_partition(&chunks, 3 * MIB, 10 * MIB);
        assert!(chunks.iter().all(|c| c.start >= 3 * MIB));
    }

    #[test]
    fn test_nothing_left_is_an_error() {
        let err = ChunkPlanner::plan(Some(MIB), true, MIB, &config(4, MIB)).unwrap_err();
        assert!(matches!(err, FetchError::Planning(_)));
        let err = ChunkPlanner::plan(Some(MIB), true, 2 * MIB, &config(4, MIB)).unwrap_err();
        assert!(matches!(err, FetchError::Planning(_)));
    }

    proptest! {
        #[test]
        fn prop_plan_partitions_range(
            total in 1u64..200 * MIB,
            threads in 1u32..=32,
            chunk_size in 65_536u64..16 * MIB,
            resume_ratio in 0.0f64..1.0,
        ) {
            let already = ((total as f64) * resume_ratio) as u64;
            prop_assume!(already < total);

            let chunks = ChunkPlanner::plan(Some(total), true, already, &config(threads, chunk_size)).unwrap();
            prop_assert!(!chunks.is_empty());
            prop_assert!(chunks.len() <= threads as usize);
            prop_assert_eq!(chunks[0].start, already);
            prop_assert_eq!(chunks.last().unwrap().end, total - 1);
            for pair in chunks.windows(2) {
                prop_assert_eq!(pair[0].end + 1, pair[1].start);
            }
            let covered: u64 = chunks.iter().map(|c| c.size()).sum();
            prop_assert_eq!(covered, total - already);
        }
    }
}
