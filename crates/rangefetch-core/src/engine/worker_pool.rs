//! Worker pool - downloads the chunks of one job concurrently
//!
//! One dispatcher task moves chunk ids from the pending channel into a
//! bounded work queue. Workers share the queue's receiver and each one
//! streams its chunk into the temp file through its own file handle, using
//! positioned writes at absolute offsets. Retries happen inside the worker,
//! re-requesting from the chunk's current offset.
//!
//! When adaptive splitting is on, a ticker measures per-chunk speed and
//! hands the tail of slow chunks to idle workers.

use crate::engine::buffer_pool::{BufferPool, PooledBuffer};
use crate::engine::chunk::ChunkTable;
use crate::engine::retry::{ErrorClassifier, RetryDecision, RetryPolicy};
use crate::engine::scheduler::{AdaptiveScheduler, ChunkSpeed};
use crate::engine::speed_controller::SpeedController;
use crate::engine::stats::StatsCounters;
use crate::engine::transport::HttpTransport;
use crate::error::{DownloadError, FetchError};
use futures::StreamExt;
use parking_lot::Mutex as SyncMutex;
use rangefetch_types::{ChunkStatus, Configuration, EngineEvent, ErrorKind};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Everything a worker needs to know about the job it serves
#[derive(Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub url: String,
    pub part_path: PathBuf,
    pub config: Configuration,
    pub transport: Arc<dyn HttpTransport>,
    pub stats: Arc<StatsCounters>,
    pub job_limiter: SpeedController,
    pub global_limiter: SpeedController,
    pub event_tx: broadcast::Sender<EngineEvent>,
    /// Job-level token; cancelling it stops the pool
    pub cancel: CancellationToken,
}

pub struct WorkerPool {
    ctx: JobContext,
    table: ChunkTable,
    workers: u32,
    policy: RetryPolicy,
}

struct Shared {
    ctx: JobContext,
    table: ChunkTable,
    buffers: BufferPool,
    policy: RetryPolicy,
    /// Stops every task of this run: completion, failure or job cancel
    run_token: CancellationToken,
    /// First non-cancellation failure
    failure: SyncMutex<Option<DownloadError>>,
    idle: AtomicU32,
}

impl WorkerPool {
    pub fn new(ctx: JobContext, table: ChunkTable, workers: u32) -> Self {
        let workers = workers.max(1);
        let policy = RetryPolicy::new(ctx.config.max_retries);
        Self {
            ctx,
            table,
            workers,
            policy,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Download every waiting chunk of the table
    ///
    /// Returns once all chunks are completed, a chunk fails for good, or
    /// the job is cancelled. Bytes written before a failure stay valid.
    pub async fn run(self) -> Result<(), DownloadError> {
        let job_id = self.ctx.job_id;
        let workers = self.workers;
        let initial = self.table.waiting_ids();
        info!(
            "Job {}: starting {} workers for {} chunks",
            job_id,
            workers,
            initial.len()
        );
        if initial.is_empty() {
            if self.table.all_completed() {
                return Ok(());
            }
            return Err(DownloadError::new(
                ErrorKind::Unknown,
                "no chunks waiting and the download is not complete",
            ));
        }

        let shared = Arc::new(Shared {
            buffers: BufferPool::new(self.ctx.config.buffer_size, workers as usize),
            policy: self.policy.with_fallback(workers > 1),
            run_token: self.ctx.cancel.child_token(),
            failure: SyncMutex::new(None),
            idle: AtomicU32::new(0),
            ctx: self.ctx,
            table: self.table,
        });

        let (pending_tx, pending_rx) = mpsc::unbounded_channel::<u32>();
        for id in initial {
            let _ = pending_tx.send(id);
        }
        let (work_tx, work_rx) = mpsc::channel::<u32>(workers as usize);
        let work_rx = Arc::new(Mutex::new(work_rx));

        let dispatcher = tokio::spawn(dispatch(pending_rx, work_tx, shared.run_token.clone()));

        let splitter = if shared.ctx.config.adaptive && workers > 1 {
            Some(tokio::spawn(Arc::clone(&shared).split_slow_chunks(pending_tx.clone())))
        } else {
            None
        };

        let mut handles = Vec::with_capacity(workers as usize);
        for index in 0..workers {
            let worker = Arc::clone(&shared);
            let rx = Arc::clone(&work_rx);
            handles.push(tokio::spawn(async move { worker.work(index, rx).await }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Job {}: worker task ended abnormally: {}", job_id, e);
                shared.record_failure(DownloadError::new(
                    ErrorKind::Unknown,
                    format!("worker task ended abnormally: {}", e),
                ));
            }
        }
        shared.run_token.cancel();
        drop(pending_tx);
        let _ = dispatcher.await;
        if let Some(splitter) = splitter {
            let _ = splitter.await;
        }

        if let Some(err) = shared.failure.lock().take() {
            return Err(err);
        }
        if shared.ctx.cancel.is_cancelled() {
            return Err(ErrorClassifier::classify(FetchError::Cancelled));
        }
        if !shared.table.all_completed() {
            return Err(DownloadError::new(
                ErrorKind::Unknown,
                "workers stopped with unfinished chunks",
            ));
        }
        debug!("Job {}: all chunks completed", job_id);
        Ok(())
    }
}

/// Forward pending chunk ids into the bounded work queue
async fn dispatch(
    mut pending_rx: mpsc::UnboundedReceiver<u32>,
    work_tx: mpsc::Sender<u32>,
    run_token: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = run_token.cancelled() => break,
            id = pending_rx.recv() => id,
        };
        let Some(id) = next else { break };
        tokio::select! {
            biased;
            _ = run_token.cancelled() => break,
            sent = work_tx.send(id) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}

impl Shared {
    fn record_failure(&self, err: DownloadError) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(err);
        }
    }

    async fn work(self: Arc<Self>, index: u32, work_rx: Arc<Mutex<mpsc::Receiver<u32>>>) {
        let job_id = self.ctx.job_id;
        let mut file = match OpenOptions::new()
            .write(true)
            .open(&self.ctx.part_path)
            .await
        {
            Ok(file) => file,
            Err(e) => {
                let err = ErrorClassifier::classify(e.into());
                error!("Job {}: worker {} cannot open temp file: {}", job_id, index, err);
                self.record_failure(err);
                self.run_token.cancel();
                return;
            }
        };

        loop {
            self.idle.fetch_add(1, Ordering::Relaxed);
            let next = {
                let mut rx = work_rx.lock().await;
                tokio::select! {
                    biased;
                    _ = self.run_token.cancelled() => None,
                    id = rx.recv() => id,
                }
            };
            self.idle.fetch_sub(1, Ordering::Relaxed);

            let Some(id) = next else { break };
            self.ctx.stats.worker_started();
            let outcome = self.download_chunk(id, &mut file).await;
            self.ctx.stats.worker_finished();

            match outcome {
                Ok(()) => {
                    if self.table.all_completed() {
                        self.run_token.cancel();
                    }
                }
                Err(err) if err.is_cancelled() => break,
                Err(err) => {
                    self.record_failure(err);
                    self.run_token.cancel();
                    break;
                }
            }
        }
        debug!("Job {}: worker {} exiting", job_id, index);
    }

    /// Drive one chunk to completion, retrying per the policy
    async fn download_chunk(&self, id: u32, file: &mut File) -> Result<(), DownloadError> {
        let job_id = self.ctx.job_id;
        let chunk = self
            .table
            .begin(id)
            .map_err(|e| DownloadError::new(ErrorKind::Unknown, e.to_string()))?;
        let mut retries = chunk.retries();
        debug!(
            "Job {}: chunk {} bytes {}-{} from offset {}",
            job_id,
            id,
            chunk.start,
            chunk.end,
            chunk.position()
        );

        loop {
            let err = match self.attempt(id, file).await {
                Ok(()) => {
                    self.table
                        .complete(id)
                        .map_err(|e| DownloadError::new(ErrorKind::Unknown, e.to_string()))?;
                    debug!("Job {}: chunk {} complete", job_id, id);
                    return Ok(());
                }
                Err(FetchError::Cancelled) => return Err(self.cancelled(id)),
                Err(e) => ErrorClassifier::classify(e),
            };

            match self.policy.decide(&err, retries) {
                RetryDecision::Retry { delay, attempt } => {
                    warn!(
                        "Job {}: chunk {} failed ({}), retry {}/{} in {:?}",
                        job_id,
                        id,
                        err,
                        attempt,
                        self.policy.max_retries(),
                        delay
                    );
                    let _ = self.table.fail(id, err.message());
                    retries = self.table.requeue(id).unwrap_or(attempt);
                    self.ctx.stats.record_retry();
                    let _ = self.ctx.event_tx.send(EngineEvent::ChunkRetry {
                        job_id,
                        chunk_id: id,
                        attempt,
                        kind: err.kind(),
                        delay_ms: delay.as_millis() as u64,
                    });

                    tokio::select! {
                        biased;
                        _ = self.run_token.cancelled() => {
                            // Not started yet, leave it waiting
                            return Err(ErrorClassifier::classify(FetchError::Cancelled));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.table
                        .begin(id)
                        .map_err(|e| DownloadError::new(ErrorKind::Unknown, e.to_string()))?;
                }
                RetryDecision::Fallback { reason } => {
                    warn!("Job {}: chunk {} giving up on this layout: {}", job_id, id, reason);
                    let _ = self.table.fail(id, err.message());
                    return Err(err);
                }
                RetryDecision::Abort { reason } => {
                    error!("Job {}: chunk {} failed: {} ({})", job_id, id, err, reason);
                    let _ = self.table.fail(id, err.message());
                    return Err(err);
                }
            }
        }
    }

    fn cancelled(&self, id: u32) -> DownloadError {
        let _ = self.table.fail(id, "cancelled");
        ErrorClassifier::classify(FetchError::Cancelled)
    }

    /// One ranged GET from the chunk's current offset to its current end
    async fn attempt(&self, id: u32, file: &mut File) -> Result<(), FetchError> {
        let chunk = self
            .table
            .get(id)
            .ok_or_else(|| FetchError::Unknown(format!("chunk {} vanished", id)))?;
        if chunk.is_filled() {
            return Ok(());
        }
        let start = chunk.position();
        let end = (!chunk.is_open_ended()).then_some(chunk.end);
        let timeout = self.ctx.config.timeout();

        let response = tokio::select! {
            biased;
            _ = self.run_token.cancelled() => return Err(FetchError::Cancelled),
            response = tokio::time::timeout(
                timeout,
                self.ctx.transport.get_range(&self.ctx.url, start, end),
            ) => response.map_err(|_| FetchError::Timeout(timeout))??,
        };
        let mut body = response.body;
        let mut buffer = self.buffers.acquire();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.run_token.cancelled() => return Err(FetchError::Cancelled),
                next = tokio::time::timeout(timeout, body.next()) => {
                    next.map_err(|_| FetchError::Timeout(timeout))?
                }
            };

            match next {
                Some(Ok(bytes)) => {
                    let mut data = &bytes[..];
                    while !data.is_empty() {
                        let take = data.len().min(buffer.spare());
                        buffer.extend_from_slice(&data[..take]);
                        data = &data[take..];
                        if buffer.is_full() && !self.flush(id, file, &mut buffer).await? {
                            // A split moved our end; the rest belongs to another chunk
                            return Ok(());
                        }
                    }
                }
                Some(Err(e)) => {
                    // Keep what already arrived so the retry starts after it
                    self.flush(id, file, &mut buffer).await?;
                    return Err(e);
                }
                None => {
                    self.flush(id, file, &mut buffer).await?;
                    break;
                }
            }
        }

        match self.table.get(id) {
            Some(chunk) if !chunk.is_open_ended() && !chunk.is_filled() => {
                Err(FetchError::Connection(format!(
                    "stream ended at byte {} before chunk end {}",
                    chunk.position(),
                    chunk.end
                )))
            }
            _ => Ok(()),
        }
    }

    /// Write the buffered bytes at the chunk's offset
    ///
    /// Returns `false` once the chunk has no room left.
    async fn flush(
        &self,
        id: u32,
        file: &mut File,
        buffer: &mut PooledBuffer,
    ) -> Result<bool, FetchError> {
        let wanted = buffer.len() as u64;
        if wanted == 0 {
            return Ok(true);
        }

        tokio::select! {
            biased;
            _ = self.run_token.cancelled() => return Err(FetchError::Cancelled),
            _ = async {
                self.ctx.job_limiter.acquire(wanted).await;
                self.ctx.global_limiter.acquire(wanted).await;
            } => {}
        }

        let slot = self.table.reserve(id, wanted);
        if slot.len == 0 {
            buffer.clear();
            return Ok(false);
        }

        let data = &buffer[..slot.len as usize];
        let written = async {
            file.seek(SeekFrom::Start(slot.offset)).await?;
            file.write_all(data).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = written {
            self.table.rollback(id, slot.len);
            return Err(e.into());
        }

        self.table.commit(id, slot.len);
        self.ctx.stats.add_downloaded(slot.len);
        buffer.clear();
        Ok(slot.len == wanted)
    }

    /// Periodically split slow chunks for idle workers
    async fn split_slow_chunks(self: Arc<Self>, pending_tx: mpsc::UnboundedSender<u32>) {
        let job_id = self.ctx.job_id;
        let optimal = AdaptiveScheduler::optimal_chunk_size(self.ctx.config.chunk_size);
        let mut ticker = tokio::time::interval(self.ctx.config.monitor_interval());
        ticker.tick().await;
        let mut last_seen: HashMap<u32, u64> = HashMap::new();
        let mut last_tick = Instant::now();

        loop {
            tokio::select! {
                _ = self.run_token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let elapsed = last_tick.elapsed().as_secs_f64().max(f64::EPSILON);
            last_tick = Instant::now();

            let chunks = self.table.snapshot();
            let speeds: Vec<ChunkSpeed> = chunks
                .iter()
                .filter(|c| c.status() == ChunkStatus::Downloading)
                .map(|c| {
                    let before = last_seen.get(&c.id).copied().unwrap_or(c.downloaded());
                    ChunkSpeed {
                        id: c.id,
                        bytes_per_second: (c.downloaded().saturating_sub(before) as f64 / elapsed)
                            as u64,
                    }
                })
                .collect();
            last_seen = chunks.iter().map(|c| (c.id, c.downloaded())).collect();

            let idle = self.idle.load(Ordering::Relaxed) as usize;
            let waiting = chunks
                .iter()
                .filter(|c| c.status() == ChunkStatus::Waiting)
                .count();
            if idle <= waiting {
                continue;
            }

            let candidates = AdaptiveScheduler::split_candidates(&chunks, &speeds, optimal);
            for id in candidates.into_iter().take(idle - waiting) {
                let Some(chunk) = self.table.get(id) else { continue };
                let Some(at) = AdaptiveScheduler::split_point(&chunk) else { continue };
                if let Some(tail) = self.table.split(id, at) {
                    info!(
                        "Job {}: split slow chunk {} at byte {} into chunk {}",
                        job_id, id, at, tail.id
                    );
                    let _ = self.ctx.event_tx.send(EngineEvent::ChunkSplit {
                        job_id,
                        chunk_id: id,
                        new_chunk_id: tail.id,
                        split_at: at,
                    });
                    if pending_tx.send(tail.id).is_err() {
                        return;
                    }
                }
            }
        }
    }
}
