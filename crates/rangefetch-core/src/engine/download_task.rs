//! Download task - runs one job from probe to promoted file
//!
//! Probe the URL, decide whether to resume, plan chunks, size the temp
//! file, run the worker pool with a progress monitor and checkpointer
//! alongside, then verify and move the file into place. Every outcome,
//! including cancellation, ends up in a [`DownloadResult`].

use crate::engine::chunk::ChunkTable;
use crate::engine::monitor::ProgressMonitor;
use crate::engine::planner::ChunkPlanner;
use crate::engine::resume::{ResumeDecision, ResumeMetadata, ResumeStore};
use crate::engine::retry::{ErrorClassifier, RetryDecision, RetryPolicy};
use crate::engine::scheduler::AdaptiveScheduler;
use crate::engine::speed_controller::SpeedController;
use crate::engine::stats::StatsCounters;
use crate::engine::transport::HttpTransport;
use crate::engine::worker_pool::{JobContext, WorkerPool};
use crate::error::{DownloadError, FetchError};
use rangefetch_types::{
    Configuration, DownloadResult, EngineEvent, ErrorKind, JobStatus, ProbeInfo,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::OpenOptions;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A download request: what to fetch, where to, and how
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub id: Uuid,
    pub url: String,
    pub destination: PathBuf,
    pub config: Configuration,
}

impl DownloadJob {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            destination: destination.into(),
            config: Configuration::default(),
        }
    }

    pub fn with_config(mut self, config: Configuration) -> Self {
        self.config = config;
        self
    }
}

/// What a successful run produced
struct Completion {
    total_size: u64,
}

pub struct DownloadTask {
    job: DownloadJob,
    transport: Arc<dyn HttpTransport>,
    scheduler: Arc<AdaptiveScheduler>,
    stats: Arc<StatsCounters>,
    job_limiter: SpeedController,
    global_limiter: SpeedController,
    event_tx: broadcast::Sender<EngineEvent>,
    cancel: CancellationToken,
}

impl DownloadTask {
    pub fn new(
        job: DownloadJob,
        transport: Arc<dyn HttpTransport>,
        scheduler: Arc<AdaptiveScheduler>,
        stats: Arc<StatsCounters>,
        global_limiter: SpeedController,
        event_tx: broadcast::Sender<EngineEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let mut job = job;
        job.config = job.config.normalized();
        let job_limiter = SpeedController::new(job.config.speed_limit);
        Self {
            job,
            transport,
            scheduler,
            stats,
            job_limiter,
            global_limiter,
            event_tx,
            cancel,
        }
    }

    /// Run the job to a terminal state
    pub async fn run(self) -> DownloadResult {
        let started = Instant::now();
        self.stats.mark_started();
        info!(
            "Starting job {}: {} -> {}",
            self.job.id,
            self.job.url,
            self.job.destination.display()
        );

        let outcome = self.execute().await;
        self.stats.mark_finished();
        let duration = started.elapsed();
        let transferred = self.stats.transferred();
        let average_speed = if duration.as_secs_f64() > 0.0 {
            (transferred as f64 / duration.as_secs_f64()) as u64
        } else {
            transferred
        };

        let mut result = DownloadResult {
            job_id: self.job.id,
            file_path: self.job.destination.clone(),
            total_size: self.stats.total(),
            downloaded_bytes: self.stats.downloaded(),
            transferred_bytes: transferred,
            duration,
            average_speed,
            status: JobStatus::Completed,
            is_success: true,
            error_message: None,
            error: None,
        };

        match outcome {
            Ok(done) => {
                result.total_size = done.total_size;
                result.downloaded_bytes = done.total_size;
                if transferred > 0 {
                    self.scheduler.record_job_speed(average_speed);
                }
                info!(
                    "Job {} completed: {} bytes ({} transferred) in {:.1?}",
                    self.job.id, done.total_size, transferred, duration
                );
                self.emit_status(JobStatus::Completed, None);
            }
            Err(err) if err.is_cancelled() => {
                if self.job.config.enable_resume_support {
                    info!("Job {} cancelled, partial data kept for resume", self.job.id);
                } else {
                    info!("Job {} cancelled", self.job.id);
                    self.discard_partial().await;
                }
                result.status = JobStatus::Cancelled;
                result.is_success = false;
                self.emit_status(JobStatus::Cancelled, None);
            }
            Err(err) => {
                warn!("Job {} failed: {}", self.job.id, err);
                if !self.job.config.enable_resume_support {
                    self.discard_partial().await;
                }
                result.status = JobStatus::Failed;
                result.is_success = false;
                result.error_message = Some(err.to_string());
                result.error = Some(err.report());
                self.emit_status(JobStatus::Failed, Some(err.to_string()));
            }
        }
        result
    }

    async fn execute(&self) -> Result<Completion, DownloadError> {
        let config = &self.job.config;
        config
            .validate()
            .map_err(|msg| classify(FetchError::Configuration(msg)))?;

        self.emit_status(JobStatus::Probing, None);
        let probe = self.probe_with_retries().await?;
        let url = probe.final_url.clone().unwrap_or_else(|| probe.url.clone());
        let total = probe.size;
        info!(
            "Job {}: size {:?}, ranges {}, etag {:?}",
            self.job.id, total, probe.supports_range, probe.etag
        );

        let store = ResumeStore::for_destination(&self.job.destination);
        let existing = match store.inspect(&probe, config).await.map_err(classify)? {
            ResumeDecision::AlreadyComplete { size } => {
                self.stats.set_total(size);
                self.stats.set_downloaded(size);
                return Ok(Completion { total_size: size });
            }
            ResumeDecision::Resume { existing_bytes } => existing_bytes,
            ResumeDecision::Fresh { reason } => {
                debug!("Job {}: starting fresh ({})", self.job.id, reason);
                0
            }
        };

        if let Some(parent) = self.job.destination.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| classify(e.into()))?;
            }
        }
        self.prepare_part_file(&store, &probe, existing).await?;

        self.stats.set_total(total.unwrap_or(0));
        self.stats.set_downloaded(existing);

        let needs_transfer = total.map_or(true, |size| existing < size);
        if needs_transfer {
            self.emit_status(JobStatus::Downloading, None);
            self.transfer(&store, &probe, &url, existing).await?;
        }

        self.emit_status(JobStatus::Verifying, None);
        let final_size = match store.promote(total).await {
            Ok(size) => size,
            Err(e @ FetchError::SizeMismatch { .. }) => {
                warn!("Job {}: {}, discarding partial data", self.job.id, e);
                let _ = store.discard().await;
                return Err(classify(e));
            }
            Err(e) => return Err(classify(e)),
        };
        self.stats.set_total(final_size);
        self.stats.set_downloaded(final_size);
        Ok(Completion {
            total_size: final_size,
        })
    }

    /// Probe with the job's retry budget; permanent errors fail at once
    async fn probe_with_retries(&self) -> Result<ProbeInfo, DownloadError> {
        let policy = RetryPolicy::new(self.job.config.max_retries);
        let timeout = self.job.config.timeout();
        let mut retries = 0;
        loop {
            let attempt = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(classify(FetchError::Cancelled)),
                probe = tokio::time::timeout(timeout, self.transport.probe(&self.job.url)) => {
                    probe.unwrap_or(Err(FetchError::Timeout(timeout)))
                }
            };
            let err = match attempt {
                Ok(probe) => return Ok(probe),
                Err(e) => classify(e),
            };
            match policy.decide(&err, retries) {
                RetryDecision::Retry { delay, attempt } => {
                    warn!(
                        "Job {}: probe failed ({}), retry {} in {:?}",
                        self.job.id, err, attempt, delay
                    );
                    retries = attempt;
                    self.stats.record_retry();
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(classify(FetchError::Cancelled)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::Fallback { .. } | RetryDecision::Abort { .. } => return Err(err),
            }
        }
    }

    async fn prepare_part_file(
        &self,
        store: &ResumeStore,
        probe: &ProbeInfo,
        existing: u64,
    ) -> Result<(), DownloadError> {
        // A sized part must never exist without a sidecar, or a later run
        // would take its length for progress
        if existing == 0 {
            store
                .save(&ResumeMetadata::from_probe(probe, 0))
                .await
                .map_err(classify)?;
        }
        let total = probe.size;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(existing == 0)
            .open(store.part_path())
            .await
            .map_err(|e| classify(e.into()))?;
        if let (true, Some(size)) = (self.job.config.pre_allocate_file, total) {
            file.set_len(size).await.map_err(|e| classify(e.into()))?;
            debug!("Job {}: preallocated {} bytes", self.job.id, size);
        }
        Ok(())
    }

    /// Run the pool over `[existing, total)`, falling back to one worker
    /// when a multi-worker run keeps timing out
    async fn transfer(
        &self,
        store: &ResumeStore,
        probe: &ProbeInfo,
        url: &str,
        existing: u64,
    ) -> Result<(), DownloadError> {
        let config = &self.job.config;
        let workers = if !probe.supports_range || probe.size.is_none() {
            1
        } else if config.adaptive {
            self.scheduler
                .initial_concurrency(probe.size, config.thread_count)
        } else {
            config.thread_count
        };
        let mut plan_config = config.clone();
        plan_config.thread_count = workers;
        let chunks = ChunkPlanner::plan(probe.size, probe.supports_range, existing, &plan_config)
            .map_err(classify)?;
        info!(
            "Job {}: {} chunks, {} workers, resuming at byte {}",
            self.job.id,
            chunks.len(),
            workers,
            existing
        );

        let monitor_token = self.cancel.child_token();
        let monitor = ProgressMonitor::new(
            self.job.id,
            Arc::clone(&self.stats),
            config.monitor_interval(),
            workers,
            self.event_tx.clone(),
        )
        .spawn(monitor_token.clone());

        let table = ChunkTable::new(chunks);
        let mut result = self.run_pool(store, probe, url, table.clone(), workers).await;

        if let Err(err) = &result {
            if err.kind() == ErrorKind::Timeout && workers > 1 && !self.cancel.is_cancelled() {
                let remaining = table.unfinished_ranges();
                warn!(
                    "Job {}: timeouts with {} workers, retrying {} ranges on a single connection",
                    self.job.id,
                    workers,
                    remaining.len()
                );
                result = self
                    .run_pool(store, probe, url, ChunkTable::new(remaining), 1)
                    .await;
            }
        }

        monitor_token.cancel();
        let _ = monitor.await;
        result
    }

    async fn run_pool(
        &self,
        store: &ResumeStore,
        probe: &ProbeInfo,
        url: &str,
        table: ChunkTable,
        workers: u32,
    ) -> Result<(), DownloadError> {
        let base = table
            .snapshot()
            .iter()
            .map(|c| c.start)
            .min()
            .unwrap_or(0);
        let resumable = self.job.config.enable_resume_support && probe.supports_range;

        let checkpoint_token = self.cancel.child_token();
        let checkpointer = resumable.then(|| {
            self.spawn_checkpointer(
                store.clone(),
                probe.clone(),
                table.clone(),
                base,
                checkpoint_token.clone(),
            )
        });

        let ctx = JobContext {
            job_id: self.job.id,
            url: url.to_string(),
            part_path: store.part_path().to_path_buf(),
            config: self.job.config.clone(),
            transport: Arc::clone(&self.transport),
            stats: Arc::clone(&self.stats),
            job_limiter: self.job_limiter.clone(),
            global_limiter: self.global_limiter.clone(),
            event_tx: self.event_tx.clone(),
            cancel: self.cancel.clone(),
        };
        let result = WorkerPool::new(ctx, table.clone(), workers).run().await;

        checkpoint_token.cancel();
        if let Some(handle) = checkpointer {
            let _ = handle.await;
            let completed = table.contiguous_end(base);
            if let Err(e) = store.save(&ResumeMetadata::from_probe(probe, completed)).await {
                warn!("Job {}: failed to save resume metadata: {}", self.job.id, e);
            }
        }
        result
    }

    fn spawn_checkpointer(
        &self,
        store: ResumeStore,
        probe: ProbeInfo,
        table: ChunkTable,
        base: u64,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let job_id = self.job.id;
        // Refreshed once per monitor sample
        let interval = self.job.config.monitor_interval();
        tokio::spawn(async move {
            let mut last_saved = None;
            loop {
                let completed = table.contiguous_end(base);
                if last_saved != Some(completed) {
                    match store.save(&ResumeMetadata::from_probe(&probe, completed)).await {
                        Ok(()) => last_saved = Some(completed),
                        Err(e) => warn!("Job {}: checkpoint failed: {}", job_id, e),
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
    }

    /// Drop the temp file and sidecar of a run that can't be resumed
    async fn discard_partial(&self) {
        let store = ResumeStore::for_destination(&self.job.destination);
        if let Err(e) = store.discard().await {
            warn!("Job {}: failed to remove partial data: {}", self.job.id, e);
        }
    }

    fn emit_status(&self, status: JobStatus, error: Option<String>) {
        let _ = self.event_tx.send(EngineEvent::JobStatusChanged {
            job_id: self.job.id,
            status,
            error,
        });
    }
}

fn classify(err: FetchError) -> DownloadError {
    ErrorClassifier::classify(err)
}
