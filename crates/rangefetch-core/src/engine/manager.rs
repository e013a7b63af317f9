//! Download manager - the engine's entry point
//!
//! The manager owns everything shared between jobs:
//! - the HTTP transport
//! - the global speed limit
//! - the adaptive scheduler and its rolling speed average
//! - the event channel
//! - a shutdown token that every job token derives from

use crate::engine::chunk::Chunk;
use crate::engine::download_task::{DownloadJob, DownloadTask};
use crate::engine::planner::ChunkPlanner;
use crate::engine::retry::ErrorClassifier;
use crate::engine::scheduler::AdaptiveScheduler;
use crate::engine::speed_controller::SpeedController;
use crate::engine::stats::StatsCounters;
use crate::engine::transport::{HttpTransport, ReqwestTransport};
use crate::error::{DownloadError, FetchError};
use rangefetch_types::{
    Configuration, DownloadResult, DownloadStatistics, EngineEvent, ErrorKind, JobStatus,
    ProbeInfo,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Coordinates all downloads of one engine instance
#[derive(Clone)]
pub struct DownloadManager {
    /// Running jobs
    active: Arc<RwLock<HashMap<Uuid, ActiveJob>>>,
    transport: Arc<dyn HttpTransport>,
    global_limiter: SpeedController,
    scheduler: Arc<AdaptiveScheduler>,
    event_tx: broadcast::Sender<EngineEvent>,
    shutdown: CancellationToken,
}

struct ActiveJob {
    cancel: CancellationToken,
    stats: Arc<StatsCounters>,
}

/// Handle to a submitted job
pub struct JobHandle {
    id: Uuid,
    destination: PathBuf,
    cancel: CancellationToken,
    stats: Arc<StatsCounters>,
    task: JoinHandle<DownloadResult>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Request cancellation; the partial download is kept
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn statistics(&self) -> DownloadStatistics {
        self.stats.snapshot()
    }

    /// Wait for the job to reach a terminal state
    pub async fn wait(self) -> DownloadResult {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                let err = DownloadError::new(ErrorKind::Unknown, format!("job task failed: {}", e));
                DownloadResult {
                    job_id: self.id,
                    file_path: self.destination,
                    total_size: self.stats.total(),
                    downloaded_bytes: self.stats.downloaded(),
                    transferred_bytes: self.stats.transferred(),
                    duration: Duration::ZERO,
                    average_speed: 0,
                    status: JobStatus::Failed,
                    is_success: false,
                    error_message: Some(err.to_string()),
                    error: Some(err.report()),
                }
            }
        }
    }
}

impl DownloadManager {
    /// Create a manager backed by a `reqwest` transport
    pub fn new(event_tx: broadcast::Sender<EngineEvent>) -> Result<Self, DownloadError> {
        let transport = ReqwestTransport::new().map_err(ErrorClassifier::classify)?;
        Ok(Self::with_transport(Arc::new(transport), event_tx))
    }

    pub fn with_transport(
        transport: Arc<dyn HttpTransport>,
        event_tx: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            active: Arc::new(RwLock::new(HashMap::new())),
            transport,
            global_limiter: SpeedController::unlimited(),
            scheduler: Arc::new(AdaptiveScheduler::new()),
            event_tx,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    pub fn scheduler(&self) -> &AdaptiveScheduler {
        &self.scheduler
    }

    /// Limit the combined speed of all jobs (0 = unlimited)
    pub async fn set_global_speed_limit(&self, bytes_per_second: u64) {
        info!("Global speed limit set to {} B/s", bytes_per_second);
        self.global_limiter.set_limit(bytes_per_second).await;
    }

    pub async fn global_speed_limit(&self) -> u64 {
        self.global_limiter.limit().await
    }

    /// Fetch metadata for a URL without downloading it
    pub async fn probe(&self, url: &str) -> Result<ProbeInfo, DownloadError> {
        validate_url(url)?;
        self.transport
            .probe(url)
            .await
            .map_err(ErrorClassifier::classify)
    }

    /// Chunk layout a fresh download of `url` would use
    pub async fn plan(
        &self,
        url: &str,
        config: &Configuration,
    ) -> Result<(ProbeInfo, Vec<Chunk>), DownloadError> {
        let config = config.normalized();
        config
            .validate()
            .map_err(|msg| ErrorClassifier::classify(FetchError::Configuration(msg)))?;
        let probe = self.probe(url).await?;
        if probe.size == Some(0) {
            return Ok((probe, Vec::new()));
        }
        let chunks = ChunkPlanner::plan(probe.size, probe.supports_range, 0, &config)
            .map_err(ErrorClassifier::classify)?;
        Ok((probe, chunks))
    }

    /// Validate and start a job in the background
    pub async fn submit(&self, job: DownloadJob) -> Result<JobHandle, DownloadError> {
        validate_url(&job.url)?;
        job.config
            .normalized()
            .validate()
            .map_err(|msg| ErrorClassifier::classify(FetchError::Configuration(msg)))?;

        let id = job.id;
        let destination = job.destination.clone();
        let mut active = self.active.write().await;
        if active.contains_key(&id) {
            warn!("Job {} is already running", id);
            return Err(DownloadError::new(
                ErrorKind::Configuration,
                format!("job {} is already running", id),
            ));
        }

        let cancel = self.shutdown.child_token();
        let stats = Arc::new(StatsCounters::new());
        active.insert(
            id,
            ActiveJob {
                cancel: cancel.clone(),
                stats: Arc::clone(&stats),
            },
        );
        drop(active);

        let _ = self.event_tx.send(EngineEvent::JobAdded {
            job_id: id,
            url: job.url.clone(),
            destination: job.destination.clone(),
        });
        info!(
            "Submitted job {}: {} (threads: {}, limit: {} B/s)",
            id, job.url, job.config.thread_count, job.config.speed_limit
        );

        let task = DownloadTask::new(
            job,
            Arc::clone(&self.transport),
            Arc::clone(&self.scheduler),
            Arc::clone(&stats),
            self.global_limiter.clone(),
            self.event_tx.clone(),
            cancel.clone(),
        );
        let active = Arc::clone(&self.active);
        let task = tokio::spawn(async move {
            let result = task.run().await;
            active.write().await.remove(&id);
            result
        });

        Ok(JobHandle {
            id,
            destination,
            cancel,
            stats,
            task,
        })
    }

    /// Submit a job and wait for its result
    pub async fn download(&self, job: DownloadJob) -> Result<DownloadResult, DownloadError> {
        Ok(self.submit(job).await?.wait().await)
    }

    /// Cancel one job; returns `false` if it isn't running
    pub async fn cancel(&self, id: Uuid) -> bool {
        match self.active.read().await.get(&id) {
            Some(job) => {
                info!("Cancelling job {}", id);
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn cancel_all(&self) {
        for (id, job) in self.active.read().await.iter() {
            info!("Cancelling job {}", id);
            job.cancel.cancel();
        }
    }

    /// Cancel every job, present and future
    pub fn shutdown(&self) {
        info!("Shutting down download manager");
        self.shutdown.cancel();
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    pub async fn is_active(&self, id: Uuid) -> bool {
        self.active.read().await.contains_key(&id)
    }

    pub async fn statistics(&self, id: Uuid) -> Option<DownloadStatistics> {
        self.active
            .read()
            .await
            .get(&id)
            .map(|job| job.stats.snapshot())
    }
}

fn validate_url(raw: &str) -> Result<(), DownloadError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| ErrorClassifier::classify(FetchError::InvalidUrl(format!("{}: {}", raw, e))))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ErrorClassifier::classify(FetchError::InvalidUrl(format!(
            "unsupported scheme '{}' in {}",
            other, raw
        )))),
    }
}
