// Download orchestration — a bounded, deduplicated admission queue feeding a
// concurrency-limited worker pool. Each admitted job ends in exactly one
// terminal event pushed through the hub.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::hub::{Hub, WsEvent};
use crate::upstream::client::{planned_file_path, CatalogClient};
use crate::upstream::paths::{dashify, resolve_folder};
use crate::util::file_exists_non_empty;

/// Enqueue request body for `POST /download`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub model_version_id: i64,
}

/// One admitted unit of work. Immutable after admission.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub job_id: String,
    pub client_id: String,
    pub model_version_id: i64,
}

impl DownloadJob {
    fn dedup_key(&self) -> (String, i64) {
        (self.client_id.clone(), self.model_version_id)
    }
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    /// Not a failure: the same (client, version) pair is already inflight.
    #[error("download already queued: {0}")]
    AlreadyQueued(String),
    #[error("queue full")]
    QueueFull,
    #[error("service shutting down")]
    ShuttingDown,
}

/// Admission state guarded by one lock: the dedup check and the queue insert
/// must observe each other atomically.
struct Admission {
    closing: bool,
    inflight: HashMap<(String, i64), String>,
    queue: Option<mpsc::Sender<DownloadJob>>,
}

pub struct DownloaderService {
    hub: Arc<Hub>,
    client: CatalogClient,
    base_dir: String,
    admission: Arc<Mutex<Admission>>,
    queue_rx: Mutex<Option<mpsc::Receiver<DownloadJob>>>,
    slots: Arc<Semaphore>,
    shutdown_token: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl DownloaderService {
    pub fn new(
        hub: Arc<Hub>,
        config: &GatewayConfig,
        shutdown_token: CancellationToken,
    ) -> anyhow::Result<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_size.max(1));
        let client = CatalogClient::new(&config.upstream, shutdown_token.clone())?;

        Ok(Self {
            hub,
            client,
            base_dir: config.base_dir.clone(),
            admission: Arc::new(Mutex::new(Admission {
                closing: false,
                inflight: HashMap::new(),
                queue: Some(queue_tx),
            })),
            queue_rx: Mutex::new(Some(queue_rx)),
            slots: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            shutdown_token,
            dispatcher: Mutex::new(None),
        })
    }

    pub fn catalog(&self) -> &CatalogClient {
        &self.client
    }

    /// Admit a job. At most one not-yet-terminal job exists per
    /// (client, version) pair; a duplicate gets the existing job id back.
    pub fn enqueue(&self, job: DownloadJob) -> Result<(), EnqueueError> {
        let mut admission = self.admission.lock();
        if admission.closing {
            return Err(EnqueueError::ShuttingDown);
        }

        let key = job.dedup_key();
        if let Some(existing) = admission.inflight.get(&key) {
            return Err(EnqueueError::AlreadyQueued(existing.clone()));
        }

        let Some(queue) = admission.queue.as_ref() else {
            return Err(EnqueueError::ShuttingDown);
        };
        let job_id = job.job_id.clone();
        match queue.try_send(job) {
            Ok(()) => {
                debug!(
                    "download enqueued jobId={} clientId={} modelVersionId={}",
                    job_id, key.0, key.1
                );
                admission.inflight.insert(key, job_id);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(EnqueueError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EnqueueError::ShuttingDown),
        }
    }

    /// Start the dispatcher: FIFO consume, acquire a worker slot, spawn the
    /// worker. Exits once the queue closes or shutdown is signalled, then
    /// waits out any workers still running.
    pub fn run(self: &Arc<Self>) {
        let mut rx = match self.queue_rx.lock().take() {
            Some(rx) => rx,
            None => return,
        };
        let service = Arc::clone(self);
        let shutdown = self.shutdown_token.clone();

        let handle = tokio::spawn(async move {
            let mut workers = JoinSet::new();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    // Reap finished workers as they complete; a crashed worker
                    // must not take the dispatcher down with it.
                    Some(res) = workers.join_next() => {
                        if let Err(err) = res {
                            warn!("download worker crashed: {}", err);
                        }
                    }
                    job = rx.recv() => {
                        let Some(job) = job else { break };
                        let permit = tokio::select! {
                            _ = shutdown.cancelled() => break,
                            permit = Arc::clone(&service.slots).acquire_owned() => match permit {
                                Ok(permit) => permit,
                                Err(_) => break,
                            },
                        };

                        let worker = Arc::clone(&service);
                        workers.spawn(async move {
                            let _permit = permit;
                            worker.run_job(job).await;
                        });
                    }
                }
            }

            // Drain whatever is still running at shutdown.
            while let Some(res) = workers.join_next().await {
                if let Err(err) = res {
                    warn!("download worker crashed: {}", err);
                }
            }
        });

        *self.dispatcher.lock() = Some(handle);
    }

    /// Refuse new work, close the queue, and wait for workers to drain.
    pub async fn shutdown(&self) {
        {
            let mut admission = self.admission.lock();
            admission.closing = true;
            admission.queue = None;
            admission.inflight.clear();
        }
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!("dispatcher join failed: {}", err);
            }
        }
    }

    /// Execute one job, emitting exactly one terminal event — unless shutdown
    /// preempted entry, in which case the subscribers are gone anyway.
    async fn run_job(&self, job: DownloadJob) {
        let _inflight = InflightGuard {
            admission: Arc::clone(&self.admission),
            key: job.dedup_key(),
        };

        if self.shutdown_token.is_cancelled() {
            return;
        }

        info!(
            "download started jobId={} clientId={} modelVersionId={}",
            job.job_id, job.client_id, job.model_version_id
        );

        let info = match self.client.get_model_version(job.model_version_id).await {
            Ok(info) => info,
            Err(err) => {
                error!("download failed fetching model info: {}", err);
                return self.emit_failed(&job, err.to_string());
            }
        };

        let download_url = info.download_url.trim().to_string();
        let base_model = dashify(&info.base_model);
        let model_type = dashify(info.model.kind.as_deref().unwrap_or(""));

        if download_url.is_empty() {
            error!("download failed; missing download link jobId={}", job.job_id);
            return self.emit_failed(&job, "couldn't determine download link");
        }
        if base_model.is_empty() {
            error!("download failed; missing basemodel jobId={}", job.job_id);
            return self.emit_failed(&job, "couldn't determine basemodel");
        }

        let Some(folder) = resolve_folder(&self.base_dir, &base_model, &model_type) else {
            error!(
                "download failed; invalid folder path jobId={} baseModel={} modelType={}",
                job.job_id, base_model, model_type
            );
            return self.emit_failed(&job, "failed to create folder path");
        };

        let planned = planned_file_path(&folder, info.preferred_filename(), job.model_version_id);
        if file_exists_non_empty(&planned) {
            info!(
                "download skipped; file exists jobId={} file={}",
                job.job_id,
                planned.display()
            );
            return self.emit_completed(&job, "already downloaded", &folder);
        }

        if let Err(err) = tokio::fs::create_dir_all(&folder).await {
            error!(
                "download failed creating folder {}: {}",
                folder.display(),
                err
            );
            return self.emit_failed(&job, "failed to create folder");
        }

        if let Err(err) = self
            .client
            .download(&download_url, job.model_version_id, &folder)
            .await
        {
            error!("download failed jobId={}: {}", job.job_id, err);
            return self.emit_failed(&job, err.to_string());
        }

        info!(
            "download completed jobId={} folder={}",
            job.job_id,
            folder.display()
        );
        self.emit_completed(&job, "download complete", &folder);
    }

    fn emit_completed(&self, job: &DownloadJob, message: &str, folder: &Path) {
        self.hub.send_to(
            &job.client_id,
            &WsEvent::completed(
                &job.job_id,
                job.model_version_id,
                message,
                folder.display().to_string(),
            ),
        );
    }

    fn emit_failed(&self, job: &DownloadJob, message: impl Into<String>) {
        self.hub.send_to(
            &job.client_id,
            &WsEvent::failed(&job.job_id, job.model_version_id, message),
        );
    }
}

/// Clears the dedup key on every worker exit path, panics included.
struct InflightGuard {
    admission: Arc<Mutex<Admission>>,
    key: (String, i64),
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.admission.lock().inflight.remove(&self.key);
    }
}
