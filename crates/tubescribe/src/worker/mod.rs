//! Background worker: claims pending jobs one at a time and drives
//! them to a terminal outcome, broadcasting every state change.
//!
//! The poll loop is the single active execution slot; only the worker
//! ever moves a job through `processing`, which is what makes that
//! status safe without a separate lease record.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broadcast::{BroadcastHub, QueueEvent};
use crate::processor::{ProcessOutcome, Processor};
use crate::queue::{JobStatus, JobStore, StoreError};

/// Progress checkpoints written before the external processor runs.
const PRE_PROCESS_CHECKPOINTS: [f64; 4] = [10.0, 30.0, 40.0, 50.0];
/// Progress checkpoints written while the processor's result settles.
const POST_PROCESS_CHECKPOINTS: [f64; 4] = [60.0, 70.0, 80.0, 90.0];

/// Tuning knobs for the worker. Defaults suit a production
/// deployment; tests shrink the delays.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Failed attempts allowed before a job is permanently failed.
    pub max_retries: u32,
    /// Base of the exponential retry backoff.
    pub initial_retry_delay: Duration,
    /// Idle wait between polls when no work is pending.
    pub poll_interval: Duration,
    /// Pause between progress checkpoints, so observers see movement.
    pub stage_delay: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_retry_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(5),
            stage_delay: Duration::from_millis(500),
        }
    }
}

/// The background job processor.
///
/// `start` launches the poll loop as a tokio task and returns;
/// `stop` lets the current job finish, then waits for the loop to end.
pub struct Worker {
    inner: Arc<WorkerInner>,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

struct WorkerInner {
    store: Arc<JobStore>,
    hub: Arc<BroadcastHub>,
    processor: Arc<dyn Processor>,
    options: WorkerOptions,
    running: AtomicBool,
}

impl Worker {
    pub fn new(
        store: Arc<JobStore>,
        hub: Arc<BroadcastHub>,
        processor: Arc<dyn Processor>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                store,
                hub,
                processor,
                options,
                running: AtomicBool::new(false),
            }),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    /// Launches the poll loop and returns immediately. Calling start
    /// on a running worker is a no-op.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.poll_loop().await });
        *self.handle.lock().await = Some(task);
        info!("Background worker started");
    }

    /// Signals the poll loop to exit after its current iteration and
    /// waits for it to end. The job in flight (if any) finishes first.
    /// Repeated stops are safe.
    pub async fn stop(&self) {
        info!("Stopping background worker...");
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.handle.lock().await.take() {
            if let Err(e) = task.await {
                error!("Worker task ended abnormally: {}", e);
            }
        }
        info!("Background worker stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Processes a single job end to end. Normally driven by the poll
    /// loop; exposed so hosts and tests can run one job directly.
    pub async fn process_job(&self, job_id: &str) {
        self.inner.process_job(job_id).await;
    }
}

impl WorkerInner {
    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Repeatedly drains the oldest pending job; idles when the queue
    /// is empty. Nothing escapes this loop — every per-job failure is
    /// converted into a stored `failed` record.
    async fn poll_loop(self: Arc<Self>) {
        while self.running() {
            match self.store.list_pending() {
                Ok(pending) if !pending.is_empty() => {
                    let job_id = pending[0].id.clone();
                    self.process_job(&job_id).await;
                }
                Ok(_) => {
                    tokio::time::sleep(self.options.poll_interval).await;
                }
                Err(e) => {
                    error!("Worker loop error: {}", e);
                    tokio::time::sleep(self.options.poll_interval).await;
                }
            }
        }
        debug!("Worker poll loop exited");
    }

    async fn process_job(&self, job_id: &str) {
        let job = match self.store.read(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                // Deleted concurrently; nothing to do.
                warn!("Job {} not found, skipping", job_id);
                return;
            }
            Err(e) => {
                error!("Failed to load job {}: {}", job_id, e);
                return;
            }
        };

        if job.subject_id.trim().is_empty() {
            // Data problem, not a transient one: never retried.
            error!("Job {} has no subject id", job_id);
            let _ = self
                .update_progress(job_id, JobStatus::Failed, 0.0, Some("Missing subject_id"))
                .await;
            return;
        }

        info!("Processing job {}: subject {}", job_id, job.subject_id);

        if let Err(message) = self.run_stages(job_id, &job.subject_id).await {
            error!("Job {} failed: {}", job_id, message);
            self.handle_job_failure(job_id, &message).await;
        }
    }

    /// The linear pipeline for one attempt. Any error string returned
    /// here flows into the retry policy.
    async fn run_stages(&self, job_id: &str, subject_id: &str) -> Result<(), String> {
        self.update_progress(job_id, JobStatus::Processing, 0.0, None)
            .await
            .map_err(|e| e.to_string())?;

        for checkpoint in PRE_PROCESS_CHECKPOINTS {
            self.update_progress(job_id, JobStatus::Processing, checkpoint, None)
                .await
                .map_err(|e| e.to_string())?;
            if checkpoint == PRE_PROCESS_CHECKPOINTS[0] {
                tokio::time::sleep(self.options.stage_delay).await;
            }
        }

        // The processor is blocking and possibly very slow; run it off
        // the async executor so updates and broadcasts stay responsive.
        let processor = Arc::clone(&self.processor);
        let subject = subject_id.to_string();
        let outcome = tokio::task::spawn_blocking(move || processor.process(&subject))
            .await
            .map_err(|e| format!("Processor task failed: {}", e))?;

        for checkpoint in POST_PROCESS_CHECKPOINTS {
            if self.running() {
                self.update_progress(job_id, JobStatus::Processing, checkpoint, None)
                    .await
                    .map_err(|e| e.to_string())?;
                tokio::time::sleep(self.options.stage_delay).await;
            }
        }

        match outcome {
            ProcessOutcome::Success {
                transcript_path,
                output_dir,
            } => {
                let locations = crate::queue::OutputLocations {
                    transcript_md: transcript_path.clone(),
                    transcript_json: transcript_path.as_ref().map(|p| p.replace(".md", ".json")),
                    metadata: output_dir.as_ref().map(|d| format!("{}/metadata.json", d)),
                };
                self.store
                    .update_output_locations(job_id, &locations)
                    .map_err(|e| e.to_string())?;

                self.update_progress(job_id, JobStatus::Completed, 100.0, None)
                    .await
                    .map_err(|e| e.to_string())?;
                info!("Job {} completed", job_id);
                Ok(())
            }
            ProcessOutcome::Error { message } => Err(message),
        }
    }

    /// Retry policy: under the limit, record the failure (this is the
    /// write that increments `retry_count`), back off exponentially,
    /// and re-queue; at the limit, permanently fail without a further
    /// increment.
    async fn handle_job_failure(&self, job_id: &str, error_msg: &str) {
        let job = match self.store.read(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                error!("Cannot record failure for {}: job not found", job_id);
                return;
            }
            Err(e) => {
                error!("Cannot record failure for {}: {}", job_id, e);
                return;
            }
        };

        let retry_count = job.retry_count;
        let max_retries = self.options.max_retries;

        if retry_count < max_retries {
            let message = format!(
                "{} (will retry, attempt {}/{})",
                error_msg,
                retry_count + 1,
                max_retries
            );
            if let Err(e) = self
                .update_progress(job_id, JobStatus::Failed, 0.0, Some(&message))
                .await
            {
                error!("Failed to record failure for {}: {}", job_id, e);
                return;
            }
            warn!(
                "Job {} failed (attempt {}/{}): {}",
                job_id,
                retry_count + 1,
                max_retries,
                error_msg
            );

            let delay = self.options.initial_retry_delay * 2u32.saturating_pow(retry_count);
            info!("Scheduling retry for job {} in {:?}", job_id, delay);
            tokio::time::sleep(delay).await;

            if let Err(e) = self
                .update_progress(job_id, JobStatus::Pending, 0.0, None)
                .await
            {
                error!("Failed to re-queue job {}: {}", job_id, e);
            }
        } else {
            let message = format!("Max retries exceeded ({}): {}", max_retries, error_msg);
            match self.store.fail_permanently(job_id, &message) {
                Ok(Some(job)) => {
                    error!(
                        "Job {} permanently failed after {} retries",
                        job_id, max_retries
                    );
                    self.hub.broadcast(&QueueEvent::JobUpdate { job }).await;
                }
                Ok(None) => error!("Cannot record failure for {}: job not found", job_id),
                Err(e) => error!("Failed to record failure for {}: {}", job_id, e),
            }
        }
    }

    /// Writes one status transition, then broadcasts the freshly
    /// persisted record. Write-then-broadcast, never the reverse.
    async fn update_progress(
        &self,
        job_id: &str,
        status: JobStatus,
        progress: f64,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        if let Some(job) = self
            .store
            .update_status(job_id, status, progress, error_message)?
        {
            self.hub.broadcast(&QueueEvent::JobUpdate { job }).await;
        }
        Ok(())
    }
}
