//! Worker pool that drains the job queue.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use governor::{Quota, RateLimiter};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use jotter_core::hub::{QueueUpdate, RequestComplete, RequestFailed};
use jotter_core::{
    defaults, Error, FailOutcome, HubEvent, Job, JobQueue, NotificationHub,
    RequestRepository, RequestStatus, RequestType, Result, Topic,
};

use crate::processor::{ProcessContext, ProcessorSet, ProgressReporter};

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Polling interval in milliseconds when no wake-up arrives.
    pub poll_interval_ms: u64,
    /// Maximum number of concurrent jobs.
    pub max_concurrent_jobs: usize,
    /// Maximum number of claims per second.
    pub dequeue_per_second: u32,
    /// Whether to enable job processing.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::JOB_POLL_INTERVAL_MS,
            max_concurrent_jobs: defaults::JOB_MAX_CONCURRENT,
            dequeue_per_second: defaults::JOB_DEQUEUE_PER_SECOND,
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_MAX_CONCURRENT` | `20` | Max concurrent jobs |
    /// | `JOB_DEQUEUE_PER_SECOND` | `10` | Max claims per second |
    /// | `JOB_POLL_INTERVAL_MS` | `1000` | Polling interval when the queue is idle |
    pub fn from_env() -> Self {
        let enabled = std::env::var("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let max_concurrent_jobs = std::env::var("JOB_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::JOB_MAX_CONCURRENT)
            .max(1);

        let dequeue_per_second = std::env::var("JOB_DEQUEUE_PER_SECOND")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults::JOB_DEQUEUE_PER_SECOND)
            .max(1);

        let poll_interval_ms = std::env::var("JOB_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_POLL_INTERVAL_MS);

        Self {
            poll_interval_ms,
            max_concurrent_jobs,
            dequeue_per_second,
            enabled,
        }
    }

    /// Create a new config with custom poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set maximum concurrent jobs.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    /// Set maximum claims per second.
    pub fn with_dequeue_per_second(mut self, n: u32) -> Self {
        self.dequeue_per_second = n.max(1);
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the worker pool.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// An attempt of a job was started.
    JobStarted {
        request_id: Uuid,
        request_type: RequestType,
        attempt: u32,
    },
    /// A job completed successfully.
    JobCompleted {
        request_id: Uuid,
        request_type: RequestType,
    },
    /// An attempt failed.
    JobFailed {
        request_id: Uuid,
        error: String,
        will_retry: bool,
    },
    /// A failed job will run again after `delay`.
    RetryScheduled {
        request_id: Uuid,
        attempt: u32,
        delay: Duration,
    },
    /// Worker started.
    WorkerStarted,
    /// Worker stopped.
    WorkerStopped,
}

/// Handle for controlling a running worker pool.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop claiming jobs and wait for in-flight jobs to finish.
    pub async fn shutdown(self) -> Result<()> {
        // The loop may already have exited (disabled worker).
        let _ = self.shutdown_tx.send(()).await;
        self.task
            .await
            .map_err(|e| Error::Internal(format!("Worker task failed: {e}")))
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

type ClaimLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Pool of job executors bounded by a concurrency cap and a claim rate.
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    requests: Arc<dyn RequestRepository>,
    hub: Arc<NotificationHub>,
    processors: ProcessorSet,
    config: WorkerConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl WorkerPool {
    /// Create a new worker pool.
    pub fn new(
        queue: Arc<dyn JobQueue>,
        requests: Arc<dyn RequestRepository>,
        hub: Arc<NotificationHub>,
        processors: ProcessorSet,
        config: WorkerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            queue,
            requests,
            hub,
            processors,
            config,
            event_tx,
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let task = tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
            task,
        }
    }

    /// Claim loop. Each claim waits for a free slot and a rate-limiter
    /// token; an empty queue parks the loop until the queue's wake handle
    /// fires or the poll interval elapses.
    #[instrument(skip(self, shutdown_rx))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Job worker is disabled, not starting");
            return;
        }

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            max_concurrent = self.config.max_concurrent_jobs,
            dequeue_per_second = self.config.dequeue_per_second,
            "Job worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let slots = Arc::new(Semaphore::new(self.config.max_concurrent_jobs));
        let rate = NonZeroU32::new(self.config.dequeue_per_second).unwrap_or(NonZeroU32::MIN);
        let limiter: ClaimLimiter = RateLimiter::direct(Quota::per_second(rate));
        let wake = self.queue.wake_handle();
        let mut tasks = JoinSet::new();

        loop {
            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    error!(error = ?e, "Job task panicked");
                }
            }

            let permit = tokio::select! {
                _ = shutdown_rx.recv() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = limiter.until_ready() => {}
            }

            match self.queue.claim_next().await {
                Ok(Some(job)) => {
                    let executor = self.executor();
                    tasks.spawn(async move {
                        executor.execute(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = wake.notified() => {}
                        _ = sleep(poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(error = %e, "Failed to claim job");
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = sleep(poll_interval) => {}
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "Job worker draining");
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = ?e, "Job task panicked");
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Job worker stopped");
    }

    fn executor(&self) -> JobExecutor {
        JobExecutor {
            queue: self.queue.clone(),
            requests: self.requests.clone(),
            hub: self.hub.clone(),
            processors: self.processors.clone(),
            event_tx: self.event_tx.clone(),
        }
    }
}

/// Reference bundle for executing a single job in a spawned task.
struct JobExecutor {
    queue: Arc<dyn JobQueue>,
    requests: Arc<dyn RequestRepository>,
    hub: Arc<NotificationHub>,
    processors: ProcessorSet,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobExecutor {
    async fn execute(self, job: Job) {
        let start = Instant::now();
        let payload = job.payload;
        let request_id = payload.request_id;
        let attempt = job.attempts_made;

        info!(
            request_id = %request_id,
            space_id = %payload.space_id,
            job_key = %job.key,
            request_type = %payload.request_type,
            attempt,
            "Processing job"
        );
        let _ = self.event_tx.send(WorkerEvent::JobStarted {
            request_id,
            request_type: payload.request_type,
            attempt,
        });

        // Resolve the owner before touching the request so a failed lookup
        // leaves it in a state the retry can still move to PROCESSING.
        let owner_login = match self.requests.get_with_owner(request_id).await {
            Ok(Some(owned)) => owned.owner_login,
            Ok(None) => {
                self.abandon(&job, Error::MissingRequestRecord(request_id))
                    .await;
                return;
            }
            Err(e) => {
                self.abandon(&job, e).await;
                return;
            }
        };

        let request = match self.requests.mark_processing(request_id, Utc::now()).await {
            Ok(request) => request,
            Err(Error::RequestNotFound(_)) => {
                self.abandon(&job, Error::MissingRequestRecord(request_id))
                    .await;
                return;
            }
            Err(e) => {
                self.abandon(&job, e).await;
                return;
            }
        };

        self.hub
            .emit(
                &Topic::Queue(payload.space_id),
                HubEvent::QueueUpdate(QueueUpdate {
                    request_id,
                    space_id: payload.space_id,
                    status: RequestStatus::Processing,
                    position: None,
                    progress: None,
                }),
            )
            .await;

        let ctx = ProcessContext {
            request_id,
            space_id: payload.space_id,
            request_type: payload.request_type,
            input: request.input,
            attempt,
            progress: ProgressReporter::new(
                self.hub.clone(),
                request_id,
                payload.space_id,
                owner_login.clone(),
            ),
        };

        let processor = self.processors.for_type(payload.request_type).clone();
        let outcome = match processor.process(ctx).await {
            Ok(result) => serde_json::to_value(&result).map_err(Error::from),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(result) => {
                if let Err(e) = self.succeed(&job, &owner_login, result).await {
                    self.fail(&job, &owner_login, e).await;
                    return;
                }
                info!(
                    request_id = %request_id,
                    job_key = %job.key,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Job completed successfully"
                );
                let _ = self.event_tx.send(WorkerEvent::JobCompleted {
                    request_id,
                    request_type: payload.request_type,
                });
            }
            Err(e) => self.fail(&job, &owner_login, e).await,
        }
    }

    async fn succeed(&self, job: &Job, owner_login: &str, result: serde_json::Value) -> Result<()> {
        let payload = job.payload;
        self.requests
            .mark_completed(payload.request_id, result.clone(), Utc::now())
            .await?;
        if let Err(e) = self.queue.complete(&job.key).await {
            // The request is already COMPLETED; only the queue bookkeeping is off.
            error!(error = %e, job_key = %job.key, "Failed to mark job as completed");
        }

        self.hub
            .emit_many(
                &[
                    Topic::Request(payload.request_id),
                    Topic::User(owner_login.to_string()),
                ],
                HubEvent::RequestComplete(RequestComplete {
                    request_id: payload.request_id,
                    space_id: payload.space_id,
                    request_type: payload.request_type,
                    result,
                }),
            )
            .await;
        self.emit_queue_status(job, RequestStatus::Completed).await;
        Ok(())
    }

    /// Record a processing failure, let the queue decide on a retry, and
    /// tell subscribers which way it went.
    async fn fail(&self, job: &Job, owner_login: &str, err: Error) {
        let payload = job.payload;
        let message = err.to_string();
        let retryable = err.is_retryable();

        if let Err(e) = self
            .requests
            .mark_failed(payload.request_id, &message, Utc::now())
            .await
        {
            error!(error = %e, request_id = %payload.request_id, "Failed to mark request as failed");
        }

        let will_retry = match self.fail_job(job, &message, retryable).await {
            Some(outcome) => outcome.will_retry(),
            None => false,
        };

        warn!(
            request_id = %payload.request_id,
            job_key = %job.key,
            attempt = job.attempts_made,
            will_retry,
            error = %message,
            "Job failed"
        );

        self.hub
            .emit_many(
                &[
                    Topic::Request(payload.request_id),
                    Topic::User(owner_login.to_string()),
                ],
                HubEvent::RequestFailed(RequestFailed {
                    request_id: payload.request_id,
                    space_id: payload.space_id,
                    request_type: payload.request_type,
                    error: message.clone(),
                    attempt: job.attempts_made,
                    max_attempts: job.max_attempts,
                    will_retry,
                }),
            )
            .await;
        self.emit_queue_status(job, RequestStatus::Failed).await;

        let _ = self.event_tx.send(WorkerEvent::JobFailed {
            request_id: payload.request_id,
            error: message,
            will_retry,
        });
    }

    /// Fail a job before processing started. The request has not been moved
    /// to PROCESSING, so nothing is broadcast and a retry can still pick it up.
    async fn abandon(&self, job: &Job, err: Error) {
        let message = err.to_string();
        let retryable = err.is_retryable();
        error!(
            request_id = %job.payload.request_id,
            job_key = %job.key,
            retryable,
            error = %message,
            "Job could not start"
        );
        let will_retry = self
            .fail_job(job, &message, retryable)
            .await
            .is_some_and(|o| o.will_retry());
        let _ = self.event_tx.send(WorkerEvent::JobFailed {
            request_id: job.payload.request_id,
            error: message,
            will_retry,
        });
    }

    async fn fail_job(&self, job: &Job, message: &str, retryable: bool) -> Option<FailOutcome> {
        match self.queue.fail(&job.key, message, retryable).await {
            Ok(outcome) => {
                if let FailOutcome::Retrying { attempt, delay } = outcome {
                    self.schedule_wake(delay);
                    debug!(
                        job_key = %job.key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retry scheduled"
                    );
                    let _ = self.event_tx.send(WorkerEvent::RetryScheduled {
                        request_id: job.payload.request_id,
                        attempt,
                        delay,
                    });
                }
                Some(outcome)
            }
            Err(e) => {
                error!(error = %e, job_key = %job.key, "Failed to record job failure");
                None
            }
        }
    }

    /// Wake the claim loop once the backoff delay has elapsed.
    fn schedule_wake(&self, delay: Duration) {
        let wake = self.queue.wake_handle();
        tokio::spawn(async move {
            sleep(delay).await;
            wake.notify_one();
        });
    }

    async fn emit_queue_status(&self, job: &Job, status: RequestStatus) {
        self.hub
            .emit(
                &Topic::Queue(job.payload.space_id),
                HubEvent::QueueUpdate(QueueUpdate {
                    request_id: job.payload.request_id,
                    space_id: job.payload.space_id,
                    status,
                    position: None,
                    progress: None,
                }),
            )
            .await;
    }
}

/// Builder for creating a worker pool.
pub struct WorkerBuilder {
    queue: Arc<dyn JobQueue>,
    requests: Arc<dyn RequestRepository>,
    hub: Arc<NotificationHub>,
    processors: Option<ProcessorSet>,
    config: WorkerConfig,
}

impl WorkerBuilder {
    /// Create a new worker builder.
    pub fn new(
        queue: Arc<dyn JobQueue>,
        requests: Arc<dyn RequestRepository>,
        hub: Arc<NotificationHub>,
    ) -> Self {
        Self {
            queue,
            requests,
            hub,
            processors: None,
            config: WorkerConfig::default(),
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the processors.
    pub fn with_processors(mut self, processors: ProcessorSet) -> Self {
        self.processors = Some(processors);
        self
    }

    /// Build the pool. Fails when no processors were configured.
    pub fn build(self) -> Result<WorkerPool> {
        let processors = self
            .processors
            .ok_or_else(|| Error::Config("worker pool has no processors".into()))?;
        Ok(WorkerPool::new(
            self.queue,
            self.requests,
            self.hub,
            processors,
            self.config,
        ))
    }
}
