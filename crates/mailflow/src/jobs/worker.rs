use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{
    model::{LeasedJob, QueueName},
    queue::JobQueue,
    retry::ErrorClass,
    runner::{Disposition, JobRunner},
};

/// Pause after a failed lease call before asking the queue again.
const LEASE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl JobError {
    pub fn retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn class(&self) -> ErrorClass {
        if self.retryable {
            ErrorClass::Retryable
        } else {
            ErrorClass::NonRetryable
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &LeasedJob) -> Result<(), JobError>;

    /// Called once the job has landed in the failed set.
    async fn on_exhausted(&self, _job: &LeasedJob, _err: &JobError) {}
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub queue: QueueName,
    pub worker_id: String,
    pub concurrency: usize,
    pub lease: Duration,
    pub idle_sleep: Duration,
    pub reap_interval: Duration,
}

impl ConsumerConfig {
    pub fn new(queue: QueueName, worker_id: impl Into<String>, concurrency: usize) -> Self {
        Self {
            queue,
            worker_id: worker_id.into(),
            concurrency: concurrency.max(1),
            lease: Duration::from_secs(120),
            idle_sleep: Duration::from_millis(250),
            reap_interval: Duration::from_secs(15),
        }
    }
}

/// Pulls jobs from one queue and runs up to `concurrency` of them at once.
pub struct Consumer {
    queue: Arc<dyn JobQueue>,
    runner: JobRunner,
    handler: Arc<dyn JobHandler>,
    cfg: ConsumerConfig,
}

impl Consumer {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        runner: JobRunner,
        handler: Arc<dyn JobHandler>,
        cfg: ConsumerConfig,
    ) -> Self {
        Self {
            queue,
            runner,
            handler,
            cfg,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.cfg.concurrency));
        let mut last_reap: Option<Instant> = None;

        info!(
            queue = %self.cfg.queue,
            worker_id = %self.cfg.worker_id,
            concurrency = self.cfg.concurrency,
            "consumer started"
        );

        loop {
            // Reclaim jobs from dead workers on a fixed interval, not every poll.
            if last_reap.map_or(true, |t| t.elapsed() >= self.cfg.reap_interval) {
                match self.queue.reap_expired().await {
                    Ok(n) if n > 0 => info!(queue = %self.cfg.queue, reaped = n, "reaped expired leases"),
                    Ok(_) => {}
                    Err(e) => warn!(queue = %self.cfg.queue, error = %e, "reap failed"),
                }
                last_reap = Some(Instant::now());
            }

            let permit = semaphore.clone().acquire_owned().await?;

            let leased = match self
                .queue
                .lease(self.cfg.queue, &self.cfg.worker_id, self.cfg.lease)
                .await
            {
                Ok(leased) => leased,
                Err(e) => {
                    error!(queue = %self.cfg.queue, error = %e, "lease failed");
                    drop(permit);
                    tokio::time::sleep(LEASE_ERROR_BACKOFF).await;
                    continue;
                }
            };

            let Some(job) = leased else {
                drop(permit);
                tokio::time::sleep(self.cfg.idle_sleep).await;
                continue;
            };

            let handler = self.handler.clone();
            let runner = self.runner.clone();
            tokio::spawn(async move {
                let _permit = permit;
                execute(handler.as_ref(), &runner, job).await;
            });
        }
    }
}

async fn execute(handler: &dyn JobHandler, runner: &JobRunner, job: LeasedJob) {
    let started = Instant::now();
    debug!(
        job_id = %job.id,
        queue = %job.queue,
        attempt = job.attempt,
        replay = job.replay,
        "leased job"
    );

    let result = handler.handle(&job).await;
    let latency_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(()) => {
            if let Err(e) = runner.on_success(job.id).await {
                error!(job_id = %job.id, error = %e, "failed to mark job completed");
            }
        }
        Err(err) => match runner.on_failure(&job, &err).await {
            Ok(Disposition::Retried { delay }) => {
                info!(
                    job_id = %job.id,
                    queue = %job.queue,
                    attempt = job.attempt,
                    code = %err.code,
                    delay_ms = delay.as_millis() as u64,
                    latency_ms,
                    "attempt failed, retry scheduled"
                );
            }
            Ok(Disposition::Failed { reason_code }) => {
                warn!(
                    job_id = %job.id,
                    queue = %job.queue,
                    attempt = job.attempt,
                    code = %err.code,
                    reason = reason_code,
                    message = %err.message,
                    "job moved to failed set"
                );
                handler.on_exhausted(&job, &err).await;
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to record job failure");
            }
        },
    }
}
