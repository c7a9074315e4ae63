use rand::{rngs::StdRng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{
    model::LeasedJob,
    queue::JobQueue,
    retry::{next_delay, ErrorClass, RetryConfig},
    worker::JobError,
};

pub const REASON_NON_RETRYABLE: &str = "NON_RETRYABLE";
pub const REASON_MAX_ATTEMPTS: &str = "MAX_ATTEMPTS_EXCEEDED";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Retried { delay: Duration },
    Failed { reason_code: &'static str },
}

/// Applies the retry policy to finished attempts.
#[derive(Clone)]
pub struct JobRunner {
    queue: Arc<dyn JobQueue>,
    retry_cfg: RetryConfig,
}

impl JobRunner {
    pub fn new(queue: Arc<dyn JobQueue>, retry_cfg: RetryConfig) -> Self {
        Self { queue, retry_cfg }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry_cfg
    }

    pub async fn on_success(&self, job_id: Uuid) -> anyhow::Result<()> {
        self.queue.complete(job_id).await
    }

    pub async fn on_failure(&self, job: &LeasedJob, err: &JobError) -> anyhow::Result<Disposition> {
        let can_retry = err.class() == ErrorClass::Retryable && job.attempt < job.max_attempts;

        if can_retry {
            let mut rng = StdRng::from_entropy();
            let delay = next_delay(job.attempt, &self.retry_cfg, &mut rng);
            self.queue
                .retry_later(job.id, delay, &err.code, &err.message)
                .await?;
            return Ok(Disposition::Retried { delay });
        }

        let reason_code = match err.class() {
            ErrorClass::NonRetryable => REASON_NON_RETRYABLE,
            ErrorClass::Retryable => REASON_MAX_ATTEMPTS,
        };
        self.queue
            .fail(job.id, reason_code, &err.code, &err.message)
            .await?;
        Ok(Disposition::Failed { reason_code })
    }
}
