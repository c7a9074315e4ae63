use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use super::model::{FailedJob, JobOptions, LeasedJob, QueueCounts, QueueJob, QueueName, SubmitOutcome};

/// Durable two-queue store with at-least-once delivery.
///
/// A leased job stays invisible to other consumers until it is completed,
/// rescheduled, failed, or its lease expires and `reap_expired` puts it back.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Adds a job to the queue named by its variant. A dedup key that was
    /// already used yields `Duplicate` with the existing job's id.
    async fn submit(&self, job: QueueJob, opts: JobOptions) -> anyhow::Result<SubmitOutcome>;

    async fn lease(
        &self,
        queue: QueueName,
        worker_id: &str,
        lease: Duration,
    ) -> anyhow::Result<Option<LeasedJob>>;

    async fn complete(&self, job_id: Uuid) -> anyhow::Result<()>;

    async fn retry_later(
        &self,
        job_id: Uuid,
        delay: Duration,
        error_code: &str,
        error_message: &str,
    ) -> anyhow::Result<()>;

    /// Moves the job to the failed set. It is not redelivered until an
    /// operator retries it.
    async fn fail(
        &self,
        job_id: Uuid,
        reason_code: &str,
        error_code: &str,
        error_message: &str,
    ) -> anyhow::Result<()>;

    /// Returns expired leases to the waiting set.
    async fn reap_expired(&self) -> anyhow::Result<u64>;

    async fn counts(&self, queue: QueueName) -> anyhow::Result<QueueCounts>;

    async fn list_failed(
        &self,
        queue: QueueName,
        automation_id: Option<i64>,
    ) -> anyhow::Result<Vec<FailedJob>>;

    /// Re-submits one failed job with a fresh attempt budget and a bumped
    /// replay number. `false` if the job is unknown or not failed.
    async fn retry_failed(&self, job_id: Uuid) -> anyhow::Result<bool>;

    async fn retry_all_failed(
        &self,
        queue: QueueName,
        automation_id: Option<i64>,
    ) -> anyhow::Result<u64>;

    /// Deletes completed jobs that finished more than `older_than` ago.
    async fn prune_completed(&self, older_than: Duration) -> anyhow::Result<u64>;

    /// Keeps the `keep` most recently failed jobs of `queue` and deletes
    /// the rest.
    async fn trim_failed(&self, queue: QueueName, keep: usize) -> anyhow::Result<u64>;

    async fn ping(&self) -> anyhow::Result<()>;
}
