use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use super::model::{
    FailedJob, JobOptions, JobState, LeasedJob, QueueCounts, QueueJob, QueueName, SubmitOutcome,
};
use super::queue::JobQueue;

#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct LeasedRow {
    id: Uuid,
    attempts: i32,
    max_attempts: i32,
    replay_count: i32,
    payload_json: Value,
}

#[derive(sqlx::FromRow)]
struct FailedRow {
    id: Uuid,
    automation_id: i64,
    failed_reason_code: Option<String>,
    last_error_code: Option<String>,
    last_error_message: Option<String>,
    attempts: i32,
    replay_count: i32,
    failed_at: Option<DateTime<Utc>>,
    payload_json: Value,
}

fn millis(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

#[async_trait]
impl JobQueue for PgQueue {
    async fn submit(&self, job: QueueJob, opts: JobOptions) -> anyhow::Result<SubmitOutcome> {
        let id = Uuid::new_v4();
        let payload = serde_json::to_value(&job)?;

        // ON CONFLICT keeps the first row; the existing id is read back below.
        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO queue_jobs (
                id, queue, dedup_key, automation_id, run_id, payload_json,
                status, run_at, max_attempts, priority
            )
            VALUES (
                $1, $2, $3, $4, $5, $6,
                'waiting', now() + ($7::bigint * interval '1 millisecond'), $8, $9
            )
            ON CONFLICT (dedup_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(job.queue().as_str())
        .bind(opts.dedup_key.as_deref())
        .bind(job.automation_id())
        .bind(job.run_id())
        .bind(payload)
        .bind(millis(opts.delay))
        .bind(opts.max_attempts.max(1))
        .bind(opts.priority)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = inserted {
            return Ok(SubmitOutcome::Enqueued(id));
        }

        let existing: Uuid = sqlx::query_scalar("SELECT id FROM queue_jobs WHERE dedup_key = $1")
            .bind(opts.dedup_key.as_deref())
            .fetch_one(&self.pool)
            .await?;
        Ok(SubmitOutcome::Duplicate(existing))
    }

    /// Lease exactly one runnable job: SELECT ... FOR UPDATE SKIP LOCKED, so
    /// no two workers ever claim the same row.
    async fn lease(
        &self,
        queue: QueueName,
        worker_id: &str,
        lease: Duration,
    ) -> anyhow::Result<Option<LeasedJob>> {
        loop {
            let mut tx = self.pool.begin().await?;

            let candidate: Option<Uuid> = sqlx::query_scalar(
                r#"
                SELECT id
                FROM queue_jobs
                WHERE queue = $1
                  AND status = 'waiting'
                  AND run_at <= now()
                ORDER BY priority ASC, run_at ASC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
                "#,
            )
            .bind(queue.as_str())
            .fetch_optional(&mut *tx)
            .await?;

            let Some(job_id) = candidate else {
                tx.commit().await?;
                return Ok(None);
            };

            let row = sqlx::query_as::<_, LeasedRow>(
                r#"
                UPDATE queue_jobs
                SET status = 'active',
                    attempts = attempts + 1,
                    locked_by = $2,
                    locked_at = now(),
                    lock_expires_at = now() + ($3::bigint * interval '1 millisecond'),
                    updated_at = now()
                WHERE id = $1
                RETURNING id, attempts, max_attempts, replay_count, payload_json
                "#,
            )
            .bind(job_id)
            .bind(worker_id)
            .bind(millis(lease))
            .fetch_one(&mut *tx)
            .await?;

            match serde_json::from_value::<QueueJob>(row.payload_json) {
                Ok(job) => {
                    tx.commit().await?;
                    return Ok(Some(LeasedJob {
                        id: row.id,
                        queue,
                        attempt: row.attempts,
                        max_attempts: row.max_attempts,
                        replay: row.replay_count,
                        job,
                    }));
                }
                Err(e) => {
                    // Undecodable payloads can never succeed; park them.
                    warn!(job_id = %row.id, error = %e, "bad payload, moving to failed");
                    sqlx::query(
                        r#"
                        UPDATE queue_jobs
                        SET status = 'failed',
                            failed_reason_code = 'BAD_PAYLOAD',
                            failed_at = now(),
                            last_error_code = 'BAD_PAYLOAD',
                            last_error_message = $2,
                            locked_by = NULL, locked_at = NULL, lock_expires_at = NULL,
                            updated_at = now()
                        WHERE id = $1
                        "#,
                    )
                    .bind(row.id)
                    .bind(e.to_string())
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;
                }
            }
        }
    }

    async fn complete(&self, job_id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'completed',
                completed_at = now(),
                locked_at = NULL,
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            WHERE id = $1
              AND status = 'active'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn retry_later(
        &self,
        job_id: Uuid,
        delay: Duration,
        error_code: &str,
        error_message: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'waiting',
                run_at = now() + ($2::bigint * interval '1 millisecond'),
                locked_at = NULL,
                locked_by = NULL,
                lock_expires_at = NULL,
                last_error_code = $3,
                last_error_message = $4,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(millis(delay))
        .bind(error_code)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        reason_code: &str,
        error_code: &str,
        error_message: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'failed',
                failed_reason_code = $2,
                failed_at = now(),
                locked_at = NULL,
                locked_by = NULL,
                lock_expires_at = NULL,
                last_error_code = $3,
                last_error_message = $4,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(reason_code)
        .bind(error_code)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reap_expired(&self) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'waiting',
                run_at = now(),
                locked_at = NULL,
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            WHERE status = 'active'
              AND lock_expires_at IS NOT NULL
              AND lock_expires_at < now()
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn counts(&self, queue: QueueName) -> anyhow::Result<QueueCounts> {
        let (waiting, active, completed, failed, delayed): (i64, i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                  COUNT(*) FILTER (WHERE status = 'waiting' AND run_at <= now()),
                  COUNT(*) FILTER (WHERE status = 'active'),
                  COUNT(*) FILTER (WHERE status = 'completed'),
                  COUNT(*) FILTER (WHERE status = 'failed'),
                  COUNT(*) FILTER (WHERE status = 'waiting' AND run_at > now())
                FROM queue_jobs
                WHERE queue = $1
                "#,
            )
            .bind(queue.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(QueueCounts {
            waiting,
            active,
            completed,
            failed,
            delayed,
        })
    }

    async fn list_failed(
        &self,
        queue: QueueName,
        automation_id: Option<i64>,
    ) -> anyhow::Result<Vec<FailedJob>> {
        let rows = sqlx::query_as::<_, FailedRow>(
            r#"
            SELECT id, automation_id, failed_reason_code, last_error_code,
                   last_error_message, attempts, replay_count, failed_at, payload_json
            FROM queue_jobs
            WHERE queue = $1
              AND status = 'failed'
              AND ($2::bigint IS NULL OR automation_id = $2)
            ORDER BY failed_at DESC NULLS LAST, created_at DESC
            LIMIT 1000
            "#,
        )
        .bind(queue.as_str())
        .bind(automation_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            let job = match serde_json::from_value::<QueueJob>(r.payload_json) {
                Ok(job) => job,
                Err(e) => {
                    warn!(job_id = %r.id, error = %e, "skipping undecodable failed job");
                    continue;
                }
            };
            out.push(FailedJob {
                id: r.id,
                queue,
                automation_id: r.automation_id,
                reason_code: r.failed_reason_code,
                error_code: r.last_error_code,
                error_message: r.last_error_message,
                attempts: r.attempts,
                replay: r.replay_count,
                failed_at: r.failed_at,
                job,
            });
        }
        Ok(out)
    }

    async fn retry_failed(&self, job_id: Uuid) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'waiting',
                run_at = now(),
                attempts = 0,
                replay_count = replay_count + 1,
                failed_reason_code = NULL,
                failed_at = NULL,
                updated_at = now()
            WHERE id = $1
              AND status = 'failed'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn retry_all_failed(
        &self,
        queue: QueueName,
        automation_id: Option<i64>,
    ) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'waiting',
                run_at = now(),
                attempts = 0,
                replay_count = replay_count + 1,
                failed_reason_code = NULL,
                failed_at = NULL,
                updated_at = now()
            WHERE queue = $1
              AND status = 'failed'
              AND ($2::bigint IS NULL OR automation_id = $2)
            "#,
        )
        .bind(queue.as_str())
        .bind(automation_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn prune_completed(&self, older_than: Duration) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            DELETE FROM queue_jobs
            WHERE id IN (
                SELECT id FROM queue_jobs
                WHERE status = $1
                  AND completed_at < now() - ($2::bigint * interval '1 millisecond')
                ORDER BY completed_at ASC
                LIMIT 5000
            )
            "#,
        )
        .bind(JobState::Completed.as_str())
        .bind(millis(older_than))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn trim_failed(&self, queue: QueueName, keep: usize) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            DELETE FROM queue_jobs
            WHERE id IN (
                SELECT id FROM queue_jobs
                WHERE queue = $1
                  AND status = $2
                ORDER BY failed_at DESC NULLS LAST, created_at DESC
                OFFSET $3
            )
            "#,
        )
        .bind(queue.as_str())
        .bind(JobState::Failed.as_str())
        .bind(i64::try_from(keep).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
