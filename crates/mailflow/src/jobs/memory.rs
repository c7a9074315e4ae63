use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::model::{
    FailedJob, JobOptions, JobState, LeasedJob, QueueCounts, QueueJob, QueueName, SubmitOutcome,
};
use super::queue::JobQueue;

#[derive(Debug, Clone)]
struct Entry {
    id: Uuid,
    seq: u64,
    priority: i32,
    dedup_key: Option<String>,
    job: QueueJob,
    state: JobState,
    ready_at: Instant,
    attempts: i32,
    max_attempts: i32,
    replay: i32,
    lease_expires_at: Option<Instant>,
    last_error_code: Option<String>,
    last_error_message: Option<String>,
    failed_reason: Option<String>,
    failed_at: Option<DateTime<Utc>>,
    /// Order of the latest failure, for trimming.
    failed_seq: u64,
    completed_at: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Entry>,
    dedup: HashMap<String, Uuid>,
    seq: u64,
}

/// Process-local queue. Time is read from `tokio::time`, so paused-clock
/// tests see delays and lease expiry advance deterministically.
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn reset_for_replay(entry: &mut Entry) {
        entry.state = JobState::Waiting;
        entry.ready_at = Instant::now();
        entry.attempts = 0;
        entry.replay += 1;
        entry.lease_expires_at = None;
        entry.failed_reason = None;
        entry.failed_at = None;
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn submit(&self, job: QueueJob, opts: JobOptions) -> anyhow::Result<SubmitOutcome> {
        let mut inner = self.inner.lock();

        if let Some(key) = &opts.dedup_key {
            if let Some(existing) = inner.dedup.get(key) {
                return Ok(SubmitOutcome::Duplicate(*existing));
            }
        }

        let id = Uuid::new_v4();
        inner.seq += 1;
        let seq = inner.seq;
        if let Some(key) = &opts.dedup_key {
            inner.dedup.insert(key.clone(), id);
        }
        inner.jobs.insert(
            id,
            Entry {
                id,
                seq,
                priority: opts.priority,
                dedup_key: opts.dedup_key,
                job,
                state: JobState::Waiting,
                ready_at: Instant::now() + opts.delay,
                attempts: 0,
                max_attempts: opts.max_attempts.max(1),
                replay: 0,
                lease_expires_at: None,
                last_error_code: None,
                last_error_message: None,
                failed_reason: None,
                failed_at: None,
                failed_seq: 0,
                completed_at: None,
            },
        );
        Ok(SubmitOutcome::Enqueued(id))
    }

    async fn lease(
        &self,
        queue: QueueName,
        _worker_id: &str,
        lease: Duration,
    ) -> anyhow::Result<Option<LeasedJob>> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let next = inner
            .jobs
            .values()
            .filter(|e| e.job.queue() == queue && e.state == JobState::Waiting && e.ready_at <= now)
            .min_by_key(|e| (e.priority, e.ready_at, e.seq))
            .map(|e| e.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(entry) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };

        entry.state = JobState::Active;
        entry.attempts += 1;
        entry.lease_expires_at = Some(now + lease);

        Ok(Some(LeasedJob {
            id: entry.id,
            queue,
            attempt: entry.attempts,
            max_attempts: entry.max_attempts,
            replay: entry.replay,
            job: entry.job.clone(),
        }))
    }

    async fn complete(&self, job_id: Uuid) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.jobs.get_mut(&job_id) {
            if entry.state == JobState::Active {
                entry.state = JobState::Completed;
                entry.lease_expires_at = None;
                entry.completed_at = Some(Instant::now());
            }
        }
        Ok(())
    }

    async fn retry_later(
        &self,
        job_id: Uuid,
        delay: Duration,
        error_code: &str,
        error_message: &str,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.jobs.get_mut(&job_id) {
            entry.state = JobState::Waiting;
            entry.ready_at = Instant::now() + delay;
            entry.lease_expires_at = None;
            entry.last_error_code = Some(error_code.to_string());
            entry.last_error_message = Some(error_message.to_string());
        }
        Ok(())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        reason_code: &str,
        error_code: &str,
        error_message: &str,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner.seq += 1;
        let failed_seq = inner.seq;
        if let Some(entry) = inner.jobs.get_mut(&job_id) {
            entry.state = JobState::Failed;
            entry.failed_seq = failed_seq;
            entry.lease_expires_at = None;
            entry.failed_reason = Some(reason_code.to_string());
            entry.failed_at = Some(Utc::now());
            entry.last_error_code = Some(error_code.to_string());
            entry.last_error_message = Some(error_message.to_string());
        }
        Ok(())
    }

    async fn reap_expired(&self) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let mut reaped = 0;
        for entry in inner.jobs.values_mut() {
            if entry.state == JobState::Active
                && entry.lease_expires_at.is_some_and(|at| at < now)
            {
                entry.state = JobState::Waiting;
                entry.ready_at = now;
                entry.lease_expires_at = None;
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn counts(&self, queue: QueueName) -> anyhow::Result<QueueCounts> {
        let inner = self.inner.lock();
        let now = Instant::now();
        let mut counts = QueueCounts::default();
        for e in inner.jobs.values().filter(|e| e.job.queue() == queue) {
            match e.state {
                JobState::Waiting if e.ready_at > now => counts.delayed += 1,
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn list_failed(
        &self,
        queue: QueueName,
        automation_id: Option<i64>,
    ) -> anyhow::Result<Vec<FailedJob>> {
        let inner = self.inner.lock();
        let mut out: Vec<(u64, FailedJob)> = inner
            .jobs
            .values()
            .filter(|e| e.job.queue() == queue && e.state == JobState::Failed)
            .filter(|e| automation_id.map_or(true, |a| e.job.automation_id() == a))
            .map(|e| {
                (
                    e.seq,
                    FailedJob {
                        id: e.id,
                        queue,
                        automation_id: e.job.automation_id(),
                        reason_code: e.failed_reason.clone(),
                        error_code: e.last_error_code.clone(),
                        error_message: e.last_error_message.clone(),
                        attempts: e.attempts,
                        replay: e.replay,
                        failed_at: e.failed_at,
                        job: e.job.clone(),
                    },
                )
            })
            .collect();
        out.sort_by_key(|(seq, _)| *seq);
        Ok(out.into_iter().map(|(_, f)| f).collect())
    }

    async fn retry_failed(&self, job_id: Uuid) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock();
        match inner.jobs.get_mut(&job_id) {
            Some(entry) if entry.state == JobState::Failed => {
                Self::reset_for_replay(entry);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn retry_all_failed(
        &self,
        queue: QueueName,
        automation_id: Option<i64>,
    ) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock();
        let mut n = 0;
        for entry in inner.jobs.values_mut() {
            if entry.job.queue() == queue
                && entry.state == JobState::Failed
                && automation_id.map_or(true, |a| entry.job.automation_id() == a)
            {
                Self::reset_for_replay(entry);
                n += 1;
            }
        }
        Ok(n)
    }

    async fn prune_completed(&self, older_than: Duration) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let doomed: Vec<(Uuid, Option<String>)> = inner
            .jobs
            .values()
            .filter(|e| {
                e.state == JobState::Completed
                    && e.completed_at.is_some_and(|at| now.duration_since(at) >= older_than)
            })
            .map(|e| (e.id, e.dedup_key.clone()))
            .collect();

        for (id, key) in &doomed {
            inner.jobs.remove(id);
            if let Some(key) = key {
                inner.dedup.remove(key);
            }
        }
        Ok(doomed.len() as u64)
    }

    async fn trim_failed(&self, queue: QueueName, keep: usize) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock();
        let mut failed: Vec<(u64, Uuid, Option<String>)> = inner
            .jobs
            .values()
            .filter(|e| e.job.queue() == queue && e.state == JobState::Failed)
            .map(|e| (e.failed_seq, e.id, e.dedup_key.clone()))
            .collect();
        if failed.len() <= keep {
            return Ok(0);
        }

        // Newest first; everything past `keep` goes.
        failed.sort_by(|a, b| b.0.cmp(&a.0));
        let doomed = failed.split_off(keep);
        for (_, id, key) in &doomed {
            inner.jobs.remove(id);
            if let Some(key) = key {
                inner.dedup.remove(key);
            }
        }
        Ok(doomed.len() as u64)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
