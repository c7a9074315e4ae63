use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    /// One job per campaign run; expands into send jobs.
    Run,
    /// One job per recipient.
    Send,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Run => "run",
            QueueName::Send => "send",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run" => Ok(QueueName::Run),
            "send" => Ok(QueueName::Send),
            other => anyhow::bail!("unknown queue: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Scheduler,
    Manual,
    Api,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Scheduler => "scheduler",
            TriggerSource::Manual => "manual",
            TriggerSource::Api => "api",
        }
    }
}

impl FromStr for TriggerSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduler" => Ok(TriggerSource::Scheduler),
            "manual" => Ok(TriggerSource::Manual),
            "api" => Ok(TriggerSource::Api),
            other => anyhow::bail!("unknown trigger source: {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunQueueJob {
    pub automation_id: i64,
    pub run_id: Uuid,
    pub triggered_by: TriggerSource,
    pub triggered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendQueueJob {
    pub run_id: Uuid,
    pub automation_id: i64,
    /// Primary key of the recipient row, kept with its original JSON type so
    /// it binds back into the update query unchanged.
    pub recipient_key: Value,
    pub email: String,
    pub subject: String,
    pub rendered_body: String,
    pub sender_email: String,
    pub sender_name: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub attachment_path: Option<String>,
    #[serde(default)]
    pub update_query: Option<String>,
}

impl SendQueueJob {
    pub fn recipient_key_text(&self) -> String {
        crate::datasource::value_text(&self.recipient_key)
    }
}

/// Everything that travels through a queue. Decoded once when a job is
/// leased; handlers never see raw JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum QueueJob {
    Run(RunQueueJob),
    Send(SendQueueJob),
}

impl QueueJob {
    pub fn queue(&self) -> QueueName {
        match self {
            QueueJob::Run(_) => QueueName::Run,
            QueueJob::Send(_) => QueueName::Send,
        }
    }

    pub fn automation_id(&self) -> i64 {
        match self {
            QueueJob::Run(j) => j.automation_id,
            QueueJob::Send(j) => j.automation_id,
        }
    }

    pub fn run_id(&self) -> Uuid {
        match self {
            QueueJob::Run(j) => j.run_id,
            QueueJob::Send(j) => j.run_id,
        }
    }
}

/// Leased before any job with a larger value, whatever their ages.
pub const PRIORITY_HIGH: i32 = 0;
pub const PRIORITY_NORMAL: i32 = 1;

#[derive(Debug, Clone)]
pub struct JobOptions {
    pub dedup_key: Option<String>,
    pub delay: Duration,
    pub max_attempts: i32,
    /// Lower leases first; FIFO within one priority.
    pub priority: i32,
}

impl JobOptions {
    pub fn new(max_attempts: i32) -> Self {
        Self {
            dedup_key: None,
            delay: Duration::ZERO,
            max_attempts,
            priority: PRIORITY_NORMAL,
        }
    }

    pub fn dedup(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Enqueued(Uuid),
    /// A job with the same dedup key already exists; carries its id.
    Duplicate(Uuid),
}

impl SubmitOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            SubmitOutcome::Enqueued(id) | SubmitOutcome::Duplicate(id) => *id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub id: Uuid,
    pub queue: QueueName,
    /// 1-based; incremented on every lease.
    pub attempt: i32,
    pub max_attempts: i32,
    /// Bumped each time an operator re-submits the job from the failed set.
    pub replay: i32,
    pub job: QueueJob,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub delayed: i64,
}

#[derive(Debug, Clone)]
pub struct FailedJob {
    pub id: Uuid,
    pub queue: QueueName,
    pub automation_id: i64,
    pub reason_code: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub replay: i32,
    pub failed_at: Option<DateTime<Utc>>,
    pub job: QueueJob,
}

/// Queue row states as stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}
