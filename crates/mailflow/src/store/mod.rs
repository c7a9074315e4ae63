//! Automations, schedules, runs and the per-recipient audit trail.

pub mod memory;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::jobs::TriggerSource;
use crate::provider::ErrorCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AutomationStatus {
    Active,
    Inactive,
    Running,
}

impl AutomationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutomationStatus::Active => "ACTIVE",
            AutomationStatus::Inactive => "INACTIVE",
            AutomationStatus::Running => "RUNNING",
        }
    }
}

impl FromStr for AutomationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(AutomationStatus::Active),
            "INACTIVE" => Ok(AutomationStatus::Inactive),
            "RUNNING" => Ok(AutomationStatus::Running),
            other => anyhow::bail!("unknown automation status: {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Automation {
    pub id: i64,
    pub organization_id: i64,
    pub name: String,
    pub status: AutomationStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// What a run needs to expand an automation into messages.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AutomationConfig {
    pub automation_id: i64,
    pub recipient_query: String,
    pub mapping_query: Option<String>,
    pub update_query: Option<String>,
    pub body_template: String,
    pub subject_template: String,
    pub attachment_pattern: Option<String>,
    pub sender_email: String,
    pub sender_name: String,
    pub reply_to: Option<String>,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleKind {
    Realtime,
    Daily,
    Weekly,
    Monthly,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::Realtime => "REALTIME",
            ScheduleKind::Daily => "DAILY",
            ScheduleKind::Weekly => "WEEKLY",
            ScheduleKind::Monthly => "MONTHLY",
        }
    }
}

impl FromStr for ScheduleKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REALTIME" => Ok(ScheduleKind::Realtime),
            "DAILY" => Ok(ScheduleKind::Daily),
            "WEEKLY" => Ok(ScheduleKind::Weekly),
            "MONTHLY" => Ok(ScheduleKind::Monthly),
            other => anyhow::bail!("unknown schedule kind: {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub automation_id: i64,
    pub kind: ScheduleKind,
    pub hour: u32,
    pub minute: u32,
    /// Weekday (0 = Sunday) for WEEKLY, day of month for MONTHLY.
    pub day: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("hour {0} out of range 0-23")]
    Hour(u32),
    #[error("minute {0} out of range 0-59")]
    Minute(u32),
    #[error("{kind} schedule requires a day")]
    MissingDay { kind: &'static str },
    #[error("day {day} out of range for {kind} schedule")]
    Day { kind: &'static str, day: u32 },
}

impl Schedule {
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.hour > 23 {
            return Err(ScheduleError::Hour(self.hour));
        }
        if self.minute > 59 {
            return Err(ScheduleError::Minute(self.minute));
        }
        let range = match self.kind {
            ScheduleKind::Realtime | ScheduleKind::Daily => return Ok(()),
            ScheduleKind::Weekly => 0..=6,
            ScheduleKind::Monthly => 1..=31,
        };
        let kind = self.kind.as_str();
        match self.day {
            None => Err(ScheduleError::MissingDay { kind }),
            Some(day) if !range.contains(&day) => Err(ScheduleError::Day { kind, day }),
            Some(_) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Partial => "PARTIAL",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    /// Terminal status for a fully accounted run.
    pub fn derive(total: i64, success: i64, fail: i64) -> RunStatus {
        if fail == 0 {
            RunStatus::Success
        } else if success == 0 && total > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(RunStatus::Running),
            "SUCCESS" => Ok(RunStatus::Success),
            "PARTIAL" => Ok(RunStatus::Partial),
            "FAILED" => Ok(RunStatus::Failed),
            other => anyhow::bail!("unknown run status: {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: Uuid,
    pub automation_id: i64,
    pub triggered_by: TriggerSource,
    pub dedup_key: Option<String>,
    pub status: RunStatus,
    pub total_target: i64,
    pub queued_count: i64,
    pub success_count: i64,
    pub fail_count: i64,
    /// Terminal failures seen per category. Not decremented when an
    /// operator retry later succeeds.
    pub error_counts: BTreeMap<String, i64>,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(automation_id: i64, triggered_by: TriggerSource, dedup_key: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            automation_id,
            triggered_by,
            dedup_key,
            status: RunStatus::Running,
            total_target: 0,
            queued_count: 0,
            success_count: 0,
            fail_count: 0,
            error_counts: BTreeMap::new(),
            message: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Applies one terminal recipient outcome to the counters and finalizes
    /// the run if every recipient is now accounted for. Returns the new
    /// status when this call changed it.
    pub fn apply_outcome(&mut self, outcome: &NewSendRecord) -> Option<RunStatus> {
        match (outcome.status, outcome.recovers_failure) {
            (SendStatus::Success, true) => {
                self.success_count += 1;
                self.fail_count = (self.fail_count - 1).max(0);
            }
            (SendStatus::Success, false) => self.success_count += 1,
            // A replayed failure was already counted.
            (SendStatus::Failed, true) => {}
            (SendStatus::Failed, false) => self.fail_count += 1,
        }
        if outcome.status == SendStatus::Failed {
            if let Some(cat) = outcome.error_category {
                *self.error_counts.entry(cat.as_str().to_string()).or_insert(0) += 1;
            }
        }

        let accounted = self.success_count + self.fail_count;
        if self.total_target > 0 && accounted >= self.total_target {
            let next = RunStatus::derive(self.total_target, self.success_count, self.fail_count);
            if next != self.status {
                self.status = next;
                self.ended_at.get_or_insert_with(Utc::now);
                return Some(next);
            }
        }
        None
    }
}

pub enum CreateRun {
    Created(Run),
    /// A run with the same dedup key exists already.
    Existing(Run),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SendStatus {
    Success,
    Failed,
}

impl SendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendStatus::Success => "SUCCESS",
            SendStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for SendStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(SendStatus::Success),
            "FAILED" => Ok(SendStatus::Failed),
            other => anyhow::bail!("unknown send status: {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSendRecord {
    pub run_id: Uuid,
    pub automation_id: i64,
    /// Unique per logical attempt; a second insert with the same key is a
    /// no-op and leaves the counters alone.
    pub idempotency_key: String,
    pub recipient_key: String,
    pub recipient: String,
    pub subject: Option<String>,
    pub attachment: Option<String>,
    pub status: SendStatus,
    pub error_category: Option<ErrorCategory>,
    pub error_message: Option<String>,
    pub provider_message_id: Option<String>,
    /// Set for outcomes of operator-replayed jobs whose failure was already
    /// counted.
    pub recovers_failure: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRecord {
    pub id: i64,
    pub run_id: Uuid,
    pub automation_id: i64,
    pub idempotency_key: String,
    pub recipient_key: String,
    pub recipient: String,
    pub subject: Option<String>,
    pub attachment: Option<String>,
    pub status: SendStatus,
    pub error_category: Option<ErrorCategory>,
    pub error_message: Option<String>,
    pub provider_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutcomeApplied {
    /// False when the idempotency key had been used before.
    pub recorded: bool,
    /// The status the run moved to, if this outcome finalized it.
    pub finalized: Option<RunStatus>,
}

#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// Schedules of every ACTIVE automation.
    async fn active_schedules(&self) -> anyhow::Result<Vec<Schedule>>;

    async fn get_automation(&self, id: i64) -> anyhow::Result<Option<Automation>>;

    async fn load_config(&self, automation_id: i64) -> anyhow::Result<Option<AutomationConfig>>;

    /// Stamps run times and moves an ACTIVE automation to RUNNING.
    async fn mark_automation_started(
        &self,
        id: i64,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()>;

    /// Moves a RUNNING automation back to ACTIVE.
    async fn mark_automation_idle(&self, id: i64) -> anyhow::Result<()>;

    /// Inserts `run` unless a run with the same dedup key exists.
    async fn create_run(&self, run: Run) -> anyhow::Result<CreateRun>;

    async fn get_run(&self, id: Uuid) -> anyhow::Result<Option<Run>>;

    /// Sets the recipient count. Finalizes as SUCCESS when it is zero, or
    /// when outcomes already recorded account for every recipient.
    async fn set_total_target(&self, run_id: Uuid, total: i64) -> anyhow::Result<Option<RunStatus>>;

    async fn set_queued_count(&self, run_id: Uuid, queued: i64) -> anyhow::Result<()>;

    /// Appends a send record and applies it to the run counters in one
    /// atomic step.
    async fn record_outcome(&self, record: NewSendRecord) -> anyhow::Result<OutcomeApplied>;

    /// Forces a terminal status regardless of counters.
    async fn finalize_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        message: Option<String>,
    ) -> anyhow::Result<()>;

    async fn list_send_records(&self, run_id: Uuid) -> anyhow::Result<Vec<SendRecord>>;
}
