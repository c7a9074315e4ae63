use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::jobs::{FailedJob, QueueCounts, QueueJob};
use crate::store::{Run, SendRecord};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub success: bool,
    pub run_id: Uuid,
    pub job_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub scheduler_running: bool,
    pub queue_connected: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatusResponse {
    #[serde(flatten)]
    pub send: QueueCounts,
    pub run_queue: QueueCounts,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedJobItem {
    pub id: Uuid,
    pub automation_id: i64,
    pub run_id: Uuid,
    pub email: Option<String>,
    pub subject: Option<String>,
    pub reason_code: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub replay: i32,
    pub failed_at: Option<DateTime<Utc>>,
}

impl From<FailedJob> for FailedJobItem {
    fn from(f: FailedJob) -> Self {
        let (email, subject) = match &f.job {
            QueueJob::Send(s) => (Some(s.email.clone()), Some(s.subject.clone())),
            QueueJob::Run(_) => (None, None),
        };
        Self {
            id: f.id,
            automation_id: f.automation_id,
            run_id: f.job.run_id(),
            email,
            subject,
            reason_code: f.reason_code,
            error_code: f.error_code,
            error_message: f.error_message,
            attempts: f.attempts,
            replay: f.replay,
            failed_at: f.failed_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedJobsResponse {
    pub count: usize,
    pub jobs: Vec<FailedJobItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationFilter {
    pub automation_id: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResponse {
    pub success: bool,
    pub job_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAllResponse {
    pub success: bool,
    pub retried: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: Run,
    pub records: Vec<SendRecord>,
}

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    pub template: String,
    #[serde(default)]
    pub data: Option<HashMap<String, Value>>,
}

#[derive(Debug, Serialize)]
pub struct PreviewResponse {
    pub rendered: String,
    pub variables: Vec<String>,
}
