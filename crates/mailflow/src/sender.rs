//! Delivers one send job through the provider.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::datasource::DataSource;
use crate::files::FileStore;
use crate::jobs::{JobError, JobHandler, LeasedJob, QueueJob, SendQueueJob};
use crate::limiter::SendGate;
use crate::provider::{Attachment, EmailProvider, ErrorCategory, OutboundEmail, ProviderError};
use crate::store::{CampaignStore, NewSendRecord, SendStatus};

pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum SendOutcome {
    Delivered { message_id: String },
    /// Transient failure with attempts left; nothing recorded yet.
    RetryLater(ProviderError),
    /// Terminal failure, already recorded against the run.
    Failed(ProviderError),
}

pub struct SendWorker {
    store: Arc<dyn CampaignStore>,
    provider: Arc<dyn EmailProvider>,
    files: Arc<dyn FileStore>,
    datasource: Arc<dyn DataSource>,
    gate: Arc<dyn SendGate>,
    timeout: Duration,
}

impl SendWorker {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        provider: Arc<dyn EmailProvider>,
        files: Arc<dyn FileStore>,
        datasource: Arc<dyn DataSource>,
        gate: Arc<dyn SendGate>,
    ) -> Self {
        Self {
            store,
            provider,
            files,
            datasource,
            gate,
            timeout: DEFAULT_PROVIDER_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// One delivery attempt. `replay` is the operator-retry generation of
    /// the job and keys the audit record.
    pub async fn send_one(
        &self,
        job_id: Uuid,
        replay: i32,
        job: &SendQueueJob,
        attempt: i32,
        max_attempts: i32,
    ) -> SendOutcome {
        let attachment = self.load_attachment(job).await;
        let attachment_name = attachment.as_ref().map(|a| a.file_name.clone());

        let result = match self.gate.acquire().await {
            Ok(permit) => {
                let result = self.deliver(job, attachment).await;
                if let Err(e) = self.gate.release(permit).await {
                    warn!(run_id = %job.run_id, error = %e, "send gate release failed");
                }
                result
            }
            Err(e) => Err(ProviderError::new(
                ErrorCategory::NetworkError,
                format!("send gate unavailable: {e}"),
            )),
        };

        let record = |status: SendStatus| NewSendRecord {
            run_id: job.run_id,
            automation_id: job.automation_id,
            idempotency_key: format!("job:{job_id}:{replay}"),
            recipient_key: job.recipient_key_text(),
            recipient: job.email.clone(),
            subject: Some(job.subject.clone()),
            attachment: attachment_name.clone(),
            status,
            error_category: None,
            error_message: None,
            provider_message_id: None,
            recovers_failure: replay > 0,
        };

        match result {
            Ok(message_id) => {
                info!(
                    run_id = %job.run_id,
                    to = %job.email,
                    %message_id,
                    attempt,
                    "email sent"
                );
                self.apply(NewSendRecord {
                    provider_message_id: Some(message_id.clone()),
                    ..record(SendStatus::Success)
                })
                .await;
                self.run_update_query(job).await;
                SendOutcome::Delivered { message_id }
            }
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                warn!(
                    run_id = %job.run_id,
                    to = %job.email,
                    category = %err.category,
                    attempt,
                    max_attempts,
                    error = %err.message,
                    "send failed, will retry"
                );
                SendOutcome::RetryLater(err)
            }
            Err(err) => {
                warn!(
                    run_id = %job.run_id,
                    to = %job.email,
                    category = %err.category,
                    attempt,
                    error = %err.message,
                    "send failed"
                );
                self.apply(NewSendRecord {
                    error_category: Some(err.category),
                    error_message: Some(err.message.clone()),
                    ..record(SendStatus::Failed)
                })
                .await;
                SendOutcome::Failed(err)
            }
        }
    }

    async fn deliver(
        &self,
        job: &SendQueueJob,
        attachment: Option<Attachment>,
    ) -> Result<String, ProviderError> {
        let email = OutboundEmail {
            to: job.email.clone(),
            from_email: job.sender_email.clone(),
            from_name: job.sender_name.clone(),
            reply_to: job.reply_to.clone(),
            subject: job.subject.clone(),
            html_body: job.rendered_body.clone(),
            headers: job.headers.clone(),
            attachment,
        };

        match tokio::time::timeout(self.timeout, self.provider.send(&email)).await {
            Ok(result) => result.map(|receipt| receipt.message_id),
            Err(_) => Err(ProviderError::new(
                ErrorCategory::NetworkError,
                format!("provider call timed out after {}s", self.timeout.as_secs()),
            )),
        }
    }

    async fn load_attachment(&self, job: &SendQueueJob) -> Option<Attachment> {
        let name = job.attachment_path.as_deref()?;
        match self.files.find(name).await {
            Ok(Some(file)) => Some(Attachment {
                file_name: file.name,
                content_type: file.content_type,
                bytes: file.bytes,
            }),
            Ok(None) => {
                warn!(run_id = %job.run_id, file = name, "attachment disappeared, sending without it");
                None
            }
            Err(e) => {
                warn!(run_id = %job.run_id, file = name, error = %e, "attachment unreadable, sending without it");
                None
            }
        }
    }

    /// Store failures are logged, never turned into a resend.
    async fn apply(&self, record: NewSendRecord) {
        let run_id = record.run_id;
        match self.store.record_outcome(record).await {
            Ok(applied) => {
                if let Some(status) = applied.finalized {
                    info!(%run_id, %status, "run finished");
                }
            }
            Err(e) => error!(%run_id, error = %e, "failed to record send outcome"),
        }
    }

    async fn run_update_query(&self, job: &SendQueueJob) {
        let Some(sql) = job.update_query.as_deref().filter(|q| !q.trim().is_empty()) else {
            return;
        };
        if let Err(e) = self
            .datasource
            .execute(sql, std::slice::from_ref(&job.recipient_key))
            .await
        {
            warn!(
                run_id = %job.run_id,
                recipient_key = %job.recipient_key_text(),
                error = %e,
                "update query failed"
            );
        }
    }
}

pub struct SendJobHandler {
    worker: Arc<SendWorker>,
}

impl SendJobHandler {
    pub fn new(worker: Arc<SendWorker>) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl JobHandler for SendJobHandler {
    async fn handle(&self, job: &LeasedJob) -> Result<(), JobError> {
        let QueueJob::Send(send) = &job.job else {
            return Err(JobError::fatal("WRONG_QUEUE", "run job on the send queue"));
        };

        match self
            .worker
            .send_one(job.id, job.replay, send, job.attempt, job.max_attempts)
            .await
        {
            SendOutcome::Delivered { .. } => Ok(()),
            SendOutcome::RetryLater(e) => Err(JobError::retryable(e.category.as_str(), e.message)),
            // Keeps the retryable flag so exhausted retries read as such.
            SendOutcome::Failed(e) => Err(JobError {
                code: e.category.as_str().to_string(),
                retryable: e.is_retryable(),
                message: e.message,
            }),
        }
    }
}
