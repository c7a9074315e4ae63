//! Expands one run into per-recipient send jobs.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::datasource::{DataSource, Recipient, Row};
use crate::files::FileStore;
use crate::jobs::{
    JobError, JobHandler, JobOptions, JobQueue, LeasedJob, QueueJob, QueueName, RetryConfig,
    RunQueueJob, SendQueueJob,
};
use crate::provider::ErrorCategory;
use crate::store::{AutomationConfig, CampaignStore, NewSendRecord, RunStatus, SendStatus};
use crate::template::TemplateEngine;

pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("automation config {0} not found")]
    ConfigNotFound(i64),
    #[error(transparent)]
    Infra(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: i64,
    pub queued: i64,
    pub expansion_failures: i64,
    /// The run was already terminal and nothing was done.
    pub skipped: bool,
}

/// A recipient that could not be turned into a send job.
#[derive(Debug)]
struct ExpansionFailure {
    category: ErrorCategory,
    message: String,
}

impl ExpansionFailure {
    fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

pub struct JobProcessor {
    store: Arc<dyn CampaignStore>,
    queue: Arc<dyn JobQueue>,
    datasource: Arc<dyn DataSource>,
    files: Arc<dyn FileStore>,
    templates: TemplateEngine,
    batch_size: usize,
    send_attempts: i32,
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        queue: Arc<dyn JobQueue>,
        datasource: Arc<dyn DataSource>,
        files: Arc<dyn FileStore>,
    ) -> Self {
        Self {
            store,
            queue,
            datasource,
            files,
            templates: TemplateEngine::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            send_attempts: RetryConfig::for_queue(QueueName::Send).max_attempts,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub async fn process_run(&self, job: &RunQueueJob) -> Result<RunSummary, ProcessError> {
        let run_id = job.run_id;

        let Some(run) = self.store.get_run(run_id).await? else {
            warn!(%run_id, automation_id = job.automation_id, "run not found, dropping job");
            return Ok(RunSummary {
                skipped: true,
                ..RunSummary::default()
            });
        };
        if run.status.is_terminal() {
            info!(%run_id, status = %run.status, "run already finished, skipping");
            return Ok(RunSummary {
                skipped: true,
                ..RunSummary::default()
            });
        }

        let config = self
            .store
            .load_config(job.automation_id)
            .await?
            .ok_or(ProcessError::ConfigNotFound(job.automation_id))?;

        let rows = self.datasource.query(&config.recipient_query, &[]).await?;
        let total = rows.len() as i64;
        info!(%run_id, automation_id = job.automation_id, total, "recipients loaded");

        if let Some(status) = self.store.set_total_target(run_id, total).await? {
            info!(%run_id, %status, "run finished with no recipients");
            return Ok(RunSummary {
                total,
                ..RunSummary::default()
            });
        }

        let mut summary = RunSummary {
            total,
            ..RunSummary::default()
        };

        for (ordinal, row) in rows.into_iter().enumerate() {
            let recipient = Recipient::from_row(row);

            match self.expand(job, &config, &recipient).await {
                Ok(send) => {
                    let opts = JobOptions::new(self.send_attempts).dedup(format!("send:{run_id}:{ordinal}"));
                    self.queue.submit(QueueJob::Send(send), opts).await?;
                    summary.queued += 1;
                }
                Err(failure) => {
                    warn!(
                        %run_id,
                        ordinal,
                        recipient_key = %recipient.key_text(),
                        category = %failure.category,
                        error = %failure.message,
                        "recipient skipped"
                    );
                    self.record_expansion_failure(job, ordinal, &recipient, failure)
                        .await?;
                    summary.expansion_failures += 1;
                }
            }

            let processed = ordinal + 1;
            if processed % self.batch_size == 0 {
                self.store.set_queued_count(run_id, summary.queued).await?;
                info!(%run_id, processed, total, queued = summary.queued, "expansion progress");
            }
        }

        self.store.set_queued_count(run_id, summary.queued).await?;
        info!(
            %run_id,
            total,
            queued = summary.queued,
            failed = summary.expansion_failures,
            "run expanded"
        );
        Ok(summary)
    }

    async fn expand(
        &self,
        job: &RunQueueJob,
        config: &AutomationConfig,
        recipient: &Recipient,
    ) -> Result<SendQueueJob, ExpansionFailure> {
        let Some(email) = recipient.email.clone() else {
            return Err(ExpansionFailure::new(
                ErrorCategory::MissingEmail,
                "recipient row has no email address",
            ));
        };

        let context = self.render_context(config, recipient).await?;

        let subject = self
            .templates
            .render_subject(&config.subject_template, &context)
            .map_err(|e| ExpansionFailure::new(ErrorCategory::TemplateError, format!("subject: {e}")))?;
        let rendered_body = self
            .templates
            .render(&config.body_template, &context)
            .map_err(|e| ExpansionFailure::new(ErrorCategory::TemplateError, format!("body: {e}")))?;

        let attachment_path = self.resolve_attachment(job.run_id, config, recipient, &context).await?;

        Ok(SendQueueJob {
            run_id: job.run_id,
            automation_id: job.automation_id,
            recipient_key: recipient.key.clone(),
            email,
            subject,
            rendered_body,
            sender_email: config.sender_email.clone(),
            sender_name: config.sender_name.clone(),
            reply_to: config.reply_to.clone(),
            headers: config.headers.clone(),
            attachment_path,
            update_query: config.update_query.clone(),
        })
    }

    /// Recipient columns overlaid with the mapping row; mapping wins.
    async fn render_context(
        &self,
        config: &AutomationConfig,
        recipient: &Recipient,
    ) -> Result<Row, ExpansionFailure> {
        let mut context = recipient.row.clone();
        let Some(mapping_query) = config.mapping_query.as_deref().filter(|q| !q.trim().is_empty()) else {
            return Ok(context);
        };

        let rows = self
            .datasource
            .query(mapping_query, std::slice::from_ref(&recipient.key))
            .await
            .map_err(|e| ExpansionFailure::new(ErrorCategory::MappingError, e.to_string()))?;

        if let Some(mapping) = rows.into_iter().next() {
            context.extend(mapping);
        }
        Ok(context)
    }

    async fn resolve_attachment(
        &self,
        run_id: Uuid,
        config: &AutomationConfig,
        recipient: &Recipient,
        context: &Row,
    ) -> Result<Option<String>, ExpansionFailure> {
        let name = match config.attachment_pattern.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(pattern) => self
                .templates
                .render(pattern, context)
                .map_err(|e| ExpansionFailure::new(ErrorCategory::TemplateError, format!("attachment: {e}")))?,
            None => recipient.attachment.clone().unwrap_or_default(),
        };
        let name = name.trim();
        if name.is_empty() {
            return Ok(None);
        }

        match self.files.find(name).await {
            Ok(Some(_)) => Ok(Some(name.to_string())),
            Ok(None) => {
                warn!(%run_id, file = name, "attachment not found, sending without it");
                Ok(None)
            }
            Err(e) => {
                warn!(%run_id, file = name, error = %e, "attachment lookup failed, sending without it");
                Ok(None)
            }
        }
    }

    async fn record_expansion_failure(
        &self,
        job: &RunQueueJob,
        ordinal: usize,
        recipient: &Recipient,
        failure: ExpansionFailure,
    ) -> anyhow::Result<()> {
        let applied = self
            .store
            .record_outcome(NewSendRecord {
                run_id: job.run_id,
                automation_id: job.automation_id,
                idempotency_key: format!("expand:{}:{ordinal}", job.run_id),
                recipient_key: recipient.key_text(),
                recipient: recipient.email.clone().unwrap_or_default(),
                subject: None,
                attachment: None,
                status: SendStatus::Failed,
                error_category: Some(failure.category),
                error_message: Some(failure.message),
                provider_message_id: None,
                recovers_failure: false,
            })
            .await?;

        if let Some(status) = applied.finalized {
            info!(run_id = %job.run_id, %status, "run finished");
        }
        Ok(())
    }
}

/// Run-queue handler: expansion plus the failure bookkeeping around it.
pub struct RunJobHandler {
    processor: Arc<JobProcessor>,
    store: Arc<dyn CampaignStore>,
}

impl RunJobHandler {
    pub fn new(processor: Arc<JobProcessor>, store: Arc<dyn CampaignStore>) -> Self {
        Self { processor, store }
    }
}

#[async_trait]
impl JobHandler for RunJobHandler {
    async fn handle(&self, job: &LeasedJob) -> Result<(), JobError> {
        let QueueJob::Run(run_job) = &job.job else {
            return Err(JobError::fatal("WRONG_QUEUE", "send job on the run queue"));
        };

        match self.processor.process_run(run_job).await {
            Ok(_) => Ok(()),
            Err(ProcessError::ConfigNotFound(id)) => {
                error!(run_id = %run_job.run_id, automation_id = id, "automation config missing");
                self.store
                    .finalize_run(
                        run_job.run_id,
                        RunStatus::Failed,
                        Some(format!("automation config {id} not found")),
                    )
                    .await
                    .map_err(|e| JobError::retryable("STORE_ERROR", e.to_string()))
            }
            Err(ProcessError::Infra(e)) => Err(JobError::retryable("INFRA_ERROR", format!("{e:#}"))),
        }
    }

    async fn on_exhausted(&self, job: &LeasedJob, err: &JobError) {
        let run_id = job.job.run_id();
        let message = format!("run expansion failed after {} attempts: {}", job.attempt, err.message);
        if let Err(e) = self
            .store
            .finalize_run(run_id, RunStatus::Failed, Some(message))
            .await
        {
            error!(%run_id, error = %e, "failed to mark run FAILED");
        }
    }
}

