use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::{
    Automation, AutomationConfig, CampaignStore, CreateRun, NewSendRecord, OutcomeApplied, Run,
    RunStatus, Schedule, SendRecord,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct AutomationRow {
    id: i64,
    organization_id: i64,
    name: String,
    status: String,
    last_run_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
}

impl TryFrom<AutomationRow> for Automation {
    type Error = anyhow::Error;

    fn try_from(r: AutomationRow) -> Result<Self, Self::Error> {
        Ok(Automation {
            id: r.id,
            organization_id: r.organization_id,
            name: r.name,
            status: r.status.parse()?,
            last_run_at: r.last_run_at,
            next_run_at: r.next_run_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ConfigRow {
    id: i64,
    recipient_query: String,
    mapping_query: Option<String>,
    update_query: Option<String>,
    body_template: String,
    subject_template: String,
    attachment_pattern: Option<String>,
    sender_email: String,
    sender_name: String,
    reply_to: Option<String>,
    headers: Json<BTreeMap<String, String>>,
}

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    automation_id: i64,
    kind: String,
    hour: i32,
    minute: i32,
    day: Option<i32>,
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    automation_id: i64,
    triggered_by: String,
    dedup_key: Option<String>,
    status: String,
    total_target: i64,
    queued_count: i64,
    success_count: i64,
    fail_count: i64,
    error_counts: Json<BTreeMap<String, i64>>,
    message: Option<String>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl TryFrom<RunRow> for Run {
    type Error = anyhow::Error;

    fn try_from(r: RunRow) -> Result<Self, Self::Error> {
        Ok(Run {
            id: r.id,
            automation_id: r.automation_id,
            triggered_by: r.triggered_by.parse()?,
            dedup_key: r.dedup_key,
            status: r.status.parse()?,
            total_target: r.total_target,
            queued_count: r.queued_count,
            success_count: r.success_count,
            fail_count: r.fail_count,
            error_counts: r.error_counts.0,
            message: r.message,
            started_at: r.started_at,
            ended_at: r.ended_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SendRecordRow {
    id: i64,
    run_id: Uuid,
    automation_id: i64,
    idempotency_key: String,
    recipient_key: String,
    recipient: String,
    subject: Option<String>,
    attachment: Option<String>,
    status: String,
    error_category: Option<String>,
    error_message: Option<String>,
    provider_message_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<SendRecordRow> for SendRecord {
    type Error = anyhow::Error;

    fn try_from(r: SendRecordRow) -> Result<Self, Self::Error> {
        Ok(SendRecord {
            id: r.id,
            run_id: r.run_id,
            automation_id: r.automation_id,
            idempotency_key: r.idempotency_key,
            recipient_key: r.recipient_key,
            recipient: r.recipient,
            subject: r.subject,
            attachment: r.attachment,
            status: r.status.parse()?,
            error_category: r.error_category.map(|c| c.parse()).transpose()?,
            error_message: r.error_message,
            provider_message_id: r.provider_message_id,
            created_at: r.created_at,
        })
    }
}

const RUN_COLUMNS: &str = r#"
    id, automation_id, triggered_by, dedup_key, status,
    total_target, queued_count, success_count, fail_count,
    error_counts, message, started_at, ended_at
"#;

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts an automation with its configuration and optional schedule.
    pub async fn create_automation(
        &self,
        organization_id: i64,
        name: &str,
        config: &AutomationConfig,
        schedule: Option<&Schedule>,
    ) -> anyhow::Result<i64> {
        let mut tx = self.pool.begin().await?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO automations (
                organization_id, name, status,
                recipient_query, mapping_query, update_query,
                body_template, subject_template, attachment_pattern,
                sender_email, sender_name, reply_to, headers
            )
            VALUES ($1, $2, 'ACTIVE', $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id
            "#,
        )
        .bind(organization_id)
        .bind(name)
        .bind(&config.recipient_query)
        .bind(config.mapping_query.as_deref())
        .bind(config.update_query.as_deref())
        .bind(&config.body_template)
        .bind(&config.subject_template)
        .bind(config.attachment_pattern.as_deref())
        .bind(&config.sender_email)
        .bind(&config.sender_name)
        .bind(config.reply_to.as_deref())
        .bind(Json(&config.headers))
        .fetch_one(&mut *tx)
        .await?;

        if let Some(s) = schedule {
            sqlx::query(
                r#"
                INSERT INTO schedules (automation_id, kind, hour, minute, day)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(id)
            .bind(s.kind.as_str())
            .bind(s.hour as i32)
            .bind(s.minute as i32)
            .bind(s.day.map(|d| d as i32))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(id)
    }

    async fn fetch_run_for_update(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        run_id: Uuid,
    ) -> anyhow::Result<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE id = $1 FOR UPDATE"
        ))
        .bind(run_id)
        .fetch_optional(&mut **tx)
        .await?;
        row.map(Run::try_from).transpose()
    }

    async fn write_counters(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        run: &Run,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE runs
            SET total_target = $2,
                success_count = $3,
                fail_count = $4,
                error_counts = $5,
                status = $6,
                ended_at = $7
            WHERE id = $1
            "#,
        )
        .bind(run.id)
        .bind(run.total_target)
        .bind(run.success_count)
        .bind(run.fail_count)
        .bind(Json(&run.error_counts))
        .bind(run.status.as_str())
        .bind(run.ended_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn release_automation(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        automation_id: i64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE automations
            SET status = 'ACTIVE', updated_at = now()
            WHERE id = $1 AND status = 'RUNNING'
            "#,
        )
        .bind(automation_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CampaignStore for PgStore {
    async fn active_schedules(&self) -> anyhow::Result<Vec<Schedule>> {
        let rows = sqlx::query_as::<_, ScheduleRow>(
            r#"
            SELECT s.automation_id, s.kind, s.hour, s.minute, s.day
            FROM schedules s
            JOIN automations a ON a.id = s.automation_id
            WHERE a.status = 'ACTIVE'
            ORDER BY s.automation_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(Schedule {
                    automation_id: r.automation_id,
                    kind: r.kind.parse()?,
                    // Negative values fail validation later, per automation.
                    hour: u32::try_from(r.hour).unwrap_or(u32::MAX),
                    minute: u32::try_from(r.minute).unwrap_or(u32::MAX),
                    day: r.day.map(|d| u32::try_from(d).unwrap_or(u32::MAX)),
                })
            })
            .collect()
    }

    async fn get_automation(&self, id: i64) -> anyhow::Result<Option<Automation>> {
        let row = sqlx::query_as::<_, AutomationRow>(
            r#"
            SELECT id, organization_id, name, status, last_run_at, next_run_at
            FROM automations
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Automation::try_from).transpose()
    }

    async fn load_config(&self, automation_id: i64) -> anyhow::Result<Option<AutomationConfig>> {
        let row = sqlx::query_as::<_, ConfigRow>(
            r#"
            SELECT id, recipient_query, mapping_query, update_query,
                   body_template, subject_template, attachment_pattern,
                   sender_email, sender_name, reply_to, headers
            FROM automations
            WHERE id = $1
            "#,
        )
        .bind(automation_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| AutomationConfig {
            automation_id: r.id,
            recipient_query: r.recipient_query,
            mapping_query: r.mapping_query,
            update_query: r.update_query,
            body_template: r.body_template,
            subject_template: r.subject_template,
            attachment_pattern: r.attachment_pattern,
            sender_email: r.sender_email,
            sender_name: r.sender_name,
            reply_to: r.reply_to,
            headers: r.headers.0,
        }))
    }

    async fn mark_automation_started(
        &self,
        id: i64,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE automations
            SET last_run_at = $2,
                next_run_at = $3,
                status = CASE WHEN status = 'ACTIVE' THEN 'RUNNING' ELSE status END,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(last_run_at)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_automation_idle(&self, id: i64) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::release_automation(&mut tx, id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn create_run(&self, run: Run) -> anyhow::Result<CreateRun> {
        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO runs (
                id, automation_id, triggered_by, dedup_key, status,
                total_target, queued_count, success_count, fail_count,
                error_counts, message, started_at
            )
            VALUES ($1, $2, $3, $4, $5, 0, 0, 0, 0, '{}'::jsonb, NULL, $6)
            ON CONFLICT (dedup_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(run.id)
        .bind(run.automation_id)
        .bind(run.triggered_by.as_str())
        .bind(run.dedup_key.as_deref())
        .bind(run.status.as_str())
        .bind(run.started_at)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            return Ok(CreateRun::Created(run));
        }

        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE dedup_key = $1"
        ))
        .bind(run.dedup_key.as_deref())
        .fetch_one(&self.pool)
        .await?;
        Ok(CreateRun::Existing(row.try_into()?))
    }

    async fn get_run(&self, id: Uuid) -> anyhow::Result<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Run::try_from).transpose()
    }

    async fn set_total_target(&self, run_id: Uuid, total: i64) -> anyhow::Result<Option<RunStatus>> {
        let mut tx = self.pool.begin().await?;
        let Some(mut run) = Self::fetch_run_for_update(&mut tx, run_id).await? else {
            anyhow::bail!("run {run_id} not found");
        };

        run.total_target = total.max(0);
        let mut finalized = None;
        if !run.status.is_terminal() && run.success_count + run.fail_count >= run.total_target {
            let status = RunStatus::derive(run.total_target, run.success_count, run.fail_count);
            run.status = status;
            run.ended_at = Some(Utc::now());
            finalized = Some(status);
        }

        Self::write_counters(&mut tx, &run).await?;
        if finalized.is_some() {
            Self::release_automation(&mut tx, run.automation_id).await?;
        }
        tx.commit().await?;
        Ok(finalized)
    }

    async fn set_queued_count(&self, run_id: Uuid, queued: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE runs SET queued_count = $2 WHERE id = $1")
            .bind(run_id)
            .bind(queued)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_outcome(&self, record: NewSendRecord) -> anyhow::Result<OutcomeApplied> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO send_records (
                run_id, automation_id, idempotency_key, recipient_key, recipient,
                subject, attachment, status, error_category, error_message,
                provider_message_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(record.run_id)
        .bind(record.automation_id)
        .bind(&record.idempotency_key)
        .bind(&record.recipient_key)
        .bind(&record.recipient)
        .bind(record.subject.as_deref())
        .bind(record.attachment.as_deref())
        .bind(record.status.as_str())
        .bind(record.error_category.map(|c| c.as_str()))
        .bind(record.error_message.as_deref())
        .bind(record.provider_message_id.as_deref())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.commit().await?;
            return Ok(OutcomeApplied {
                recorded: false,
                finalized: None,
            });
        }

        // Row lock on the run serializes concurrent outcomes for it.
        let Some(mut run) = Self::fetch_run_for_update(&mut tx, record.run_id).await? else {
            anyhow::bail!("run {} not found", record.run_id);
        };
        let finalized = run.apply_outcome(&record);
        Self::write_counters(&mut tx, &run).await?;
        if finalized.is_some() {
            Self::release_automation(&mut tx, run.automation_id).await?;
        }

        tx.commit().await?;
        Ok(OutcomeApplied {
            recorded: true,
            finalized,
        })
    }

    async fn finalize_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        message: Option<String>,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        let automation_id: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE runs
            SET status = $2,
                message = COALESCE($3, message),
                ended_at = COALESCE(ended_at, now())
            WHERE id = $1
            RETURNING automation_id
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(message)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(automation_id) = automation_id {
            if status.is_terminal() {
                Self::release_automation(&mut tx, automation_id).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_send_records(&self, run_id: Uuid) -> anyhow::Result<Vec<SendRecord>> {
        let rows = sqlx::query_as::<_, SendRecordRow>(
            r#"
            SELECT id, run_id, automation_id, idempotency_key, recipient_key, recipient,
                   subject, attachment, status, error_category, error_message,
                   provider_message_id, created_at
            FROM send_records
            WHERE run_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SendRecord::try_from).collect()
    }
}
