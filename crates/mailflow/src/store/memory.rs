use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

use super::{
    Automation, AutomationConfig, AutomationStatus, CampaignStore, CreateRun, NewSendRecord,
    OutcomeApplied, Run, RunStatus, Schedule, SendRecord,
};

#[derive(Default)]
struct Inner {
    automations: BTreeMap<i64, Automation>,
    configs: HashMap<i64, AutomationConfig>,
    schedules: BTreeMap<i64, Schedule>,
    runs: HashMap<Uuid, Run>,
    runs_by_key: HashMap<String, Uuid>,
    records: Vec<SendRecord>,
    record_keys: HashSet<String>,
    next_automation_id: i64,
}

/// In-process store used by tests and the single-node dev mode.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an ACTIVE automation and returns its id.
    pub fn add_automation(&self, name: &str, mut config: AutomationConfig, schedule: Option<Schedule>) -> i64 {
        let mut g = self.inner.lock();
        g.next_automation_id += 1;
        let id = g.next_automation_id;

        g.automations.insert(
            id,
            Automation {
                id,
                organization_id: 1,
                name: name.to_string(),
                status: AutomationStatus::Active,
                last_run_at: None,
                next_run_at: None,
            },
        );
        config.automation_id = id;
        g.configs.insert(id, config);
        if let Some(mut s) = schedule {
            s.automation_id = id;
            g.schedules.insert(id, s);
        }
        id
    }

    pub fn set_automation_status(&self, id: i64, status: AutomationStatus) {
        if let Some(a) = self.inner.lock().automations.get_mut(&id) {
            a.status = status;
        }
    }

    pub fn runs_for(&self, automation_id: i64) -> Vec<Run> {
        let g = self.inner.lock();
        let mut runs: Vec<Run> = g
            .runs
            .values()
            .filter(|r| r.automation_id == automation_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.started_at);
        runs
    }
}

fn release(g: &mut Inner, automation_id: i64) {
    if let Some(a) = g.automations.get_mut(&automation_id) {
        if a.status == AutomationStatus::Running {
            a.status = AutomationStatus::Active;
        }
    }
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn active_schedules(&self) -> anyhow::Result<Vec<Schedule>> {
        let g = self.inner.lock();
        Ok(g.schedules
            .values()
            .filter(|s| {
                g.automations
                    .get(&s.automation_id)
                    .is_some_and(|a| a.status == AutomationStatus::Active)
            })
            .cloned()
            .collect())
    }

    async fn get_automation(&self, id: i64) -> anyhow::Result<Option<Automation>> {
        Ok(self.inner.lock().automations.get(&id).cloned())
    }

    async fn load_config(&self, automation_id: i64) -> anyhow::Result<Option<AutomationConfig>> {
        Ok(self.inner.lock().configs.get(&automation_id).cloned())
    }

    async fn mark_automation_started(
        &self,
        id: i64,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        let mut g = self.inner.lock();
        if let Some(a) = g.automations.get_mut(&id) {
            a.last_run_at = Some(last_run_at);
            a.next_run_at = next_run_at;
            if a.status == AutomationStatus::Active {
                a.status = AutomationStatus::Running;
            }
        }
        Ok(())
    }

    async fn mark_automation_idle(&self, id: i64) -> anyhow::Result<()> {
        release(&mut self.inner.lock(), id);
        Ok(())
    }

    async fn create_run(&self, run: Run) -> anyhow::Result<CreateRun> {
        let mut g = self.inner.lock();
        if let Some(key) = &run.dedup_key {
            if let Some(existing) = g.runs_by_key.get(key).and_then(|id| g.runs.get(id)) {
                return Ok(CreateRun::Existing(existing.clone()));
            }
            g.runs_by_key.insert(key.clone(), run.id);
        }
        g.runs.insert(run.id, run.clone());
        Ok(CreateRun::Created(run))
    }

    async fn get_run(&self, id: Uuid) -> anyhow::Result<Option<Run>> {
        Ok(self.inner.lock().runs.get(&id).cloned())
    }

    async fn set_total_target(&self, run_id: Uuid, total: i64) -> anyhow::Result<Option<RunStatus>> {
        let mut g = self.inner.lock();
        let Some(run) = g.runs.get_mut(&run_id) else {
            anyhow::bail!("run {run_id} not found");
        };

        run.total_target = total.max(0);
        if run.status.is_terminal() || run.success_count + run.fail_count < run.total_target {
            return Ok(None);
        }
        let status = RunStatus::derive(run.total_target, run.success_count, run.fail_count);
        run.status = status;
        run.ended_at = Some(Utc::now());
        let automation_id = run.automation_id;
        release(&mut g, automation_id);
        Ok(Some(status))
    }

    async fn set_queued_count(&self, run_id: Uuid, queued: i64) -> anyhow::Result<()> {
        if let Some(run) = self.inner.lock().runs.get_mut(&run_id) {
            run.queued_count = queued;
        }
        Ok(())
    }

    async fn record_outcome(&self, record: NewSendRecord) -> anyhow::Result<OutcomeApplied> {
        let mut g = self.inner.lock();
        if g.record_keys.contains(&record.idempotency_key) {
            return Ok(OutcomeApplied {
                recorded: false,
                finalized: None,
            });
        }
        let Some(run) = g.runs.get_mut(&record.run_id) else {
            anyhow::bail!("run {} not found", record.run_id);
        };

        let finalized = run.apply_outcome(&record);
        let automation_id = run.automation_id;
        if finalized.is_some() {
            release(&mut g, automation_id);
        }

        g.record_keys.insert(record.idempotency_key.clone());
        let id = g.records.len() as i64 + 1;
        g.records.push(SendRecord {
            id,
            run_id: record.run_id,
            automation_id: record.automation_id,
            idempotency_key: record.idempotency_key,
            recipient_key: record.recipient_key,
            recipient: record.recipient,
            subject: record.subject,
            attachment: record.attachment,
            status: record.status,
            error_category: record.error_category,
            error_message: record.error_message,
            provider_message_id: record.provider_message_id,
            created_at: Utc::now(),
        });

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
        let mut g = self.inner.lock();
        let Some(run) = g.runs.get_mut(&run_id) else {
            return Ok(());
        };
        run.status = status;
        if message.is_some() {
            run.message = message;
        }
        run.ended_at.get_or_insert_with(Utc::now);
        let automation_id = run.automation_id;
        if status.is_terminal() {
            release(&mut g, automation_id);
        }
        Ok(())
    }

    async fn list_send_records(&self, run_id: Uuid) -> anyhow::Result<Vec<SendRecord>> {
        Ok(self
            .inner
            .lock()
            .records
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect())
    }
}
