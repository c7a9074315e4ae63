//! Decides when automations are due and turns them into run-queue jobs.

use chrono::{Datelike, Duration as ChronoDuration, Local, NaiveDateTime, TimeZone, Timelike, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::jobs::{
    JobOptions, JobQueue, QueueJob, QueueName, RetryConfig, RunQueueJob, SubmitOutcome,
    TriggerSource, PRIORITY_HIGH,
};
use crate::store::{CampaignStore, CreateRun, Run, RunStatus, Schedule, ScheduleKind};

/// Whether `schedule` fires at the wall-clock minute of `now`.
pub fn should_run(schedule: &Schedule, now: NaiveDateTime) -> bool {
    if schedule.validate().is_err() {
        return false;
    }
    if schedule.kind == ScheduleKind::Realtime {
        return true;
    }
    if schedule.hour != now.hour() || schedule.minute != now.minute() {
        return false;
    }
    matches_day(schedule, now)
}

fn matches_day(schedule: &Schedule, at: NaiveDateTime) -> bool {
    match schedule.kind {
        ScheduleKind::Realtime | ScheduleKind::Daily => true,
        ScheduleKind::Weekly => schedule.day == Some(at.weekday().num_days_from_sunday()),
        ScheduleKind::Monthly => schedule.day == Some(at.day()),
    }
}

/// `automation:{id}:{YYYY-MM-DDTHH:mm}`. Stable for every tick in the same minute.
pub fn dedup_key(automation_id: i64, now: NaiveDateTime) -> String {
    format!("automation:{automation_id}:{}", now.format("%Y-%m-%dT%H:%M"))
}

/// Next minute strictly after `now` at which the schedule fires.
/// `None` for REALTIME and for schedules that fail validation.
pub fn next_fire_after(schedule: &Schedule, now: NaiveDateTime) -> Option<NaiveDateTime> {
    if schedule.kind == ScheduleKind::Realtime || schedule.validate().is_err() {
        return None;
    }
    // A day-31 schedule can skip up to two months in a row.
    (0..=366).find_map(|offset| {
        let date = now.date() + ChronoDuration::days(offset);
        let candidate = date.and_hms_opt(schedule.hour, schedule.minute, 0)?;
        (candidate > now && matches_day(schedule, candidate)).then_some(candidate)
    })
}

fn local_to_utc(at: NaiveDateTime) -> Option<chrono::DateTime<Utc>> {
    Local
        .from_local_datetime(&at)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("automation {0} not found")]
    ConfigNotFound(i64),
    #[error(transparent)]
    Infra(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued { run_id: Uuid, job_id: Uuid },
    /// This minute's run already exists.
    Duplicate { run_id: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerReceipt {
    pub run_id: Uuid,
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub evaluated: usize,
    pub enqueued: usize,
    pub duplicates: usize,
    pub errors: usize,
}

impl TickReport {
    fn absorb(&mut self, other: TickReport) {
        self.evaluated += other.evaluated;
        self.enqueued += other.enqueued;
        self.duplicates += other.duplicates;
        self.errors += other.errors;
    }
}

/// Minutes older than this are not replayed after a stall.
pub const MAX_CATCH_UP_MINUTES: i64 = 60;

/// Owned by the loop that drives `tick`.
#[derive(Debug, Clone, Default)]
pub struct SchedulerState {
    /// Wall-clock time of the last tick that loaded schedules.
    pub last_tick: Option<NaiveDateTime>,
}

fn minute_floor(at: NaiveDateTime) -> NaiveDateTime {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

/// Minute starts strictly after `last`'s minute and before `now`'s.
pub fn missed_minutes(last: NaiveDateTime, now: NaiveDateTime) -> Vec<NaiveDateTime> {
    let now_minute = minute_floor(now);
    let mut from = minute_floor(last) + ChronoDuration::minutes(1);
    let oldest = now_minute - ChronoDuration::minutes(MAX_CATCH_UP_MINUTES);
    if from < oldest {
        warn!(%last, %now, "scheduler stalled, older minutes are not replayed");
        from = oldest;
    }

    let mut out = Vec::new();
    let mut minute = from;
    while minute < now_minute {
        out.push(minute);
        minute += ChronoDuration::minutes(1);
    }
    out
}

#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn CampaignStore>,
    queue: Arc<dyn JobQueue>,
    run_attempts: i32,
}

impl Scheduler {
    pub fn new(store: Arc<dyn CampaignStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            store,
            queue,
            run_attempts: RetryConfig::for_queue(QueueName::Run).max_attempts,
        }
    }

    /// Evaluates every active schedule against `now` (local wall clock).
    /// Problems with one automation are logged and never stop the rest.
    pub async fn tick(&self, now: NaiveDateTime) -> anyhow::Result<TickReport> {
        self.evaluate(now, true).await
    }

    /// Like `tick`, but first evaluates every whole minute skipped since
    /// `state.last_tick`, so a late tick cannot lose a DAILY or WEEKLY slot.
    /// REALTIME schedules only fire for `now`. The state only advances when
    /// schedules could be loaded.
    pub async fn tick_since(
        &self,
        state: &mut SchedulerState,
        now: NaiveDateTime,
    ) -> anyhow::Result<TickReport> {
        let mut report = TickReport::default();
        if let Some(last) = state.last_tick {
            for minute in missed_minutes(last, now) {
                debug!(%minute, "evaluating missed minute");
                report.absorb(self.evaluate(minute, false).await?);
            }
        }
        report.absorb(self.evaluate(now, true).await?);
        state.last_tick = Some(now);
        Ok(report)
    }

    async fn evaluate(&self, now: NaiveDateTime, realtime: bool) -> anyhow::Result<TickReport> {
        let schedules = self.store.active_schedules().await?;
        let mut report = TickReport {
            evaluated: schedules.len(),
            ..TickReport::default()
        };

        for schedule in &schedules {
            if let Err(e) = schedule.validate() {
                warn!(automation_id = schedule.automation_id, error = %e, "invalid schedule");
                report.errors += 1;
                continue;
            }
            if !should_run(schedule, now) || (!realtime && schedule.kind == ScheduleKind::Realtime) {
                continue;
            }

            match self.enqueue(schedule, now).await {
                Ok(EnqueueOutcome::Enqueued { run_id, job_id }) => {
                    info!(
                        automation_id = schedule.automation_id,
                        %run_id,
                        %job_id,
                        "scheduled run enqueued"
                    );
                    report.enqueued += 1;
                }
                Ok(EnqueueOutcome::Duplicate { run_id }) => {
                    debug!(automation_id = schedule.automation_id, %run_id, "already enqueued this minute");
                    report.duplicates += 1;
                }
                Err(e) => {
                    error!(automation_id = schedule.automation_id, error = %e, "enqueue failed");
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    /// Creates this minute's run for the schedule and submits its job.
    /// Both steps are keyed by `dedup_key`, so repeating them is a no-op.
    pub async fn enqueue(&self, schedule: &Schedule, now: NaiveDateTime) -> anyhow::Result<EnqueueOutcome> {
        let automation_id = schedule.automation_id;
        let key = dedup_key(automation_id, now);

        let run = match self
            .store
            .create_run(Run::new(automation_id, TriggerSource::Scheduler, Some(key.clone())))
            .await?
        {
            CreateRun::Existing(run) if run.status.is_terminal() => {
                return Ok(EnqueueOutcome::Duplicate { run_id: run.id });
            }
            CreateRun::Existing(run) | CreateRun::Created(run) => run,
        };

        let job = QueueJob::Run(RunQueueJob {
            automation_id,
            run_id: run.id,
            triggered_by: TriggerSource::Scheduler,
            triggered_at: Utc::now(),
        });
        let outcome = self
            .submit_or_fail_run(run.id, job, JobOptions::new(self.run_attempts).dedup(key))
            .await?;

        match outcome {
            SubmitOutcome::Duplicate(_) => Ok(EnqueueOutcome::Duplicate { run_id: run.id }),
            SubmitOutcome::Enqueued(job_id) => {
                let next = next_fire_after(schedule, now).and_then(local_to_utc);
                self.store
                    .mark_automation_started(automation_id, Utc::now(), next)
                    .await?;
                Ok(EnqueueOutcome::Enqueued {
                    run_id: run.id,
                    job_id,
                })
            }
        }
    }

    /// Starts a run right away, outside any schedule. Its job is leased
    /// ahead of scheduled runs already waiting.
    pub async fn trigger_manual(
        &self,
        automation_id: i64,
        source: TriggerSource,
    ) -> Result<TriggerReceipt, TriggerError> {
        let Some(automation) = self.store.get_automation(automation_id).await? else {
            return Err(TriggerError::ConfigNotFound(automation_id));
        };

        let run = Run::new(automation_id, source, None);
        let run_id = run.id;
        self.store.create_run(run).await?;

        let job = QueueJob::Run(RunQueueJob {
            automation_id,
            run_id,
            triggered_by: source,
            triggered_at: Utc::now(),
        });
        let job_id = self
            .submit_or_fail_run(
                run_id,
                job,
                JobOptions::new(self.run_attempts).priority(PRIORITY_HIGH),
            )
            .await?
            .job_id();

        self.store
            .mark_automation_started(automation_id, Utc::now(), automation.next_run_at)
            .await?;

        info!(automation_id, %run_id, %job_id, source = source.as_str(), "manual run enqueued");
        Ok(TriggerReceipt { run_id, job_id })
    }

    async fn submit_or_fail_run(
        &self,
        run_id: Uuid,
        job: QueueJob,
        opts: JobOptions,
    ) -> anyhow::Result<SubmitOutcome> {
        match self.queue.submit(job, opts).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let message = format!("failed to enqueue run: {e}");
                if let Err(fe) = self
                    .store
                    .finalize_run(run_id, RunStatus::Failed, Some(message))
                    .await
                {
                    error!(%run_id, error = %fe, "failed to mark run FAILED");
                }
                Err(e)
            }
        }
    }
}

/// Ticks every `interval` until `running` is cleared. Minutes the interval
/// stepped over are caught up from `SchedulerState`.
pub async fn run_loop(
    scheduler: Scheduler,
    interval: Duration,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let mut state = SchedulerState::default();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    running.store(true, Ordering::SeqCst);
    info!(interval_secs = interval.as_secs(), "scheduler started");

    while running.load(Ordering::SeqCst) {
        ticker.tick().await;
        let now = Local::now().naive_local();

        match scheduler.tick_since(&mut state, now).await {
            Ok(report) if report.enqueued > 0 || report.errors > 0 => {
                info!(
                    evaluated = report.evaluated,
                    enqueued = report.enqueued,
                    duplicates = report.duplicates,
                    errors = report.errors,
                    "scheduler tick"
                );
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "scheduler tick failed"),
        }
    }

    info!(last_tick = ?state.last_tick, "scheduler stopped");
    Ok(())
}
