mod common;

use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use common::{config, Harness};

use mailflow::datasource::MemoryDataSource;
use mailflow::jobs::{JobQueue, QueueJob, QueueName, TriggerSource};
use mailflow::scheduler::{dedup_key, should_run, SchedulerState, TriggerError};
use mailflow::store::{AutomationStatus, CampaignStore, RunStatus, Schedule, ScheduleKind};

fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_hms_opt(h, min, s)
        .unwrap()
}

fn schedule(kind: ScheduleKind, hour: u32, minute: u32, day: Option<u32>) -> Schedule {
    Schedule {
        automation_id: 0,
        kind,
        hour,
        minute,
        day,
    }
}

#[test]
fn daily_fires_only_at_its_minute() {
    let s = schedule(ScheduleKind::Daily, 9, 30, None);
    assert!(should_run(&s, at(2025, 6, 2, 9, 30, 0)));
    assert!(should_run(&s, at(2025, 6, 2, 9, 30, 59)));
    assert!(!should_run(&s, at(2025, 6, 2, 9, 31, 0)));
    assert!(!should_run(&s, at(2025, 6, 2, 10, 30, 0)));
}

#[test]
fn weekly_matches_weekday_from_sunday() {
    // 2025-06-01 is a Sunday.
    let sunday = schedule(ScheduleKind::Weekly, 8, 0, Some(0));
    assert!(should_run(&sunday, at(2025, 6, 1, 8, 0, 0)));
    assert!(!should_run(&sunday, at(2025, 6, 2, 8, 0, 0)));

    let saturday = schedule(ScheduleKind::Weekly, 8, 0, Some(6));
    assert!(should_run(&saturday, at(2025, 6, 7, 8, 0, 0)));
}

#[test]
fn monthly_matches_day_of_month() {
    let s = schedule(ScheduleKind::Monthly, 0, 0, Some(15));
    assert!(should_run(&s, at(2025, 2, 15, 0, 0, 0)));
    assert!(!should_run(&s, at(2025, 2, 14, 0, 0, 0)));

    let s31 = schedule(ScheduleKind::Monthly, 12, 0, Some(31));
    assert!(!should_run(&s31, at(2025, 2, 28, 12, 0, 0)));
}

#[test]
fn realtime_always_fires() {
    let s = schedule(ScheduleKind::Realtime, 0, 0, None);
    assert!(should_run(&s, at(2025, 6, 2, 3, 17, 42)));
}

#[test]
fn invalid_schedules_never_fire() {
    assert!(!should_run(&schedule(ScheduleKind::Daily, 24, 0, None), at(2025, 6, 2, 0, 0, 0)));
    assert!(!should_run(&schedule(ScheduleKind::Weekly, 8, 0, None), at(2025, 6, 1, 8, 0, 0)));
    assert!(!should_run(&schedule(ScheduleKind::Monthly, 8, 0, Some(0)), at(2025, 6, 1, 8, 0, 0)));
}

#[test]
fn dedup_key_is_stable_within_a_minute() {
    let a = dedup_key(42, at(2025, 6, 2, 9, 30, 1));
    let b = dedup_key(42, at(2025, 6, 2, 9, 30, 58));
    assert_eq!(a, "automation:42:2025-06-02T09:30");
    assert_eq!(a, b);
    assert_ne!(a, dedup_key(42, at(2025, 6, 2, 9, 31, 0)));
    assert_ne!(a, dedup_key(43, at(2025, 6, 2, 9, 30, 0)));
}

#[tokio::test]
async fn repeated_ticks_in_one_minute_enqueue_once() {
    let h = Harness::new(MemoryDataSource::new());
    let id = h.store.add_automation(
        "daily digest",
        config(),
        Some(schedule(ScheduleKind::Daily, 9, 30, None)),
    );

    let first = h.scheduler.tick(at(2025, 6, 2, 9, 30, 5)).await.unwrap();
    assert_eq!((first.evaluated, first.enqueued), (1, 1));

    // Still RUNNING from the first tick, so it is not even evaluated.
    let second = h.scheduler.tick(at(2025, 6, 2, 9, 30, 35)).await.unwrap();
    assert_eq!(second.enqueued, 0);

    // Even when the automation is back to ACTIVE the minute's key holds.
    h.store.set_automation_status(id, AutomationStatus::Active);
    let third = h.scheduler.tick(at(2025, 6, 2, 9, 30, 50)).await.unwrap();
    assert_eq!((third.enqueued, third.duplicates), (0, 1));

    assert_eq!(h.store.runs_for(id).len(), 1);
    let counts = h.queue.counts(QueueName::Run).await.unwrap();
    assert_eq!(counts.waiting, 1);
}

#[tokio::test]
async fn enqueue_marks_automation_running_and_stamps_times() {
    let h = Harness::new(MemoryDataSource::new());
    let id = h.store.add_automation(
        "weekly",
        config(),
        Some(schedule(ScheduleKind::Daily, 7, 0, None)),
    );

    h.scheduler.tick(at(2025, 6, 2, 7, 0, 0)).await.unwrap();

    let a = h.store.get_automation(id).await.unwrap().unwrap();
    assert_eq!(a.status, AutomationStatus::Running);
    assert!(a.last_run_at.is_some());
    assert!(a.next_run_at.is_some());

    let run = &h.store.runs_for(id)[0];
    assert_eq!(run.triggered_by, TriggerSource::Scheduler);
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.dedup_key.as_deref(), Some("automation:1:2025-06-02T07:00"));
}

#[tokio::test]
async fn one_invalid_schedule_does_not_block_others() {
    let h = Harness::new(MemoryDataSource::new());
    let broken = h.store.add_automation(
        "broken",
        config(),
        Some(schedule(ScheduleKind::Weekly, 7, 0, None)),
    );
    let good = h.store.add_automation(
        "good",
        config(),
        Some(schedule(ScheduleKind::Daily, 7, 0, None)),
    );

    let report = h.scheduler.tick(at(2025, 6, 2, 7, 0, 0)).await.unwrap();
    assert_eq!(report.evaluated, 2);
    assert_eq!(report.errors, 1);
    assert_eq!(report.enqueued, 1);

    assert!(h.store.runs_for(broken).is_empty());
    assert_eq!(h.store.runs_for(good).len(), 1);
}

#[tokio::test]
async fn inactive_automations_are_not_scheduled() {
    let h = Harness::new(MemoryDataSource::new());
    let id = h.store.add_automation(
        "paused",
        config(),
        Some(schedule(ScheduleKind::Realtime, 0, 0, None)),
    );
    h.store.set_automation_status(id, AutomationStatus::Inactive);

    let report = h.scheduler.tick(at(2025, 6, 2, 7, 0, 0)).await.unwrap();
    assert_eq!(report.evaluated, 0);
    assert!(h.store.runs_for(id).is_empty());
}

#[tokio::test]
async fn manual_trigger_creates_run_and_job() {
    let h = Harness::new(MemoryDataSource::new());
    let id = h.add_automation(config());

    let receipt = h
        .scheduler
        .trigger_manual(id, TriggerSource::Api)
        .await
        .unwrap();

    let run = h.run(receipt.run_id).await;
    assert_eq!(run.automation_id, id);
    assert_eq!(run.triggered_by, TriggerSource::Api);
    assert_eq!(run.dedup_key, None);

    let leased = h
        .queue
        .lease(QueueName::Run, "w", std::time::Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(leased.id, receipt.job_id);
    match leased.job {
        QueueJob::Run(job) => {
            assert_eq!(job.run_id, receipt.run_id);
            assert_eq!(job.triggered_by, TriggerSource::Api);
        }
        other => panic!("unexpected job {other:?}"),
    }
}

#[tokio::test]
async fn manual_triggers_are_never_deduplicated() {
    let h = Harness::new(MemoryDataSource::new());
    let id = h.add_automation(config());

    let a = h.trigger(id).await;
    let b = h.trigger(id).await;
    assert_ne!(a.run_id, b.run_id);
    assert_ne!(a.job_id, b.job_id);
    assert_eq!(h.store.runs_for(id).len(), 2);
}

#[tokio::test]
async fn manual_trigger_of_unknown_automation() {
    let h = Harness::new(MemoryDataSource::new());
    let err = h
        .scheduler
        .trigger_manual(999, TriggerSource::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, TriggerError::ConfigNotFound(999)));

    let counts = h.queue.counts(QueueName::Run).await.unwrap();
    assert_eq!(counts.waiting, 0);
}

#[tokio::test]
async fn late_tick_catches_up_the_skipped_minute() {
    let h = Harness::new(MemoryDataSource::new());
    let id = h.store.add_automation(
        "morning",
        config(),
        Some(schedule(ScheduleKind::Daily, 9, 0, None)),
    );
    let mut state = SchedulerState::default();

    let before = at(2025, 6, 2, 8, 59, 59) + ChronoDuration::milliseconds(990);
    let first = h.scheduler.tick_since(&mut state, before).await.unwrap();
    assert_eq!(first.enqueued, 0);

    // The next tick lands after 09:00 has already passed.
    let after = at(2025, 6, 2, 9, 1, 0) + ChronoDuration::milliseconds(20);
    let second = h.scheduler.tick_since(&mut state, after).await.unwrap();
    assert_eq!(second.enqueued, 1);
    assert_eq!(state.last_tick, Some(after));

    let runs = h.store.runs_for(id);
    assert_eq!(runs.len(), 1);
    let key = dedup_key(id, at(2025, 6, 2, 9, 0, 0));
    assert_eq!(runs[0].dedup_key.as_deref(), Some(key.as_str()));
}

#[tokio::test]
async fn catch_up_does_not_repeat_an_evaluated_minute() {
    let h = Harness::new(MemoryDataSource::new());
    let id = h.store.add_automation(
        "morning",
        config(),
        Some(schedule(ScheduleKind::Daily, 9, 0, None)),
    );
    let mut state = SchedulerState::default();

    h.scheduler
        .tick_since(&mut state, at(2025, 6, 2, 9, 0, 10))
        .await
        .unwrap();
    h.store.set_automation_status(id, AutomationStatus::Active);
    let next = h
        .scheduler
        .tick_since(&mut state, at(2025, 6, 2, 9, 2, 0))
        .await
        .unwrap();

    assert_eq!(next.enqueued, 0);
    assert_eq!(h.store.runs_for(id).len(), 1);
}

#[tokio::test]
async fn realtime_fires_once_per_late_tick() {
    let h = Harness::new(MemoryDataSource::new());
    let id = h.store.add_automation(
        "stream",
        config(),
        Some(schedule(ScheduleKind::Realtime, 0, 0, None)),
    );
    let mut state = SchedulerState {
        last_tick: Some(at(2025, 6, 2, 9, 0, 0)),
    };

    let report = h
        .scheduler
        .tick_since(&mut state, at(2025, 6, 2, 9, 5, 0))
        .await
        .unwrap();
    assert_eq!(report.enqueued, 1);
    assert_eq!(h.store.runs_for(id).len(), 1);
}

#[tokio::test]
async fn manual_trigger_is_leased_before_waiting_scheduled_runs() {
    let h = Harness::new(MemoryDataSource::new());
    let scheduled = h.store.add_automation(
        "nightly",
        config(),
        Some(schedule(ScheduleKind::Daily, 2, 0, None)),
    );
    let manual = h.add_automation(config());

    h.scheduler.tick(at(2025, 6, 2, 2, 0, 0)).await.unwrap();
    h.trigger(manual).await;

    let first = h
        .queue
        .lease(QueueName::Run, "w", std::time::Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.job.automation_id(), manual);

    let second = h
        .queue
        .lease(QueueName::Run, "w", std::time::Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.job.automation_id(), scheduled);
}
