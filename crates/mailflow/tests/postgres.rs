//! Needs a disposable database in `TEST_DATABASE_URL`; run with
//! `cargo test -- --ignored`.

mod common;

use chrono::Utc;
use common::{pg_setup, row, FakeProvider};
use serde_json::json;
use serial_test::serial;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use mailflow::datasource::{DataSource, PgDataSource};
use mailflow::files::MemoryFileStore;
use mailflow::jobs::{
    JobOptions, JobQueue, PgQueue, QueueJob, QueueName, RunQueueJob, SubmitOutcome, TriggerSource,
    PRIORITY_HIGH,
};
use mailflow::limiter::{PgSendGate, SendGate};
use mailflow::processor::JobProcessor;
use mailflow::provider::ErrorCategory;
use mailflow::scheduler::Scheduler;
use mailflow::sender::{SendOutcome, SendWorker};
use mailflow::store::{
    AutomationConfig, AutomationStatus, CampaignStore, CreateRun, NewSendRecord, PgStore, Run,
    RunStatus, Schedule, ScheduleKind, SendStatus,
};

fn automation_config() -> AutomationConfig {
    AutomationConfig {
        recipient_query: "SELECT id, name, email FROM test_customers ORDER BY id".to_string(),
        mapping_query: Some("SELECT tier FROM test_customers WHERE id = $1".to_string()),
        update_query: Some("UPDATE test_customers SET mailed = true WHERE id = $1".to_string()),
        body_template: "<p>{{name}} ({{tier}})</p>".to_string(),
        subject_template: "Hi $(name)".to_string(),
        attachment_pattern: None,
        sender_email: "news@example.com".to_string(),
        sender_name: "Newsletter".to_string(),
        reply_to: Some("help@example.com".to_string()),
        headers: BTreeMap::from([("X-Campaign".to_string(), "spring".to_string())]),
        ..AutomationConfig::default()
    }
}

async fn seed_customers(pool: &sqlx::PgPool) {
    sqlx::query("DROP TABLE IF EXISTS test_customers")
        .execute(pool)
        .await
        .unwrap();
    sqlx::query(
        r#"
        CREATE TABLE test_customers (
            id BIGINT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT,
            tier TEXT,
            mailed BOOLEAN NOT NULL DEFAULT false
        )
        "#,
    )
    .execute(pool)
    .await
    .unwrap();
    sqlx::query(
        r#"
        INSERT INTO test_customers (id, name, email, tier) VALUES
            (1, 'Ann', 'ann@example.com', 'gold'),
            (2, 'Bob', NULL, NULL),
            (3, 'Cy', 'cy@example.com', 'silver')
        "#,
    )
    .execute(pool)
    .await
    .unwrap();
}

fn outcome(run: &Run, key: &str, status: SendStatus) -> NewSendRecord {
    NewSendRecord {
        run_id: run.id,
        automation_id: run.automation_id,
        idempotency_key: key.to_string(),
        recipient_key: "1".to_string(),
        recipient: "ann@example.com".to_string(),
        subject: Some("Hi".to_string()),
        attachment: None,
        status,
        error_category: (status == SendStatus::Failed).then_some(ErrorCategory::InvalidEmail),
        error_message: None,
        provider_message_id: (status == SendStatus::Success).then(|| "m-1".to_string()),
        recovers_failure: false,
    }
}

#[tokio::test]
#[ignore]
#[serial]
async fn automation_config_and_schedule_round_trip() {
    let pool = pg_setup().await;
    let store = PgStore::new(pool.clone());

    let schedule = Schedule {
        automation_id: 0,
        kind: ScheduleKind::Weekly,
        hour: 9,
        minute: 15,
        day: Some(1),
    };
    let id = store
        .create_automation(7, "weekly digest", &automation_config(), Some(&schedule))
        .await
        .unwrap();

    let config = store.load_config(id).await.unwrap().unwrap();
    assert_eq!(
        config,
        AutomationConfig {
            automation_id: id,
            ..automation_config()
        }
    );

    let schedules = store.active_schedules().await.unwrap();
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0].automation_id, id);
    assert_eq!(schedules[0].kind, ScheduleKind::Weekly);
    assert_eq!(schedules[0].day, Some(1));

    let automation = store.get_automation(id).await.unwrap().unwrap();
    assert_eq!(automation.organization_id, 7);
    assert_eq!(automation.status, AutomationStatus::Active);
    assert!(store.load_config(id + 1000).await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
#[serial]
async fn run_counters_are_idempotent_and_finalize() {
    let pool = pg_setup().await;
    let store = PgStore::new(pool.clone());
    let id = store
        .create_automation(1, "c", &automation_config(), None)
        .await
        .unwrap();
    store
        .mark_automation_started(id, Utc::now(), None)
        .await
        .unwrap();

    let key = Some("automation:1:2025-06-02T09:30".to_string());
    let CreateRun::Created(run) = store
        .create_run(Run::new(id, TriggerSource::Scheduler, key.clone()))
        .await
        .unwrap()
    else {
        panic!("first create must insert");
    };
    let again = store
        .create_run(Run::new(id, TriggerSource::Scheduler, key))
        .await
        .unwrap();
    assert!(matches!(again, CreateRun::Existing(r) if r.id == run.id));

    assert_eq!(store.set_total_target(run.id, 2).await.unwrap(), None);
    store.set_queued_count(run.id, 2).await.unwrap();

    let first = store
        .record_outcome(outcome(&run, "job:a:0", SendStatus::Success))
        .await
        .unwrap();
    assert!(first.recorded);
    let dup = store
        .record_outcome(outcome(&run, "job:a:0", SendStatus::Success))
        .await
        .unwrap();
    assert!(!dup.recorded);

    let last = store
        .record_outcome(outcome(&run, "job:b:0", SendStatus::Failed))
        .await
        .unwrap();
    assert_eq!(last.finalized, Some(RunStatus::Partial));

    let run = store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!((run.success_count, run.fail_count, run.queued_count), (1, 1, 2));
    assert_eq!(run.error_counts.get("INVALID_EMAIL"), Some(&1));
    assert!(run.ended_at.is_some());
    assert_eq!(store.list_send_records(run.id).await.unwrap().len(), 2);

    let automation = store.get_automation(id).await.unwrap().unwrap();
    assert_eq!(automation.status, AutomationStatus::Active);
}

#[tokio::test]
#[ignore]
#[serial]
async fn queue_dedups_leases_fails_and_replays() {
    let pool = pg_setup().await;
    let queue = PgQueue::new(pool.clone());

    let job = QueueJob::Run(RunQueueJob {
        automation_id: 5,
        run_id: uuid::Uuid::new_v4(),
        triggered_by: TriggerSource::Scheduler,
        triggered_at: Utc::now(),
    });
    let first = queue
        .submit(job.clone(), JobOptions::new(3).dedup("automation:5:x"))
        .await
        .unwrap();
    let second = queue
        .submit(job.clone(), JobOptions::new(3).dedup("automation:5:x"))
        .await
        .unwrap();
    let SubmitOutcome::Enqueued(id) = first else {
        panic!("first submit must enqueue");
    };
    assert_eq!(second, SubmitOutcome::Duplicate(id));

    let leased = queue
        .lease(QueueName::Run, "w1", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(leased.id, id);
    assert_eq!(leased.job, job);
    assert!(queue
        .lease(QueueName::Run, "w2", Duration::from_secs(30))
        .await
        .unwrap()
        .is_none());

    queue
        .fail(id, "MAX_ATTEMPTS_EXCEEDED", "INFRA_ERROR", "db down")
        .await
        .unwrap();
    let failed = queue.list_failed(QueueName::Run, Some(5)).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].reason_code.as_deref(), Some("MAX_ATTEMPTS_EXCEEDED"));

    assert!(queue.retry_failed(id).await.unwrap());
    let replayed = queue
        .lease(QueueName::Run, "w1", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!((replayed.attempt, replayed.replay), (1, 1));

    queue.complete(id).await.unwrap();
    let counts = queue.counts(QueueName::Run).await.unwrap();
    assert_eq!((counts.completed, counts.failed, counts.waiting), (1, 0, 0));
}

#[tokio::test]
#[ignore]
#[serial]
async fn expired_lease_is_reclaimed() {
    let pool = pg_setup().await;
    let queue = PgQueue::new(pool.clone());

    let job = QueueJob::Run(RunQueueJob {
        automation_id: 1,
        run_id: uuid::Uuid::new_v4(),
        triggered_by: TriggerSource::Manual,
        triggered_at: Utc::now(),
    });
    let id = queue.submit(job, JobOptions::new(3)).await.unwrap().job_id();

    queue
        .lease(QueueName::Run, "crashed", Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(queue.reap_expired().await.unwrap(), 1);
    let again = queue
        .lease(QueueName::Run, "rescuer", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.id, id);
    assert_eq!(again.attempt, 2);
}

fn pg_run_job(automation_id: i64) -> QueueJob {
    QueueJob::Run(RunQueueJob {
        automation_id,
        run_id: uuid::Uuid::new_v4(),
        triggered_by: TriggerSource::Scheduler,
        triggered_at: Utc::now(),
    })
}

#[tokio::test]
#[ignore]
#[serial]
async fn priority_orders_leasing_and_failures_are_trimmed() {
    let pool = pg_setup().await;
    let queue = PgQueue::new(pool.clone());
    let lease = Duration::from_secs(30);

    queue.submit(pg_run_job(1), JobOptions::new(3)).await.unwrap();
    queue
        .submit(pg_run_job(2), JobOptions::new(3).priority(PRIORITY_HIGH))
        .await
        .unwrap();

    let first = queue.lease(QueueName::Run, "w", lease).await.unwrap().unwrap();
    let second = queue.lease(QueueName::Run, "w", lease).await.unwrap().unwrap();
    assert_eq!(first.job.automation_id(), 2);
    assert_eq!(second.job.automation_id(), 1);

    for leased in [&first, &second] {
        queue.fail(leased.id, "NON_RETRYABLE", "X", "x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(queue.trim_failed(QueueName::Run, 1).await.unwrap(), 1);

    let left = queue.list_failed(QueueName::Run, None).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, second.id);
}

#[tokio::test]
#[ignore]
#[serial]
async fn datasource_returns_rows_as_json_objects() {
    let pool = pg_setup().await;
    seed_customers(&pool).await;
    let ds = PgDataSource::new(pool.clone());

    let rows = ds
        .query("SELECT id, name, email FROM test_customers ORDER BY id;", &[])
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0], row(json!({"id": 1, "name": "Ann", "email": "ann@example.com"})));
    assert_eq!(rows[1]["email"], json!(null));

    let tier = ds
        .query("SELECT tier FROM test_customers WHERE id = $1", &[json!(3)])
        .await
        .unwrap();
    assert_eq!(tier[0]["tier"], json!("silver"));

    let n = ds
        .execute("UPDATE test_customers SET mailed = true WHERE id = $1", &[json!(1)])
        .await
        .unwrap();
    assert_eq!(n, 1);

    // Text and boolean parameters bind the same way for reads and writes.
    let mailed = ds
        .query(
            "SELECT id FROM test_customers WHERE name = $1 AND mailed = $2",
            &[json!("Ann"), json!(true)],
        )
        .await
        .unwrap();
    assert_eq!(mailed, vec![row(json!({"id": 1}))]);

    let n = ds
        .execute(
            "UPDATE test_customers SET tier = $1 WHERE email IS NOT DISTINCT FROM $2::text",
            &[json!("bronze"), json!(null)],
        )
        .await
        .unwrap();
    assert_eq!(n, 1);
}

#[tokio::test]
#[ignore]
#[serial]
async fn shared_gate_limits_grants_per_second() {
    let pool = pg_setup().await;
    let gate = PgSendGate::new(pool.clone(), "test-gate", 3);

    let started = std::time::Instant::now();
    for _ in 0..4 {
        let permit = gate.acquire().await.unwrap();
        gate.release(permit).await.unwrap();
    }
    assert!(started.elapsed() >= Duration::from_millis(900));
}

#[tokio::test]
#[ignore]
#[serial]
async fn shared_gate_counts_in_flight_permits() {
    let pool = pg_setup().await;
    let gate = PgSendGate::new(pool.clone(), "test-gate", 1);

    let held = gate.acquire().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;
    // Still in flight after a full window, so the next claim waits.
    let started = std::time::Instant::now();
    let release = async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        gate.release(held).await.unwrap();
    };
    let (_, next) = tokio::join!(release, gate.acquire());
    next.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(1200));
}

#[tokio::test]
#[ignore]
#[serial]
async fn run_expands_and_sends_against_postgres() {
    let pool = pg_setup().await;
    seed_customers(&pool).await;

    let store = Arc::new(PgStore::new(pool.clone()));
    let queue = Arc::new(PgQueue::new(pool.clone()));
    let datasource = Arc::new(PgDataSource::new(pool.clone()));
    let files = Arc::new(MemoryFileStore::new());
    let provider = Arc::new(FakeProvider::new());

    let id = store
        .create_automation(1, "spring", &automation_config(), None)
        .await
        .unwrap();
    let receipt = Scheduler::new(store.clone(), queue.clone())
        .trigger_manual(id, TriggerSource::Manual)
        .await
        .unwrap();

    let processor = JobProcessor::new(store.clone(), queue.clone(), datasource.clone(), files.clone());
    let leased = queue
        .lease(QueueName::Run, "w", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    let QueueJob::Run(run_job) = &leased.job else {
        panic!("expected a run job");
    };
    let summary = processor.process_run(run_job).await.unwrap();
    assert_eq!((summary.total, summary.queued, summary.expansion_failures), (3, 2, 1));
    queue.complete(leased.id).await.unwrap();

    let worker = SendWorker::new(
        store.clone(),
        provider.clone(),
        files,
        datasource.clone(),
        Arc::new(PgSendGate::new(pool.clone(), "provider-send", 10)),
    );
    while let Some(job) = queue
        .lease(QueueName::Send, "w", Duration::from_secs(30))
        .await
        .unwrap()
    {
        let QueueJob::Send(send) = &job.job else {
            panic!("expected a send job");
        };
        let outcome = worker
            .send_one(job.id, job.replay, send, job.attempt, job.max_attempts)
            .await;
        assert!(matches!(outcome, SendOutcome::Delivered { .. }));
        queue.complete(job.id).await.unwrap();
    }

    let run = store.get_run(receipt.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!((run.success_count, run.fail_count), (2, 1));
    assert_eq!(run.error_counts.get("MISSING_EMAIL"), Some(&1));

    let bodies: Vec<String> = {
        let mut d = provider.delivered();
        d.sort_by(|a, b| a.to.cmp(&b.to));
        d.into_iter().map(|e| e.html_body).collect()
    };
    assert_eq!(bodies, vec!["<p>Ann (gold)</p>", "<p>Cy (silver)</p>"]);

    let mailed: Vec<i64> =
        sqlx::query_scalar("SELECT id FROM test_customers WHERE mailed ORDER BY id")
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(mailed, vec![1, 3]);

    let automation = store.get_automation(id).await.unwrap().unwrap();
    assert_eq!(automation.status, AutomationStatus::Active);
}
