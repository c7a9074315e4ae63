mod common;

use common::{config, customers, Harness, RECIPIENTS_SQL};
use std::time::Duration;

use mailflow::datasource::MemoryDataSource;
use mailflow::files::MemoryFileStore;
use mailflow::jobs::{JobQueue, QueueJob, QueueName};
use mailflow::provider::ErrorCategory;
use mailflow::sender::SendOutcome;
use mailflow::store::{CampaignStore, RunStatus, SendStatus};

#[tokio::test(start_paused = true)]
async fn sends_never_exceed_the_rate_in_any_window() {
    let h = Harness::with_rate(MemoryDataSource::new().with_rows(RECIPIENTS_SQL, customers(30)), 5);
    let id = h.add_automation(config());

    let receipt = h.trigger(id).await;
    let run = h.drain(receipt.run_id).await;
    assert_eq!(run.status, RunStatus::Success);

    let mut starts: Vec<_> = h.provider.calls().into_iter().map(|(_, at)| at).collect();
    starts.sort();
    assert_eq!(starts.len(), 30);

    for pair in starts.windows(6) {
        assert!(
            pair[5].duration_since(pair[0]) >= Duration::from_secs(1),
            "six sends inside one second"
        );
    }
    assert!(starts[29].duration_since(starts[0]) >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn completions_stay_under_the_rate_with_uneven_latency() {
    let h = Harness::with_rate(MemoryDataSource::new().with_rows(RECIPIENTS_SQL, customers(6)), 2);
    h.provider
        .queue_latencies(&[Duration::from_millis(900), Duration::from_millis(900)]);
    let id = h.add_automation(config());

    let receipt = h.trigger(id).await;
    let run = h.drain(receipt.run_id).await;
    assert_eq!(run.status, RunStatus::Success);

    let mut done = h.provider.completions();
    done.sort();
    assert_eq!(done.len(), 6);

    // Slow first calls must not let fast ones pile into the same second.
    for trio in done.windows(3) {
        assert!(
            trio[2].duration_since(trio[0]) >= Duration::from_secs(1),
            "three completions inside one second"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_with_backoff() {
    let h = Harness::new(MemoryDataSource::new().with_rows(RECIPIENTS_SQL, customers(2)));
    h.provider.fail_next("user1@example.com", ErrorCategory::NetworkError, 2);
    let id = h.add_automation(config());

    let receipt = h.trigger(id).await;
    let run = h.drain(receipt.run_id).await;

    assert_eq!(run.status, RunStatus::Success);
    assert_eq!((run.success_count, run.fail_count), (2, 0));
    assert!(run.error_counts.is_empty());

    let calls = h.provider.calls_to("user1@example.com");
    assert_eq!(calls.len(), 3);
    assert!(calls[1].duration_since(calls[0]) >= Duration::from_secs(2));
    assert!(calls[2].duration_since(calls[0]) >= Duration::from_secs(6));

    // Intermediate attempts leave no audit rows.
    let records = h.store.list_send_records(receipt.run_id).await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.status == SendStatus::Success));
}

#[tokio::test(start_paused = true)]
async fn persistent_throttling_exhausts_attempts() {
    let h = Harness::new(MemoryDataSource::new().with_rows(RECIPIENTS_SQL, customers(1)));
    h.provider.fail_always("user1@example.com", ErrorCategory::RateLimit);
    let id = h.add_automation(config());

    let receipt = h.trigger(id).await;
    let run = h.drain(receipt.run_id).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_counts.get("RATE_LIMIT"), Some(&1));
    assert_eq!(h.provider.calls().len(), 3);

    let failed = h.queue.list_failed(QueueName::Send, None).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempts, 3);
    assert_eq!(failed[0].reason_code.as_deref(), Some("MAX_ATTEMPTS_EXCEEDED"));
    assert_eq!(failed[0].error_code.as_deref(), Some("RATE_LIMIT"));
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_is_not_retried() {
    let h = Harness::new(MemoryDataSource::new().with_rows(RECIPIENTS_SQL, customers(1)));
    h.provider.fail_always("user1@example.com", ErrorCategory::InvalidEmail);
    let id = h.add_automation(config());

    let receipt = h.trigger(id).await;
    h.drain(receipt.run_id).await;

    assert_eq!(h.provider.calls().len(), 1);
    let failed = h.queue.list_failed(QueueName::Send, None).await.unwrap();
    assert_eq!(failed[0].attempts, 1);
    assert_eq!(failed[0].reason_code.as_deref(), Some("NON_RETRYABLE"));
    assert_eq!(failed[0].error_code.as_deref(), Some("INVALID_EMAIL"));

    let records = h.store.list_send_records(receipt.run_id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].error_category, Some(ErrorCategory::InvalidEmail));
    assert_eq!(records[0].recipient, "user1@example.com");
    assert_eq!(records[0].subject.as_deref(), Some("Hi User 1"));
}

#[tokio::test(start_paused = true)]
async fn provider_timeout_counts_as_network_error() {
    let h = Harness::build(
        MemoryDataSource::new().with_rows(RECIPIENTS_SQL, customers(1)),
        MemoryFileStore::new(),
        14,
        Duration::from_secs(5),
    );
    h.provider.set_latency(Duration::from_secs(60));
    let id = h.add_automation(config());

    let started = tokio::time::Instant::now();
    let receipt = h.trigger(id).await;
    let run = h.drain(receipt.run_id).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_counts.get("NETWORK_ERROR"), Some(&1));
    assert_eq!(h.provider.calls().len(), 3);
    // Three 5s timeouts plus 2s and 4s of backoff.
    assert!(started.elapsed() >= Duration::from_secs(21));
    assert!(h.provider.delivered().is_empty());
}

#[tokio::test(start_paused = true)]
async fn operator_retry_moves_a_failure_to_success() {
    let h = Harness::new(MemoryDataSource::new().with_rows(RECIPIENTS_SQL, customers(2)));
    h.provider.fail_always("user2@example.com", ErrorCategory::NotVerified);
    let id = h.add_automation(config());

    let receipt = h.trigger(id).await;
    let run = h.drain(receipt.run_id).await;
    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!((run.success_count, run.fail_count), (1, 1));

    let failed = h.queue.list_failed(QueueName::Send, Some(id)).await.unwrap();
    assert_eq!(failed.len(), 1);

    h.provider.heal("user2@example.com");
    assert!(h.queue.retry_failed(failed[0].id).await.unwrap());
    assert!(!h.queue.retry_failed(failed[0].id).await.unwrap());

    let run = h.drain(receipt.run_id).await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!((run.success_count, run.fail_count), (2, 0));
    // History keeps the original failure.
    assert_eq!(run.error_counts.get("NOT_VERIFIED"), Some(&1));

    let records = h.store.list_send_records(receipt.run_id).await.unwrap();
    let user2: Vec<_> = records
        .iter()
        .filter(|r| r.recipient == "user2@example.com")
        .collect();
    assert_eq!(user2.len(), 2);
    assert_eq!(user2[0].status, SendStatus::Failed);
    assert_eq!(user2[1].status, SendStatus::Success);
    assert_ne!(user2[0].idempotency_key, user2[1].idempotency_key);
}

#[tokio::test(start_paused = true)]
async fn failed_replay_is_not_counted_twice() {
    let h = Harness::new(MemoryDataSource::new().with_rows(RECIPIENTS_SQL, customers(2)));
    h.provider.fail_always("user2@example.com", ErrorCategory::InvalidEmail);
    let id = h.add_automation(config());

    let receipt = h.trigger(id).await;
    h.drain(receipt.run_id).await;

    let retried = h.queue.retry_all_failed(QueueName::Send, Some(id)).await.unwrap();
    assert_eq!(retried, 1);
    let run = h.drain(receipt.run_id).await;

    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!((run.success_count, run.fail_count), (1, 1));
    assert_eq!(run.error_counts.get("INVALID_EMAIL"), Some(&2));

    let failed = h.queue.list_failed(QueueName::Send, Some(id)).await.unwrap();
    assert_eq!(failed[0].replay, 1);
}

#[tokio::test(start_paused = true)]
async fn retry_all_respects_the_automation_filter() {
    let h = Harness::new(MemoryDataSource::new().with_rows(RECIPIENTS_SQL, customers(1)));
    h.provider.fail_always("user1@example.com", ErrorCategory::InvalidEmail);
    let a = h.add_automation(config());
    let b = h.add_automation(config());

    let ra = h.trigger(a).await;
    h.drain(ra.run_id).await;
    let rb = h.trigger(b).await;
    h.drain(rb.run_id).await;

    assert_eq!(h.queue.list_failed(QueueName::Send, None).await.unwrap().len(), 2);
    assert_eq!(h.queue.retry_all_failed(QueueName::Send, Some(b)).await.unwrap(), 1);

    let still_failed = h.queue.list_failed(QueueName::Send, None).await.unwrap();
    assert_eq!(still_failed.len(), 1);
    assert_eq!(still_failed[0].automation_id, a);
}

#[tokio::test]
async fn redelivered_send_job_is_counted_once() {
    let h = Harness::new(MemoryDataSource::new().with_rows(RECIPIENTS_SQL, customers(2)));
    let id = h.add_automation(config());
    let receipt = h.trigger(id).await;

    let run_job = h
        .queue
        .lease(QueueName::Run, "w", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    let QueueJob::Run(run_job) = run_job.job else {
        panic!("expected a run job");
    };
    h.processor.process_run(&run_job).await.unwrap();

    let leased = h
        .queue
        .lease(QueueName::Send, "w", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    let QueueJob::Send(send) = &leased.job else {
        panic!("expected a send job");
    };

    // The same attempt delivered twice, as after a lost acknowledgement.
    let first = h.worker.send_one(leased.id, leased.replay, send, 1, 3).await;
    let second = h.worker.send_one(leased.id, leased.replay, send, 1, 3).await;
    assert!(matches!(first, SendOutcome::Delivered { .. }));
    assert!(matches!(second, SendOutcome::Delivered { .. }));

    let run = h.run(receipt.run_id).await;
    assert_eq!(run.success_count, 1);
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(h.store.list_send_records(receipt.run_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn last_attempt_records_a_retryable_failure() {
    let h = Harness::new(MemoryDataSource::new().with_rows(RECIPIENTS_SQL, customers(1)));
    h.provider.fail_always("user1@example.com", ErrorCategory::NetworkError);
    let id = h.add_automation(config());
    let receipt = h.trigger(id).await;

    let leased = h
        .queue
        .lease(QueueName::Run, "w", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    let QueueJob::Run(run_job) = leased.job else {
        panic!("expected a run job");
    };
    h.processor.process_run(&run_job).await.unwrap();

    let leased = h
        .queue
        .lease(QueueName::Send, "w", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    let QueueJob::Send(send) = &leased.job else {
        panic!("expected a send job");
    };

    let early = h.worker.send_one(leased.id, 0, send, 1, 3).await;
    assert!(matches!(early, SendOutcome::RetryLater(_)));
    assert_eq!(h.run(receipt.run_id).await.fail_count, 0);

    let last = h.worker.send_one(leased.id, 0, send, 3, 3).await;
    match last {
        SendOutcome::Failed(e) => assert_eq!(e.category, ErrorCategory::NetworkError),
        other => panic!("unexpected {other:?}"),
    }
    let run = h.run(receipt.run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_counts.get("NETWORK_ERROR"), Some(&1));
}
