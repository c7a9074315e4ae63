use mailflow::api;
use mailflow::config;
use mailflow::jobs::maintenance::{days, prune_loop, Retention};
use mailflow::jobs::{Consumer, ConsumerConfig, JobRunner, QueueName, RetryConfig};
use mailflow::processor::{JobProcessor, RunJobHandler};
use mailflow::scheduler::{self, Scheduler};
use mailflow::sender::{SendJobHandler, SendWorker};
use mailflow::telemetry;
use mailflow::template::TemplateEngine;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

mod backends;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();
    let cfg = config::Config::from_env()?;
    let b = backends::build(&cfg).await?;

    info!(
        worker_id = %cfg.worker_id,
        backend = ?cfg.backend,
        provider = b.provider.name(),
        send_rate = b.send_rate,
        max_parallel_runs = cfg.max_parallel_runs,
        batch_size = cfg.batch_size,
        scheduler_enabled = cfg.scheduler_enabled,
        scheduler_interval_secs = cfg.scheduler_interval_secs,
        api = cfg.admin_addr.as_deref().unwrap_or("disabled"),
        "mailflow worker starting"
    );

    let scheduler = Scheduler::new(b.store.clone(), b.queue.clone());
    let scheduler_running = Arc::new(AtomicBool::new(false));

    // ---- Run-queue consumer ----
    let processor = Arc::new(
        JobProcessor::new(
            b.store.clone(),
            b.queue.clone(),
            b.datasource.clone(),
            b.files.clone(),
        )
        .with_batch_size(cfg.batch_size),
    );
    let run_consumer = Consumer::new(
        b.queue.clone(),
        JobRunner::new(b.queue.clone(), RetryConfig::for_queue(QueueName::Run)),
        Arc::new(RunJobHandler::new(processor, b.store.clone())),
        ConsumerConfig {
            lease: cfg.lease(),
            ..ConsumerConfig::new(QueueName::Run, cfg.worker_id.clone(), cfg.max_parallel_runs)
        },
    );

    // ---- Send-queue consumer, one slot per permitted send per second ----
    let send_worker = Arc::new(
        SendWorker::new(
            b.store.clone(),
            b.provider.clone(),
            b.files.clone(),
            b.datasource.clone(),
            b.gate.clone(),
        )
        .with_timeout(cfg.provider_timeout()),
    );
    let send_consumer = Consumer::new(
        b.queue.clone(),
        JobRunner::new(b.queue.clone(), RetryConfig::for_queue(QueueName::Send)),
        Arc::new(SendJobHandler::new(send_worker)),
        ConsumerConfig {
            lease: cfg.lease(),
            ..ConsumerConfig::new(QueueName::Send, cfg.worker_id.clone(), b.send_rate as usize)
        },
    );

    // ---- API task ----
    let app = api::router(api::ApiState {
        scheduler: scheduler.clone(),
        queue: b.queue.clone(),
        store: b.store.clone(),
        provider: b.provider.clone(),
        templates: TemplateEngine::new(),
        scheduler_running: scheduler_running.clone(),
        scheduler_enabled: cfg.scheduler_enabled,
    });
    let api_addr = cfg.admin_addr.clone();
    let api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!(%addr, "api listening");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    // ---- Scheduler task ----
    let scheduler_handle = {
        let interval = cfg.scheduler_interval();
        let enabled = cfg.scheduler_enabled;
        tokio::spawn(async move {
            if enabled {
                scheduler::run_loop(scheduler, interval, scheduler_running).await
            } else {
                info!("scheduler disabled");
                std::future::pending::<anyhow::Result<()>>().await
            }
        })
    };

    // ---- Maintenance task ----
    let maintenance_handle = tokio::spawn(prune_loop(
        b.queue.clone(),
        Retention {
            completed_for: days(cfg.prune_completed_after_days),
            failed_run_jobs: cfg.keep_failed_run_jobs,
            failed_send_jobs: cfg.keep_failed_send_jobs,
        },
        Duration::from_secs(cfg.maintenance_interval_secs),
    ));

    let run_handle = tokio::spawn(run_consumer.run());
    let send_handle = tokio::spawn(send_consumer.run());

    tokio::select! {
        res = api_handle => res??,
        res = scheduler_handle => res??,
        res = run_handle => res??,
        res = send_handle => res??,
        res = maintenance_handle => res??,
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }

    Ok(())
}
