use anyhow::Context;
use std::env;
use std::sync::Arc;
use uuid::Uuid;

use mailflow::db::{make_pool, run_migrations};
use mailflow::jobs::{JobQueue, PgQueue, QueueName, TriggerSource};
use mailflow::scheduler::Scheduler;
use mailflow::store::{CampaignStore, PgStore};
use mailflow::template::TemplateEngine;

const USAGE: &str = "mailflowctl <command>\n\
     Commands:\n\
     - migrate\n\
     - trigger <automation_id>\n\
     - status\n\
     - failed [automation_id]\n\
     - retry <job_id>\n\
     - retry-all [automation_id]\n\
     - preview <template_file>\n\
     - run <run_id>\n\
     \n\
     Uses MAILFLOW_DATABASE_URL or DATABASE_URL.\n";

fn usage() -> ! {
    eprintln!("{USAGE}");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args: Vec<String> = env::args().collect();
    let Some(command) = args.get(1).map(String::as_str) else {
        usage();
    };

    // Needs no database.
    if command == "preview" {
        let path = args.get(2).unwrap_or_else(|| usage());
        return preview(path);
    }

    let url = env::var("MAILFLOW_DATABASE_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .context("MAILFLOW_DATABASE_URL or DATABASE_URL must be set")?;
    let pool = make_pool(&url).await?;

    let queue: Arc<dyn JobQueue> = Arc::new(PgQueue::new(pool.clone()));
    let store: Arc<dyn CampaignStore> = Arc::new(PgStore::new(pool.clone()));

    match command {
        "migrate" => {
            run_migrations(&pool).await?;
            println!("migrations applied");
        }
        "trigger" => {
            let id: i64 = args.get(2).unwrap_or_else(|| usage()).parse()?;
            let receipt = Scheduler::new(store, queue)
                .trigger_manual(id, TriggerSource::Manual)
                .await?;
            println!("run_id={} job_id={}", receipt.run_id, receipt.job_id);
        }
        "status" => {
            for q in [QueueName::Run, QueueName::Send] {
                let c = queue.counts(q).await?;
                println!(
                    "{q}: waiting={} active={} delayed={} completed={} failed={}",
                    c.waiting, c.active, c.delayed, c.completed, c.failed
                );
            }
        }
        "failed" => {
            let automation_id = optional_id(args.get(2))?;
            let failed = queue.list_failed(QueueName::Send, automation_id).await?;
            for f in &failed {
                println!(
                    "{} automation={} attempts={} replay={} reason={} error={}: {}",
                    f.id,
                    f.automation_id,
                    f.attempts,
                    f.replay,
                    f.reason_code.as_deref().unwrap_or("-"),
                    f.error_code.as_deref().unwrap_or("-"),
                    f.error_message.as_deref().unwrap_or("")
                );
            }
            println!("{} failed send job(s)", failed.len());
        }
        "retry" => {
            let job_id: Uuid = args.get(2).unwrap_or_else(|| usage()).parse()?;
            if queue.retry_failed(job_id).await? {
                println!("re-submitted {job_id}");
            } else {
                anyhow::bail!("job {job_id} is not in the failed set");
            }
        }
        "retry-all" => {
            let automation_id = optional_id(args.get(2))?;
            let n = queue.retry_all_failed(QueueName::Send, automation_id).await?;
            println!("re-submitted {n} job(s)");
        }
        "run" => {
            let run_id: Uuid = args.get(2).unwrap_or_else(|| usage()).parse()?;
            print_run(store.as_ref(), run_id).await?;
        }
        other => {
            eprintln!("Unknown command: {other}");
            usage();
        }
    }

    Ok(())
}

fn optional_id(arg: Option<&String>) -> anyhow::Result<Option<i64>> {
    arg.map(|s| s.parse::<i64>().context("automation_id must be an integer"))
        .transpose()
}

fn preview(path: &str) -> anyhow::Result<()> {
    let template = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let engine = TemplateEngine::new();

    let variables: Vec<String> = engine.extract_variables(&template).into_iter().collect();
    println!("variables: {}", variables.join(", "));
    println!("---");
    println!("{}", engine.preview(&template, None)?);
    Ok(())
}

async fn print_run(store: &dyn CampaignStore, run_id: Uuid) -> anyhow::Result<()> {
    let run = store
        .get_run(run_id)
        .await?
        .with_context(|| format!("run {run_id} not found"))?;

    println!(
        "RUN: id={} automation={} status={} total={} queued={} success={} fail={} started={} ended={:?}",
        run.id,
        run.automation_id,
        run.status,
        run.total_target,
        run.queued_count,
        run.success_count,
        run.fail_count,
        run.started_at.to_rfc3339(),
        run.ended_at.map(|t| t.to_rfc3339())
    );
    for (category, n) in &run.error_counts {
        println!("  {category}: {n}");
    }
    if let Some(msg) = &run.message {
        println!("  message: {msg}");
    }

    for r in store.list_send_records(run_id).await? {
        println!(
            "{} | {} | {} | {} | {}",
            r.created_at.to_rfc3339(),
            r.status.as_str(),
            r.recipient,
            r.error_category.map(|c| c.as_str()).unwrap_or("-"),
            r.provider_message_id
                .as_deref()
                .or(r.error_message.as_deref())
                .unwrap_or("")
        );
    }
    Ok(())
}
