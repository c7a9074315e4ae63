use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::model::QueueName;
use super::queue::JobQueue;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

pub fn days(n: i64) -> Duration {
    Duration::from_secs(n.max(0).unsigned_abs().saturating_mul(SECS_PER_DAY))
}

/// How long finished jobs stay in the queue tables.
#[derive(Debug, Clone)]
pub struct Retention {
    pub completed_for: Duration,
    pub failed_run_jobs: usize,
    pub failed_send_jobs: usize,
}

impl Retention {
    pub fn failed_cap(&self, queue: QueueName) -> usize {
        match queue {
            QueueName::Run => self.failed_run_jobs,
            QueueName::Send => self.failed_send_jobs,
        }
    }
}

/// One pass: old completed jobs, then failed jobs past each queue's cap.
pub async fn prune_once(queue: &dyn JobQueue, retention: &Retention) -> anyhow::Result<u64> {
    let mut removed = queue.prune_completed(retention.completed_for).await?;
    for q in [QueueName::Run, QueueName::Send] {
        let trimmed = queue.trim_failed(q, retention.failed_cap(q)).await?;
        if trimmed > 0 {
            info!(queue = %q, trimmed, "trimmed failed jobs");
        }
        removed += trimmed;
    }
    Ok(removed)
}

/// Runs `prune_once` every `every`.
pub async fn prune_loop(queue: Arc<dyn JobQueue>, retention: Retention, every: Duration) -> anyhow::Result<()> {
    loop {
        match prune_once(queue.as_ref(), &retention).await {
            Ok(n) if n > 0 => info!(pruned = n, "pruned queue jobs"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "prune failed"),
        }
        tokio::time::sleep(every).await;
    }
}
