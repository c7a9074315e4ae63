use std::sync::Arc;
use tracing::{info, warn};

use mailflow::config::{BackendKind, Config, ProviderKind};
use mailflow::datasource::{DataSource, MemoryDataSource, PgDataSource};
use mailflow::db;
use mailflow::files::{FileStore, LocalFileStore};
use mailflow::jobs::{JobQueue, MemoryQueue, PgQueue};
use mailflow::limiter::{PgSendGate, SendGate, SlidingWindowGate};
use mailflow::provider::{EmailProvider, LogProvider, SesProvider};
use mailflow::store::{CampaignStore, MemoryStore, PgStore};

const SEND_GATE_NAME: &str = "provider-send";

/// Every external collaborator, chosen once from config.
pub struct Backends {
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn CampaignStore>,
    pub datasource: Arc<dyn DataSource>,
    pub files: Arc<dyn FileStore>,
    pub provider: Arc<dyn EmailProvider>,
    pub gate: Arc<dyn SendGate>,
    /// Effective sends per second after the provider quota cap.
    pub send_rate: u32,
}

pub async fn build(cfg: &Config) -> anyhow::Result<Backends> {
    let pool = match &cfg.database_url {
        Some(url) => {
            let pool = db::make_pool(url).await?;
            if cfg.migrate_on_startup {
                db::run_migrations(&pool).await?;
                info!("migrations applied");
            }
            Some(pool)
        }
        None => None,
    };

    let (queue, store): (Arc<dyn JobQueue>, Arc<dyn CampaignStore>) = match (cfg.backend, &pool) {
        (BackendKind::Postgres, Some(pool)) => (
            Arc::new(PgQueue::new(pool.clone())),
            Arc::new(PgStore::new(pool.clone())),
        ),
        (BackendKind::Postgres, None) => anyhow::bail!("postgres backend needs a database url"),
        (BackendKind::Memory, _) => (Arc::new(MemoryQueue::new()), Arc::new(MemoryStore::new())),
    };

    // Recipient data lives in Postgres whenever a database is configured.
    let datasource: Arc<dyn DataSource> = match &pool {
        Some(pool) => Arc::new(PgDataSource::new(pool.clone())),
        None => Arc::new(MemoryDataSource::new()),
    };

    let provider: Arc<dyn EmailProvider> = match cfg.provider {
        ProviderKind::Log => Arc::new(LogProvider),
        ProviderKind::Ses => Arc::new(SesProvider::from_env().await),
    };

    let send_rate = capped_rate(cfg.send_rate_per_sec, provider.as_ref()).await;

    let gate: Arc<dyn SendGate> = match (&pool, cfg.distributed_send_gate) {
        (Some(pool), true) => Arc::new(PgSendGate::new(pool.clone(), SEND_GATE_NAME, send_rate)),
        _ => Arc::new(SlidingWindowGate::new(send_rate)),
    };

    Ok(Backends {
        queue,
        store,
        datasource,
        files: Arc::new(LocalFileStore::new(&cfg.file_root)),
        provider,
        gate,
        send_rate,
    })
}

/// Never exceed the provider's own per-second limit.
async fn capped_rate(configured: u32, provider: &dyn EmailProvider) -> u32 {
    match provider.quota().await {
        Ok(q) if q.max_send_rate >= 1.0 && (q.max_send_rate as u32) < configured => {
            warn!(
                configured,
                provider_limit = q.max_send_rate,
                "send rate capped by provider quota"
            );
            q.max_send_rate as u32
        }
        Ok(_) => configured,
        Err(e) => {
            warn!(error = %e, "provider quota unavailable, using configured send rate");
            configured
        }
    }
}
