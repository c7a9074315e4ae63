// Config is a central place for runtime configuration.
// Everything is read from the environment once, at process start.

use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Postgres,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderKind {
    Log,
    Ses,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: Option<String>,
    pub backend: BackendKind,
    pub provider: ProviderKind,
    pub worker_id: String,
    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,

    pub scheduler_enabled: bool,
    pub scheduler_interval_secs: u64,

    pub max_parallel_runs: usize,
    pub send_rate_per_sec: u32,
    pub distributed_send_gate: bool,
    pub batch_size: usize,
    pub lease_seconds: i64,
    pub provider_timeout_secs: u64,

    pub file_root: String,

    pub prune_completed_after_days: i64,
    /// Newest failed jobs kept per queue; older ones are deleted.
    pub keep_failed_run_jobs: usize,
    pub keep_failed_send_jobs: usize,
    pub maintenance_interval_secs: u64,
}

/// Ticks faster than this are not supported; schedules have minute granularity.
pub const MIN_SCHEDULER_INTERVAL_SECS: u64 = 30;

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let backend = match env_or_fallback("MAILFLOW_BACKEND", "QUEUE_BACKEND")
            .map(|s| s.to_lowercase())
            .as_deref()
        {
            None | Some("postgres") | Some("pg") => BackendKind::Postgres,
            Some("memory") | Some("mem") => BackendKind::Memory,
            Some(other) => anyhow::bail!("unknown MAILFLOW_BACKEND: {other}"),
        };

        let database_url = env_or_fallback("MAILFLOW_DATABASE_URL", "DATABASE_URL");
        if backend == BackendKind::Postgres && database_url.is_none() {
            anyhow::bail!("DATABASE_URL is missing (required by the postgres backend)");
        }

        let provider = match env_or_fallback("MAILFLOW_PROVIDER", "EMAIL_PROVIDER")
            .map(|s| s.to_lowercase())
            .as_deref()
        {
            None | Some("log") | Some("dev") => ProviderKind::Log,
            Some("ses") => ProviderKind::Ses,
            Some(other) => anyhow::bail!("unknown MAILFLOW_PROVIDER: {other}"),
        };

        let worker_id = env_or_fallback("MAILFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker-1".to_string());

        let admin_addr = env_or_fallback("MAILFLOW_ADMIN_ADDR", "ADMIN_ADDR")
            .and_then(|s| normalize_optional_addr(&s))
            .or_else(|| {
                env_or_fallback("MAILFLOW_TRIGGER_PORT", "MANUAL_TRIGGER_PORT")
                    .map(|port| format!("0.0.0.0:{port}"))
            });

        let migrate_on_startup = env_bool("MAILFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);

        let scheduler_enabled = env_bool("MAILFLOW_SCHEDULER_ENABLED")
            .or_else(|| env_bool("SCHEDULER_ENABLED"))
            .unwrap_or(true);

        // SCHEDULER_INTERVAL is expressed in milliseconds.
        let scheduler_interval_secs = env_parse::<u64>("MAILFLOW_SCHEDULER_INTERVAL_SECS")
            .or_else(|| env_parse::<u64>("SCHEDULER_INTERVAL").map(|ms| ms / 1000))
            .unwrap_or(60)
            .max(MIN_SCHEDULER_INTERVAL_SECS);

        let max_parallel_runs = env_or_fallback("MAILFLOW_MAX_PARALLEL_RUNS", "MAX_PARALLEL_JOBS")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(5)
            .max(1);

        let send_rate_per_sec = env_or_fallback("MAILFLOW_SEND_RATE", "SES_RATE_LIMIT")
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(14)
            .max(1);

        let distributed_send_gate = env_bool("MAILFLOW_DISTRIBUTED_SEND_GATE")
            .unwrap_or(backend == BackendKind::Postgres);

        let batch_size = env_or_fallback("MAILFLOW_BATCH_SIZE", "BATCH_SIZE")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(100)
            .max(1);

        let lease_seconds = env_or_fallback("MAILFLOW_LEASE_SECONDS", "LEASE_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(120);

        let provider_timeout_secs = env_parse::<u64>("MAILFLOW_PROVIDER_TIMEOUT_SECS")
            .unwrap_or(30)
            .max(1);

        let file_root = env_or_fallback("MAILFLOW_FILE_ROOT", "FILE_ROOT_PATH")
            .unwrap_or_else(|| "./files".to_string());

        let prune_completed_after_days =
            env_parse::<i64>("MAILFLOW_PRUNE_COMPLETED_AFTER_DAYS").unwrap_or(7);
        let keep_failed_run_jobs =
            env_parse::<usize>("MAILFLOW_KEEP_FAILED_RUN_JOBS").unwrap_or(5_000);
        let keep_failed_send_jobs =
            env_parse::<usize>("MAILFLOW_KEEP_FAILED_SEND_JOBS").unwrap_or(50_000);
        let maintenance_interval_secs =
            env_parse::<u64>("MAILFLOW_MAINTENANCE_INTERVAL_SECS").unwrap_or(300);

        Ok(Self {
            database_url,
            backend,
            provider,
            worker_id,
            admin_addr,
            migrate_on_startup,
            scheduler_enabled,
            scheduler_interval_secs,
            max_parallel_runs,
            send_rate_per_sec,
            distributed_send_gate,
            batch_size,
            lease_seconds,
            provider_timeout_secs,
            file_root,
            prune_completed_after_days,
            keep_failed_run_jobs,
            keep_failed_send_jobs,
            maintenance_interval_secs,
        })
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds.max(1) as u64)
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
