use rand::Rng;
use std::time::Duration;

use super::model::QueueName;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: i32,
    pub base_seconds: i64,
    pub max_seconds: i64,
    pub jitter_pct: f64,
}

impl RetryConfig {
    /// Run expansion: 3 attempts, 5s then 10s.
    pub fn run_queue() -> Self {
        Self {
            max_attempts: 3,
            base_seconds: 5,
            max_seconds: 5 * 60,
            jitter_pct: 0.0,
        }
    }

    /// Single sends: 3 attempts, 2s then 4s.
    pub fn send_queue() -> Self {
        Self {
            max_attempts: 3,
            base_seconds: 2,
            max_seconds: 60,
            jitter_pct: 0.0,
        }
    }

    pub fn for_queue(queue: QueueName) -> Self {
        match queue {
            QueueName::Run => Self::run_queue(),
            QueueName::Send => Self::send_queue(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
}

/// Delay before the attempt following `attempt_no`: `base * 2^(attempt_no-1)`,
/// capped, then jittered by up to `jitter_pct` either way.
pub fn next_delay_seconds(attempt_no: i32, cfg: &RetryConfig, rng: &mut impl Rng) -> i64 {
    let exp = (attempt_no.max(1) as u32).saturating_sub(1);
    let pow2 = 1_i64.checked_shl(exp).unwrap_or(i64::MAX);

    let delay = cfg.base_seconds.saturating_mul(pow2).min(cfg.max_seconds);

    if cfg.jitter_pct <= 0.0 {
        return delay;
    }

    let jitter_range = (delay as f64) * cfg.jitter_pct;
    let jitter = rng.gen_range(-jitter_range..=jitter_range);
    ((delay as f64 + jitter).round() as i64).clamp(0, cfg.max_seconds)
}

pub fn next_delay(attempt_no: i32, cfg: &RetryConfig, rng: &mut impl Rng) -> Duration {
    Duration::from_secs(next_delay_seconds(attempt_no, cfg, rng).max(0) as u64)
}
