//! Admission gate for provider calls.
//!
//! A permit is held for the whole provider call and keeps counting for one
//! second after it is released. At most `rate` permits are live at once, so
//! neither starts nor completions exceed `rate` in any sliding one-second
//! window, whatever the provider latency.

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

const WINDOW: Duration = Duration::from_secs(1);

/// A permit that is never released (crashed task, lost process) is dropped
/// from the window after this long.
pub const MAX_HOLD: Duration = Duration::from_secs(300);

/// Claim on one send slot. Hand it back with [`SendGate::release`] once the
/// provider call has finished, whatever its result.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a permit must be released after the provider call"]
pub struct SendPermit {
    id: Uuid,
}

impl SendPermit {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

#[async_trait]
pub trait SendGate: Send + Sync {
    /// Waits until a send may start, then claims the slot.
    async fn acquire(&self) -> anyhow::Result<SendPermit>;

    /// Stamps the completion time; the slot frees one window later.
    async fn release(&self, permit: SendPermit) -> anyhow::Result<()>;
}

struct Slot {
    id: Uuid,
    granted_at: Instant,
    finished_at: Option<Instant>,
}

impl Slot {
    fn frees_at(&self) -> Instant {
        match self.finished_at {
            Some(done) => done + WINDOW,
            None => self.granted_at + MAX_HOLD,
        }
    }
}

/// Process-local sliding window.
pub struct SlidingWindowGate {
    rate: usize,
    slots: Mutex<Vec<Slot>>,
    released: Notify,
}

impl SlidingWindowGate {
    pub fn new(rate: u32) -> Self {
        let rate = rate.max(1) as usize;
        Self {
            rate,
            slots: Mutex::new(Vec::with_capacity(rate)),
            released: Notify::new(),
        }
    }

    /// The claimed permit, otherwise how long until the next slot frees.
    fn try_claim(&self) -> Result<SendPermit, Duration> {
        let mut slots = self.slots.lock();
        let now = Instant::now();
        slots.retain(|s| s.frees_at() > now);

        if slots.len() < self.rate {
            let id = Uuid::new_v4();
            slots.push(Slot {
                id,
                granted_at: now,
                finished_at: None,
            });
            return Ok(SendPermit { id });
        }

        let next = slots.iter().map(Slot::frees_at).min().unwrap_or(now);
        Err(next.saturating_duration_since(now))
    }

    /// Live permits, in flight or finished within the last window.
    pub fn live(&self) -> usize {
        let now = Instant::now();
        self.slots.lock().iter().filter(|s| s.frees_at() > now).count()
    }
}

#[async_trait]
impl SendGate for SlidingWindowGate {
    async fn acquire(&self) -> anyhow::Result<SendPermit> {
        loop {
            // Registered before the check so a release in between is not missed.
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            match self.try_claim() {
                Ok(permit) => return Ok(permit),
                Err(wait) => {
                    tokio::select! {
                        _ = released => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    async fn release(&self, permit: SendPermit) -> anyhow::Result<()> {
        let found = {
            let mut slots = self.slots.lock();
            match slots.iter_mut().find(|s| s.id == permit.id) {
                Some(slot) => {
                    slot.finished_at = Some(Instant::now());
                    true
                }
                None => false,
            }
        };
        if !found {
            warn!(permit = %permit.id, "released a permit that already expired");
        }
        self.released.notify_waiters();
        Ok(())
    }
}

/// Sliding window shared by every worker process through Postgres.
///
/// Permits are rows in `send_permits`; a transaction-scoped advisory lock on
/// the gate name serializes the count-and-insert step.
pub struct PgSendGate {
    pool: PgPool,
    gate: String,
    rate: i64,
}

const MIN_POLL: Duration = Duration::from_millis(5);
// In-flight permits of other processes are released without notice.
const MAX_POLL: Duration = Duration::from_millis(100);

impl PgSendGate {
    pub fn new(pool: PgPool, gate: impl Into<String>, rate: u32) -> Self {
        Self {
            pool,
            gate: gate.into(),
            rate: i64::from(rate.max(1)),
        }
    }

    async fn try_claim(&self) -> anyhow::Result<Result<SendPermit, Duration>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&self.gate)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            DELETE FROM send_permits
            WHERE gate = $1
              AND (
                (finished_at IS NOT NULL AND finished_at <= clock_timestamp() - interval '1 second')
                OR granted_at <= clock_timestamp() - ($2::float8 * interval '1 second')
              )
            "#,
        )
        .bind(&self.gate)
        .bind(MAX_HOLD.as_secs_f64())
        .execute(&mut *tx)
        .await?;

        let (live, wait_secs): (i64, Option<f64>) = sqlx::query_as(
            r#"
            SELECT count(*)::bigint,
                   EXTRACT(EPOCH FROM (
                       min(COALESCE(
                           finished_at + interval '1 second',
                           granted_at + ($2::float8 * interval '1 second')
                       )) - clock_timestamp()
                   ))::float8
            FROM send_permits
            WHERE gate = $1
            "#,
        )
        .bind(&self.gate)
        .bind(MAX_HOLD.as_secs_f64())
        .fetch_one(&mut *tx)
        .await?;

        if live < self.rate {
            let id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO send_permits (id, gate, granted_at) VALUES ($1, $2, clock_timestamp())",
            )
            .bind(id)
            .bind(&self.gate)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(Ok(SendPermit { id }));
        }

        tx.commit().await?;
        let wait = Duration::from_secs_f64(wait_secs.unwrap_or(0.0).max(0.0));
        Ok(Err(wait.clamp(MIN_POLL, MAX_POLL)))
    }
}

#[async_trait]
impl SendGate for PgSendGate {
    async fn acquire(&self) -> anyhow::Result<SendPermit> {
        loop {
            match self.try_claim().await? {
                Ok(permit) => return Ok(permit),
                Err(wait) => {
                    debug!(gate = %self.gate, wait_ms = wait.as_millis() as u64, "send gate full");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    async fn release(&self, permit: SendPermit) -> anyhow::Result<()> {
        sqlx::query("UPDATE send_permits SET finished_at = clock_timestamp() WHERE id = $1")
            .bind(permit.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
