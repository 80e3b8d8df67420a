use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::db::{models, Database};
use crate::notify::{Notice, Notifier};

use super::SubscriptionLedger;

const SWEEP_PAGE_SIZE: i64 = 200;

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepStats {
    pub trials_expired: u64,
    pub premiums_expired: u64,
    pub failed: u64,
}

impl SweepStats {
    pub fn total(&self) -> u64 {
        self.trials_expired + self.premiums_expired + self.failed
    }
}

/// Converts elapsed entitlement windows into state transitions and
/// at-most-once notifications. Runs on a fixed interval; an overrunning
/// sweep skips the next tick instead of running concurrently with it.
pub struct ExpirySweeper {
    db: Database,
    ledger: SubscriptionLedger,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(
        db: Database,
        ledger: SubscriptionLedger,
        notifier: Arc<dyn Notifier>,
        interval: Duration,
    ) -> Self {
        Self {
            db,
            ledger,
            notifier,
            interval,
        }
    }

    /// Run until the stop signal fires.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        tracing::info!("expiry sweeper started (interval: {:?})", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = self.sweep_once(Utc::now()).await;
                    if stats.total() > 0 {
                        tracing::info!(
                            "sweep: {} trial expiries, {} premium expiries, {} failures",
                            stats.trials_expired, stats.premiums_expired, stats.failed,
                        );
                    }
                }
                _ = stop.changed() => {
                    tracing::info!("expiry sweeper stopping");
                    return;
                }
            }
        }
    }

    /// One full scan. Public so tests drive a sweep deterministically.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepStats {
        let mut stats = SweepStats::default();
        self.sweep_expired_trials(now, &mut stats).await;
        self.sweep_expired_premiums(now, &mut stats).await;
        stats
    }

    async fn sweep_expired_trials(&self, now: DateTime<Utc>, stats: &mut SweepStats) {
        let mut last_id = 0i64;
        loop {
            let page: Vec<models::User> = match sqlx::query_as(
                "SELECT * FROM users WHERE id > ?1 \
                   AND trial_notified = 0 \
                   AND trial_ends_at IS NOT NULL AND trial_ends_at <= ?2 \
                   AND (premium_expires_at IS NULL OR premium_expires_at <= ?2) \
                 ORDER BY id LIMIT ?3",
            )
            .bind(last_id)
            .bind(now)
            .bind(SWEEP_PAGE_SIZE)
            .fetch_all(&self.db.pool)
            .await
            {
                Ok(page) => page,
                Err(e) => {
                    tracing::error!("trial expiry scan failed: {e}");
                    stats.failed += 1;
                    return;
                }
            };
            let Some(last) = page.last() else { break };
            last_id = last.id;

            for user in &page {
                match self.expire_trial(user, now).await {
                    Ok(true) => stats.trials_expired += 1,
                    Ok(false) => {}
                    Err(e) => {
                        // Fault-isolated: this user retries next sweep.
                        tracing::warn!("trial expiry for user {} failed: {e}", user.id);
                        stats.failed += 1;
                    }
                }
            }
        }
    }

    async fn expire_trial(&self, user: &models::User, now: DateTime<Utc>) -> anyhow::Result<bool> {
        // The guard re-checks current state; a grant that landed after the
        // scan wins and the downgrade no-ops.
        if !self.ledger.downgrade_to_free(user.id, now).await? {
            return Ok(false);
        }
        // Flag is written only after delivery succeeds, so a failed send is
        // retried on the next sweep while the downgrade itself sticks.
        self.notifier.notify(user.id, Notice::TrialExpired).await?;
        sqlx::query("UPDATE users SET trial_notified = 1 WHERE id = ?1")
            .bind(user.id)
            .execute(&self.db.pool)
            .await?;
        Ok(true)
    }

    async fn sweep_expired_premiums(&self, now: DateTime<Utc>, stats: &mut SweepStats) {
        let mut last_id = 0i64;
        loop {
            // The NULL arm picks up records a prior sweep downgraded but
            // failed to flag, so the notice is retried.
            let page: Vec<models::User> = match sqlx::query_as(
                "SELECT * FROM users WHERE id > ?1 \
                   AND premium_expired_notified = 0 \
                   AND (premium_expires_at IS NULL OR premium_expires_at <= ?2) \
                 ORDER BY id LIMIT ?3",
            )
            .bind(last_id)
            .bind(now)
            .bind(SWEEP_PAGE_SIZE)
            .fetch_all(&self.db.pool)
            .await
            {
                Ok(page) => page,
                Err(e) => {
                    tracing::error!("premium expiry scan failed: {e}");
                    stats.failed += 1;
                    return;
                }
            };
            let Some(last) = page.last() else { break };
            last_id = last.id;

            for user in &page {
                match self.expire_premium(user, now).await {
                    Ok(true) => stats.premiums_expired += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!("premium expiry for user {} failed: {e}", user.id);
                        stats.failed += 1;
                    }
                }
            }
        }
    }

    async fn expire_premium(
        &self,
        user: &models::User,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        if !self.ledger.downgrade_to_free(user.id, now).await? {
            return Ok(false);
        }
        self.notifier.notify(user.id, Notice::PremiumExpired).await?;
        // Guarded so it cannot clobber the flag reset of a grant that landed
        // mid-sweep.
        sqlx::query(
            "UPDATE users SET premium_expired_notified = 1 \
             WHERE id = ?1 AND (premium_expires_at IS NULL OR premium_expires_at <= ?2)",
        )
        .bind(user.id)
        .bind(now)
        .execute(&self.db.pool)
        .await?;
        Ok(true)
    }
}
