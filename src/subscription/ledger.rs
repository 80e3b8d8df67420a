use chrono::{DateTime, Duration, Utc};

use crate::db::{models, Database};

use super::{LedgerError, SubscriptionState};

/// Result of a premium grant keyed by a payment event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GrantOutcome {
    Applied { expires_at: DateTime<Utc> },
    /// The event id was seen before; nothing changed. Webhook retries land here.
    AlreadyApplied,
}

/// A referral bonus that was just granted to a referrer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferralBonus {
    pub referrer_id: i64,
    pub days: i64,
}

/// Single source of truth for each user's entitlement tier and its temporal
/// bounds. All subscription mutations go through here; every read-then-write
/// is a single conditional UPDATE or one transaction, so a webhook grant and
/// a sweep downgrade cannot interleave mid-operation.
#[derive(Clone)]
pub struct SubscriptionLedger {
    db: Database,
    trial_days: i64,
    referral_bonus_days: i64,
}

impl SubscriptionLedger {
    pub fn new(db: Database, trial_days: i64, referral_bonus_days: i64) -> Self {
        Self {
            db,
            trial_days,
            referral_bonus_days,
        }
    }

    /// Effective tier from the stored temporal fields alone. The stored
    /// `tier` column may lag behind until the sweeper converges it; reads
    /// never depend on that.
    pub fn effective_state(user: &models::User, now: DateTime<Utc>) -> SubscriptionState {
        if let Some(until) = user.premium_expires_at {
            if until > now {
                return SubscriptionState {
                    tier: models::Tier::Premium,
                    expires_at: Some(until),
                    trial_remaining: None,
                };
            }
        }
        if let Some(trial_end) = user.trial_ends_at {
            if trial_end > now {
                return SubscriptionState {
                    tier: models::Tier::Trial,
                    expires_at: Some(trial_end),
                    trial_remaining: Some(trial_end - now),
                };
            }
        }
        SubscriptionState {
            tier: models::Tier::Free,
            expires_at: None,
            trial_remaining: None,
        }
    }

    pub async fn get_state(&self, user_id: i64) -> Result<SubscriptionState, LedgerError> {
        let user = self.fetch_user(user_id).await?;
        Ok(Self::effective_state(&user, Utc::now()))
    }

    /// Open the trial window. Idempotent: once a trial window exists it is
    /// never moved, so re-sending /start cannot renew a trial.
    pub async fn start_trial(&self, user_id: i64) -> Result<(), LedgerError> {
        let now = Utc::now();
        let ends_at = now + Duration::days(self.trial_days);
        let result = sqlx::query(
            "UPDATE users SET tier = 'trial', trial_started_at = ?2, trial_ends_at = ?3 \
             WHERE id = ?1 AND trial_started_at IS NULL",
        )
        .bind(user_id)
        .bind(now)
        .bind(ends_at)
        .execute(&self.db.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Either the trial already ran (fine) or the user is unknown.
            self.fetch_user(user_id).await?;
        }
        Ok(())
    }

    /// Grant `days` of premium, stacking onto an active window or starting a
    /// fresh one. `event_id` is the idempotency key: the payment row insert
    /// and the expiry update share one transaction, so a redelivered event
    /// short-circuits to `AlreadyApplied` without touching the expiry.
    pub async fn grant_premium(
        &self,
        user_id: i64,
        days: i64,
        event_id: &str,
        amount: i64,
        source: &str,
    ) -> Result<GrantOutcome, LedgerError> {
        let now = Utc::now();
        let mut tx = self.db.pool.begin().await?;

        let user: Option<models::User> = sqlx::query_as("SELECT * FROM users WHERE id = ?1")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
        let user = user.ok_or(LedgerError::NotFound(user_id))?;

        let inserted = sqlx::query(
            "INSERT INTO payments (event_id, user_id, amount, days_granted, source, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(event_id)
        .bind(user_id)
        .bind(amount)
        .bind(days)
        .bind(source)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(GrantOutcome::AlreadyApplied);
        }

        let base = user.premium_expires_at.filter(|until| *until > now).unwrap_or(now);
        let expires_at = base + Duration::days(days);

        sqlx::query(
            "UPDATE users SET tier = 'premium', premium_expires_at = ?2, \
             premium_expired_notified = 0 WHERE id = ?1",
        )
        .bind(user_id)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(GrantOutcome::Applied { expires_at })
    }

    /// Downgrade to the free tier. Guarded on the current temporal fields:
    /// a grant landing between the sweeper's scan and this call flips the
    /// guard and the downgrade no-ops. Returns whether a row was written.
    pub async fn downgrade_to_free(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            "UPDATE users SET tier = 'free', premium_expires_at = NULL \
             WHERE id = ?1 \
               AND (premium_expires_at IS NULL OR premium_expires_at <= ?2) \
               AND (trial_ends_at IS NULL OR trial_ends_at <= ?2)",
        )
        .bind(user_id)
        .bind(now)
        .execute(&self.db.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Grant the referrer their bonus when a referred user's first
    /// qualifying payment lands. The bonus grant reuses the payment's
    /// idempotency machinery under a derived event id, and the referral
    /// record's one-way `registered -> subscribed` flip keeps later
    /// payments by the same referred user from re-granting.
    pub async fn apply_referral_bonus(
        &self,
        referred_user_id: i64,
        event_id: &str,
    ) -> Result<Option<ReferralBonus>, LedgerError> {
        let referral: Option<models::Referral> =
            sqlx::query_as("SELECT * FROM referrals WHERE referred_id = ?1")
                .bind(referred_user_id)
                .fetch_optional(&self.db.pool)
                .await?;
        let Some(referral) = referral else {
            return Ok(None);
        };
        if referral.status != "registered" {
            return Ok(None);
        }

        let days = self.referral_bonus_days;
        let bonus_event = format!("{event_id}:referral-bonus");
        let outcome = self
            .grant_premium(referral.referrer_id, days, &bonus_event, 0, "referral_bonus")
            .await?;

        match outcome {
            GrantOutcome::Applied { .. } => {
                sqlx::query(
                    "UPDATE referrals SET status = 'subscribed', \
                     bonus_days_given = bonus_days_given + ?2 \
                     WHERE referred_id = ?1 AND status = 'registered'",
                )
                .bind(referred_user_id)
                .bind(days)
                .execute(&self.db.pool)
                .await?;
                Ok(Some(ReferralBonus {
                    referrer_id: referral.referrer_id,
                    days,
                }))
            }
            GrantOutcome::AlreadyApplied => {
                // Redelivery of the same event. Heal the flip in case a
                // crash landed between the grant and the status write.
                sqlx::query(
                    "UPDATE referrals SET status = 'subscribed' \
                     WHERE referred_id = ?1 AND status = 'registered'",
                )
                .bind(referred_user_id)
                .execute(&self.db.pool)
                .await?;
                Ok(None)
            }
        }
    }

    async fn fetch_user(&self, user_id: i64) -> Result<models::User, LedgerError> {
        let user: Option<models::User> = sqlx::query_as("SELECT * FROM users WHERE id = ?1")
            .bind(user_id)
            .fetch_optional(&self.db.pool)
            .await?;
        user.ok_or(LedgerError::NotFound(user_id))
    }
}
