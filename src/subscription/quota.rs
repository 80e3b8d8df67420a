use chrono::{Local, NaiveDate};

use crate::db::{models::Tier, Database};

use super::{LedgerError, SubscriptionLedger};

/// Quota-consuming action kinds. `Text` and `Voice` count per calendar day;
/// `Vocab` is a cumulative cap across all days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageChannel {
    Text,
    Voice,
    Vocab,
}

impl UsageChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            UsageChannel::Text => "text",
            UsageChannel::Voice => "voice",
            UsageChannel::Vocab => "vocab",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QuotaLimits {
    pub text_per_day: i64,
    pub voice_per_day: i64,
    pub vocab_total: i64,
}

/// Decides, synchronously and cheaply, whether a user may perform a
/// quota-consuming action right now. Premium and active trial are unlimited;
/// free-tier users are checked against today's counters.
#[derive(Clone)]
pub struct QuotaEnforcer {
    db: Database,
    ledger: SubscriptionLedger,
    limits: QuotaLimits,
}

impl QuotaEnforcer {
    pub fn new(db: Database, ledger: SubscriptionLedger, limits: QuotaLimits) -> Self {
        Self { db, ledger, limits }
    }

    pub fn limit_for(&self, channel: UsageChannel) -> i64 {
        match channel {
            UsageChannel::Text => self.limits.text_per_day,
            UsageChannel::Voice => self.limits.voice_per_day,
            UsageChannel::Vocab => self.limits.vocab_total,
        }
    }

    /// May this user perform `channel` now? Fails closed: an unreachable
    /// ledger or counter store denies the action rather than allowing
    /// unlimited use.
    pub async fn check_allowed(&self, user_id: i64, channel: UsageChannel) -> bool {
        self.check_allowed_on(user_id, channel, Local::now().date_naive())
            .await
    }

    pub async fn check_allowed_on(
        &self,
        user_id: i64,
        channel: UsageChannel,
        day: NaiveDate,
    ) -> bool {
        let state = match self.ledger.get_state(user_id).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("quota check for user {user_id} failed, denying: {e}");
                return false;
            }
        };
        if matches!(state.tier, Tier::Premium | Tier::Trial) {
            return true;
        }
        match self.used(user_id, channel, day).await {
            Ok(used) => used < self.limit_for(channel),
            Err(e) => {
                tracing::warn!("usage lookup for user {user_id} failed, denying: {e}");
                false
            }
        }
    }

    /// Increment today's counter. Call only after the action actually
    /// completed, so failed AI calls are not charged.
    pub async fn record_usage(&self, user_id: i64, channel: UsageChannel) -> Result<(), LedgerError> {
        self.record_usage_on(user_id, channel, Local::now().date_naive())
            .await
    }

    pub async fn record_usage_on(
        &self,
        user_id: i64,
        channel: UsageChannel,
        day: NaiveDate,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO usage_counters (user_id, day, channel, count) VALUES (?1, ?2, ?3, 1) \
             ON CONFLICT (user_id, day, channel) DO UPDATE SET count = count + 1",
        )
        .bind(user_id)
        .bind(day)
        .bind(channel.as_str())
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    /// Today's (text, voice) counters, for the profile card.
    pub async fn usage_today(&self, user_id: i64) -> Result<(i64, i64), LedgerError> {
        let today = Local::now().date_naive();
        let text = self.used(user_id, UsageChannel::Text, today).await?;
        let voice = self.used(user_id, UsageChannel::Voice, today).await?;
        Ok((text, voice))
    }

    async fn used(
        &self,
        user_id: i64,
        channel: UsageChannel,
        day: NaiveDate,
    ) -> Result<i64, sqlx::Error> {
        let row: (i64,) = match channel {
            // Cumulative cap: sum across all days.
            UsageChannel::Vocab => {
                sqlx::query_as(
                    "SELECT COALESCE(SUM(count), 0) FROM usage_counters \
                     WHERE user_id = ?1 AND channel = ?2",
                )
                .bind(user_id)
                .bind(channel.as_str())
                .fetch_one(&self.db.pool)
                .await?
            }
            // Daily counters: absence of today's row means zero.
            _ => {
                sqlx::query_as(
                    "SELECT COALESCE(SUM(count), 0) FROM usage_counters \
                     WHERE user_id = ?1 AND day = ?2 AND channel = ?3",
                )
                .bind(user_id)
                .bind(day)
                .bind(channel.as_str())
                .fetch_one(&self.db.pool)
                .await?
            }
        };
        Ok(row.0)
    }
}
