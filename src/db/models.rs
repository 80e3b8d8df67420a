use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Entitlement tier. Exactly one applies to a user at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Trial,
    Free,
    Premium,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: String,
    pub language_code: String,

    // Learning settings
    pub hsk_level: i64,
    pub speech_speed: String,
    pub current_topic: String,

    // Subscription record
    pub tier: Tier,
    pub trial_started_at: Option<DateTime<Utc>>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub premium_expires_at: Option<DateTime<Utc>>,
    pub trial_notified: bool,
    /// True when no premium-expiry notice is pending. Defaults to true at
    /// registration; every grant resets it to false.
    pub premium_expired_notified: bool,

    // Referral
    pub referrer_id: Option<i64>,
    pub referral_code: String,

    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub user_id: i64,
    pub role: String,
    pub content: String,
    pub pinyin: Option<String>,
    pub translation: Option<String>,
    pub explanation: Option<String>,
    pub topic: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One row per (user, calendar day, channel). Absence means zero.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UsageCounter {
    pub user_id: i64,
    pub day: NaiveDate,
    pub channel: String,
    pub count: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Referral {
    pub id: i64,
    pub referrer_id: i64,
    pub referred_id: i64,
    /// "registered" until the referred user's first qualifying payment,
    /// then "subscribed".
    pub status: String,
    pub bonus_days_given: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Payment {
    pub id: i64,
    /// Idempotency key from the payment provider.
    pub event_id: String,
    pub user_id: i64,
    pub amount: i64,
    pub currency: String,
    pub days_granted: i64,
    pub source: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SavedWord {
    pub id: i64,
    pub user_id: i64,
    pub word: String,
    pub pinyin: Option<String>,
    pub translation: Option<String>,
    pub created_at: DateTime<Utc>,
}
