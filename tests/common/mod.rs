#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use laoshi_bot::db::{models::User, Database};
use laoshi_bot::notify::{Notice, Notifier};
use laoshi_bot::subscription::{ExpirySweeper, QuotaEnforcer, QuotaLimits, SubscriptionLedger};

pub const TRIAL_DAYS: i64 = 3;
pub const REFERRAL_BONUS_DAYS: i64 = 30;

pub const TEXT_LIMIT: i64 = 20;
pub const VOICE_LIMIT: i64 = 5;
pub const VOCAB_LIMIT: i64 = 50;

pub async fn test_db() -> Database {
    let db = Database::in_memory().await.expect("in-memory database");
    db.run_migrations().await.expect("migrations");
    db
}

pub fn ledger(db: &Database) -> SubscriptionLedger {
    SubscriptionLedger::new(db.clone(), TRIAL_DAYS, REFERRAL_BONUS_DAYS)
}

pub fn quota(db: &Database) -> QuotaEnforcer {
    QuotaEnforcer::new(
        db.clone(),
        ledger(db),
        QuotaLimits {
            text_per_day: TEXT_LIMIT,
            voice_per_day: VOICE_LIMIT,
            vocab_total: VOCAB_LIMIT,
        },
    )
}

pub fn sweeper(db: &Database, notifier: Arc<RecordingNotifier>) -> ExpirySweeper {
    ExpirySweeper::new(
        db.clone(),
        ledger(db),
        notifier,
        StdDuration::from_secs(3600),
    )
}

pub async fn register_user(db: &Database, user_id: i64) -> User {
    db.ensure_user(user_id, Some("testuser"), "Test", Some("ru"))
        .await
        .expect("user registration")
}

pub async fn fetch_user(db: &Database, user_id: i64) -> User {
    db.get_user(user_id)
        .await
        .expect("user lookup")
        .expect("user exists")
}

/// Shift a user's trial window into the past, as if registration happened
/// `days_ago` days ago.
pub async fn backdate_trial(db: &Database, user_id: i64, days_ago: i64) {
    let started = Utc::now() - Duration::days(days_ago);
    let ends = started + Duration::days(TRIAL_DAYS);
    sqlx::query("UPDATE users SET trial_started_at = ?2, trial_ends_at = ?3 WHERE id = ?1")
        .bind(user_id)
        .bind(started)
        .bind(ends)
        .execute(&db.pool)
        .await
        .expect("backdate trial");
}

pub async fn set_premium_until(db: &Database, user_id: i64, until: Option<DateTime<Utc>>) {
    sqlx::query("UPDATE users SET premium_expires_at = ?2 WHERE id = ?1")
        .bind(user_id)
        .bind(until)
        .execute(&db.pool)
        .await
        .expect("set premium expiry");
}

pub async fn payment_count(db: &Database, user_id: i64) -> i64 {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM payments WHERE user_id = ?1")
        .bind(user_id)
        .fetch_one(&db.pool)
        .await
        .expect("payment count");
    row.0
}

/// Timestamps a few seconds apart count as equal; test runs are not instant.
pub fn close_to(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    (a - b).num_seconds().abs() <= 5
}

/// Captures notifications instead of delivering them; can be told to fail
/// to exercise the sweeper's retry path.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(i64, Notice)>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent_to(&self, user_id: i64) -> Vec<Notice> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == user_id)
            .map(|(_, notice)| notice.clone())
            .collect()
    }

    pub fn total(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, user_id: i64, notice: Notice) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("delivery refused");
        }
        self.sent.lock().unwrap().push((user_id, notice));
        Ok(())
    }
}
