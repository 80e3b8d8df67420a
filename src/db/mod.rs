pub mod models;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

#[derive(Debug, Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

/// Aggregate numbers for the admin /stats card.
#[derive(Debug, Clone, Copy)]
pub struct BotStats {
    pub total_users: i64,
    pub premium_users: i64,
    pub messages_today: i64,
    pub revenue_30d: i64,
}

impl Database {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// In-memory database for tests. A single connection keeps every query
    /// on the same SQLite instance.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                username TEXT,
                first_name TEXT NOT NULL DEFAULT '',
                language_code TEXT NOT NULL DEFAULT 'ru',
                hsk_level INTEGER NOT NULL DEFAULT 1,
                speech_speed TEXT NOT NULL DEFAULT 'normal',
                current_topic TEXT NOT NULL DEFAULT 'daily',
                tier TEXT NOT NULL DEFAULT 'trial',
                trial_started_at TEXT,
                trial_ends_at TEXT,
                premium_expires_at TEXT,
                trial_notified INTEGER NOT NULL DEFAULT 0,
                premium_expired_notified INTEGER NOT NULL DEFAULT 1,
                referrer_id INTEGER,
                referral_code TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                last_active_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id),
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                pinyin TEXT,
                translation TEXT,
                explanation TEXT,
                topic TEXT,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS usage_counters (
                user_id INTEGER NOT NULL,
                day TEXT NOT NULL,
                channel TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, day, channel)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS referrals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                referrer_id INTEGER NOT NULL,
                referred_id INTEGER NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'registered',
                bonus_days_given INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS payments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL UNIQUE,
                user_id INTEGER NOT NULL,
                amount INTEGER NOT NULL DEFAULT 0,
                currency TEXT NOT NULL DEFAULT 'RUB',
                days_granted INTEGER NOT NULL DEFAULT 0,
                source TEXT NOT NULL DEFAULT 'payment',
                status TEXT NOT NULL DEFAULT 'completed',
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS saved_words (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id),
                word TEXT NOT NULL,
                pinyin TEXT,
                translation TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (user_id, word)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_user ON messages(user_id, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_users_trial ON users(trial_notified, trial_ends_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_users_premium \
             ON users(premium_expired_notified, premium_expires_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ── User Operations ────────────────────────────────────────────

    /// Insert the user on first contact, refresh username/last-active on
    /// every later one.
    pub async fn ensure_user(
        &self,
        user_id: i64,
        username: Option<&str>,
        first_name: &str,
        language_code: Option<&str>,
    ) -> anyhow::Result<models::User> {
        let now = Utc::now();
        let referral_code = new_referral_code();
        let user = sqlx::query_as::<_, models::User>(
            r#"
            INSERT INTO users (id, username, first_name, language_code, referral_code,
                               created_at, last_active_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT (id) DO UPDATE SET
                username = COALESCE(?2, users.username),
                last_active_at = ?6
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(username)
        .bind(first_name)
        .bind(language_code.unwrap_or("ru"))
        .bind(referral_code)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(user)
    }

    pub async fn get_user(&self, user_id: i64) -> anyhow::Result<Option<models::User>> {
        let user = sqlx::query_as::<_, models::User>("SELECT * FROM users WHERE id = ?1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn get_user_by_referral_code(
        &self,
        code: &str,
    ) -> anyhow::Result<Option<models::User>> {
        let user =
            sqlx::query_as::<_, models::User>("SELECT * FROM users WHERE referral_code = ?1")
                .bind(code)
                .fetch_optional(&self.pool)
                .await?;
        Ok(user)
    }

    /// Link a referrer. No-op if the user already has one; returns whether
    /// the link was written.
    pub async fn set_referrer(&self, user_id: i64, referrer_id: i64) -> anyhow::Result<bool> {
        let result =
            sqlx::query("UPDATE users SET referrer_id = ?2 WHERE id = ?1 AND referrer_id IS NULL")
                .bind(user_id)
                .bind(referrer_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_current_topic(&self, user_id: i64, topic: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE users SET current_topic = ?2 WHERE id = ?1")
            .bind(user_id)
            .bind(topic)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_hsk_level(&self, user_id: i64, level: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE users SET hsk_level = ?2 WHERE id = ?1")
            .bind(user_id)
            .bind(level)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_speech_speed(&self, user_id: i64, speed: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE users SET speech_speed = ?2 WHERE id = ?1")
            .bind(user_id)
            .bind(speed)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Referral Operations ────────────────────────────────────────

    /// Record a referral. Returns false if the referred user was already
    /// referred by someone.
    pub async fn create_referral(
        &self,
        referrer_id: i64,
        referred_id: i64,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO referrals (referrer_id, referred_id, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (referred_id) DO NOTHING
            "#,
        )
        .bind(referrer_id)
        .bind(referred_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_referral_by_referred(
        &self,
        referred_id: i64,
    ) -> anyhow::Result<Option<models::Referral>> {
        let referral = sqlx::query_as::<_, models::Referral>(
            "SELECT * FROM referrals WHERE referred_id = ?1",
        )
        .bind(referred_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(referral)
    }

    /// Returns (total referrals, referrals that converted to a payment).
    pub async fn count_referrals(&self, referrer_id: i64) -> anyhow::Result<(i64, i64)> {
        let row: (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(CASE WHEN status = 'subscribed' THEN 1 ELSE 0 END), 0)
            FROM referrals WHERE referrer_id = ?1
            "#,
        )
        .bind(referrer_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    // ── Message Operations ─────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn save_message(
        &self,
        user_id: i64,
        role: &str,
        content: &str,
        pinyin: Option<&str>,
        translation: Option<&str>,
        explanation: Option<&str>,
        topic: Option<&str>,
    ) -> anyhow::Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO messages (user_id, role, content, pinyin, translation, explanation,
                                  topic, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(role)
        .bind(content)
        .bind(pinyin)
        .bind(translation)
        .bind(explanation)
        .bind(topic)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn get_message(&self, message_id: i64) -> anyhow::Result<Option<models::Message>> {
        let msg = sqlx::query_as::<_, models::Message>("SELECT * FROM messages WHERE id = ?1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(msg)
    }

    /// Last `limit` messages for a topic, oldest first.
    pub async fn get_history(
        &self,
        user_id: i64,
        topic: &str,
        limit: i64,
    ) -> anyhow::Result<Vec<models::Message>> {
        let mut msgs = sqlx::query_as::<_, models::Message>(
            r#"
            SELECT * FROM messages
            WHERE user_id = ?1 AND topic = ?2
            ORDER BY created_at DESC, id DESC LIMIT ?3
            "#,
        )
        .bind(user_id)
        .bind(topic)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        msgs.reverse();
        Ok(msgs)
    }

    // ── Saved Word Operations ──────────────────────────────────────

    /// Returns false if the word was already saved.
    pub async fn save_word(
        &self,
        user_id: i64,
        word: &str,
        pinyin: Option<&str>,
        translation: Option<&str>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO saved_words (user_id, word, pinyin, translation, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (user_id, word) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(word)
        .bind(pinyin)
        .bind(translation)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_words(
        &self,
        user_id: i64,
        limit: i64,
    ) -> anyhow::Result<Vec<models::SavedWord>> {
        let words = sqlx::query_as::<_, models::SavedWord>(
            "SELECT * FROM saved_words WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(words)
    }

    // ── Admin Operations ───────────────────────────────────────────

    pub async fn stats(&self, now: DateTime<Utc>) -> anyhow::Result<BotStats> {
        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap_or_default()
            .and_utc();
        let month_ago = now - chrono::Duration::days(30);

        let (total_users,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        let (premium_users,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM users \
             WHERE premium_expires_at IS NOT NULL AND premium_expires_at > ?1",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        let (messages_today,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE created_at >= ?1")
                .bind(day_start)
                .fetch_one(&self.pool)
                .await?;
        let (revenue_30d,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(amount), 0) FROM payments \
             WHERE created_at >= ?1 AND status = 'completed' AND source = 'payment'",
        )
        .bind(month_ago)
        .fetch_one(&self.pool)
        .await?;

        Ok(BotStats {
            total_users,
            premium_users,
            messages_today,
            revenue_30d,
        })
    }
}

/// Opaque per-user code for referral deep links.
fn new_referral_code() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
