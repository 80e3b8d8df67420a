#[derive(Debug, Clone)]
pub struct AppConfig {
    pub telegram_bot_token: String,
    pub openai_api_key: String,
    pub chat_model: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub database_url: String,

    /// Comma-separated Telegram user IDs of admins
    pub admin_ids: Vec<i64>,

    /// Shared secret for verifying payment webhook signatures
    pub payment_webhook_secret: String,
    /// Product ID expected in payment events (empty = accept any)
    pub payment_product_id: String,
    /// Public payment page link shown under premium prompts
    pub payment_link: String,
    pub webhook_port: u16,

    /// Free-tier daily limits
    pub free_text_limit: i64,
    pub free_voice_limit: i64,
    /// Free-tier cumulative saved-word cap
    pub free_vocab_limit: i64,

    pub trial_days: i64,
    /// Premium days granted per payment
    pub premium_days: i64,
    /// Premium price in kopecks
    pub premium_price: i64,

    pub referral_signup_bonus_days: i64,
    pub referral_purchase_bonus_days: i64,

    pub sweep_interval_secs: u64,

    pub max_text_length: usize,
    pub max_voice_secs: u32,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let admin_ids_str = std::env::var("ADMIN_IDS").unwrap_or_default();
        let admin_ids: Vec<i64> = admin_ids_str
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();

        Ok(Self {
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN")?,
            openai_api_key: std::env::var("OPENAI_API_KEY")?,
            chat_model: std::env::var("CHAT_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            tts_model: std::env::var("TTS_MODEL").unwrap_or_else(|_| "tts-1".to_string()),
            tts_voice: std::env::var("TTS_VOICE").unwrap_or_else(|_| "alloy".to_string()),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:bot.db".to_string()),
            admin_ids,
            payment_webhook_secret: std::env::var("PAYMENT_WEBHOOK_SECRET").unwrap_or_default(),
            payment_product_id: std::env::var("PAYMENT_PRODUCT_ID").unwrap_or_default(),
            payment_link: std::env::var("PAYMENT_LINK").unwrap_or_default(),
            webhook_port: std::env::var("WEBHOOK_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()?,
            free_text_limit: env_i64("FREE_TEXT_LIMIT", 20),
            free_voice_limit: env_i64("FREE_VOICE_LIMIT", 5),
            free_vocab_limit: env_i64("FREE_VOCAB_LIMIT", 50),
            trial_days: env_i64("TRIAL_DAYS", 3),
            premium_days: env_i64("PREMIUM_DAYS", 30),
            premium_price: env_i64("PREMIUM_PRICE", 77_000),
            referral_signup_bonus_days: env_i64("REFERRAL_SIGNUP_BONUS_DAYS", 7),
            referral_purchase_bonus_days: env_i64("REFERRAL_PURCHASE_BONUS_DAYS", 30),
            sweep_interval_secs: std::env::var("SWEEP_INTERVAL_SECS")
                .unwrap_or_else(|_| "3600".to_string())
                .parse()
                .unwrap_or(3600),
            max_text_length: std::env::var("MAX_TEXT_LENGTH")
                .unwrap_or_else(|_| "500".to_string())
                .parse()
                .unwrap_or(500),
            max_voice_secs: std::env::var("MAX_VOICE_DURATION")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .unwrap_or(60),
        })
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_ids.contains(&user_id)
    }

    /// Premium price in whole rubles, for user-facing texts.
    pub fn premium_price_rub(&self) -> i64 {
        self.premium_price / 100
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
