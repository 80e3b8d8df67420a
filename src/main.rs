use std::sync::Arc;
use std::time::Duration;

use teloxide::prelude::*;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use laoshi_bot::ai::{llm::TutorClient, stt::SttClient, tts::TtsClient};
use laoshi_bot::bot::{self, throttle::Throttle, AppState};
use laoshi_bot::config::AppConfig;
use laoshi_bot::db::Database;
use laoshi_bot::notify::{Notifier, TelegramNotifier};
use laoshi_bot::payments::{self, PaymentProcessor, WebhookState};
use laoshi_bot::subscription::{ExpirySweeper, QuotaEnforcer, QuotaLimits, SubscriptionLedger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("🤖 Starting Laoshi Bot...");

    // Load config
    let config = AppConfig::from_env()?;
    tracing::info!("Config loaded. Chat model: {}", config.chat_model);

    // Initialize database
    let db = Database::connect(&config.database_url).await?;
    db.run_migrations().await?;
    tracing::info!("Database connected and migrations applied.");

    // Create the Telegram bot and the notification capability
    let bot = Bot::new(&config.telegram_bot_token);
    let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::new(bot.clone(), config.clone()));

    // Subscription core
    let ledger = SubscriptionLedger::new(
        db.clone(),
        config.trial_days,
        config.referral_purchase_bonus_days,
    );
    let quota = QuotaEnforcer::new(
        db.clone(),
        ledger.clone(),
        QuotaLimits {
            text_per_day: config.free_text_limit,
            voice_per_day: config.free_voice_limit,
            vocab_total: config.free_vocab_limit,
        },
    );

    // Expiry sweeper, stopped via the watch channel on shutdown
    let (sweeper_stop, stop_rx) = watch::channel(false);
    let sweeper = ExpirySweeper::new(
        db.clone(),
        ledger.clone(),
        notifier.clone(),
        Duration::from_secs(config.sweep_interval_secs),
    );
    let sweeper_task = tokio::spawn(sweeper.run(stop_rx));

    // Payment webhook server
    let processor = PaymentProcessor::new(ledger.clone(), notifier.clone(), config.premium_days);
    let webhook_state = Arc::new(WebhookState {
        processor,
        secret: config.payment_webhook_secret.clone(),
        product_id: config.payment_product_id.clone(),
    });
    let webhook_port = config.webhook_port;
    tokio::spawn(async move {
        if let Err(e) = payments::serve(webhook_state, webhook_port).await {
            tracing::error!("payment webhook server failed: {e}");
        }
    });

    // Build shared application state
    let state = Arc::new(AppState {
        llm: TutorClient::new(&config),
        stt: SttClient::new(&config),
        tts: TtsClient::new(&config),
        throttle: Throttle::new(Duration::from_secs(1)),
        config,
        db,
        ledger,
        quota,
        notifier,
    });

    // Build the dispatcher
    let handler = bot::build_handler();

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    let _ = sweeper_stop.send(true);
    let _ = sweeper_task.await;

    Ok(())
}
