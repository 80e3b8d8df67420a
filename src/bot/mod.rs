pub mod callbacks;
pub mod commands;
pub mod handlers;
pub mod throttle;

use std::sync::Arc;

use teloxide::dispatching::UpdateFilterExt;
use teloxide::dptree;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

use crate::ai::{llm::TutorClient, stt::SttClient, tts::TtsClient};
use crate::config::AppConfig;
use crate::db::Database;
use crate::notify::Notifier;
use crate::subscription::{QuotaEnforcer, SubscriptionLedger};
use throttle::Throttle;

/// Shared application state, accessible from all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub db: Database,
    pub ledger: SubscriptionLedger,
    pub quota: QuotaEnforcer,
    pub notifier: Arc<dyn Notifier>,
    pub llm: TutorClient,
    pub stt: SttClient,
    pub tts: TtsClient,
    pub throttle: Throttle,
}

/// Build the teloxide update handler tree.
pub fn build_handler() -> Handler<'static, DependencyMap, (), dptree::di::DependencySupplyError> {
    let command_handler = Update::filter_message()
        .filter_command::<commands::BotCommand>()
        .endpoint(commands::handle_command);

    let callback_handler = Update::filter_callback_query()
        .endpoint(callbacks::handle_callback);

    let message_handler = Update::filter_message()
        .endpoint(handlers::handle_message);

    dptree::entry()
        .branch(command_handler)
        .branch(callback_handler)
        .branch(message_handler)
}

/// Purchase button shown under premium pitches and quota denials.
pub fn premium_keyboard(config: &AppConfig) -> Option<InlineKeyboardMarkup> {
    if config.payment_link.is_empty() {
        return None;
    }
    let url = reqwest::Url::parse(&config.payment_link).ok()?;
    Some(InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::url(
        format!("💎 Купить Premium — ₽{}/мес", config.premium_price_rub()),
        url,
    )]]))
}

pub fn topic_display_name(topic: &str) -> &'static str {
    match topic {
        "travel" => "✈️ Путешествия",
        "food" => "🍜 Еда",
        "work" => "💼 Работа",
        "study" => "📚 Учёба",
        "health" => "🏥 Здоровье",
        "free" => "💬 Свободный диалог",
        _ => "🏠 Быт",
    }
}

pub fn speed_display_name(speed: &str) -> &'static str {
    match speed {
        "slow" => "🐢 Медленная",
        "fast" => "🏃 Быстрая",
        _ => "🚶 Нормальная",
    }
}
