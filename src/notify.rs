use async_trait::async_trait;
use chrono::{DateTime, Utc};
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, ParseMode};

use crate::config::AppConfig;

/// What the subscription core wants a user to hear about.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    TrialExpired,
    PremiumExpired,
    PremiumActivated { until: DateTime<Utc> },
    /// A friend registered through the user's referral link.
    ReferralJoined { friend: String, bonus_days: i64 },
    /// A referred friend made their first qualifying payment.
    ReferralConverted { bonus_days: i64 },
}

/// The "send notification" capability the sweeper and payment processor
/// consume. Fire-and-forget from the caller's point of view; delivery
/// failures surface as errors the caller logs and absorbs.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: i64, notice: Notice) -> anyhow::Result<()>;
}

pub struct TelegramNotifier {
    bot: Bot,
    config: AppConfig,
}

impl TelegramNotifier {
    pub fn new(bot: Bot, config: AppConfig) -> Self {
        Self { bot, config }
    }

    fn premium_keyboard(&self) -> Option<InlineKeyboardMarkup> {
        if self.config.payment_link.is_empty() {
            return None;
        }
        let url = reqwest::Url::parse(&self.config.payment_link).ok()?;
        Some(InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::url(
            format!("💎 Купить Premium — ₽{}/мес", self.config.premium_price_rub()),
            url,
        )]]))
    }

    fn render(&self, notice: &Notice) -> String {
        let cfg = &self.config;
        match notice {
            Notice::TrialExpired => format!(
                "⏰ <b>Ваш бесплатный триал закончился!</b>\n\n\
                 Вы использовали {} дня полного доступа.\n\
                 Теперь действуют лимиты Free-версии:\n\n\
                 • {} текстовых сообщений/день\n\
                 • {} голосовых сообщений/день\n\n\
                 💎 <b>Хотите продолжить без ограничений?</b>\n\
                 Подписка Premium — всего ₽{}/мес",
                cfg.trial_days, cfg.free_text_limit, cfg.free_voice_limit, cfg.premium_price_rub(),
            ),
            Notice::PremiumExpired => format!(
                "⏰ <b>Ваша подписка Premium истекла!</b>\n\n\
                 К сожалению, срок действия вашей Premium-подписки закончился.\n\
                 Теперь действуют лимиты Free-версии:\n\n\
                 • {} текстовых сообщений/день\n\
                 • {} голосовых сообщений/день\n\n\
                 💎 <b>Продлите подписку, чтобы продолжить без ограничений!</b>\n\
                 Premium — ₽{}/мес",
                cfg.free_text_limit, cfg.free_voice_limit, cfg.premium_price_rub(),
            ),
            Notice::PremiumActivated { until } => format!(
                "🎉 <b>Premium успешно активирован!</b>\n\n\
                 Активен до: <b>{}</b>\n\n\
                 ✅ Безлимитные голосовые сообщения\n\
                 ✅ Безлимитные текстовые сообщения\n\
                 ✅ Приоритетная поддержка\n\n\
                 Спасибо за покупку! 🙏",
                until.format("%d.%m.%Y"),
            ),
            Notice::ReferralJoined { friend, bonus_days } => format!(
                "🎉 Ваш друг {friend} зарегистрировался по вашей ссылке!\n\
                 Вам начислено +{bonus_days} дней Premium",
            ),
            Notice::ReferralConverted { bonus_days } => format!(
                "🎉 <b>Ваш друг купил Premium!</b>\n\n\
                 Вам начислено <b>+{bonus_days} дней</b> Premium в подарок!",
            ),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, user_id: i64, notice: Notice) -> anyhow::Result<()> {
        let text = self.render(&notice);
        let mut request = self
            .bot
            .send_message(ChatId(user_id), text)
            .parse_mode(ParseMode::Html);
        // Expiry notices carry the purchase button, like the premium pitch.
        if matches!(notice, Notice::TrialExpired | Notice::PremiumExpired) {
            if let Some(keyboard) = self.premium_keyboard() {
                request = request.reply_markup(keyboard);
            }
        }
        request.await?;
        Ok(())
    }
}
