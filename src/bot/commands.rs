use std::sync::Arc;

use teloxide::macros::BotCommands;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, ParseMode};

use crate::db::models::{Tier, User};
use crate::notify::Notice;
use crate::subscription::UsageChannel;

use super::{premium_keyboard, speed_display_name, topic_display_name, AppState};

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Доступные команды:")]
pub enum BotCommand {
    #[command(description = "начать занятия")]
    Start(String),
    #[command(description = "справка")]
    Help,
    #[command(description = "подписка Premium")]
    Premium,
    #[command(description = "пригласить друга")]
    Invite,
    #[command(description = "профиль")]
    Profile,
    #[command(description = "выбрать тему диалога")]
    Topic,
    #[command(description = "изменить уровень HSK")]
    Level,
    #[command(description = "скорость речи")]
    Speed,
    #[command(description = "сохранить слово: /save 你好")]
    Save(String),
    #[command(description = "список сохранённых слов")]
    Words,
    #[command(hide)]
    Stats,
}

pub async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: BotCommand,
    state: Arc<AppState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };
    let user_id = from.id.0 as i64;

    let mut user = state
        .db
        .ensure_user(
            user_id,
            from.username.as_deref(),
            &from.first_name,
            from.language_code.as_deref(),
        )
        .await?;
    state.ledger.start_trial(user_id).await?;

    match cmd {
        BotCommand::Start(arg) => {
            if let Some(code) = arg.trim().strip_prefix("ref_") {
                link_referrer(&state, &user, code).await?;
                // Re-read so the welcome reflects any signup bonus.
                if let Some(refreshed) = state.db.get_user(user_id).await? {
                    user = refreshed;
                }
            }
            send_welcome(&bot, &msg, &state, &user).await?;
        }

        BotCommand::Help => {
            let help_text = format!(
                "📚 <b>Справка</b>\n\n\
                 <b>Основные функции:</b>\n\
                 • Отправляй голосовые сообщения на китайском\n\
                 • Получай ответы голосом с текстом и переводом\n\
                 • Автоматическое исправление ошибок\n\n\
                 <b>Кнопки под ответом:</b>\n\
                 <b>📝 Текст</b> — показать иероглифы и пиньинь\n\
                 <b>❓ Помощь</b> — варианты ответа\n\
                 <b>🔄 Перевод</b> — перевод на русский\n\
                 <b>💡 Объяснить</b> — объяснение ошибки\n\n\
                 {}\n\n\
                 <b>Лимиты Free версии:</b>\n\
                 • {} текстовых сообщений/день\n\
                 • {} голосовых сообщений/день\n\n\
                 💎 <b>Premium</b> — безлимитный доступ!",
                BotCommand::descriptions(),
                state.config.free_text_limit,
                state.config.free_voice_limit,
            );
            bot.send_message(msg.chat.id, help_text)
                .parse_mode(ParseMode::Html)
                .await?;
        }

        BotCommand::Premium => {
            send_premium_info(&bot, &msg, &state, user_id).await?;
        }

        BotCommand::Invite => {
            let me = bot.get_me().await?;
            let link = format!(
                "https://t.me/{}?start=ref_{}",
                me.username(),
                user.referral_code,
            );
            let (total, subscribed) = state.db.count_referrals(user_id).await?;
            let earned = total * state.config.referral_signup_bonus_days
                + subscribed * state.config.referral_purchase_bonus_days;
            bot.send_message(
                msg.chat.id,
                format!(
                    "👥 <b>Реферальная программа</b>\n\n\
                     Ваша ссылка:\n<code>{link}</code>\n\n\
                     📊 <b>Статистика:</b>\n\
                     • Приглашено друзей: <b>{total}</b>\n\
                     • Из них оплатили: <b>{subscribed}</b>\n\
                     • Заработано дней: <b>{earned}</b>\n\n\
                     💡 <b>Бонусы:</b>\n\
                     • Друг регистрируется → вы оба получаете <b>+{} дней Premium</b>\n\
                     • Друг покупает Premium → вы получаете <b>+{} дней</b>",
                    state.config.referral_signup_bonus_days,
                    state.config.referral_purchase_bonus_days,
                ),
            )
            .parse_mode(ParseMode::Html)
            .await?;
        }

        BotCommand::Profile => {
            send_profile(&bot, &msg, &state, &user).await?;
        }

        BotCommand::Topic => {
            bot.send_message(
                msg.chat.id,
                format!(
                    "🎯 <b>Выберите тему для диалога</b>\n\n\
                     Текущая тема: <b>{}</b>\n\n\
                     <i>Выбранная тема влияет на контекст и словарный запас в диалогах.</i>",
                    topic_display_name(&user.current_topic),
                ),
            )
            .parse_mode(ParseMode::Html)
            .reply_markup(topic_keyboard(&user.current_topic))
            .await?;
        }

        BotCommand::Level => {
            bot.send_message(
                msg.chat.id,
                format!(
                    "📊 <b>Выберите уровень HSK</b>\n\n\
                     Текущий уровень: <b>HSK {}</b>\n\n\
                     • <b>HSK 1</b> — ~150 слов, базовая грамматика\n\
                     • <b>HSK 2</b> — ~300 слов, простые конструкции\n\
                     • <b>HSK 3</b> — ~600 слов, средний уровень",
                    user.hsk_level,
                ),
            )
            .parse_mode(ParseMode::Html)
            .reply_markup(level_keyboard(user.hsk_level))
            .await?;
        }

        BotCommand::Speed => {
            bot.send_message(
                msg.chat.id,
                format!(
                    "🔊 <b>Выберите скорость речи</b>\n\n\
                     Текущая скорость: <b>{}</b>\n\n\
                     <b>🐢 Медленно</b> — для начинающих\n\
                     <b>🚶 Нормально</b> — естественная речь\n\
                     <b>🏃 Быстро</b> — как носители языка",
                    speed_display_name(&user.speech_speed),
                ),
            )
            .parse_mode(ParseMode::Html)
            .reply_markup(speed_keyboard(&user.speech_speed))
            .await?;
        }

        BotCommand::Save(arg) => {
            save_word(&bot, &msg, &state, user_id, arg.trim()).await?;
        }

        BotCommand::Stats => {
            if !state.config.is_admin(user_id) {
                return Ok(());
            }
            let stats = state.db.stats(chrono::Utc::now()).await?;
            bot.send_message(
                msg.chat.id,
                format!(
                    "📊 <b>Статистика</b>\n\n\
                     👥 Пользователей: <b>{}</b>\n\
                     💎 Активных Premium: <b>{}</b>\n\
                     💬 Сообщений сегодня: <b>{}</b>\n\
                     💰 Выручка за 30 дней: <b>₽{}</b>",
                    stats.total_users,
                    stats.premium_users,
                    stats.messages_today,
                    stats.revenue_30d / 100,
                ),
            )
            .parse_mode(ParseMode::Html)
            .await?;
        }

        BotCommand::Words => {
            let words = state.db.list_words(user_id, 50).await?;
            if words.is_empty() {
                bot.send_message(
                    msg.chat.id,
                    "Словарь пока пуст. Сохраните слово: /save 你好",
                )
                .await?;
            } else {
                let mut text = String::from("📖 <b>Сохранённые слова:</b>\n\n");
                for word in &words {
                    text.push_str(&format!("<b>{}</b>", word.word));
                    if let Some(pinyin) = word.pinyin.as_deref().filter(|p| !p.is_empty()) {
                        text.push_str(&format!(" — {pinyin}"));
                    }
                    if let Some(tr) = word.translation.as_deref().filter(|t| !t.is_empty()) {
                        text.push_str(&format!(" — {tr}"));
                    }
                    text.push('\n');
                }
                bot.send_message(msg.chat.id, text)
                    .parse_mode(ParseMode::Html)
                    .await?;
            }
        }
    }

    Ok(())
}

/// Link a referrer from a `/start ref_<code>` deep link and hand out the
/// signup bonus once. Self-referral and re-linking are rejected.
async fn link_referrer(state: &AppState, user: &User, code: &str) -> anyhow::Result<()> {
    let Some(referrer) = state.db.get_user_by_referral_code(code).await? else {
        return Ok(());
    };
    if referrer.id == user.id || user.referrer_id.is_some() {
        return Ok(());
    }
    if !state.db.set_referrer(user.id, referrer.id).await? {
        return Ok(());
    }
    if state.db.create_referral(referrer.id, user.id).await? {
        let days = state.config.referral_signup_bonus_days;
        // Synthetic event ids keep the signup bonus idempotent per referred
        // user even if the deep link is replayed.
        state
            .ledger
            .grant_premium(
                referrer.id,
                days,
                &format!("ref-signup:{}:referrer", user.id),
                0,
                "referral_signup",
            )
            .await?;
        state
            .ledger
            .grant_premium(
                user.id,
                days,
                &format!("ref-signup:{}:referred", user.id),
                0,
                "referral_signup",
            )
            .await?;
        if let Err(e) = state
            .notifier
            .notify(
                referrer.id,
                Notice::ReferralJoined {
                    friend: user.first_name.clone(),
                    bonus_days: days,
                },
            )
            .await
        {
            // Referrer may have blocked the bot.
            tracing::warn!("failed to notify referrer {}: {e}", referrer.id);
        }
    }
    Ok(())
}

async fn send_welcome(
    bot: &Bot,
    msg: &Message,
    state: &AppState,
    user: &User,
) -> anyhow::Result<()> {
    let welcome = format!(
        "🎉 <b>Добро пожаловать!</b>\n\n\
         Привет, <b>{}</b>! Я помогу тебе практиковать разговорный китайский язык.\n\n\
         <b>🎁 У тебя {} дня бесплатного Premium!</b>\n\
         <i>Полный доступ ко всем функциям</i>\n\n\
         <b>Как это работает:</b>\n\
         <b>1️⃣</b> Отправь голосовое сообщение на китайском\n\
         <b>2️⃣</b> Я отвечу голосом и исправлю ошибки\n\
         <b>3️⃣</b> Нажми кнопки под сообщением для текста/перевода\n\n\
         <b>Команды:</b>\n\
         • /topic — выбрать тему диалога\n\
         • /level — изменить уровень HSK\n\
         • /invite — пригласить друга\n\
         • /premium — информация о подписке\n\
         • /help — справка\n\n\
         <b>Текущие настройки:</b>\n\
         📊 Уровень: <b>HSK {}</b>\n\
         🎯 Тема: {}\n\
         🔊 Скорость: {}\n\n\
         <b>Начни говорить! 🎤</b>",
        user.first_name,
        state.config.trial_days,
        user.hsk_level,
        topic_display_name(&user.current_topic),
        speed_display_name(&user.speech_speed),
    );
    bot.send_message(msg.chat.id, welcome)
        .parse_mode(ParseMode::Html)
        .await?;
    Ok(())
}

async fn send_premium_info(
    bot: &Bot,
    msg: &Message,
    state: &AppState,
    user_id: i64,
) -> anyhow::Result<()> {
    let sub = state.ledger.get_state(user_id).await?;
    let cfg = &state.config;
    let now = chrono::Utc::now();

    let text = match sub.tier {
        Tier::Premium => {
            let until = sub.expires_at.unwrap_or(now);
            format!(
                "💎 <b>Premium активен!</b>\n\n\
                 Осталось дней: <b>{}</b>\n\
                 Активен до: {}\n\n\
                 ✅ Безлимитные голосовые сообщения\n\
                 ✅ Безлимитные текстовые сообщения\n\
                 ✅ Приоритетная поддержка",
                (until - now).num_days(),
                until.format("%d.%m.%Y"),
            )
        }
        Tier::Trial => {
            let until = sub.expires_at.unwrap_or(now);
            format!(
                "🎁 <b>Триал активен!</b>\n\n\
                 Осталось дней: <b>{}</b>\n\
                 Триал заканчивается: {}\n\n\
                 После окончания триала:\n\
                 • {} текстовых сообщений/день\n\
                 • {} голосовых сообщений/день\n\n\
                 💎 <b>Premium — ₽{}/мес</b>\n\
                 Безлимитный доступ ко всем функциям!",
                (until - now).num_days(),
                until.format("%d.%m.%Y"),
                cfg.free_text_limit,
                cfg.free_voice_limit,
                cfg.premium_price_rub(),
            )
        }
        Tier::Free => format!(
            "📊 <b>Free версия</b>\n\n\
             Ваши текущие лимиты:\n\
             • {} текстовых сообщений/день\n\
             • {} голосовых сообщений/день\n\n\
             💎 <b>Premium — ₽{}/мес</b>\n\n\
             ✅ Безлимитные голосовые сообщения\n\
             ✅ Безлимитные текстовые сообщения\n\
             ✅ Приоритетная поддержка",
            cfg.free_text_limit,
            cfg.free_voice_limit,
            cfg.premium_price_rub(),
        ),
    };

    let mut request = bot.send_message(msg.chat.id, text).parse_mode(ParseMode::Html);
    if sub.tier != Tier::Premium {
        if let Some(keyboard) = premium_keyboard(cfg) {
            request = request.reply_markup(keyboard);
        }
    }
    request.await?;
    Ok(())
}

async fn send_profile(
    bot: &Bot,
    msg: &Message,
    state: &AppState,
    user: &User,
) -> anyhow::Result<()> {
    let sub = state.ledger.get_state(user.id).await?;
    let now = chrono::Utc::now();

    let sub_text = match sub.tier {
        Tier::Premium => format!(
            "💎 Premium (осталось {} дн.)",
            (sub.expires_at.unwrap_or(now) - now).num_days(),
        ),
        Tier::Trial => format!(
            "🎁 Триал (осталось {} дн.)",
            sub.trial_remaining.map(|d| d.num_days()).unwrap_or(0),
        ),
        Tier::Free => "📊 Free".to_string(),
    };

    let mut limits_text = String::new();
    if sub.tier == Tier::Free {
        let (text_used, voice_used) = state.quota.usage_today(user.id).await?;
        limits_text = format!(
            "\n\n📈 <b>Использовано сегодня:</b>\n\
             • Текст: {}/{}\n\
             • Голос: {}/{}",
            text_used, state.config.free_text_limit, voice_used, state.config.free_voice_limit,
        );
    }

    bot.send_message(
        msg.chat.id,
        format!(
            "👤 <b>Профиль</b>\n\n\
             <b>Имя:</b> {}\n\
             <b>Username:</b> @{}\n\
             <b>ID:</b> <code>{}</code>\n\n\
             <b>Подписка:</b> {}\n\
             <b>Регистрация:</b> {}\n\n\
             <b>Настройки:</b>\n\
             • Уровень: HSK {}\n\
             • Тема: {}\n\
             • Скорость: {}{}",
            user.first_name,
            user.username.as_deref().unwrap_or("не указан"),
            user.id,
            sub_text,
            user.created_at.format("%d.%m.%Y"),
            user.hsk_level,
            topic_display_name(&user.current_topic),
            speed_display_name(&user.speech_speed),
            limits_text,
        ),
    )
    .parse_mode(ParseMode::Html)
    .await?;
    Ok(())
}

async fn save_word(
    bot: &Bot,
    msg: &Message,
    state: &AppState,
    user_id: i64,
    word: &str,
) -> anyhow::Result<()> {
    if word.is_empty() {
        bot.send_message(msg.chat.id, "Укажите слово: /save 你好")
            .await?;
        return Ok(());
    }

    if !state.quota.check_allowed(user_id, UsageChannel::Vocab).await {
        let mut request = bot
            .send_message(
                msg.chat.id,
                format!(
                    "📊 <b>Лимит словаря достигнут</b>\n\n\
                     Free-версия вмещает до {} слов.\n\n\
                     💎 Хотите безлимитный словарь?",
                    state.config.free_vocab_limit,
                ),
            )
            .parse_mode(ParseMode::Html);
        if let Some(keyboard) = premium_keyboard(&state.config) {
            request = request.reply_markup(keyboard);
        }
        request.await?;
        return Ok(());
    }

    // Best-effort enrichment; the word is saved even if the lookup fails.
    let info = state.llm.word_info(word).await.ok();
    let pinyin = info.as_ref().map(|i| i.pinyin.as_str()).filter(|p| !p.is_empty());
    let translation = info
        .as_ref()
        .map(|i| i.translation.as_str())
        .filter(|t| !t.is_empty());

    let inserted = state.db.save_word(user_id, word, pinyin, translation).await?;
    if inserted {
        state
            .quota
            .record_usage(user_id, UsageChannel::Vocab)
            .await?;
        let mut text = format!("✅ Сохранено: <b>{word}</b>");
        if let Some(pinyin) = pinyin {
            text.push_str(&format!("\n🔤 {pinyin}"));
        }
        if let Some(translation) = translation {
            text.push_str(&format!("\n🇷🇺 {translation}"));
        }
        bot.send_message(msg.chat.id, text)
            .parse_mode(ParseMode::Html)
            .await?;
    } else {
        bot.send_message(msg.chat.id, "Это слово уже в вашем словаре.")
            .await?;
    }
    Ok(())
}

pub fn topic_keyboard(current: &str) -> InlineKeyboardMarkup {
    let topics = [
        ("travel", "✈️ Путешествия"),
        ("food", "🍜 Еда"),
        ("work", "💼 Работа"),
        ("daily", "🏠 Быт"),
        ("study", "📚 Учёба"),
        ("health", "🏥 Здоровье"),
    ];
    let buttons: Vec<Vec<InlineKeyboardButton>> = topics
        .chunks(2)
        .map(|pair| {
            pair.iter()
                .map(|(id, name)| {
                    let mark = if *id == current { "✅ " } else { "" };
                    InlineKeyboardButton::callback(format!("{mark}{name}"), format!("topic:{id}"))
                })
                .collect()
        })
        .collect();
    InlineKeyboardMarkup::new(buttons)
}

pub fn level_keyboard(current: i64) -> InlineKeyboardMarkup {
    let row: Vec<InlineKeyboardButton> = (1..=3)
        .map(|level| {
            let mark = if level == current { "✅ " } else { "" };
            InlineKeyboardButton::callback(format!("{mark}HSK {level}"), format!("level:{level}"))
        })
        .collect();
    InlineKeyboardMarkup::new(vec![row])
}

pub fn speed_keyboard(current: &str) -> InlineKeyboardMarkup {
    let speeds = [
        ("slow", "🐢 Медленно"),
        ("normal", "🚶 Нормально"),
        ("fast", "🏃 Быстро"),
    ];
    let row: Vec<InlineKeyboardButton> = speeds
        .iter()
        .map(|(id, name)| {
            let mark = if *id == current { "✅ " } else { "" };
            InlineKeyboardButton::callback(format!("{mark}{name}"), format!("speed:{id}"))
        })
        .collect();
    InlineKeyboardMarkup::new(vec![row])
}
