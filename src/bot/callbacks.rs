use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::ParseMode;

use crate::ai::llm::ChatMessage;

use super::commands::{level_keyboard, speed_keyboard, topic_keyboard};
use super::{topic_display_name, AppState};

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some(data) = q.data.as_deref() else {
        return Ok(());
    };
    let user_id = q.from.id.0 as i64;

    // ── Topic selection ────────────────────────────────────────────
    if let Some(topic) = data.strip_prefix("topic:") {
        if !matches!(topic, "travel" | "food" | "work" | "daily" | "study" | "health" | "free") {
            bot.answer_callback_query(&q.id).text("Неизвестная тема").await?;
            return Ok(());
        }
        state.db.set_current_topic(user_id, topic).await?;

        let name = topic_display_name(topic);
        bot.answer_callback_query(&q.id)
            .text(format!("✅ Тема изменена на: {name}"))
            .await?;
        if let Some(message) = q.message {
            bot.edit_message_text(
                message.chat().id,
                message.id(),
                format!(
                    "🎯 <b>Выберите тему для диалога</b>\n\n\
                     Текущая тема: <b>{name}</b>\n\n\
                     <i>Выбранная тема влияет на контекст и словарный запас в диалогах.</i>",
                ),
            )
            .parse_mode(ParseMode::Html)
            .reply_markup(topic_keyboard(topic))
            .await?;
        }
        return Ok(());
    }

    // ── HSK level selection ────────────────────────────────────────
    if let Some(level_str) = data.strip_prefix("level:") {
        let Ok(level) = level_str.parse::<i64>() else {
            return Ok(());
        };
        if !(1..=3).contains(&level) {
            bot.answer_callback_query(&q.id).text("Неверный уровень").await?;
            return Ok(());
        }
        state.db.set_hsk_level(user_id, level).await?;

        bot.answer_callback_query(&q.id)
            .text(format!("✅ Уровень изменён на HSK {level}"))
            .await?;
        if let Some(message) = q.message {
            bot.edit_message_text(
                message.chat().id,
                message.id(),
                format!(
                    "📊 <b>Выберите уровень HSK</b>\n\n\
                     Текущий уровень: <b>HSK {level}</b>\n\n\
                     • <b>HSK 1</b> — ~150 слов, базовая грамматика\n\
                     • <b>HSK 2</b> — ~300 слов, простые конструкции\n\
                     • <b>HSK 3</b> — ~600 слов, средний уровень",
                ),
            )
            .parse_mode(ParseMode::Html)
            .reply_markup(level_keyboard(level))
            .await?;
        }
        return Ok(());
    }

    // ── Speech speed selection ─────────────────────────────────────
    if let Some(speed) = data.strip_prefix("speed:") {
        if !matches!(speed, "slow" | "normal" | "fast") {
            bot.answer_callback_query(&q.id).text("Неверная скорость").await?;
            return Ok(());
        }
        state.db.set_speech_speed(user_id, speed).await?;

        bot.answer_callback_query(&q.id)
            .text(format!(
                "✅ Скорость изменена на: {}",
                super::speed_display_name(speed),
            ))
            .await?;
        if let Some(message) = q.message {
            bot.edit_message_text(
                message.chat().id,
                message.id(),
                format!(
                    "🔊 <b>Выберите скорость речи</b>\n\n\
                     Текущая скорость: <b>{}</b>\n\n\
                     <b>🐢 Медленно</b> — для начинающих\n\
                     <b>🚶 Нормально</b> — естественная речь\n\
                     <b>🏃 Быстро</b> — как носители языка",
                    super::speed_display_name(speed),
                ),
            )
            .parse_mode(ParseMode::Html)
            .reply_markup(speed_keyboard(speed))
            .await?;
        }
        return Ok(());
    }

    // ── Reveal buttons under voice replies ─────────────────────────
    if let Some(message_id) = parse_message_ref(data, "text:") {
        let Some(stored) = state.db.get_message(message_id).await? else {
            bot.answer_callback_query(&q.id)
                .text("Сообщение не найдено")
                .show_alert(true)
                .await?;
            return Ok(());
        };
        let mut text = format!("📝 <b>Текст:</b>\n\n<b>{}</b>", stored.content);
        if let Some(pinyin) = stored.pinyin.as_deref().filter(|p| !p.is_empty()) {
            text.push_str(&format!("\n\n<i>{pinyin}</i>"));
        }
        bot.answer_callback_query(&q.id).await?;
        reply_under(&bot, &q, text).await?;
        return Ok(());
    }

    if let Some(message_id) = parse_message_ref(data, "translate:") {
        let Some(stored) = state.db.get_message(message_id).await? else {
            bot.answer_callback_query(&q.id)
                .text("Сообщение не найдено")
                .show_alert(true)
                .await?;
            return Ok(());
        };
        let text = match stored.translation.as_deref().filter(|t| !t.is_empty()) {
            Some(translation) => format!("🔄 <b>Перевод:</b>\n\n{translation}"),
            None => "Перевода для этого сообщения нет.".to_string(),
        };
        bot.answer_callback_query(&q.id).await?;
        reply_under(&bot, &q, text).await?;
        return Ok(());
    }

    if let Some(message_id) = parse_message_ref(data, "explain:") {
        let Some(stored) = state.db.get_message(message_id).await? else {
            bot.answer_callback_query(&q.id)
                .text("Сообщение не найдено")
                .show_alert(true)
                .await?;
            return Ok(());
        };
        let text = match stored.explanation.as_deref().filter(|e| !e.is_empty()) {
            Some(explanation) => format!("💡 <b>Объяснение:</b>\n\n{explanation}"),
            None => "Исправлений для этого сообщения не было.".to_string(),
        };
        bot.answer_callback_query(&q.id).await?;
        reply_under(&bot, &q, text).await?;
        return Ok(());
    }

    if parse_message_ref(data, "help:").is_some() {
        suggest_replies(&bot, &q, &state, user_id).await?;
        return Ok(());
    }

    Ok(())
}

/// Ask the tutor for 2-3 reply suggestions in the current dialogue context.
async fn suggest_replies(
    bot: &Bot,
    q: &CallbackQuery,
    state: &AppState,
    user_id: i64,
) -> anyhow::Result<()> {
    let Some(user) = state.db.get_user(user_id).await? else {
        bot.answer_callback_query(&q.id).await?;
        return Ok(());
    };

    bot.answer_callback_query(&q.id)
        .text("Генерирую подсказки...")
        .await?;

    let history: Vec<ChatMessage> = state
        .db
        .get_history(user_id, &user.current_topic, 10)
        .await?
        .into_iter()
        .map(|m| ChatMessage {
            role: m.role,
            content: m.content,
        })
        .collect();

    let result = state
        .llm
        .reply(
            "请给我2-3个简单的回复建议",
            &history,
            &user.current_topic,
            user.hsk_level,
        )
        .await;

    let text = match result {
        Ok(reply) if !reply.suggestions.is_empty() => {
            let mut text = String::from("💬 <b>Варианты ответа:</b>\n\n");
            for (i, s) in reply.suggestions.iter().take(3).enumerate() {
                if s.pinyin.is_empty() {
                    text.push_str(&format!("<b>{}.</b> {}\n", i + 1, s.text));
                } else {
                    text.push_str(&format!("<b>{}.</b> {} - {}\n", i + 1, s.text, s.pinyin));
                }
            }
            text
        }
        Ok(_) => "Не удалось придумать подсказки, попробуйте ещё раз.".to_string(),
        Err(e) => {
            tracing::error!("suggestion generation failed for user {user_id}: {e}");
            "Не удалось придумать подсказки, попробуйте ещё раз.".to_string()
        }
    };

    reply_under(bot, q, text).await?;
    Ok(())
}

fn parse_message_ref(data: &str, prefix: &str) -> Option<i64> {
    data.strip_prefix(prefix)?.parse().ok()
}

async fn reply_under(bot: &Bot, q: &CallbackQuery, text: String) -> anyhow::Result<()> {
    if let Some(message) = &q.message {
        bot.send_message(message.chat().id, text)
            .parse_mode(ParseMode::Html)
            .await?;
    }
    Ok(())
}
