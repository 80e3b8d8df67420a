use std::sync::Arc;

use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, ParseMode};

use crate::ai::llm::ChatMessage;
use crate::db::models::User;
use crate::subscription::UsageChannel;

use super::{premium_keyboard, AppState};

/// Main message handler: the quota gate plus the voice/text tutor pipeline.
pub async fn handle_message(
    bot: Bot,
    msg: Message,
    state: Arc<AppState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };
    let user_id = from.id.0 as i64;

    // Flood guard: extras are dropped silently.
    if !state.throttle.allow(user_id) {
        return Ok(());
    }

    let user = state
        .db
        .ensure_user(
            user_id,
            from.username.as_deref(),
            &from.first_name,
            from.language_code.as_deref(),
        )
        .await?;
    state.ledger.start_trial(user_id).await?;

    if let Some(voice) = msg.voice() {
        if voice.duration.seconds() > state.config.max_voice_secs {
            bot.send_message(
                msg.chat.id,
                format!(
                    "⚠️ Голосовое сообщение слишком длинное.\n\
                     Максимум: {} секунд.\n\
                     Ваше: {} секунд.",
                    state.config.max_voice_secs,
                    voice.duration.seconds(),
                ),
            )
            .await?;
            return Ok(());
        }

        if !state.quota.check_allowed(user_id, UsageChannel::Voice).await {
            deny_quota(&bot, &msg, &state, user_id, UsageChannel::Voice).await?;
            return Ok(());
        }

        bot.send_chat_action(msg.chat.id, ChatAction::RecordVoice)
            .await?;

        let file = bot.get_file(&voice.file.id).await?;
        let mut audio = Vec::new();
        bot.download_file(&file.path, &mut audio).await?;

        let text = match state.stt.transcribe(audio, "voice.ogg").await {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("transcription failed for user {user_id}: {e}");
                send_pipeline_error(&bot, &msg).await?;
                return Ok(());
            }
        };
        tracing::info!("transcribed voice from user {user_id}: {text}");

        if text.trim().is_empty() {
            bot.send_message(
                msg.chat.id,
                "🤔 Не удалось распознать речь.\n\
                 Попробуйте говорить чётче или ближе к микрофону.",
            )
            .await?;
            return Ok(());
        }

        if let Err(e) = respond(&bot, &msg, &state, &user, &text).await {
            tracing::error!("voice pipeline failed for user {user_id}: {e}");
            send_pipeline_error(&bot, &msg).await?;
            return Ok(());
        }
        // Charged only after the reply actually went out.
        state.quota.record_usage(user_id, UsageChannel::Voice).await?;
    } else if let Some(text) = msg.text() {
        // Commands are dispatched by their own branch.
        if text.starts_with('/') {
            return Ok(());
        }

        if text.chars().count() > state.config.max_text_length {
            bot.send_message(
                msg.chat.id,
                format!(
                    "⚠️ Сообщение слишком длинное.\n\
                     Максимум: {} символов.\n\
                     Ваше: {} символов.",
                    state.config.max_text_length,
                    text.chars().count(),
                ),
            )
            .await?;
            return Ok(());
        }

        if !state.quota.check_allowed(user_id, UsageChannel::Text).await {
            deny_quota(&bot, &msg, &state, user_id, UsageChannel::Text).await?;
            return Ok(());
        }

        bot.send_chat_action(msg.chat.id, ChatAction::RecordVoice)
            .await?;

        if let Err(e) = respond(&bot, &msg, &state, &user, text).await {
            tracing::error!("text pipeline failed for user {user_id}: {e}");
            send_pipeline_error(&bot, &msg).await?;
            return Ok(());
        }
        state.quota.record_usage(user_id, UsageChannel::Text).await?;
    }

    Ok(())
}

/// Generate and deliver the tutor's reply to a Chinese message.
async fn respond(
    bot: &Bot,
    msg: &Message,
    state: &AppState,
    user: &User,
    chinese_text: &str,
) -> anyhow::Result<()> {
    let history: Vec<ChatMessage> = state
        .db
        .get_history(user.id, &user.current_topic, 10)
        .await?
        .into_iter()
        .map(|m| ChatMessage {
            role: m.role,
            content: m.content,
        })
        .collect();

    let reply = state
        .llm
        .reply(chinese_text, &history, &user.current_topic, user.hsk_level)
        .await?;

    state
        .db
        .save_message(
            user.id,
            "user",
            chinese_text,
            None,
            None,
            None,
            Some(&user.current_topic),
        )
        .await?;

    if let Some(correction) = &reply.correction {
        let original = if correction.original.is_empty() {
            chinese_text
        } else {
            &correction.original
        };
        bot.send_message(
            msg.chat.id,
            format!(
                "✏️ <b>Исправление:</b>\n\n<s>{original}</s>\n\n✅ <b>{}</b>",
                correction.corrected,
            ),
        )
        .parse_mode(ParseMode::Html)
        .await?;
    }

    let explanation = reply
        .correction
        .as_ref()
        .map(|c| c.explanation.as_str())
        .filter(|e| !e.is_empty());
    let assistant_msg_id = state
        .db
        .save_message(
            user.id,
            "assistant",
            &reply.response,
            Some(&reply.pinyin),
            Some(&reply.translation),
            explanation,
            Some(&user.current_topic),
        )
        .await?;

    let keyboard = reveal_keyboard(assistant_msg_id, reply.correction.is_some());

    // Voice-first: the reply is spoken; the buttons reveal text on demand.
    match state.tts.synthesize(&reply.response, &user.speech_speed).await {
        Ok(audio) => {
            let voice = InputFile::memory(audio).file_name("reply.ogg");
            bot.send_voice(msg.chat.id, voice)
                .reply_markup(keyboard)
                .await?;
        }
        Err(e) => {
            tracing::error!("tts failed, falling back to text: {e}");
            bot.send_message(msg.chat.id, &reply.response)
                .reply_markup(keyboard)
                .await?;
        }
    }

    Ok(())
}

async fn deny_quota(
    bot: &Bot,
    msg: &Message,
    state: &AppState,
    user_id: i64,
    channel: UsageChannel,
) -> anyhow::Result<()> {
    let (text_used, voice_used) = state.quota.usage_today(user_id).await.unwrap_or((0, 0));
    let (used, limit, kind) = match channel {
        UsageChannel::Voice => (
            voice_used,
            state.config.free_voice_limit,
            "голосовых сообщений",
        ),
        _ => (text_used, state.config.free_text_limit, "текстовых сообщений"),
    };

    let mut request = bot
        .send_message(
            msg.chat.id,
            format!(
                "📊 <b>Дневной лимит достигнут</b>\n\n\
                 Вы использовали {used}/{limit} {kind} сегодня.\n\
                 Лимит сбросится в 00:00.\n\n\
                 💎 Хотите безлимитный доступ?",
            ),
        )
        .parse_mode(ParseMode::Html);
    if let Some(keyboard) = premium_keyboard(&state.config) {
        request = request.reply_markup(keyboard);
    }
    request.await?;
    Ok(())
}

async fn send_pipeline_error(bot: &Bot, msg: &Message) -> anyhow::Result<()> {
    bot.send_message(
        msg.chat.id,
        "❌ Произошла ошибка при обработке сообщения.\n\
         Пожалуйста, попробуйте ещё раз.",
    )
    .await?;
    Ok(())
}

fn reveal_keyboard(message_id: i64, has_correction: bool) -> InlineKeyboardMarkup {
    let mut rows = vec![vec![
        InlineKeyboardButton::callback("📝 Текст", format!("text:{message_id}")),
        InlineKeyboardButton::callback("❓ Помощь", format!("help:{message_id}")),
        InlineKeyboardButton::callback("🔄 Перевод", format!("translate:{message_id}")),
    ]];
    if has_correction {
        rows.push(vec![InlineKeyboardButton::callback(
            "💡 Объяснить",
            format!("explain:{message_id}"),
        )]);
    }
    InlineKeyboardMarkup::new(rows)
}
