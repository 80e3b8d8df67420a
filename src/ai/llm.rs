use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;

const CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Dialogue topics and their prompt labels (Chinese + Russian gloss).
pub const TOPICS: &[(&str, &str)] = &[
    ("travel", "旅游 (путешествия)"),
    ("food", "美食 (еда)"),
    ("work", "工作 (работа)"),
    ("daily", "日常生活 (быт)"),
    ("study", "学习 (учёба)"),
    ("health", "健康 (здоровье)"),
    ("free", "自由对话 (свободный диалог на любую тему)"),
];

pub fn topic_label(topic: &str) -> &'static str {
    TOPICS
        .iter()
        .find(|(id, _)| *id == topic)
        .map(|(_, label)| *label)
        .unwrap_or("日常生活 (быт)")
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// A grammar/vocabulary fix the tutor wants shown before its reply.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Correction {
    #[serde(default)]
    pub original: String,
    pub corrected: String,
    #[serde(default)]
    pub corrected_pinyin: String,
    #[serde(default)]
    pub explanation: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Suggestion {
    pub text: String,
    #[serde(default)]
    pub pinyin: String,
}

/// Structured tutor reply, parsed from the model's JSON output.
#[derive(Debug, Clone, Deserialize)]
pub struct TutorReply {
    #[serde(default)]
    pub correction: Option<Correction>,
    #[serde(default = "fallback_response")]
    pub response: String,
    #[serde(default)]
    pub pinyin: String,
    #[serde(default)]
    pub translation: String,
    #[serde(default)]
    pub suggestions: Vec<Suggestion>,
}

fn fallback_response() -> String {
    "对不起，我不明白。".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct WordInfo {
    #[serde(default)]
    pub pinyin: String,
    #[serde(default)]
    pub translation: String,
}

pub struct TutorClient {
    client: Client,
    api_key: String,
    model: String,
}

impl TutorClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            api_key: config.openai_api_key.clone(),
            model: config.chat_model.clone(),
        }
    }

    fn system_prompt(topic: &str, hsk_level: i64) -> String {
        format!(
            r#"你是一个中文老师，帮助学生练习汉语口语。

当前话题: {topic}
学生水平: HSK {hsk_level}

规则:
1. 只用HSK{hsk_level}词汇回复（可加10-15%新词）
2. 保持对话自然，围绕话题
3. 如果学生有语法/词汇错误，先纠正再回复
4. 回复简短（1-3句话）

回复格式（JSON）:
{{
    "correction": {{"original": "错误文本", "corrected": "正确文本", "corrected_pinyin": "正确文本的拼音", "explanation": "解释（俄语）"}} 或 null,
    "response": "你的回复（中文）",
    "pinyin": "拼音",
    "translation": "перевод на русский",
    "suggestions": [
        {{"text": "中文回复", "pinyin": "拼音"}},
        {{"text": "中文回复2", "pinyin": "拼音2"}}
    ]
}}"#,
            topic = topic_label(topic),
        )
    }

    /// Generate the tutor's reply to a student message.
    pub async fn reply(
        &self,
        user_message: &str,
        history: &[ChatMessage],
        topic: &str,
        hsk_level: i64,
    ) -> anyhow::Result<TutorReply> {
        let mut messages = vec![ChatMessage {
            role: "system".to_string(),
            content: Self::system_prompt(topic, hsk_level),
        }];
        messages.extend_from_slice(history);
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: user_message.to_string(),
        });

        let content = self.complete_json(&messages, 0.7, 500).await?;
        let reply: TutorReply = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("unparseable tutor reply: {e}: {content}"))?;
        Ok(reply)
    }

    /// Pinyin and translation for a single word or phrase.
    pub async fn word_info(&self, word: &str) -> anyhow::Result<WordInfo> {
        let prompt = format!(
            "Дай пиньинь и перевод для:\n汉字: {word}\n\n\
             Ответь JSON:\n{{\"pinyin\": \"пиньинь\", \"translation\": \"перевод на русский\"}}",
        );
        let messages = [ChatMessage {
            role: "user".to_string(),
            content: prompt,
        }];
        let content = self.complete_json(&messages, 0.3, 100).await?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn complete_json(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> anyhow::Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "response_format": {"type": "json_object"},
            "temperature": temperature,
            "max_tokens": max_tokens,
        });

        let resp = self
            .client
            .post(CHAT_COMPLETIONS_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let err_body = resp.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI chat API error ({}): {}", status, err_body);
        }

        let chat_resp: ChatResponse = resp.json().await?;
        Ok(chat_resp
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tutor_reply_parses_full_payload() {
        let raw = r#"{
            "correction": {
                "original": "我昨天去商店",
                "corrected": "我昨天去了商店",
                "corrected_pinyin": "wǒ zuótiān qùle shāngdiàn",
                "explanation": "Нужна частица 了 для прошедшего времени"
            },
            "response": "你买了什么？",
            "pinyin": "nǐ mǎile shénme?",
            "translation": "Что ты купил?",
            "suggestions": [{"text": "我买了水果", "pinyin": "wǒ mǎile shuǐguǒ"}]
        }"#;
        let reply: TutorReply = serde_json::from_str(raw).unwrap();
        assert!(reply.correction.is_some());
        assert_eq!(reply.response, "你买了什么？");
        assert_eq!(reply.suggestions.len(), 1);
    }

    #[test]
    fn tutor_reply_tolerates_missing_fields() {
        let reply: TutorReply = serde_json::from_str(r#"{"correction": null}"#).unwrap();
        assert!(reply.correction.is_none());
        assert_eq!(reply.response, "对不起，我不明白。");
        assert!(reply.suggestions.is_empty());
    }

    #[test]
    fn unknown_topic_falls_back_to_daily() {
        assert_eq!(topic_label("daily"), "日常生活 (быт)");
        assert_eq!(topic_label("nonsense"), "日常生活 (быт)");
    }
}
