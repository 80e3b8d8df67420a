use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;

use crate::config::AppConfig;

const TRANSCRIPTIONS_URL: &str = "https://api.openai.com/v1/audio/transcriptions";

#[derive(Debug, Deserialize)]
struct Transcript {
    text: String,
}

/// Whisper transcription over HTTP. Telegram's OGG/Opus voice files are
/// passed through as-is.
pub struct SttClient {
    client: Client,
    api_key: String,
}

impl SttClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            api_key: config.openai_api_key.clone(),
        }
    }

    /// Transcribe a voice message to Chinese text.
    pub async fn transcribe(&self, audio: Vec<u8>, filename: &str) -> anyhow::Result<String> {
        tracing::debug!("transcribing {} bytes of audio", audio.len());

        let part = Part::bytes(audio)
            .file_name(filename.to_string())
            .mime_str("audio/ogg")?;
        let form = Form::new()
            .text("model", "whisper-1")
            .text("language", "zh")
            .part("file", part);

        let resp = self
            .client
            .post(TRANSCRIPTIONS_URL)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let err_body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Whisper API error ({}): {}", status, err_body);
        }

        let transcript: Transcript = resp.json().await?;
        Ok(transcript.text)
    }
}
