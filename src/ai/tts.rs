use reqwest::Client;

use crate::config::AppConfig;

const SPEECH_URL: &str = "https://api.openai.com/v1/audio/speech";

/// User-facing speed setting to TTS speed factor.
pub fn speed_factor(speed: &str) -> f32 {
    match speed {
        "slow" => 0.8,
        "fast" => 1.2,
        _ => 1.0,
    }
}

pub struct TtsClient {
    client: Client,
    api_key: String,
    model: String,
    voice: String,
}

impl TtsClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            api_key: config.openai_api_key.clone(),
            model: config.tts_model.clone(),
            voice: config.tts_voice.clone(),
        }
    }

    /// Synthesize Chinese speech as opus audio, ready for a Telegram voice
    /// message.
    pub async fn synthesize(&self, text: &str, speed: &str) -> anyhow::Result<Vec<u8>> {
        let body = serde_json::json!({
            "model": self.model,
            "voice": self.voice,
            "input": text,
            "speed": speed_factor(speed),
            "response_format": "opus",
        });

        let resp = self
            .client
            .post(SPEECH_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let err_body = resp.text().await.unwrap_or_default();
            anyhow::bail!("TTS API error ({}): {}", status, err_body);
        }

        let audio = resp.bytes().await?;
        tracing::debug!("synthesized {} bytes of audio", audio.len());
        Ok(audio.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_mapping() {
        assert_eq!(speed_factor("slow"), 0.8);
        assert_eq!(speed_factor("normal"), 1.0);
        assert_eq!(speed_factor("fast"), 1.2);
        assert_eq!(speed_factor("unknown"), 1.0);
    }
}
