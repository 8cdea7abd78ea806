//! ElevenLabs text-to-speech for voice-note replies.

use crate::error::{LlmError, Result};
use bytes::Bytes;
use serde::Serialize;

pub const ELEVENLABS_API_BASE: &str = "https://api.elevenlabs.io/v1";
const DEFAULT_TTS_MODEL: &str = "eleven_multilingual_v2";
/// Upstream rejects longer single requests.
const MAX_TTS_CHARS: usize = 5_000;

#[derive(Clone)]
pub struct SpeechClient {
    http: reqwest::Client,
    api_key: String,
    voice_id: String,
    model_id: String,
    api_base: String,
}

#[derive(Debug, Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
    model_id: &'a str,
}

impl SpeechClient {
    pub fn new(api_key: &str, voice_id: &str) -> Result<Self> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(LlmError::InvalidInput(
                "elevenlabs api key is required".to_string(),
            ));
        }
        let voice_id = voice_id.trim();
        if voice_id.is_empty() {
            return Err(LlmError::InvalidInput(
                "elevenlabs voice id is required".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            api_key: api_key.to_string(),
            voice_id: voice_id.to_string(),
            model_id: DEFAULT_TTS_MODEL.to_string(),
            api_base: ELEVENLABS_API_BASE.to_string(),
        })
    }

    pub fn with_model(mut self, model_id: Option<String>) -> Self {
        if let Some(model_id) = model_id.filter(|m| !m.trim().is_empty()) {
            self.model_id = model_id;
        }
        self
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    /// Synthesize `text` to MP3 bytes.
    #[tracing::instrument(level = "info", skip_all, fields(text_len = text.len()))]
    pub async fn synthesize(&self, text: &str) -> Result<Bytes> {
        let text = text.trim();
        if text.is_empty() {
            return Err(LlmError::InvalidInput("tts text is empty".to_string()));
        }
        if text.chars().count() > MAX_TTS_CHARS {
            return Err(LlmError::InvalidInput(format!(
                "tts text exceeds {MAX_TTS_CHARS} characters"
            )));
        }

        let response = self
            .http
            .post(self.speech_url())
            .header("xi-api-key", &self.api_key)
            .header(reqwest::header::ACCEPT, "audio/mpeg")
            .json(&TtsRequest {
                text,
                model_id: &self.model_id,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                service: "elevenlabs tts",
                status: status.as_u16(),
                body,
            });
        }

        let audio = response.bytes().await?;
        if audio.is_empty() {
            return Err(LlmError::ResponseFormat(
                "elevenlabs returned empty audio".to_string(),
            ));
        }
        tracing::debug!(audio_len = audio.len(), "speech synthesized");
        Ok(audio)
    }

    fn speech_url(&self) -> String {
        format!("{}/text-to-speech/{}", self.api_base, self.voice_id)
    }
}
