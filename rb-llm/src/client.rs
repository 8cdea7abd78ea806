use crate::error::{LlmError, Result};
use crate::openai::{OPENAI_API_BASE, OpenAiClient};
use crate::types::{ChatMessage, ResponseFormat, StreamChunk};
use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::time::Duration;

/// Streaming completions are long-lived; the timeout only bounds a stalled
/// connection, not a slow model.
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone)]
pub struct LlmClient {
    inner: OpenAiClient,
    model: String,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(api_key: &str, model: &str) -> Result<Self> {
        Self::with_api_base(api_key, model, OPENAI_API_BASE)
    }

    pub fn with_api_base(api_key: &str, model: &str, api_base: &str) -> Result<Self> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(LlmError::InvalidInput("openai api key is required".to_string()));
        }
        let model = model.trim();
        if model.is_empty() {
            return Err(LlmError::InvalidInput("model is required".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Ok(Self {
            inner: OpenAiClient::new(http, api_key, model, api_base),
            model: model.to_string(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        format: ResponseFormat,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>> {
        if messages.is_empty() {
            return Err(LlmError::InvalidInput(
                "chat_stream requires at least one message".to_string(),
            ));
        }
        self.inner.chat_stream(messages, format).await
    }

    pub async fn transcribe(&self, audio: Bytes, filename: &str, mime: &str) -> Result<String> {
        self.inner.transcribe(audio, filename, mime).await
    }
}
