//! Bindings from the reply core's collaborator traits to OpenAI, ElevenLabs
//! and the WhatsApp channel.

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use rb_channels::{ChannelAdapter, OutboundMessage};
use rb_core::{
    ChatTurn, CompletionSource, CoreError, DeltaStream, Message, MessageKind, ReplySink, TurnRole,
    UserKey,
};
use rb_llm::{ChatMessage, LlmClient, ResponseFormat, SpeechClient, StreamChunk};
use std::sync::Arc;

pub struct OpenAiCompletion {
    llm: LlmClient,
    system_prompt: String,
}

impl OpenAiCompletion {
    pub fn new(llm: LlmClient, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
        }
    }
}

fn prompt_messages(system_prompt: &str, history: &[ChatTurn]) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    if !system_prompt.trim().is_empty() {
        messages.push(ChatMessage::system(system_prompt));
    }
    messages.extend(history.iter().map(|turn| match turn.role {
        TurnRole::User => ChatMessage::user(turn.content.as_str()),
        TurnRole::Assistant => ChatMessage::assistant(turn.content.as_str()),
    }));
    messages
}

/// Content deltas only; the terminal usage chunk is logged and dropped.
fn content_deltas<S>(chunks: S) -> impl Stream<Item = rb_core::Result<String>> + Send
where
    S: Stream<Item = rb_llm::Result<StreamChunk>> + Send,
{
    chunks.filter_map(|chunk| async move {
        match chunk {
            Ok(StreamChunk::Delta { content }) => Some(Ok(content)),
            Ok(StreamChunk::Done { usage }) => {
                tracing::debug!(
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    "completion stream finished"
                );
                None
            }
            Err(e) => Some(Err(CoreError::Upstream(e.to_string()))),
        }
    })
}

#[async_trait]
impl CompletionSource for OpenAiCompletion {
    #[tracing::instrument(level = "info", skip_all, fields(user = %user, model = %self.llm.model(), turns = history.len()))]
    async fn stream(&self, user: &UserKey, history: &[ChatTurn]) -> rb_core::Result<DeltaStream> {
        let messages = prompt_messages(&self.system_prompt, history);
        let chunks = self
            .llm
            .chat_stream(&messages, ResponseFormat::JsonObject)
            .await
            .map_err(|e| CoreError::Upstream(e.to_string()))?;
        Ok(Box::pin(content_deltas(chunks)))
    }
}

pub struct WhatsAppReplySink {
    channel: Arc<dyn ChannelAdapter>,
    speech: Option<SpeechClient>,
}

impl WhatsAppReplySink {
    pub fn new(channel: Arc<dyn ChannelAdapter>, speech: Option<SpeechClient>) -> Self {
        Self { channel, speech }
    }

    async fn outbound(&self, message: &Message) -> OutboundMessage {
        if message.kind == MessageKind::Text {
            return OutboundMessage::text(message.content.as_str());
        }
        let Some(speech) = self.speech.as_ref() else {
            tracing::debug!("text-to-speech not configured; sending audio reply as text");
            return OutboundMessage::text(message.content.as_str());
        };
        match speech.synthesize(&message.content).await {
            Ok(audio) => OutboundMessage::audio(message.content.as_str(), audio),
            Err(e) => {
                tracing::warn!(error = %e, "speech synthesis failed; sending audio reply as text");
                OutboundMessage::text(message.content.as_str())
            }
        }
    }
}

#[async_trait]
impl ReplySink for WhatsAppReplySink {
    #[tracing::instrument(level = "info", skip_all, fields(to = %to, kind = message.kind.as_str()))]
    async fn send(&self, to: &UserKey, message: &Message) -> rb_core::Result<()> {
        let outbound = self.outbound(message).await;
        self.channel
            .send(to, outbound)
            .await
            .map_err(|e| CoreError::Send(format!("{e:#}")))
    }
}
