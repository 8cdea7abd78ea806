use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, ResponseFormat, Role, StreamChunk, Usage};
use bytes::Bytes;
use futures_util::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const TRANSCRIPTION_MODEL: &str = "whisper-1";

#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    api_base: String,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client, api_key: &str, model: &str, api_base: &str) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model))]
    pub async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        format: ResponseFormat,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>> {
        let req = OpenAiChatRequest::new(&self.model, messages, format);

        let response = self
            .http
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                service: "openai chat",
                status: status.as_u16(),
                body,
            });
        }

        Ok(Box::pin(stream_chunks(decode_sse(response.bytes_stream()))))
    }

    #[tracing::instrument(level = "info", skip_all, fields(audio_len = audio.len()))]
    pub async fn transcribe(&self, audio: Bytes, filename: &str, mime: &str) -> Result<String> {
        if audio.is_empty() {
            return Err(LlmError::InvalidInput("audio payload is empty".to_string()));
        }
        let part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name(filename.to_string())
            .mime_str(mime)
            .map_err(|e| LlmError::InvalidInput(format!("invalid audio mime {mime}: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .text("model", TRANSCRIPTION_MODEL)
            .part("file", part);

        let response = self
            .http
            .post(format!("{}/audio/transcriptions", self.api_base))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Status {
                service: "openai transcription",
                status: status.as_u16(),
                body,
            });
        }

        let parsed: OpenAiTranscription = serde_json::from_str(&body)?;
        Ok(parsed.text.trim().to_string())
    }
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    stream: bool,
    stream_options: OpenAiStreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<OpenAiResponseFormat>,
}

#[derive(Debug, Serialize)]
struct OpenAiStreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct OpenAiResponseFormat {
    r#type: &'static str,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: &'static str,
    content: String,
}

impl OpenAiChatRequest {
    fn new(model: &str, messages: &[ChatMessage], format: ResponseFormat) -> Self {
        Self {
            model: model.to_string(),
            messages: messages.iter().map(to_openai_message).collect(),
            stream: true,
            stream_options: OpenAiStreamOptions {
                include_usage: true,
            },
            response_format: match format {
                ResponseFormat::Text => None,
                ResponseFormat::JsonObject => Some(OpenAiResponseFormat {
                    r#type: "json_object",
                }),
            },
        }
    }
}

fn to_openai_message(m: &ChatMessage) -> OpenAiMessage {
    let role = match m.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    OpenAiMessage {
        role,
        content: m.content.clone(),
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiTranscription {
    #[serde(default)]
    text: String,
}

#[derive(Debug)]
enum SseEvent {
    Data(String),
    Other,
}

/// Events are split on raw bytes and decoded as UTF-8 only once complete.
fn decode_sse<S>(bytes_stream: S) -> impl Stream<Item = Result<SseEvent>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    futures_util::stream::unfold(
        (bytes_stream, Vec::<u8>::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                if let Some(idx) = buffer.windows(2).position(|w| w == b"\n\n") {
                    let raw: Vec<u8> = buffer.drain(..idx + 2).take(idx).collect();
                    let raw = match String::from_utf8(raw) {
                        Ok(raw) => raw,
                        Err(e) => {
                            return Some((
                                Err(LlmError::StreamParse(format!("sse event is not utf-8: {e}"))),
                                (stream, buffer),
                            ));
                        }
                    };

                    let data_lines: Vec<&str> = raw
                        .lines()
                        .filter_map(|line| line.trim_end().strip_prefix("data:"))
                        .map(str::trim_start)
                        .collect();
                    if data_lines.is_empty() {
                        return Some((Ok(SseEvent::Other), (stream, buffer)));
                    }
                    return Some((Ok(SseEvent::Data(data_lines.join("\n"))), (stream, buffer)));
                }

                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
                    }
                    Some(Err(e)) => {
                        return Some((Err(LlmError::Http(e.to_string())), (stream, buffer)));
                    }
                    None => return None,
                }
            }
        },
    )
}

/// Map SSE events to content deltas; `[DONE]` ends the stream with usage.
fn stream_chunks<S>(events: S) -> impl Stream<Item = Result<StreamChunk>> + Send
where
    S: Stream<Item = Result<SseEvent>> + Send + 'static,
{
    futures_util::stream::unfold(
        (Box::pin(events), None::<Usage>, false),
        |(mut events, mut usage, done)| async move {
            if done {
                return None;
            }
            loop {
                let data = match events.as_mut().next().await? {
                    Ok(SseEvent::Data(data)) => data,
                    Ok(SseEvent::Other) => continue,
                    Err(e) => return Some((Err(e), (events, usage, false))),
                };

                if data.trim() == "[DONE]" {
                    let usage_out = usage.clone().unwrap_or_default();
                    return Some((Ok(StreamChunk::Done { usage: usage_out }), (events, usage, true)));
                }

                let chunk: OpenAiStreamResponseChunk = match serde_json::from_str(&data) {
                    Ok(v) => v,
                    Err(e) => {
                        return Some((
                            Err(LlmError::StreamParse(format!(
                                "openai chunk json error={e} data={data}"
                            ))),
                            (events, usage, false),
                        ));
                    }
                };

                if let Some(u) = chunk.usage.as_ref() {
                    usage = Some(Usage {
                        prompt_tokens: u.prompt_tokens.unwrap_or(0) as u32,
                        completion_tokens: u.completion_tokens.unwrap_or(0) as u32,
                    });
                }

                let content = chunk
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.delta.content)
                    .filter(|content| !content.is_empty());
                if let Some(content) = content {
                    return Some((Ok(StreamChunk::Delta { content }), (events, usage, false)));
                }
            }
        },
    )
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamResponseChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiStreamUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDelta {
    #[serde(default)]
    content: Option<String>,
}
