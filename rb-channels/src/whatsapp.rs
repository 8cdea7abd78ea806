use crate::traits::ChannelAdapter;
use crate::types::{MediaId, MediaPayload, MessageId, OutboundKind, OutboundMessage};
use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Value, json};

pub const GRAPH_API_BASE: &str = "https://graph.facebook.com/v20.0";
const VOICE_NOTE_MIME: &str = "audio/mpeg";

#[derive(Clone)]
pub struct WhatsAppCloudAdapter {
    http: reqwest::Client,
    access_token: String,
    phone_number_id: String,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct MediaUploadResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MediaLookupResponse {
    url: String,
    #[serde(default)]
    mime_type: Option<String>,
}

impl WhatsAppCloudAdapter {
    pub fn new(access_token: &str, phone_number_id: &str) -> Result<Self> {
        let access_token = access_token.trim();
        if access_token.is_empty() {
            return Err(anyhow!("whatsapp access token is required"));
        }
        let phone_number_id = phone_number_id.trim();
        if phone_number_id.is_empty() {
            return Err(anyhow!("whatsapp phone number id is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            access_token: access_token.to_string(),
            phone_number_id: phone_number_id.to_string(),
            api_base: GRAPH_API_BASE.to_string(),
        })
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    fn messages_url(&self) -> String {
        format!("{}/{}/messages", self.api_base, self.phone_number_id)
    }

    fn media_upload_url(&self) -> String {
        format!("{}/{}/media", self.api_base, self.phone_number_id)
    }

    fn media_lookup_url(&self, media_id: &MediaId) -> String {
        format!("{}/{}", self.api_base, media_id)
    }

    async fn post_message(&self, payload: &Value, what: &str) -> Result<()> {
        let response = self
            .http
            .post(self.messages_url())
            .bearer_auth(&self.access_token)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("whatsapp {what} request failed"))?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!("whatsapp {what} failed: status={status} body={body}"));
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(audio_len = audio.len()))]
    async fn upload_audio(&self, audio: Bytes) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name("reply.mp3")
            .mime_str(VOICE_NOTE_MIME)?;
        let form = reqwest::multipart::Form::new()
            .text("messaging_product", "whatsapp")
            .text("type", VOICE_NOTE_MIME)
            .part("file", part);

        let response = self
            .http
            .post(self.media_upload_url())
            .bearer_auth(&self.access_token)
            .multipart(form)
            .send()
            .await
            .context("whatsapp media upload request failed")?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "whatsapp media upload failed: status={status} body={body}"
            ));
        }
        let uploaded: MediaUploadResponse =
            serde_json::from_str(&body).context("invalid whatsapp media upload response")?;
        Ok(uploaded.id)
    }
}

fn text_payload(to: &str, body: &str) -> Value {
    json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": "text",
        "text": {
            "preview_url": false,
            "body": body,
        }
    })
}

fn audio_payload(to: &str, media_id: &str) -> Value {
    json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": "audio",
        "audio": { "id": media_id }
    })
}

fn read_receipt_payload(message_id: &str) -> Value {
    json!({
        "messaging_product": "whatsapp",
        "status": "read",
        "message_id": message_id,
    })
}

#[async_trait::async_trait]
impl ChannelAdapter for WhatsAppCloudAdapter {
    fn channel_id(&self) -> &str {
        "whatsapp"
    }

    #[tracing::instrument(level = "info", skip_all, fields(to = %recipient_id, kind = ?message.kind))]
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        let to = recipient_id.trim();
        if to.is_empty() {
            return Err(anyhow!("recipient_id (E.164 phone number) is required"));
        }

        match (message.kind, message.audio) {
            (OutboundKind::Audio, Some(audio)) if !audio.is_empty() => {
                let media_id = self.upload_audio(audio).await?;
                self.post_message(&audio_payload(to, &media_id), "audio send")
                    .await
            }
            (OutboundKind::Audio, _) => Err(anyhow!("audio message has no audio payload")),
            (OutboundKind::Text, _) => {
                let text = message.content.trim();
                if text.is_empty() {
                    return Err(anyhow!("message content is empty"));
                }
                self.post_message(&text_payload(to, text), "send").await
            }
        }
    }

    async fn mark_read(&self, message_id: &MessageId) -> Result<()> {
        if message_id.trim().is_empty() {
            return Ok(());
        }
        self.post_message(&read_receipt_payload(message_id), "mark read")
            .await
    }

    #[tracing::instrument(level = "info", skip_all, fields(media_id = %media_id))]
    async fn download_media(&self, media_id: &MediaId) -> Result<MediaPayload> {
        let lookup = self
            .http
            .get(self.media_lookup_url(media_id))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("whatsapp media lookup request failed")?;
        let status = lookup.status();
        let body = lookup.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "whatsapp media lookup failed: status={status} body={body}"
            ));
        }
        let media: MediaLookupResponse =
            serde_json::from_str(&body).context("invalid whatsapp media lookup response")?;

        let download = self
            .http
            .get(&media.url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("whatsapp media download request failed")?;
        let status = download.status();
        if !status.is_success() {
            return Err(anyhow!("whatsapp media download failed: status={status}"));
        }
        let bytes = download.bytes().await?;
        tracing::debug!(bytes = bytes.len(), "media downloaded");
        Ok(MediaPayload {
            bytes,
            mime_type: media
                .mime_type
                .unwrap_or_else(|| "application/octet-stream".to_string()),
        })
    }
}
