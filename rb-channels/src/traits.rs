use crate::types::{MediaId, MediaPayload, MessageId, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier, e.g. "whatsapp".
    fn channel_id(&self) -> &str;

    /// Send a message to a specific user on this platform.
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()>;

    /// Mark an inbound message as read where supported.
    async fn mark_read(&self, _message_id: &MessageId) -> Result<()> {
        Ok(())
    }

    /// Fetch inbound media (voice notes, audio files) by platform id.
    async fn download_media(&self, _media_id: &MediaId) -> Result<MediaPayload> {
        Err(anyhow::anyhow!(
            "download_media is not supported by this channel"
        ))
    }
}
