//! Inbound queue consumer: webhook events in, user turns handed to the reply
//! coordinator.

use anyhow::{Context, Result};
use rb_channels::{ChannelAdapter, InboundMessage, InboundMessageKind};
use rb_core::{ReplyCoordinator, UserKey};
use rb_llm::LlmClient;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

const MAX_IN_FLIGHT_INBOUND: usize = 64;

#[derive(Clone)]
pub struct Gateway {
    channel: Arc<dyn ChannelAdapter>,
    llm: LlmClient,
    coordinator: Arc<ReplyCoordinator>,
    inbound_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>>,
}

impl Gateway {
    pub fn new(
        channel: Arc<dyn ChannelAdapter>,
        llm: LlmClient,
        coordinator: Arc<ReplyCoordinator>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
    ) -> Self {
        Self {
            channel,
            llm,
            coordinator,
            inbound_rx: Arc::new(tokio::sync::Mutex::new(inbound_rx)),
        }
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run_loop(shutdown).await {
                tracing::error!(%e, "gateway loop exited");
            }
        })
    }

    /// Each inbound event runs on its own task. A sender's events wait for that
    /// sender's previous event, so turns stay ordered per user while a slow
    /// voice note only holds up its own sender.
    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(&self, shutdown: CancellationToken) -> Result<()> {
        let permits = Arc::new(Semaphore::new(MAX_IN_FLIGHT_INBOUND));
        let mut workers = JoinSet::new();
        let mut tails: HashMap<String, CancellationToken> = HashMap::new();

        loop {
            let msg = {
                let mut rx = self.inbound_rx.lock().await;
                tokio::select! {
                    _ = shutdown.cancelled() => None,
                    msg = rx.recv() => msg,
                }
            };
            let Some(inbound) = msg else {
                break;
            };
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => permit?,
            };

            while workers.try_join_next().is_some() {}
            tails.retain(|_, done| !done.is_cancelled());

            let done = CancellationToken::new();
            let previous = tails.insert(inbound.sender_id.to_string(), done.clone());
            let gateway = self.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move {
                let _permit = permit;
                let _done = done.drop_guard();
                if let Some(previous) = previous {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = previous.cancelled() => {}
                    }
                }
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("inbound handling interrupted by shutdown");
                    }
                    result = gateway.handle_inbound(inbound) => {
                        if let Err(e) = result {
                            tracing::warn!(error = %format!("{e:#}"), "handle_inbound failed");
                        }
                    }
                }
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "inbound worker join failed");
            }
        }
        Ok(())
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(user = %inbound.sender_id, message_id = %inbound.message_id, kind = ?inbound.kind)
    )]
    pub async fn handle_inbound(&self, inbound: InboundMessage) -> Result<()> {
        if inbound.kind == InboundMessageKind::Reaction {
            tracing::debug!("ignoring reaction");
            return Ok(());
        }

        if let Err(e) = self.channel.mark_read(&inbound.message_id).await {
            tracing::warn!(error = %format!("{e:#}"), "mark_read failed");
        }

        let content = match inbound.kind {
            InboundMessageKind::Audio => self.transcribe(&inbound).await?,
            _ => inbound.content.trim().to_string(),
        };
        if content.is_empty() {
            tracing::debug!("dropping empty inbound message");
            return Ok(());
        }

        let user = UserKey::from(inbound.sender_id.into_inner());
        self.coordinator
            .accept(user, &content)
            .await
            .context("record user turn")?;
        Ok(())
    }

    async fn transcribe(&self, inbound: &InboundMessage) -> Result<String> {
        let media_id = inbound
            .media_id
            .as_ref()
            .context("audio message without media id")?;
        let media = self.channel.download_media(media_id).await?;
        let mime = inbound
            .media_mime
            .clone()
            .unwrap_or(media.mime_type);
        let text = self
            .llm
            .transcribe(media.bytes, audio_filename(&mime), &mime)
            .await
            .context("transcribe voice note")?;
        tracing::debug!(transcript_len = text.len(), "voice note transcribed");
        Ok(text)
    }
}

/// Whisper infers the container from the file extension.
fn audio_filename(mime: &str) -> &'static str {
    let essence = mime.split(';').next().unwrap_or_default().trim();
    match essence {
        "audio/ogg" | "audio/opus" => "voice.ogg",
        "audio/mpeg" | "audio/mp3" => "voice.mp3",
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" | "audio/aac" => "voice.m4a",
        "audio/wav" | "audio/x-wav" => "voice.wav",
        "audio/webm" => "voice.webm",
        _ => "voice.ogg",
    }
}
