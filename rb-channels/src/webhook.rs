//! WhatsApp Cloud webhook payloads and verification.

use crate::types::{InboundMessage, InboundMessageKind};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Answer to the GET subscription handshake: the challenge to echo back, or
/// `None` when the mode or token does not match.
pub fn verify_subscription<'a>(
    mode: Option<&str>,
    token: Option<&str>,
    challenge: Option<&'a str>,
    expected_token: &str,
) -> Option<&'a str> {
    let mode = mode.map(str::trim).unwrap_or_default();
    let token = token.map(str::trim).unwrap_or_default();
    if expected_token.is_empty() || !mode.eq_ignore_ascii_case("subscribe") {
        return None;
    }
    if !constant_time_eq(token, expected_token) {
        return None;
    }
    Some(challenge.unwrap_or_default())
}

pub fn verify_signature(signature_header: Option<&str>, body: &[u8], app_secret: &str) -> bool {
    let Some(signature) = signature_header.map(str::trim) else {
        return false;
    };
    constant_time_eq(&signature_for(app_secret, body), signature)
}

/// `x-hub-signature-256` header value for `body` signed with `app_secret`.
pub fn signature_for(app_secret: &str, body: &[u8]) -> String {
    format!("sha256={}", hmac_sha256_hex(app_secret.as_bytes(), body))
}

fn hmac_sha256_hex(key: &[u8], payload: &[u8]) -> String {
    const BLOCK: usize = 64;
    let mut key_block = [0_u8; BLOCK];
    if key.len() > BLOCK {
        key_block[..32].copy_from_slice(&Sha256::digest(key));
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let inner_pad: Vec<u8> = key_block.iter().map(|b| b ^ 0x36).collect();
    let outer_pad: Vec<u8> = key_block.iter().map(|b| b ^ 0x5c).collect();

    let inner_digest = Sha256::new()
        .chain_update(&inner_pad)
        .chain_update(payload)
        .finalize();
    let digest = Sha256::new()
        .chain_update(&outer_pad)
        .chain_update(inner_digest)
        .finalize();

    digest.iter().fold(String::with_capacity(64), |mut out, byte| {
        out.push(char::from_digit((byte >> 4) as u32, 16).unwrap_or('0'));
        out.push(char::from_digit((byte & 0x0f) as u32, 16).unwrap_or('0'));
        out
    })
}

fn constant_time_eq(left: &str, right: &str) -> bool {
    let (left, right) = (left.as_bytes(), right.as_bytes());
    let mut diff = left.len() ^ right.len();
    for index in 0..left.len().max(right.len()) {
        let l = left.get(index).copied().unwrap_or(0);
        let r = right.get(index).copied().unwrap_or(0);
        diff |= (l ^ r) as usize;
    }
    diff == 0
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    entry: Vec<WebhookEntry>,
}

#[derive(Debug, Deserialize)]
struct WebhookEntry {
    #[serde(default)]
    changes: Vec<WebhookChange>,
}

#[derive(Debug, Deserialize)]
struct WebhookChange {
    #[serde(default)]
    value: WebhookChangeValue,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookChangeValue {
    #[serde(default)]
    metadata: Option<WebhookMetadata>,
    #[serde(default)]
    messages: Vec<WebhookMessage>,
}

#[derive(Debug, Clone, Deserialize)]
struct WebhookMetadata {
    #[serde(default)]
    phone_number_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WebhookMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    from: String,
    #[serde(rename = "type", default)]
    message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<WebhookText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    audio: Option<WebhookMedia>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reaction: Option<WebhookReaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WebhookText {
    #[serde(default)]
    body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WebhookMedia {
    id: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    voice: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WebhookReaction {
    #[serde(default)]
    emoji: String,
}

impl WebhookPayload {
    pub fn parse(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).context("invalid whatsapp webhook payload")
    }

    /// Supported inbound messages in delivery order. Status callbacks and
    /// unsupported message types are dropped.
    pub fn into_inbound(self) -> Vec<InboundMessage> {
        let mut out = Vec::new();
        for change in self.entry.into_iter().flat_map(|entry| entry.changes) {
            let phone_number_id = change
                .value
                .metadata
                .as_ref()
                .and_then(|metadata| metadata.phone_number_id.as_deref())
                .unwrap_or_default()
                .to_string();
            for message in &change.value.messages {
                match convert_message(message, &phone_number_id) {
                    Some(inbound) => out.push(inbound),
                    None => tracing::debug!(
                        message_type = %message.message_type,
                        "skipping unsupported whatsapp message"
                    ),
                }
            }
        }
        out
    }
}

fn convert_message(message: &WebhookMessage, phone_number_id: &str) -> Option<InboundMessage> {
    let sender = message.from.trim();
    if sender.is_empty() {
        return None;
    }

    let (kind, content, media) = match message.message_type.as_str() {
        "text" => {
            let body = message.text.as_ref().map(|t| t.body.trim())?;
            (InboundMessageKind::Text, body.to_string(), None)
        }
        "audio" => {
            let audio = message.audio.as_ref().filter(|a| !a.id.trim().is_empty())?;
            (InboundMessageKind::Audio, String::new(), Some(audio))
        }
        "reaction" => {
            let emoji = message.reaction.as_ref().map(|r| r.emoji.trim())?;
            (InboundMessageKind::Reaction, emoji.to_string(), None)
        }
        _ => return None,
    };
    if kind != InboundMessageKind::Audio && content.is_empty() {
        return None;
    }

    let message_id = match message.id.trim() {
        "" => ulid::Ulid::new().to_string(),
        id => id.to_string(),
    };

    Some(InboundMessage {
        kind,
        message_id: message_id.into(),
        channel_id: "whatsapp".into(),
        sender_id: sender.into(),
        thread_id: Some(format!("wa:{phone_number_id}:{sender}").into()),
        content,
        media_id: media.map(|m| m.id.trim().into()),
        media_mime: media.and_then(|m| m.mime_type.clone()),
        metadata: serde_json::json!({
            "provider": "whatsapp_cloud",
            "phone_number_id": phone_number_id,
            "voice": media.is_some_and(|m| m.voice),
            "message": message,
        }),
        received_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(messages: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "biz",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "messaging_product": "whatsapp",
                        "metadata": { "phone_number_id": "12345" },
                        "messages": messages,
                    }
                }]
            }]
        }))
        .expect("payload")
    }

    #[test]
    fn hmac_matches_known_sha256_vector() {
        let digest = hmac_sha256_hex(b"key", b"The quick brown fox jumps over the lazy dog");
        assert_eq!(
            digest,
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn hmac_hashes_oversized_keys() {
        let long_key = [0xaa_u8; 131];
        let digest = hmac_sha256_hex(&long_key, b"Test Using Larger Than Block-Size Key - Hash Key First");
        assert_eq!(
            digest,
            "60e431591ee0b67f0d8a26aacbf5b77f8e0bc6213728c5140546040f0ee37f54"
        );
    }

    #[test]
    fn signature_verification_checks_secret_and_presence() {
        let body = br#"{"hello":"world"}"#;
        let signature = signature_for("secret", body);
        assert!(verify_signature(Some(&signature), body, "secret"));
        assert!(!verify_signature(Some(&signature), body, "wrong"));
        assert!(!verify_signature(None, body, "secret"));
    }

    #[test]
    fn subscription_handshake_echoes_challenge() {
        assert_eq!(
            verify_subscription(Some("subscribe"), Some("tok"), Some("42"), "tok"),
            Some("42")
        );
        assert_eq!(
            verify_subscription(Some("subscribe"), Some("bad"), Some("42"), "tok"),
            None
        );
        assert_eq!(
            verify_subscription(Some("unsubscribe"), Some("tok"), Some("42"), "tok"),
            None
        );
        assert_eq!(verify_subscription(Some("subscribe"), Some(""), None, ""), None);
    }

    #[test]
    fn text_message_converts_to_inbound() {
        let body = payload(serde_json::json!([{
            "id": "wamid.abc",
            "from": "15551234567",
            "type": "text",
            "text": { "body": " hello " }
        }]));
        let inbound = WebhookPayload::parse(&body).expect("parse").into_inbound();
        assert_eq!(inbound.len(), 1);
        let msg = &inbound[0];
        assert_eq!(msg.kind, InboundMessageKind::Text);
        assert_eq!(msg.channel_id.as_str(), "whatsapp");
        assert_eq!(msg.sender_id.as_str(), "15551234567");
        assert_eq!(msg.message_id.as_str(), "wamid.abc");
        assert_eq!(msg.content, "hello");
        assert_eq!(
            msg.thread_id.as_ref().map(|t| t.as_str()),
            Some("wa:12345:15551234567")
        );
    }

    #[test]
    fn voice_note_carries_media_id_and_empty_content() {
        let body = payload(serde_json::json!([{
            "id": "wamid.voice",
            "from": "15551234567",
            "type": "audio",
            "audio": { "id": "media-1", "mime_type": "audio/ogg; codecs=opus", "voice": true }
        }]));
        let inbound = WebhookPayload::parse(&body).expect("parse").into_inbound();
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].kind, InboundMessageKind::Audio);
        assert!(inbound[0].content.is_empty());
        assert_eq!(
            inbound[0].media_id.as_ref().map(|m| m.as_str()),
            Some("media-1")
        );
        assert_eq!(
            inbound[0].media_mime.as_deref(),
            Some("audio/ogg; codecs=opus")
        );
        assert_eq!(inbound[0].metadata["voice"], true);
    }

    #[test]
    fn reactions_convert_and_unsupported_types_are_dropped() {
        let body = payload(serde_json::json!([
            { "id": "wamid.r", "from": "1555", "type": "reaction", "reaction": { "emoji": "🔥" } },
            { "id": "wamid.i", "from": "1555", "type": "image", "image": { "id": "img" } },
            { "id": "wamid.t", "from": "", "type": "text", "text": { "body": "no sender" } },
            { "id": "wamid.e", "from": "1555", "type": "text", "text": { "body": "  " } }
        ]));
        let inbound = WebhookPayload::parse(&body).expect("parse").into_inbound();
        assert_eq!(inbound.len(), 1);
        assert!(inbound[0].is_reaction());
        assert_eq!(inbound[0].content, "🔥");
    }

    #[test]
    fn status_callbacks_yield_nothing() {
        let body = serde_json::to_vec(&serde_json::json!({
            "entry": [{ "changes": [{ "value": { "statuses": [{ "id": "wamid.x", "status": "delivered" }] } }] }]
        }))
        .expect("payload");
        let inbound = WebhookPayload::parse(&body).expect("parse").into_inbound();
        assert!(inbound.is_empty());
    }

    #[test]
    fn missing_message_id_gets_generated_one() {
        let body = payload(serde_json::json!([{
            "from": "1555", "type": "text", "text": { "body": "hi" }
        }]));
        let inbound = WebhookPayload::parse(&body).expect("parse").into_inbound();
        assert_eq!(inbound[0].message_id.as_str().len(), 26);
    }

    #[test]
    fn garbage_body_is_rejected() {
        assert!(WebhookPayload::parse(b"not json").is_err());
    }
}
