use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(MessageId);
id_newtype!(ChannelId);
id_newtype!(SenderId);
id_newtype!(ThreadId);
id_newtype!(MediaId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundMessageKind {
    Text,
    /// Voice note or audio file; `content` is empty until transcribed.
    Audio,
    Reaction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub kind: InboundMessageKind,
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub sender_id: SenderId,
    pub thread_id: Option<ThreadId>,
    pub content: String,
    #[serde(default)]
    pub media_id: Option<MediaId>,
    #[serde(default)]
    pub media_mime: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn is_reaction(&self) -> bool {
        self.kind == InboundMessageKind::Reaction
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutboundKind {
    #[default]
    Text,
    Audio,
}

#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub content: String,
    pub kind: OutboundKind,
    /// Encoded audio (mp3) for `OutboundKind::Audio`.
    pub audio: Option<Bytes>,
}

impl OutboundMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: OutboundKind::Text,
            audio: None,
        }
    }

    pub fn audio(content: impl Into<String>, audio: Bytes) -> Self {
        Self {
            content: content.into(),
            kind: OutboundKind::Audio,
            audio: Some(audio),
        }
    }
}

/// Media fetched from the channel.
#[derive(Debug, Clone)]
pub struct MediaPayload {
    pub bytes: Bytes,
    pub mime_type: String,
}
