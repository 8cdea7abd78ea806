use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

/// Scopes all per-user state (debounce timers, executions, history).
/// For WhatsApp this is the sender's phone number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserKey(String);

impl UserKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for UserKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for UserKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl AsRef<str> for UserKey {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for UserKey {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Audio,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Audio => "audio",
        }
    }
}

/// One reply fragment parsed out of the model's `{"messages": [...]}` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub content: String,
    /// Omitted `type` falls back to text.
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
}

impl Message {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: MessageKind::Text,
        }
    }

    pub fn audio(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: MessageKind::Audio,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// A prior chat-history entry handed to the completion source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}
