//! In-memory collaborators for unit tests.

use crate::error::{CoreError, Result};
use crate::traits::{CompletionSource, DeltaStream, HistoryStore, ReplySink};
use crate::types::{ChatTurn, Message, UserKey};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(UserKey, Message)>>,
    attempts: AtomicUsize,
    fail_on: Option<String>,
}

impl RecordingSink {
    pub fn failing_on(content: &str) -> Self {
        Self {
            fail_on: Some(content.to_string()),
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<(UserKey, Message)> {
        self.sent.lock().expect("sink lock").clone()
    }

    pub fn sent_contents(&self) -> Vec<String> {
        self.sent().into_iter().map(|(_, m)| m.content).collect()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplySink for RecordingSink {
    async fn send(&self, to: &UserKey, message: &Message) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_on.as_deref() == Some(message.content.as_str()) {
            return Err(CoreError::Send(format!("refused {}", message.content)));
        }
        self.sent
            .lock()
            .expect("sink lock")
            .push((to.clone(), message.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryHistory {
    turns: Mutex<HashMap<UserKey, Vec<ChatTurn>>>,
    fail_bot_append: bool,
}

impl MemoryHistory {
    pub fn failing_bot_append() -> Self {
        Self {
            fail_bot_append: true,
            ..Self::default()
        }
    }

    pub fn turns(&self, user: &UserKey) -> Vec<ChatTurn> {
        self.turns
            .lock()
            .expect("history lock")
            .get(user)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn load(&self, user: &UserKey) -> Result<Vec<ChatTurn>> {
        Ok(self.turns(user))
    }

    async fn append_user(&self, user: &UserKey, content: &str) -> Result<()> {
        self.turns
            .lock()
            .expect("history lock")
            .entry(user.clone())
            .or_default()
            .push(ChatTurn::user(content));
        Ok(())
    }

    async fn append_bot(&self, user: &UserKey, content: &str) -> Result<()> {
        if self.fail_bot_append {
            return Err(CoreError::History("disk full".to_string()));
        }
        self.turns
            .lock()
            .expect("history lock")
            .entry(user.clone())
            .or_default()
            .push(ChatTurn::assistant(content));
        Ok(())
    }
}

/// Replays fixed deltas as a stream.
pub struct ScriptedCompletion {
    deltas: Vec<Result<String>>,
    calls: AtomicUsize,
}

impl ScriptedCompletion {
    pub fn new(deltas: &[&str]) -> Self {
        Self {
            deltas: deltas.iter().map(|d| Ok(d.to_string())).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_after(deltas: &[&str], error: &str) -> Self {
        let mut out = Self::new(deltas);
        out.deltas.push(Err(CoreError::Upstream(error.to_string())));
        out
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionSource for ScriptedCompletion {
    async fn stream(&self, _user: &UserKey, _history: &[ChatTurn]) -> Result<DeltaStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let items: Vec<Result<String>> = self
            .deltas
            .iter()
            .map(|d| match d {
                Ok(s) => Ok(s.clone()),
                Err(e) => Err(CoreError::Upstream(e.to_string())),
            })
            .collect();
        Ok(Box::pin(futures_util::stream::iter(items)))
    }
}

/// Stream fed by the test through a channel, so chunks arrive on demand.
pub struct ChannelCompletion {
    rx: Mutex<Option<mpsc::UnboundedReceiver<Result<String>>>>,
}

impl ChannelCompletion {
    pub fn pair() -> (Self, mpsc::UnboundedSender<Result<String>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

#[async_trait]
impl CompletionSource for ChannelCompletion {
    async fn stream(&self, _user: &UserKey, _history: &[ChatTurn]) -> Result<DeltaStream> {
        let rx = self
            .rx
            .lock()
            .expect("completion lock")
            .take()
            .ok_or_else(|| CoreError::Upstream("stream already taken".to_string()))?;
        Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }
}
