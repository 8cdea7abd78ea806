use crate::error::Result;
use crate::types::{ChatTurn, Message, UserKey};
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;

/// Raw text deltas from a streaming completion, fed unmodified to the ingestor.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Prior turns for `user`, oldest first.
    async fn load(&self, user: &UserKey) -> Result<Vec<ChatTurn>>;

    async fn append_user(&self, user: &UserKey, content: &str) -> Result<()>;

    async fn append_bot(&self, user: &UserKey, content: &str) -> Result<()>;
}

#[async_trait]
pub trait CompletionSource: Send + Sync {
    async fn stream(&self, user: &UserKey, history: &[ChatTurn]) -> Result<DeltaStream>;
}

#[async_trait]
pub trait ReplySink: Send + Sync {
    /// Deliver one reply fragment. Callers never retry.
    async fn send(&self, to: &UserKey, message: &Message) -> Result<()>;
}
