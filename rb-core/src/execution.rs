use crate::dispatch::MessageDispatcher;
use crate::error::Result;
use crate::ingest::StreamIngestor;
use crate::supervisor::ExecutionSupervisor;
use crate::traits::{CompletionSource, HistoryStore, ReplySink};
use crate::types::UserKey;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed {
        fragments: usize,
        sent: usize,
        skipped: usize,
        persisted: bool,
    },
    /// Superseded or stopped; fragments already sent stay sent.
    Cancelled { sent: usize },
}

/// One streamed reply for one user: history in, fragments out, aggregate
/// persisted at the end.
#[derive(Clone)]
pub struct ReplyExecution {
    history: Arc<dyn HistoryStore>,
    completion: Arc<dyn CompletionSource>,
    sink: Arc<dyn ReplySink>,
}

impl ReplyExecution {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        completion: Arc<dyn CompletionSource>,
        sink: Arc<dyn ReplySink>,
    ) -> Self {
        Self {
            history,
            completion,
            sink,
        }
    }

    /// Register with `supervisor` (superseding any running execution for the
    /// same user), run, then release the registration if it is still ours.
    pub async fn run_supervised(
        &self,
        supervisor: &ExecutionSupervisor,
        user: &UserKey,
    ) -> Result<ExecutionOutcome> {
        let ticket = supervisor.start(user);
        let result = self.run(user, ticket.token()).await;
        supervisor.cleanup(user, &ticket);
        result
    }

    #[tracing::instrument(level = "info", skip_all, fields(user = %user))]
    pub async fn run(&self, user: &UserKey, cancel: &CancellationToken) -> Result<ExecutionOutcome> {
        let started = Instant::now();

        let history = self.history.load(user).await?;
        if cancel.is_cancelled() {
            return Ok(cancelled("after history load", 0));
        }
        tracing::debug!(history_turns = history.len(), "history loaded");

        let mut deltas = self.completion.stream(user, &history).await?;
        if cancel.is_cancelled() {
            return Ok(cancelled("after completion request", 0));
        }

        let mut ingestor = StreamIngestor::new();
        let mut dispatcher = MessageDispatcher::new(user.clone(), self.sink.clone());
        let mut first_fragment_ms = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Ok(cancelled("while streaming", dispatcher.sent_count()));
                }
                next = deltas.next() => next,
            };
            let Some(delta) = next else {
                break;
            };
            let delta = delta?;

            let messages = ingestor.add_chunk(&delta);
            if messages.is_empty() {
                continue;
            }
            if first_fragment_ms.is_none() {
                first_fragment_ms = Some(started.elapsed().as_millis() as u64);
            }
            dispatcher.dispatch(messages, cancel).await;
        }

        if cancel.is_cancelled() {
            return Ok(cancelled("after stream end", dispatcher.sent_count()));
        }
        if ingestor.has_pending_object() {
            tracing::warn!(
                buffered_len = ingestor.buffered_len(),
                parsed_up_to = ingestor.parsed_up_to(),
                "completion ended inside an unfinished fragment"
            );
        }

        let aggregate = dispatcher.finalize();
        if aggregate.is_empty() {
            tracing::warn!("completion produced no reply fragments");
        }
        let persisted = match self.history.append_bot(user, &aggregate).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "failed to persist aggregate reply");
                false
            }
        };

        let outcome = ExecutionOutcome::Completed {
            fragments: dispatcher.observed_count(),
            sent: dispatcher.sent_count(),
            skipped: ingestor.skipped(),
            persisted,
        };
        tracing::info!(
            latency_ms = started.elapsed().as_millis() as u64,
            first_fragment_ms = ?first_fragment_ms,
            outcome = ?outcome,
            "reply execution completed"
        );
        Ok(outcome)
    }
}

fn cancelled(checkpoint: &'static str, sent: usize) -> ExecutionOutcome {
    tracing::info!(checkpoint, sent, "reply execution cancelled");
    ExecutionOutcome::Cancelled { sent }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::testing::{ChannelCompletion, MemoryHistory, RecordingSink, ScriptedCompletion};
    use crate::types::{ChatTurn, Message};
    use std::time::Duration;

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn streams_fragments_then_persists_aggregate() {
        let history = Arc::new(MemoryHistory::default());
        let sink = Arc::new(RecordingSink::default());
        let completion = Arc::new(ScriptedCompletion::new(&[
            r#"{"mes"#,
            r#"sages": ["#,
            r#"{"content": "Hi"#,
            r#"", "type": "text"}, {"content": "Listen", "type": "audio"}]}"#,
        ]));
        let execution = ReplyExecution::new(history.clone(), completion, sink.clone());
        let user = UserKey::from("15550001");
        history.append_user(&user, "hello").await.expect("append user");

        let outcome = execution
            .run(&user, &CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(
            outcome,
            ExecutionOutcome::Completed {
                fragments: 2,
                sent: 2,
                skipped: 0,
                persisted: true,
            }
        );
        assert_eq!(
            sink.sent(),
            vec![
                (user.clone(), Message::text("Hi")),
                (user.clone(), Message::audio("Listen")),
            ]
        );
        assert_eq!(
            history.turns(&user),
            vec![ChatTurn::user("hello"), ChatTurn::assistant("Hi\n\nListen")]
        );
    }

    #[tokio::test]
    async fn cancellation_mid_stream_stops_sending_and_skips_persistence() {
        let history = Arc::new(MemoryHistory::default());
        let sink = Arc::new(RecordingSink::default());
        let (completion, tx) = ChannelCompletion::pair();
        let execution = ReplyExecution::new(history.clone(), Arc::new(completion), sink.clone());
        let user = UserKey::from("15550001");
        let cancel = CancellationToken::new();

        let task = {
            let execution = execution.clone();
            let user = user.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { execution.run(&user, &cancel).await })
        };

        tx.send(Ok(r#"{"messages":[{"content":"first","type":"text"},"#.to_string()))
            .expect("send chunk");
        wait_until(|| sink.sent().len() == 1).await;

        cancel.cancel();
        let _ = tx.send(Ok(r#"{"content":"stale","type":"text"}]}"#.to_string()));

        let outcome = task.await.expect("join").expect("run");
        assert_eq!(outcome, ExecutionOutcome::Cancelled { sent: 1 });
        assert_eq!(sink.sent_contents(), vec!["first".to_string()]);
        assert!(history.turns(&user).is_empty());
    }

    #[tokio::test]
    async fn newer_start_supersedes_running_execution() {
        let history = Arc::new(MemoryHistory::default());
        let sink = Arc::new(RecordingSink::default());
        let (completion, tx) = ChannelCompletion::pair();
        let execution = ReplyExecution::new(history.clone(), Arc::new(completion), sink.clone());
        let supervisor = Arc::new(ExecutionSupervisor::new());
        let user = UserKey::from("15550001");

        let task = {
            let execution = execution.clone();
            let supervisor = supervisor.clone();
            let user = user.clone();
            tokio::spawn(async move { execution.run_supervised(&supervisor, &user).await })
        };
        wait_until(|| supervisor.is_running(&user)).await;

        let newer = supervisor.start(&user);
        let outcome = task.await.expect("join").expect("run");
        drop(tx);

        assert_eq!(outcome, ExecutionOutcome::Cancelled { sent: 0 });
        assert!(supervisor.is_running(&user));
        assert!(!newer.is_cancelled());
        assert!(supervisor.cleanup(&user, &newer));
    }

    #[tokio::test]
    async fn upstream_error_aborts_without_persisting() {
        let history = Arc::new(MemoryHistory::default());
        let sink = Arc::new(RecordingSink::default());
        let completion = Arc::new(ScriptedCompletion::failing_after(
            &[r#"{"messages":[{"content":"partial","type":"text"}"#],
            "connection reset",
        ));
        let execution = ReplyExecution::new(history.clone(), completion, sink.clone());
        let user = UserKey::from("15550001");

        let err = execution
            .run(&user, &CancellationToken::new())
            .await
            .expect_err("upstream failure");

        assert!(matches!(err, CoreError::Upstream(_)));
        assert_eq!(sink.sent_contents(), vec!["partial".to_string()]);
        assert!(history.turns(&user).is_empty());
    }

    #[tokio::test]
    async fn persistence_failure_does_not_undo_delivery() {
        let history = Arc::new(MemoryHistory::failing_bot_append());
        let sink = Arc::new(RecordingSink::default());
        let completion = Arc::new(ScriptedCompletion::new(&[
            r#"{"messages":[{"content":"kept","type":"text"},{"content":"oops","type":"gif"}]}"#,
        ]));
        let execution = ReplyExecution::new(history, completion, sink.clone());

        let outcome = execution
            .run(&"u".into(), &CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(
            outcome,
            ExecutionOutcome::Completed {
                fragments: 1,
                sent: 1,
                skipped: 1,
                persisted: false,
            }
        );
        assert_eq!(sink.sent_contents(), vec!["kept".to_string()]);
    }

    #[tokio::test]
    async fn pre_cancelled_token_makes_no_completion_call() {
        let history = Arc::new(MemoryHistory::default());
        let sink = Arc::new(RecordingSink::default());
        let completion = Arc::new(ScriptedCompletion::new(&[r#"{"messages":[]}"#]));
        let execution = ReplyExecution::new(history, completion.clone(), sink.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = execution.run(&"u".into(), &cancel).await.expect("run");

        assert_eq!(outcome, ExecutionOutcome::Cancelled { sent: 0 });
        assert_eq!(completion.calls(), 0);
        assert_eq!(sink.attempts(), 0);
    }

    #[tokio::test]
    async fn empty_reply_is_still_persisted() {
        let history = Arc::new(MemoryHistory::default());
        let sink = Arc::new(RecordingSink::default());
        let completion = Arc::new(ScriptedCompletion::new(&[r#"{"messages": []}"#]));
        let execution = ReplyExecution::new(history.clone(), completion, sink.clone());
        let user = UserKey::from("15550001");
        history.append_user(&user, "ok thanks").await.expect("append user");

        let outcome = execution
            .run(&user, &CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(
            outcome,
            ExecutionOutcome::Completed {
                fragments: 0,
                sent: 0,
                skipped: 0,
                persisted: true,
            }
        );
        assert_eq!(sink.attempts(), 0);
        assert_eq!(
            history.turns(&user),
            vec![ChatTurn::user("ok thanks"), ChatTurn::assistant("")]
        );
    }
}
