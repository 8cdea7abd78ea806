//! Inbound message → debounce → supervised reply execution.

use crate::debounce::DebounceCoalescer;
use crate::error::Result;
use crate::execution::{ExecutionOutcome, ReplyExecution};
use crate::supervisor::ExecutionSupervisor;
use crate::traits::{CompletionSource, HistoryStore, ReplySink};
use crate::types::UserKey;
use std::sync::Arc;
use std::time::Duration;

pub struct ReplyCoordinator {
    history: Arc<dyn HistoryStore>,
    debounce: DebounceCoalescer,
    supervisor: Arc<ExecutionSupervisor>,
    execution: ReplyExecution,
}

impl ReplyCoordinator {
    pub fn new(
        quiet_window: Duration,
        history: Arc<dyn HistoryStore>,
        completion: Arc<dyn CompletionSource>,
        sink: Arc<dyn ReplySink>,
    ) -> Self {
        let execution = ReplyExecution::new(history.clone(), completion, sink);
        Self {
            history,
            debounce: DebounceCoalescer::new(quiet_window),
            supervisor: Arc::new(ExecutionSupervisor::new()),
            execution,
        }
    }

    /// Record the user's turn and (re)arm the reply timer for that user. The
    /// reply sees every turn recorded before the timer fires.
    #[tracing::instrument(level = "info", skip_all, fields(user = %user))]
    pub async fn accept(&self, user: UserKey, content: &str) -> Result<()> {
        self.history.append_user(&user, content).await?;

        let supervisor = self.supervisor.clone();
        let execution = self.execution.clone();
        let job_user = user.clone();
        self.debounce.schedule(user, async move {
            match execution.run_supervised(&supervisor, &job_user).await {
                Ok(ExecutionOutcome::Completed { sent, .. }) => {
                    tracing::debug!(user = %job_user, sent, "reply delivered");
                }
                Ok(ExecutionOutcome::Cancelled { .. }) => {}
                Err(e) => {
                    tracing::warn!(user = %job_user, error = %e, "reply execution failed");
                }
            }
        });
        Ok(())
    }

    /// Drop a pending reply and stop a running one for `user`.
    pub fn stop(&self, user: &UserKey) {
        let pending = self.debounce.cancel(user);
        let running = self.supervisor.cancel(user);
        tracing::info!(user = %user, pending, running, "reply stopped");
    }

    pub fn debounce(&self) -> &DebounceCoalescer {
        &self.debounce
    }

    pub fn supervisor(&self) -> &ExecutionSupervisor {
        &self.supervisor
    }

    pub fn shutdown(&self) {
        self.debounce.shutdown();
        self.supervisor.shutdown();
    }
}
