//! At most one live reply execution per user.
//!
//! Starting a new execution cancels the previous one's token and replaces its
//! handle. Cancellation is cooperative: the superseded task notices at its
//! next checkpoint. Cleanup compares handle identity, so a late cleanup from a
//! superseded task never removes its replacement.

use crate::types::UserKey;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Returned by [`ExecutionSupervisor::start`]; carries the token the task
/// checks and the identity used for cleanup.
#[derive(Debug, Clone)]
pub struct ExecutionTicket {
    id: u64,
    token: CancellationToken,
}

impl ExecutionTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug)]
struct ExecutionHandle {
    id: u64,
    token: CancellationToken,
    started_at: Instant,
}

#[derive(Debug, Default)]
pub struct ExecutionSupervisor {
    handles: DashMap<UserKey, ExecutionHandle>,
    next_id: AtomicU64,
}

impl ExecutionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel any running execution for `user` and register a fresh one.
    /// Does not wait for the cancelled task.
    pub fn start(&self, user: &UserKey) -> ExecutionTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        let handle = ExecutionHandle {
            id,
            token: token.clone(),
            started_at: Instant::now(),
        };

        match self.handles.entry(user.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get().token.cancel();
                let previous = entry.insert(handle);
                tracing::info!(
                    user = %user,
                    execution_id = id,
                    superseded_execution_id = previous.id,
                    superseded_age_ms = previous.started_at.elapsed().as_millis() as u64,
                    "execution superseded"
                );
            }
            Entry::Vacant(entry) => {
                entry.insert(handle);
                tracing::debug!(user = %user, execution_id = id, "execution started");
            }
        }

        ExecutionTicket { id, token }
    }

    /// Remove the handle for `user` if it is still the one `ticket` was issued
    /// for. Returns whether anything was removed.
    pub fn cleanup(&self, user: &UserKey, ticket: &ExecutionTicket) -> bool {
        let removed = self
            .handles
            .remove_if(user, |_, handle| handle.id == ticket.id)
            .is_some();
        if !removed {
            tracing::debug!(
                user = %user,
                execution_id = ticket.id,
                "stale execution cleanup ignored"
            );
        }
        removed
    }

    /// Cancel and forget the running execution for `user`, if any.
    pub fn cancel(&self, user: &UserKey) -> bool {
        match self.handles.remove(user) {
            Some((_, handle)) => {
                handle.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, user: &UserKey) -> bool {
        self.handles.contains_key(user)
    }

    pub fn active_count(&self) -> usize {
        self.handles.len()
    }

    /// Cancel every running execution.
    pub fn shutdown(&self) {
        let mut cancelled = 0usize;
        self.handles.retain(|_, handle| {
            handle.token.cancel();
            cancelled += 1;
            false
        });
        tracing::info!(cancelled, "execution supervisor shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn second_start_cancels_first_token() {
        let supervisor = ExecutionSupervisor::new();
        let user = UserKey::from("15550001");

        let first = supervisor.start(&user);
        assert!(!first.is_cancelled());
        let second = supervisor.start(&user);

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_ne!(first.id(), second.id());
        assert_eq!(supervisor.active_count(), 1);
    }

    #[test]
    fn stale_cleanup_keeps_newer_handle() {
        let supervisor = ExecutionSupervisor::new();
        let user = UserKey::from("15550001");

        let first = supervisor.start(&user);
        let second = supervisor.start(&user);

        assert!(!supervisor.cleanup(&user, &first));
        assert!(supervisor.is_running(&user));
        assert!(!second.is_cancelled());

        assert!(supervisor.cleanup(&user, &second));
        assert!(!supervisor.is_running(&user));
        assert!(!supervisor.cleanup(&user, &second));
    }

    #[test]
    fn users_are_independent() {
        let supervisor = ExecutionSupervisor::new();
        let alice = supervisor.start(&"alice".into());
        let bob = supervisor.start(&"bob".into());

        assert!(!alice.is_cancelled());
        assert!(!bob.is_cancelled());
        assert_eq!(supervisor.active_count(), 2);

        assert!(supervisor.cancel(&"alice".into()));
        assert!(alice.is_cancelled());
        assert!(!bob.is_cancelled());
        assert!(!supervisor.cancel(&"alice".into()));
    }

    #[test]
    fn shutdown_cancels_everything() {
        let supervisor = ExecutionSupervisor::new();
        let tickets: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|u| supervisor.start(&UserKey::from(*u)))
            .collect();
        supervisor.shutdown();
        assert!(tickets.iter().all(ExecutionTicket::is_cancelled));
        assert_eq!(supervisor.active_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_leave_exactly_one_live_token() {
        let supervisor = Arc::new(ExecutionSupervisor::new());
        let user = UserKey::from("15550001");

        let mut tasks = Vec::new();
        for _ in 0..64 {
            let supervisor = supervisor.clone();
            let user = user.clone();
            tasks.push(tokio::spawn(async move { supervisor.start(&user) }));
        }
        let mut tickets = Vec::new();
        for task in tasks {
            tickets.push(task.await.expect("start task"));
        }

        let live: Vec<_> = tickets.iter().filter(|t| !t.is_cancelled()).collect();
        assert_eq!(live.len(), 1);
        assert!(supervisor.cleanup(&user, live[0]));
        assert_eq!(supervisor.active_count(), 0);
    }
}
