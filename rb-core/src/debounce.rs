//! Per-user debounce: a job runs only after the user has been quiet for the
//! whole window. Each new arrival replaces the pending job and restarts the
//! window.

use crate::types::UserKey;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_QUIET_WINDOW: Duration = Duration::from_secs(15);

struct PendingTimer {
    id: u64,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl PendingTimer {
    fn stop(&self) {
        self.token.cancel();
        self.task.abort();
    }
}

pub struct DebounceCoalescer {
    quiet_window: Duration,
    timers: Arc<DashMap<UserKey, PendingTimer>>,
    next_id: AtomicU64,
}

impl Default for DebounceCoalescer {
    fn default() -> Self {
        Self::new(DEFAULT_QUIET_WINDOW)
    }
}

impl DebounceCoalescer {
    pub fn new(quiet_window: Duration) -> Self {
        Self {
            quiet_window,
            timers: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn quiet_window(&self) -> Duration {
        self.quiet_window
    }

    /// Arm (or re-arm) the timer for `user`. `job` runs once the quiet window
    /// elapses with no further `schedule` or `cancel` for the same user; a
    /// replaced job is dropped without being polled.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn schedule<F>(&self, user: UserKey, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();

        match self.timers.entry(user.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get().stop();
                let task = self.spawn_timer(user.clone(), id, token.clone(), job);
                let previous = entry.insert(PendingTimer { id, token, task });
                tracing::debug!(
                    user = %user,
                    timer_id = id,
                    replaced_timer_id = previous.id,
                    "debounce window restarted"
                );
            }
            Entry::Vacant(entry) => {
                let task = self.spawn_timer(user.clone(), id, token.clone(), job);
                entry.insert(PendingTimer { id, token, task });
                tracing::debug!(
                    user = %user,
                    timer_id = id,
                    quiet_window_ms = self.quiet_window.as_millis() as u64,
                    "debounce window armed"
                );
            }
        }
    }

    /// Drop the pending job for `user` without running it.
    pub fn cancel(&self, user: &UserKey) -> bool {
        match self.timers.remove(user) {
            Some((_, timer)) => {
                timer.stop();
                tracing::debug!(user = %user, timer_id = timer.id, "debounce timer cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, user: &UserKey) -> bool {
        self.timers.contains_key(user)
    }

    pub fn pending_count(&self) -> usize {
        self.timers.len()
    }

    /// Drop every pending job.
    pub fn shutdown(&self) {
        let mut dropped = 0usize;
        self.timers.retain(|_, timer| {
            timer.stop();
            dropped += 1;
            false
        });
        tracing::info!(dropped, "debounce coalescer shut down");
    }

    fn spawn_timer<F>(
        &self,
        user: UserKey,
        id: u64,
        token: CancellationToken,
        job: F,
    ) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let timers = Arc::clone(&self.timers);
        let quiet_window = self.quiet_window;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(quiet_window) => {}
            }

            // A replacement may have landed between the sleep ending and this
            // point; the entry is only ours if identity and token still match.
            let fired = timers
                .remove_if(&user, |_, timer| {
                    timer.id == id && !timer.token.is_cancelled()
                })
                .is_some();
            if !fired {
                tracing::debug!(user = %user, timer_id = id, "superseded debounce timer discarded");
                return;
            }

            tracing::debug!(user = %user, timer_id = id, "debounce window elapsed");
            job.await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn record(
        log: &Arc<Mutex<Vec<&'static str>>>,
        label: &'static str,
    ) -> impl Future<Output = ()> + Send + 'static {
        let log = log.clone();
        async move {
            log.lock().expect("log lock").push(label);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn only_the_last_job_in_a_burst_runs() {
        let debounce = DebounceCoalescer::new(Duration::from_secs(15));
        let log = recorder();
        let user = UserKey::from("15550001");

        debounce.schedule(user.clone(), record(&log, "f1"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        debounce.schedule(user.clone(), record(&log, "f2"));
        assert_eq!(debounce.pending_count(), 1);

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(*log.lock().expect("log lock"), vec!["f2"]);
        assert!(!debounce.is_pending(&user));
    }

    #[tokio::test(start_paused = true)]
    async fn each_arrival_restarts_the_window() {
        let debounce = DebounceCoalescer::new(Duration::from_secs(15));
        let log = recorder();
        let user = UserKey::from("15550001");

        debounce.schedule(user.clone(), record(&log, "f1"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        debounce.schedule(user.clone(), record(&log, "f2"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(log.lock().expect("log lock").is_empty());
        assert!(debounce.is_pending(&user));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(*log.lock().expect("log lock"), vec!["f2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_pending_job() {
        let debounce = DebounceCoalescer::new(Duration::from_secs(15));
        let log = recorder();
        let user = UserKey::from("15550001");

        debounce.schedule(user.clone(), record(&log, "f1"));
        assert!(debounce.cancel(&user));
        assert!(!debounce.cancel(&user));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(log.lock().expect("log lock").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn users_fire_independently() {
        let debounce = DebounceCoalescer::new(Duration::from_secs(15));
        let log = recorder();

        debounce.schedule("alice".into(), record(&log, "alice"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        debounce.schedule("bob".into(), record(&log, "bob"));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(*log.lock().expect("log lock"), vec!["alice"]);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(*log.lock().expect("log lock"), vec!["alice", "bob"]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drops_all_pending_jobs() {
        let debounce = DebounceCoalescer::new(Duration::from_secs(15));
        let log = recorder();
        debounce.schedule("alice".into(), record(&log, "alice"));
        debounce.schedule("bob".into(), record(&log, "bob"));

        debounce.shutdown();
        assert_eq!(debounce.pending_count(), 0);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(log.lock().expect("log lock").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_entry_is_not_fired_even_if_still_stored() {
        let debounce = DebounceCoalescer::new(Duration::from_secs(15));
        let log = recorder();
        let user = UserKey::from("15550001");

        debounce.schedule(user.clone(), record(&log, "f1"));
        // Token done but entry still stored, as during a replacement.
        if let Some(timer) = debounce.timers.get(&user) {
            timer.token.cancel();
        }
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(log.lock().expect("log lock").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_bursts_run_exactly_one_job() {
        let debounce = Arc::new(DebounceCoalescer::new(Duration::from_millis(300)));
        let runs = Arc::new(AtomicUsize::new(0));
        let user = UserKey::from("15550001");

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let debounce = debounce.clone();
            let runs = runs.clone();
            let user = user.clone();
            tasks.push(tokio::spawn(async move {
                debounce.schedule(user, async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                });
            }));
        }
        for task in tasks {
            task.await.expect("schedule task");
        }

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(debounce.pending_count(), 0);
    }
}
