//! Task cleanup and parent notification
//!
//! Owns the resource-release side of the lifecycle: terminal transitions
//! release the concurrency slot (exactly once, via the key taken out of the
//! task), hand the session back to the pool or invalidate it, and either
//! delete the record immediately (timeouts) or after a grace delay so
//! callers can still ask for the result shortly after completion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fanout_contracts::{PromptRequest, Task, TaskStatus};

use crate::concurrency::AdaptiveConcurrencyController;
use crate::notify::{build_all_complete_message, build_progress_message, format_duration};
use crate::remote::SessionApi;
use crate::session::SessionPool;
use crate::task::store::{TaskNotice, TaskStore};

/// Fixed error recorded on TTL expiry
pub const TIMEOUT_ERROR: &str = "task exceeded the configured time limit";

/// Error recorded on explicit cancellation
pub const CANCELLED_ERROR: &str = "cancelled by caller";

/// Cleaner configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CleanerConfig {
    /// Hard wall-clock bound on task age
    #[serde(with = "crate::duration_millis")]
    pub ttl: Duration,

    /// Grace period before a finished task's record is deleted
    #[serde(with = "crate::duration_millis")]
    pub cleanup_delay: Duration,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            cleanup_delay: Duration::from_secs(5 * 60),
        }
    }
}

impl CleanerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_cleanup_delay(mut self, delay: Duration) -> Self {
        self.cleanup_delay = delay;
        self
    }
}

/// Releases task resources and batches parent notifications
pub struct TaskCleaner {
    api: Arc<dyn SessionApi>,
    store: Arc<TaskStore>,
    concurrency: Arc<AdaptiveConcurrencyController>,
    sessions: Arc<SessionPool>,
    config: CleanerConfig,
    timers: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>,
}

impl TaskCleaner {
    pub fn new(
        api: Arc<dyn SessionApi>,
        store: Arc<TaskStore>,
        concurrency: Arc<AdaptiveConcurrencyController>,
        sessions: Arc<SessionPool>,
        config: CleanerConfig,
    ) -> Self {
        Self {
            api,
            store,
            concurrency,
            sessions,
            config,
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &CleanerConfig {
        &self.config
    }

    /// Finish a task successfully.
    ///
    /// Releases the slot and the session, queues the completion notice and
    /// schedules record deletion. Parent notification is left to the
    /// caller so a poll cycle can batch it.
    pub async fn complete_task(&self, id: Uuid) -> Option<Task> {
        let transition = self.store.mark_terminal(id, TaskStatus::Completed, None)?;
        let task = transition.task;

        if let Some(key) = transition.released_key {
            self.concurrency.release(&key);
            self.concurrency
                .report_result(&key, true, self.run_duration(&task));
        }

        self.sessions.release(&task.session_id).await;
        self.store.untrack_pending(&task.parent_id, task.id);
        self.store
            .queue_notice(&task.parent_id, TaskNotice::from_task(&task));
        self.schedule_cleanup(task.id);

        info!(
            task_id = %task.id,
            work_type = %task.work_type,
            duration = %format_duration(task.started_at, task.completed_at.unwrap_or_else(Utc::now)),
            "task completed"
        );
        Some(task)
    }

    /// Finish a task with an error.
    ///
    /// The session is invalidated, never pooled: a task error may have left
    /// it in an unknown state. The parent is notified immediately.
    pub async fn fail_task(&self, id: Uuid, error: impl Into<String>) -> Option<Task> {
        let error = error.into();
        let transition = self
            .store
            .mark_terminal(id, TaskStatus::Error, Some(error.clone()))?;
        let task = transition.task;

        if let Some(key) = transition.released_key {
            self.concurrency.release(&key);
            self.concurrency
                .report_result(&key, false, self.run_duration(&task));
        }

        self.sessions.invalidate(&task.session_id).await;
        self.store.untrack_pending(&task.parent_id, task.id);
        self.store
            .queue_notice(&task.parent_id, TaskNotice::from_task(&task));
        self.schedule_cleanup(task.id);
        self.notify_parent(&task.parent_id).await;

        warn!(task_id = %task.id, error = %error, "task failed");
        Some(task)
    }

    /// Enforce the TTL.
    ///
    /// Expired running tasks become `Timeout` and lose their resources on
    /// the spot; expired terminal records are dropped without a grace
    /// period. Parents whose pending count reached zero get their queued
    /// notices flushed.
    pub async fn prune_expired(&self) {
        let now = Utc::now();
        let ttl = match chrono::Duration::from_std(self.config.ttl) {
            Ok(ttl) => ttl,
            Err(_) => return,
        };

        let expired: Vec<Task> = self
            .store
            .all()
            .into_iter()
            .filter(|t| t.age(now) > ttl)
            .collect();
        if expired.is_empty() {
            self.store.clean_empty_notices();
            return;
        }

        let mut parents = Vec::new();
        for task in expired {
            if task.status.is_terminal() {
                // Already finished; the record outlived its grace period.
                self.remove_record(task.id);
                continue;
            }

            info!(task_id = %task.id, work_type = %task.work_type, "task timed out");
            let Some(transition) =
                self.store
                    .mark_terminal(task.id, TaskStatus::Timeout, Some(TIMEOUT_ERROR.into()))
            else {
                continue;
            };

            if let Some(key) = transition.released_key {
                self.concurrency.release(&key);
                self.concurrency
                    .report_result(&key, false, self.run_duration(&transition.task));
            }

            self.sessions.invalidate(&transition.task.session_id).await;
            self.store
                .untrack_pending(&transition.task.parent_id, transition.task.id);
            // No grace period for timeouts.
            self.remove_record(transition.task.id);

            if !parents.contains(&transition.task.parent_id) {
                parents.push(transition.task.parent_id.clone());
            }
        }

        for parent in parents {
            self.notify_parent(&parent).await;
        }
        self.store.clean_empty_notices();
    }

    /// Delete the task record after the grace delay.
    pub fn schedule_cleanup(&self, id: Uuid) {
        let store = Arc::clone(&self.store);
        let timers = Arc::clone(&self.timers);
        let delay = self.config.cleanup_delay;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            store.remove(id);
            timers.lock().remove(&id);
            debug!(task_id = %id, "task record cleaned up");
        });

        if let Some(previous) = self.timers.lock().insert(id, handle) {
            previous.abort();
        }
    }

    /// Deliver the batched notification contract for one parent.
    ///
    /// Pending count zero: one rich message describing every queued notice,
    /// and the queue is cleared. Pending tasks remaining: a terse silent
    /// update that does not trigger a response turn.
    pub async fn notify_parent(&self, parent_id: &str) {
        let pending = self.store.pending_count(parent_id);

        let (request, count) = if pending == 0 {
            let notices = self.store.take_notices(parent_id);
            if notices.is_empty() {
                return;
            }
            let message = build_all_complete_message(&notices);
            (PromptRequest::new(message), notices.len())
        } else {
            let notices = self.store.notices(parent_id);
            if notices.is_empty() {
                return;
            }
            let message = build_progress_message(&notices, pending);
            (PromptRequest::silent(message), notices.len())
        };

        match self.api.prompt(parent_id, request).await {
            Ok(()) => debug!(parent_id, count, pending, "parent notified"),
            Err(err) => warn!(parent_id, "parent notification failed: {err}"),
        }
    }

    /// Abort all outstanding cleanup timers (shutdown path).
    pub fn abort_timers(&self) {
        let mut timers = self.timers.lock();
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }

    /// Outstanding delayed cleanups, for diagnostics.
    pub fn scheduled_cleanups(&self) -> usize {
        self.timers.lock().len()
    }

    fn remove_record(&self, id: Uuid) {
        if let Some(handle) = self.timers.lock().remove(&id) {
            handle.abort();
        }
        self.store.remove(id);
    }

    fn run_duration(&self, task: &Task) -> Duration {
        task.completed_at
            .map(|end| (end - task.started_at).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::AdaptiveConcurrencyConfig;
    use crate::remote::InMemorySessionApi;
    use crate::session::SessionPoolConfig;

    struct Fixture {
        api: Arc<InMemorySessionApi>,
        store: Arc<TaskStore>,
        concurrency: Arc<AdaptiveConcurrencyController>,
        sessions: Arc<SessionPool>,
        cleaner: TaskCleaner,
    }

    fn fixture(config: CleanerConfig) -> Fixture {
        let api = Arc::new(InMemorySessionApi::new());
        let store = Arc::new(TaskStore::new());
        let concurrency = Arc::new(AdaptiveConcurrencyController::new(
            AdaptiveConcurrencyConfig::default(),
        ));
        let sessions = Arc::new(SessionPool::new(
            api.clone() as Arc<dyn SessionApi>,
            SessionPoolConfig::default(),
        ));
        let cleaner = TaskCleaner::new(
            api.clone() as Arc<dyn SessionApi>,
            store.clone(),
            concurrency.clone(),
            sessions.clone(),
            config,
        );
        Fixture {
            api,
            store,
            concurrency,
            sessions,
            cleaner,
        }
    }

    async fn running_task(fx: &Fixture, parent: &str) -> Task {
        let session = fx.sessions.acquire("worker", parent, "desc").await.unwrap();
        fx.concurrency.acquire("worker").await;
        let mut task = Task::new(&session.id, parent, "worker", "desc", "prompt");
        task.status = TaskStatus::Running;
        fx.store.insert(task.clone());
        fx.store.track_pending(parent, task.id);
        task
    }

    #[tokio::test]
    async fn test_complete_releases_slot_and_session() {
        let fx = fixture(CleanerConfig::default());
        let task = running_task(&fx, "parent").await;

        fx.cleaner.complete_task(task.id).await.unwrap();

        assert_eq!(fx.concurrency.in_flight("worker"), 0);
        let pooled = fx.sessions.session(&task.session_id).unwrap();
        assert!(!pooled.in_use);
        assert_eq!(fx.store.get(task.id).unwrap().status, TaskStatus::Completed);
        assert!(!fx.store.has_pending("parent"));
    }

    #[tokio::test]
    async fn test_double_completion_releases_once() {
        let fx = fixture(CleanerConfig::default());
        let task = running_task(&fx, "parent").await;

        assert!(fx.cleaner.complete_task(task.id).await.is_some());
        assert!(fx.cleaner.complete_task(task.id).await.is_none());
        assert!(fx.cleaner.fail_task(task.id, "late error").await.is_none());

        // One acquire, one release; a second release would have warned and
        // left this at zero anyway, but the counters never went negative.
        assert_eq!(fx.concurrency.in_flight("worker"), 0);
        assert_eq!(fx.concurrency.global_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_fail_invalidates_session() {
        let fx = fixture(CleanerConfig::default());
        let task = running_task(&fx, "parent").await;

        fx.cleaner.fail_task(task.id, "remote exploded").await;

        assert!(!fx.api.contains_session(&task.session_id));
        assert!(fx.sessions.session(&task.session_id).is_none());
        let stored = fx.store.get(task.id).unwrap();
        assert_eq!(stored.status, TaskStatus::Error);
        assert_eq!(stored.error.as_deref(), Some("remote exploded"));
    }

    #[tokio::test]
    async fn test_prune_times_out_old_tasks() {
        let fx = fixture(CleanerConfig::default().with_ttl(Duration::from_secs(60)));
        let task = running_task(&fx, "parent").await;
        fx.store.update(task.id, |t| {
            t.started_at = Utc::now() - chrono::Duration::seconds(120);
        });

        fx.cleaner.prune_expired().await;

        // Timeout records are dropped immediately, resources released.
        assert!(fx.store.get(task.id).is_none());
        assert_eq!(fx.concurrency.in_flight("worker"), 0);
        assert!(!fx.api.contains_session(&task.session_id));
    }

    #[tokio::test]
    async fn test_prune_leaves_young_tasks_alone() {
        let fx = fixture(CleanerConfig::default().with_ttl(Duration::from_secs(3600)));
        let task = running_task(&fx, "parent").await;

        fx.cleaner.prune_expired().await;

        assert_eq!(fx.store.get(task.id).unwrap().status, TaskStatus::Running);
        assert_eq!(fx.concurrency.in_flight("worker"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_cleanup_deletes_after_delay() {
        let fx = fixture(CleanerConfig::default().with_cleanup_delay(Duration::from_secs(300)));
        let task = running_task(&fx, "parent").await;
        fx.cleaner.complete_task(task.id).await.unwrap();
        assert_eq!(fx.cleaner.scheduled_cleanups(), 1);

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(fx.store.get(task.id).is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(fx.store.get(task.id).is_none());
        assert_eq!(fx.cleaner.scheduled_cleanups(), 0);
    }

    #[tokio::test]
    async fn test_notify_parent_rich_when_all_done() {
        let fx = fixture(CleanerConfig::default());
        fx.api.seed_session("parent");
        let task = running_task(&fx, "parent").await;
        fx.cleaner.complete_task(task.id).await.unwrap();

        fx.cleaner.notify_parent("parent").await;

        let prompts = fx.api.prompts_to("parent");
        assert_eq!(prompts.len(), 1);
        assert!(!prompts[0].no_reply);
        assert!(prompts[0].text.contains("All Parallel Tasks Complete"));

        // Queue was cleared; a second notify sends nothing.
        fx.cleaner.notify_parent("parent").await;
        assert_eq!(fx.api.prompts_to("parent").len(), 1);
    }

    #[tokio::test]
    async fn test_notify_parent_terse_while_pending() {
        let fx = fixture(CleanerConfig::default());
        fx.api.seed_session("parent");
        let done = running_task(&fx, "parent").await;
        let _still_running = running_task(&fx, "parent").await;
        fx.cleaner.complete_task(done.id).await.unwrap();

        fx.cleaner.notify_parent("parent").await;

        let prompts = fx.api.prompts_to("parent");
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].no_reply);
        assert!(prompts[0].text.contains("still running"));
    }
}
