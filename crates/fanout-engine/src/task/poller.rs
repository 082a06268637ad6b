//! Completion detection
//!
//! The remote API has no event push, so completion is inferred: a recurring
//! tick samples every running task's session status and transcript. Two
//! paths lead to `Completed`, both gated on a minimum stability window and
//! on the session actually having produced output:
//!
//! - the session reports idle, or
//! - the transcript length has been unchanged for a fixed number of
//!   consecutive polls (sessions that never report idle but have stopped
//!   producing messages).
//!
//! The tick self-stops when nothing is active and is restarted by the next
//! launch, so an idle engine costs nothing.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use fanout_contracts::{final_assistant_text, has_assistant_output, MessagePart, SessionActivity, Task};

use crate::remote::SessionApi;
use crate::task::cleaner::TaskCleaner;
use crate::task::store::TaskStore;

/// Stored snippet length of the last assistant message
const LAST_MESSAGE_SNIPPET: usize = 100;

/// Poller configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Tick interval
    #[serde(with = "crate::duration_millis")]
    pub poll_interval: Duration,

    /// Minimum run time before any completion is accepted; filters out
    /// near-instant idle blips right after launch
    #[serde(with = "crate::duration_millis")]
    pub min_stability: Duration,

    /// Consecutive unchanged-transcript polls that imply completion
    pub stable_polls_required: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            min_stability: Duration::from_secs(5),
            stable_polls_required: 3,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_min_stability(mut self, window: Duration) -> Self {
        self.min_stability = window;
        self
    }

    pub fn with_stable_polls_required(mut self, polls: u32) -> Self {
        self.stable_polls_required = polls.max(1);
        self
    }
}

/// Polls running tasks for completion
pub struct TaskPoller {
    api: Arc<dyn SessionApi>,
    store: Arc<TaskStore>,
    cleaner: Arc<TaskCleaner>,
    config: PollerConfig,
    shutdown_rx: watch::Receiver<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskPoller {
    pub fn new(
        api: Arc<dyn SessionApi>,
        store: Arc<TaskStore>,
        cleaner: Arc<TaskCleaner>,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            api,
            store,
            cleaner,
            config,
            shutdown_rx,
            loop_handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Start the tick loop if it is not already running.
    ///
    /// Called on every launch; the loop exits on its own once no task is
    /// pending or running, so launches after a quiet period restart it.
    pub fn ensure_started(self: &Arc<Self>) {
        let mut handle = self.loop_handle.lock();
        if let Some(existing) = handle.as_ref() {
            if !existing.is_finished() {
                return;
            }
        }

        let poller = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_rx.clone();
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poller.config.poll_interval);
            // The first tick fires immediately; skip it so a task launched
            // moments ago is not polled before the remote even started.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let active = poller.poll_once().await;
                        if active == 0 {
                            debug!("no active tasks, poller going dormant");
                            break;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("poller shutting down");
                        break;
                    }
                }
            }
        }));
    }

    /// Stop the tick loop.
    pub fn stop(&self) {
        if let Some(handle) = self.loop_handle.lock().take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.loop_handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Run one poll cycle. Returns the number of still-active tasks.
    ///
    /// Exposed so tests can drive cycles deterministically.
    pub async fn poll_once(&self) -> usize {
        // TTL first: a task past its deadline never survives another cycle.
        self.cleaner.prune_expired().await;

        let running = self.store.running();
        if running.is_empty() {
            return self.store.active_count();
        }

        let statuses = match self.api.status().await {
            Ok(statuses) => statuses,
            Err(err) => {
                warn!("status poll failed: {err}");
                return self.store.active_count();
            }
        };

        // Parents that saw completions this cycle; notified once at the end
        // so a burst of completions produces one message, not N.
        let mut completed_parents: Vec<String> = Vec::new();

        for task in running {
            let activity = statuses.get(&task.session_id).copied();
            match self.poll_task(&task, activity).await {
                Ok(true) => {
                    if !completed_parents.contains(&task.parent_id) {
                        completed_parents.push(task.parent_id.clone());
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    // One task's failure never blocks the rest of the cycle.
                    warn!(task_id = %task.id, "poll error: {err}");
                }
            }
        }

        for parent in completed_parents {
            self.cleaner.notify_parent(&parent).await;
        }

        self.store.active_count()
    }

    /// Inspect one running task. Returns Ok(true) if it completed.
    async fn poll_task(
        &self,
        task: &Task,
        activity: Option<SessionActivity>,
    ) -> Result<bool, crate::remote::ApiError> {
        let elapsed = (Utc::now() - task.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let stable_window_passed = elapsed >= self.config.min_stability;

        if activity == Some(SessionActivity::Idle) {
            if stable_window_passed {
                if let Some(result) = self.validated_output(&task.session_id).await {
                    self.finish(task, result).await;
                    return Ok(true);
                }
            }
            // Idle but unproven: either still inside the stability window or
            // no usable output yet. Leave it running.
            return Ok(false);
        }

        let stable_polls = self.sample_progress(task).await?;
        if stable_window_passed && stable_polls >= self.config.stable_polls_required {
            if let Some(result) = self.validated_output(&task.session_id).await {
                debug!(
                    task_id = %task.id,
                    stable_polls,
                    "transcript stable, completing"
                );
                self.finish(task, result).await;
                return Ok(true);
            }
        }

        Ok(false)
    }

    async fn finish(&self, task: &Task, result: Option<String>) {
        if let Some(text) = result {
            // Cache the result now; the session may be reset for reuse
            // before anyone asks for it.
            self.store.update(task.id, |t| t.result = Some(text));
        }
        self.cleaner.complete_task(task.id).await;
    }

    /// Refresh the task's progress sample; returns the stable-poll count.
    async fn sample_progress(&self, task: &Task) -> Result<u32, crate::remote::ApiError> {
        let messages = self.api.messages(&task.session_id).await?;

        let mut tool_calls = 0;
        let mut last_tool = None;
        let mut last_message = None;
        for message in messages.iter().filter(|m| m.is_assistant_output()) {
            for part in &message.parts {
                match part {
                    MessagePart::ToolUse { name } => {
                        tool_calls += 1;
                        last_tool = Some(name.clone());
                    }
                    MessagePart::Text { text } => {
                        last_message = Some(text.chars().take(LAST_MESSAGE_SNIPPET).collect());
                    }
                    MessagePart::Reasoning { .. } => {}
                }
            }
        }

        let count = messages.len();
        self.store
            .update(task.id, |t| {
                if t.progress.message_count == count {
                    t.progress.stable_polls += 1;
                } else {
                    t.progress.stable_polls = 0;
                }
                t.progress.message_count = count;
                t.progress.tool_calls = tool_calls;
                t.progress.last_tool = last_tool;
                t.progress.last_message = last_message;
                t.progress.last_update = Some(Utc::now());
                t.progress.stable_polls
            })
            .ok_or_else(|| {
                crate::remote::ApiError::Transport(format!("task disappeared: {}", task.id))
            })
    }

    /// The output-validation gate: completion is never inferred from an
    /// idle or stable session that produced nothing usable.
    ///
    /// Outer None blocks completion. Outer Some carries the final assistant
    /// text to cache, when the transcript was readable.
    async fn validated_output(&self, session_id: &str) -> Option<Option<String>> {
        match self.api.messages(session_id).await {
            Ok(messages) => {
                if has_assistant_output(&messages) {
                    Some(final_assistant_text(&messages))
                } else {
                    None
                }
            }
            // On error, allow completion rather than wedging the task.
            Err(_) => Some(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::{AdaptiveConcurrencyConfig, AdaptiveConcurrencyController};
    use crate::remote::InMemorySessionApi;
    use crate::session::{SessionPool, SessionPoolConfig};
    use crate::task::cleaner::CleanerConfig;
    use fanout_contracts::{Message, TaskStatus};

    struct Fixture {
        api: Arc<InMemorySessionApi>,
        store: Arc<TaskStore>,
        concurrency: Arc<AdaptiveConcurrencyController>,
        sessions: Arc<SessionPool>,
        poller: Arc<TaskPoller>,
        _shutdown_tx: watch::Sender<bool>,
    }

    fn fixture(config: PollerConfig) -> Fixture {
        let api = Arc::new(InMemorySessionApi::new());
        let store = Arc::new(TaskStore::new());
        let concurrency = Arc::new(AdaptiveConcurrencyController::new(
            AdaptiveConcurrencyConfig::default(),
        ));
        let sessions = Arc::new(SessionPool::new(
            api.clone() as Arc<dyn SessionApi>,
            SessionPoolConfig::default(),
        ));
        let cleaner = Arc::new(TaskCleaner::new(
            api.clone() as Arc<dyn SessionApi>,
            store.clone(),
            concurrency.clone(),
            sessions.clone(),
            CleanerConfig::default(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poller = Arc::new(TaskPoller::new(
            api.clone() as Arc<dyn SessionApi>,
            store.clone(),
            cleaner,
            config,
            shutdown_rx,
        ));
        Fixture {
            api,
            store,
            concurrency,
            sessions,
            poller,
            _shutdown_tx: shutdown_tx,
        }
    }

    /// Register a running task whose stability window has already passed.
    async fn seasoned_task(fx: &Fixture, parent: &str) -> Task {
        let session = fx.sessions.acquire("worker", parent, "desc").await.unwrap();
        fx.concurrency.acquire("worker").await;
        let mut task = Task::new(&session.id, parent, "worker", "desc", "prompt");
        task.status = TaskStatus::Running;
        task.started_at = Utc::now() - chrono::Duration::seconds(60);
        fx.store.insert(task.clone());
        fx.store.track_pending(parent, task.id);
        task
    }

    #[test]
    fn test_default_config() {
        let config = PollerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.min_stability, Duration::from_secs(5));
        assert_eq!(config.stable_polls_required, 3);
    }

    #[tokio::test]
    async fn test_idle_with_output_completes() {
        let fx = fixture(PollerConfig::default());
        let task = seasoned_task(&fx, "parent").await;
        fx.api.push_assistant_text(&task.session_id, "done");
        fx.api
            .set_activity(&task.session_id, SessionActivity::Idle);

        fx.poller.poll_once().await;

        assert_eq!(fx.store.get(task.id).unwrap().status, TaskStatus::Completed);
        assert_eq!(fx.concurrency.in_flight("worker"), 0);
    }

    #[tokio::test]
    async fn test_idle_without_output_stays_running() {
        let fx = fixture(PollerConfig::default());
        let task = seasoned_task(&fx, "parent").await;
        fx.api
            .set_activity(&task.session_id, SessionActivity::Idle);

        fx.poller.poll_once().await;

        // Idle but empty: may still be warming up.
        assert_eq!(fx.store.get(task.id).unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_idle_inside_stability_window_stays_running() {
        let fx = fixture(PollerConfig::default());
        let session = fx
            .sessions
            .acquire("worker", "parent", "desc")
            .await
            .unwrap();
        fx.concurrency.acquire("worker").await;
        let mut task = Task::new(&session.id, "parent", "worker", "desc", "prompt");
        task.status = TaskStatus::Running;
        fx.store.insert(task.clone());
        fx.store.track_pending("parent", task.id);

        fx.api.push_assistant_text(&task.session_id, "instant");
        fx.api
            .set_activity(&task.session_id, SessionActivity::Idle);

        fx.poller.poll_once().await;

        assert_eq!(fx.store.get(task.id).unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_stability_path_completes_after_threshold() {
        let fx = fixture(PollerConfig::default());
        let task = seasoned_task(&fx, "parent").await;
        fx.api.push_assistant_text(&task.session_id, "output");
        // Session keeps reporting busy; only the transcript stalls.
        fx.api
            .set_activity(&task.session_id, SessionActivity::Busy);

        // Poll 1 establishes the count, polls 2-4 accumulate stability.
        for _ in 0..3 {
            fx.poller.poll_once().await;
            assert_eq!(fx.store.get(task.id).unwrap().status, TaskStatus::Running);
        }
        fx.poller.poll_once().await;

        assert_eq!(fx.store.get(task.id).unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_stability_path_requires_output() {
        let fx = fixture(PollerConfig::default());
        let task = seasoned_task(&fx, "parent").await;
        fx.api
            .set_activity(&task.session_id, SessionActivity::Busy);

        for _ in 0..6 {
            fx.poller.poll_once().await;
        }

        // Stable for well over the threshold but empty: never completed.
        assert_eq!(fx.store.get(task.id).unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_transcript_growth_resets_stability() {
        let fx = fixture(PollerConfig::default());
        let task = seasoned_task(&fx, "parent").await;
        fx.api.push_assistant_text(&task.session_id, "part one");
        fx.api
            .set_activity(&task.session_id, SessionActivity::Busy);

        fx.poller.poll_once().await;
        fx.poller.poll_once().await;
        // New output arrives; the counter must restart.
        fx.api.push_assistant_text(&task.session_id, "part two");
        fx.poller.poll_once().await;

        let progress = fx.store.get(task.id).unwrap().progress;
        assert_eq!(progress.stable_polls, 0);
        assert_eq!(fx.store.get(task.id).unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_one_bad_task_does_not_block_cycle() {
        let fx = fixture(PollerConfig::default());
        let broken = seasoned_task(&fx, "parent").await;
        let healthy = seasoned_task(&fx, "parent").await;

        // Kill the broken task's session behind the engine's back.
        fx.api.delete_session(&broken.session_id).await.unwrap();
        fx.api.push_assistant_text(&healthy.session_id, "done");
        fx.api
            .set_activity(&healthy.session_id, SessionActivity::Idle);

        fx.poller.poll_once().await;

        assert_eq!(
            fx.store.get(healthy.id).unwrap().status,
            TaskStatus::Completed
        );
        assert_eq!(fx.store.get(broken.id).unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_progress_sampling_records_tools() {
        let fx = fixture(PollerConfig::default());
        let task = seasoned_task(&fx, "parent").await;
        fx.api.push_message(
            &task.session_id,
            Message::assistant(vec![
                MessagePart::ToolUse {
                    name: "grep".into(),
                },
                MessagePart::Text {
                    text: "searching".into(),
                },
            ]),
        );
        fx.api
            .set_activity(&task.session_id, SessionActivity::Busy);

        fx.poller.poll_once().await;

        let progress = fx.store.get(task.id).unwrap().progress;
        assert_eq!(progress.tool_calls, 1);
        assert_eq!(progress.last_tool.as_deref(), Some("grep"));
        assert_eq!(progress.last_message.as_deref(), Some("searching"));
        assert!(progress.last_update.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_self_stops_when_idle() {
        let fx = fixture(PollerConfig::default());
        let task = seasoned_task(&fx, "parent").await;
        fx.api.push_assistant_text(&task.session_id, "done");
        fx.api
            .set_activity(&task.session_id, SessionActivity::Idle);

        fx.poller.ensure_started();
        assert!(fx.poller.is_running());

        // First tick completes the task, second tick finds nothing active.
        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;

        assert!(!fx.poller.is_running());
        assert_eq!(fx.store.get(task.id).unwrap().status, TaskStatus::Completed);
    }
}
