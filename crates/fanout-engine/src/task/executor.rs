//! Engine facade
//!
//! Wires the admission gate, session pool, store, poller and cleaner into
//! one explicitly-constructed object. Launching a task walks the full
//! pipeline: wait for a concurrency slot, take a session (fail fast if the
//! pool is out of capacity), register the record, fire the remote prompt
//! and make sure the poller is ticking.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use fanout_contracts::{
    final_assistant_text, LaunchRequest, PromptRequest, Task, TaskStatus,
};

use crate::concurrency::{
    AdaptiveConcurrencyConfig, AdaptiveConcurrencyController, ConcurrencyStats,
};
use crate::remote::{ApiError, SessionApi};
use crate::session::{SessionPool, SessionPoolConfig, SessionPoolError, SessionPoolStats};
use crate::task::cleaner::{CleanerConfig, TaskCleaner, CANCELLED_ERROR};
use crate::task::poller::{PollerConfig, TaskPoller};
use crate::task::store::{TaskStore, TaskStoreStats};

/// Aggregate engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskEngineConfig {
    pub concurrency: AdaptiveConcurrencyConfig,
    pub sessions: SessionPoolConfig,
    pub poller: PollerConfig,
    pub cleaner: CleanerConfig,
}

impl TaskEngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, config: AdaptiveConcurrencyConfig) -> Self {
        self.concurrency = config;
        self
    }

    pub fn with_sessions(mut self, config: SessionPoolConfig) -> Self {
        self.sessions = config;
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_cleaner(mut self, config: CleanerConfig) -> Self {
        self.cleaner = config;
        self
    }
}

/// Launch errors
///
/// The only caller-visible failures: everything after a successful launch
/// surfaces as a terminal task status instead.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// Session ceiling hit; the concurrency slot was returned
    #[error("no session capacity for work type '{work_type}'")]
    Capacity { work_type: String },

    /// Remote session creation failed
    #[error("remote session error: {0}")]
    Api(#[from] ApiError),

    /// Engine is shut down
    #[error("engine is shut down")]
    ShutDown,
}

/// Combined engine statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub tasks: TaskStoreStats,
    pub concurrency: ConcurrencyStats,
    pub sessions: SessionPoolStats,
}

/// The parallel task engine
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use fanout_engine::prelude::*;
///
/// let api: Arc<dyn SessionApi> = Arc::new(InMemorySessionApi::new());
/// let engine = TaskExecutor::new(api, TaskEngineConfig::default());
///
/// let task = engine
///     .launch(LaunchRequest {
///         work_type: "researcher".into(),
///         parent_id: "parent-session".into(),
///         description: "survey the codebase".into(),
///         prompt: "List the main modules.".into(),
///     })
///     .await?;
///
/// // ... later
/// let result = engine.get_result(task.id).await?;
/// ```
pub struct TaskExecutor {
    api: Arc<dyn SessionApi>,
    store: Arc<TaskStore>,
    concurrency: Arc<AdaptiveConcurrencyController>,
    sessions: Arc<SessionPool>,
    cleaner: Arc<TaskCleaner>,
    poller: Arc<TaskPoller>,
    shutdown_tx: watch::Sender<bool>,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskExecutor {
    pub fn new(api: Arc<dyn SessionApi>, config: TaskEngineConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let store = Arc::new(TaskStore::new());
        let concurrency = Arc::new(AdaptiveConcurrencyController::new(config.concurrency));
        let sessions = Arc::new(SessionPool::new(Arc::clone(&api), config.sessions));
        let cleaner = Arc::new(TaskCleaner::new(
            Arc::clone(&api),
            Arc::clone(&store),
            Arc::clone(&concurrency),
            Arc::clone(&sessions),
            config.cleaner,
        ));
        let poller = Arc::new(TaskPoller::new(
            Arc::clone(&api),
            Arc::clone(&store),
            Arc::clone(&cleaner),
            config.poller,
            shutdown_rx,
        ));

        Self {
            api,
            store,
            concurrency,
            sessions,
            cleaner,
            poller,
            shutdown_tx,
            sweep_handle: Mutex::new(None),
        }
    }

    /// Launch one task.
    ///
    /// Suspends until the work type has a free concurrency slot. The remote
    /// prompt is fired in the background; its failure moves the task to
    /// `Error` rather than failing this call.
    #[instrument(skip(self, request), fields(work_type = %request.work_type))]
    pub async fn launch(&self, request: LaunchRequest) -> Result<Task, LaunchError> {
        self.concurrency.acquire(&request.work_type).await;

        let session = match self
            .sessions
            .acquire_immediate(&request.work_type, &request.parent_id, &request.description)
            .await
        {
            Ok(session) => session,
            Err(err) => {
                // Give the slot back before surfacing the failure.
                self.concurrency.release(&request.work_type);
                return Err(match err {
                    SessionPoolError::Capacity { work_type } => LaunchError::Capacity { work_type },
                    SessionPoolError::Api(api_err) => LaunchError::Api(api_err),
                    SessionPoolError::ShutDown => LaunchError::ShutDown,
                });
            }
        };

        let task = Task::new(
            &session.id,
            &request.parent_id,
            &request.work_type,
            &request.description,
            &request.prompt,
        );
        self.store.insert(task.clone());
        self.store.track_pending(&request.parent_id, task.id);

        // Fire-and-forget remote start. The ack flips the task to Running;
        // a transport error takes the normal failure path.
        let api = Arc::clone(&self.api);
        let store = Arc::clone(&self.store);
        let cleaner = Arc::clone(&self.cleaner);
        let task_id = task.id;
        let session_id = session.id.clone();
        let prompt = request.prompt.clone();
        tokio::spawn(async move {
            match api.prompt(&session_id, PromptRequest::new(prompt)).await {
                Ok(()) => {
                    store.update(task_id, |t| {
                        if t.status == TaskStatus::Pending {
                            t.status = TaskStatus::Running;
                        }
                    });
                    debug!(task_id = %task_id, "remote start acknowledged");
                }
                Err(err) => {
                    warn!(task_id = %task_id, "remote start failed: {err}");
                    cleaner
                        .fail_task(task_id, format!("failed to start task: {err}"))
                        .await;
                }
            }
        });

        self.poller.ensure_started();
        self.ensure_sweeper();

        info!(task_id = %task.id, session_id = %task.session_id, "task launched");
        Ok(task)
    }

    /// Cancel a pending or running task.
    ///
    /// Releases the slot, invalidates the session (it cannot be reused
    /// after a forced stop) and notifies the parent. The record keeps its
    /// normal grace period so the cancellation reason stays queryable.
    pub async fn cancel(&self, task_id: Uuid) -> bool {
        let cancelled = self
            .cleaner
            .fail_task(task_id, CANCELLED_ERROR)
            .await
            .is_some();
        if cancelled {
            info!(task_id = %task_id, "task cancelled");
        }
        cancelled
    }

    /// Fetch a task's result.
    ///
    /// None while the task is still running (or unknown). Failed tasks
    /// yield their error text. Completed tasks yield the cached final
    /// assistant message, falling back to a live transcript read.
    pub async fn get_result(&self, task_id: Uuid) -> Result<Option<String>, ApiError> {
        let Some(task) = self.store.get(task_id) else {
            return Ok(None);
        };

        if let Some(result) = task.result {
            return Ok(Some(result));
        }

        match task.status {
            TaskStatus::Pending | TaskStatus::Running => Ok(None),
            TaskStatus::Error | TaskStatus::Timeout => {
                Ok(task.error.map(|e| format!("Error: {e}")))
            }
            TaskStatus::Completed => {
                let messages = self.api.messages(&task.session_id).await?;
                let result =
                    final_assistant_text(&messages).unwrap_or_else(|| "(no response)".to_string());
                self.store.update(task_id, |t| t.result = Some(result.clone()));
                Ok(Some(result))
            }
        }
    }

    pub fn task(&self, task_id: Uuid) -> Option<Task> {
        self.store.get(task_id)
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.store.all()
    }

    pub fn running_tasks(&self) -> Vec<Task> {
        self.store.running()
    }

    pub fn tasks_for_parent(&self, parent_id: &str) -> Vec<Task> {
        self.store.by_parent(parent_id)
    }

    /// Tasks still outstanding for a parent.
    pub fn pending_count(&self, parent_id: &str) -> usize {
        self.store.pending_count(parent_id)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            tasks: self.store.stats(),
            concurrency: self.concurrency.stats(),
            sessions: self.sessions.stats(),
        }
    }

    /// The admission controller, for limit tuning and inspection.
    pub fn concurrency(&self) -> &Arc<AdaptiveConcurrencyController> {
        &self.concurrency
    }

    /// The session pool, for inspection.
    pub fn sessions(&self) -> &Arc<SessionPool> {
        &self.sessions
    }

    /// The poller, mainly so tests can drive cycles by hand.
    pub fn poller(&self) -> &Arc<TaskPoller> {
        &self.poller
    }

    /// Stop all background work and destroy every session.
    pub async fn shutdown(&self) {
        info!("engine shutting down");
        let _ = self.shutdown_tx.send(true);
        self.poller.stop();
        if let Some(handle) = self.sweep_handle.lock().take() {
            handle.abort();
        }
        self.cleaner.abort_timers();
        self.sessions.shutdown().await;
        self.store.clear();
    }

    /// Start the periodic session sweep if it is not already running.
    fn ensure_sweeper(&self) {
        let mut handle = self.sweep_handle.lock();
        if let Some(existing) = handle.as_ref() {
            if !existing.is_finished() {
                return;
            }
        }

        let sessions = Arc::clone(&self.sessions);
        let interval = self.sessions.config().sweep_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sessions.cleanup().await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("session sweeper shutting down");
                        break;
                    }
                }
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemorySessionApi;
    use fanout_contracts::SessionActivity;

    fn engine() -> (Arc<InMemorySessionApi>, TaskExecutor) {
        let api = Arc::new(InMemorySessionApi::new());
        let executor = TaskExecutor::new(api.clone() as Arc<dyn SessionApi>, TaskEngineConfig::default());
        (api, executor)
    }

    fn request(parent: &str) -> LaunchRequest {
        LaunchRequest {
            work_type: "worker".into(),
            parent_id: parent.into(),
            description: "demo".into(),
            prompt: "do the work".into(),
        }
    }

    #[tokio::test]
    async fn test_launch_registers_and_starts() {
        let (api, executor) = engine();

        let task = executor.launch(request("parent")).await.unwrap();
        tokio::task::yield_now().await;

        let stored = executor.task(task.id).unwrap();
        assert_eq!(stored.status, TaskStatus::Running);
        assert_eq!(executor.pending_count("parent"), 1);
        assert_eq!(executor.concurrency().in_flight("worker"), 1);
        // The work prompt reached the session.
        assert_eq!(api.prompts_to(&task.session_id).len(), 1);
    }

    #[tokio::test]
    async fn test_launch_capacity_error_returns_slot() {
        let (_api, executor) = {
            let api = Arc::new(InMemorySessionApi::new());
            let config = TaskEngineConfig::default().with_sessions(
                SessionPoolConfig::default()
                    .with_max_per_type(1)
                    .with_global_max(1),
            );
            (
                api.clone(),
                TaskExecutor::new(api as Arc<dyn SessionApi>, config),
            )
        };

        executor.launch(request("parent")).await.unwrap();
        let err = executor.launch(request("parent")).await.unwrap_err();

        assert!(matches!(err, LaunchError::Capacity { .. }));
        // The failed launch handed its slot back.
        assert_eq!(executor.concurrency().in_flight("worker"), 1);
    }

    #[tokio::test]
    async fn test_failed_prompt_moves_task_to_error() {
        let (api, executor) = engine();
        api.set_prompt_error(Some(ApiError::Transport("connection refused".into())));

        let task = executor.launch(request("parent")).await.unwrap();
        tokio::task::yield_now().await;

        let stored = executor.task(task.id).unwrap();
        assert_eq!(stored.status, TaskStatus::Error);
        assert!(stored.error.as_deref().unwrap().contains("connection refused"));
        assert_eq!(executor.concurrency().in_flight("worker"), 0);
        // The session was invalidated, not pooled.
        assert!(!api.contains_session(&task.session_id));
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let (api, executor) = engine();

        let task = executor.launch(request("parent")).await.unwrap();
        tokio::task::yield_now().await;

        assert!(executor.cancel(task.id).await);
        let stored = executor.task(task.id).unwrap();
        assert_eq!(stored.status, TaskStatus::Error);
        assert_eq!(stored.error.as_deref(), Some(CANCELLED_ERROR));
        assert_eq!(executor.concurrency().in_flight("worker"), 0);
        assert!(!api.contains_session(&task.session_id));

        // A second cancel is a no-op.
        assert!(!executor.cancel(task.id).await);
    }

    #[tokio::test]
    async fn test_cancel_unknown_task_is_false() {
        let (_api, executor) = engine();
        assert!(!executor.cancel(Uuid::now_v7()).await);
    }

    #[tokio::test]
    async fn test_get_result_lifecycle() {
        let (api, executor) = engine();

        let task = executor.launch(request("parent")).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(executor.get_result(task.id).await.unwrap(), None);

        // Simulate the remote finishing and the poller noticing.
        executor.store.update(task.id, |t| {
            t.started_at = chrono::Utc::now() - chrono::Duration::seconds(60);
        });
        api.push_assistant_text(&task.session_id, "the answer");
        api.set_activity(&task.session_id, SessionActivity::Idle);
        executor.poller().poll_once().await;

        assert_eq!(
            executor.get_result(task.id).await.unwrap().as_deref(),
            Some("the answer")
        );
    }

    #[tokio::test]
    async fn test_get_result_for_failed_task() {
        let (api, executor) = engine();
        api.set_prompt_error(Some(ApiError::Transport("boom".into())));

        let task = executor.launch(request("parent")).await.unwrap();
        tokio::task::yield_now().await;

        let result = executor.get_result(task.id).await.unwrap().unwrap();
        assert!(result.starts_with("Error:"));
        assert!(result.contains("boom"));
    }

    #[tokio::test]
    async fn test_shutdown_clears_everything() {
        let (api, executor) = engine();

        executor.launch(request("parent")).await.unwrap();
        tokio::task::yield_now().await;

        executor.shutdown().await;

        assert!(executor.tasks().is_empty());
        assert_eq!(api.session_count(), 0);
        assert!(!executor.poller().is_running());
        assert!(matches!(
            executor.launch(request("parent")).await,
            Err(LaunchError::ShutDown)
        ));
    }
}
