// Task DTOs
//
// A Task is one unit of delegated work running inside a remote session. The
// engine owns the full lifecycle; callers only ever see snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task lifecycle status
///
/// `Pending` exists only between store registration and the remote start
/// call acknowledging. The three terminal states are final.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Error,
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Timeout
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Error => write!(f, "error"),
            TaskStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Observed progress of a running task
///
/// Fed by transcript sampling; used only for completion heuristics and
/// status display, never for correctness.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskProgress {
    /// Transcript length at the last poll.
    pub message_count: usize,
    /// Consecutive polls with an unchanged transcript.
    pub stable_polls: u32,
    pub tool_calls: usize,
    pub last_tool: Option<String>,
    /// Leading snippet of the last assistant text seen.
    pub last_message: Option<String>,
    pub last_update: Option<DateTime<Utc>>,
}

/// One unit of delegated work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Remote execution context running this task; exclusively owned by the
    /// task while it runs.
    pub session_id: String,
    /// Session that requested this task; used for notification batching.
    pub parent_id: String,
    /// Category label scoping per-type concurrency limits.
    pub work_type: String,
    pub description: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<String>,
    /// Set while a concurrency slot is held; taken exactly once on release.
    pub concurrency_key: Option<String>,
    pub progress: TaskProgress,
}

impl Task {
    pub fn new(
        session_id: impl Into<String>,
        parent_id: impl Into<String>,
        work_type: impl Into<String>,
        description: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        let work_type = work_type.into();
        Self {
            id: Uuid::now_v7(),
            session_id: session_id.into(),
            parent_id: parent_id.into(),
            concurrency_key: Some(work_type.clone()),
            work_type,
            description: description.into(),
            prompt: prompt.into(),
            status: TaskStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            result: None,
            progress: TaskProgress::default(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == TaskStatus::Running
    }

    /// Wall-clock age since launch.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.started_at
    }
}

/// Input to `TaskExecutor::launch`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub work_type: String,
    pub parent_id: String,
    pub description: String,
    pub prompt: String,
}
