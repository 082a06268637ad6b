//! Task registry
//!
//! Owns every task record plus the per-parent bookkeeping the notification
//! batcher needs: which tasks are still pending for a parent, and which
//! completion notices are queued for it. The underlying maps are never
//! exposed; callers go through get/insert/update/remove style methods.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fanout_contracts::{Task, TaskStatus};

/// Queued completion notices kept per parent, oldest dropped beyond this.
const MAX_NOTICES_PER_PARENT: usize = 50;

/// A queued completion notice for a parent session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNotice {
    pub task_id: Uuid,
    pub description: String,
    pub status: TaskStatus,
}

impl TaskNotice {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            description: task.description.clone(),
            status: task.status,
        }
    }
}

/// Result of a terminal transition
///
/// `released_key` is the concurrency key taken from the task, present only
/// on the first transition; it is how the engine guarantees at most one
/// slot release per task.
#[derive(Debug)]
pub struct TerminalTransition {
    pub task: Task,
    pub released_key: Option<String>,
}

/// Store statistics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStoreStats {
    pub tasks: usize,
    pub running: usize,
    pub notice_queues: usize,
    pub pending_parents: usize,
}

/// In-memory task registry
#[derive(Default)]
pub struct TaskStore {
    tasks: Mutex<HashMap<Uuid, Task>>,
    pending_by_parent: Mutex<HashMap<String, HashSet<Uuid>>>,
    notices: Mutex<HashMap<String, Vec<TaskNotice>>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: Task) {
        self.tasks.lock().insert(task.id, task);
    }

    pub fn get(&self, id: Uuid) -> Option<Task> {
        self.tasks.lock().get(&id).cloned()
    }

    /// Apply `f` to a task in place. Returns the closure's result, or None
    /// if the task is gone.
    pub fn update<R>(&self, id: Uuid, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
        self.tasks.lock().get_mut(&id).map(f)
    }

    pub fn remove(&self, id: Uuid) -> Option<Task> {
        self.tasks.lock().remove(&id)
    }

    pub fn all(&self) -> Vec<Task> {
        self.tasks.lock().values().cloned().collect()
    }

    pub fn running(&self) -> Vec<Task> {
        self.tasks
            .lock()
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .cloned()
            .collect()
    }

    /// Tasks not yet in a terminal state (pending or running).
    pub fn active_count(&self) -> usize {
        self.tasks
            .lock()
            .values()
            .filter(|t| !t.status.is_terminal())
            .count()
    }

    pub fn by_parent(&self, parent_id: &str) -> Vec<Task> {
        self.tasks
            .lock()
            .values()
            .filter(|t| t.parent_id == parent_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Move a task to a terminal state.
    ///
    /// Idempotent: a task already in a terminal state is left untouched and
    /// None is returned. On the first transition the concurrency key is
    /// taken out of the task and handed to the caller.
    pub fn mark_terminal(
        &self,
        id: Uuid,
        status: TaskStatus,
        error: Option<String>,
    ) -> Option<TerminalTransition> {
        debug_assert!(status.is_terminal());
        let mut tasks = self.tasks.lock();
        let task = tasks.get_mut(&id)?;
        if task.status.is_terminal() {
            return None;
        }
        task.status = status;
        task.completed_at = Some(Utc::now());
        if error.is_some() {
            task.error = error;
        }
        let released_key = task.concurrency_key.take();
        Some(TerminalTransition {
            task: task.clone(),
            released_key,
        })
    }

    // Pending tracking

    pub fn track_pending(&self, parent_id: &str, task_id: Uuid) {
        self.pending_by_parent
            .lock()
            .entry(parent_id.to_string())
            .or_default()
            .insert(task_id);
    }

    pub fn untrack_pending(&self, parent_id: &str, task_id: Uuid) {
        let mut pending = self.pending_by_parent.lock();
        if let Some(set) = pending.get_mut(parent_id) {
            set.remove(&task_id);
            if set.is_empty() {
                pending.remove(parent_id);
            }
        }
    }

    pub fn pending_count(&self, parent_id: &str) -> usize {
        self.pending_by_parent
            .lock()
            .get(parent_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn has_pending(&self, parent_id: &str) -> bool {
        self.pending_count(parent_id) > 0
    }

    // Notification queues

    pub fn queue_notice(&self, parent_id: &str, notice: TaskNotice) {
        let mut notices = self.notices.lock();
        let queue = notices.entry(parent_id.to_string()).or_default();
        queue.push(notice);
        if queue.len() > MAX_NOTICES_PER_PARENT {
            queue.remove(0);
        }
    }

    pub fn notices(&self, parent_id: &str) -> Vec<TaskNotice> {
        self.notices
            .lock()
            .get(parent_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn take_notices(&self, parent_id: &str) -> Vec<TaskNotice> {
        self.notices.lock().remove(parent_id).unwrap_or_default()
    }

    pub fn clean_empty_notices(&self) {
        self.notices.lock().retain(|_, queue| !queue.is_empty());
    }

    pub fn clear(&self) {
        self.tasks.lock().clear();
        self.pending_by_parent.lock().clear();
        self.notices.lock().clear();
    }

    pub fn stats(&self) -> TaskStoreStats {
        TaskStoreStats {
            tasks: self.len(),
            running: self.running().len(),
            notice_queues: self.notices.lock().len(),
            pending_parents: self.pending_by_parent.lock().len(),
        }
    }
}
