//! Parent notification formatting
//!
//! Completions are reported to the requesting parent session as prompt
//! text. When a burst of tasks finishes, the parent gets one consolidated
//! message instead of one per task.

use chrono::{DateTime, Utc};

use fanout_contracts::TaskStatus;

use crate::task::TaskNotice;

/// Human-readable duration, e.g. "3m 24s" or "12s".
pub fn format_duration(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let seconds = (end - start).num_seconds().max(0);
    let minutes = seconds / 60;
    if minutes > 0 {
        format!("{}m {}s", minutes, seconds % 60)
    } else {
        format!("{}s", seconds)
    }
}

fn status_icon(status: TaskStatus) -> &'static str {
    if status == TaskStatus::Completed {
        "✅"
    } else {
        "❌"
    }
}

fn summary_lines(notices: &[TaskNotice]) -> String {
    notices
        .iter()
        .map(|n| format!("{} `{}`: {}", status_icon(n.status), n.task_id, n.description))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The rich message sent once every task of a parent has finished.
pub fn build_all_complete_message(notices: &[TaskNotice]) -> String {
    format!(
        "<system-notification>\n\
         **All Parallel Tasks Complete**\n\
         \n\
         {}\n\
         \n\
         Retrieve each result with `get_result(task_id)`.\n\
         </system-notification>",
        summary_lines(notices)
    )
}

/// The terse update sent while sibling tasks are still running.
pub fn build_progress_message(notices: &[TaskNotice], still_pending: usize) -> String {
    format!(
        "<system-notification>\n\
         {} parallel task(s) finished, {} still running.\n\
         \n\
         {}\n\
         </system-notification>",
        notices.len(),
        still_pending,
        summary_lines(notices)
    )
}
