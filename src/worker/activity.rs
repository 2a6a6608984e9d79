//! Per-worker activity log.
//!
//! A bounded, human-oriented trail of what a worker did. Unlike context
//! memory it is never fed back to the model.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::diagnosis::ErrorCategory;
use crate::safety::PermissionCategory;
use crate::worker::TaskCompletion;

/// Entries kept per worker.
pub const ACTIVITY_CAPACITY: usize = 500;

/// Entries returned by [`ActivityLog::recent`] by default.
pub const ACTIVITY_PAGE: usize = 100;

/// Things a worker does that an operator may want to see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerActivity {
    TaskStarted {
        task: String,
    },
    /// Between iterations, before the next model call.
    Thinking {
        iteration: u32,
        previous_errors: bool,
        total_operations: usize,
    },
    /// The reply contained visible self-reflection.
    Reasoning {
        iteration: u32,
        excerpt: String,
    },
    FileWritten {
        path: String,
        size: usize,
    },
    FileDeleted {
        path: String,
    },
    OperationFailed {
        operation: String,
        error: String,
    },
    CommandExecuted {
        command: String,
        exit_code: Option<i32>,
        timed_out: bool,
        output: String,
    },
    PermissionRequested {
        permission_id: Uuid,
        command: String,
        category: PermissionCategory,
        description: String,
    },
    ErrorDetected {
        iteration: u32,
        failed_operations: usize,
        error_outputs: usize,
        categories: Vec<ErrorCategory>,
    },
    TaskCompleted {
        iterations: u32,
        completion: TaskCompletion,
    },
    TaskFailed {
        error: String,
    },
    MessageSent {
        to: Uuid,
        message: String,
    },
    MessageReceived {
        from: Uuid,
        message: String,
    },
}

impl WorkerActivity {
    /// One-line description for logs and terminals.
    pub fn summary(&self) -> String {
        match self {
            Self::TaskStarted { task } => format!("Started task: {}", excerpt(task, 100)),
            Self::Thinking { iteration, .. } => {
                format!("Iteration {iteration}: Analyzing previous attempt and planning next steps...")
            }
            Self::Reasoning { excerpt: text, .. } => format!("Self-reflection: {text}"),
            Self::FileWritten { path, .. } => format!("Created/updated file: {path}"),
            Self::FileDeleted { path } => format!("Deleted file: {path}"),
            Self::OperationFailed { operation, error } => format!("Failed to {operation}: {error}"),
            Self::CommandExecuted {
                command, exit_code, ..
            } => match exit_code {
                Some(code) => format!("Executed command: {command} (exit {code})"),
                None => format!("Executed command: {command}"),
            },
            Self::PermissionRequested { description, .. } => {
                format!("Permission requested: {description}")
            }
            Self::ErrorDetected { iteration, .. } => {
                format!("Iteration {iteration}: Errors detected, continuing to fix...")
            }
            Self::TaskCompleted {
                iterations,
                completion,
            } => format!("Task {completion} after {iterations} iteration(s)"),
            Self::TaskFailed { error } => format!("Task failed: {error}"),
            Self::MessageSent { to, message } => {
                format!("Sent message to {to}: {}", excerpt(message, 100))
            }
            Self::MessageReceived { from, message } => {
                format!("Message from {from}: {}", excerpt(message, 100))
            }
        }
    }
}

/// Truncate to `max` chars with an ellipsis.
pub(crate) fn excerpt(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max).collect::<String>())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub activity: WorkerActivity,
}

/// Bounded activity log, oldest evicted first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLog {
    entries: VecDeque<ActivityEntry>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, activity: WorkerActivity) {
        if self.entries.len() >= ACTIVITY_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(ActivityEntry {
            timestamp: Utc::now(),
            activity,
        });
    }

    /// Most recent `limit` entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<ActivityEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_is_bounded() {
        let mut log = ActivityLog::new();
        for i in 0..(ACTIVITY_CAPACITY + 20) {
            log.push(WorkerActivity::FileDeleted {
                path: format!("f{i}"),
            });
        }
        assert_eq!(log.len(), ACTIVITY_CAPACITY);
    }

    #[test]
    fn test_recent_newest_first() {
        let mut log = ActivityLog::new();
        for i in 0..150 {
            log.push(WorkerActivity::FileDeleted {
                path: format!("f{i}"),
            });
        }
        let recent = log.recent(ACTIVITY_PAGE);
        assert_eq!(recent.len(), ACTIVITY_PAGE);
        assert_eq!(
            recent[0].activity,
            WorkerActivity::FileDeleted {
                path: "f149".to_string()
            }
        );
    }

    #[test]
    fn test_summary_truncates_task() {
        let activity = WorkerActivity::TaskStarted {
            task: "x".repeat(150),
        };
        assert!(activity.summary().ends_with("..."));
    }

    #[test]
    fn test_entry_serialises_flat() {
        let mut log = ActivityLog::new();
        log.push(WorkerActivity::FileWritten {
            path: "a.js".to_string(),
            size: 3,
        });
        let json = serde_json::to_value(&log.recent(1)[0]).unwrap();
        assert_eq!(json["type"], "file_written");
        assert_eq!(json["path"], "a.js");
        assert!(json.get("timestamp").is_some());
    }
}
