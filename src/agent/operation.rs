//! Operations extracted from model output and the records of their outcomes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tools::shell::CommandResult;

/// One discrete action a worker asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Write { path: String, content: String },
    Delete { path: String },
    Execute { command: String },
}

impl Operation {
    pub fn write(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Write {
            path: path.into(),
            content: content.into(),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::Delete { path: path.into() }
    }

    pub fn execute(command: impl Into<String>) -> Self {
        Self::Execute {
            command: command.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Write { .. } => "write",
            Self::Delete { .. } => "delete",
            Self::Execute { .. } => "execute",
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            Self::Write { path, .. } | Self::Delete { path } => Some(path),
            Self::Execute { .. } => None,
        }
    }

    pub fn command(&self) -> Option<&str> {
        match self {
            Self::Execute { command } => Some(command),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write { path, content } => write!(f, "write {} ({} bytes)", path, content.len()),
            Self::Delete { path } => write!(f, "delete {}", path),
            Self::Execute { command } => write!(f, "execute `{}`", command),
        }
    }
}

/// How an operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationStatus {
    Succeeded,
    Failed,
    /// Held by the permission gate; runs later only if the request is granted.
    AwaitingApproval { permission_id: Uuid },
}

/// An operation with its outcome attached. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub operation: Operation,
    #[serde(flatten)]
    pub status: OperationStatus,
    /// Full captured output for commands, or the error/notice text otherwise.
    pub output: String,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
    /// 1-based iteration that produced this record; 0 for work outside a task loop.
    pub iteration: u32,
    pub recorded_at: DateTime<Utc>,
}

impl OperationRecord {
    fn new(operation: Operation, status: OperationStatus, output: String, iteration: u32) -> Self {
        Self {
            operation,
            status,
            output,
            exit_code: None,
            timed_out: false,
            iteration,
            recorded_at: Utc::now(),
        }
    }

    pub fn succeeded(operation: Operation, output: impl Into<String>, iteration: u32) -> Self {
        Self::new(operation, OperationStatus::Succeeded, output.into(), iteration)
    }

    pub fn failed(operation: Operation, error: impl Into<String>, iteration: u32) -> Self {
        Self::new(operation, OperationStatus::Failed, error.into(), iteration)
    }

    pub fn awaiting_approval(
        operation: Operation,
        permission_id: Uuid,
        description: &str,
        iteration: u32,
    ) -> Self {
        Self::new(
            operation,
            OperationStatus::AwaitingApproval { permission_id },
            format!("Permission required: {description}. Waiting for approval..."),
            iteration,
        )
    }

    /// Record a command that ran (or was synthetically failed) through the shell.
    pub fn from_command(command: &str, result: CommandResult, iteration: u32) -> Self {
        let status = if result.success {
            OperationStatus::Succeeded
        } else {
            OperationStatus::Failed
        };
        Self {
            operation: Operation::execute(command),
            status,
            output: result.output,
            exit_code: Some(result.exit_code),
            timed_out: result.timed_out,
            iteration,
            recorded_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OperationStatus::Succeeded
    }

    pub fn is_failure(&self) -> bool {
        self.status == OperationStatus::Failed
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self.status, OperationStatus::AwaitingApproval { .. })
    }

    pub fn permission_id(&self) -> Option<Uuid> {
        match self.status {
            OperationStatus::AwaitingApproval { permission_id } => Some(permission_id),
            _ => None,
        }
    }

    /// Commands that actually ran (blocked commands excluded).
    pub fn executed_command(&self) -> Option<&str> {
        if self.is_blocked() {
            None
        } else {
            self.operation.command()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_from_command() {
        let rec = OperationRecord::from_command("node a.js", CommandResult::exited(1, "boom"), 2);
        assert!(rec.is_failure());
        assert_eq!(rec.exit_code, Some(1));
        assert_eq!(rec.executed_command(), Some("node a.js"));
        assert_eq!(rec.iteration, 2);
    }

    #[test]
    fn test_blocked_record_is_not_executed() {
        let id = Uuid::new_v4();
        let rec = OperationRecord::awaiting_approval(
            Operation::execute("npm install"),
            id,
            "Install npm packages",
            1,
        );
        assert!(rec.is_blocked());
        assert!(!rec.is_failure());
        assert_eq!(rec.permission_id(), Some(id));
        assert_eq!(rec.executed_command(), None);
        assert!(rec.output.contains("Install npm packages"));
    }

    #[test]
    fn test_serialized_shape() {
        let rec = OperationRecord::succeeded(Operation::delete("old.js"), "", 1);
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["operation"]["type"], "delete");
        assert_eq!(json["operation"]["path"], "old.js");
        assert_eq!(json["status"], "succeeded");
    }
}
