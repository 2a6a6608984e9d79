//! Per-worker context memory.
//!
//! An append-only record of what a worker has done: operations, commands,
//! classified errors, and learnings. Only the rendering is bounded; entries
//! are never removed.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::diagnosis::{self, ErrorAnalysis, ErrorCategory};
use crate::agent::operation::{Operation, OperationRecord};
use crate::config::ContextLimits;

/// A task the worker was given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEntry {
    pub task: String,
    pub started_at: DateTime<Utc>,
    /// Index into `operations` where this task's work begins.
    pub first_operation: usize,
}

/// A command that actually ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRun {
    pub command: String,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub timed_out: bool,
    pub output: String,
    pub iteration: u32,
    pub executed_at: DateTime<Utc>,
}

/// A classified failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub command: String,
    pub output: String,
    pub exit_code: Option<i32>,
    pub analysis: ErrorAnalysis,
    pub iteration: u32,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMemory {
    pub task_history: Vec<TaskEntry>,
    pub operations: Vec<OperationRecord>,
    pub commands_run: Vec<CommandRun>,
    pub errors: Vec<ErrorRecord>,
    pub learnings: Vec<String>,
    /// Every path written, first write order, no duplicates.
    pub files_created: Vec<String>,
    pub files_deleted: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

impl ContextMemory {
    pub fn new() -> Self {
        Self {
            task_history: Vec::new(),
            operations: Vec::new(),
            commands_run: Vec::new(),
            errors: Vec::new(),
            learnings: Vec::new(),
            files_created: Vec::new(),
            files_deleted: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    fn touch(&mut self) {
        let now = Utc::now();
        if now > self.last_updated {
            self.last_updated = now;
        }
    }

    pub fn begin_task(&mut self, task: &str) {
        self.task_history.push(TaskEntry {
            task: task.to_string(),
            started_at: Utc::now(),
            first_operation: self.operations.len(),
        });
        self.touch();
    }

    /// Operations belonging to the current (most recent) task.
    pub fn task_operations(&self) -> &[OperationRecord] {
        let start = self
            .task_history
            .last()
            .map(|t| t.first_operation.min(self.operations.len()))
            .unwrap_or(0);
        &self.operations[start..]
    }

    /// Fold one operation outcome in. A failed command is also classified;
    /// the new error record is returned if one was added.
    pub fn record_operation(&mut self, record: &OperationRecord) -> Option<&ErrorRecord> {
        self.operations.push(record.clone());

        let mut added_error = false;
        match &record.operation {
            Operation::Write { path, .. } if record.is_success() => {
                if !self.files_created.iter().any(|p| p == path) {
                    self.files_created.push(path.clone());
                }
            }
            Operation::Delete { path } if record.is_success() => {
                self.files_deleted.push(path.clone());
            }
            Operation::Execute { command } if !record.is_blocked() => {
                self.commands_run.push(CommandRun {
                    command: command.clone(),
                    exit_code: record.exit_code,
                    success: record.is_success(),
                    timed_out: record.timed_out,
                    output: record.output.clone(),
                    iteration: record.iteration,
                    executed_at: record.recorded_at,
                });
                if record.is_failure() {
                    added_error = self.record_error(
                        command,
                        &record.output,
                        record.exit_code,
                        record.iteration,
                        true,
                    );
                }
            }
            _ => {}
        }

        self.touch();
        if added_error { self.errors.last() } else { None }
    }

    /// Classify and store an error unless one already exists for the same
    /// command in the same iteration. Returns whether a record was added.
    pub fn record_error(
        &mut self,
        command: &str,
        output: &str,
        exit_code: Option<i32>,
        iteration: u32,
        learn: bool,
    ) -> bool {
        let duplicate = self
            .errors
            .iter()
            .any(|e| e.command == command && e.iteration == iteration);
        if duplicate {
            return false;
        }

        let analysis = diagnosis::classify(command, output);
        if learn
            && let Some(learning) = analysis.learning()
            && !self.learnings.contains(&learning)
        {
            self.learnings.push(learning);
        }

        self.errors.push(ErrorRecord {
            command: command.to_string(),
            output: output.to_string(),
            exit_code,
            analysis,
            iteration,
            recorded_at: Utc::now(),
        });
        self.touch();
        true
    }

    /// Categories of the errors recorded from index `start` on, deduplicated,
    /// oldest first.
    pub fn error_categories_since(&self, start: usize) -> Vec<ErrorCategory> {
        let start = start.min(self.errors.len());
        let mut categories = Vec::new();
        for e in &self.errors[start..] {
            if !categories.contains(&e.analysis.category) {
                categories.push(e.analysis.category);
            }
        }
        categories
    }

    /// Render the bounded summary placed in front of the next model turn.
    ///
    /// Command output is rendered in full; only the number of entries is bounded.
    pub fn render_summary(&self, iteration: u32, limits: ContextLimits) -> String {
        let task_ops = self.task_operations();
        let recent_start = task_ops.len().saturating_sub(limits.recent_operations);
        let (earlier, recent) = task_ops.split_at(recent_start);

        let mut s = String::new();
        let _ = writeln!(s, "\n\n=== CONTEXT MEMORY - What You Know ===");
        let _ = writeln!(s, "Current Iteration: {iteration}");
        let _ = writeln!(s, "Total Operations: {}\n", task_ops.len());

        let written: Vec<&str> = recent
            .iter()
            .filter(|r| r.is_success() && matches!(r.operation, Operation::Write { .. }))
            .filter_map(|r| r.operation.path())
            .collect();
        if !written.is_empty() {
            s.push_str("Files Created/Modified:\n");
            for path in written {
                let _ = writeln!(s, "  - {path}");
            }
            s.push('\n');
        }

        let deleted: Vec<&str> = recent
            .iter()
            .filter(|r| r.is_success() && matches!(r.operation, Operation::Delete { .. }))
            .filter_map(|r| r.operation.path())
            .collect();
        if !deleted.is_empty() {
            s.push_str("Files Deleted:\n");
            for path in deleted {
                let _ = writeln!(s, "  - {path}");
            }
            s.push('\n');
        }

        let failed_file_ops: Vec<&OperationRecord> = recent
            .iter()
            .filter(|r| r.is_failure() && r.operation.path().is_some())
            .collect();
        if !failed_file_ops.is_empty() {
            s.push_str("Failed File Operations:\n");
            for r in failed_file_ops {
                let _ = writeln!(s, "  - {}: {}", r.operation, r.output);
            }
            s.push('\n');
        }

        let commands: Vec<&OperationRecord> = recent
            .iter()
            .filter(|r| r.executed_command().is_some())
            .collect();
        if !commands.is_empty() {
            s.push_str("=== TERMINAL OUTPUT (READ THIS CAREFULLY FOR DEBUGGING) ===\n");
            s.push_str("The terminal output below shows EXACTLY what happened when you ran commands.\n");
            s.push_str("READ THE FULL OUTPUT - it contains critical error messages and debugging information.\n\n");

            for (idx, r) in commands.iter().enumerate() {
                let n = idx + 1;
                let command = r.executed_command().unwrap_or_default();
                let code = r.exit_code.unwrap_or(0);
                let verdict = if r.is_success() { "(SUCCESS)" } else { "(FAILED)" };
                let _ = writeln!(s, "\n--- Command {n}: {command} ---");
                let _ = writeln!(s, "Exit Code: {code} {verdict}");
                if r.timed_out {
                    s.push_str("Timed out: the process was killed\n");
                }
                let _ = writeln!(s, "Output:\n{}", non_empty(&r.output));
                let _ = writeln!(s, "--- End Command {n} ---\n");
            }

            let failed: Vec<&&OperationRecord> =
                commands.iter().filter(|r| r.is_failure()).collect();
            if !failed.is_empty() {
                s.push_str("\nFAILED COMMANDS (PRIORITY DEBUGGING):\n");
                for (idx, r) in failed.iter().enumerate() {
                    let _ = writeln!(
                        s,
                        "\nFailed Command {}: {}",
                        idx + 1,
                        r.executed_command().unwrap_or_default()
                    );
                    let _ = writeln!(s, "Exit Code: {}", r.exit_code.unwrap_or(-1));
                    let _ = writeln!(s, "FULL ERROR OUTPUT:\n{}", non_empty(&r.output));
                    s.push_str("\nREAD THIS OUTPUT CAREFULLY - it tells you exactly what went wrong!\n");
                }
                s.push('\n');
            }
        }

        let awaiting: Vec<&OperationRecord> = recent.iter().filter(|r| r.is_blocked()).collect();
        if !awaiting.is_empty() {
            s.push_str("Commands Awaiting Approval (do not retry them, continue with other work):\n");
            for r in awaiting {
                let _ = writeln!(s, "  - {}", r.operation.command().unwrap_or_default());
            }
            s.push('\n');
        }

        let error_start = self.errors.len().saturating_sub(limits.recent_errors);
        let recent_errors = &self.errors[error_start..];
        if !recent_errors.is_empty() {
            s.push_str("=== ERROR ANALYSIS & GUIDANCE ===\n");
            for (idx, e) in recent_errors.iter().enumerate() {
                let category = e.analysis.category;
                let _ = writeln!(s, "\nError {} ({category}):", idx + 1);
                let _ = writeln!(s, "  Command: {}", e.command);
                let _ = writeln!(s, "  FULL TERMINAL OUTPUT:\n{}", non_empty(&e.output));
                let _ = writeln!(s, "  Error Type: {category}");
                let _ = writeln!(s, "  Guidance: {}", e.analysis.guidance.join(" "));
                s.push_str("  Suggested Fixes:\n");
                for fix in &e.analysis.suggested_fixes {
                    let _ = writeln!(s, "    - {fix}");
                }
            }
            s.push('\n');
        }

        if iteration > 1 {
            let _ = writeln!(s, "What You've Tried Before:");
            let _ = writeln!(s, "You are on iteration {iteration}. Previous attempts:");
            for r in earlier {
                let line = match &r.operation {
                    Operation::Write { path, .. } => format!("Created file: {path}"),
                    Operation::Delete { path } => format!("Deleted file: {path}"),
                    Operation::Execute { command } if r.is_blocked() => {
                        format!("Requested: {command} (awaiting approval)")
                    }
                    Operation::Execute { command } => match r.exit_code {
                        Some(0) => format!("Ran: {command} (success)"),
                        Some(code) => format!("Ran: {command} (failed: {code})"),
                        None => format!("Ran: {command} (failed)"),
                    },
                };
                let _ = writeln!(s, "  - {line}");
            }
            s.push('\n');
        }

        let learning_start = self.learnings.len().saturating_sub(limits.learnings);
        let learnings = &self.learnings[learning_start..];
        if !learnings.is_empty() {
            s.push_str("Key Learnings:\n");
            for l in learnings {
                let _ = writeln!(s, "  - {l}");
            }
            s.push('\n');
        }

        s.push_str("=== END CONTEXT ===\n");
        s
    }
}

impl Default for ContextMemory {
    fn default() -> Self {
        Self::new()
    }
}

fn non_empty(output: &str) -> &str {
    if output.trim().is_empty() {
        "(no output)"
    } else {
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::shell::CommandResult;

    fn failed_run(cmd: &str, output: &str, iteration: u32) -> OperationRecord {
        OperationRecord::from_command(cmd, CommandResult::exited(1, output), iteration)
    }

    #[test]
    fn test_failed_command_is_classified_once() {
        let mut memory = ContextMemory::new();
        memory.begin_task("run it");

        let rec = failed_run("node hello.js", "SyntaxError: Unexpected token", 1);
        let added = memory.record_operation(&rec).map(|e| e.analysis.category);
        assert_eq!(added, Some(ErrorCategory::SyntaxError));

        // Same command, same iteration: deduplicated.
        assert!(!memory.record_error("node hello.js", "SyntaxError", Some(1), 1, true));
        assert_eq!(memory.errors.len(), 1);
        assert_eq!(
            memory.learnings,
            vec!["syntax_error: Read the file and check the syntax around the error line"]
        );
    }

    #[test]
    fn test_error_categories_since_ignores_older_errors() {
        let mut memory = ContextMemory::new();
        memory.record_operation(&failed_run("node a.js", "SyntaxError: bad", 1));
        let start = memory.errors.len();
        assert!(memory.error_categories_since(start).is_empty());

        memory.record_operation(&failed_run("npm test", "Error: listen EADDRINUSE :::3000", 2));
        memory.record_operation(&failed_run("npm start", "Error: listen EADDRINUSE :::3000", 2));
        assert_eq!(
            memory.error_categories_since(start),
            vec![ErrorCategory::PortInUse]
        );
        assert!(memory.error_categories_since(99).is_empty());
    }

    #[test]
    fn test_files_tracked() {
        let mut memory = ContextMemory::new();
        memory.record_operation(&OperationRecord::succeeded(Operation::write("a.js", "x"), "", 1));
        memory.record_operation(&OperationRecord::succeeded(Operation::write("a.js", "y"), "", 2));
        memory.record_operation(&OperationRecord::succeeded(Operation::delete("b.js"), "", 2));
        memory.record_operation(&OperationRecord::failed(Operation::write("../x", "z"), "denied", 2));

        assert_eq!(memory.files_created, vec!["a.js"]);
        assert_eq!(memory.files_deleted, vec!["b.js"]);
        assert_eq!(memory.operations.len(), 4);
    }

    #[test]
    fn test_last_updated_is_monotonic() {
        let mut memory = ContextMemory::new();
        let before = memory.last_updated;
        memory.record_operation(&OperationRecord::succeeded(Operation::write("a.js", "x"), "", 1));
        assert!(memory.last_updated >= before);
    }

    #[test]
    fn test_summary_contains_full_output() {
        let mut memory = ContextMemory::new();
        memory.begin_task("task");
        let long_output = format!("SyntaxError at line 1\n{}", "detail ".repeat(500));
        memory.record_operation(&OperationRecord::succeeded(Operation::write("hello.js", "x"), "", 1));
        memory.record_operation(&failed_run("node hello.js", &long_output, 1));

        let summary = memory.render_summary(2, ContextLimits::default());
        assert!(summary.starts_with("\n\n=== CONTEXT MEMORY - What You Know ==="));
        assert!(summary.contains("Current Iteration: 2"));
        assert!(summary.contains("Files Created/Modified:\n  - hello.js"));
        assert!(summary.contains(&long_output));
        assert!(summary.contains("Exit Code: 1 (FAILED)"));
        assert!(summary.contains("FAILED COMMANDS"));
        assert!(summary.contains("Error 1 (syntax_error)"));
        assert!(summary.contains("Key Learnings:"));
        assert!(summary.trim_end().ends_with("=== END CONTEXT ==="));
    }

    #[test]
    fn test_summary_limits_and_recap() {
        let mut memory = ContextMemory::new();
        memory.begin_task("task");
        for i in 0..12 {
            memory.record_operation(&OperationRecord::succeeded(
                Operation::write(format!("f{i}.js"), "x"),
                "",
                1,
            ));
        }
        let limits = ContextLimits {
            recent_operations: 10,
            recent_errors: 5,
            learnings: 3,
        };

        let summary = memory.render_summary(2, limits);
        assert!(summary.contains("Total Operations: 12"));
        assert!(summary.contains("What You've Tried Before:"));
        // The two oldest fall out of the recent window into the recap.
        assert!(summary.contains("  - Created file: f0.js"));
        assert!(summary.contains("  - Created file: f1.js"));
        assert!(!summary.contains("  - Created file: f2.js"));
        assert!(summary.contains("  - f11.js"));
    }

    #[test]
    fn test_summary_first_iteration_has_no_recap() {
        let memory = ContextMemory::new();
        let summary = memory.render_summary(1, ContextLimits::default());
        assert!(!summary.contains("What You've Tried Before"));
        assert!(summary.contains("Total Operations: 0"));
    }

    #[test]
    fn test_task_operations_scoped_to_latest_task() {
        let mut memory = ContextMemory::new();
        memory.begin_task("first");
        memory.record_operation(&OperationRecord::succeeded(Operation::write("a.js", "x"), "", 1));
        memory.begin_task("second");
        assert!(memory.task_operations().is_empty());
        assert_eq!(memory.operations.len(), 1);
    }

    #[test]
    fn test_blocked_commands_listed_not_run() {
        let mut memory = ContextMemory::new();
        memory.begin_task("task");
        memory.record_operation(&OperationRecord::awaiting_approval(
            Operation::execute("npm install"),
            uuid::Uuid::new_v4(),
            "Install npm packages",
            1,
        ));
        assert!(memory.commands_run.is_empty());
        assert!(memory.errors.is_empty());
        let summary = memory.render_summary(1, ContextLimits::default());
        assert!(summary.contains("Commands Awaiting Approval"));
        assert!(!summary.contains("TERMINAL OUTPUT"));
    }
}
