//! Runs parsed operations against the project files and the shell.
//!
//! Every outcome, including IO errors and spawn failures, comes back as an
//! [`OperationRecord`]; nothing here aborts the iteration loop.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::agent::approval::PermissionTable;
use crate::agent::operation::{Operation, OperationRecord};
use crate::safety::PermissionGate;
use crate::tools::{CommandHistory, CommandOrigin, CommandResult, CommandRunner, FileStore};

/// A command that runs a script file directly.
static SCRIPT_INVOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:node|python|python3|npx|ts-node|deno|bun)\s+['"]?([^\s'"]+\.(?:js|ts|py|mjs|cjs))['"]?"#)
        .unwrap()
});

/// A `cd` that changes where the following segments run.
static CHANGE_DIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^cd\s+['"]?([^\s'"]+)['"]?$"#).unwrap());

static SEQUENCE_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"&&|;").unwrap());

/// The worker an operation is executed for.
#[derive(Debug, Clone)]
pub struct Requester {
    pub id: Uuid,
    pub name: String,
}

pub struct OperationExecutor {
    files: Arc<dyn FileStore>,
    runner: Arc<dyn CommandRunner>,
    gate: PermissionGate,
    permissions: Arc<PermissionTable>,
    history: Arc<CommandHistory>,
}

impl OperationExecutor {
    pub fn new(
        files: Arc<dyn FileStore>,
        runner: Arc<dyn CommandRunner>,
        gate: PermissionGate,
        permissions: Arc<PermissionTable>,
        history: Arc<CommandHistory>,
    ) -> Self {
        Self {
            files,
            runner,
            gate,
            permissions,
            history,
        }
    }

    pub fn files(&self) -> &Arc<dyn FileStore> {
        &self.files
    }

    pub fn permissions(&self) -> &Arc<PermissionTable> {
        &self.permissions
    }

    pub fn history(&self) -> &Arc<CommandHistory> {
        &self.history
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    /// Execute one operation on behalf of a worker.
    pub async fn execute(
        &self,
        requester: &Requester,
        operation: Operation,
        iteration: u32,
    ) -> OperationRecord {
        debug!(worker = %requester.id, iteration, "Executing {}", operation);

        match &operation {
            Operation::Write { path, content } => match self.files.write(path, content).await {
                Ok(_) => {
                    let output = format!("File written: {path}");
                    OperationRecord::succeeded(operation, output, iteration)
                }
                Err(e) => {
                    warn!(worker = %requester.id, path = %path, error = %e, "Write failed");
                    OperationRecord::failed(operation, e.to_string(), iteration)
                }
            },
            Operation::Delete { path } => match self.files.delete(path).await {
                Ok(()) => {
                    let output = format!("File deleted: {path}");
                    OperationRecord::succeeded(operation, output, iteration)
                }
                Err(e) => {
                    warn!(worker = %requester.id, path = %path, error = %e, "Delete failed");
                    OperationRecord::failed(operation, e.to_string(), iteration)
                }
            },
            Operation::Execute { command } => {
                let command = command.clone();
                self.execute_command(requester, operation, &command, iteration)
                    .await
            }
        }
    }

    async fn execute_command(
        &self,
        requester: &Requester,
        operation: Operation,
        command: &str,
        iteration: u32,
    ) -> OperationRecord {
        if let Some(result) = self.preflight(command).await {
            warn!(worker = %requester.id, command = %command, "Script file missing, not running");
            return OperationRecord::from_command(command, result, iteration);
        }

        let classification = self.gate.classify(command);
        if classification.requires_approval
            && let Some(category) = classification.category
        {
            let description = classification
                .description
                .unwrap_or_else(|| category.to_string());
            let request = self
                .permissions
                .request(requester.id, command, category, &description)
                .await;
            return OperationRecord::awaiting_approval(operation, request.id, &description, iteration);
        }

        let origin = CommandOrigin::Worker {
            id: requester.id,
            name: requester.name.clone(),
        };
        let result = self.run_command(command, origin).await;
        OperationRecord::from_command(command, result, iteration)
    }

    /// Run a command without consulting the gate and append it to the history.
    ///
    /// Used for gate-cleared worker commands, granted requests, and direct
    /// user commands. A spawn failure becomes a failed result.
    pub async fn run_command(&self, command: &str, origin: CommandOrigin) -> CommandResult {
        let result = match self.runner.run(command).await {
            Ok(result) => result,
            Err(e) => {
                warn!(command = %command, error = %e, "Command could not be run");
                CommandResult::not_run(format!("Error: {e}"))
            }
        };

        if result.success {
            debug!(command = %command, exit_code = result.exit_code, "Command succeeded");
        } else {
            warn!(
                command = %command,
                exit_code = result.exit_code,
                timed_out = result.timed_out,
                "Command failed"
            );
        }

        self.history.record(command, origin, &result).await;
        result
    }

    /// Synthetic failure for a command whose script file does not exist.
    ///
    /// Leading `cd <dir> &&` segments are followed so the script is looked
    /// up where the shell would run it. Anything not resolvable inside the
    /// project root is left to the shell.
    async fn preflight(&self, command: &str) -> Option<CommandResult> {
        let mut dir = PathBuf::new();
        for segment in SEQUENCE_SEPARATOR.split(command).map(str::trim) {
            if let Some(target) = CHANGE_DIR.captures(segment).and_then(|c| c.get(1)) {
                let target = target.as_str();
                if !is_project_relative(target) {
                    return None;
                }
                dir.push(target);
                continue;
            }

            let Some(script) = SCRIPT_INVOCATION
                .captures(segment)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str())
            else {
                continue;
            };
            if !is_project_relative(script) {
                return None;
            }
            let path = dir.join(script);
            let path = path.to_string_lossy();
            if self.files.exists(&path).await {
                return None;
            }
            return Some(CommandResult::not_run(format!(
                "Error: Cannot find file '{path}'. The file does not exist.\n\n\
                 Command: {command}\n\n\
                 Please create the file first or check the file path."
            )));
        }
        None
    }
}

fn is_project_relative(path: &str) -> bool {
    !path.starts_with(['~', '$', '-']) && Path::new(path).is_relative()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::operation::OperationStatus;
    use crate::error::ShellError;
    use crate::tools::ProjectFiles;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records commands and answers with a fixed exit code.
    struct RecordingRunner {
        ran: Mutex<Vec<String>>,
        exit_code: i32,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, command: &str) -> Result<CommandResult, ShellError> {
            self.ran.lock().unwrap().push(command.to_string());
            Ok(CommandResult::exited(self.exit_code, "out"))
        }
    }

    fn setup(exit_code: i32) -> (TempDir, Arc<RecordingRunner>, OperationExecutor) {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner {
            ran: Mutex::new(Vec::new()),
            exit_code,
        });
        let executor = OperationExecutor::new(
            Arc::new(ProjectFiles::new(dir.path())),
            runner.clone(),
            PermissionGate::default_rules(),
            Arc::new(PermissionTable::new()),
            Arc::new(CommandHistory::new(10)),
        );
        (dir, runner, executor)
    }

    fn requester() -> Requester {
        Requester {
            id: Uuid::new_v4(),
            name: "w".to_string(),
        }
    }

    #[tokio::test]
    async fn test_write_then_delete() {
        let (dir, _runner, executor) = setup(0);
        let who = requester();

        let rec = executor
            .execute(&who, Operation::write("src/a.js", "x"), 1)
            .await;
        assert!(rec.is_success());
        assert!(dir.path().join("src/a.js").exists());

        let rec = executor.execute(&who, Operation::delete("src/a.js"), 1).await;
        assert!(rec.is_success());
        let rec = executor.execute(&who, Operation::delete("src/a.js"), 1).await;
        assert!(rec.is_success());
    }

    #[tokio::test]
    async fn test_write_outside_root_fails() {
        let (_dir, _runner, executor) = setup(0);
        let rec = executor
            .execute(&requester(), Operation::write("../../etc/passwd", "x"), 1)
            .await;
        assert_eq!(rec.status, OperationStatus::Failed);
        assert!(rec.output.contains("escapes project root"));
    }

    #[tokio::test]
    async fn test_missing_script_not_spawned() {
        let (_dir, runner, executor) = setup(0);
        let rec = executor
            .execute(&requester(), Operation::execute("node missing.js"), 1)
            .await;

        assert!(rec.is_failure());
        assert_eq!(rec.exit_code, Some(-1));
        assert!(rec.output.contains("Cannot find file 'missing.js'"));
        assert!(runner.ran.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_existing_script_runs() {
        let (dir, runner, executor) = setup(0);
        std::fs::write(dir.path().join("main.js"), "1").unwrap();

        let rec = executor
            .execute(&requester(), Operation::execute("node main.js"), 1)
            .await;

        assert!(rec.is_success());
        assert_eq!(*runner.ran.lock().unwrap(), vec!["node main.js".to_string()]);
        assert_eq!(executor.history().len().await, 1);
    }

    #[tokio::test]
    async fn test_preflight_follows_leading_cd() {
        let (dir, runner, executor) = setup(0);
        std::fs::create_dir_all(dir.path().join("app")).unwrap();
        std::fs::write(dir.path().join("app/index.js"), "1").unwrap();

        let rec = executor
            .execute(&requester(), Operation::execute("cd app && node index.js"), 1)
            .await;
        assert!(rec.is_success());

        let rec = executor
            .execute(&requester(), Operation::execute("cd app && node gone.js"), 1)
            .await;
        assert!(rec.is_failure());
        assert!(rec.output.contains("Cannot find file 'app/gone.js'"));
        assert_eq!(
            *runner.ran.lock().unwrap(),
            vec!["cd app && node index.js".to_string()]
        );
    }

    #[tokio::test]
    async fn test_sensitive_command_is_held() {
        let (_dir, runner, executor) = setup(0);
        let who = requester();
        let rec = executor
            .execute(&who, Operation::execute("npm install left-pad"), 2)
            .await;

        assert!(rec.is_blocked());
        assert!(rec.output.starts_with("Permission required:"));
        assert!(runner.ran.lock().unwrap().is_empty());

        let pending = executor.permissions().list_pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].worker_id, who.id);
        assert_eq!(Some(pending[0].id), rec.permission_id());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let (_dir, _runner, executor) = setup(2);
        let rec = executor
            .execute(&requester(), Operation::execute("ls nope"), 1)
            .await;
        assert!(rec.is_failure());
        assert_eq!(rec.exit_code, Some(2));
    }
}
