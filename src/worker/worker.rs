//! The iteration controller: drives one worker through a task.
//!
//! Each iteration renders context memory, asks the model for its next move,
//! executes the operations it names in order, and then decides whether the
//! task is verified, needs another attempt, or has run out of iterations.
//! Operational failures stay inside the loop. Only a bad request, an
//! unreachable model, or a vanished worker end a task with `Err`.

use std::sync::{Arc, LazyLock};

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::diagnosis::output_signals_error;
use crate::agent::executor::{OperationExecutor, Requester};
use crate::agent::operation::{Operation, OperationRecord};
use crate::agent::parser::OperationParser;
use crate::config::ContextLimits;
use crate::error::{Error, WorkerError};
use crate::llm::ChatMessage;
use crate::telemetry::Telemetry;
use crate::worker::activity::{WorkerActivity, excerpt};
use crate::worker::context::{TaskHistoryEntry, WorkerHandle, WorkerRegistry, WorkerSummary};
use crate::worker::memory::ContextMemory;
use crate::worker::prompts;
use crate::worker::state::WorkerStatus;

/// Commands that exercise the code rather than just shaping it.
static VERIFICATION_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:npm\s+(?:start|test|run)\b|node\s+\S|python3?\s+\S|pytest\b|cargo\s+(?:test|run|build)\b|go\s+(?:test|run)\b|make\b|deno\s+\S|bun\s+\S)",
    )
    .unwrap()
});

/// Reply phrases that mark visible self-reflection.
const REFLECTION_MARKERS: [&str; 5] = ["thinking", "reasoning", "reflection", "I think", "Let me"];

/// Captured command output kept in an activity entry.
const ACTIVITY_OUTPUT_CHARS: usize = 500;

/// Whether running `command` counts as testing the work.
pub fn is_verification_command(command: &str) -> bool {
    VERIFICATION_COMMAND.is_match(command)
}

/// Shared dependencies for task execution.
#[derive(Clone)]
pub struct WorkerDeps {
    pub registry: Arc<WorkerRegistry>,
    pub executor: Arc<OperationExecutor>,
    pub parser: Arc<dyn OperationParser>,
    pub telemetry: Telemetry,
    pub limits: ContextLimits,
    pub default_max_iterations: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Keep iterating until a test/run command succeeds cleanly.
    pub auto_debug: bool,
    /// Falls back to the configured default when unset.
    pub max_iterations: Option<u32>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            auto_debug: true,
            max_iterations: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task: String,
    /// Context handed over by the caller, shown on the first turn.
    #[serde(default)]
    pub shared_context: Map<String, Value>,
    #[serde(default)]
    pub options: TaskOptions,
}

impl TaskRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Default::default()
        }
    }

    pub fn with_context(mut self, shared_context: Map<String, Value>) -> Self {
        self.shared_context = shared_context;
        self
    }

    pub fn auto_debug(mut self, auto_debug: bool) -> Self {
        self.options.auto_debug = auto_debug;
        self
    }

    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.options.max_iterations = Some(max_iterations);
        self
    }
}

/// How a task loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCompletion {
    /// A test/run command ran in an iteration with no errors.
    Verified,
    /// Auto-debug off and the last iteration had no errors.
    Completed,
    /// The iteration bound was reached first.
    Exhausted,
}

impl std::fmt::Display for TaskCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Verified => "verified",
            Self::Completed => "completed",
            Self::Exhausted => "exhausted",
        };
        write!(f, "{s}")
    }
}

/// What the caller gets back from a task, including after exhaustion.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub worker_id: Uuid,
    /// The model's last reply.
    pub result: String,
    pub iterations: u32,
    pub completion: TaskCompletion,
    pub operations: Vec<OperationRecord>,
    pub context_memory: ContextMemory,
    /// Requests raised during the task that still await a decision.
    pub pending_permissions: Vec<Uuid>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.completion != TaskCompletion::Exhausted
    }
}

/// Reply to a peer message.
#[derive(Debug, Clone, Serialize)]
pub struct MessageOutcome {
    pub from: Uuid,
    pub to: Uuid,
    pub message: String,
    pub response: String,
    pub operations: Vec<OperationRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Verified,
    /// Clean, but nothing was run to prove it.
    Unverified,
    Failed,
}

/// Executes tasks and peer messages for one worker.
pub struct Worker {
    id: Uuid,
    deps: WorkerDeps,
}

impl Worker {
    pub fn new(id: Uuid, deps: WorkerDeps) -> Self {
        Self { id, deps }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Run a task to verification, completion, or exhaustion.
    pub async fn run_task(&self, request: TaskRequest) -> Result<TaskOutcome, Error> {
        let handle = self.deps.registry.handle(self.id).await?;
        let _task = handle.lock_task().await;
        handle.ensure_present()?;

        let auto_debug = request.options.auto_debug;
        let max_iterations = request
            .options
            .max_iterations
            .unwrap_or(self.deps.default_max_iterations);

        if request.task.trim().is_empty() {
            let err = WorkerError::InvalidTask {
                reason: "task text is empty".to_string(),
            };
            return Err(self.fail(&handle, err.into()).await);
        }
        if max_iterations == 0 {
            let err = WorkerError::InvalidTask {
                reason: "max_iterations must be at least 1".to_string(),
            };
            return Err(self.fail(&handle, err.into()).await);
        }

        let started_at = Utc::now();
        let (role, requester) = handle
            .update(|r| {
                r.set_status(WorkerStatus::Working, Some("task assigned".to_string()))?;
                r.memory.begin_task(&request.task);
                r.activity.push(WorkerActivity::TaskStarted {
                    task: request.task.clone(),
                });
                let requester = Requester {
                    id: r.id,
                    name: r.name.clone(),
                };
                Ok::<_, WorkerError>((r.role, requester))
            })
            .await?;

        info!(worker = %self.id, max_iterations, auto_debug, "Task started");
        self.emit(Some(format!("Worker {} started a task", requester.name)))
            .await;

        let system_prompt = prompts::task_system_prompt(role, auto_debug);
        let opening = prompts::task_message(&request.task, &request.shared_context);

        let mut operations: Vec<OperationRecord> = Vec::new();
        let mut last_response = String::new();
        let mut previous_had_errors = false;
        let mut completion = TaskCompletion::Exhausted;
        let mut iterations = 0;

        for iteration in 1..=max_iterations {
            iterations = iteration;
            self.ensure_present(&handle).await?;

            if iteration > 1 {
                let total_operations = operations.len();
                handle
                    .update(|r| {
                        r.set_status(WorkerStatus::Communicating, Some("reflecting".to_string()))?;
                        r.activity.push(WorkerActivity::Thinking {
                            iteration,
                            previous_errors: previous_had_errors,
                            total_operations,
                        });
                        Ok::<_, WorkerError>(())
                    })
                    .await?;
            }

            let limits = self.deps.limits;
            let (summary, shared, guidance) = handle
                .read(|r| {
                    let guidance = if iteration > 1 && previous_had_errors {
                        let previous: Vec<_> = r
                            .memory
                            .errors
                            .iter()
                            .filter(|e| e.iteration == iteration - 1 && e.recorded_at >= started_at)
                            .collect();
                        prompts::error_guidance(&previous)
                    } else {
                        String::new()
                    };
                    (
                        r.memory.render_summary(iteration, limits),
                        prompts::shared_knowledge(&r.shared_data),
                        guidance,
                    )
                })
                .await;

            let mut turns = vec![ChatMessage::user(opening.as_str())];
            if let Some(shared) = shared {
                turns.push(ChatMessage::system(shared));
            }
            turns.push(ChatMessage::system(format!("CONTEXT MEMORY:{summary}{guidance}")));
            if iteration > 1 {
                turns.push(ChatMessage::assistant(last_response.as_str()));
                turns.push(ChatMessage::user(prompts::reflection(
                    iteration,
                    previous_had_errors,
                )));
            }

            let llm = handle.llm().await;
            let response = match llm.invoke(&system_prompt, &turns).await {
                Ok(response) => response,
                Err(e) => return Err(self.fail(&handle, e.into()).await),
            };
            self.ensure_present(&handle).await?;

            if iteration > 1 {
                handle
                    .update(|r| r.set_status(WorkerStatus::Working, Some("acting".to_string())))
                    .await?;
            }
            if REFLECTION_MARKERS.iter().any(|m| response.contains(m)) {
                handle
                    .log(WorkerActivity::Reasoning {
                        iteration,
                        excerpt: excerpt(&response, 200),
                    })
                    .await;
            }

            let parsed = self.deps.parser.parse(&response);
            info!(worker = %self.id, iteration, operations = parsed.len(), "Model replied");
            last_response = response;

            let errors_before = handle.read(|r| r.memory.errors.len()).await;
            let mut records = Vec::with_capacity(parsed.len());
            for operation in parsed {
                self.ensure_present(&handle).await?;
                let record = self
                    .deps
                    .executor
                    .execute(&requester, operation, iteration)
                    .await;
                self.fold(&handle, &record).await;
                records.push(record);
            }

            let verdict = self
                .evaluate(&handle, &records, iteration, errors_before)
                .await;
            operations.extend(records);

            match (verdict, auto_debug) {
                (Verdict::Verified, _) => {
                    completion = TaskCompletion::Verified;
                    break;
                }
                (Verdict::Unverified, false) => {
                    completion = TaskCompletion::Completed;
                    break;
                }
                (Verdict::Unverified, true) => {
                    debug!(worker = %self.id, iteration, "Nothing was run this iteration, asking for verification");
                    previous_had_errors = false;
                }
                (Verdict::Failed, _) => {
                    previous_had_errors = true;
                }
            }
        }

        let pending_permissions: Vec<Uuid> = operations
            .iter()
            .filter_map(OperationRecord::permission_id)
            .collect();
        let operation_count = operations.len();

        let context_memory = handle
            .update(|r| {
                r.set_status(WorkerStatus::Idle, Some(format!("task {completion}")))?;
                r.tasks.push(TaskHistoryEntry {
                    task: request.task.clone(),
                    completion,
                    iterations,
                    operations: operation_count,
                    finished_at: Utc::now(),
                });
                r.activity.push(WorkerActivity::TaskCompleted {
                    iterations,
                    completion,
                });
                Ok::<_, WorkerError>(r.memory.clone())
            })
            .await?;

        info!(
            worker = %self.id,
            iterations,
            completion = %completion,
            operations = operation_count,
            "Task finished"
        );
        self.emit(Some(format!(
            "Worker {} finished a task ({completion})",
            requester.name
        )))
        .await;

        Ok(TaskOutcome {
            worker_id: self.id,
            result: last_response,
            iterations,
            completion,
            operations,
            context_memory,
            pending_permissions,
        })
    }

    /// Answer a message from a peer, acting on whatever operations the reply names.
    pub async fn receive_message(
        &self,
        from: &WorkerSummary,
        message: &str,
        data: Map<String, Value>,
    ) -> Result<MessageOutcome, Error> {
        let handle = self.deps.registry.handle(self.id).await?;
        let _task = handle.lock_task().await;
        handle.ensure_present()?;

        let (role, requester, shared) = handle
            .update(|r| {
                if !data.is_empty() {
                    r.shared_data.extend(data.clone());
                    r.shared_data.insert(
                        "lastUpdate".to_string(),
                        Value::String(Utc::now().to_rfc3339()),
                    );
                    r.shared_data
                        .insert("fromWorker".to_string(), Value::String(from.id.to_string()));
                }
                r.set_status(
                    WorkerStatus::Communicating,
                    Some(format!("message from {}", from.name)),
                )?;
                r.activity.push(WorkerActivity::MessageReceived {
                    from: from.id,
                    message: message.to_string(),
                });
                let requester = Requester {
                    id: r.id,
                    name: r.name.clone(),
                };
                Ok::<_, WorkerError>((r.role, requester, r.shared_data.clone()))
            })
            .await?;

        debug!(worker = %self.id, from = %from.id, "Peer message received");

        let system_prompt = prompts::collaboration_system_prompt(role, &shared);
        let turns = [ChatMessage::user(prompts::peer_message(
            &from.name, from.role, message, &data,
        ))];

        let llm = handle.llm().await;
        let response = match llm.invoke(&system_prompt, &turns).await {
            Ok(response) => response,
            Err(e) => return Err(self.fail(&handle, e.into()).await),
        };
        self.ensure_present(&handle).await?;

        let mut records = Vec::new();
        for operation in self.deps.parser.parse(&response) {
            let record = self.deps.executor.execute(&requester, operation, 0).await;
            self.fold(&handle, &record).await;
            records.push(record);
        }

        handle
            .update(|r| r.set_status(WorkerStatus::Idle, Some("message handled".to_string())))
            .await?;

        Ok(MessageOutcome {
            from: from.id,
            to: self.id,
            message: message.to_string(),
            response,
            operations: records,
        })
    }

    /// Fold one record into the worker's memory and activity log.
    async fn fold(&self, handle: &WorkerHandle, record: &OperationRecord) {
        let activity = self.activity_for(record).await;
        handle
            .update(|r| {
                r.memory.record_operation(record);
                r.activity.push(activity);
            })
            .await;
    }

    async fn activity_for(&self, record: &OperationRecord) -> WorkerActivity {
        if let Some(permission_id) = record.permission_id() {
            let command = record.operation.command().unwrap_or_default().to_string();
            if let Some(request) = self.deps.executor.permissions().get(permission_id).await {
                return WorkerActivity::PermissionRequested {
                    permission_id,
                    command,
                    category: request.category,
                    description: request.description,
                };
            }
        }

        match &record.operation {
            Operation::Execute { command } => WorkerActivity::CommandExecuted {
                command: command.clone(),
                exit_code: record.exit_code,
                timed_out: record.timed_out,
                output: excerpt(&record.output, ACTIVITY_OUTPUT_CHARS),
            },
            Operation::Write { path, content } if record.is_success() => WorkerActivity::FileWritten {
                path: path.clone(),
                size: content.len(),
            },
            Operation::Delete { path } if record.is_success() => {
                WorkerActivity::FileDeleted { path: path.clone() }
            }
            operation => WorkerActivity::OperationFailed {
                operation: operation.to_string(),
                error: record.output.clone(),
            },
        }
    }

    /// Decide how an iteration went. Clean-looking output that still reads as
    /// an error is classified into memory here. `errors_before` is the error
    /// count when the iteration started executing.
    async fn evaluate(
        &self,
        handle: &WorkerHandle,
        records: &[OperationRecord],
        iteration: u32,
        errors_before: usize,
    ) -> Verdict {
        let failed = records.iter().filter(|r| r.is_failure()).count();
        let flagged: Vec<&OperationRecord> = records
            .iter()
            .filter(|r| r.is_success() && r.executed_command().is_some())
            .filter(|r| output_signals_error(&r.output))
            .collect();

        if failed == 0 && flagged.is_empty() {
            let ran_check = records
                .iter()
                .filter_map(OperationRecord::executed_command)
                .any(is_verification_command);
            return if ran_check {
                Verdict::Verified
            } else {
                Verdict::Unverified
            };
        }

        let categories = handle
            .update(|r| {
                for record in &flagged {
                    if let Some(command) = record.operation.command() {
                        r.memory.record_error(
                            command,
                            &record.output,
                            record.exit_code,
                            iteration,
                            false,
                        );
                    }
                }
                let categories = r.memory.error_categories_since(errors_before);
                r.activity.push(WorkerActivity::ErrorDetected {
                    iteration,
                    failed_operations: failed,
                    error_outputs: flagged.len(),
                    categories: categories.clone(),
                });
                categories
            })
            .await;

        warn!(
            worker = %self.id,
            iteration,
            failed,
            error_outputs = flagged.len(),
            categories = ?categories,
            "Iteration had errors"
        );
        Verdict::Failed
    }

    async fn ensure_present(&self, handle: &WorkerHandle) -> Result<(), WorkerError> {
        if let Err(e) = handle.ensure_present() {
            warn!(worker = %self.id, "Worker removed, abandoning its work");
            self.emit(None).await;
            return Err(e);
        }
        Ok(())
    }

    /// Mark the worker errored and hand the error back for the caller.
    async fn fail(&self, handle: &WorkerHandle, err: Error) -> Error {
        error!(worker = %self.id, error = %err, "Task failed");
        let message = err.to_string();
        handle
            .update(|r| {
                if let Err(e) = r.set_status(WorkerStatus::Error, Some(message.clone())) {
                    warn!(worker = %self.id, error = %e, "Could not mark worker errored");
                }
                r.activity.push(WorkerActivity::TaskFailed { error: message });
            })
            .await;
        self.emit(Some(format!("Worker {} failed: {err}", self.id)))
            .await;
        err
    }

    async fn emit(&self, message: Option<String>) {
        let active_workers = self.deps.registry.len().await;
        let active_tasks = self.deps.registry.active_tasks().await;
        self.deps
            .telemetry
            .emit(active_workers, active_tasks, message);
    }
}
