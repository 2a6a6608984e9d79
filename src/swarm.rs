//! The swarm: one owned value holding the registry, pipelines, permission table,
//! command history and executor, with the operations callers use.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::approval::{PermissionRequest, PermissionTable};
use crate::agent::executor::OperationExecutor;
use crate::agent::operation::OperationRecord;
use crate::agent::parser::{OperationParser, PatternParser};
use crate::config::SwarmConfig;
use crate::error::{Error, WorkerError};
use crate::llm::LlmProvider;
use crate::pipeline::{PipelineReply, PipelineRun, PipelineStatus, PipelineSummary, Pipelines};
use crate::safety::PermissionGate;
use crate::telemetry::{MetricsEvent, Telemetry};
use crate::tools::{
    CommandHistory, CommandOrigin, CommandResult, CommandRunner, FileStore, HistoryEntry,
    ProjectFiles, ShellTool,
};
use crate::worker::activity::{ACTIVITY_PAGE, ActivityEntry, WorkerActivity, excerpt};
use crate::worker::context::{WorkerRecord, WorkerRegistry, WorkerSpec, WorkerSummary, WorkerUpdate};
use crate::worker::role::select_responder;
use crate::worker::state::WorkerStatus;
use crate::worker::{MessageOutcome, TaskOutcome, TaskRequest, Worker, WorkerDeps};

/// A granted request and the result of its single execution.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovedExecution {
    pub request: PermissionRequest,
    pub result: CommandResult,
}

/// Swaps in alternative adapters, mostly for tests.
pub struct SwarmBuilder {
    config: SwarmConfig,
    files: Option<Arc<dyn FileStore>>,
    runner: Option<Arc<dyn CommandRunner>>,
    gate: PermissionGate,
    parser: Arc<dyn OperationParser>,
}

impl SwarmBuilder {
    pub fn with_files(mut self, files: Arc<dyn FileStore>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn with_gate(mut self, gate: PermissionGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn OperationParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn build(self) -> Swarm {
        let config = self.config;
        let files = self
            .files
            .unwrap_or_else(|| Arc::new(ProjectFiles::new(config.project_root.clone())));
        let runner = self.runner.unwrap_or_else(|| {
            Arc::new(
                ShellTool::new()
                    .with_working_dir(config.project_root.clone())
                    .with_timeout(config.command_timeout),
            )
        });
        let executor = OperationExecutor::new(
            files,
            runner,
            self.gate,
            Arc::new(PermissionTable::new()),
            Arc::new(CommandHistory::new(config.history_capacity)),
        );

        let registry = Arc::new(WorkerRegistry::new());
        let telemetry = Telemetry::new(config.metrics_capacity);
        Swarm {
            pipelines: Pipelines::new(registry.clone(), telemetry.clone()),
            registry,
            executor: Arc::new(executor),
            parser: self.parser,
            telemetry,
            relay_turn: AtomicUsize::new(0),
            config,
        }
    }
}

pub struct Swarm {
    config: SwarmConfig,
    registry: Arc<WorkerRegistry>,
    executor: Arc<OperationExecutor>,
    parser: Arc<dyn OperationParser>,
    telemetry: Telemetry,
    pipelines: Pipelines,
    relay_turn: AtomicUsize,
}

impl Swarm {
    pub fn new(config: SwarmConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: SwarmConfig) -> SwarmBuilder {
        SwarmBuilder {
            config,
            files: None,
            runner: None,
            gate: PermissionGate::default_rules(),
            parser: Arc::new(PatternParser::new()),
        }
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    fn deps(&self) -> WorkerDeps {
        WorkerDeps {
            registry: self.registry.clone(),
            executor: self.executor.clone(),
            parser: self.parser.clone(),
            telemetry: self.telemetry.clone(),
            limits: self.config.context_limits,
            default_max_iterations: self.config.default_max_iterations,
        }
    }

    async fn emit(&self, message: Option<String>) {
        let active_workers = self.registry.len().await;
        let active_tasks = self.registry.active_tasks().await;
        self.telemetry.emit(active_workers, active_tasks, message);
    }

    // ── Workers ──────────────────────────────────────────────────────────

    /// Register a worker. An unreachable model is only a warning here; the
    /// first task that needs it fails instead.
    pub async fn spawn_worker(&self, spec: WorkerSpec, provider: Arc<dyn LlmProvider>) -> WorkerSummary {
        if let Err(e) = provider.health_check().await {
            warn!(endpoint = %spec.endpoint, model = %spec.model, error = %e, "Model health check failed");
        }
        let summary = self.registry.spawn(spec, provider).await;
        info!(worker = %summary.id, name = %summary.name, role = %summary.role, "Worker spawned");
        self.emit(Some(format!("Worker {} spawned", summary.name))).await;
        summary
    }

    pub async fn list_workers(&self) -> Vec<WorkerSummary> {
        self.registry.list().await
    }

    pub async fn get_worker(&self, id: Uuid) -> Result<WorkerRecord, Error> {
        Ok(self.registry.get(id).await?)
    }

    pub async fn update_worker(&self, id: Uuid, update: WorkerUpdate) -> Result<WorkerSummary, Error> {
        let summary = self.registry.update(id, update).await?;
        info!(worker = %id, "Worker updated");
        Ok(summary)
    }

    pub async fn remove_worker(&self, id: Uuid) -> Result<WorkerSummary, Error> {
        let summary = self.registry.remove(id).await?;
        info!(worker = %id, name = %summary.name, "Worker removed");
        self.emit(Some(format!("Worker {} removed", summary.name))).await;
        Ok(summary)
    }

    /// Most recent activity, newest first.
    pub async fn worker_activity(&self, id: Uuid) -> Result<Vec<ActivityEntry>, Error> {
        Ok(self.registry.activity(id, ACTIVITY_PAGE).await?)
    }

    // ── Tasks and messages ───────────────────────────────────────────────

    pub async fn assign_task(&self, worker_id: Uuid, request: TaskRequest) -> Result<TaskOutcome, Error> {
        Worker::new(worker_id, self.deps()).run_task(request).await
    }

    pub async fn send_message(
        &self,
        from: Uuid,
        to: Uuid,
        message: &str,
        data: Map<String, Value>,
    ) -> Result<MessageOutcome, Error> {
        if from == to {
            return Err(WorkerError::InvalidTask {
                reason: "a worker cannot message itself".to_string(),
            }
            .into());
        }
        let sender = self.registry.handle(from).await?;
        self.registry.handle(to).await?;

        // The sender's status is only touched while no task owns it.
        let (sender_summary, marked) = {
            let idle_sender = sender.try_lock_task();
            sender
                .update(|r| {
                    r.activity.push(WorkerActivity::MessageSent {
                        to,
                        message: message.to_string(),
                    });
                    let marked = idle_sender.is_some()
                        && !r.state.status.is_busy()
                        && r
                            .set_status(WorkerStatus::Communicating, Some(format!("messaging {to}")))
                            .is_ok();
                    (r.summary(), marked)
                })
                .await
        };
        info!(from = %from, to = %to, message = %excerpt(message, 80), "Peer message");
        self.emit(None).await;

        let result = Worker::new(to, self.deps())
            .receive_message(&sender_summary, message, data)
            .await;

        if marked && let Some(_idle_sender) = sender.try_lock_task() {
            sender
                .update(|r| {
                    if r.state.status == WorkerStatus::Communicating
                        && let Err(e) = r.set_status(WorkerStatus::Idle, None)
                    {
                        warn!(worker = %from, error = %e, "Could not reset sender status");
                    }
                })
                .await;
        }
        self.emit(None).await;
        result
    }

    /// Send `message` to whichever peer's turn it is in the relay rotation.
    pub async fn relay(&self, from: Uuid, message: &str, data: Map<String, Value>) -> Result<MessageOutcome, Error> {
        self.registry.handle(from).await?;
        let peers: Vec<WorkerSummary> = self
            .registry
            .list()
            .await
            .into_iter()
            .filter(|w| w.id != from)
            .collect();
        let roles: Vec<_> = peers.iter().map(|w| w.role).collect();
        let turn = self.relay_turn.fetch_add(1, Ordering::SeqCst);
        let index = select_responder(&roles, turn).ok_or(WorkerError::NoPeer { id: from })?;
        self.send_message(from, peers[index].id, message, data).await
    }

    // ── Pipelines ────────────────────────────────────────────────────────

    /// Run the architect, builder, optimizer and tester stages over
    /// `project` in the background. The handle resolves to the final status.
    pub async fn start_pipeline(
        &self,
        project: &str,
        provider: Arc<dyn LlmProvider>,
    ) -> (Uuid, JoinHandle<PipelineStatus>) {
        self.pipelines.start(project, provider).await
    }

    pub async fn list_pipelines(&self) -> Vec<PipelineSummary> {
        self.pipelines.list().await
    }

    pub async fn pipeline_result(&self, id: Uuid) -> Result<PipelineRun, Error> {
        Ok(self.pipelines.get(id).await?)
    }

    pub async fn chat_with_pipeline(&self, id: Uuid, message: &str) -> Result<PipelineReply, Error> {
        self.pipelines.chat(id, message).await
    }

    // ── Permissions ──────────────────────────────────────────────────────

    pub async fn list_pending(&self) -> Vec<PermissionRequest> {
        self.executor.permissions().list_pending().await
    }

    /// Grant a request and run its command exactly once.
    pub async fn grant(&self, id: Uuid) -> Result<ApprovedExecution, Error> {
        let request = self.executor.permissions().grant(id).await?;
        info!(permission = %id, command = %request.command, "Permission granted");

        let origin = CommandOrigin::Approved {
            worker_id: request.worker_id,
            permission_id: id,
        };
        let result = self.executor.run_command(&request.command, origin).await;

        if let Ok(handle) = self.registry.handle(request.worker_id).await {
            let record = OperationRecord::from_command(&request.command, result.clone(), 0);
            handle
                .update(|r| {
                    r.memory.record_operation(&record);
                    r.activity.push(WorkerActivity::CommandExecuted {
                        command: request.command.clone(),
                        exit_code: Some(result.exit_code),
                        timed_out: result.timed_out,
                        output: excerpt(&result.output, 500),
                    });
                })
                .await;
        }

        Ok(ApprovedExecution { request, result })
    }

    pub async fn deny(&self, id: Uuid) -> Result<PermissionRequest, Error> {
        let request = self.executor.permissions().deny(id).await?;
        info!(permission = %id, command = %request.command, "Permission denied");
        Ok(request)
    }

    // ── Direct commands ──────────────────────────────────────────────────

    /// Run a user command through the executor, bypassing the gate.
    pub async fn run_command(&self, command: &str) -> CommandResult {
        self.executor.run_command(command, CommandOrigin::Direct).await
    }

    pub async fn command_history(&self, limit: usize) -> Vec<HistoryEntry> {
        self.executor.history().recent(limit).await
    }

    pub async fn commands_since(&self, since: DateTime<Utc>) -> Vec<HistoryEntry> {
        self.executor.history().since(since).await
    }

    pub async fn clear_history(&self) {
        self.executor.history().clear().await;
    }

    // ── Telemetry ────────────────────────────────────────────────────────

    pub fn subscribe_metrics(&self) -> broadcast::Receiver<MetricsEvent> {
        self.telemetry.subscribe()
    }

    pub fn metrics_stream(&self) -> BroadcastStream<MetricsEvent> {
        self.telemetry.stream()
    }
}
