//! Staged pipelines: an architect plans, a builder implements, an optimizer
//! refines and a tester checks, each stage reading the work before it.
//!
//! A pipeline is plain prompt chaining over one `LlmProvider`; stages do not
//! execute operations. Finished runs stay queryable and can be chatted with,
//! the stages taking turns to answer.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{Error, LlmError, PipelineError};
use crate::llm::{ChatMessage, LlmProvider, Role};
use crate::telemetry::Telemetry;
use crate::worker::context::WorkerRegistry;
use crate::worker::role::WorkerRole;

/// Chat turns included when a stage answers a follow-up.
pub const CHAT_CONTEXT_TURNS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Architect,
    Builder,
    Optimizer,
    Tester,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 4] = [
        Self::Architect,
        Self::Builder,
        Self::Optimizer,
        Self::Tester,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Architect => "architect",
            Self::Builder => "builder",
            Self::Optimizer => "optimizer",
            Self::Tester => "tester",
        }
    }

    /// The worker role whose system prompt this stage speaks with.
    pub fn role(&self) -> WorkerRole {
        match self {
            Self::Architect => WorkerRole::Architect,
            Self::Builder => WorkerRole::Coder,
            Self::Optimizer => WorkerRole::Optimizer,
            Self::Tester => WorkerRole::Tester,
        }
    }

    /// Stage answering the `turn`-th chat message.
    pub fn for_turn(turn: usize) -> Self {
        Self::ALL[turn % Self::ALL.len()]
    }

    fn instruction(&self, project: &str) -> String {
        match self {
            Self::Architect => format!("Analyze and plan the project: {project}"),
            Self::Builder => "Implement the project based on the architecture plan".to_string(),
            Self::Optimizer => "Review and optimize the implemented code".to_string(),
            Self::Tester => "Test the optimized code and fix any issues".to_string(),
        }
    }

    fn progress(&self) -> &'static str {
        match self {
            Self::Architect => "Architect planning",
            Self::Builder => "Builder implementing",
            Self::Optimizer => "Optimizer refining",
            Self::Tester => "Tester validating",
        }
    }

    /// Heading under which this stage's output is handed to later stages.
    fn heading(&self) -> Option<&'static str> {
        match self {
            Self::Architect => Some("Architecture Plan"),
            Self::Builder => Some("Implementation"),
            Self::Optimizer => Some("Optimized Code"),
            Self::Tester => None,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Running,
    Completed,
    Error,
}

/// Output of each stage that has finished.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineResults {
    pub plan: Option<String>,
    pub code: Option<String>,
    pub optimized: Option<String>,
    pub tested: Option<String>,
}

impl PipelineResults {
    pub fn get(&self, stage: PipelineStage) -> Option<&str> {
        match stage {
            PipelineStage::Architect => self.plan.as_deref(),
            PipelineStage::Builder => self.code.as_deref(),
            PipelineStage::Optimizer => self.optimized.as_deref(),
            PipelineStage::Tester => self.tested.as_deref(),
        }
    }

    /// The tester's output, once the whole pipeline has run.
    pub fn final_output(&self) -> Option<&str> {
        self.tested.as_deref()
    }

    fn set(&mut self, stage: PipelineStage, output: String) {
        let slot = match stage {
            PipelineStage::Architect => &mut self.plan,
            PipelineStage::Builder => &mut self.code,
            PipelineStage::Optimizer => &mut self.optimized,
            PipelineStage::Tester => &mut self.tested,
        };
        *slot = Some(output);
    }

    /// "Previous work" handed to `stage`: every earlier headed output.
    fn previous_work(&self, stage: PipelineStage) -> String {
        PipelineStage::ALL
            .iter()
            .take_while(|s| **s != stage)
            .filter_map(|s| Some((s.heading()?, self.get(*s)?)))
            .map(|(heading, output)| format!("{heading}:\n{output}\n\n"))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineChatEntry {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<PipelineStage>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub project: String,
    pub status: PipelineStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub results: PipelineResults,
    pub error: Option<String>,
    pub chat: Vec<PipelineChatEntry>,
}

impl PipelineRun {
    fn new(project: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            project,
            status: PipelineStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            results: PipelineResults::default(),
            error: None,
            chat: Vec::new(),
        }
    }

    pub fn summary(&self) -> PipelineSummary {
        PipelineSummary {
            id: self.id,
            project: self.project.clone(),
            status: self.status,
            started_at: self.started_at,
            finished_at: self.finished_at,
            error: self.error.clone(),
        }
    }

    fn push_chat(&mut self, role: Role, content: String, stage: Option<PipelineStage>) {
        self.chat.push(PipelineChatEntry {
            role,
            content,
            stage,
            timestamp: Utc::now(),
        });
    }

    /// System prompt for `stage` answering a follow-up.
    fn chat_prompt(&self, stage: PipelineStage) -> String {
        let start = self.chat.len().saturating_sub(CHAT_CONTEXT_TURNS);
        let history: Vec<String> = self.chat[start..]
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect();
        format!(
            "{}\n\nYou are part of a swarm working on: {}\n\nPrevious conversation:\n{}",
            stage.role().system_prompt(),
            self.project,
            history.join("\n")
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    pub id: Uuid,
    pub project: String,
    pub status: PipelineStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// A stage's answer to a chat message.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReply {
    pub stage: PipelineStage,
    pub response: String,
}

struct Entry {
    run: PipelineRun,
    provider: Arc<dyn LlmProvider>,
}

/// All pipeline runs of one swarm.
#[derive(Clone)]
pub struct Pipelines {
    runs: Arc<RwLock<HashMap<Uuid, Entry>>>,
    registry: Arc<WorkerRegistry>,
    telemetry: Telemetry,
}

impl Pipelines {
    pub fn new(registry: Arc<WorkerRegistry>, telemetry: Telemetry) -> Self {
        Self {
            runs: Arc::new(RwLock::new(HashMap::new())),
            registry,
            telemetry,
        }
    }

    /// Register a run and drive its stages in a background task.
    pub async fn start(
        &self,
        project: impl Into<String>,
        provider: Arc<dyn LlmProvider>,
    ) -> (Uuid, JoinHandle<PipelineStatus>) {
        let run = PipelineRun::new(project.into());
        let id = run.id;
        info!(pipeline = %id, project = %run.project, "Pipeline started");
        self.runs.write().await.insert(
            id,
            Entry {
                run,
                provider: provider.clone(),
            },
        );
        self.emit(format!("Pipeline {id} started")).await;

        let this = self.clone();
        let join = tokio::spawn(async move { this.drive(id, provider).await });
        (id, join)
    }

    async fn drive(&self, id: Uuid, provider: Arc<dyn LlmProvider>) -> PipelineStatus {
        let Some(project) = self.read(id, |r| r.project.clone()).await else {
            return PipelineStatus::Error;
        };

        for stage in PipelineStage::ALL {
            let Some(previous) = self.read(id, |r| r.results.previous_work(stage)).await else {
                return PipelineStatus::Error;
            };
            self.emit(format!("Pipeline {id}: {}...", stage.progress())).await;

            match run_stage(provider.as_ref(), stage, &project, &previous).await {
                Ok(output) => {
                    info!(pipeline = %id, stage = %stage, "Pipeline stage finished");
                    self.write(id, |r| r.results.set(stage, output)).await;
                }
                Err(e) => {
                    error!(pipeline = %id, stage = %stage, error = %e, "Pipeline stage failed");
                    self.write(id, |r| {
                        r.status = PipelineStatus::Error;
                        r.error = Some(e.to_string());
                        r.finished_at = Some(Utc::now());
                    })
                    .await;
                    self.emit(format!("Pipeline {id} failed")).await;
                    return PipelineStatus::Error;
                }
            }
        }

        self.write(id, |r| {
            r.status = PipelineStatus::Completed;
            r.finished_at = Some(Utc::now());
        })
        .await;
        info!(pipeline = %id, "Pipeline completed");
        self.emit(format!("Pipeline {id} completed")).await;
        PipelineStatus::Completed
    }

    /// Every run, oldest first.
    pub async fn list(&self) -> Vec<PipelineSummary> {
        let mut runs: Vec<PipelineSummary> = self
            .runs
            .read()
            .await
            .values()
            .map(|e| e.run.summary())
            .collect();
        runs.sort_by_key(|r| r.started_at);
        runs
    }

    pub async fn get(&self, id: Uuid) -> Result<PipelineRun, PipelineError> {
        self.read(id, PipelineRun::clone).await.ok_or(PipelineError::NotFound { id })
    }

    /// Ask the run a follow-up question. Stages answer in turn, keyed on the
    /// chat length once the question is recorded.
    pub async fn chat(&self, id: Uuid, message: &str) -> Result<PipelineReply, Error> {
        let (stage, prompt, provider) = {
            let mut runs = self.runs.write().await;
            let entry = runs.get_mut(&id).ok_or(PipelineError::NotFound { id })?;
            entry.run.push_chat(Role::User, message.to_string(), None);
            let stage = PipelineStage::for_turn(entry.run.chat.len());
            (stage, entry.run.chat_prompt(stage), entry.provider.clone())
        };

        let response = provider.invoke(&prompt, &[ChatMessage::user(message)]).await?;
        info!(pipeline = %id, stage = %stage, "Pipeline chat answered");
        self.write(id, |r| r.push_chat(Role::Assistant, response.clone(), Some(stage)))
            .await;
        Ok(PipelineReply { stage, response })
    }

    pub async fn running(&self) -> usize {
        self.runs
            .read()
            .await
            .values()
            .filter(|e| e.run.status == PipelineStatus::Running)
            .count()
    }

    async fn read<T>(&self, id: Uuid, f: impl FnOnce(&PipelineRun) -> T) -> Option<T> {
        self.runs.read().await.get(&id).map(|e| f(&e.run))
    }

    async fn write(&self, id: Uuid, f: impl FnOnce(&mut PipelineRun)) {
        if let Some(entry) = self.runs.write().await.get_mut(&id) {
            f(&mut entry.run);
        }
    }

    async fn emit(&self, message: String) {
        let active_workers = self.registry.len().await;
        let active_tasks = self.registry.active_tasks().await + self.running().await;
        self.telemetry.emit(active_workers, active_tasks, Some(message));
    }
}

async fn run_stage(
    provider: &dyn LlmProvider,
    stage: PipelineStage,
    project: &str,
    previous: &str,
) -> Result<String, LlmError> {
    let mut input = stage.instruction(project);
    if !previous.is_empty() {
        input.push_str("\n\nPrevious work:\n");
        input.push_str(previous);
    }
    provider
        .invoke(stage.role().system_prompt(), &[ChatMessage::user(input)])
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_previous_work_accumulates_headed_outputs() {
        let mut results = PipelineResults::default();
        assert_eq!(results.previous_work(PipelineStage::Architect), "");

        results.set(PipelineStage::Architect, "layers".to_string());
        results.set(PipelineStage::Builder, "fn main() {}".to_string());
        assert_eq!(
            results.previous_work(PipelineStage::Optimizer),
            "Architecture Plan:\nlayers\n\nImplementation:\nfn main() {}\n\n"
        );
        // The builder only sees what came before it.
        assert_eq!(
            results.previous_work(PipelineStage::Builder),
            "Architecture Plan:\nlayers\n\n"
        );
    }

    #[test]
    fn test_chat_turns_rotate_through_stages() {
        let stages: Vec<PipelineStage> = (1..=5).map(PipelineStage::for_turn).collect();
        assert_eq!(
            stages,
            vec![
                PipelineStage::Builder,
                PipelineStage::Optimizer,
                PipelineStage::Tester,
                PipelineStage::Architect,
                PipelineStage::Builder,
            ]
        );
    }

    #[test]
    fn test_chat_prompt_keeps_last_turns() {
        let mut run = PipelineRun::new("todo app".to_string());
        for i in 0..7 {
            run.push_chat(Role::User, format!("q{i}"), None);
        }
        let prompt = run.chat_prompt(PipelineStage::Tester);
        assert!(prompt.starts_with(WorkerRole::Tester.system_prompt()));
        assert!(prompt.contains("You are part of a swarm working on: todo app"));
        assert!(!prompt.contains("user: q1\n"));
        assert!(prompt.contains("user: q2\n"));
        assert!(prompt.ends_with("user: q6"));
    }
}
