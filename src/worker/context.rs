//! Worker registry: the in-memory table of workers and their per-worker state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use uuid::Uuid;

use crate::error::WorkerError;
use crate::llm::LlmProvider;
use crate::worker::activity::{ActivityEntry, ActivityLog, WorkerActivity};
use crate::worker::memory::ContextMemory;
use crate::worker::role::WorkerRole;
use crate::worker::state::{WorkerState, WorkerStatus};
use crate::worker::TaskCompletion;

/// What a new worker is bound to.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub name: String,
    pub model: String,
    pub endpoint: String,
    pub role: WorkerRole,
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>, model: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            endpoint: endpoint.into(),
            role: WorkerRole::default(),
        }
    }

    pub fn with_role(mut self, role: WorkerRole) -> Self {
        self.role = role;
        self
    }
}

/// Partial update; `None` fields are left alone.
#[derive(Default)]
pub struct WorkerUpdate {
    pub name: Option<String>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub role: Option<WorkerRole>,
    pub provider: Option<Arc<dyn LlmProvider>>,
}

/// A finished task as kept in the worker's history.
#[derive(Debug, Clone, Serialize)]
pub struct TaskHistoryEntry {
    pub task: String,
    pub completion: TaskCompletion,
    pub iterations: u32,
    pub operations: usize,
    pub finished_at: DateTime<Utc>,
}

/// Mutable per-worker data, guarded by the handle's lock.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerRecord {
    pub id: Uuid,
    pub name: String,
    pub model: String,
    pub endpoint: String,
    pub role: WorkerRole,
    pub state: WorkerState,
    pub tasks: Vec<TaskHistoryEntry>,
    /// Data merged in by peer messages.
    pub shared_data: Map<String, Value>,
    pub memory: ContextMemory,
    #[serde(skip)]
    pub activity: ActivityLog,
    pub created_at: DateTime<Utc>,
}

impl WorkerRecord {
    fn new(id: Uuid, spec: WorkerSpec) -> Self {
        Self {
            id,
            name: spec.name,
            model: spec.model,
            endpoint: spec.endpoint,
            role: spec.role,
            state: WorkerState::new(),
            tasks: Vec::new(),
            shared_data: Map::new(),
            memory: ContextMemory::new(),
            activity: ActivityLog::new(),
            created_at: Utc::now(),
        }
    }

    pub fn summary(&self) -> WorkerSummary {
        WorkerSummary {
            id: self.id,
            name: self.name.clone(),
            model: self.model.clone(),
            endpoint: self.endpoint.clone(),
            role: self.role,
            status: self.state.status,
            task_count: self.tasks.len(),
            created_at: self.created_at,
        }
    }

    /// Status change that maps a rejected transition onto a typed error.
    pub fn set_status(&mut self, status: WorkerStatus, reason: Option<String>) -> Result<(), WorkerError> {
        let from = self.state.status;
        self.state
            .transition_to(status, reason)
            .map_err(|_| WorkerError::InvalidTransition {
                id: self.id,
                from: from.to_string(),
                to: status.to_string(),
            })
    }
}

/// List view of a worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSummary {
    pub id: Uuid,
    pub name: String,
    pub model: String,
    pub endpoint: String,
    pub role: WorkerRole,
    pub status: WorkerStatus,
    pub task_count: usize,
    pub created_at: DateTime<Utc>,
}

/// Shared handle to one worker.
///
/// `task_lock` is held for the whole of a task or inbound peer message, so
/// at most one of either runs per worker. `record` is only held for short
/// synchronous updates and never across an await.
pub struct WorkerHandle {
    id: Uuid,
    record: RwLock<WorkerRecord>,
    llm: RwLock<Arc<dyn LlmProvider>>,
    task_lock: Mutex<()>,
    removed: AtomicBool,
}

impl WorkerHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn snapshot(&self) -> WorkerRecord {
        self.record.read().await.clone()
    }

    pub async fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&WorkerRecord) -> R,
    {
        f(&*self.record.read().await)
    }

    pub async fn update<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut WorkerRecord) -> R,
    {
        f(&mut *self.record.write().await)
    }

    pub async fn log(&self, activity: WorkerActivity) {
        tracing::debug!(worker = %self.id, "{}", activity.summary());
        self.record.write().await.activity.push(activity);
    }

    pub async fn llm(&self) -> Arc<dyn LlmProvider> {
        self.llm.read().await.clone()
    }

    pub async fn lock_task(&self) -> MutexGuard<'_, ()> {
        self.task_lock.lock().await
    }

    /// The task lock, if no task or inbound message holds it right now.
    pub fn try_lock_task(&self) -> Option<MutexGuard<'_, ()>> {
        self.task_lock.try_lock().ok()
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn ensure_present(&self) -> Result<(), WorkerError> {
        if self.is_removed() {
            Err(WorkerError::Removed { id: self.id })
        } else {
            Ok(())
        }
    }
}

/// All live workers, keyed by id.
pub struct WorkerRegistry {
    workers: RwLock<HashMap<Uuid, Arc<WorkerHandle>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn spawn(&self, spec: WorkerSpec, llm: Arc<dyn LlmProvider>) -> WorkerSummary {
        let id = Uuid::new_v4();
        let record = WorkerRecord::new(id, spec);
        let summary = record.summary();
        let handle = Arc::new(WorkerHandle {
            id,
            record: RwLock::new(record),
            llm: RwLock::new(llm),
            task_lock: Mutex::new(()),
            removed: AtomicBool::new(false),
        });
        self.workers.write().await.insert(id, handle);
        summary
    }

    pub async fn handle(&self, id: Uuid) -> Result<Arc<WorkerHandle>, WorkerError> {
        self.workers
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(WorkerError::NotFound { id })
    }

    /// Handles in creation order.
    pub async fn handles(&self) -> Vec<Arc<WorkerHandle>> {
        let handles: Vec<_> = self.workers.read().await.values().cloned().collect();
        let created = join_all(handles.iter().map(|h| h.read(|r| r.created_at))).await;
        let mut keyed: Vec<_> = created.into_iter().zip(handles).collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        keyed.into_iter().map(|(_, h)| h).collect()
    }

    pub async fn list(&self) -> Vec<WorkerSummary> {
        let handles = self.handles().await;
        join_all(handles.iter().map(|h| h.read(WorkerRecord::summary))).await
    }

    pub async fn get(&self, id: Uuid) -> Result<WorkerRecord, WorkerError> {
        Ok(self.handle(id).await?.snapshot().await)
    }

    pub async fn update(&self, id: Uuid, update: WorkerUpdate) -> Result<WorkerSummary, WorkerError> {
        let handle = self.handle(id).await?;
        if let Some(provider) = update.provider {
            *handle.llm.write().await = provider;
        }
        Ok(handle
            .update(|r| {
                if let Some(name) = update.name {
                    r.name = name;
                }
                if let Some(model) = update.model {
                    r.model = model;
                }
                if let Some(endpoint) = update.endpoint {
                    r.endpoint = endpoint;
                }
                if let Some(role) = update.role {
                    r.role = role;
                }
                r.summary()
            })
            .await)
    }

    /// Remove a worker. A task still running on it stops at its next check.
    pub async fn remove(&self, id: Uuid) -> Result<WorkerSummary, WorkerError> {
        let handle = self
            .workers
            .write()
            .await
            .remove(&id)
            .ok_or(WorkerError::NotFound { id })?;
        handle.removed.store(true, Ordering::SeqCst);
        Ok(handle.read(WorkerRecord::summary).await)
    }

    pub async fn activity(&self, id: Uuid, limit: usize) -> Result<Vec<ActivityEntry>, WorkerError> {
        let handle = self.handle(id).await?;
        Ok(handle.read(|r| r.activity.recent(limit)).await)
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }

    /// Workers currently working or communicating.
    pub async fn active_tasks(&self) -> usize {
        let handles: Vec<_> = self.workers.read().await.values().cloned().collect();
        join_all(handles.iter().map(|h| h.read(|r| r.state.status.is_busy())))
            .await
            .into_iter()
            .filter(|busy| *busy)
            .count()
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
