//! Background execution of tasks and peer messages.
//!
//! The scheduler spawns swarm work onto the runtime and tracks it so that
//! callers can count what is still running or cancel it.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

use crate::error::Error;
use crate::swarm::Swarm;
use crate::worker::{MessageOutcome, TaskOutcome, TaskRequest};

/// What a tracked job is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Task { worker_id: Uuid },
    Message { from: Uuid, to: Uuid },
}

#[derive(Debug)]
struct TrackedJob {
    kind: JobKind,
    abort: AbortHandle,
}

pub struct Scheduler {
    swarm: Arc<Swarm>,
    jobs: Arc<RwLock<HashMap<Uuid, TrackedJob>>>,
}

impl Scheduler {
    pub fn new(swarm: Arc<Swarm>) -> Self {
        Self {
            swarm,
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn swarm(&self) -> &Arc<Swarm> {
        &self.swarm
    }

    /// Run a task in the background.
    pub async fn assign_task(
        &self,
        worker_id: Uuid,
        request: TaskRequest,
    ) -> JoinHandle<Result<TaskOutcome, Error>> {
        let swarm = self.swarm.clone();
        self.track(JobKind::Task { worker_id }, async move {
            let result = swarm.assign_task(worker_id, request).await;
            if let Err(e) = &result {
                tracing::warn!(worker = %worker_id, error = %e, "Background task failed");
            }
            result
        })
        .await
    }

    /// Deliver a peer message in the background. The sender does not wait.
    pub async fn post_message(
        &self,
        from: Uuid,
        to: Uuid,
        message: impl Into<String>,
        data: Map<String, Value>,
    ) -> JoinHandle<Result<MessageOutcome, Error>> {
        let swarm = self.swarm.clone();
        let message = message.into();
        self.track(JobKind::Message { from, to }, async move {
            let result = swarm.send_message(from, to, &message, data).await;
            if let Err(e) = &result {
                tracing::warn!(from = %from, to = %to, error = %e, "Peer message failed");
            }
            result
        })
        .await
    }

    async fn track<F, T>(&self, kind: JobKind, fut: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let job_id = Uuid::new_v4();
        let jobs = self.jobs.clone();
        let handle = tokio::spawn(async move {
            let out = fut.await;
            jobs.write().await.remove(&job_id);
            out
        });

        self.jobs.write().await.insert(
            job_id,
            TrackedJob {
                kind,
                abort: handle.abort_handle(),
            },
        );
        handle
    }

    /// Jobs that have not finished yet.
    pub async fn running(&self) -> Vec<JobKind> {
        let mut jobs = self.jobs.write().await;
        jobs.retain(|_, job| !job.abort.is_finished());
        jobs.values().map(|job| job.kind).collect()
    }

    /// Abort every tracked job.
    pub async fn cancel_all(&self) {
        let mut jobs = self.jobs.write().await;
        for (_, job) in jobs.drain() {
            job.abort.abort();
        }
    }
}
