//! Permission requests: the shared table of commands awaiting a decision.
//!
//! A request is created pending, resolved exactly once, and a granted request
//! is handed out exactly once for execution. Only `grant` and `deny` change
//! a request's status.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::PermissionError;
use crate::safety::PermissionCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Pending,
    Granted,
    Denied,
}

impl std::fmt::Display for PermissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Granted => "granted",
            Self::Denied => "denied",
        };
        write!(f, "{}", s)
    }
}

/// A sensitive command held back until someone decides on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: Uuid,
    pub worker_id: Uuid,
    pub command: String,
    pub category: PermissionCategory,
    pub description: String,
    pub status: PermissionStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// How many resolved ids are remembered for `AlreadyResolved` answers.
pub const RESOLVED_CAPACITY: usize = 1000;

#[derive(Debug, Default)]
struct TableState {
    /// Insertion-ordered, so the oldest request comes first.
    pending: Vec<PermissionRequest>,
    /// Final status of the most recently resolved requests, oldest first.
    /// Once an id is evicted a repeat decision gets `NotFound` instead; it
    /// still never runs twice.
    resolved: VecDeque<(Uuid, PermissionStatus)>,
}

/// Shared permission table. Every mutation happens under one write lock.
#[derive(Debug)]
pub struct PermissionTable {
    state: RwLock<TableState>,
    resolved_capacity: usize,
}

impl Default for PermissionTable {
    fn default() -> Self {
        Self::with_resolved_capacity(RESOLVED_CAPACITY)
    }
}

impl PermissionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resolved_capacity(capacity: usize) -> Self {
        Self {
            state: RwLock::new(TableState::default()),
            resolved_capacity: capacity.max(1),
        }
    }

    /// Record a new pending request.
    pub async fn request(
        &self,
        worker_id: Uuid,
        command: &str,
        category: PermissionCategory,
        description: &str,
    ) -> PermissionRequest {
        let request = PermissionRequest {
            id: Uuid::new_v4(),
            worker_id,
            command: command.to_string(),
            category,
            description: description.to_string(),
            status: PermissionStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
        };

        self.state.write().await.pending.push(request.clone());

        tracing::info!(
            permission = %request.id,
            worker = %worker_id,
            category = %category,
            command = %command,
            "Permission requested"
        );
        request
    }

    /// Pending requests, oldest first.
    pub async fn list_pending(&self) -> Vec<PermissionRequest> {
        self.state.read().await.pending.clone()
    }

    pub async fn get(&self, id: Uuid) -> Option<PermissionRequest> {
        self.state
            .read()
            .await
            .pending
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Mark a pending request granted and take it out of the table.
    ///
    /// The caller owns the single execution the grant allows; a second grant
    /// of the same id is rejected.
    pub async fn grant(&self, id: Uuid) -> Result<PermissionRequest, PermissionError> {
        self.resolve(id, PermissionStatus::Granted).await
    }

    /// Mark a pending request denied and discard it.
    pub async fn deny(&self, id: Uuid) -> Result<PermissionRequest, PermissionError> {
        self.resolve(id, PermissionStatus::Denied).await
    }

    async fn resolve(
        &self,
        id: Uuid,
        status: PermissionStatus,
    ) -> Result<PermissionRequest, PermissionError> {
        let mut state = self.state.write().await;

        if let Some((_, previous)) = state.resolved.iter().find(|(seen, _)| *seen == id) {
            return Err(PermissionError::AlreadyResolved {
                id,
                status: previous.to_string(),
            });
        }

        let index = state
            .pending
            .iter()
            .position(|r| r.id == id)
            .ok_or(PermissionError::NotFound { id })?;
        let mut request = state.pending.remove(index);
        request.status = status;
        request.resolved_at = Some(Utc::now());
        if state.resolved.len() >= self.resolved_capacity {
            state.resolved.pop_front();
        }
        state.resolved.push_back((id, status));

        tracing::info!(permission = %id, status = %status, command = %request.command, "Permission resolved");
        Ok(request)
    }
}
