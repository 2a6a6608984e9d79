//! Cross-worker command history.
//!
//! Every command that reaches the shell, whether a worker issued it or a
//! user ran it directly, is appended here. The reasoning loop never reads it.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::tools::shell::CommandResult;

/// Default ring-buffer capacity.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Who asked for a command to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandOrigin {
    Worker { id: Uuid, name: String },
    /// A deferred execution after a permission grant.
    Approved { worker_id: Uuid, permission_id: Uuid },
    Direct,
}

/// One executed command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub command: String,
    pub origin: CommandOrigin,
    pub result: CommandResult,
    pub executed_at: DateTime<Utc>,
}

/// Bounded ring buffer of executed commands, oldest evicted first.
#[derive(Debug)]
pub struct CommandHistory {
    capacity: usize,
    entries: Mutex<VecDeque<HistoryEntry>>,
}

impl CommandHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn record(
        &self,
        command: &str,
        origin: CommandOrigin,
        result: &CommandResult,
    ) -> HistoryEntry {
        let entry = HistoryEntry {
            id: Uuid::new_v4(),
            command: command.to_string(),
            origin,
            result: result.clone(),
            executed_at: Utc::now(),
        };

        let mut entries = self.entries.lock().await;
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry.clone());
        entry
    }

    /// Most recent `limit` entries, oldest first.
    pub async fn recent(&self, limit: usize) -> Vec<HistoryEntry> {
        let entries = self.entries.lock().await;
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    /// Entries executed strictly after `since`, oldest first.
    pub async fn since(&self, since: DateTime<Utc>) -> Vec<HistoryEntry> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .filter(|e| e.executed_at > since)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

impl Default for CommandHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
