//! Worker status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cap on recorded transitions per worker.
const MAX_TRANSITIONS: usize = 200;

/// Status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Ready for a task or a peer message.
    Idle,
    /// Running a task's iteration loop.
    Working,
    /// Reflecting between iterations or answering a peer.
    Communicating,
    /// The last task aborted on a fatal error.
    Error,
}

impl WorkerStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: WorkerStatus) -> bool {
        use WorkerStatus::*;

        matches!(
            (self, target),
            // From Idle
            (Idle, Working) | (Idle, Communicating) | (Idle, Error) |
            // From Working
            (Working, Communicating) | (Working, Idle) | (Working, Error) |
            // From Communicating
            (Communicating, Working) | (Communicating, Idle) | (Communicating, Error) |
            // From Error (a new task or message may recover)
            (Error, Working) | (Error, Communicating)
        )
    }

    /// Whether the worker is in the middle of something.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Working | Self::Communicating)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Communicating => "communicating",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// A status transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: WorkerStatus,
    pub to: WorkerStatus,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Current status plus a bounded transition history.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerState {
    pub status: WorkerStatus,
    pub transitions: Vec<StatusTransition>,
    pub last_active: DateTime<Utc>,
}

impl WorkerState {
    pub fn new() -> Self {
        Self {
            status: WorkerStatus::Idle,
            transitions: Vec::new(),
            last_active: Utc::now(),
        }
    }

    /// Transition to a new status. Moving to the current status is a no-op.
    pub fn transition_to(
        &mut self,
        new_status: WorkerStatus,
        reason: Option<String>,
    ) -> Result<(), String> {
        if self.status == new_status {
            return Ok(());
        }
        if !self.status.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status, new_status
            ));
        }

        self.transitions.push(StatusTransition {
            from: self.status,
            to: new_status,
            timestamp: Utc::now(),
            reason,
        });

        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.status = new_status;
        self.last_active = Utc::now();
        Ok(())
    }
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::new()
    }
}
