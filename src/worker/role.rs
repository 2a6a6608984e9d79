//! Worker roles, their fixed system prompts, and peer selection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    #[default]
    Coder,
    Architect,
    Reviewer,
    Tester,
    Optimizer,
    Researcher,
    Debugger,
    Autonomous,
}

/// Rotation used when a message is relayed to "whoever is next".
pub const RELAY_ROTATION: [WorkerRole; 4] = [
    WorkerRole::Architect,
    WorkerRole::Coder,
    WorkerRole::Optimizer,
    WorkerRole::Tester,
];

impl WorkerRole {
    pub const ALL: [WorkerRole; 8] = [
        Self::Coder,
        Self::Architect,
        Self::Reviewer,
        Self::Tester,
        Self::Optimizer,
        Self::Researcher,
        Self::Debugger,
        Self::Autonomous,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coder => "coder",
            Self::Architect => "architect",
            Self::Reviewer => "reviewer",
            Self::Tester => "tester",
            Self::Optimizer => "optimizer",
            Self::Researcher => "researcher",
            Self::Debugger => "debugger",
            Self::Autonomous => "autonomous",
        }
    }

    pub fn system_prompt(&self) -> &'static str {
        match self {
            Self::Coder => {
                "You are a coding specialist. Write clean, efficient code. Focus on implementation details, syntax, and best practices. You can read, write, create, and modify files to build working code."
            }
            Self::Architect => {
                "You are a software architect. Design system architecture, plan structure, and break down complex problems into components. Create file structures and organize code logically."
            }
            Self::Reviewer => {
                "You are a code reviewer. Analyze code quality, find bugs, suggest improvements, and ensure best practices. Read files, identify issues, and propose fixes."
            }
            Self::Tester => {
                "You are a testing specialist. Write comprehensive tests, identify edge cases, and ensure code reliability. Create test files and verify code works correctly."
            }
            Self::Optimizer => {
                "You are a performance optimizer. Analyze code for bottlenecks, optimize algorithms, and improve efficiency. Read code, identify issues, and rewrite for better performance."
            }
            Self::Researcher => {
                "You are a research specialist. Investigate solutions, compare approaches, and provide technical insights. Research best practices and document findings."
            }
            Self::Debugger => {
                "You are a debugging specialist. Find and fix bugs in code. Read error messages, analyze code, identify root causes, and implement fixes. Test your fixes to ensure they work. Work autonomously until everything is fixed."
            }
            Self::Autonomous => {
                "You are a fully autonomous coding agent. You work independently to complete tasks from start to finish. Create files, install dependencies, run servers, test applications, and fix any issues until everything works perfectly. You have full access to the file system and terminal."
            }
        }
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == normalized)
            .ok_or_else(|| format!("unknown worker role '{s}'"))
    }
}

/// Role whose turn it is to answer the `turn`-th relayed message.
pub fn relay_role(turn: usize) -> WorkerRole {
    RELAY_ROTATION[turn % RELAY_ROTATION.len()]
}

/// Pick the worker that answers the `turn`-th relayed message.
///
/// Starting at the rotation slot for `turn`, the first slot whose role some
/// candidate holds wins; ties go to the earliest candidate. If no candidate
/// holds a rotation role, candidates are used round-robin. Returns an index
/// into `candidates`.
pub fn select_responder(candidates: &[WorkerRole], turn: usize) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }

    for offset in 0..RELAY_ROTATION.len() {
        let wanted = relay_role(turn + offset);
        if let Some(index) = candidates.iter().position(|r| *r == wanted) {
            return Some(index);
        }
    }

    Some(turn % candidates.len())
}
