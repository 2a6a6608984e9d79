//! Permission gate for sensitive shell commands.
//!
//! Commands are matched against a fixed, ordered rule table before they reach
//! the shell. Compound commands are split on `&&`, `||`, `;` and `|`, and
//! every segment is checked. The first matching rule decides; a command that
//! matches nothing runs without approval.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// What kind of sensitive action a command performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionCategory {
    NpmInstall,
    NpmStart,
    RunServer,
    PipInstall,
    GitClone,
    GitPush,
    DeleteFiles,
}

impl PermissionCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NpmInstall => "npm_install",
            Self::NpmStart => "npm_start",
            Self::RunServer => "run_server",
            Self::PipInstall => "pip_install",
            Self::GitClone => "git_clone",
            Self::GitPush => "git_push",
            Self::DeleteFiles => "delete_files",
        }
    }
}

impl fmt::Display for PermissionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single gate rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct PermissionRule {
    /// Compiled, case-insensitive regex matched against the trimmed command.
    pub regex: Regex,
    pub category: PermissionCategory,
    /// Human-readable description shown to the approver.
    pub description: &'static str,
}

/// Result of classifying a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub requires_approval: bool,
    pub category: Option<PermissionCategory>,
    pub description: Option<String>,
}

impl Classification {
    fn auto_approved() -> Self {
        Self {
            requires_approval: false,
            category: None,
            description: None,
        }
    }
}

fn rule(pattern: &str, category: PermissionCategory, description: &'static str) -> PermissionRule {
    PermissionRule {
        regex: Regex::new(&format!("(?i){pattern}")).unwrap(),
        category,
        description,
    }
}

/// Shell operators that start a new command.
static SEGMENT_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&&|\|\||[;|\n]").unwrap());

static DEFAULT_RULES: LazyLock<Vec<PermissionRule>> = LazyLock::new(|| {
    use PermissionCategory::*;
    vec![
        rule(r"^npm\s+install\b", NpmInstall, "Install npm packages"),
        rule(r"^npm\s+i\b", NpmInstall, "Install npm packages"),
        rule(r"^npm\s+ci\b", NpmInstall, "Install npm packages (ci)"),
        rule(r"^npm\s+start\b", NpmStart, "Start npm server"),
        rule(r"^npm\s+run\s+start\b", NpmStart, "Start npm server"),
        rule(r"^node\s+.*server", RunServer, "Run Node.js server"),
        rule(r"^node\s+.*app\.js", RunServer, "Run Node.js application"),
        rule(r"^python3?\s+-m\s+http\.server", RunServer, "Start Python HTTP server"),
        rule(r"^python3?\s+.*server", RunServer, "Run Python server"),
        rule(r"^pip3?\s+install\b", PipInstall, "Install Python packages"),
        rule(r"^git\s+clone\b", GitClone, "Clone git repository"),
        rule(r"^git\s+push\b", GitPush, "Push to git repository"),
        rule(
            r"^rm\s+(?:-\S*\s+)*(?:-[a-z]*r[a-z]*\b|--recursive\b)",
            DeleteFiles,
            "Delete files recursively",
        ),
        rule(r"^del\s+/s\b", DeleteFiles, "Delete files recursively (Windows)"),
    ]
});

/// Ordered rule table deciding which commands need approval.
#[derive(Debug, Clone)]
pub struct PermissionGate {
    rules: Vec<PermissionRule>,
}

impl PermissionGate {
    /// Create a gate with the default rules.
    pub fn default_rules() -> Self {
        Self {
            rules: DEFAULT_RULES.clone(),
        }
    }

    /// Create a gate with a custom rule table (first match wins).
    pub fn with_rules(rules: Vec<PermissionRule>) -> Self {
        Self { rules }
    }

    /// Gate that lets everything through.
    pub fn permissive() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn classify(&self, command: &str) -> Classification {
        for segment in SEGMENT_SEPARATOR.split(command) {
            let trimmed = segment.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Some(rule) = self.rules.iter().find(|r| r.regex.is_match(trimmed)) {
                debug!(command = %command.trim(), category = %rule.category, "Command requires approval");
                return Classification {
                    requires_approval: true,
                    category: Some(rule.category),
                    description: Some(rule.description.to_string()),
                };
            }
        }
        Classification::auto_approved()
    }
}

impl Default for PermissionGate {
    fn default() -> Self {
        Self::default_rules()
    }
}
