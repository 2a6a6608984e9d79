//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Default number of iterations a task may run before it is reported exhausted.
pub const DEFAULT_MAX_ITERATIONS: u32 = 15;

/// Core swarm configuration.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Directory every worker file operation and command is confined to.
    pub project_root: PathBuf,
    /// Wall-clock limit for a single shell command.
    pub command_timeout: Duration,
    /// Capacity of the shared command-history ring buffer.
    pub history_capacity: usize,
    /// Iteration bound used when a task request does not set one.
    pub default_max_iterations: u32,
    /// Buffer size of the metrics broadcast channel.
    pub metrics_capacity: usize,
    /// Limits applied when rendering context memory into a prompt.
    pub context_limits: ContextLimits,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("./workspace"),
            command_timeout: Duration::from_secs(30),
            history_capacity: 1000,
            default_max_iterations: DEFAULT_MAX_ITERATIONS,
            metrics_capacity: 256,
            context_limits: ContextLimits::default(),
        }
    }
}

impl SwarmConfig {
    /// Load from `SWARM_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let project_root = std::env::var("SWARM_PROJECT_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.project_root);

        let command_timeout = env_parse("SWARM_COMMAND_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.command_timeout);

        let history_capacity =
            env_parse("SWARM_HISTORY_CAPACITY")?.unwrap_or(defaults.history_capacity);

        let default_max_iterations =
            env_parse("SWARM_MAX_ITERATIONS")?.unwrap_or(defaults.default_max_iterations);
        if default_max_iterations == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SWARM_MAX_ITERATIONS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let metrics_capacity =
            env_parse("SWARM_METRICS_CAPACITY")?.unwrap_or(defaults.metrics_capacity);

        Ok(Self {
            project_root,
            command_timeout,
            history_capacity,
            default_max_iterations,
            metrics_capacity: metrics_capacity.max(1),
            context_limits: defaults.context_limits,
        })
    }

    pub fn with_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.project_root = root.into();
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

/// How much of a worker's context memory is rendered into each prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLimits {
    /// Most recent operations shown as "files created" and "terminal output".
    pub recent_operations: usize,
    /// Most recent classified errors shown with guidance.
    pub recent_errors: usize,
    /// Most recent learnings shown.
    pub learnings: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            recent_operations: 10,
            recent_errors: 5,
            learnings: 3,
        }
    }
}

/// Parse an optional environment variable, rejecting malformed values.
pub(crate) fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SwarmConfig::default();
        assert_eq!(config.command_timeout, Duration::from_secs(30));
        assert_eq!(config.history_capacity, 1000);
        assert_eq!(config.default_max_iterations, 15);
        assert_eq!(config.context_limits.recent_operations, 10);
        assert_eq!(config.context_limits.recent_errors, 5);
        assert_eq!(config.context_limits.learnings, 3);
    }

    #[test]
    fn env_parse_missing_is_none() {
        let parsed: Option<u64> = env_parse("SWARM_TEST_SURELY_UNSET_VARIABLE").unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn builder_overrides() {
        let config = SwarmConfig::default()
            .with_project_root("/tmp/project")
            .with_command_timeout(Duration::from_secs(5));
        assert_eq!(config.project_root, PathBuf::from("/tmp/project"));
        assert_eq!(config.command_timeout, Duration::from_secs(5));
    }
}
