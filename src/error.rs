//! Error types for the worker swarm.

use std::path::PathBuf;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Permission error: {0}")]
    Permission(#[from] PermissionError),

    #[error("File error: {0}")]
    File(#[from] FileError),

    #[error("Shell error: {0}")]
    Shell(#[from] ShellError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Worker registry and task control-flow errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker {id} not found")]
    NotFound { id: Uuid },

    #[error("Invalid task request: {reason}")]
    InvalidTask { reason: String },

    #[error("Worker {id} cannot transition from {from} to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Worker {id} was removed while its task was running")]
    Removed { id: Uuid },

    #[error("No peer available to answer worker {id}")]
    NoPeer { id: Uuid },
}

/// Permission request errors.
#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("Permission request {id} not found")]
    NotFound { id: Uuid },

    #[error("Permission request {id} already {status}")]
    AlreadyResolved { id: Uuid, status: String },
}

/// Filesystem adapter errors.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("Access denied: path escapes project root: {0}")]
    OutsideRoot(String),

    #[error("Refusing to modify the project root itself: {0}")]
    ProjectRoot(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Path is a directory, not a file: {0}")]
    IsDirectory(String),

    #[error("Content too large ({size} bytes). Maximum is {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Shell adapter errors.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("Failed to spawn command: {0}")]
    Spawn(std::io::Error),

    #[error("Command execution failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Staged pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Pipeline {id} not found")]
    NotFound { id: Uuid },
}

/// Result type alias for the swarm.
pub type Result<T> = std::result::Result<T, Error>;
