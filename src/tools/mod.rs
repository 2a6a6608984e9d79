//! Host adapters: shell, filesystem, and the shared command history.

pub mod file;
pub mod history;
pub mod shell;

pub use file::{FileEntry, FileStore, ProjectFiles, validate_path};
pub use history::{CommandHistory, CommandOrigin, HistoryEntry};
pub use shell::{CommandResult, CommandRunner, ShellTool};
