//! Shell command execution.
//!
//! Runs one command under the host shell with:
//! - Working directory pinned to the project root
//! - Timeout enforcement (the child is killed when the deadline passes)
//! - Separate stdout/stderr capture, bounded in size

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::ShellError;

/// Maximum captured size per stream before truncation (64KB).
pub const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Default command timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Exit code reported for commands that never produced one (timeout, kill, spawn failure).
pub const SYNTHETIC_EXIT_CODE: i32 = -1;

/// Outcome of one shell command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub output: String,
    pub exit_code: i32,
    #[serde(default)]
    pub timed_out: bool,
}

impl CommandResult {
    /// A completed command.
    pub fn exited(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            success: exit_code == 0,
            output: output.into(),
            exit_code,
            timed_out: false,
        }
    }

    /// A command that was killed at the deadline.
    pub fn timeout(limit: Duration) -> Self {
        Self {
            success: false,
            output: format!("Command timed out after {}s and was killed", limit.as_secs_f32()),
            exit_code: SYNTHETIC_EXIT_CODE,
            timed_out: true,
        }
    }

    /// A command that never ran (spawn failure, pre-flight rejection).
    pub fn not_run(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            exit_code: SYNTHETIC_EXIT_CODE,
            timed_out: false,
        }
    }
}

/// Something that can run a shell command.
///
/// The iteration loop only sees this trait, so tests swap in scripted runners.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command`, returning its outcome. A timeout is an `Ok` result with
    /// `timed_out` set; only failing to start the process is an `Err`.
    async fn run(&self, command: &str) -> Result<CommandResult, ShellError>;
}

/// Shell command execution under `sh -c` (or `cmd /C` on Windows).
#[derive(Debug, Clone)]
pub struct ShellTool {
    /// Working directory for commands (if None, uses cwd).
    working_dir: Option<PathBuf>,
    /// Command timeout.
    timeout: Duration,
}

impl ShellTool {
    /// Create a new shell tool with default settings.
    pub fn new() -> Self {
        Self {
            working_dir: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    /// Set the command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn build_command(&self, cmd: &str) -> Command {
        let mut command = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", cmd]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", cmd]);
            c
        };

        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

impl Default for ShellTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for ShellTool {
    async fn run(&self, cmd: &str) -> Result<CommandResult, ShellError> {
        let child = self.build_command(cmd).spawn().map_err(ShellError::Spawn)?;

        // Dropping the wait future on timeout drops the child, which kills it.
        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let code = output.status.code().unwrap_or(SYNTHETIC_EXIT_CODE);
                Ok(CommandResult::exited(code, combine_output(&stdout, &stderr)))
            }
            Ok(Err(e)) => Err(ShellError::Io(e)),
            Err(_) => {
                tracing::warn!(command = %cmd, timeout_secs = self.timeout.as_secs(), "Command timed out");
                Ok(CommandResult::timeout(self.timeout))
            }
        }
    }
}

/// Merge the two streams into the single output later stages read.
///
/// stderr leads because it usually carries the diagnostic.
pub fn combine_output(stdout: &str, stderr: &str) -> String {
    let stdout = truncate_output(stdout.trim_end());
    let stderr = truncate_output(stderr.trim_end());
    if stderr.is_empty() {
        stdout
    } else if stdout.is_empty() {
        stderr
    } else {
        format!("{}\n\n--- stdout ---\n{}", stderr, stdout)
    }
}

/// Truncate output to fit within limits (UTF-8 safe).
pub fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        s.to_string()
    } else {
        let half = MAX_OUTPUT_SIZE / 2;
        let head_end = floor_char_boundary(s, half);
        let tail_start = ceil_char_boundary(s, s.len() - half);
        format!(
            "{}\n\n... [truncated {} bytes] ...\n\n{}",
            &s[..head_end],
            tail_start - head_end,
            &s[tail_start..]
        )
    }
}

/// Find the largest byte index <= `i` that is a valid char boundary.
pub(crate) fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

fn ceil_char_boundary(s: &str, i: usize) -> usize {
    let mut pos = i.min(s.len());
    while pos < s.len() && !s.is_char_boundary(pos) {
        pos += 1;
    }
    pos
}
