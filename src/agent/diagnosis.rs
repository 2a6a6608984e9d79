//! Heuristic classification of failed command output.
//!
//! The result is advisory text for the next prompt. It never changes what the
//! iteration loop does.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Most suggested fixes kept per analysis.
const MAX_FIXES: usize = 4;

/// A quoted path that looks like a source file rather than a package name.
static SOURCE_FILE_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)['"]([^'"]+\.(?:js|ts|json|mjs|cjs))['"]"#).unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    FileNotFound,
    CommandNotFound,
    SyntaxError,
    ModuleNotFound,
    PortInUse,
    PermissionDenied,
    ConnectionRefused,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileNotFound => "file_not_found",
            Self::CommandNotFound => "command_not_found",
            Self::SyntaxError => "syntax_error",
            Self::ModuleNotFound => "module_not_found",
            Self::PortInUse => "port_in_use",
            Self::PermissionDenied => "permission_denied",
            Self::ConnectionRefused => "connection_refused",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
}

/// Category plus human-readable guidance for one failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorAnalysis {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub guidance: Vec<String>,
    pub suggested_fixes: Vec<String>,
}

impl ErrorAnalysis {
    fn new(category: ErrorCategory, severity: Severity, guidance: &[&str], fixes: &[&str]) -> Self {
        Self {
            category,
            severity,
            guidance: guidance.iter().map(|s| s.to_string()).collect(),
            suggested_fixes: fixes.iter().take(MAX_FIXES).map(|s| s.to_string()).collect(),
        }
    }

    /// One-line takeaway: the category and its first fix.
    pub fn learning(&self) -> Option<String> {
        self.suggested_fixes
            .first()
            .map(|fix| format!("{}: {}", self.category, fix))
    }
}

/// Classify a failed command from its text and output. Pure; first match wins.
pub fn classify(command: &str, output: &str) -> ErrorAnalysis {
    let text = output.to_lowercase();
    let has = |needle: &str| text.contains(needle);

    if has("command not found") || has("is not recognized") {
        let program = command.split_whitespace().next().unwrap_or(command);
        let mut analysis = ErrorAnalysis::new(
            ErrorCategory::CommandNotFound,
            Severity::High,
            &[
                "The command you tried to run does not exist or is not in PATH.",
                "This often means the tool needs to be installed first.",
                "On Windows, some commands have different names (dir vs ls).",
            ],
            &[
                "Install the required tool: npm install, pip install, etc.",
                "Check if the command name is correct for your OS",
                "Use the full path to the executable if needed",
                "Verify the tool is installed: which <command> or where <command>",
            ],
        );
        analysis.guidance.insert(0, format!("The shell could not find `{program}`."));
        return analysis;
    }

    if has("cannot find module") || has("module not found") || has("cannot resolve") {
        if let Some(path) = SOURCE_FILE_PATH.captures(output).and_then(|c| c.get(1)) {
            let path = path.as_str();
            return ErrorAnalysis {
                category: ErrorCategory::FileNotFound,
                severity: Severity::High,
                guidance: vec![
                    format!("The system is trying to load a file that does not exist: {path}"),
                    "This is a \"Cannot find module\" error, but it usually means the file path is wrong or the file doesn't exist.".to_string(),
                    "Check if the file was created before trying to run it.".to_string(),
                ],
                suggested_fixes: vec![
                    format!("Create {path} before running the command"),
                    format!("Verify the file path: {path} (check for typos or wrong directory)"),
                    "Use listFiles() to see what files are in the directory".to_string(),
                    "Verify the file extension matches (.js, .ts, .json, etc.)".to_string(),
                ],
            };
        }
        return ErrorAnalysis::new(
            ErrorCategory::ModuleNotFound,
            Severity::High,
            &[
                "A required module or package is missing.",
                "You need to install dependencies first.",
                "Check if package.json exists and has the dependency listed.",
            ],
            &[
                "Run npm install or pip install to install dependencies",
                "Check if package.json or requirements.txt exists",
                "Add the missing dependency to package.json if needed",
                "Verify the import/require statement is correct",
            ],
        );
    }

    if has("cannot find") || has("not found") || has("enoent") || has("no such file") {
        return ErrorAnalysis::new(
            ErrorCategory::FileNotFound,
            Severity::High,
            &[
                "The system is trying to access a file that does not exist.",
                "Check if the file path is correct.",
                "Verify the file was created before trying to use it.",
            ],
            &[
                "Use listFiles() to check what files exist in the directory",
                "Verify the file path is correct (check for typos, wrong directory)",
                "Create the file if it should exist but doesn't",
                "Check if you need to change directories first",
            ],
        );
    }

    if has("syntaxerror") || has("syntax error") || has("unexpected token") || has("parse error") {
        return ErrorAnalysis::new(
            ErrorCategory::SyntaxError,
            Severity::High,
            &[
                "There is a syntax error in your code.",
                "Check the line number mentioned in the error.",
                "Look for missing brackets, quotes, or semicolons.",
            ],
            &[
                "Read the file and check the syntax around the error line",
                "Look for missing closing brackets, quotes, or parentheses",
                "Check for typos in keywords or variable names",
                "Verify the file encoding is correct",
            ],
        );
    }

    if has("eaddrinuse") || (has("port") && has("already in use")) {
        return ErrorAnalysis::new(
            ErrorCategory::PortInUse,
            Severity::Medium,
            &[
                "The port you're trying to use is already occupied.",
                "Another process is running on that port.",
            ],
            &[
                "Use a different port number in your server configuration",
                "Stop any existing processes using that port",
                "Check what process is using the port: netstat or lsof",
            ],
        );
    }

    if has("permission denied") || has("eacces") || has("access denied") {
        return ErrorAnalysis::new(
            ErrorCategory::PermissionDenied,
            Severity::High,
            &[
                "You don't have permission to perform this action.",
                "The system may need approval for this command.",
                "Check if the file/directory permissions are correct.",
            ],
            &[
                "Wait for permission approval if the system requests it",
                "Check file/directory permissions",
                "Try a location inside the project directory",
            ],
        );
    }

    if has("econnrefused") || has("connection refused") || has("connection") || has("network") {
        return ErrorAnalysis::new(
            ErrorCategory::ConnectionRefused,
            Severity::Medium,
            &[
                "A network connection failed.",
                "The server might not be running yet.",
                "Check if the service needs to be started first.",
            ],
            &[
                "Start the server first before trying to connect",
                "Check if the URL/port is correct",
                "Verify the service is running: check the process list",
            ],
        );
    }

    ErrorAnalysis::new(
        ErrorCategory::Unknown,
        Severity::Medium,
        &[
            "The command failed without a recognisable error pattern.",
            "Read the full terminal output to find the cause.",
        ],
        &[
            "Read the full output above and locate the first error line",
            "Re-run the command after fixing the reported problem",
        ],
    )
}

/// Substrings in command output that mark an attempt as not working, even at exit 0.
const ERROR_INDICATORS: [&str; 5] = ["error", "failed", "exception", "cannot find", "not found"];

/// Whether command output reads like a failure.
pub fn output_signals_error(output: &str) -> bool {
    let text = output.to_lowercase();
    ERROR_INDICATORS.iter().any(|needle| text.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_source_file_is_file_not_found() {
        let a = classify("node missing.js", "Error: Cannot find module '/workspace/missing.js'");
        assert_eq!(a.category, ErrorCategory::FileNotFound);
        assert!(a.guidance[0].contains("/workspace/missing.js"));
    }

    #[test]
    fn test_missing_package_is_module_not_found() {
        let a = classify("node app.js", "Error: Cannot find module 'express'\nRequire stack:");
        assert_eq!(a.category, ErrorCategory::ModuleNotFound);
    }

    #[test]
    fn test_command_not_found_beats_file_not_found() {
        let a = classify("foo", "sh: 1: foo: command not found");
        assert_eq!(a.category, ErrorCategory::CommandNotFound);
        let a = classify("foo", "'foo' is not recognized as an internal or external command");
        assert_eq!(a.category, ErrorCategory::CommandNotFound);
    }

    #[test]
    fn test_enoent() {
        let a = classify("cat x", "ENOENT: no such file or directory, open 'x'");
        assert_eq!(a.category, ErrorCategory::FileNotFound);
    }

    #[test]
    fn test_syntax_errors() {
        assert_eq!(classify("node a.js", "SyntaxError").category, ErrorCategory::SyntaxError);
        assert_eq!(
            classify("python a.py", "  File \"a.py\", line 1\nSyntaxError: invalid syntax").category,
            ErrorCategory::SyntaxError
        );
        assert_eq!(
            classify("node a.js", "Unexpected token '}'").category,
            ErrorCategory::SyntaxError
        );
    }

    #[test]
    fn test_port_in_use() {
        let a = classify("node server.js", "Error: listen EADDRINUSE: address already in use :::3000");
        assert_eq!(a.category, ErrorCategory::PortInUse);
        assert_eq!(a.severity, Severity::Medium);
    }

    #[test]
    fn test_permission_denied() {
        let a = classify("./run.sh", "sh: ./run.sh: Permission denied");
        assert_eq!(a.category, ErrorCategory::PermissionDenied);
    }

    #[test]
    fn test_connection_refused() {
        let a = classify("curl localhost:3000", "curl: (7) Failed to connect: Connection refused");
        assert_eq!(a.category, ErrorCategory::ConnectionRefused);
    }

    #[test]
    fn test_unknown_default() {
        let a = classify("make", "make: *** [all] Error 2");
        assert_eq!(a.category, ErrorCategory::Unknown);
        assert!(!a.guidance.is_empty());
    }

    #[test]
    fn test_fix_count_bounds() {
        for output in [
            "command not found",
            "Cannot find module 'x'",
            "Cannot find module './a.js'",
            "not found",
            "SyntaxError",
            "port already in use",
            "permission denied",
            "ECONNREFUSED",
            "???",
        ] {
            let a = classify("cmd", output);
            assert!(
                (2..=MAX_FIXES).contains(&a.suggested_fixes.len()),
                "{output}: {} fixes",
                a.suggested_fixes.len()
            );
        }
    }

    #[test]
    fn test_learning_format() {
        let a = classify("node a.js", "SyntaxError");
        assert_eq!(
            a.learning().as_deref(),
            Some("syntax_error: Read the file and check the syntax around the error line")
        );
    }

    #[test]
    fn test_classification_is_pure() {
        let out = "Error: Cannot find module '/workspace/missing.js'";
        assert_eq!(classify("node missing.js", out), classify("node missing.js", out));
    }

    #[test]
    fn test_output_signals_error() {
        assert!(output_signals_error("TypeError: x is undefined"));
        assert!(output_signals_error("1 test FAILED"));
        assert!(output_signals_error("sh: foo: not found"));
        assert!(!output_signals_error("Hello, world!"));
    }
}
