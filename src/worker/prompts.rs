//! Prompt text for task iterations and peer messages.

use serde_json::{Map, Value};

use crate::worker::memory::ErrorRecord;
use crate::worker::role::WorkerRole;

const OPERATIONS_GUIDE: &str = r#"You are part of a collaborative coding system. You have full access to:

FILE OPERATIONS (these are FUNCTIONS, not terminal commands):
- writeFile('path', 'content'): write or create a file
- createFile('path', 'content'): create a new file
- deleteFile('path'): delete a file or directory
- readFile('path') and listFiles('path?') are answered from the context memory

Never wrap these in executeCommand: executeCommand('listFiles()') is wrong.

TERMINAL ACCESS (these are COMMANDS):
- executeCommand('command'): run a shell command in the project workspace
  * executeCommand('npm install')
  * executeCommand('node server.js')
  * executeCommand('ls -la')

A fenced code block directly after a line such as "File: src/app.js" is written
to that path.

READING TERMINAL OUTPUT:
- After every command the FULL terminal output appears in the context memory
  under "TERMINAL OUTPUT". It shows exactly what happened: errors, stack
  traces, file paths and line numbers.
- Always read it before deciding what to do next.

BEST PRACTICES:
- Create a file before running it.
- "file not found": check the path. "module not found": install dependencies.
- Always test your code after writing it. Run it and verify it works.
- Commands that need permission (npm install, npm start, git push, ...) are
  held for approval automatically. Keep working on other things meanwhile.

WORKFLOW:
1. Write new code or modify existing files
2. Execute commands to test, build, or run it
3. If errors occur, read the output and fix the cause
4. Test again until the task is complete and working

When writing code, use clear file paths and complete code blocks. The system
executes the file operations and commands you describe."#;

const DEBUG_MODE: &str = r#"

DEBUG MODE ENABLED - AUTONOMOUS ITERATION:
- You MUST test your code after writing it
- If tests fail or errors occur, fix them immediately
- Read error messages carefully and fix the root cause
- Use executeCommand to test: npm start, node app.js, npm test, etc.
- Do not stop until the task is fully working

SELF-REFLECTION & REASONING:
- After each attempt, think about what went wrong and why
- Analyze error messages, stack traces, and output carefully
- Ask yourself: what did I try, what was the result, what should I try differently?
- Explain your reasoning, then act on it"#;

const ERROR_REFLECTION: &str = r#"Previous attempt had errors.

READ THE TERMINAL OUTPUT IN THE CONTEXT MEMORY ABOVE.

SELF-REFLECTION REQUIRED:
1. Check the "TERMINAL OUTPUT" and "FAILED COMMANDS" sections for the full output of failed commands
2. Review the error analysis and its suggested fixes
3. What did you try in the previous attempt?
4. Why did it fail? The terminal output contains the answer.
5. What will you do differently this time?

DEBUGGING STEPS:
- "Cannot find module" or "file not found": make sure the file exists at that path
- Syntax errors: rewrite the file, checking the line number in the error
- Missing dependencies: install them first

Explain your reasoning, then fix the issues and test again."#;

const TESTING_REFLECTION: &str = r#"Testing phase.

SELF-REFLECTION:
1. What have you created so far? (Check CONTEXT MEMORY above)
2. What needs to be tested?
3. How will you verify it works?

Nothing has been run yet this iteration. Code that has never been run is not
done: execute it (node app.js, npm test, python main.py, ...) and check the
terminal output in the next iteration."#;

const COLLABORATION_GUIDE: &str = r#"You are collaborating with other workers. You can:
- Review code written by other workers
- Fix bugs they find
- Suggest improvements
- Share your findings

You can use writeFile, deleteFile and executeCommand exactly as during a task."#;

/// System prompt for a task: role, operation vocabulary, optional debug mode.
pub fn task_system_prompt(role: WorkerRole, auto_debug: bool) -> String {
    let mut prompt = format!("{}\n\n{}", role.system_prompt(), OPERATIONS_GUIDE);
    if auto_debug {
        prompt.push_str(DEBUG_MODE);
    }
    prompt
}

/// First user turn: the task plus any context handed over by the caller.
pub fn task_message(task: &str, shared_context: &Map<String, Value>) -> String {
    if shared_context.is_empty() {
        return task.to_string();
    }
    format!(
        "{task}\n\nContext from other workers:\n{}",
        pretty(shared_context)
    )
}

pub fn shared_knowledge(shared_data: &Map<String, Value>) -> Option<String> {
    if shared_data.is_empty() {
        None
    } else {
        Some(format!("Shared knowledge:\n{}", pretty(shared_data)))
    }
}

/// Full output and guidance for the previous iteration's failed commands.
pub fn error_guidance(errors: &[&ErrorRecord]) -> String {
    if errors.is_empty() {
        return String::new();
    }

    let mut out = String::from("\n\n=== CRITICAL: ERROR ANALYSIS & FULL TERMINAL OUTPUT ===\n");
    out.push_str("The commands below FAILED. Read the FULL terminal output to understand why.\n\n");
    for (i, e) in errors.iter().enumerate() {
        let n = i + 1;
        out.push_str(&format!("\n--- ERROR {n} ({}) ---\n", e.analysis.category));
        out.push_str(&format!("Command: {}\n", e.command));
        if let Some(code) = e.exit_code {
            out.push_str(&format!("Exit Code: {code}\n"));
        }
        let output = if e.output.is_empty() { "(no output)" } else { &e.output };
        out.push_str(&format!("\nFULL TERMINAL OUTPUT (READ THIS CAREFULLY):\n{output}\n"));
        out.push_str(&format!("\nWhat happened: {}\n", e.analysis.guidance.join(" ")));
        out.push_str("How to fix:\n");
        for fix in &e.analysis.suggested_fixes {
            out.push_str(&format!("  - {fix}\n"));
        }
        out.push_str(&format!("--- END ERROR {n} ---\n\n"));
    }
    out.push_str("\n=== END ERROR ANALYSIS ===\n");
    out
}

/// The self-reflection turn sent after the previous reply.
pub fn reflection(iteration: u32, previous_had_errors: bool) -> String {
    let body = if previous_had_errors {
        ERROR_REFLECTION
    } else {
        TESTING_REFLECTION
    };
    format!("Iteration {iteration} - {body}")
}

pub fn collaboration_system_prompt(role: WorkerRole, shared_data: &Map<String, Value>) -> String {
    let mut prompt = format!("{}\n\n{}", role.system_prompt(), COLLABORATION_GUIDE);
    if !shared_data.is_empty() {
        prompt.push_str(&format!(
            "\n\nShared context from other workers:\n{}",
            pretty(shared_data)
        ));
    }
    prompt
}

/// The peer message as the receiver sees it, with any shared code, error, or files.
pub fn peer_message(
    from_name: &str,
    from_role: WorkerRole,
    message: &str,
    data: &Map<String, Value>,
) -> String {
    let mut out = format!("Message from {from_name} ({from_role}): {message}\n");
    if let Some(code) = data.get("code").and_then(Value::as_str) {
        out.push_str(&format!("\nCode shared:\n```\n{code}\n```\n"));
    }
    if let Some(error) = data.get("error").and_then(Value::as_str) {
        out.push_str(&format!("\nError reported:\n{error}\n"));
    }
    match data.get("files") {
        Some(Value::Array(files)) => {
            let names: Vec<String> = files
                .iter()
                .map(|f| f.as_str().map(str::to_string).unwrap_or_else(|| f.to_string()))
                .collect();
            out.push_str(&format!("\nFiles mentioned: {}\n", names.join(", ")));
        }
        Some(Value::String(file)) => out.push_str(&format!("\nFiles mentioned: {file}\n")),
        _ => {}
    }
    out.push_str("\nHow do you respond? What actions do you take?");
    out
}

fn pretty(map: &Map<String, Value>) -> String {
    serde_json::to_string_pretty(map).unwrap_or_else(|_| format!("{map:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_debug_block_only_in_auto_debug() {
        assert!(task_system_prompt(WorkerRole::Coder, true).contains("DEBUG MODE ENABLED"));
        assert!(!task_system_prompt(WorkerRole::Coder, false).contains("DEBUG MODE ENABLED"));
        assert!(task_system_prompt(WorkerRole::Tester, false).starts_with(WorkerRole::Tester.system_prompt()));
    }

    #[test]
    fn test_task_message_with_context() {
        let mut ctx = Map::new();
        assert_eq!(task_message("build it", &ctx), "build it");
        ctx.insert("api".to_string(), json!("/v1"));
        let msg = task_message("build it", &ctx);
        assert!(msg.starts_with("build it\n\nContext from other workers:"));
        assert!(msg.contains("\"api\": \"/v1\""));
    }

    #[test]
    fn test_reflection_variants() {
        assert!(reflection(2, true).starts_with("Iteration 2 - Previous attempt had errors."));
        assert!(reflection(3, false).starts_with("Iteration 3 - Testing phase."));
    }

    #[test]
    fn test_peer_message_includes_shared_data() {
        let data = json!({"code": "let x = 1;", "error": "boom", "files": ["a.js", "b.js"]});
        let msg = peer_message("alice", WorkerRole::Debugger, "look", data.as_object().unwrap());
        assert!(msg.starts_with("Message from alice (debugger): look"));
        assert!(msg.contains("```\nlet x = 1;\n```"));
        assert!(msg.contains("Error reported:\nboom"));
        assert!(msg.contains("Files mentioned: a.js, b.js"));
    }
}
