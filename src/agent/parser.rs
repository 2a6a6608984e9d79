//! Extract file and shell operations from free-form model output.
//!
//! Recognised forms:
//! - `writeFile('path', 'content')`, also `createFile` / `saveFile`
//! - `deleteFile('path')`, also `removeFile`
//! - `executeCommand('cmd')`, also `runCommand` / `exec`
//! - a fenced code block preceded (within 200 chars) by a path hint such as
//!   `File: src/app.js`, treated as an implicit write
//!
//! String literals may use single, double, or backtick quotes and the usual
//! backslash escapes. Reads and listings are ignored: they have no side effect.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::agent::operation::Operation;

/// How far back from a code fence to look for a path hint.
const PATH_HINT_WINDOW: usize = 200;

/// Turns a model response into an ordered list of operations.
///
/// The iteration loop depends only on this trait, so a structured-output
/// parser can replace the pattern matcher without touching the loop.
pub trait OperationParser: Send + Sync {
    fn parse(&self, response: &str) -> Vec<Operation>;
}

static CALL_HEAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(writeFile|createFile|saveFile|deleteFile|removeFile|executeCommand|runCommand|exec)\s*\(\s*",
    )
    .unwrap()
});

/// A command that is really one of the pseudo-functions.
static PSEUDO_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(listFiles|readFile|writeFile|createFile|deleteFile|removeFile|saveFile|loadFile)\s*\(")
        .unwrap()
});

static CODE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[\w+#.-]*[ \t]*\r?\n((?s:.*?))```").unwrap());

static PATH_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:file|path|filename)\b[:\s]+[*'"`]*([\w./\\-]+\.\w+)"#).unwrap()
});

/// Regex-based parser for the pseudo-function vocabulary.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatternParser;

impl PatternParser {
    pub fn new() -> Self {
        Self
    }

    /// Pseudo-function calls, with the byte span each one covers.
    fn calls(&self, text: &str) -> Vec<(Range<usize>, Option<Operation>)> {
        let mut found = Vec::new();
        let mut cursor = 0;

        while let Some(head) = CALL_HEAD.captures_at(text, cursor) {
            let whole = head.get(0).map(|m| m.range()).unwrap_or(cursor..cursor);
            let name = head.get(1).map(|m| m.as_str()).unwrap_or_default();

            match parse_call_args(&text[whole.end..], name) {
                Some((op, consumed)) => {
                    let span = whole.start..whole.end + consumed;
                    cursor = span.end;
                    found.push((span, op));
                }
                None => cursor = whole.end,
            }
        }

        found
    }
}

impl OperationParser for PatternParser {
    fn parse(&self, response: &str) -> Vec<Operation> {
        let calls = self.calls(response);
        let mut ops: Vec<(usize, Operation)> = calls
            .iter()
            .filter_map(|(span, op)| op.clone().map(|op| (span.start, op)))
            .collect();

        for block in CODE_BLOCK.captures_iter(response) {
            let (Some(fence), Some(body)) = (block.get(0), block.get(1)) else {
                continue;
            };

            // Blocks that show pseudo-calls were already handled call by call.
            let overlaps_call = calls
                .iter()
                .any(|(span, _)| span.start < fence.end() && fence.start() < span.end);
            if overlaps_call {
                continue;
            }

            let window_start = floor_boundary(response, fence.start().saturating_sub(PATH_HINT_WINDOW));
            let before = &response[window_start..fence.start()];
            if let Some(hint) = PATH_HINT
                .captures_iter(before)
                .last()
                .and_then(|c| c.get(1))
            {
                ops.push((fence.start(), Operation::write(hint.as_str(), body.as_str())));
            }
        }

        ops.sort_by_key(|(offset, _)| *offset);
        debug!(count = ops.len(), "Parsed operations from response");
        ops.into_iter().map(|(_, op)| op).collect()
    }
}

/// Parse the argument list after `name(`. Returns the operation (None when
/// the call is recognised but dropped) and the bytes consumed through `)`.
fn parse_call_args(rest: &str, name: &str) -> Option<(Option<Operation>, usize)> {
    let (first, mut pos) = parse_string_literal(rest)?;

    let op = match name {
        "writeFile" | "createFile" | "saveFile" => {
            pos += skip_ws(&rest[pos..]);
            if !rest[pos..].starts_with(',') {
                return None;
            }
            pos += 1;
            pos += skip_ws(&rest[pos..]);
            let (content, used) = parse_string_literal(&rest[pos..])?;
            pos += used;
            Some(Operation::write(first.trim(), content))
        }
        "deleteFile" | "removeFile" => Some(Operation::delete(first.trim())),
        _ => {
            let command = first.trim();
            if command.is_empty() || PSEUDO_CALL.is_match(command) {
                debug!(command = %command, "Dropped pseudo-function passed as a shell command");
                None
            } else {
                Some(Operation::execute(command))
            }
        }
    };

    pos += skip_ws(&rest[pos..]);
    if !rest[pos..].starts_with(')') {
        return None;
    }
    Some((op, pos + 1))
}

/// Parse one quoted literal at the start of `s`, returning the unescaped
/// value and the number of bytes consumed including both quotes.
fn parse_string_literal(s: &str) -> Option<(String, usize)> {
    let mut chars = s.char_indices();
    let (_, quote) = chars.next()?;
    if !matches!(quote, '\'' | '"' | '`') {
        return None;
    }

    let mut value = String::new();
    while let Some((idx, c)) = chars.next() {
        match c {
            '\\' => {
                let (_, escaped) = chars.next()?;
                match escaped {
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    'r' => value.push('\r'),
                    '\\' | '\'' | '"' | '`' => value.push(escaped),
                    other => {
                        value.push('\\');
                        value.push(other);
                    }
                }
            }
            c if c == quote => return Some((value, idx + c.len_utf8())),
            c => value.push(c),
        }
    }
    None
}

fn skip_ws(s: &str) -> usize {
    s.len() - s.trim_start().len()
}

fn floor_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Vec<Operation> {
        PatternParser::new().parse(text)
    }

    #[test]
    fn test_write_call() {
        let ops = parse(r#"I'll create it: writeFile('hello.js', 'console.log("hi");')"#);
        assert_eq!(ops, vec![Operation::write("hello.js", r#"console.log("hi");"#)]);
    }

    #[test]
    fn test_write_call_unescapes_content() {
        let ops = parse(r#"createFile("a.txt", "line 1\nit\'s \"quoted\"")"#);
        assert_eq!(ops, vec![Operation::write("a.txt", "line 1\nit's \"quoted\"")]);
    }

    #[test]
    fn test_backtick_multiline_content() {
        let text = "writeFile('app.js', `const x = 1;\nconsole.log('x', x);\n`)";
        let ops = parse(text);
        assert_eq!(
            ops,
            vec![Operation::write("app.js", "const x = 1;\nconsole.log('x', x);\n")]
        );
    }

    #[test]
    fn test_delete_and_execute() {
        let ops = parse("deleteFile('old.js')\nremoveFile(\"tmp/x.txt\")\nexecuteCommand('ls -la')");
        assert_eq!(
            ops,
            vec![
                Operation::delete("old.js"),
                Operation::delete("tmp/x.txt"),
                Operation::execute("ls -la"),
            ]
        );
    }

    #[test]
    fn test_run_command_aliases() {
        let ops = parse("runCommand('npm test') then exec(\"node index.js\")");
        assert_eq!(
            ops,
            vec![Operation::execute("npm test"), Operation::execute("node index.js")]
        );
    }

    #[test]
    fn test_pseudo_function_commands_dropped() {
        let ops = parse("executeCommand('listFiles()')\nexecuteCommand('readFile(\"a.txt\")')\nexecuteCommand('ls')");
        assert_eq!(ops, vec![Operation::execute("ls")]);
    }

    #[test]
    fn test_reads_and_listings_ignored() {
        assert!(parse("readFile('a.js') and listFiles('.')").is_empty());
    }

    #[test]
    fn test_order_follows_text() {
        let text = "executeCommand('node hello.js') after writeFile('hello.js', 'x')";
        let ops = parse(text);
        assert_eq!(
            ops,
            vec![Operation::execute("node hello.js"), Operation::write("hello.js", "x")]
        );
    }

    #[test]
    fn test_code_block_with_path_hint() {
        let text = "Here is the server.\n\nFile: src/server.js\n```javascript\nconst http = require('http');\n```\nThen executeCommand('node src/server.js')";
        let ops = parse(text);
        assert_eq!(
            ops,
            vec![
                Operation::write("src/server.js", "const http = require('http');\n"),
                Operation::execute("node src/server.js"),
            ]
        );
    }

    #[test]
    fn test_code_block_uses_nearest_hint() {
        let text = "The path: a.js is old. Use filename: `b.js`\n```\nlet b;\n```";
        let ops = parse(text);
        assert_eq!(ops, vec![Operation::write("b.js", "let b;\n")]);
    }

    #[test]
    fn test_code_block_without_hint_ignored() {
        let text = "Example output:\n```\nhello\n```";
        assert!(parse(text).is_empty());
    }

    #[test]
    fn test_code_block_containing_calls_not_duplicated() {
        let text = "File: notes.md\n```\nwriteFile('a.js', 'x')\n```";
        assert_eq!(parse(text), vec![Operation::write("a.js", "x")]);
    }

    #[test]
    fn test_unterminated_call_ignored() {
        assert!(parse("writeFile('a.js', 'unterminated").is_empty());
        assert!(parse("executeCommand(npm test)").is_empty());
    }

    #[test]
    fn test_identifier_boundary() {
        assert!(parse("myexec('rm x')").is_empty());
    }

    #[test]
    fn test_string_literal_consumed_length() {
        let (value, used) = parse_string_literal("'héllo' rest").unwrap();
        assert_eq!(value, "héllo");
        assert_eq!(&"'héllo' rest"[used..], " rest");
    }
}
