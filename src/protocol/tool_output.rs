//! Helpers for agent tool events: file operations, shell transcripts, and
//! validation command categories.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static EXIT_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\nExit code: (\d+)\s*$").expect("exit code pattern is valid"));

const STDERR_SENTINEL: &str = "\nSTDERR:\n";
const BASH_DISPLAY_CHARS: usize = 60;

/// A file touched (or command run) by an agent tool call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOperation {
    pub tool_name: String,
    pub file_path: String,
    #[serde(default)]
    pub line_number: Option<u32>,
}

/// Kind of host validation a command performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCategory {
    Tests,
    Linting,
    Formatting,
    TypeChecking,
}

impl ValidationCategory {
    /// Short key used in receipts and history keys
    pub fn key(&self) -> &'static str {
        match self {
            ValidationCategory::Tests => "test",
            ValidationCategory::Linting => "lint",
            ValidationCategory::Formatting => "format",
            ValidationCategory::TypeChecking => "type",
        }
    }
}

/// Ordered keyword table; the first category with a matching keyword wins
const CATEGORY_TABLE: &[(ValidationCategory, &[&str])] = &[
    (
        ValidationCategory::Tests,
        &["test", "pytest", "jest", "mocha", "go test", "cargo test"],
    ),
    (ValidationCategory::Formatting, &["ruff format", "ruff fmt"]),
    (
        ValidationCategory::Linting,
        &["clippy", "ruff", "eslint", "lint", "pylint", "flake8"],
    ),
    (ValidationCategory::Formatting, &["fmt", "format", "prettier", "rustfmt"]),
    (
        ValidationCategory::TypeChecking,
        &["mypy", "tsc", "typecheck", "pyright"],
    ),
];

/// Categorize a shell command, or `None` if it is not a validation command
pub fn detect_validation_category(command: &str) -> Option<ValidationCategory> {
    let lowered = command.to_lowercase();
    CATEGORY_TABLE
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lowered.contains(k)))
        .map(|(category, _)| *category)
}

/// Collapse runs of whitespace so equivalent commands compare equal
pub fn normalize_command(command: &str) -> String {
    command.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split a shell tool transcript into `(stdout, stderr, exit_code)`.
///
/// The transcript format is `"{stdout}\n\nSTDERR:\n{stderr}"` with an optional
/// trailing `"\nExit code: N"` line. Without that line the exit code is 0.
pub fn parse_tool_output(raw: &str) -> (String, String, i32) {
    if raw.is_empty() {
        return (String::new(), String::new(), 0);
    }

    let (body, exit_code) = match EXIT_CODE_RE.captures(raw) {
        Some(caps) => {
            let code = caps[1].parse::<i32>().unwrap_or(1);
            let start = caps.get(0).map(|m| m.start()).unwrap_or(raw.len());
            (&raw[..start], code)
        }
        None => (raw, 0),
    };

    match body.split_once(STDERR_SENTINEL) {
        Some((stdout, stderr)) => (stdout.trim_end().to_string(), stderr.trim_end().to_string(), exit_code),
        None => (body.trim_end().to_string(), String::new(), exit_code),
    }
}

/// Describe what a tool call touched, for progress reporting and scope checks
pub fn extract_file_operation(tool_name: &str, tool_input: &serde_json::Value) -> Option<FileOperation> {
    let field = match tool_name {
        "Edit" | "Write" | "Read" => "file_path",
        "Glob" => "pattern",
        "Grep" => "path",
        "Bash" => "command",
        _ => return None,
    };
    let value = tool_input.get(field)?.as_str()?;
    if value.is_empty() {
        return None;
    }

    let file_path = if tool_name == "Bash" && value.chars().count() > BASH_DISPLAY_CHARS {
        let head: String = value.chars().take(BASH_DISPLAY_CHARS).collect();
        format!("{}...", head)
    } else {
        value.to_string()
    };

    Some(FileOperation {
        tool_name: tool_name.to_string(),
        file_path,
        line_number: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_detect_validation_category_order() {
        assert_eq!(detect_validation_category("cargo test --all"), Some(ValidationCategory::Tests));
        assert_eq!(detect_validation_category("ruff format ."), Some(ValidationCategory::Formatting));
        assert_eq!(detect_validation_category("ruff check ."), Some(ValidationCategory::Linting));
        assert_eq!(detect_validation_category("cargo clippy"), Some(ValidationCategory::Linting));
        assert_eq!(detect_validation_category("cargo fmt --check"), Some(ValidationCategory::Formatting));
        assert_eq!(detect_validation_category("npx tsc --noEmit"), Some(ValidationCategory::TypeChecking));
        assert_eq!(detect_validation_category("ls -la"), None);
    }

    #[test]
    fn test_normalize_command() {
        assert_eq!(normalize_command("  cargo   test\t--all \n"), "cargo test --all");
    }

    #[test]
    fn test_parse_tool_output_full() {
        let raw = "ok line\n\nSTDERR:\nwarning: x\nExit code: 2";
        let (stdout, stderr, code) = parse_tool_output(raw);
        assert_eq!(stdout, "ok line");
        assert_eq!(stderr, "warning: x");
        assert_eq!(code, 2);
    }

    #[test]
    fn test_parse_tool_output_stdout_only() {
        let (stdout, stderr, code) = parse_tool_output("hello\n");
        assert_eq!(stdout, "hello");
        assert_eq!(stderr, "");
        assert_eq!(code, 0);
    }

    #[test]
    fn test_parse_tool_output_empty() {
        assert_eq!(parse_tool_output(""), (String::new(), String::new(), 0));
    }

    #[test]
    fn test_extract_file_operation_paths() {
        let op = extract_file_operation("Edit", &json!({"file_path": "src/lib.rs"})).unwrap();
        assert_eq!(op.file_path, "src/lib.rs");
        let op = extract_file_operation("Glob", &json!({"pattern": "**/*.rs"})).unwrap();
        assert_eq!(op.file_path, "**/*.rs");
        let op = extract_file_operation("Grep", &json!({"path": "src"})).unwrap();
        assert_eq!(op.file_path, "src");
        assert!(extract_file_operation("WebFetch", &json!({"url": "x"})).is_none());
        assert!(extract_file_operation("Read", &json!({})).is_none());
    }

    #[test]
    fn test_extract_file_operation_truncates_bash() {
        let command = "x".repeat(80);
        let op = extract_file_operation("Bash", &json!({ "command": command })).unwrap();
        assert_eq!(op.file_path.len(), 63);
        assert!(op.file_path.ends_with("..."));
    }
}
