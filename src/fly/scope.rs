//! Project-root scope checks for agent file operations, and the directory
//! policy rendered into the system prompt.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::protocol::FileOperation;

/// Tools whose `file_path` is a real filesystem path
const PATH_TOOLS: &[&str] = &["Edit", "Write", "Read"];

/// Search tools whose `file_path` is a search root or a glob pattern
const SEARCH_TOOLS: &[&str] = &["Glob", "Grep"];

const GLOB_METACHARS: &[char] = &['*', '?', '[', '{'];

/// Never writable by the agent, whatever the project contains
pub const IMMUTABLE_BLOCKED_DIRS: &[&str] = &[".git", ".waypoints", "sessions", "receipts"];

/// Generated, cache and dependency roots
const GENERATED_DIRS: &[&str] = &[
    "dist",
    "build",
    "out",
    "coverage",
    "target",
    "node_modules",
    ".venv",
    "venv",
    ".tox",
    ".pytest_cache",
    ".mypy_cache",
    ".ruff_cache",
    "__pycache__",
];

const FOCUS_HINTS: &[&str] = &[
    "src", "app", "lib", "cmd", "packages", "tests", "test", "spec", "docs", "doc", "scripts", "tools",
];

/// Top-level layout of a project as the agent should treat it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryPolicy {
    pub focus: Vec<String>,
    pub ignored: Vec<String>,
    pub blocked: Vec<String>,
}

impl DirectoryPolicy {
    /// Classify top-level entries of `project_root`; unreadable roots give the immutable set only
    pub fn scan(project_root: &Path) -> Self {
        let mut focus = BTreeSet::new();
        let mut ignored = BTreeSet::new();
        let mut blocked: BTreeSet<String> = IMMUTABLE_BLOCKED_DIRS.iter().map(|s| s.to_string()).collect();

        let entries = match fs::read_dir(project_root) {
            Ok(entries) => entries,
            Err(e) => {
                log::debug!("Directory scan of {} failed: {}", project_root.display(), e);
                return Self {
                    blocked: blocked.into_iter().collect(),
                    ..Self::default()
                };
            }
        };

        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if IMMUTABLE_BLOCKED_DIRS.contains(&name.as_str()) || GENERATED_DIRS.contains(&name.as_str()) {
                ignored.insert(name.clone());
                blocked.insert(name);
            } else if FOCUS_HINTS.contains(&name.as_str()) {
                focus.insert(name);
            } else if name.starts_with('.') {
                ignored.insert(name);
            }
        }

        Self {
            focus: focus.into_iter().collect(),
            ignored: ignored.into_iter().collect(),
            blocked: blocked.into_iter().collect(),
        }
    }

    /// True when a relative-to-root path starts in a blocked directory
    pub fn is_blocked(&self, project_root: &Path, file_path: &str) -> bool {
        let candidate = Path::new(file_path);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            project_root.join(candidate)
        };
        let normalized = normalize_lexically(&joined);
        let Ok(relative) = normalized.strip_prefix(normalize_lexically(project_root)) else {
            return false;
        };
        match relative.components().next() {
            Some(Component::Normal(first)) => self.blocked.iter().any(|b| first == b.as_str()),
            _ => false,
        }
    }

    /// Prompt fragment fed to the directory policy context slice
    pub fn format_for_prompt(&self) -> String {
        let list = |items: &[String], max: usize, empty: &str| {
            if items.is_empty() {
                empty.to_string()
            } else {
                items.iter().take(max).cloned().collect::<Vec<_>>().join(", ")
            }
        };
        format!(
            "- Focus your search in: {}\n- Ignore generated/runtime areas: {}\n- Tool access is blocked for: {}",
            list(&self.focus, 8, "(project root)"),
            list(&self.ignored, 12, "(none)"),
            list(&self.blocked, 12, "(none)"),
        )
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// True when `file_path` resolves outside `project_root`.
///
/// Relative paths are taken against the root. Existing paths are also
/// checked after symlink resolution.
pub fn is_outside_project(project_root: &Path, file_path: &str) -> bool {
    let candidate = Path::new(file_path);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        project_root.join(candidate)
    };

    let lexical_root = normalize_lexically(project_root);
    let canonical_root = project_root.canonicalize().unwrap_or_else(|_| lexical_root.clone());

    let lexical = normalize_lexically(&joined);
    if !lexical.starts_with(&lexical_root) && !lexical.starts_with(&canonical_root) {
        return true;
    }
    match joined.canonicalize() {
        Ok(resolved) => !resolved.starts_with(&canonical_root),
        Err(_) => false,
    }
}

/// Paths of file operations that left the project root
pub fn validate_no_external_changes(project_root: &Path, operations: &[FileOperation]) -> Vec<String> {
    path_operations(operations)
        .filter(|(_, path)| is_outside_project(project_root, path))
        .map(|(op, _)| op.file_path.clone())
        .collect()
}

/// Paths of file operations that left the root or touched a blocked directory
pub fn scope_violations(project_root: &Path, policy: &DirectoryPolicy, operations: &[FileOperation]) -> Vec<String> {
    path_operations(operations)
        .filter(|(_, path)| is_outside_project(project_root, path) || policy.is_blocked(project_root, path))
        .map(|(op, _)| op.file_path.clone())
        .collect()
}

/// Operations paired with the concrete path they touch.
///
/// Search tools contribute the literal prefix of their pattern; a pattern
/// that starts with a wildcard names no path and is skipped.
fn path_operations(operations: &[FileOperation]) -> impl Iterator<Item = (&FileOperation, &str)> {
    operations.iter().filter_map(|op| {
        let tool = op.tool_name.as_str();
        let path = if PATH_TOOLS.contains(&tool) {
            op.file_path.as_str()
        } else if SEARCH_TOOLS.contains(&tool) {
            literal_prefix(&op.file_path)
        } else {
            return None;
        };
        (!path.is_empty()).then_some((op, path))
    })
}

fn literal_prefix(pattern: &str) -> &str {
    match pattern.find(GLOB_METACHARS) {
        Some(idx) => &pattern[..idx],
        None => pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn op(tool: &str, path: &str) -> FileOperation {
        FileOperation {
            tool_name: tool.to_string(),
            file_path: path.to_string(),
            line_number: None,
        }
    }

    #[test]
    fn test_relative_paths_inside() {
        let dir = TempDir::new().unwrap();
        assert!(!is_outside_project(dir.path(), "src/main.rs"));
        assert!(!is_outside_project(dir.path(), "./src/../README.md"));
    }

    #[test]
    fn test_escapes_detected() {
        let dir = TempDir::new().unwrap();
        assert!(is_outside_project(dir.path(), "../sibling/file.txt"));
        assert!(is_outside_project(dir.path(), "/etc/passwd"));
    }

    #[test]
    fn test_absolute_inside_root() {
        let dir = TempDir::new().unwrap();
        let inside = dir.path().join("a.txt");
        fs::write(&inside, "x").unwrap();
        assert!(!is_outside_project(dir.path(), &inside.to_string_lossy()));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_detected() {
        let outside = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        fs::write(outside.path().join("secret"), "x").unwrap();
        assert!(is_outside_project(dir.path(), "link/secret"));
    }

    #[test]
    fn test_only_path_tools_checked() {
        let dir = TempDir::new().unwrap();
        let ops = vec![
            op("Bash", "cat /etc/passwd"),
            op("Write", "/etc/hosts"),
            op("Edit", "src/lib.rs"),
            op("Read", ""),
        ];
        assert_eq!(validate_no_external_changes(dir.path(), &ops), vec!["/etc/hosts"]);
    }

    #[test]
    fn test_search_tools_outside_root_flagged() {
        let dir = TempDir::new().unwrap();
        let ops = vec![
            op("Grep", "../sibling"),
            op("Glob", "/etc/**/*.conf"),
            op("Glob", "src/**/*.rs"),
            op("Glob", "**/*.toml"),
            op("Grep", "src"),
            op("Grep", ""),
        ];
        assert_eq!(
            validate_no_external_changes(dir.path(), &ops),
            vec!["../sibling", "/etc/**/*.conf"]
        );

        let policy = DirectoryPolicy::scan(dir.path());
        let ops = vec![op("Glob", ".git/*"), op("Grep", "src")];
        assert_eq!(scope_violations(dir.path(), &policy, &ops), vec![".git/*"]);
    }

    #[test]
    fn test_directory_policy_scan() {
        let dir = TempDir::new().unwrap();
        for name in ["src", "tests", "target", ".github", "misc"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        fs::write(dir.path().join("README.md"), "x").unwrap();
        let policy = DirectoryPolicy::scan(dir.path());
        assert_eq!(policy.focus, vec!["src", "tests"]);
        assert_eq!(policy.ignored, vec![".github", "target"]);
        assert!(policy.blocked.contains(&"target".to_string()));
        assert!(policy.blocked.contains(&".git".to_string()));
        assert!(policy.format_for_prompt().starts_with("- Focus your search in: src, tests\n"));
    }

    #[test]
    fn test_blocked_paths_are_violations() {
        let dir = TempDir::new().unwrap();
        let policy = DirectoryPolicy::scan(dir.path());
        assert!(policy.is_blocked(dir.path(), ".git/config"));
        assert!(policy.is_blocked(dir.path(), "./receipts/wp1-x.json"));
        assert!(!policy.is_blocked(dir.path(), "src/receipts.rs"));

        let ops = vec![op("Write", "receipts/fake.json"), op("Edit", "src/lib.rs")];
        assert_eq!(scope_violations(dir.path(), &policy, &ops), vec!["receipts/fake.json"]);
    }

    #[test]
    fn test_empty_policy_prompt() {
        let policy = DirectoryPolicy::default();
        assert_eq!(
            policy.format_for_prompt(),
            "- Focus your search in: (project root)\n- Ignore generated/runtime areas: (none)\n- Tool access is blocked for: (none)"
        );
    }
}
