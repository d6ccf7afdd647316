//! Architectural Enforcement Helpers
//!
//! Line-based source scanning shared by the enforcement tests in `tests/`:
//! - No sleep() calls in production code
//! - No blocking I/O inside async functions
//! - No unwrap()/expect() outside tests
//!
//! Scanning stops at the first `#[cfg(test)]` in a file; everything after it
//! is test code.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Workspace root, two levels above this package
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..")
}

/// Production source directories checked by every test
#[must_use]
pub fn production_dirs() -> Vec<PathBuf> {
    let root = workspace_root();
    vec![root.join("dispatch/core/src"), root.join("dispatch/cli/src")]
}

/// All `.rs` files under `dir`, sorted
#[must_use]
pub fn rust_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// A rule violation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File the violation is in
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// What was found
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line, self.message)
    }
}

/// Kind of function enclosing a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnKind {
    /// `async fn`
    Async,
    /// plain `fn`
    Sync,
}

/// Code portion of a line, without a trailing `//` comment
#[must_use]
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Lines before the first `#[cfg(test)]`
#[must_use]
pub fn production_lines(content: &str) -> Vec<&str> {
    content
        .lines()
        .take_while(|line| !line.trim_start().starts_with("#[cfg(test)]"))
        .collect()
}

/// Kind of the nearest function declared at or above `idx`
#[must_use]
pub fn enclosing_fn(lines: &[&str], idx: usize) -> Option<FnKind> {
    lines[..=idx.min(lines.len().saturating_sub(1))]
        .iter()
        .rev()
        .find_map(|line| fn_kind(line))
}

fn fn_kind(line: &str) -> Option<FnKind> {
    let mut rest = line.trim_start();
    for prefix in ["pub(crate) ", "pub(super) ", "pub "] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
            break;
        }
    }
    if rest.starts_with("async fn ") {
        Some(FnKind::Async)
    } else if rest.starts_with("fn ") || rest.starts_with("const fn ") {
        Some(FnKind::Sync)
    } else {
        None
    }
}

/// Whether the lines around `idx` compute an exponential backoff for a retry
#[must_use]
pub fn is_backoff_context(lines: &[&str], idx: usize) -> bool {
    let window = &lines[idx.saturating_sub(15)..(idx + 5).min(lines.len())];
    let mut has_backoff_calc = false;
    let mut has_retry_context = false;
    for line in window {
        let line = line.to_lowercase();
        if line.contains("<<") || line.contains("pow") || line.contains("* 2") {
            has_backoff_calc = true;
        }
        if line.contains("retry") || line.contains("backoff") || line.contains("attempt") {
            has_retry_context = true;
        }
    }
    has_backoff_calc && has_retry_context
}

/// Run `check` over the production lines of every file in the production dirs
pub fn scan<F>(mut check: F) -> Vec<Violation>
where
    F: FnMut(&Path, &[&str], usize) -> Option<String>,
{
    let mut violations = Vec::new();
    for dir in production_dirs() {
        if !dir.exists() {
            continue;
        }
        for path in rust_files(&dir) {
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            let lines = production_lines(&content);
            for idx in 0..lines.len() {
                if let Some(message) = check(&path, &lines, idx) {
                    violations.push(Violation {
                        path: path.clone(),
                        line: idx + 1,
                        message,
                    });
                }
            }
        }
    }
    violations
}

/// Print violations and panic if there are any
pub fn assert_clean(rule: &str, violations: &[Violation]) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n{rule}: {} violation(s)\n", violations.len());
    for violation in violations {
        eprintln!("  {violation}");
    }
    panic!("\nFound {} {rule} violation(s) in production code", violations.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let content = "fn a() {}\n#[cfg(test)]\nmod tests {\n    fn b() {}\n}\n";
        assert_eq!(production_lines(content), vec!["fn a() {}"]);
    }

    #[test]
    fn test_enclosing_fn_kinds() {
        let lines = vec![
            "pub fn load() {",
            "    std::fs::read_to_string(p);",
            "}",
            "    pub async fn run(&self) {",
            "        work().await;",
            "    }",
        ];
        assert_eq!(enclosing_fn(&lines, 1), Some(FnKind::Sync));
        assert_eq!(enclosing_fn(&lines, 4), Some(FnKind::Async));
        assert_eq!(enclosing_fn(&["use std::fs;"], 0), None);
    }

    #[test]
    fn test_backoff_detection() {
        let lines = vec![
            "for attempt in 0..max_attempts {",
            "    if attempt + 1 < max_attempts {",
            "        tokio::time::sleep(base * 2u32.saturating_pow(attempt)).await;",
            "    }",
            "}",
        ];
        assert!(is_backoff_context(&lines, 2));
        assert!(!is_backoff_context(&["loop {", "    tokio::time::sleep(d).await;", "}"], 1));
    }

    #[test]
    fn test_code_part_strips_comments() {
        assert_eq!(code_part("let x = 1; // std::fs::read"), "let x = 1; ");
    }
}
