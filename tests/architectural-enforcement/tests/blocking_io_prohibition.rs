//! Blocking I/O Prohibition
//!
//! Async functions must use `tokio::fs`, `tokio::net` and the async
//! `reqwest` client. Blocking calls are acceptable only in plain functions
//! that run before the runtime does real work, such as configuration loading.

use architectural_enforcement::{assert_clean, code_part, enclosing_fn, scan, FnKind};

const BLOCKING_CALLS: &[(&str, &str)] = &[
    ("std::fs::", "Blocking file I/O"),
    ("std::net::", "Blocking network I/O"),
    ("std::process::Command", "Blocking process I/O"),
    ("std::io::stdin()", "Blocking stdin"),
];

#[test]
fn test_no_blocking_io_in_async_code() {
    let violations = scan(|_, lines, idx| {
        let code = code_part(lines[idx]);
        if code.contains("reqwest::blocking") {
            return Some(format!("Blocking HTTP client: {}", lines[idx].trim()));
        }
        let (_, what) = BLOCKING_CALLS.iter().find(|(needle, _)| code.contains(needle))?;
        if enclosing_fn(lines, idx) == Some(FnKind::Async) {
            Some(format!("{what} in async fn: {}", lines[idx].trim()))
        } else {
            None
        }
    });

    assert_clean("blocking I/O", &violations);
}
