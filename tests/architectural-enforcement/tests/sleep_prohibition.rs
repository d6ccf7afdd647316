//! Sleep Prohibition
//!
//! Production code waits on I/O, never on the clock.
//!
//! Allowed: exponential backoff in retry loops, and the scripted test
//! backend in `routing/test_utils.rs`, which simulates backend latency.
//! Periodic work uses `tokio::time::interval`.

use architectural_enforcement::{assert_clean, code_part, is_backoff_context, scan};

/// Files whose sleeps simulate latency for tests
const LATENCY_SIMULATORS: &[&str] = &["test_utils.rs"];

#[test]
fn test_no_sleep_in_production_code() {
    let violations = scan(|path, lines, idx| {
        let code = code_part(lines[idx]);
        if !(code.contains("::sleep(") || code.contains(".sleep(")) {
            return None;
        }
        if code.contains("std::thread::sleep") || code.contains("thread::sleep(") {
            return Some(format!("Thread sleep: {}", lines[idx].trim()));
        }
        let simulator = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| LATENCY_SIMULATORS.contains(&n));
        if simulator || is_backoff_context(lines, idx) {
            return None;
        }
        Some(format!("Sleep outside retry backoff: {}", lines[idx].trim()))
    });

    assert_clean("sleep", &violations);
}
