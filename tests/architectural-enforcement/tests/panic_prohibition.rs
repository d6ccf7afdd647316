//! Panic Prohibition
//!
//! Library and binary code propagates errors with `?`. `unwrap()` and
//! `expect()` belong in tests only.

use architectural_enforcement::{assert_clean, code_part, scan};

#[test]
fn test_no_unwrap_in_production_code() {
    let violations = scan(|_, lines, idx| {
        let code = code_part(lines[idx]);
        (code.contains(".unwrap()") || code.contains(".expect("))
            .then(|| format!("Panicking accessor: {}", lines[idx].trim()))
    });

    assert_clean("unwrap/expect", &violations);
}
