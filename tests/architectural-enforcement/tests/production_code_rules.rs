//! Integration Test: Production Code Rules
//!
//! **Policy**:
//! - The conversation core never sleeps. Waiting is done on the fair lock's
//!   condition variables or on channels.
//! - Failures are propagated as errors, never `unwrap()`ed or `expect()`ed.
//!
//! **Exceptions**: test code (`#[cfg(test)]` modules and `tests/`).

use architectural_enforcement::find_violations;

fn report(title: &str, violations: &[String]) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n❌ {title}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    panic!(
        "\nFound {} violation(s) in production code.\nFix these before merging!",
        violations.len()
    );
}

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let violations =
        find_violations(|code| code.contains("::sleep(") || code.contains(".sleep("));
    report("Sleep calls found in production code!", &violations);
}

/// Test that production code propagates errors instead of panicking
#[test]
fn test_no_unwrap_in_production_code() {
    let violations =
        find_violations(|code| code.contains(".unwrap()") || code.contains(".expect("));
    report("unwrap()/expect() found in production code!", &violations);
}

/// Test that the scan actually sees the crate
#[test]
fn test_scan_covers_conversation_core() {
    let lib = find_violations(|code| code.contains("pub mod conversation;"));
    assert_eq!(lib.len(), 1, "conversation_core lib.rs was not scanned");
}
