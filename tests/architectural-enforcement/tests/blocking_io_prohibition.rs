//! Integration Test: Blocking Call Prohibition
//!
//! **Policy**: production code runs on the tokio runtime and must not block
//! a worker thread.
//! **Required**: `tokio::time::sleep`, async `reqwest::Client`.

use architectural_enforcement::scan;

#[test]
fn test_no_blocking_calls_in_production_code() {
    let violations = scan(&["std::thread::sleep", "thread::sleep(", "reqwest::blocking", "block_on("]);

    if !violations.is_empty() {
        eprintln!("\n❌ Blocking calls found in production code:\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n❌ FORBIDDEN:");
        eprintln!("  - std::thread::sleep()");
        eprintln!("  - reqwest::blocking::*");
        eprintln!("  - futures::executor::block_on()");
        eprintln!("\n✅ REQUIRED:");
        eprintln!("  - tokio::time::sleep().await");
        eprintln!("  - reqwest::Client (async)");

        panic!(
            "\nFound {} blocking call(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

#[test]
fn test_no_unbounded_spin_loops() {
    // Retry loops back off with tokio timers
    let violations = scan(&["std::hint::spin_loop"]);
    assert!(violations.is_empty(), "spin loops found: {violations:?}");
}
