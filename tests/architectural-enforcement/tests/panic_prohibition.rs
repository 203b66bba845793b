//! Integration Test: Panic Prohibition
//!
//! **Policy**: production code propagates errors. `unwrap()` and `expect()`
//! are only allowed in tests.

use architectural_enforcement::scan;

#[test]
fn test_no_unwrap_or_expect_in_production_code() {
    let violations = scan(&[".unwrap()", ".expect("]);

    if !violations.is_empty() {
        eprintln!("\n❌ unwrap()/expect() found in production code:\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ Use `?`, `ok_or`, `let ... else` or log-and-degrade instead.");

        panic!(
            "\nFound {} panic site(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}
