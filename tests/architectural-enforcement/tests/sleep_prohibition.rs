//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Shardgate source files MUST NOT call sleep methods, test
//! modules included. Waiting is done on I/O, on signals, or, in tests, on
//! barriers and channels.
//!
//! The only exception is exponential backoff in retry logic.

use architectural_enforcement::{production_sources, SourceFile};

/// Test that source files do not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let violations: Vec<String> = production_sources()
        .iter()
        .flat_map(find_sleep_violations)
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in source files!\n");

        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }

        eprintln!("\n✅ ACCEPTABLE sleep uses:");
        eprintln!("  - Exponential backoff in retry logic");
        eprintln!("\n❌ FORBIDDEN:");
        eprintln!("  - Sleep in polling loops");
        eprintln!("  - Sleep as poor man's synchronization (use a Barrier in tests)");
        eprintln!("  - Sleep to 'wait' for events (use async I/O!)");

        panic!(
            "\nFound {} sleep violation(s).\nFix these before merging!",
            violations.len()
        );
    }
}

fn find_sleep_violations(file: &SourceFile) -> Vec<String> {
    (0..file.lines.len())
        .filter(|&idx| {
            let code = file.code(idx);
            (code.contains("::sleep(") || code.contains(".sleep("))
                && !is_backoff_context(&file.lines, idx)
        })
        .map(|idx| file.describe(idx))
        .collect()
}

/// Check if sleep is used for exponential backoff (acceptable for retry logic)
fn is_backoff_context(lines: &[String], current_idx: usize) -> bool {
    let context = &lines[current_idx.saturating_sub(15)..(current_idx + 5).min(lines.len())];

    let mut has_backoff_calc = false;
    let mut has_retry_context = false;

    for line in context {
        let line = line.to_lowercase();

        // Exponential growth (2^n pattern or bit shift)
        if line.contains("<<") || line.contains("pow") || line.contains("* 2") {
            has_backoff_calc = true;
        }

        if line.contains("retry") || line.contains("backoff") || line.contains("attempt") {
            has_retry_context = true;
        }
    }

    has_backoff_calc && has_retry_context
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_violation_detection() {
        let file = SourceFile::from_content(
            "x.rs",
            "async fn wait_for_pool() {\n    tokio::time::sleep(Duration::from_millis(10)).await;\n}\n",
        );

        assert_eq!(find_sleep_violations(&file).len(), 1);
    }

    #[test]
    fn test_sleep_in_test_module_is_still_flagged() {
        let file = SourceFile::from_content(
            "x.rs",
            "#[cfg(test)]\nmod tests {\n    #[tokio::test]\n    async fn test_x() {\n        tokio::time::sleep(d).await;\n    }\n}\n",
        );

        assert_eq!(find_sleep_violations(&file).len(), 1);
    }

    #[test]
    fn test_backoff_detection() {
        let file = SourceFile::from_content(
            "x.rs",
            "async fn reconnect() {\n    let delay = base_delay * (1 << attempt);\n    tracing::warn!(attempt, \"retry\");\n    tokio::time::sleep(Duration::from_millis(delay)).await;\n}\n",
        );

        assert!(find_sleep_violations(&file).is_empty());
    }

    #[test]
    fn test_commented_sleep_ignored() {
        let file = SourceFile::from_content("x.rs", "fn f() {\n    // std::thread::sleep(d);\n}\n");

        assert!(find_sleep_violations(&file).is_empty());
    }
}
