//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Production code in shardgate MUST NOT block a runtime thread.
//! **Required**: Database I/O goes through the async pool; any file or socket
//! access in an async context uses `tokio::fs` / `tokio::net`.
//!
//! Blocking calls are acceptable in plain `fn`s that run before the runtime
//! is serving requests (configuration loading) and in test code.

use architectural_enforcement::{production_sources, FnKind, SourceFile};

/// Test that production code does not use blocking I/O in async contexts
#[test]
fn test_no_blocking_io_in_production_code() {
    let violations: Vec<String> = production_sources()
        .iter()
        .flat_map(find_blocking_io_violations)
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Blocking I/O calls found in production code!\n");

        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }

        eprintln!("\n❌ FORBIDDEN in async code:");
        eprintln!("  - std::fs::*, std::net::*, std::process::Command");
        eprintln!("  - std::io::stdin(), std::io::stdout()");
        eprintln!("  - std::thread::sleep");
        eprintln!("\n✅ ACCEPTABLE blocking I/O:");
        eprintln!("  - Non-async functions (config loading before the runtime serves work)");
        eprintln!("  - Test code");

        panic!(
            "\nFound {} blocking I/O violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

const BLOCKING_CALLS: &[(&str, &str)] = &[
    ("std::fs::", "Blocking file I/O"),
    ("std::net::", "Blocking network I/O"),
    ("std::process::Command", "Blocking process I/O"),
    ("std::io::stdin()", "Blocking stdin"),
    ("std::io::stdout()", "Blocking stdout"),
    ("std::thread::sleep", "Blocking sleep"),
];

fn find_blocking_io_violations(file: &SourceFile) -> Vec<String> {
    let mut violations = Vec::new();

    for idx in 0..file.lines.len() {
        if file.is_test_code(idx) {
            continue;
        }
        let code = file.code(idx);

        // Module-level imports invite blocking calls anywhere in the file
        if code.trim_start().starts_with("use std::fs")
            || code.trim_start().starts_with("use std::net")
        {
            violations.push(format!("Blocking import: {}", file.describe(idx)));
            continue;
        }

        if file.enclosing_fn(idx) != Some(FnKind::Async) {
            continue;
        }

        for (pattern, label) in BLOCKING_CALLS {
            if code.contains(pattern) {
                violations.push(format!("{label}: {}", file.describe(idx)));
            }
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_io_detection() {
        let file = SourceFile::from_content(
            "bad.rs",
            "pub async fn bad_function() {\n    let contents = std::fs::read_to_string(\"file.txt\")?;\n}\n",
        );

        assert_eq!(find_blocking_io_violations(&file).len(), 1);
    }

    #[test]
    fn test_non_async_function_allowed() {
        let file = SourceFile::from_content(
            "config.rs",
            "pub fn load_config_with<F>(path: Option<PathBuf>) {\n    let text = std::fs::read_to_string(path)?;\n}\n",
        );

        assert!(find_blocking_io_violations(&file).is_empty());
    }

    #[test]
    fn test_test_module_allowed() {
        let file = SourceFile::from_content(
            "x.rs",
            "#[cfg(test)]\nmod tests {\n    use std::fs;\n    #[tokio::test]\n    async fn test_x() {\n        std::fs::read(\"a\");\n    }\n}\n",
        );

        assert!(find_blocking_io_violations(&file).is_empty());
    }

    #[test]
    fn test_module_level_import_flagged() {
        let file = SourceFile::from_content("x.rs", "use std::net::TcpStream;\n");

        assert_eq!(find_blocking_io_violations(&file).len(), 1);
    }
}
