//! Architectural Enforcement Integration Tests
//!
//! Source-scanning helpers shared by the tests in `tests/`:
//! - No blocking I/O inside async functions
//! - No sleep() calls in production code
//!
//! The scanner is line based. It knows just enough Rust to tell which
//! function a line belongs to and whether it sits in the trailing
//! `#[cfg(test)]` module.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source directories, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["shardgate/core/src", "shardgate/daemon/src"];

/// Workspace root, independent of the directory the tests run from
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..")
}

/// A source file split into lines
pub struct SourceFile {
    /// Path relative to the workspace root
    pub path: PathBuf,
    /// File content, one entry per line
    pub lines: Vec<String>,
    test_start: Option<usize>,
}

impl SourceFile {
    /// Build from in-memory content
    #[must_use]
    pub fn from_content(path: impl Into<PathBuf>, content: &str) -> Self {
        let lines: Vec<String> = content.lines().map(String::from).collect();
        let test_start = lines.iter().position(|l| l.trim() == "#[cfg(test)]");
        Self {
            path: path.into(),
            lines,
            test_start,
        }
    }

    /// Whether line `idx` is inside test code
    #[must_use]
    pub fn is_test_code(&self, idx: usize) -> bool {
        self.test_start.is_some_and(|start| idx >= start)
    }

    /// Kind of the function enclosing line `idx`, if any
    #[must_use]
    pub fn enclosing_fn(&self, idx: usize) -> Option<FnKind> {
        for line in self.lines[..=idx].iter().rev() {
            let line = strip_visibility(line.trim());

            if line.starts_with("async fn ") {
                return Some(FnKind::Async);
            }
            if line.starts_with("fn ") || line.starts_with("const fn ") {
                return Some(FnKind::Sync);
            }

            // Stop at module/impl boundaries
            if line.starts_with("mod ") || (line.starts_with("impl") && line.contains('{')) {
                return None;
            }
        }
        None
    }

    /// Code part of line `idx`, with any trailing `//` comment removed
    #[must_use]
    pub fn code(&self, idx: usize) -> &str {
        let line = self.lines[idx].as_str();
        line.split("//").next().unwrap_or(line)
    }

    /// `path:line - text` for reporting
    #[must_use]
    pub fn describe(&self, idx: usize) -> String {
        format!(
            "{}:{} - {}",
            self.path.display(),
            idx + 1,
            self.lines[idx].trim()
        )
    }
}

/// Whether a function is async
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FnKind {
    /// `async fn`
    Async,
    /// Plain `fn`
    Sync,
}

/// Drop a leading `pub`, `pub(crate)`, `pub(super)` or `pub(in ...)`
#[must_use]
pub fn strip_visibility(line: &str) -> &str {
    let Some(rest) = line.strip_prefix("pub") else {
        return line;
    };
    if let Some(rest) = rest.strip_prefix(' ') {
        return rest.trim_start();
    }
    if rest.starts_with('(') {
        if let Some(close) = rest.find(')') {
            return rest[close + 1..].trim_start();
        }
    }
    line
}

/// Every `.rs` file under the production directories
#[must_use]
pub fn production_sources() -> Vec<SourceFile> {
    let root = workspace_root();
    let mut files = Vec::new();

    for dir in PRODUCTION_DIRS {
        for entry in walkdir::WalkDir::new(root.join(dir))
            .into_iter()
            .filter_map(Result::ok)
        {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            let Ok(content) = fs::read_to_string(path) else {
                continue;
            };
            let relative = path.strip_prefix(&root).unwrap_or(path);
            files.push(SourceFile::from_content(relative, &content));
        }
    }

    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_visibility() {
        assert_eq!(strip_visibility("pub fn load()"), "fn load()");
        assert_eq!(strip_visibility("pub(crate) async fn run()"), "async fn run()");
        assert_eq!(strip_visibility("fn private()"), "fn private()");
        assert_eq!(strip_visibility("publish()"), "publish()");
    }

    #[test]
    fn test_enclosing_fn() {
        let file = SourceFile::from_content(
            "x.rs",
            "pub async fn close_all(&self) {\n    work().await;\n}\n\npub(crate) fn load() {\n    read();\n}\n",
        );

        assert_eq!(file.enclosing_fn(1), Some(FnKind::Async));
        assert_eq!(file.enclosing_fn(5), Some(FnKind::Sync));
    }

    #[test]
    fn test_test_module_detection() {
        let file = SourceFile::from_content(
            "x.rs",
            "fn prod() {}\n#[cfg(test)]\nmod tests {\n    fn helper() {}\n}\n",
        );

        assert!(!file.is_test_code(0));
        assert!(file.is_test_code(3));
    }

    #[test]
    fn test_production_sources_found() {
        let files = production_sources();
        assert!(
            files.iter().any(|f| f.path.ends_with("shardgate/core/src/manager.rs")),
            "scanner did not find the core sources"
        );
    }
}
