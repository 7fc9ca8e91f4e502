//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! on the conversation core:
//! - No sleep() calls in production code
//! - No unwrap()/expect() in production code
//!
//! Shared helpers for walking the source tree live here; the checks
//! themselves are under `tests/`.

use std::fs;
use std::path::{Path, PathBuf};

/// Source directories subject to the rules, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["conversation/core/src"];

/// Workspace root, derived from this crate's location
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|_| Path::new(env!("CARGO_MANIFEST_DIR")).join("../.."))
}

/// Every `.rs` file under `dir`
#[must_use]
pub fn rust_files(dir: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(|e| e.into_path())
        .collect()
}

/// Code lines of `path` that ship in release builds: `(line_number, code)`
///
/// Comments are stripped and everything from the first `#[cfg(test)]`
/// onwards is skipped.
#[must_use]
pub fn production_lines(path: &Path) -> Vec<(usize, String)> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };

    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| !line.trim_start().starts_with("#[cfg(test)]"))
        .map(|(idx, line)| {
            let code = line.split("//").next().unwrap_or(line);
            (idx + 1, code.to_string())
        })
        .filter(|(_, code)| !code.trim().is_empty())
        .collect()
}

/// `file:line - code` for every production line matching `pattern`
#[must_use]
pub fn find_violations(pattern: impl Fn(&str) -> bool) -> Vec<String> {
    let root = workspace_root();
    let mut violations = Vec::new();

    for dir in PRODUCTION_DIRS {
        let dir = root.join(dir);
        if !dir.exists() {
            continue;
        }
        for file in rust_files(&dir) {
            for (line_number, code) in production_lines(&file) {
                if pattern(&code) {
                    violations.push(format!(
                        "{}:{} - {}",
                        file.display(),
                        line_number,
                        code.trim()
                    ));
                }
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_production_lines_skip_comments_and_tests() {
        let mut file = tempfile_in_target();
        writeln!(file.1, "fn a() {{ x.unwrap(); }} // note").unwrap();
        writeln!(file.1, "// b.unwrap()").unwrap();
        writeln!(file.1, "#[cfg(test)]").unwrap();
        writeln!(file.1, "mod tests {{ fn t() {{ y.unwrap(); }} }}").unwrap();
        drop(file.1);

        let lines = production_lines(&file.0);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, 1);
        assert!(lines[0].1.contains("x.unwrap()"));
        let _ = fs::remove_file(&file.0);
    }

    fn tempfile_in_target() -> (PathBuf, fs::File) {
        let path = std::env::temp_dir().join(format!(
            "arch-enforcement-{}.rs",
            std::process::id()
        ));
        let file = fs::File::create(&path).unwrap();
        (path, file)
    }

    #[test]
    fn test_production_dirs_exist() {
        let root = workspace_root();
        for dir in PRODUCTION_DIRS {
            assert!(root.join(dir).is_dir(), "missing {dir}");
        }
    }
}
