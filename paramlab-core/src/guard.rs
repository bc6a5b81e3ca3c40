//! Isolation guard: keeps the lab structurally and dynamically offline.
//!
//! Two enforcement layers. At runtime, a process that boots a live trading
//! context marks it here and every pipeline refuses to start while the mark
//! is set. Structurally, [`scan_crate_sources`] walks a source tree and
//! reports any import line or manifest dependency that references the live
//! execution stack, so the build itself can prove the lab has no compile-time
//! path to a broker.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use thiserror::Error;

/// Crate and module name segments the lab must never import.
pub const DEFAULT_FORBIDDEN: &[&str] = &[
    "live_exec",
    "live_trading",
    "live_feed",
    "broker_gateway",
    "order_router",
];

static LIVE_CONTEXT: AtomicBool = AtomicBool::new(false);
static LIVE_ORIGIN: Mutex<Option<String>> = Mutex::new(None);

#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("live trading context active in this process (marked by `{origin}`)")]
    LiveContextActive { origin: String },
    #[error("{count} forbidden reference(s) in source tree; first: {first}")]
    ForbiddenReferences { count: usize, first: String },
    #[error("scan failed under {path}: {source}")]
    ScanIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Record that this process hosts a live trading context. Pipelines started
/// after this call fail their lab-mode assertion.
pub fn mark_live_context(origin: &str) {
    if let Ok(mut slot) = LIVE_ORIGIN.lock() {
        *slot = Some(origin.to_string());
    }
    LIVE_CONTEXT.store(true, Ordering::SeqCst);
    tracing::error!(origin, "live trading context marked in this process");
}

/// Drop the live-context mark. Embedding hosts call this on teardown.
pub fn clear_live_context() {
    LIVE_CONTEXT.store(false, Ordering::SeqCst);
    if let Ok(mut slot) = LIVE_ORIGIN.lock() {
        *slot = None;
    }
}

pub fn in_live_context() -> bool {
    LIVE_CONTEXT.load(Ordering::SeqCst)
}

/// Assert this process is a pure lab. Called on every pipeline start and
/// again around strategy evaluation.
pub fn ensure_lab_mode() -> Result<(), IsolationError> {
    if !LIVE_CONTEXT.load(Ordering::SeqCst) {
        return Ok(());
    }
    let origin = LIVE_ORIGIN
        .lock()
        .ok()
        .and_then(|slot| slot.clone())
        .unwrap_or_else(|| "unknown".to_string());
    tracing::error!(origin, "lab pipeline blocked: live trading context active");
    Err(IsolationError::LiveContextActive { origin })
}

/// One offending line found by the structural scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFinding {
    pub file: PathBuf,
    pub line: usize,
    pub needle: String,
    pub text: String,
}

/// Outcome of a structural scan over one source tree.
#[derive(Debug, Default, Clone)]
pub struct ScanReport {
    pub files_scanned: usize,
    pub findings: Vec<ScanFinding>,
}

impl ScanReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    /// Turn a dirty report into the error pipelines refuse to start on.
    pub fn into_result(self) -> Result<(), IsolationError> {
        if let Some(first) = self.findings.first() {
            return Err(IsolationError::ForbiddenReferences {
                count: self.findings.len(),
                first: format!(
                    "{}:{}: `{}`",
                    first.file.display(),
                    first.line,
                    first.text
                ),
            });
        }
        Ok(())
    }
}

/// Walk `root` and flag every `use`/`mod`/`extern crate` line in a `.rs` file
/// and every dependency key in a `Cargo.toml` that mentions a forbidden
/// segment. Only import surfaces are inspected, so string literals (such as
/// this module's own forbidden list) never match.
pub fn scan_crate_sources(root: &Path, forbidden: &[&str]) -> Result<ScanReport, IsolationError> {
    let mut report = ScanReport::default();
    walk(root, forbidden, &mut report)?;
    for finding in &report.findings {
        tracing::error!(
            file = %finding.file.display(),
            line = finding.line,
            needle = finding.needle,
            "forbidden live-trading reference"
        );
    }
    Ok(report)
}

fn walk(dir: &Path, forbidden: &[&str], report: &mut ScanReport) -> Result<(), IsolationError> {
    let entries = fs::read_dir(dir).map_err(|source| IsolationError::ScanIo {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| IsolationError::ScanIo {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if path.is_dir() {
            if name == "target" || name.starts_with('.') {
                continue;
            }
            walk(&path, forbidden, report)?;
        } else if name == "Cargo.toml" {
            scan_file(&path, forbidden, FileKind::Manifest, report)?;
        } else if name.ends_with(".rs") {
            scan_file(&path, forbidden, FileKind::Rust, report)?;
        }
    }
    Ok(())
}

#[derive(Clone, Copy)]
enum FileKind {
    Rust,
    Manifest,
}

fn scan_file(
    path: &Path,
    forbidden: &[&str],
    kind: FileKind,
    report: &mut ScanReport,
) -> Result<(), IsolationError> {
    let text = fs::read_to_string(path).map_err(|source| IsolationError::ScanIo {
        path: path.to_path_buf(),
        source,
    })?;
    report.files_scanned += 1;
    let mut in_dep_section = false;
    for (i, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        let needle = match kind {
            FileKind::Manifest => {
                if trimmed.starts_with('[') && trimmed.ends_with(']') {
                    in_dep_section = trimmed.contains("dependencies");
                    continue;
                }
                if !in_dep_section {
                    continue;
                }
                scan_manifest_line(line, forbidden)
            }
            FileKind::Rust => scan_import_line(line, forbidden),
        };
        if let Some(needle) = needle {
            report.findings.push(ScanFinding {
                file: path.to_path_buf(),
                line: i + 1,
                needle,
                text: trimmed.to_string(),
            });
        }
    }
    Ok(())
}

/// Match a forbidden segment inside a `use`, `pub use`, `mod`, or
/// `extern crate` line. Anything else (literals, comments, identifiers in
/// expressions) is out of scope for the structural check.
fn scan_import_line(line: &str, forbidden: &[&str]) -> Option<String> {
    let mut t = line.trim_start();
    for prefix in ["pub(crate) ", "pub(super) ", "pub "] {
        if let Some(rest) = t.strip_prefix(prefix) {
            t = rest;
            break;
        }
    }
    let path = if let Some(rest) = t.strip_prefix("use ") {
        rest
    } else if let Some(rest) = t.strip_prefix("extern crate ") {
        rest
    } else if let Some(rest) = t.strip_prefix("mod ") {
        rest
    } else {
        return None;
    };
    forbidden
        .iter()
        .find(|needle| path.contains(**needle))
        .map(|n| n.to_string())
}

/// Match a forbidden segment in a manifest dependency key. Hyphens are
/// normalized to underscores so `broker-gateway = "1"` is caught.
fn scan_manifest_line(line: &str, forbidden: &[&str]) -> Option<String> {
    let key = line.split('=').next()?.trim().trim_matches('"');
    if key.is_empty() || key.starts_with('#') {
        return None;
    }
    let normalized = key.replace('-', "_");
    forbidden
        .iter()
        .find(|needle| normalized.contains(**needle))
        .map(|n| n.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_lines_are_flagged() {
        assert_eq!(
            scan_import_line("use live_exec::OrderRouter;", DEFAULT_FORBIDDEN),
            Some("live_exec".to_string())
        );
        assert_eq!(
            scan_import_line("    pub use crate::broker_gateway::Client;", DEFAULT_FORBIDDEN),
            Some("broker_gateway".to_string())
        );
        assert_eq!(
            scan_import_line("mod live_feed;", DEFAULT_FORBIDDEN),
            Some("live_feed".to_string())
        );
        assert_eq!(
            scan_import_line("extern crate order_router;", DEFAULT_FORBIDDEN),
            Some("order_router".to_string())
        );
    }

    #[test]
    fn non_import_lines_are_ignored() {
        // The forbidden list itself lives in string literals like these.
        assert_eq!(
            scan_import_line("const X: &str = \"live_exec\";", DEFAULT_FORBIDDEN),
            None
        );
        assert_eq!(
            scan_import_line("// talks about broker_gateway in a comment", DEFAULT_FORBIDDEN),
            None
        );
        assert_eq!(
            scan_import_line("let live_exec_mode = false;", DEFAULT_FORBIDDEN),
            None
        );
    }

    #[test]
    fn clean_imports_pass() {
        assert_eq!(
            scan_import_line("use chrono::NaiveDateTime;", DEFAULT_FORBIDDEN),
            None
        );
        assert_eq!(scan_import_line("use crate::space::ParameterSpace;", DEFAULT_FORBIDDEN), None);
    }

    #[test]
    fn manifest_keys_are_flagged_with_hyphens() {
        assert_eq!(
            scan_manifest_line("broker-gateway = \"1.2\"", DEFAULT_FORBIDDEN),
            Some("broker_gateway".to_string())
        );
        assert_eq!(
            scan_manifest_line("live_exec = { path = \"../live\" }", DEFAULT_FORBIDDEN),
            Some("live_exec".to_string())
        );
        assert_eq!(scan_manifest_line("serde = \"1\"", DEFAULT_FORBIDDEN), None);
    }

    #[test]
    fn live_context_mark_blocks_and_clears() {
        // Single test owns the process-global flag to avoid races with
        // parallel test threads.
        assert!(ensure_lab_mode().is_ok());
        mark_live_context("session_bootstrap");
        assert!(in_live_context());
        let err = ensure_lab_mode().unwrap_err();
        assert!(matches!(err, IsolationError::LiveContextActive { ref origin } if origin == "session_bootstrap"));
        clear_live_context();
        assert!(!in_live_context());
        assert!(ensure_lab_mode().is_ok());
    }

    #[test]
    fn report_into_result() {
        let clean = ScanReport::default();
        assert!(clean.into_result().is_ok());

        let dirty = ScanReport {
            files_scanned: 1,
            findings: vec![ScanFinding {
                file: PathBuf::from("src/lib.rs"),
                line: 3,
                needle: "live_exec".into(),
                text: "use live_exec::Router;".into(),
            }],
        };
        let err = dirty.into_result().unwrap_err();
        assert!(matches!(
            err,
            IsolationError::ForbiddenReferences { count: 1, .. }
        ));
    }
}
