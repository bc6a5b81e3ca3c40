//! Isolation guard behavior at the queue boundary: the runtime live-context
//! mark blocks job starts, and the structural scan proves the lab crates
//! never import the live execution stack.
//!
//! The live-context mark is process-global, so exactly one test here touches
//! it; the scan tests only read the filesystem.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use tempfile::TempDir;

use paramlab_core::data::synthetic_drift;
use paramlab_core::guard::{
    clear_live_context, mark_live_context, scan_crate_sources, IsolationError, DEFAULT_FORBIDDEN,
};
use paramlab_core::{CandleDataset, Timeframe};

use paramlab_runner::{
    DimensionSpec, FailureKind, JobSpec, JobStatus, MemoryStore, OptimizationJobQueue,
    PipelineKind, StartError,
};

const POISONED_MAIN: &str =
    "use broker_gateway::Client;\nmod live_trading;\nfn main() {}\n";
const POISONED_MANIFEST: &str =
    "[package]\nname = \"poisoned\"\n\n[dependencies]\nlive_feed_client = \"1\"\n";
const CLEAN_MAIN: &str = "use chrono::NaiveDateTime;\nfn main() {}\n";
const CLEAN_MANIFEST: &str = "[package]\nname = \"tidy\"\n\n[dependencies]\nchrono = \"0.4\"\n";

fn t0() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

fn grid_spec(bars: u32) -> JobSpec {
    let mut spec = JobSpec::new(
        PipelineKind::GridSearch,
        vec!["BTCUSD".into()],
        Timeframe::H1,
        t0(),
        t0() + Timeframe::H1.duration() * bars as i32,
    );
    spec.dimensions = vec![
        DimensionSpec::numeric("fast", 3.0, 7.0, 2.0, 5.0),
        DimensionSpec::numeric("slow", 12.0, 20.0, 4.0, 16.0),
    ];
    spec
}

fn fixture_crate(dir: &TempDir, main_rs: &str, manifest: &str) {
    let root = dir.path();
    fs::create_dir_all(root.join("src")).unwrap();
    fs::write(root.join("src/main.rs"), main_rs).unwrap();
    fs::write(root.join("Cargo.toml"), manifest).unwrap();
}

#[test]
fn live_context_blocks_job_starts() {
    let mut store = MemoryStore::new();
    let candles = synthetic_drift(Timeframe::H1, t0(), 2_000, 11, 0.05);
    let (dataset, _) = CandleDataset::new_lenient("BTCUSD", Timeframe::H1, candles);
    store.insert(dataset);

    let dir = TempDir::new().unwrap();
    let queue = OptimizationJobQueue::new(Arc::new(store), dir.path()).unwrap();

    mark_live_context("paper_trader_session");
    let err = queue.start(grid_spec(1_200)).unwrap_err();
    assert_eq!(err.failure_kind(), FailureKind::Isolation);
    assert!(matches!(
        err,
        StartError::Isolation(IsolationError::LiveContextActive { ref origin })
            if origin == "paper_trader_session"
    ));
    // Refused before any record was written.
    assert!(queue
        .registry()
        .latest(PipelineKind::GridSearch)
        .unwrap()
        .is_none());

    clear_live_context();
    queue.start(grid_spec(1_200)).unwrap();
    let report = queue.wait_terminal(PipelineKind::GridSearch, Duration::from_secs(30));
    assert_eq!(report.status, JobStatus::Completed);
}

#[test]
fn scan_flags_forbidden_imports_and_deps() {
    let dir = TempDir::new().unwrap();
    fixture_crate(&dir, POISONED_MAIN, POISONED_MANIFEST);

    let report = scan_crate_sources(dir.path(), DEFAULT_FORBIDDEN).unwrap();
    assert_eq!(report.files_scanned, 2);
    assert_eq!(report.findings.len(), 3);

    let needles: Vec<&str> = report.findings.iter().map(|f| f.needle.as_str()).collect();
    assert!(needles.contains(&"broker_gateway"));
    assert!(needles.contains(&"live_trading"));
    assert!(needles.contains(&"live_feed"));

    let err = report.into_result().unwrap_err();
    assert!(matches!(
        err,
        IsolationError::ForbiddenReferences { count: 3, .. }
    ));
}

#[test]
fn scan_passes_a_clean_tree() {
    let dir = TempDir::new().unwrap();
    fixture_crate(&dir, CLEAN_MAIN, CLEAN_MANIFEST);

    let report = scan_crate_sources(dir.path(), DEFAULT_FORBIDDEN).unwrap();
    assert_eq!(report.files_scanned, 2);
    assert!(report.is_clean());
    assert!(report.into_result().is_ok());
}

#[test]
fn workspace_crates_have_no_live_trading_imports() {
    let workspace = Path::new(env!("CARGO_MANIFEST_DIR")).parent().unwrap();
    for member in ["paramlab-core", "paramlab-runner", "paramlab-cli"] {
        let root = workspace.join(member);
        let report = scan_crate_sources(&root, DEFAULT_FORBIDDEN).unwrap();
        assert!(report.files_scanned > 0, "{member}: nothing scanned");
        assert!(
            report.is_clean(),
            "{member}: forbidden references {:?}",
            report.findings
        );
    }
}
