//! Durable job records.
//!
//! Every run owns one JSON file under the registry root, rewritten atomically
//! at each heartbeat. Liveness is inferred, not tracked: a record that claims
//! to be active but whose heartbeat is older than the staleness window is
//! treated as a crashed process, flipped to ERROR on read, and persisted that
//! way. Abort requests travel as marker files next to the records so a second
//! process (the CLI) can reach a worker it does not share memory with.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDateTime, Utc};
use thiserror::Error;

use paramlab_core::RunId;

use crate::job::{ErrorRecord, FailureKind, JobRecord, PipelineKind};

/// Heartbeats older than this mark the owning process as dead.
pub const DEFAULT_STALE_AFTER_SECS: i64 = 180;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("job record is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("no job record for run `{run_id}`")]
    NotFound { run_id: RunId },
}

fn io_err(path: &Path, source: io::Error) -> RegistryError {
    RegistryError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug)]
pub struct JobRegistry {
    root: PathBuf,
    stale_after: Duration,
}

impl JobRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        Self::with_stale_after(root, DEFAULT_STALE_AFTER_SECS)
    }

    pub fn with_stale_after(
        root: impl Into<PathBuf>,
        stale_after_secs: i64,
    ) -> Result<Self, RegistryError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
        Ok(Self {
            root,
            stale_after: Duration::seconds(stale_after_secs.max(1)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, run_id: &RunId) -> PathBuf {
        self.root.join(format!("{run_id}.json"))
    }

    fn abort_path(&self, run_id: &RunId) -> PathBuf {
        self.root.join(format!("{run_id}.abort"))
    }

    /// Persist a record atomically: write a sidecar, then rename over the
    /// real file so a crash mid-write never leaves a torn record behind.
    pub fn save(&self, record: &JobRecord) -> Result<(), RegistryError> {
        let path = self.record_path(&record.run_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record)?;
        fs::write(&tmp, bytes).map_err(|e| io_err(&tmp, e))?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(&path, e));
        }
        Ok(())
    }

    /// Load one record, applying (and persisting) crash inference.
    pub fn load(&self, run_id: &RunId) -> Result<JobRecord, RegistryError> {
        let path = self.record_path(run_id);
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                RegistryError::NotFound {
                    run_id: run_id.clone(),
                }
            } else {
                io_err(&path, e)
            }
        })?;
        let mut record: JobRecord = serde_json::from_slice(&bytes)?;
        if self.infer_crash(&mut record, Utc::now().naive_utc()) {
            self.save(&record)?;
        }
        Ok(record)
    }

    /// All parseable records, oldest start first. Unreadable or malformed
    /// files are skipped so one corrupt record cannot take down every status
    /// query in the lab.
    pub fn load_all(&self) -> Result<Vec<JobRecord>, RegistryError> {
        let entries = fs::read_dir(&self.root).map_err(|e| io_err(&self.root, e))?;
        let now = Utc::now().naive_utc();
        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&self.root, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            let mut record: JobRecord = match serde_json::from_slice(&bytes) {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "skipping malformed job record");
                    continue;
                }
            };
            if self.infer_crash(&mut record, now) {
                self.save(&record)?;
            }
            records.push(record);
        }
        records.sort_by_key(|r| r.started_at);
        Ok(records)
    }

    /// Most recently started record of one pipeline kind.
    pub fn latest(&self, kind: PipelineKind) -> Result<Option<JobRecord>, RegistryError> {
        Ok(self
            .load_all()?
            .into_iter()
            .filter(|r| r.kind == kind)
            .max_by_key(|r| r.started_at))
    }

    /// If the record claims to be active but its heartbeat is stale, the
    /// owning process is gone. Flip to ERROR in place; returns whether the
    /// record changed. The heartbeat instant doubles as the best estimate of
    /// when the job died.
    fn infer_crash(&self, record: &mut JobRecord, now: NaiveDateTime) -> bool {
        if !record.status.is_active() {
            return false;
        }
        let silent_for = now - record.heartbeat_at;
        if silent_for <= self.stale_after {
            return false;
        }
        tracing::warn!(
            run_id = %record.run_id,
            heartbeat_at = %record.heartbeat_at,
            silent_secs = silent_for.num_seconds(),
            "stale heartbeat, marking job as crashed"
        );
        record.mark_error(
            ErrorRecord::new(
                FailureKind::CrashInferred,
                format!(
                    "no heartbeat for {}s (last at {})",
                    silent_for.num_seconds(),
                    record.heartbeat_at
                ),
                now,
            ),
            record.heartbeat_at,
        );
        true
    }

    /// Leave an abort marker for the run. The owning worker polls for it at
    /// heartbeat cadence, so this works across processes.
    pub fn request_abort(&self, run_id: &RunId) -> Result<(), RegistryError> {
        let path = self.abort_path(run_id);
        fs::write(&path, b"abort\n").map_err(|e| io_err(&path, e))
    }

    pub fn abort_requested(&self, run_id: &RunId) -> bool {
        self.abort_path(run_id).exists()
    }

    pub fn clear_abort(&self, run_id: &RunId) {
        let _ = fs::remove_file(self.abort_path(run_id));
    }

    /// Drop terminal records (and their abort markers) finished before the
    /// cutoff. Active records are never touched. Returns how many were
    /// removed.
    pub fn purge_finished_before(&self, cutoff: NaiveDateTime) -> Result<usize, RegistryError> {
        let mut removed = 0;
        for record in self.load_all()? {
            if record.status.is_active() {
                continue;
            }
            let finished = record.finished_at.unwrap_or(record.heartbeat_at);
            if finished >= cutoff {
                continue;
            }
            let path = self.record_path(&record.run_id);
            fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
            self.clear_abort(&record.run_id);
            removed += 1;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobStatus, PipelineKind};
    use chrono::NaiveDate;
    use paramlab_core::SpecHash;
    use tempfile::TempDir;

    fn past_instant() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    fn record(kind: PipelineKind, started_at: NaiveDateTime) -> JobRecord {
        let run_id = RunId::generate(kind.label(), &SpecHash("feed".into()), started_at);
        JobRecord::starting(run_id, kind, SpecHash("feed".into()), vec!["BTCUSDT".into()], started_at)
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let registry = JobRegistry::new(dir.path()).unwrap();

        let mut rec = record(PipelineKind::GridSearch, past_instant());
        rec.heartbeat_at = Utc::now().naive_utc();
        registry.save(&rec).unwrap();

        let loaded = registry.load(&rec.run_id).unwrap();
        assert_eq!(loaded.run_id, rec.run_id);
        assert_eq!(loaded.status, JobStatus::Starting);
    }

    #[test]
    fn missing_record_is_not_found() {
        let dir = TempDir::new().unwrap();
        let registry = JobRegistry::new(dir.path()).unwrap();
        let ghost = RunId("grid_search-20240301T090000-deadbeef00".into());
        assert!(matches!(
            registry.load(&ghost),
            Err(RegistryError::NotFound { .. })
        ));
    }

    #[test]
    fn load_all_skips_malformed_files() {
        let dir = TempDir::new().unwrap();
        let registry = JobRegistry::new(dir.path()).unwrap();

        let mut rec = record(PipelineKind::GridSearch, past_instant());
        rec.heartbeat_at = Utc::now().naive_utc();
        registry.save(&rec).unwrap();
        fs::write(dir.path().join("broken.json"), b"{ not json").unwrap();

        let all = registry.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].run_id, rec.run_id);
    }

    #[test]
    fn latest_picks_newest_start_of_kind() {
        let dir = TempDir::new().unwrap();
        let registry = JobRegistry::new(dir.path()).unwrap();
        let now = Utc::now().naive_utc();

        let mut early = record(PipelineKind::GridSearch, past_instant());
        early.heartbeat_at = now;
        let mut late = record(PipelineKind::GridSearch, past_instant() + Duration::hours(2));
        late.heartbeat_at = now;
        let mut other = record(PipelineKind::Regime, past_instant() + Duration::hours(5));
        other.heartbeat_at = now;
        for rec in [&early, &late, &other] {
            registry.save(rec).unwrap();
        }

        let latest = registry.latest(PipelineKind::GridSearch).unwrap().unwrap();
        assert_eq!(latest.run_id, late.run_id);
        assert!(registry.latest(PipelineKind::MonteCarlo).unwrap().is_none());
    }

    #[test]
    fn stale_heartbeat_is_inferred_as_crash_and_persisted() {
        let dir = TempDir::new().unwrap();
        let registry = JobRegistry::with_stale_after(dir.path(), 60).unwrap();

        // Heartbeat frozen in 2024; anything active this long ago is dead.
        let mut rec = record(PipelineKind::WalkForward, past_instant());
        rec.status = JobStatus::Running;
        registry.save(&rec).unwrap();

        let loaded = registry.load(&rec.run_id).unwrap();
        assert_eq!(loaded.status, JobStatus::Error);
        let err = loaded.error.as_ref().unwrap();
        assert_eq!(err.kind, FailureKind::CrashInferred);
        assert_eq!(loaded.finished_at, Some(rec.heartbeat_at));

        // The inference was written back, not just reported.
        let raw = fs::read_to_string(registry.root().join(format!("{}.json", rec.run_id))).unwrap();
        assert!(raw.contains("\"ERROR\""));
    }

    #[test]
    fn fresh_heartbeat_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let registry = JobRegistry::with_stale_after(dir.path(), 60).unwrap();

        let mut rec = record(PipelineKind::MonteCarlo, past_instant());
        rec.status = JobStatus::Running;
        rec.heartbeat_at = Utc::now().naive_utc();
        registry.save(&rec).unwrap();

        let loaded = registry.load(&rec.run_id).unwrap();
        assert_eq!(loaded.status, JobStatus::Running);
        assert!(loaded.error.is_none());
    }

    #[test]
    fn terminal_records_are_never_reinferred() {
        let dir = TempDir::new().unwrap();
        let registry = JobRegistry::with_stale_after(dir.path(), 60).unwrap();

        let mut rec = record(PipelineKind::Portfolio, past_instant());
        rec.status = JobStatus::Completed;
        rec.finished_at = Some(past_instant() + Duration::minutes(10));
        registry.save(&rec).unwrap();

        let loaded = registry.load(&rec.run_id).unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
        assert!(loaded.error.is_none());
    }

    #[test]
    fn abort_marker_round_trips() {
        let dir = TempDir::new().unwrap();
        let registry = JobRegistry::new(dir.path()).unwrap();
        let rec = record(PipelineKind::GridSearch, past_instant());

        assert!(!registry.abort_requested(&rec.run_id));
        registry.request_abort(&rec.run_id).unwrap();
        assert!(registry.abort_requested(&rec.run_id));
        registry.clear_abort(&rec.run_id);
        assert!(!registry.abort_requested(&rec.run_id));
    }

    #[test]
    fn purge_drops_old_terminal_records_only() {
        let dir = TempDir::new().unwrap();
        let registry = JobRegistry::with_stale_after(dir.path(), 3600).unwrap();
        let now = Utc::now().naive_utc();

        let mut old_done = record(PipelineKind::GridSearch, past_instant());
        old_done.status = JobStatus::Completed;
        old_done.finished_at = Some(past_instant());
        registry.save(&old_done).unwrap();

        let mut live = record(PipelineKind::Regime, now);
        live.status = JobStatus::Running;
        live.heartbeat_at = now;
        registry.save(&live).unwrap();

        let removed = registry.purge_finished_before(now - Duration::days(1)).unwrap();
        assert_eq!(removed, 1);

        assert!(matches!(
            registry.load(&old_done.run_id),
            Err(RegistryError::NotFound { .. })
        ));
        assert_eq!(registry.load(&live.run_id).unwrap().status, JobStatus::Running);
    }
}
