//! Artifact persistence for heavy run outputs.
//!
//! Trade logs, equity curves, fold tables, and reports never travel through
//! job status or results payloads. They are written once under the owning
//! run's directory and referenced by name. A reference is
//! `<run id>_<type>_<content hash>`, so it is self-describing and stable:
//! the same payload always earns the same reference. Type labels are single
//! words; run ids contain underscores, so references parse right to left.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use paramlab_core::RunId;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("artifact serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("artifact csv encoding failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("artifact encoding failed: {0}")]
    Encode(String),
    #[error("malformed artifact reference `{reference}`")]
    BadReference { reference: String },
    #[error("artifact `{reference}` not found")]
    Missing { reference: String },
}

fn io_err(path: &Path, source: io::Error) -> ArtifactError {
    ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// What an artifact contains. The label is embedded in references and file
/// names, so labels stay single lowercase words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactKind {
    /// Per-trade log of the champion evaluation (CSV).
    Trades,
    /// Champion equity curve (CSV).
    Equity,
    /// Pipeline summary report (JSON).
    Report,
    /// Walk-forward fold table (CSV).
    Folds,
    /// Monte Carlo outcome distribution (CSV).
    Distribution,
    /// Regime segmentation of the series (CSV).
    Segments,
    /// Human-readable Markdown summary.
    Summary,
    /// Index of every artifact a run produced (JSON).
    Manifest,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 8] = [
        ArtifactKind::Trades,
        ArtifactKind::Equity,
        ArtifactKind::Report,
        ArtifactKind::Folds,
        ArtifactKind::Distribution,
        ArtifactKind::Segments,
        ArtifactKind::Summary,
        ArtifactKind::Manifest,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Trades => "trades",
            Self::Equity => "equity",
            Self::Report => "report",
            Self::Folds => "folds",
            Self::Distribution => "distribution",
            Self::Segments => "segments",
            Self::Summary => "summary",
            Self::Manifest => "manifest",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Trades | Self::Equity | Self::Folds | Self::Distribution | Self::Segments => {
                "csv"
            }
            Self::Report | Self::Manifest => "json",
            Self::Summary => "md",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ArtifactKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.label() == s)
            .ok_or(())
    }
}

/// Lightweight handle to one stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub kind: ArtifactKind,
    /// `<run id>_<type>_<hash>`; resolvable by any store holding the run.
    pub reference: String,
}

impl ArtifactRef {
    /// Split a reference into its run id, kind, and content hash.
    pub fn parse(reference: &str) -> Result<(RunId, ArtifactKind, &str), ArtifactError> {
        let bad = || ArtifactError::BadReference {
            reference: reference.to_string(),
        };
        let mut parts = reference.rsplitn(3, '_');
        let hash = parts.next().ok_or_else(bad)?;
        let label = parts.next().ok_or_else(bad)?;
        let run_id = parts.next().ok_or_else(bad)?;
        if hash.is_empty() || run_id.is_empty() || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(bad());
        }
        let kind = label.parse::<ArtifactKind>().map_err(|_| bad())?;
        Ok((RunId(run_id.to_string()), kind, hash))
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reference)
    }
}

/// Manifest document, itself stored as the run's final artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestDoc {
    run_id: RunId,
    artifacts: Vec<ArtifactRef>,
}

/// Filesystem-backed artifact store, one subdirectory per run.
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join(run_id.as_str())
    }

    fn path_of(&self, run_id: &RunId, kind: ArtifactKind, reference: &str) -> PathBuf {
        self.run_dir(run_id)
            .join(format!("{reference}.{}", kind.extension()))
    }

    /// Store raw bytes. The reference hashes the payload, so re-saving the
    /// same bytes yields the same reference and silently overwrites.
    pub fn save_bytes(
        &self,
        run_id: &RunId,
        kind: ArtifactKind,
        bytes: &[u8],
    ) -> Result<ArtifactRef, ArtifactError> {
        let hash = blake3::hash(bytes).to_hex().to_string();
        let reference = format!("{run_id}_{}_{}", kind.label(), &hash[..12]);
        let dir = self.run_dir(run_id);
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

        let path = self.path_of(run_id, kind, &reference);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(|e| io_err(&tmp, e))?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(&path, e));
        }
        Ok(ArtifactRef { kind, reference })
    }

    pub fn save_json<T: Serialize>(
        &self,
        run_id: &RunId,
        kind: ArtifactKind,
        value: &T,
    ) -> Result<ArtifactRef, ArtifactError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.save_bytes(run_id, kind, &bytes)
    }

    pub fn save_csv<T: Serialize>(
        &self,
        run_id: &RunId,
        kind: ArtifactKind,
        rows: &[T],
    ) -> Result<ArtifactRef, ArtifactError> {
        let bytes = csv_bytes(rows)?;
        self.save_bytes(run_id, kind, &bytes)
    }

    /// Write the run's manifest listing every other artifact it produced.
    pub fn write_manifest(
        &self,
        run_id: &RunId,
        artifacts: &[ArtifactRef],
    ) -> Result<ArtifactRef, ArtifactError> {
        let doc = ManifestDoc {
            run_id: run_id.clone(),
            artifacts: artifacts.to_vec(),
        };
        self.save_json(run_id, ArtifactKind::Manifest, &doc)
    }

    /// Resolve a reference to its on-disk path, verifying the file exists.
    pub fn resolve(&self, reference: &str) -> Result<(RunId, ArtifactKind, PathBuf), ArtifactError> {
        let (run_id, kind, _) = ArtifactRef::parse(reference)?;
        let path = self.path_of(&run_id, kind, reference);
        if !path.is_file() {
            return Err(ArtifactError::Missing {
                reference: reference.to_string(),
            });
        }
        Ok((run_id, kind, path))
    }

    pub fn load_bytes(&self, reference: &str) -> Result<Vec<u8>, ArtifactError> {
        let (_, _, path) = self.resolve(reference)?;
        fs::read(&path).map_err(|e| io_err(&path, e))
    }

    pub fn exists(&self, reference: &str) -> bool {
        ArtifactRef::parse(reference)
            .map(|(run_id, kind, _)| self.path_of(&run_id, kind, reference).is_file())
            .unwrap_or(false)
    }

    /// Remove every artifact a run produced. Absent runs are a no-op.
    pub fn purge_run(&self, run_id: &RunId) -> Result<(), ArtifactError> {
        let dir = self.run_dir(run_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&dir, e)),
        }
    }
}

/// Serialize rows to CSV in memory, headers from the row type.
pub fn csv_bytes<T: Serialize>(rows: &[T]) -> Result<Vec<u8>, ArtifactError> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.into_inner()
        .map_err(|e| ArtifactError::Encode(e.to_string()))
}
