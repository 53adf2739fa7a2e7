//! On-disk run artifacts.
//!
//! ```text
//! <runs_dir>/<run_id>/
//!     run.json                   RunManifest (atomic writes)
//!     predictions/shard-0000.jsonl
//!     predictions/shard-0001.jsonl
//!     metrics.json               RunMetrics, written once at completion
//! ```
//!
//! Shard logs are append-only JSONL, one [`Prediction`] per line. A crash can
//! leave a torn trailing line; readers ignore it and [`ShardWriter::open`]
//! truncates it away before appending, so every complete line stays valid.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::config::RunSpec;
use crate::error::AnalysisError;
use crate::fingerprint::FINGERPRINT_VERSION;
use crate::metrics;
use crate::persistence;
use crate::types::{DatasetVersion, Prediction, RunMetrics, RunStatus};

const MANIFEST_FILE: &str = "run.json";
const METRICS_FILE: &str = "metrics.json";
const PREDICTIONS_DIR: &str = "predictions";

/// Descriptor of a run, stored as `run.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub spec: RunSpec,
    pub dataset: DatasetVersion,
    pub code_version: String,
    pub fingerprint_version: u32,
    pub num_shards: u32,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Run ids whose logs were adopted by a forced resume.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub adopted_run_ids: Vec<String>,
}

impl RunManifest {
    pub fn new(
        run_id: impl Into<String>,
        spec: RunSpec,
        dataset: DatasetVersion,
        code_version: impl Into<String>,
        num_shards: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            spec,
            dataset,
            code_version: code_version.into(),
            fingerprint_version: FINGERPRINT_VERSION,
            num_shards,
            status: RunStatus::Running,
            created_at: now,
            updated_at: now,
            adopted_run_ids: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Complete
    }
}

/// Paths of one run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDir {
    root: PathBuf,
}

impl RunDir {
    /// The directory of `run_id` under `runs_dir`.
    pub fn new(runs_dir: &Path, run_id: &str) -> Self {
        Self {
            root: runs_dir.join(run_id),
        }
    }

    /// An explicit run directory.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.root.join(METRICS_FILE)
    }

    pub fn predictions_dir(&self) -> PathBuf {
        self.root.join(PREDICTIONS_DIR)
    }

    pub fn shard_path(&self, shard: u32) -> PathBuf {
        self.predictions_dir().join(format!("shard-{shard:04}.jsonl"))
    }

    pub fn load_manifest(&self) -> io::Result<Option<RunManifest>> {
        persistence::load_json(&self.manifest_path())
    }

    pub fn save_manifest(&self, manifest: &RunManifest) -> io::Result<()> {
        persistence::atomic_write_json(&self.manifest_path(), manifest)
    }

    pub fn load_metrics(&self) -> io::Result<Option<RunMetrics>> {
        persistence::load_json(&self.metrics_path())
    }

    pub fn save_metrics(&self, metrics: &RunMetrics) -> io::Result<()> {
        persistence::atomic_write_json(&self.metrics_path(), metrics)
    }

    /// Discard the predictions log and metrics, keeping the directory.
    pub fn reset(&self) -> io::Result<()> {
        match std::fs::remove_dir_all(self.predictions_dir()) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        match std::fs::remove_file(self.metrics_path()) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Shard log files present on disk, in shard order.
    fn shard_files(&self) -> io::Result<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(self.predictions_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_shard = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("shard-") && n.ends_with(".jsonl"));
            if is_shard {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Every complete prediction across all shard logs.
    ///
    /// Torn or unparseable lines are skipped with a warning. If an example id
    /// appears more than once the first record wins.
    pub fn read_predictions(&self) -> io::Result<Vec<Prediction>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for path in self.shard_files()? {
            for prediction in read_log(&path)? {
                if seen.insert(prediction.example_id.clone()) {
                    out.push(prediction);
                } else {
                    warn!(
                        example_id = %prediction.example_id,
                        path = %path.display(),
                        "Duplicate prediction ignored"
                    );
                }
            }
        }
        Ok(out)
    }

    /// Ids of examples that already have a prediction (or failed placeholder).
    pub fn completed_ids(&self) -> io::Result<HashSet<String>> {
        Ok(self
            .read_predictions()?
            .into_iter()
            .map(|p| p.example_id)
            .collect())
    }
}

/// Parse one shard log, ignoring a torn trailing line.
fn read_log(path: &Path) -> io::Result<Vec<Prediction>> {
    let bytes = std::fs::read(path)?;
    let complete = match bytes.iter().rposition(|b| *b == b'\n') {
        Some(last) => &bytes[..=last],
        None => &bytes[..0],
    };
    if complete.len() < bytes.len() {
        warn!(
            path = %path.display(),
            bytes = bytes.len() - complete.len(),
            "Ignoring torn trailing line in predictions log"
        );
    }

    let mut out = Vec::new();
    for (idx, line) in complete.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        match serde_json::from_slice::<Prediction>(line) {
            Ok(p) => out.push(p),
            Err(e) => warn!(
                path = %path.display(),
                line = idx + 1,
                error = %e,
                "Skipping unparseable prediction"
            ),
        }
    }
    Ok(out)
}

/// Appends predictions to one shard log.
pub struct ShardWriter {
    file: File,
    path: PathBuf,
}

impl ShardWriter {
    /// Open (or create) a shard log for appending, truncating a torn tail.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let keep = bytes
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |last| last + 1);
        if keep < bytes.len() {
            warn!(
                path = %path.display(),
                bytes = bytes.len() - keep,
                "Truncating torn trailing line before append"
            );
            file.set_len(keep as u64)?;
        }
        file.seek(SeekFrom::Start(keep as u64))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single write of one newline-terminated line.
    pub fn append(&mut self, prediction: &Prediction) -> io::Result<()> {
        let mut line = serde_json::to_vec(prediction).map_err(io::Error::other)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.flush()
    }
}

/// A run as consumed by the comparator and slice discovery.
#[derive(Debug, Clone)]
pub struct RunArtifact {
    pub dir: PathBuf,
    pub manifest: RunManifest,
    pub predictions: Vec<Prediction>,
    pub metrics: RunMetrics,
}

impl RunArtifact {
    /// Load a run directory.
    ///
    /// Runs that never reached completion load too (their metrics are folded
    /// from the log on the fly); callers decide whether to accept them.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, AnalysisError> {
        let run_dir = RunDir::at(dir.as_ref());
        let manifest = run_dir
            .load_manifest()?
            .ok_or_else(|| AnalysisError::MissingArtifact {
                path: run_dir.manifest_path(),
            })?;
        let predictions = run_dir.read_predictions()?;
        let metrics = match run_dir.load_metrics()? {
            Some(metrics) if manifest.is_complete() => metrics,
            _ => metrics::aggregate(&predictions),
        };
        Ok(Self {
            dir: run_dir.root().to_path_buf(),
            manifest,
            predictions,
            metrics,
        })
    }

    /// Assemble an in-memory artifact, folding metrics from `predictions`.
    pub fn from_predictions(manifest: RunManifest, predictions: Vec<Prediction>) -> Self {
        let metrics = metrics::aggregate(&predictions);
        Self {
            dir: PathBuf::new(),
            manifest,
            predictions,
            metrics,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.manifest.run_id
    }

    pub fn is_complete(&self) -> bool {
        self.manifest.is_complete()
    }

    /// Fail unless every prediction carries a correctness flag.
    pub fn require_correctness(&self) -> Result<(), AnalysisError> {
        let unscored = self
            .predictions
            .iter()
            .filter(|p| p.correct.is_none())
            .count();
        if unscored > 0 {
            return Err(AnalysisError::SchemaMismatch {
                run_id: self.run_id().to_string(),
                reason: format!(
                    "{unscored} of {} predictions have no correctness flag",
                    self.predictions.len()
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Example, Generation, Score};
    use tempfile::TempDir;

    fn prediction(id: &str, correct: bool) -> Prediction {
        let ex = Example::new(id).with_metadata("subject", "math");
        Prediction::scored(
            &ex,
            Generation::text("x"),
            Score {
                correct: Some(correct),
                ..Default::default()
            },
            0,
            false,
        )
    }

    fn manifest(run_id: &str) -> RunManifest {
        RunManifest::new(
            run_id,
            RunSpec::new("bench", "test", "mock:m", "v1"),
            DatasetVersion {
                name: "bench".into(),
                version: "1".into(),
                split: "test".into(),
                num_examples: Some(3),
                content_hash: "00".into(),
            },
            "c1",
            2,
        )
    }

    #[test]
    fn test_layout() {
        let dir = RunDir::new(Path::new("/runs"), "abc");
        assert_eq!(dir.manifest_path(), Path::new("/runs/abc/run.json"));
        assert_eq!(
            dir.shard_path(3),
            Path::new("/runs/abc/predictions/shard-0003.jsonl")
        );
    }

    #[test]
    fn test_append_and_read_across_shards() {
        let tmp = TempDir::new().unwrap();
        let dir = RunDir::at(tmp.path());
        let mut w0 = ShardWriter::open(&dir.shard_path(0)).unwrap();
        let mut w1 = ShardWriter::open(&dir.shard_path(1)).unwrap();
        w0.append(&prediction("a", true)).unwrap();
        w1.append(&prediction("b", false)).unwrap();
        w0.append(&prediction("c", true)).unwrap();

        let ids: Vec<String> = dir
            .read_predictions()
            .unwrap()
            .into_iter()
            .map(|p| p.example_id)
            .collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
        assert_eq!(dir.completed_ids().unwrap().len(), 3);
    }

    #[test]
    fn test_torn_line_ignored_then_truncated() {
        let tmp = TempDir::new().unwrap();
        let dir = RunDir::at(tmp.path());
        let path = dir.shard_path(0);
        {
            let mut w = ShardWriter::open(&path).unwrap();
            w.append(&prediction("a", true)).unwrap();
        }
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"example_id\":\"b\",\"raw_out").unwrap();
        drop(f);

        assert_eq!(dir.read_predictions().unwrap().len(), 1);

        let mut w = ShardWriter::open(&path).unwrap();
        w.append(&prediction("b", true)).unwrap();
        let ids: Vec<String> = dir
            .read_predictions()
            .unwrap()
            .into_iter()
            .map(|p| p.example_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_duplicate_ids_first_wins() {
        let tmp = TempDir::new().unwrap();
        let dir = RunDir::at(tmp.path());
        let mut w = ShardWriter::open(&dir.shard_path(0)).unwrap();
        w.append(&prediction("a", true)).unwrap();
        w.append(&prediction("a", false)).unwrap();
        let preds = dir.read_predictions().unwrap();
        assert_eq!(preds.len(), 1);
        assert_eq!(preds[0].correct, Some(true));
    }

    #[test]
    fn test_reset_discards_log() {
        let tmp = TempDir::new().unwrap();
        let dir = RunDir::at(tmp.path());
        ShardWriter::open(&dir.shard_path(0))
            .unwrap()
            .append(&prediction("a", true))
            .unwrap();
        dir.save_metrics(&RunMetrics::default()).unwrap();
        dir.reset().unwrap();
        assert!(dir.read_predictions().unwrap().is_empty());
        assert!(dir.load_metrics().unwrap().is_none());
        dir.reset().unwrap();
    }

    #[test]
    fn test_artifact_load_missing_manifest() {
        let tmp = TempDir::new().unwrap();
        let err = RunArtifact::load(tmp.path()).unwrap_err();
        assert!(matches!(err, AnalysisError::MissingArtifact { .. }));
    }

    #[test]
    fn test_artifact_load_folds_metrics_for_running_run() {
        let tmp = TempDir::new().unwrap();
        let dir = RunDir::at(tmp.path());
        dir.save_manifest(&manifest("r1")).unwrap();
        let mut w = ShardWriter::open(&dir.shard_path(0)).unwrap();
        w.append(&prediction("a", true)).unwrap();
        w.append(&prediction("b", false)).unwrap();

        let artifact = RunArtifact::load(tmp.path()).unwrap();
        assert!(!artifact.is_complete());
        assert_eq!(artifact.metrics.total, 2);
        assert!((artifact.metrics.overall_accuracy - 0.5).abs() < 1e-12);
        artifact.require_correctness().unwrap();
    }

    #[test]
    fn test_require_correctness() {
        let tmp = TempDir::new().unwrap();
        let dir = RunDir::at(tmp.path());
        dir.save_manifest(&manifest("r2")).unwrap();
        let unscored = Prediction::failed(&Example::new("x"), "boom", 0);
        ShardWriter::open(&dir.shard_path(0))
            .unwrap()
            .append(&unscored)
            .unwrap();
        let artifact = RunArtifact::load(tmp.path()).unwrap();
        assert!(matches!(
            artifact.require_correctness(),
            Err(AnalysisError::SchemaMismatch { .. })
        ));
    }
}
