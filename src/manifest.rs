//! Run manifest: what each pipeline stage did and what it wrote
//!
//! ```text
//! RunManifest ─┬─ StageRecord (preprocess)  ─┬─ ArtifactRecord (lib_dfs.csv, rows, bytes)
//!              │                             └─ ...
//!              ├─ StageRecord (stratify)    ─── metrics, stratum counts per pair
//!              └─ ...
//! ```
//!
//! Written as pretty JSON to `<output_path>/manifest.json` when a run ends,
//! whether it succeeded or not.

use crate::stratify::StratumCounts;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Manifest file name under the output root
pub const MANIFEST_FILE: &str = "manifest.json";

/// Lifecycle of a run or a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Created, not started
    Pending,
    /// Executing
    Running,
    /// Finished without error
    Success,
    /// Aborted by an error
    Failed,
}

/// One artifact written by a stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactRecord {
    key: String,
    rows: usize,
    size_bytes: u64,
    created_at: DateTime<Utc>,
}

impl ArtifactRecord {
    /// Record for a file already on disk
    ///
    /// `key` is the path relative to `root` when it lies below it.
    ///
    /// # Errors
    /// Returns error if the file metadata cannot be read
    pub fn from_file(root: &Path, path: &Path, rows: usize) -> Result<Self> {
        let size_bytes = std::fs::metadata(path)
            .map_err(|e| {
                Error::StorageError(format!("Failed to stat artifact {}: {e}", path.display()))
            })?
            .len();
        let key = path.strip_prefix(root).unwrap_or(path);
        Ok(Self {
            key: key.display().to_string(),
            rows,
            size_bytes,
            created_at: Utc::now(),
        })
    }

    /// Path relative to the output root
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Data rows
    #[must_use]
    pub const fn rows(&self) -> usize {
        self.rows
    }

    /// File size
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Write time
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// One stage of a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageRecord {
    stage: String,
    status: RunStatus,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default)]
    artifacts: Vec<ArtifactRecord>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    strata: BTreeMap<String, StratumCounts>,
}

impl StageRecord {
    /// New stage in `Pending`
    #[must_use]
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            status: RunStatus::Pending,
            started_at: None,
            ended_at: None,
            error: None,
            artifacts: Vec::new(),
            metrics: BTreeMap::new(),
            strata: BTreeMap::new(),
        }
    }

    /// Stage name
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Current status
    #[must_use]
    pub const fn status(&self) -> RunStatus {
        self.status
    }

    /// Start timestamp
    #[must_use]
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// End timestamp
    #[must_use]
    pub const fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Error message of a failed stage
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Artifacts in write order
    #[must_use]
    pub fn artifacts(&self) -> &[ArtifactRecord] {
        &self.artifacts
    }

    /// Named scalar results (pass fractions, counts)
    #[must_use]
    pub const fn metrics(&self) -> &BTreeMap<String, f64> {
        &self.metrics
    }

    /// Stratum counts per condition code
    #[must_use]
    pub const fn strata(&self) -> &BTreeMap<String, StratumCounts> {
        &self.strata
    }

    /// Transition to `Running` and stamp the start time
    pub fn start(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Finish with the given status and stamp the end time
    pub fn complete(&mut self, status: RunStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }

    /// Finish as `Failed`, keeping the error message
    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.complete(RunStatus::Failed);
    }

    /// Append an artifact
    pub fn record_artifact(&mut self, artifact: ArtifactRecord) {
        self.artifacts.push(artifact);
    }

    /// Set a named metric, replacing an earlier value
    pub fn record_metric(&mut self, name: impl Into<String>, value: f64) {
        self.metrics.insert(name.into(), value);
    }

    /// Set the stratum counts of one condition pair
    pub fn record_strata(&mut self, code: impl Into<String>, counts: StratumCounts) {
        self.strata.insert(code.into(), counts);
    }
}

/// Every stage of one pipeline invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunManifest {
    run_id: String,
    status: RunStatus,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    stages: Vec<StageRecord>,
}

impl RunManifest {
    /// New manifest in `Pending`
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            status: RunStatus::Pending,
            started_at: None,
            ended_at: None,
            stages: Vec::new(),
        }
    }

    /// Run id derived from the current time, e.g. `run-20240131T120000Z`
    #[must_use]
    pub fn timestamp_id() -> String {
        format!("run-{}", Utc::now().format("%Y%m%dT%H%M%SZ"))
    }

    /// Run id
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Current status
    #[must_use]
    pub const fn status(&self) -> RunStatus {
        self.status
    }

    /// Start timestamp
    #[must_use]
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// End timestamp
    #[must_use]
    pub const fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Stages in execution order
    #[must_use]
    pub fn stages(&self) -> &[StageRecord] {
        &self.stages
    }

    /// Stage by name, the latest if it ran more than once
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().rev().find(|s| s.stage == name)
    }

    /// Transition to `Running` and stamp the start time
    pub fn start(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Finish with the given status and stamp the end time
    pub fn complete(&mut self, status: RunStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }

    /// Append a finished stage
    pub fn push_stage(&mut self, stage: StageRecord) {
        self.stages.push(stage);
    }

    /// Write as pretty JSON, creating parent directories
    ///
    /// # Errors
    /// Returns error if the file cannot be written
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), stages = self.stages.len(), "wrote manifest");
        Ok(())
    }

    /// Read a manifest written by [`RunManifest::write`]
    ///
    /// # Errors
    /// Returns error if the file is missing or not a manifest
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_lifecycle() {
        let mut stage = StageRecord::new("stratify");
        assert_eq!(stage.status(), RunStatus::Pending);
        stage.start();
        assert_eq!(stage.status(), RunStatus::Running);
        assert!(stage.started_at().is_some());
        stage.complete(RunStatus::Success);
        assert_eq!(stage.status(), RunStatus::Success);
        assert!(stage.ended_at() >= stage.started_at());
    }

    #[test]
    fn test_fail_keeps_message() {
        let mut stage = StageRecord::new("preprocess");
        stage.start();
        stage.fail("column not found");
        assert_eq!(stage.status(), RunStatus::Failed);
        assert_eq!(stage.error(), Some("column not found"));
    }

    #[test]
    fn test_artifact_key_is_relative() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stratified").join("CK1a_all_labels.csv");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "SMILES\nCCO\n").unwrap();

        let artifact = ArtifactRecord::from_file(dir.path(), &path, 1).unwrap();
        assert_eq!(
            Path::new(artifact.key()),
            Path::new("stratified").join("CK1a_all_labels.csv")
        );
        assert_eq!(artifact.size_bytes(), 11);
        assert_eq!(artifact.rows(), 1);
    }

    #[test]
    fn test_missing_artifact_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ArtifactRecord::from_file(dir.path(), &dir.path().join("nope.csv"), 0).is_err());
    }

    #[test]
    fn test_manifest_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = RunManifest::new("run-test");
        manifest.start();

        let mut stage = StageRecord::new("stratify");
        stage.start();
        stage.record_metric("CK1a.pass_fraction", 0.25);
        stage.record_strata(
            "CK1a",
            StratumCounts {
                orthosteric: 3,
                cryptic: 1,
                allosteric: 2,
                competitive: Some(1),
                unmatched_shared: 0,
            },
        );
        stage.complete(RunStatus::Success);
        manifest.push_stage(stage);
        manifest.complete(RunStatus::Success);

        let path = dir.path().join(MANIFEST_FILE);
        manifest.write(&path).unwrap();
        let back = RunManifest::read(&path).unwrap();
        assert_eq!(back, manifest);
        let stage = back.stage("stratify").unwrap();
        assert_eq!(stage.strata()["CK1a"].competitive, Some(1));
        assert_eq!(stage.metrics()["CK1a.pass_fraction"], 0.25);
    }

    #[test]
    fn test_timestamp_id_shape() {
        let id = RunManifest::timestamp_id();
        assert!(id.starts_with("run-"));
        assert!(id.ends_with('Z'));
        assert_eq!(id.len(), "run-20240131T120000Z".len());
    }
}
