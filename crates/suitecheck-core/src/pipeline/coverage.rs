//! Coverage collection, merging and publication.
//!
//! Every matrix job merges the `*.json` line-hit files its stages dropped
//! into `SUITECHECK_COVERAGE_DIR` and uploads the result as
//! `coverage-<os>-<runtime>.json`. After all jobs finish, the aggregation
//! step merges whatever per-job reports exist and publishes them through a
//! `CoverageSink`.
//!
//! Report format:
//!
//! ```json
//! { "files": { "cylc/flow/cfgspec.py": { "12": 3, "13": 0 } } }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};
use crate::pipeline::artifacts::ArtifactStore;
use crate::pipeline::concurrency::RunHandle;
use crate::pipeline::matrix::MERGED_COVERAGE;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageReport {
    /// file -> line -> hit count
    #[serde(default)]
    pub files: BTreeMap<String, BTreeMap<u32, u64>>,
}

impl CoverageReport {
    pub fn from_json(bytes: &[u8]) -> HarnessResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| HarnessError::Parse(format!("Failed to parse coverage report: {}", e)))
    }

    pub fn to_json(&self) -> HarnessResult<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| HarnessError::Artifact(format!("serialize coverage: {}", e)))
    }

    /// Sum hit counts line by line.
    pub fn merge(&mut self, other: &CoverageReport) {
        for (file, lines) in &other.files {
            let target = self.files.entry(file.clone()).or_default();
            for (line, hits) in lines {
                *target.entry(*line).or_insert(0) += hits;
            }
        }
    }

    /// Merge every `*.json` file directly under `dir`. A missing directory
    /// yields an empty report.
    pub fn from_dir(dir: &Path) -> HarnessResult<Self> {
        let mut merged = CoverageReport::default();
        if !dir.is_dir() {
            return Ok(merged);
        }
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().map(|x| x == "json").unwrap_or(false))
            .collect();
        paths.sort();
        for path in paths {
            let bytes = std::fs::read(&path)?;
            let report = Self::from_json(&bytes).map_err(|e| {
                HarnessError::Parse(format!("{}: {}", path.display(), e))
            })?;
            merged.merge(&report);
        }
        Ok(merged)
    }

    pub fn line_count(&self) -> usize {
        self.files.values().map(BTreeMap::len).sum()
    }

    /// Fraction of recorded lines hit at least once; `None` when empty.
    pub fn line_rate(&self) -> Option<f64> {
        let total = self.line_count();
        if total == 0 {
            return None;
        }
        let hit = self
            .files
            .values()
            .flat_map(|lines| lines.values())
            .filter(|h| **h > 0)
            .count();
        Some(hit as f64 / total as f64)
    }
}

/// Destination for the merged report.
pub trait CoverageSink: Send + Sync {
    /// Publish `report`; returns a human-readable location.
    fn publish(&self, report: &CoverageReport, token: &str) -> HarnessResult<String>;
}

/// Publishes into a local directory, one file per upload.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

impl CoverageSink for DirectorySink {
    fn publish(&self, report: &CoverageReport, token: &str) -> HarnessResult<String> {
        if token.trim().is_empty() {
            return Err(HarnessError::Upload("empty upload token".to_string()));
        }
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| HarnessError::Upload(format!("{}: {}", self.dir.display(), e)))?;
        let path = self
            .dir
            .join(format!("coverage-{}.json", chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f")));
        std::fs::write(&path, report.to_json()?)
            .map_err(|e| HarnessError::Upload(format!("{}: {}", path.display(), e)))?;
        Ok(path.display().to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum UploadOutcome {
    Published { location: String },
    /// Fork pull requests have no access to the token
    SkippedFork,
    /// Nothing to publish
    SkippedEmpty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateReport {
    pub merged_from: Vec<String>,
    /// Expected per-job artifacts that were never uploaded
    pub missing: Vec<String>,
    /// Per-job artifacts that were uploaded but could not be parsed
    #[serde(default)]
    pub invalid: Vec<String>,
    pub line_rate: Option<f64>,
    pub upload: UploadOutcome,
}

/// Inputs for the post-matrix aggregation step.
pub struct Aggregation<'a> {
    pub store: &'a ArtifactStore,
    pub run: &'a RunHandle,
    /// Per-job artifact names that should exist
    pub expected: &'a [String],
    pub token: Option<&'a str>,
    pub fork: bool,
    pub sink: &'a dyn CoverageSink,
}

impl Aggregation<'_> {
    /// Merge per-job reports and publish them. Missing or unreadable per-job
    /// reports are tolerated; a missing token is not, except on fork pull
    /// requests.
    pub async fn run(&self) -> HarnessResult<AggregateReport> {
        let mut merged = CoverageReport::default();
        let mut merged_from = Vec::new();
        let mut missing = Vec::new();
        let mut invalid = Vec::new();

        for name in self.expected {
            match self.store.download(name).await {
                Ok(bytes) => match CoverageReport::from_json(&bytes) {
                    Ok(report) => {
                        merged.merge(&report);
                        merged_from.push(name.clone());
                    }
                    Err(e) => {
                        tracing::warn!("[Coverage] Ignoring unreadable {}: {}", name, e);
                        invalid.push(name.clone());
                    }
                },
                Err(HarnessError::Artifact(_)) => {
                    tracing::warn!("[Coverage] No coverage uploaded as {}, skipping", name);
                    missing.push(name.clone());
                }
                Err(e) => return Err(e),
            }
        }

        if !merged_from.is_empty() {
            self.store.upload(self.run, MERGED_COVERAGE, &merged.to_json()?).await?;
        }

        let upload = if merged_from.is_empty() {
            UploadOutcome::SkippedEmpty
        } else {
            match self.token.filter(|t| !t.trim().is_empty()) {
                Some(token) => {
                    let location = self.sink.publish(&merged, token)?;
                    tracing::info!("[Coverage] Published merged report to {}", location);
                    UploadOutcome::Published { location }
                }
                None if self.fork => {
                    tracing::warn!("[Coverage] Fork pull request has no upload token; not publishing");
                    UploadOutcome::SkippedFork
                }
                None => {
                    return Err(HarnessError::Upload(
                        "coverage upload token is not set".to_string(),
                    ))
                }
            }
        };

        Ok(AggregateReport {
            merged_from,
            missing,
            invalid,
            line_rate: merged.line_rate(),
            upload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn report(file: &str, lines: &[(u32, u64)]) -> CoverageReport {
        let mut r = CoverageReport::default();
        r.files.insert(file.to_string(), lines.iter().copied().collect());
        r
    }

    #[test]
    fn test_merge_sums_hits() {
        let mut a = report("a.py", &[(1, 1), (2, 0)]);
        a.merge(&report("a.py", &[(2, 3), (3, 0)]));
        a.merge(&report("b.py", &[(1, 1)]));
        assert_eq!(a.files["a.py"][&2], 3);
        assert_eq!(a.line_count(), 4);
        assert_eq!(a.line_rate(), Some(0.75));
        assert_eq!(CoverageReport::default().line_rate(), None);
    }

    #[test]
    fn test_parse_string_line_keys() {
        let r = CoverageReport::from_json(br#"{"files": {"x.py": {"10": 2}}}"#).unwrap();
        assert_eq!(r.files["x.py"][&10], 2);
    }

    #[test]
    fn test_from_dir() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("unit.json"), r#"{"files": {"x.py": {"1": 1}}}"#).unwrap();
        std::fs::write(tmp.path().join("func.json"), r#"{"files": {"x.py": {"1": 2}}}"#).unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();
        let r = CoverageReport::from_dir(tmp.path()).unwrap();
        assert_eq!(r.files["x.py"][&1], 3);
        assert!(CoverageReport::from_dir(&tmp.path().join("missing")).unwrap().files.is_empty());
    }

    async fn seeded(tmp: &TempDir) -> (ArtifactStore, RunHandle) {
        let store = ArtifactStore::new(tmp.path().join("store"), 7);
        let run = RunHandle::detached("k");
        store
            .upload(&run, "coverage-a.json", &report("x.py", &[(1, 1)]).to_json().unwrap())
            .await
            .unwrap();
        (store, run)
    }

    #[tokio::test]
    async fn test_aggregate_skips_missing_jobs() {
        let tmp = TempDir::new().unwrap();
        let (store, run) = seeded(&tmp).await;
        let sink = DirectorySink::new(tmp.path().join("published"));
        let expected = vec!["coverage-a.json".to_string(), "coverage-b.json".to_string()];

        let result = Aggregation {
            store: &store,
            run: &run,
            expected: &expected,
            token: Some("secret"),
            fork: false,
            sink: &sink,
        }
        .run()
        .await
        .unwrap();

        assert_eq!(result.merged_from, vec!["coverage-a.json"]);
        assert_eq!(result.missing, vec!["coverage-b.json"]);
        assert!(matches!(result.upload, UploadOutcome::Published { .. }));
        assert!(store.download(MERGED_COVERAGE).await.is_ok());
    }

    #[tokio::test]
    async fn test_aggregate_skips_unreadable_report() {
        let tmp = TempDir::new().unwrap();
        let (store, run) = seeded(&tmp).await;
        store.upload(&run, "coverage-b.json", b"{truncated").await.unwrap();
        let sink = DirectorySink::new(tmp.path().join("published"));
        let expected = vec!["coverage-a.json".to_string(), "coverage-b.json".to_string()];

        let result = Aggregation {
            store: &store,
            run: &run,
            expected: &expected,
            token: Some("secret"),
            fork: false,
            sink: &sink,
        }
        .run()
        .await
        .unwrap();

        assert_eq!(result.merged_from, vec!["coverage-a.json"]);
        assert!(result.missing.is_empty());
        assert_eq!(result.invalid, vec!["coverage-b.json"]);
        assert_eq!(result.line_rate, Some(1.0));
        assert!(matches!(result.upload, UploadOutcome::Published { .. }));
        let merged = CoverageReport::from_json(&store.download(MERGED_COVERAGE).await.unwrap()).unwrap();
        assert_eq!(merged.files["x.py"][&1], 1);
    }

    #[tokio::test]
    async fn test_fork_without_token_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let (store, run) = seeded(&tmp).await;
        let sink = DirectorySink::new(tmp.path().join("published"));
        let expected = vec!["coverage-a.json".to_string()];

        let result = Aggregation {
            store: &store,
            run: &run,
            expected: &expected,
            token: None,
            fork: true,
            sink: &sink,
        }
        .run()
        .await
        .unwrap();
        assert_eq!(result.upload, UploadOutcome::SkippedFork);
        assert!(!tmp.path().join("published").exists());
    }

    #[tokio::test]
    async fn test_missing_token_fails_outside_forks() {
        let tmp = TempDir::new().unwrap();
        let (store, run) = seeded(&tmp).await;
        let sink = DirectorySink::new(tmp.path().join("published"));
        let expected = vec!["coverage-a.json".to_string()];

        let err = Aggregation {
            store: &store,
            run: &run,
            expected: &expected,
            token: Some(""),
            fork: false,
            sink: &sink,
        }
        .run()
        .await
        .unwrap_err();
        assert!(matches!(err, HarnessError::Upload(_)));
    }
}
