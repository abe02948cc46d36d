//! YAML schema for CI pipeline definitions.
//!
//! ```yaml
//! name: test
//!
//! triggers:
//!   pull_request: true
//!   workflow_dispatch: true
//!   push_branches: [master, "8.*.x"]
//!
//! matrix:
//!   os: [ubuntu-latest]
//!   runtime: ["3.7", "3.8", "3.9"]
//!   include:
//!     - { os: macos-latest, runtime: "3.7" }
//!
//! gates:
//!   system_deps_os: [ubuntu-latest]
//!   style_os: ubuntu-latest
//!   security_runtime: "3.9"
//!   linkcheck_runtime: "3.9"
//!
//! commands:
//!   dependencies: pip install -e .[all]
//!   style: flake8
//!   unit: pytest -n 5 tests/unit
//!   acceptance: suitecheck scenario run tests/functional
//!
//! timeouts:
//!   job_minutes: 35
//!   default_stage_minutes: 10
//!   stage_minutes:
//!     acceptance: 20
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};
use crate::pipeline::matrix::StageKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,

    #[serde(default)]
    pub triggers: TriggerConfig,

    /// Cancel an in-flight run when a newer one starts for the same ref
    #[serde(default = "default_true")]
    pub cancel_in_progress: bool,

    pub matrix: MatrixConfig,

    #[serde(default)]
    pub gates: GateConfig,

    /// Shell command per stage; stages without a command are left out
    #[serde(default)]
    pub commands: BTreeMap<StageKind, String>,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub coverage: CoverageConfig,

    /// OS of the coverage aggregation job
    #[serde(default = "default_aggregate_os")]
    pub aggregate_os: String,
}

fn default_true() -> bool {
    true
}

fn default_aggregate_os() -> String {
    "ubuntu-latest".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub pull_request: bool,
    pub workflow_dispatch: bool,
    /// Branch globs for push events (e.g. `master`, `8.*.x`)
    pub push_branches: Vec<String>,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            pull_request: true,
            workflow_dispatch: true,
            push_branches: vec!["master".to_string()],
        }
    }
}

/// An event that may start a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerEvent {
    Push { branch: String },
    PullRequest { number: u64, fork: bool },
    WorkflowDispatch { branch: String },
}

impl TriggerEvent {
    /// Git reference used for the concurrency key.
    pub fn reference(&self) -> String {
        match self {
            TriggerEvent::Push { branch } | TriggerEvent::WorkflowDispatch { branch } => {
                format!("refs/heads/{}", branch)
            }
            TriggerEvent::PullRequest { number, .. } => format!("refs/pull/{}/merge", number),
        }
    }

    /// Fork pull requests run without repository secrets.
    pub fn is_fork(&self) -> bool {
        matches!(self, TriggerEvent::PullRequest { fork: true, .. })
    }
}

impl TriggerConfig {
    pub fn matches(&self, event: &TriggerEvent) -> bool {
        match event {
            TriggerEvent::PullRequest { .. } => self.pull_request,
            TriggerEvent::WorkflowDispatch { .. } => self.workflow_dispatch,
            TriggerEvent::Push { branch } => self.push_branches.iter().any(|pattern| {
                glob::Pattern::new(pattern)
                    .map(|p| p.matches(branch))
                    .unwrap_or_else(|_| pattern == branch)
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MatrixEntry {
    pub os: String,
    pub runtime: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixConfig {
    pub os: Vec<String>,
    pub runtime: Vec<String>,
    #[serde(default)]
    pub include: Vec<MatrixEntry>,
    #[serde(default)]
    pub exclude: Vec<MatrixEntry>,
}

/// Which matrix cells run the conditional stages. `None` / empty means
/// every cell.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub system_deps_os: Vec<String>,
    pub style_os: Option<String>,
    pub security_runtime: Option<String>,
    pub linkcheck_runtime: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub job_minutes: u64,
    pub default_stage_minutes: u64,
    pub stage_minutes: BTreeMap<StageKind, u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            job_minutes: 35,
            default_stage_minutes: 10,
            stage_minutes: BTreeMap::new(),
        }
    }
}

impl TimeoutConfig {
    pub fn stage_secs(&self, kind: StageKind) -> u64 {
        self.stage_minutes
            .get(&kind)
            .copied()
            .unwrap_or(self.default_stage_minutes)
            * 60
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageConfig {
    pub enabled: bool,
    /// Env var holding the upload token
    pub token_env: String,
    /// Days coverage artifacts are kept
    pub retention_days: u32,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            token_env: "CODECOV_TOKEN".to_string(),
            retention_days: 7,
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml(yaml: &str) -> HarnessResult<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| HarnessError::Parse(format!("Failed to parse pipeline YAML: {}", e)))
    }

    pub fn from_file(path: &Path) -> HarnessResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("Failed to read pipeline '{}': {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Concurrency key for a run of this pipeline on `reference`.
    pub fn concurrency_key(&self, reference: &str) -> String {
        concurrency_key(&self.name, reference)
    }
}

/// `<pipeline>-<ref>`: runs sharing a key supersede each other.
pub fn concurrency_key(pipeline: &str, reference: &str) -> String {
    format!("{}-{}", pipeline, reference)
}
