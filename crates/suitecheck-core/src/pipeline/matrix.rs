//! Matrix expansion and stage planning.
//!
//! `plan_jobs` is a pure function from a `PipelineConfig` to the jobs a run will
//! execute: it never spawns anything, so gating can be tested directly.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};
use crate::pipeline::schema::{MatrixConfig, MatrixEntry, PipelineConfig};

/// Stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    Setup,
    SystemDeps,
    Dependencies,
    Changelog,
    Style,
    Typing,
    Doctest,
    Unit,
    Security,
    Acceptance,
    UploadFailureArtifacts,
    CoverageReport,
    CoverageUpload,
    Linkcheck,
}

impl StageKind {
    pub const ALL: [StageKind; 14] = [
        StageKind::Setup,
        StageKind::SystemDeps,
        StageKind::Dependencies,
        StageKind::Changelog,
        StageKind::Style,
        StageKind::Typing,
        StageKind::Doctest,
        StageKind::Unit,
        StageKind::Security,
        StageKind::Acceptance,
        StageKind::UploadFailureArtifacts,
        StageKind::CoverageReport,
        StageKind::CoverageUpload,
        StageKind::Linkcheck,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Setup => "setup",
            StageKind::SystemDeps => "system-deps",
            StageKind::Dependencies => "dependencies",
            StageKind::Changelog => "changelog",
            StageKind::Style => "style",
            StageKind::Typing => "typing",
            StageKind::Doctest => "doctest",
            StageKind::Unit => "unit",
            StageKind::Security => "security",
            StageKind::Acceptance => "acceptance",
            StageKind::UploadFailureArtifacts => "upload-failure-artifacts",
            StageKind::CoverageReport => "coverage-report",
            StageKind::CoverageUpload => "coverage-upload",
            StageKind::Linkcheck => "linkcheck",
        }
    }

    /// Failures of these stages trigger the runtime-state snapshot.
    pub fn is_test(&self) -> bool {
        matches!(self, StageKind::Doctest | StageKind::Unit | StageKind::Acceptance)
    }

    /// Environment preparation; everything after depends on it.
    pub fn is_prerequisite(&self) -> bool {
        matches!(self, StageKind::Setup | StageKind::SystemDeps | StageKind::Dependencies)
    }

    /// Stages the harness performs itself rather than via a shell command.
    pub fn builtin(&self) -> Option<Builtin> {
        match self {
            StageKind::UploadFailureArtifacts => Some(Builtin::SnapshotRuntimeState),
            StageKind::CoverageReport => Some(Builtin::CoverageReport),
            StageKind::CoverageUpload => Some(Builtin::CoverageUpload),
            _ => None,
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Builtin {
    SnapshotRuntimeState,
    CoverageReport,
    CoverageUpload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum StageAction {
    Command(String),
    Builtin(Builtin),
}

/// Matrix cells a stage applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum Gate {
    Always,
    Os(String),
    OsIn(Vec<String>),
    Runtime(String),
}

impl Gate {
    pub fn applies(&self, os: &str, runtime: &str) -> bool {
        match self {
            Gate::Always => true,
            Gate::Os(o) => o == os,
            Gate::OsIn(list) => list.iter().any(|o| o == os),
            Gate::Runtime(r) => r == runtime,
        }
    }

    /// GitHub Actions `if:` expression, `None` for `Always`.
    pub fn expression(&self) -> Option<String> {
        match self {
            Gate::Always => None,
            Gate::Os(o) => Some(format!("matrix.os == '{}'", o)),
            Gate::OsIn(list) => Some(
                list.iter()
                    .map(|o| format!("matrix.os == '{}'", o))
                    .collect::<Vec<_>>()
                    .join(" || "),
            ),
            Gate::Runtime(r) => Some(format!("matrix.runtime-version == '{}'", r)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunIf {
    /// Run unless a dependency did not succeed
    #[default]
    Success,
    /// Run only after a test stage failed
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub kind: StageKind,
    pub action: StageAction,
    pub gate: Gate,
    pub run_if: RunIf,
    /// Failure does not fail the job
    pub continue_on_error: bool,
    /// Stages that must have succeeded for this one to run
    pub depends_on: Vec<StageKind>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixJob {
    pub id: String,
    pub os: String,
    pub runtime: String,
    pub stages: Vec<Stage>,
    pub timeout_secs: u64,
}

impl MatrixJob {
    pub fn stage(&self, kind: StageKind) -> Option<&Stage> {
        self.stages.iter().find(|s| s.kind == kind)
    }

    pub fn stage_kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(|s| s.kind).collect()
    }

    /// `runtime-state-<os>-<runtime>.tar.gz`
    pub fn snapshot_artifact(&self) -> String {
        format!("runtime-state-{}-{}.tar.gz", sanitize(&self.os), sanitize(&self.runtime))
    }

    /// `coverage-<os>-<runtime>.json`
    pub fn coverage_artifact(&self) -> String {
        format!("{}{}-{}.json", COVERAGE_PREFIX, sanitize(&self.os), sanitize(&self.runtime))
    }
}

/// Prefix shared by per-job coverage artifacts.
pub const COVERAGE_PREFIX: &str = "coverage-";
/// Name of the merged coverage artifact.
pub const MERGED_COVERAGE: &str = "coverage-merged.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatePlan {
    pub os: String,
    /// Jobs the aggregation waits for
    pub needs: Vec<String>,
    pub retention_days: u32,
    pub token_env: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    pub fail_fast: bool,
    pub cancel_in_progress: bool,
    pub jobs: Vec<MatrixJob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<AggregatePlan>,
}

pub(crate) fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '-' })
        .collect()
}

/// Cartesian product of the axes, then `include`, minus `exclude`.
/// Order follows the axes and first appearance; duplicates are dropped.
pub fn expand_matrix(matrix: &MatrixConfig) -> Vec<MatrixEntry> {
    let excluded: BTreeSet<&MatrixEntry> = matrix.exclude.iter().collect();
    let mut seen = BTreeSet::new();
    let mut cells = Vec::new();

    let product = matrix.os.iter().flat_map(|os| {
        matrix.runtime.iter().map(move |rt| MatrixEntry {
            os: os.clone(),
            runtime: rt.clone(),
        })
    });

    for cell in product.chain(matrix.include.iter().cloned()) {
        if excluded.contains(&cell) || !seen.insert(cell.clone()) {
            continue;
        }
        cells.push(cell);
    }
    cells
}

/// Every stage the configuration enables, with its gate, in order.
pub fn stage_catalogue(config: &PipelineConfig) -> Vec<Stage> {
    let gates = &config.gates;
    let mut stages = Vec::new();

    for kind in StageKind::ALL {
        let action = match kind.builtin() {
            Some(Builtin::CoverageReport | Builtin::CoverageUpload) if !config.coverage.enabled => {
                continue
            }
            Some(builtin) => StageAction::Builtin(builtin),
            None => match config.commands.get(&kind) {
                Some(cmd) => StageAction::Command(cmd.clone()),
                None => continue,
            },
        };

        let gate = match kind {
            StageKind::SystemDeps if !gates.system_deps_os.is_empty() => {
                Gate::OsIn(gates.system_deps_os.clone())
            }
            StageKind::Changelog | StageKind::Style | StageKind::Typing => gates
                .style_os
                .clone()
                .map(Gate::Os)
                .unwrap_or(Gate::Always),
            StageKind::Security => gates
                .security_runtime
                .clone()
                .map(Gate::Runtime)
                .unwrap_or(Gate::Always),
            StageKind::Linkcheck => gates
                .linkcheck_runtime
                .clone()
                .map(Gate::Runtime)
                .unwrap_or(Gate::Always),
            _ => Gate::Always,
        };

        stages.push(Stage {
            kind,
            action,
            gate,
            run_if: if kind == StageKind::UploadFailureArtifacts {
                RunIf::Failure
            } else {
                RunIf::Success
            },
            // Link checking is network-bound and flaky; it reports but never
            // fails the job.
            continue_on_error: kind == StageKind::Linkcheck,
            depends_on: Vec::new(),
            timeout_secs: config.timeouts.stage_secs(kind),
        });
    }
    stages
}

/// Fill `depends_on`: prerequisites depend on the earlier prerequisites,
/// every other success stage on all of them, and the coverage upload also
/// on the coverage report. Stages outside the setup group never depend on
/// each other.
pub(crate) fn resolve_dependencies(stages: &mut [Stage]) {
    let prerequisites: Vec<StageKind> = stages
        .iter()
        .map(|s| s.kind)
        .filter(StageKind::is_prerequisite)
        .collect();
    let has_report = stages.iter().any(|s| s.kind == StageKind::CoverageReport);

    for stage in stages.iter_mut() {
        stage.depends_on = if stage.kind.is_prerequisite() {
            prerequisites.iter().copied().filter(|k| *k < stage.kind).collect()
        } else if stage.run_if == RunIf::Success {
            prerequisites.clone()
        } else {
            Vec::new()
        };
        if stage.kind == StageKind::CoverageUpload && has_report {
            stage.depends_on.push(StageKind::CoverageReport);
        }
    }
}

/// Expand the matrix and resolve each job's stage list.
pub fn plan_jobs(config: &PipelineConfig) -> HarnessResult<Pipeline> {
    if config.name.trim().is_empty() {
        return Err(HarnessError::Config("pipeline name must not be empty".to_string()));
    }
    let cells = expand_matrix(&config.matrix);
    if cells.is_empty() {
        return Err(HarnessError::Config("matrix expands to no jobs".to_string()));
    }

    let catalogue = stage_catalogue(config);
    let mut jobs = Vec::with_capacity(cells.len());

    for cell in cells {
        let mut stages: Vec<Stage> = catalogue
            .iter()
            .filter(|s| s.gate.applies(&cell.os, &cell.runtime))
            .cloned()
            .collect();

        resolve_dependencies(&mut stages);

        jobs.push(MatrixJob {
            id: sanitize(&format!("{}-{}", cell.os, cell.runtime)),
            os: cell.os,
            runtime: cell.runtime,
            stages,
            timeout_secs: config.timeouts.job_minutes * 60,
        });
    }

    let aggregate = config.coverage.enabled.then(|| AggregatePlan {
        os: config.aggregate_os.clone(),
        needs: jobs.iter().map(|j| j.id.clone()).collect(),
        retention_days: config.coverage.retention_days,
        token_env: config.coverage.token_env.clone(),
    });

    Ok(Pipeline {
        name: config.name.clone(),
        fail_fast: false,
        cancel_in_progress: config.cancel_in_progress,
        jobs,
        aggregate,
    })
}
