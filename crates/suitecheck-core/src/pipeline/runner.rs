//! Local pipeline runner.
//!
//! Jobs run concurrently and independently (no fail-fast); stages inside a
//! job run in order. Each stage is bounded by its own timeout and by the
//! remaining job budget, and races against cancellation of the whole run.
//!
//! Per run, everything lives under `<work_dir>/<run_id>/`:
//!
//! ```text
//! artifacts/                 write-once ArtifactStore
//! <job_id>/run/              SUITECHECK_RUN_DIR for the job's stages
//! <job_id>/coverage/         SUITECHECK_COVERAGE_DIR
//! <job_id>/logs/<stage>.log  combined stdout/stderr
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::engine::RUN_DIR_ENV;
use crate::error::{HarnessError, HarnessResult};
use crate::pipeline::artifacts::{snapshot_dir, ArtifactStore};
use crate::pipeline::concurrency::{RunHandle, RunRegistry};
use crate::pipeline::coverage::{AggregateReport, Aggregation, CoverageReport, CoverageSink, DirectorySink};
use crate::pipeline::matrix::{Builtin, MatrixJob, Pipeline, RunIf, Stage, StageAction, StageKind};
use crate::pipeline::schema::{concurrency_key, TriggerEvent};

pub const OS_ENV: &str = "SUITECHECK_OS";
pub const RUNTIME_ENV: &str = "SUITECHECK_RUNTIME";
pub const COVERAGE_DIR_ENV: &str = "SUITECHECK_COVERAGE_DIR";
pub const JOB_ID_ENV: &str = "SUITECHECK_JOB_ID";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum StageStatus {
    Succeeded,
    Failed {
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    TimedOut { after_secs: u64 },
    Skipped { reason: String },
    Cancelled,
}

impl StageStatus {
    pub fn succeeded(&self) -> bool {
        matches!(self, StageStatus::Succeeded)
    }

    /// Whether this status fails a stage that is not `continue_on_error`.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            StageStatus::Failed { .. } | StageStatus::TimedOut { .. } | StageStatus::Cancelled
        )
    }

    fn failed(message: impl Into<String>) -> Self {
        StageStatus::Failed {
            exit_code: None,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub kind: StageKind,
    #[serde(flatten)]
    pub status: StageStatus,
    pub continue_on_error: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub id: String,
    pub os: String,
    pub runtime: String,
    pub stages: Vec<StageResult>,
}

impl JobReport {
    /// AND over every stage that is allowed to fail the job.
    pub fn success(&self) -> bool {
        self.stages
            .iter()
            .all(|s| s.continue_on_error || !s.status.is_failure())
    }

    pub fn stage(&self, kind: StageKind) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.kind == kind)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    pub name: String,
    pub run_id: String,
    pub concurrency_key: String,
    pub cancelled: bool,
    pub jobs: Vec<JobReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<AggregateReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate_error: Option<String>,
    pub artifacts_dir: PathBuf,
}

impl PipelineReport {
    pub fn success(&self) -> bool {
        !self.cancelled && self.aggregate_error.is_none() && self.jobs.iter().all(JobReport::success)
    }

    /// 0 success, 1 a job or the aggregation failed, 2 the run was superseded.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            2
        } else if self.success() {
            0
        } else {
            1
        }
    }
}

/// Everything a job's stages share.
struct JobContext {
    job: MatrixJob,
    run: RunHandle,
    store: ArtifactStore,
    root: PathBuf,
    source_dir: PathBuf,
    fork: bool,
    token: Option<String>,
    sink: Arc<dyn CoverageSink>,
}

impl JobContext {
    fn run_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    fn coverage_dir(&self) -> PathBuf {
        self.root.join("coverage")
    }

    fn log_path(&self, kind: StageKind) -> PathBuf {
        self.root.join("logs").join(format!("{}.log", kind))
    }
}

pub struct PipelineRunner {
    pipeline: Pipeline,
    work_dir: PathBuf,
    source_dir: PathBuf,
    registry: RunRegistry,
    sink: Arc<dyn CoverageSink>,
    token: Option<String>,
    max_parallel: usize,
}

impl PipelineRunner {
    pub fn new(pipeline: Pipeline, work_dir: impl AsRef<Path>, registry: RunRegistry) -> Self {
        let work_dir = work_dir.as_ref().to_path_buf();
        Self {
            pipeline,
            sink: Arc::new(DirectorySink::new(work_dir.join("published"))),
            work_dir,
            source_dir: PathBuf::from("."),
            registry,
            token: None,
            max_parallel: usize::MAX,
        }
    }

    /// Working directory for stage commands.
    pub fn with_source_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.source_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn CoverageSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Upload token, instead of reading the configured environment variable.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_max_parallel(mut self, jobs: usize) -> Self {
        self.max_parallel = jobs.max(1);
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    fn resolve_token(&self) -> Option<String> {
        self.token.clone().or_else(|| {
            self.pipeline
                .aggregate
                .as_ref()
                .and_then(|a| std::env::var(&a.token_env).ok())
        })
    }

    /// Execute every job for `event` and aggregate coverage.
    pub async fn run(&self, event: &TriggerEvent) -> HarnessResult<PipelineReport> {
        let key = concurrency_key(&self.pipeline.name, &event.reference());
        let run = if self.pipeline.cancel_in_progress {
            self.registry.register(&key).await
        } else {
            RunHandle::detached(&key)
        };
        let result = self.run_with(run.clone(), event).await;
        self.registry.complete(&run).await;
        result
    }

    async fn run_with(&self, run: RunHandle, event: &TriggerEvent) -> HarnessResult<PipelineReport> {
        let run_root = self.work_dir.join(&run.run_id);
        let retention = self
            .pipeline
            .aggregate
            .as_ref()
            .map(|a| a.retention_days)
            .unwrap_or(7);
        let store = ArtifactStore::new(run_root.join("artifacts"), retention);
        tokio::fs::create_dir_all(&run_root).await?;

        tracing::info!(
            "[PipelineRunner] Run {} of '{}' on {} ({} jobs)",
            run.run_id,
            self.pipeline.name,
            run.key,
            self.pipeline.jobs.len()
        );

        let token = self.resolve_token();
        let permits = Arc::new(Semaphore::new(self.max_parallel.min(Semaphore::MAX_PERMITS)));
        let mut set = JoinSet::new();
        for (index, job) in self.pipeline.jobs.iter().enumerate() {
            let ctx = JobContext {
                root: run_root.join(&job.id),
                job: job.clone(),
                run: run.clone(),
                store: store.clone(),
                source_dir: self.source_dir.clone(),
                fork: event.is_fork(),
                token: token.clone(),
                sink: self.sink.clone(),
            };
            let permits = permits.clone();
            set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                (index, run_job(ctx).await)
            });
        }

        let mut slots: Vec<Option<JobReport>> = vec![None; self.pipeline.jobs.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, report)) => slots[index] = Some(report),
                Err(e) => tracing::error!("[PipelineRunner] Job task failed: {}", e),
            }
        }
        let jobs: Vec<JobReport> = slots
            .into_iter()
            .zip(&self.pipeline.jobs)
            .map(|(slot, job)| {
                slot.unwrap_or_else(|| JobReport {
                    id: job.id.clone(),
                    os: job.os.clone(),
                    runtime: job.runtime.clone(),
                    stages: vec![StageResult {
                        kind: StageKind::Setup,
                        status: StageStatus::failed("job task crashed"),
                        continue_on_error: false,
                        duration_ms: 0,
                        log: None,
                    }],
                })
            })
            .collect();

        let cancelled = run.is_cancelled();
        let (aggregate, aggregate_error) = match &self.pipeline.aggregate {
            Some(_) if !cancelled => {
                let expected: Vec<String> = self
                    .pipeline
                    .jobs
                    .iter()
                    .filter(|j| j.stage(StageKind::CoverageReport).is_some())
                    .map(MatrixJob::coverage_artifact)
                    .collect();
                let aggregation = Aggregation {
                    store: &store,
                    run: &run,
                    expected: &expected,
                    token: token.as_deref(),
                    fork: event.is_fork(),
                    sink: self.sink.as_ref(),
                };
                match aggregation.run().await {
                    Ok(report) => (Some(report), None),
                    Err(e) => {
                        tracing::error!("[PipelineRunner] Coverage aggregation failed: {}", e);
                        (None, Some(e.to_string()))
                    }
                }
            }
            _ => (None, None),
        };

        if cancelled {
            tracing::warn!("[PipelineRunner] Run {} was superseded", run.run_id);
        }

        Ok(PipelineReport {
            name: self.pipeline.name.clone(),
            run_id: run.run_id.clone(),
            concurrency_key: run.key.clone(),
            cancelled,
            jobs,
            aggregate,
            aggregate_error,
            artifacts_dir: store.root().to_path_buf(),
        })
    }
}

async fn run_job(ctx: JobContext) -> JobReport {
    let deadline = Instant::now() + Duration::from_secs(ctx.job.timeout_secs);
    let mut statuses: BTreeMap<StageKind, StageStatus> = BTreeMap::new();
    let mut results = Vec::with_capacity(ctx.job.stages.len());
    let mut test_failed = false;

    for dir in [ctx.run_dir(), ctx.coverage_dir(), ctx.root.join("logs")] {
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            tracing::error!("[PipelineRunner] Cannot create {}: {}", dir.display(), e);
        }
    }

    tracing::info!("[PipelineRunner] Job {} started", ctx.job.id);

    for stage in &ctx.job.stages {
        let started = Instant::now();
        let mut log = None;

        let status = if ctx.run.is_cancelled() {
            StageStatus::Cancelled
        } else if let Some(reason) = skip_reason(stage, &statuses, test_failed) {
            StageStatus::Skipped { reason }
        } else {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                StageStatus::TimedOut { after_secs: 0 }
            } else {
                let limit = remaining.min(Duration::from_secs(stage.timeout_secs));
                if matches!(stage.action, StageAction::Command(_)) {
                    log = Some(ctx.log_path(stage.kind));
                }
                tracing::info!("[PipelineRunner] {} / {}", ctx.job.id, stage.kind);
                tokio::select! {
                    _ = ctx.run.cancelled() => StageStatus::Cancelled,
                    outcome = tokio::time::timeout(limit, execute_stage(&ctx, stage)) => match outcome {
                        Ok(status) => status,
                        Err(_) => StageStatus::TimedOut { after_secs: limit.as_secs() },
                    },
                }
            }
        };

        if stage.kind.is_test() && status.is_failure() {
            test_failed = true;
        }
        if status.is_failure() {
            tracing::warn!(
                "[PipelineRunner] {} / {}: {:?}",
                ctx.job.id,
                stage.kind,
                status
            );
        }
        statuses.insert(stage.kind, status.clone());
        results.push(StageResult {
            kind: stage.kind,
            status,
            continue_on_error: stage.continue_on_error,
            duration_ms: started.elapsed().as_millis() as u64,
            log,
        });
    }

    let report = JobReport {
        id: ctx.job.id.clone(),
        os: ctx.job.os.clone(),
        runtime: ctx.job.runtime.clone(),
        stages: results,
    };
    tracing::info!(
        "[PipelineRunner] Job {} {}",
        report.id,
        if report.success() { "succeeded" } else { "failed" }
    );
    report
}

fn skip_reason(
    stage: &Stage,
    statuses: &BTreeMap<StageKind, StageStatus>,
    test_failed: bool,
) -> Option<String> {
    match stage.run_if {
        RunIf::Failure if !test_failed => Some("no test stage failed".to_string()),
        RunIf::Failure => None,
        RunIf::Success => stage
            .depends_on
            .iter()
            .find(|dep| !statuses.get(dep).map(StageStatus::succeeded).unwrap_or(false))
            .map(|dep| format!("{} did not succeed", dep)),
    }
}

async fn execute_stage(ctx: &JobContext, stage: &Stage) -> StageStatus {
    let result = match &stage.action {
        StageAction::Command(command) => run_command(ctx, stage.kind, command).await,
        StageAction::Builtin(Builtin::SnapshotRuntimeState) => snapshot_runtime_state(ctx).await,
        StageAction::Builtin(Builtin::CoverageReport) => store_job_coverage(ctx).await,
        StageAction::Builtin(Builtin::CoverageUpload) => publish_job_coverage(ctx).await,
    };
    match result {
        Ok(status) => status,
        Err(HarnessError::Cancelled(_)) => StageStatus::Cancelled,
        Err(e) => StageStatus::failed(e.to_string()),
    }
}

fn shell() -> (&'static str, &'static str) {
    if cfg!(windows) {
        ("cmd", "/C")
    } else {
        ("sh", "-c")
    }
}

async fn run_command(ctx: &JobContext, kind: StageKind, command: &str) -> HarnessResult<StageStatus> {
    let log_path = ctx.log_path(kind);
    let log = std::fs::File::create(&log_path)?;
    let log_err = log.try_clone()?;
    let (program, flag) = shell();

    let mut child = tokio::process::Command::new(program)
        .arg(flag)
        .arg(command)
        .current_dir(&ctx.source_dir)
        .env(OS_ENV, &ctx.job.os)
        .env(RUNTIME_ENV, &ctx.job.runtime)
        .env(JOB_ID_ENV, &ctx.job.id)
        .env(RUN_DIR_ENV, ctx.run_dir())
        .env(COVERAGE_DIR_ENV, ctx.coverage_dir())
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| HarnessError::Engine(format!("Failed to spawn '{}': {}", program, e)))?;

    let status = child.wait().await?;
    Ok(if status.success() {
        StageStatus::Succeeded
    } else {
        StageStatus::Failed {
            exit_code: status.code(),
            message: None,
        }
    })
}

async fn snapshot_runtime_state(ctx: &JobContext) -> HarnessResult<StageStatus> {
    let bytes = snapshot_dir(&ctx.run_dir(), "runtime-state").await?;
    ctx.store
        .upload(&ctx.run, &ctx.job.snapshot_artifact(), &bytes)
        .await?;
    Ok(StageStatus::Succeeded)
}

async fn store_job_coverage(ctx: &JobContext) -> HarnessResult<StageStatus> {
    let report = CoverageReport::from_dir(&ctx.coverage_dir())?;
    ctx.store
        .upload(&ctx.run, &ctx.job.coverage_artifact(), &report.to_json()?)
        .await?;
    Ok(StageStatus::Succeeded)
}

async fn publish_job_coverage(ctx: &JobContext) -> HarnessResult<StageStatus> {
    match ctx.token.as_deref().filter(|t| !t.trim().is_empty()) {
        Some(token) => {
            let bytes = ctx.store.download(&ctx.job.coverage_artifact()).await?;
            if ctx.run.is_cancelled() {
                return Err(HarnessError::Cancelled(ctx.run.run_id.clone()));
            }
            let location = ctx.sink.publish(&CoverageReport::from_json(&bytes)?, token)?;
            tracing::info!("[PipelineRunner] {} coverage published to {}", ctx.job.id, location);
            Ok(StageStatus::Succeeded)
        }
        None if ctx.fork => Ok(StageStatus::Skipped {
            reason: "fork pull request has no upload token".to_string(),
        }),
        None => Err(HarnessError::Upload("coverage upload token is not set".to_string())),
    }
}
