//! Render a pipeline definition as a GitHub Actions workflow.
//!
//! The rendered workflow carries the same semantics as the local runner:
//! a concurrency group that cancels superseded runs, `fail-fast: false`,
//! per-stage `if:` gates, and a coverage job that waits for the matrix.

use serde_yaml::{Mapping, Value};

use crate::engine::RUN_DIR_ENV;
use crate::error::{HarnessError, HarnessResult};
use crate::pipeline::matrix::{
    resolve_dependencies, stage_catalogue, Builtin, RunIf, Stage, StageAction, StageKind,
};
use crate::pipeline::runner::{COVERAGE_DIR_ENV, OS_ENV, RUNTIME_ENV};
use crate::pipeline::schema::{MatrixEntry, PipelineConfig};

const MATRIX_JOB: &str = "test";

fn s(v: &str) -> Value {
    Value::String(v.to_string())
}

fn map(entries: Vec<(&str, Value)>) -> Value {
    let mut m = Mapping::new();
    for (k, v) in entries {
        m.insert(s(k), v);
    }
    Value::Mapping(m)
}

fn list(items: &[String]) -> Value {
    Value::Sequence(items.iter().map(|i| s(i)).collect())
}

fn entries(items: &[MatrixEntry]) -> Value {
    Value::Sequence(
        items
            .iter()
            .map(|e| map(vec![("os", s(&e.os)), ("runtime-version", s(&e.runtime))]))
            .collect(),
    )
}

fn triggers(config: &PipelineConfig) -> Value {
    let mut on = Vec::new();
    if config.triggers.pull_request {
        on.push(("pull_request", Value::Mapping(Mapping::new())));
    }
    if config.triggers.workflow_dispatch {
        on.push(("workflow_dispatch", Value::Mapping(Mapping::new())));
    }
    if !config.triggers.push_branches.is_empty() {
        on.push(("push", map(vec![("branches", list(&config.triggers.push_branches))])));
    }
    map(on)
}

/// Outcome check for one dependency. A gated dependency that does not
/// apply to the current cell is skipped by its own `if:`, which counts as
/// satisfied.
fn dependency_check(dep: StageKind, stages: &[Stage]) -> String {
    let succeeded = format!("steps.{}.outcome == 'success'", dep);
    match stages
        .iter()
        .find(|s| s.kind == dep)
        .and_then(|s| s.gate.expression())
    {
        Some(gate) => format!("({} || !({}))", succeeded, gate),
        None => succeeded,
    }
}

/// `if:` expression for a step, or `None` to run under default rules.
///
/// Success stages are always guarded by `!cancelled()` so that a failing
/// sibling stage does not skip them; only their dependencies count.
fn condition(stage: &Stage, stages: &[Stage]) -> Option<String> {
    let mut parts = Vec::new();
    match stage.run_if {
        RunIf::Failure => parts.push("failure()".to_string()),
        RunIf::Success if stage.kind.is_prerequisite() && stage.depends_on.is_empty() => {}
        RunIf::Success => {
            parts.push("!cancelled()".to_string());
            for dep in &stage.depends_on {
                parts.push(dependency_check(*dep, stages));
            }
        }
    }
    if let Some(gate) = stage.gate.expression() {
        parts.push(format!("({})", gate));
    }
    (!parts.is_empty()).then(|| parts.join(" && "))
}

fn step(config: &PipelineConfig, stage: &Stage, stages: &[Stage]) -> Value {
    let mut m = Mapping::new();
    m.insert(s("name"), s(stage.kind.as_str()));
    m.insert(s("id"), s(stage.kind.as_str()));
    if let Some(cond) = condition(stage, stages) {
        m.insert(s("if"), s(&cond));
    }

    match &stage.action {
        StageAction::Command(cmd) => {
            m.insert(s("run"), s(cmd));
        }
        StageAction::Builtin(Builtin::SnapshotRuntimeState) => {
            m.insert(s("uses"), s("actions/upload-artifact@v4"));
            m.insert(
                s("with"),
                map(vec![
                    ("name", s("runtime-state-${{ matrix.os }}-${{ matrix.runtime-version }}")),
                    ("path", s(&format!("${{{{ env.{} }}}}", RUN_DIR_ENV))),
                ]),
            );
        }
        StageAction::Builtin(Builtin::CoverageReport) => {
            m.insert(s("uses"), s("actions/upload-artifact@v4"));
            m.insert(
                s("with"),
                map(vec![
                    ("name", s("coverage-${{ matrix.os }}-${{ matrix.runtime-version }}")),
                    ("path", s(&format!("${{{{ env.{} }}}}", COVERAGE_DIR_ENV))),
                    (
                        "retention-days",
                        Value::Number(config.coverage.retention_days.into()),
                    ),
                ]),
            );
        }
        StageAction::Builtin(Builtin::CoverageUpload) => {
            m.insert(s("uses"), s("codecov/codecov-action@v4"));
            m.insert(
                s("with"),
                map(vec![
                    ("directory", s(&format!("${{{{ env.{} }}}}", COVERAGE_DIR_ENV))),
                    ("token", s(&format!("${{{{ secrets.{} }}}}", config.coverage.token_env))),
                ]),
            );
        }
    }

    m.insert(
        s("timeout-minutes"),
        Value::Number((stage.timeout_secs.div_ceil(60)).into()),
    );
    if stage.continue_on_error {
        m.insert(s("continue-on-error"), Value::Bool(true));
    }
    Value::Mapping(m)
}

fn matrix_job(config: &PipelineConfig) -> Value {
    let mut matrix = Mapping::new();
    matrix.insert(s("os"), list(&config.matrix.os));
    matrix.insert(s("runtime-version"), list(&config.matrix.runtime));
    if !config.matrix.include.is_empty() {
        matrix.insert(s("include"), entries(&config.matrix.include));
    }
    if !config.matrix.exclude.is_empty() {
        matrix.insert(s("exclude"), entries(&config.matrix.exclude));
    }

    let mut steps = vec![map(vec![("uses", s("actions/checkout@v4"))])];
    // Every cell shares one step list, so dependencies are resolved over the
    // whole catalogue and gates are checked at run time.
    let mut stages = stage_catalogue(config);
    resolve_dependencies(&mut stages);
    steps.extend(stages.iter().map(|st| step(config, st, &stages)));

    map(vec![
        ("runs-on", s("${{ matrix.os }}")),
        ("timeout-minutes", Value::Number(config.timeouts.job_minutes.into())),
        (
            "strategy",
            map(vec![("fail-fast", Value::Bool(false)), ("matrix", Value::Mapping(matrix))]),
        ),
        (
            "env",
            map(vec![
                (OS_ENV, s("${{ matrix.os }}")),
                (RUNTIME_ENV, s("${{ matrix.runtime-version }}")),
                (RUN_DIR_ENV, s("${{ runner.temp }}/suitecheck-run")),
                (COVERAGE_DIR_ENV, s("${{ runner.temp }}/coverage")),
            ]),
        ),
        ("steps", Value::Sequence(steps)),
    ])
}

fn coverage_job(config: &PipelineConfig) -> Value {
    map(vec![
        ("needs", s(MATRIX_JOB)),
        ("if", s("${{ !cancelled() }}")),
        ("runs-on", s(&config.aggregate_os)),
        (
            "steps",
            Value::Sequence(vec![
                map(vec![("uses", s("actions/checkout@v4"))]),
                map(vec![
                    ("name", s("download coverage")),
                    ("uses", s("actions/download-artifact@v4")),
                    (
                        "with",
                        map(vec![
                            ("pattern", s("coverage-*")),
                            ("path", s("coverage")),
                            ("merge-multiple", Value::Bool(true)),
                        ]),
                    ),
                ]),
                map(vec![
                    ("name", s("upload merged coverage")),
                    ("uses", s("codecov/codecov-action@v4")),
                    (
                        "with",
                        map(vec![
                            ("directory", s("coverage")),
                            ("token", s(&format!("${{{{ secrets.{} }}}}", config.coverage.token_env))),
                        ]),
                    ),
                ]),
            ]),
        ),
    ])
}

/// The whole workflow file.
pub fn to_workflow_yaml(config: &PipelineConfig) -> HarnessResult<String> {
    let mut jobs = Mapping::new();
    jobs.insert(s(MATRIX_JOB), matrix_job(config));
    if config.coverage.enabled {
        jobs.insert(s("coverage"), coverage_job(config));
    }

    let mut root = vec![("name", s(&config.name)), ("on", triggers(config))];
    if config.cancel_in_progress {
        root.push((
            "concurrency",
            map(vec![
                ("group", s("${{ github.workflow }}-${{ github.ref }}")),
                ("cancel-in-progress", Value::Bool(true)),
            ]),
        ));
    }
    root.push(("jobs", Value::Mapping(jobs)));

    serde_yaml::to_string(&map(root))
        .map_err(|e| HarnessError::Parse(format!("Failed to render workflow: {}", e)))
}
