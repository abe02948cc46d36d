//! `suitecheck pipeline`: plan, render and locally run CI matrix pipelines.

use std::path::Path;

use console::style;
use suitecheck_core::pipeline::{
    plan_jobs, to_workflow_yaml, PipelineConfig, PipelineReport, PipelineRunner, RunRegistry, StageStatus,
    TriggerEvent,
};

use crate::{EventKind, PlanFormat, ReportFormat};

fn load(path: &Path) -> Result<PipelineConfig, String> {
    PipelineConfig::from_file(path).map_err(|e| e.to_string())
}

pub fn plan(path: &Path, format: PlanFormat) -> Result<i32, String> {
    let pipeline = plan_jobs(&load(path)?).map_err(|e| e.to_string())?;
    match format {
        PlanFormat::Json => super::print_json(&pipeline)?,
        PlanFormat::Yaml => {
            let text = serde_yaml::to_string(&pipeline).map_err(|e| e.to_string())?;
            print!("{}", text);
        }
    }
    Ok(0)
}

pub fn render(path: &Path, output: Option<&Path>) -> Result<i32, String> {
    let yaml = to_workflow_yaml(&load(path)?).map_err(|e| e.to_string())?;
    match output {
        Some(out) => {
            std::fs::write(out, &yaml).map_err(|e| format!("Failed to write '{}': {}", out.display(), e))?;
            tracing::info!("[pipeline] Wrote {}", out.display());
        }
        None => print!("{}", yaml),
    }
    Ok(0)
}

/// Build the trigger event from `--event` and `--ref`.
pub fn trigger_event(kind: EventKind, reference: &str, fork: bool) -> Result<TriggerEvent, String> {
    let branch = reference.trim_start_matches("refs/heads/").to_string();
    match kind {
        EventKind::Push => Ok(TriggerEvent::Push { branch }),
        EventKind::WorkflowDispatch => Ok(TriggerEvent::WorkflowDispatch { branch }),
        EventKind::PullRequest => {
            let number = reference
                .trim_start_matches("refs/pull/")
                .trim_end_matches("/merge")
                .parse::<u64>()
                .map_err(|_| format!("'{}' is not a pull request number", reference))?;
            Ok(TriggerEvent::PullRequest { number, fork })
        }
    }
}

pub struct RunOptions<'a> {
    pub pipeline: &'a Path,
    pub reference: &'a str,
    pub event: EventKind,
    pub fork: bool,
    pub os: Option<&'a str>,
    pub work_dir: &'a Path,
    pub max_parallel: Option<usize>,
    pub format: ReportFormat,
}

pub async fn run(opts: RunOptions<'_>) -> Result<i32, String> {
    let config = load(opts.pipeline)?;
    let event = trigger_event(opts.event, opts.reference, opts.fork)?;
    if !config.triggers.matches(&event) {
        eprintln!(
            "Pipeline '{}' is not triggered by {}; nothing to do",
            config.name,
            event.reference()
        );
        return Ok(0);
    }

    let mut pipeline = plan_jobs(&config).map_err(|e| e.to_string())?;
    if let Some(os) = opts.os {
        pipeline.jobs.retain(|j| j.os == os);
        if pipeline.jobs.is_empty() {
            return Err(format!("No jobs for OS '{}'", os));
        }
    }

    let mut runner = PipelineRunner::new(pipeline, opts.work_dir, RunRegistry::new());
    if let Some(n) = opts.max_parallel {
        runner = runner.with_max_parallel(n);
    }
    let report = runner.run(&event).await.map_err(|e| e.to_string())?;

    match opts.format {
        ReportFormat::Json => super::print_json(&report)?,
        ReportFormat::Tap => print_tap(&report),
    }
    Ok(report.exit_code())
}

/// One TAP line per job; stage details as diagnostics.
fn print_tap(report: &PipelineReport) {
    println!("1..{}", report.jobs.len());
    for (i, job) in report.jobs.iter().enumerate() {
        let ok = if job.success() { "ok" } else { "not ok" };
        println!("{} {} - {}", ok, i + 1, job.id);
        for stage in &job.stages {
            let detail = match &stage.status {
                StageStatus::Succeeded => style("succeeded".to_string()).green(),
                StageStatus::Failed { exit_code, message } => style(match (exit_code, message) {
                    (_, Some(m)) => format!("failed: {}", m),
                    (Some(c), None) => format!("failed (exit {})", c),
                    (None, None) => "failed".to_string(),
                })
                .red(),
                StageStatus::TimedOut { after_secs } => {
                    style(format!("timed out after {}s", after_secs)).red()
                }
                StageStatus::Skipped { reason } => style(format!("skipped: {}", reason)).dim(),
                StageStatus::Cancelled => style("cancelled".to_string()).yellow(),
            };
            let note = if stage.continue_on_error { " (allowed to fail)" } else { "" };
            println!("#   {:<26} {}{}", stage.kind, detail, note);
        }
    }
    if let Some(agg) = &report.aggregate {
        println!(
            "# coverage: merged {} report(s), {} missing, {} unreadable, line rate {}",
            agg.merged_from.len(),
            agg.missing.len(),
            agg.invalid.len(),
            agg.line_rate
                .map(|r| format!("{:.1}%", r * 100.0))
                .unwrap_or_else(|| "n/a".to_string())
        );
    }
    if let Some(err) = &report.aggregate_error {
        println!("# coverage aggregation failed: {}", err);
    }
    if report.cancelled {
        println!("# run {} was superseded by a newer run", report.run_id);
    }
    println!("# artifacts: {}", report.artifacts_dir.display());
}
