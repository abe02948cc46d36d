//! `suitecheck scenario`: run and check acceptance scenarios.

use std::path::PathBuf;

use console::style;
use suitecheck_core::config::HarnessConfig;
use suitecheck_core::scenario::{
    discover, overall_exit_code, render_tap_stream, run_all, ScenarioDefinition, ScenarioExecutor,
    ScenarioReport,
};

use crate::ReportFormat;

/// Discover, parse and run every scenario under `paths`.
///
/// A file that fails to parse is reported as an aborted scenario (exit 2)
/// rather than stopping the whole run.
pub async fn run(config: &HarnessConfig, paths: &[PathBuf], format: ReportFormat) -> Result<i32, String> {
    let files = discover(paths).map_err(|e| e.to_string())?;
    if files.is_empty() {
        return Err("No scenario files found".to_string());
    }

    let mut scenarios = Vec::new();
    let mut broken = Vec::new();
    for file in &files {
        match ScenarioDefinition::from_file(file) {
            Ok(def) => scenarios.push(def),
            Err(e) => {
                let name = file
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| file.display().to_string());
                broken.push(ScenarioReport::aborted(&name, 0, &e.to_string()));
            }
        }
    }

    tracing::info!(
        "[scenario] Running {} scenario(s) with {} worker(s)",
        scenarios.len(),
        config.jobs
    );

    let executor = ScenarioExecutor::from_config(config);
    let mut reports = run_all(&executor, scenarios, config.jobs).await;
    reports.extend(broken);

    match format {
        ReportFormat::Tap => {
            print!("{}", render_tap_stream(&reports));
            print_summary(&reports);
        }
        ReportFormat::Json => super::print_json(&reports)?,
    }

    Ok(overall_exit_code(&reports))
}

fn print_summary(reports: &[ScenarioReport]) {
    let passed = reports.iter().filter(|r| r.passed()).count();
    let line = format!("{}/{} scenario(s) passed", passed, reports.len());
    if passed == reports.len() {
        eprintln!("{}", style(line).green());
    } else {
        eprintln!("{}", style(line).red());
        for report in reports.iter().filter(|r| !r.passed()) {
            eprintln!("  {} {}", style("✗").red(), report.summary_line().trim_start_matches("# "));
        }
    }
}

/// Parse every scenario and report static problems.
pub fn check(paths: &[PathBuf]) -> Result<i32, String> {
    let files = discover(paths).map_err(|e| e.to_string())?;
    if files.is_empty() {
        return Err("No scenario files found".to_string());
    }

    let mut failures = 0;
    for file in &files {
        match ScenarioDefinition::from_file(file) {
            Ok(def) => {
                let problems = def.validate();
                if problems.is_empty() {
                    println!(
                        "{} {} ({} tests, {} steps)",
                        style("✓").green(),
                        def.name,
                        def.tests,
                        def.steps.len()
                    );
                } else {
                    failures += 1;
                    println!("{} {}", style("✗").red(), def.name);
                    for problem in problems {
                        println!("    {}", problem);
                    }
                }
            }
            Err(e) => {
                failures += 1;
                println!("{} {}", style("✗").red(), e);
            }
        }
    }

    Ok(if failures == 0 { 0 } else { 1 })
}
