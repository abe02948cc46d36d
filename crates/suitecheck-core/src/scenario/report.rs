//! Scenario result summary and TAP rendering.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::tap::{TapLine, TapRecorder};

/// Exit code for a scenario whose assertions all passed.
pub const EXIT_OK: i32 = 0;
/// Exit code when one or more assertions failed.
pub const EXIT_ASSERTION_FAILURE: i32 = 1;
/// Exit code for a harness-contract failure (plan mismatch, teardown error).
pub const EXIT_HARNESS_FAILURE: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScenarioOutcome {
    Passed,
    /// Product regression: the plan held but some assertions failed
    AssertionFailures { failed: usize },
    /// Scenario authoring defect or aborted run: executed != planned
    PlanMismatch {
        planned: usize,
        executed: usize,
        failed: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownReport {
    pub instance: String,
    pub attempted: bool,
    /// Whether anything was on disk to remove
    pub removed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioReport {
    pub name: String,
    pub instance: String,
    pub planned: usize,
    pub executed: usize,
    pub lines: Vec<TapLine>,
    pub outcome: ScenarioOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_error: Option<String>,
    pub teardown: TeardownReport,
    pub artifacts_dir: PathBuf,
}

impl ScenarioReport {
    pub fn new(
        name: &str,
        instance: &str,
        tap: &TapRecorder,
        install_error: Option<String>,
        teardown: TeardownReport,
        artifacts_dir: PathBuf,
    ) -> Self {
        let lines = tap.lines();
        let failed = lines.iter().filter(|l| !l.ok).count();
        let planned = tap.plan();
        let executed = tap.executed();

        let outcome = if executed != planned {
            ScenarioOutcome::PlanMismatch {
                planned,
                executed,
                failed,
            }
        } else if failed > 0 {
            ScenarioOutcome::AssertionFailures { failed }
        } else {
            ScenarioOutcome::Passed
        };

        Self {
            name: name.to_string(),
            instance: instance.to_string(),
            planned,
            executed,
            lines,
            outcome,
            install_error,
            teardown,
            artifacts_dir,
        }
    }

    /// Report for a scenario that never produced a context (unreadable
    /// file, crashed worker).
    pub fn aborted(name: &str, planned: usize, reason: &str) -> Self {
        Self {
            name: name.to_string(),
            instance: String::new(),
            planned,
            executed: 0,
            lines: Vec::new(),
            outcome: ScenarioOutcome::PlanMismatch {
                planned,
                executed: 0,
                failed: 0,
            },
            install_error: Some(reason.to_string()),
            teardown: TeardownReport {
                instance: String::new(),
                attempted: false,
                removed: false,
                error: None,
            },
            artifacts_dir: PathBuf::new(),
        }
    }

    pub fn failed(&self) -> usize {
        self.lines.iter().filter(|l| !l.ok).count()
    }

    pub fn passed(&self) -> bool {
        self.exit_code() == EXIT_OK
    }

    /// 0 = pass, 1 = assertion failures, 2 = harness-contract failure.
    /// A harness failure outranks assertion failures.
    pub fn exit_code(&self) -> i32 {
        if self.teardown.error.is_some() {
            return EXIT_HARNESS_FAILURE;
        }
        match self.outcome {
            ScenarioOutcome::Passed => EXIT_OK,
            ScenarioOutcome::AssertionFailures { .. } => EXIT_ASSERTION_FAILURE,
            ScenarioOutcome::PlanMismatch { .. } => EXIT_HARNESS_FAILURE,
        }
    }

    /// `# <name>: planned N, ran M, failed F`
    pub fn summary_line(&self) -> String {
        format!(
            "# {}: planned {}, ran {}, failed {}",
            self.name,
            self.planned,
            self.executed,
            self.failed()
        )
    }

    /// Full TAP document: plan line, assertion lines, diagnostics, summary.
    pub fn render_tap(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("1..{}\n", self.planned));
        for line in &self.lines {
            out.push_str(&line.to_string());
            out.push('\n');
        }
        if let Some(ref err) = self.install_error {
            out.push_str(&format!("# installation failed: {}\n", err));
        }
        if self.teardown.attempted {
            match self.teardown.error {
                Some(ref err) => out.push_str(&format!(
                    "# teardown of {} failed: {}\n",
                    self.teardown.instance, err
                )),
                None => out.push_str(&format!("# teardown: purged {}\n", self.teardown.instance)),
            }
        }
        out.push_str(&self.summary_line());
        out.push('\n');
        if let ScenarioOutcome::PlanMismatch {
            planned, executed, ..
        } = self.outcome
        {
            out.push_str(&format!(
                "# harness error: planned {} assertions but ran {}\n",
                planned, executed
            ));
        }
        out
    }
}

/// One TAP stream for a whole run. A single scenario is printed as is;
/// several become indented subtests under a top-level plan, one `ok` line
/// per scenario, so the stream carries exactly one top-level plan.
pub fn render_tap_stream(reports: &[ScenarioReport]) -> String {
    if let [only] = reports {
        return only.render_tap();
    }
    let mut out = format!("1..{}\n", reports.len());
    for (i, report) in reports.iter().enumerate() {
        out.push_str(&format!("# Subtest: {}\n", report.name));
        for line in report.render_tap().lines() {
            out.push_str("    ");
            out.push_str(line);
            out.push('\n');
        }
        let status = if report.passed() { "ok" } else { "not ok" };
        out.push_str(&format!("{} {} - {}\n", status, i + 1, report.name));
    }
    out
}
