//! Per-scenario runtime: lifecycle state, assertion primitives, teardown.
//!
//! ```text
//! Init ──install()/begin()──► Installed ──teardown()──► Teardown ──finish()──► Reported
//! ```
//!
//! Engine invocations are only permitted in `Installed`. Assertions never
//! abort the scenario; a failed one records `not ok` and returns `false`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::{Engine, InvocationResult};
use crate::error::{HarnessError, HarnessResult};
use crate::scenario::report::{ScenarioReport, TeardownReport};
use crate::suite::{self, SuiteGuard, SuiteInstaller};
use crate::tap::{pattern, PatternKind, TapRecorder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioPhase {
    Init,
    Installed,
    Teardown,
    Reported,
}

pub struct ScenarioContext {
    name: String,
    instance_name: String,
    phase: ScenarioPhase,
    tap: TapRecorder,
    engine: Engine,
    installer: SuiteInstaller,
    guard: Option<SuiteGuard>,
    artifacts_dir: PathBuf,
    install_error: Option<String>,
    /// The instance name belonged to someone else's live instance
    collided: bool,
    teardown: Option<TeardownReport>,
}

impl ScenarioContext {
    /// Enter `Init` with the declared plan. Artifacts for this run go to
    /// `<artifacts_root>/<instance name>/`.
    pub fn new(
        name: &str,
        plan: usize,
        engine: Engine,
        installer: SuiteInstaller,
        artifacts_root: &Path,
    ) -> Self {
        let instance_name = suite::instance_name(name);
        let artifacts_dir = artifacts_root.join(&instance_name);
        Self {
            name: name.to_string(),
            instance_name,
            phase: ScenarioPhase::Init,
            tap: TapRecorder::new(plan),
            engine,
            installer,
            guard: None,
            artifacts_dir,
            install_error: None,
            collided: false,
            teardown: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> ScenarioPhase {
        self.phase
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Instance name if a suite is installed.
    pub fn installed_instance(&self) -> Option<&str> {
        self.guard.as_ref().map(SuiteGuard::name)
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    pub fn tap(&self) -> &TapRecorder {
        &self.tap
    }

    /// Install `template` under this scenario's instance name.
    pub fn install(&mut self, template: &str) -> HarnessResult<()> {
        self.require(ScenarioPhase::Init, "install")?;
        match SuiteGuard::install(&self.installer, template, &self.instance_name) {
            Ok(guard) => {
                self.guard = Some(guard);
                self.phase = ScenarioPhase::Installed;
                Ok(())
            }
            Err(e) => {
                tracing::warn!("[Scenario:{}] Installation failed: {}", self.name, e);
                self.collided = matches!(e, HarnessError::Collision(_));
                self.install_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Enter `Installed` without a suite, for scenarios that only exercise
    /// engine commands which take no instance.
    pub fn begin(&mut self) -> HarnessResult<()> {
        self.require(ScenarioPhase::Init, "begin")?;
        self.phase = ScenarioPhase::Installed;
        Ok(())
    }

    fn require(&self, phase: ScenarioPhase, action: &str) -> HarnessResult<()> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(HarnessError::Engine(format!(
                "cannot {} while scenario '{}' is in phase {:?}",
                action, self.name, self.phase
            )))
        }
    }

    /// Run the engine, record whether it exited with `expected`, and write
    /// `<label>.stdout` / `<label>.stderr` whatever the outcome.
    ///
    /// A binary that cannot be spawned is recorded as a failed assertion with
    /// the spawn error in the captured stderr.
    pub async fn expect_exit(
        &self,
        expected: i32,
        label: &str,
        description: &str,
        args: &[String],
    ) -> HarnessResult<InvocationResult> {
        self.require(ScenarioPhase::Installed, "invoke the engine")?;

        let result = match self.engine.invoke(args).await {
            Ok(result) => result,
            Err(e) => InvocationResult {
                args: args.to_vec(),
                exit_code: None,
                stdout: Vec::new(),
                stderr: format!("{}\n", e).into_bytes(),
                timed_out: false,
                duration_ms: 0,
            },
        };

        if let Err(e) = result.write_artifacts(&self.artifacts_dir, label) {
            tracing::warn!("[Scenario:{}] Could not write artifacts for {}: {}", self.name, label, e);
        }

        let ok = result.exit_code == Some(expected);
        if !ok {
            tracing::info!(
                "[Scenario:{}] {} exited with {:?}, expected {}",
                self.name,
                label,
                result.exit_code,
                expected
            );
        }
        self.tap.record(ok, description);
        Ok(result)
    }

    /// Literal match of `pattern` in a captured stream such as
    /// `validate.stderr`.
    pub fn assert_pattern(&self, pattern: &str, artifact: &str) -> bool {
        let description = format!("{}-grep-{}", self.name, artifact);
        self.check_pattern(&description, pattern, PatternKind::Literal, artifact, true)
    }

    /// Regex match in a captured stream.
    pub fn assert_regex(&self, pattern: &str, artifact: &str) -> bool {
        let description = format!("{}-grep-{}", self.name, artifact);
        self.check_pattern(&description, pattern, PatternKind::Regex, artifact, true)
    }

    /// Pattern check with explicit description, kind and polarity.
    pub fn check_pattern(
        &self,
        description: &str,
        pattern: &str,
        kind: PatternKind,
        artifact: &str,
        expect_present: bool,
    ) -> bool {
        let ok = match self.read_artifact(artifact) {
            Some(captured) => match pattern::matches(pattern, kind, &captured) {
                Ok(found) => found == expect_present,
                Err(e) => {
                    tracing::warn!("[Scenario:{}] {}", self.name, e);
                    false
                }
            },
            None => false,
        };
        self.tap.record(ok, description);
        ok
    }

    /// Whole-stream comparison.
    pub fn assert_equals(&self, description: &str, expected: &str, artifact: &str) -> bool {
        let ok = self
            .read_artifact(artifact)
            .map(|captured| pattern::equals(expected, &captured))
            .unwrap_or(false);
        self.tap.record(ok, description);
        ok
    }

    pub fn assert_empty(&self, description: &str, artifact: &str) -> bool {
        let ok = self
            .read_artifact(artifact)
            .map(|captured| captured.iter().all(u8::is_ascii_whitespace))
            .unwrap_or(false);
        self.tap.record(ok, description);
        ok
    }

    /// Record an arbitrary judgement.
    pub fn record(&self, ok: bool, description: &str) -> bool {
        self.tap.record(ok, description);
        ok
    }

    pub fn skip(&self, count: usize, reason: &str) {
        self.tap.skip(count, reason);
    }

    fn read_artifact(&self, artifact: &str) -> Option<Vec<u8>> {
        if artifact.contains('/') || artifact.contains('\\') || artifact.starts_with('.') {
            tracing::warn!("[Scenario:{}] Refusing artifact path '{}'", self.name, artifact);
            return None;
        }
        match std::fs::read(self.artifacts_dir.join(artifact)) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!("[Scenario:{}] Missing artifact '{}': {}", self.name, artifact, e);
                None
            }
        }
    }

    /// Purge the instance. Always attempted, including after a failed or
    /// skipped installation, except when installation collided with a live
    /// instance this scenario does not own. Safe to call more than once.
    pub fn teardown(&mut self) -> TeardownReport {
        if let Some(ref report) = self.teardown {
            return report.clone();
        }
        self.phase = ScenarioPhase::Teardown;

        if self.guard.is_none() && self.collided {
            tracing::warn!(
                "[Scenario:{}] Leaving {} in place: it belongs to another run",
                self.name,
                self.instance_name
            );
            let report = TeardownReport {
                instance: self.instance_name.clone(),
                attempted: false,
                removed: false,
                error: None,
            };
            self.teardown = Some(report.clone());
            return report;
        }

        let result = match self.guard.as_mut() {
            Some(guard) => guard.purge(),
            None => self.installer.purge(&self.instance_name),
        };
        let report = match result {
            Ok(removed) => TeardownReport {
                instance: self.instance_name.clone(),
                attempted: true,
                removed,
                error: None,
            },
            Err(e) => {
                tracing::error!("[Scenario:{}] Teardown failed: {}", self.name, e);
                TeardownReport {
                    instance: self.instance_name.clone(),
                    attempted: true,
                    removed: false,
                    error: Some(e.to_string()),
                }
            }
        };
        self.teardown = Some(report.clone());
        report
    }

    /// Tear down if needed and produce the report.
    pub fn finish(mut self) -> ScenarioReport {
        let teardown = self.teardown();
        self.phase = ScenarioPhase::Reported;
        ScenarioReport::new(
            &self.name,
            &self.instance_name,
            &self.tap,
            self.install_error.take(),
            teardown,
            self.artifacts_dir.clone(),
        )
    }
}
