//! Scenario Executor: runs a scenario definition step by step.
//!
//! The executor:
//! 1. Declares the plan (`Init`)
//! 2. Installs the scenario's suite, if any (`Installed`)
//! 3. Executes each step in order, continuing past failed assertions
//! 4. Purges the instance unconditionally (`Teardown`)
//! 5. Returns the report (`Reported`)
//!
//! If installation fails no step runs; the missing assertions surface as a
//! plan mismatch.

use std::path::PathBuf;

use crate::config::HarnessConfig;
use crate::engine::Engine;
use crate::scenario::context::ScenarioContext;
use crate::scenario::report::ScenarioReport;
use crate::scenario::schema::{resolve_run_args, ScenarioDefinition, ScenarioStep};
use crate::suite::SuiteInstaller;

/// Shared, cheaply cloned scenario runner.
#[derive(Debug, Clone)]
pub struct ScenarioExecutor {
    engine: Engine,
    installer: SuiteInstaller,
    artifacts_root: PathBuf,
}

impl ScenarioExecutor {
    pub fn new(engine: Engine, installer: SuiteInstaller, artifacts_root: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            installer,
            artifacts_root: artifacts_root.into(),
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(config.engine(), config.installer(), &config.artifacts_dir)
    }

    pub fn installer(&self) -> &SuiteInstaller {
        &self.installer
    }

    /// Create a context for hand-written scenarios using the Rust API.
    pub fn context(&self, name: &str, plan: usize) -> ScenarioContext {
        ScenarioContext::new(
            name,
            plan,
            self.engine.clone(),
            self.installer.clone(),
            &self.artifacts_root,
        )
    }

    /// Execute a scenario definition.
    pub async fn execute(&self, def: &ScenarioDefinition) -> ScenarioReport {
        let mut ctx = self.context(&def.name, def.tests);
        tracing::info!(
            "[ScenarioExecutor] {} ({} planned, instance {})",
            def.name,
            def.tests,
            ctx.instance_name()
        );

        // Installing copies a whole template; keep it off the async workers.
        let template = def.suite.clone();
        let installed = tokio::task::spawn_blocking(move || {
            let ready = match template {
                Some(ref template) => ctx.install(template).is_ok(),
                None => ctx.begin().is_ok(),
            };
            (ctx, ready)
        })
        .await;
        let (ctx, ready) = match installed {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!("[ScenarioExecutor] {} install task failed: {}", def.name, e);
                return ScenarioReport::aborted(&def.name, def.tests, &format!("install task failed: {}", e));
            }
        };

        if ready {
            for (i, step) in def.steps.iter().enumerate() {
                tracing::debug!("[ScenarioExecutor] {} step {}/{}", def.name, i + 1, def.steps.len());
                if let Err(e) = self.execute_step(&ctx, &def.name, step).await {
                    // Only phase violations reach here; stop rather than
                    // record assertions against a broken context.
                    tracing::error!("[ScenarioExecutor] {} halted: {}", def.name, e);
                    break;
                }
            }
        }

        let report = match tokio::task::spawn_blocking(move || ctx.finish()).await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!("[ScenarioExecutor] {} teardown task failed: {}", def.name, e);
                ScenarioReport::aborted(&def.name, def.tests, &format!("teardown task failed: {}", e))
            }
        };
        tracing::info!(
            "[ScenarioExecutor] {} finished with exit code {}",
            report.name,
            report.exit_code()
        );
        report
    }

    async fn execute_step(
        &self,
        ctx: &ScenarioContext,
        base: &str,
        step: &ScenarioStep,
    ) -> crate::error::HarnessResult<()> {
        let description = step.description(base);
        match step {
            ScenarioStep::Run {
                run, expect_exit, ..
            } => {
                let label = step.run_label().unwrap_or_else(|| "run".to_string());
                let args = resolve_run_args(run, ctx.installed_instance());
                ctx.expect_exit(*expect_exit, &label, &description, &args)
                    .await?;
            }
            ScenarioStep::Grep { grep, artifact, .. } => {
                ctx.check_pattern(&description, grep, step.pattern_kind(), artifact, true);
            }
            ScenarioStep::Absent {
                absent, artifact, ..
            } => {
                ctx.check_pattern(&description, absent, step.pattern_kind(), artifact, false);
            }
            ScenarioStep::Equals {
                equals, artifact, ..
            } => {
                ctx.assert_equals(&description, equals, artifact);
            }
            ScenarioStep::Empty { empty, .. } => {
                ctx.assert_empty(&description, empty);
            }
            ScenarioStep::Skip { skip } => {
                ctx.skip(skip.count, &skip.reason);
            }
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::scenario::report::ScenarioOutcome;
    use tempfile::TempDir;

    fn executor(tmp: &TempDir) -> ScenarioExecutor {
        let template = tmp.path().join("templates").join("basic");
        std::fs::create_dir_all(&template).unwrap();
        std::fs::write(template.join("flow.cylc"), "[scheduling]\n").unwrap();
        let run_dir = tmp.path().join("run");
        ScenarioExecutor::new(
            Engine::new("sh", &run_dir),
            SuiteInstaller::new(tmp.path().join("templates"), &run_dir),
            tmp.path().join("artifacts"),
        )
    }

    #[tokio::test]
    async fn test_instance_name_reaches_engine() {
        let tmp = TempDir::new().unwrap();
        let yaml = r#"
tests: 2
suite: basic
steps:
  - run: [-c, 'test -f "$SUITECHECK_RUN_DIR/$0/flow.cylc" && echo found', "{instance}"]
    label: check
  - grep: found
    in: check.stdout
"#;
        let def = ScenarioDefinition::from_yaml(yaml, "reach").unwrap();
        let report = executor(&tmp).execute(&def).await;
        assert_eq!(report.outcome, ScenarioOutcome::Passed, "{}", report.render_tap());
        assert!(report.teardown.removed);
    }

    #[tokio::test]
    async fn test_missing_template_skips_steps() {
        let tmp = TempDir::new().unwrap();
        let yaml = r#"
tests: 1
suite: not-there
steps:
  - run: [-c, "exit 0"]
"#;
        let def = ScenarioDefinition::from_yaml(yaml, "missing").unwrap();
        let report = executor(&tmp).execute(&def).await;
        assert_eq!(report.executed, 0);
        assert_eq!(report.exit_code(), 2);
        assert!(report.install_error.unwrap().contains("not found"));
        assert!(report.teardown.attempted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_scenarios_install_and_purge() {
        let tmp = TempDir::new().unwrap();
        let exec = executor(&tmp);
        let yaml = "tests: 1\nsuite: basic\nsteps:\n  - run: [-c, \"exit 0\"]\n";
        let mut set = tokio::task::JoinSet::new();
        for i in 0..4 {
            let exec = exec.clone();
            let def = ScenarioDefinition::from_yaml(yaml, &format!("par-{}", i)).unwrap();
            set.spawn(async move { exec.execute(&def).await });
        }
        while let Some(report) = set.join_next().await {
            let report = report.unwrap();
            assert!(report.passed(), "{}", report.render_tap());
            assert!(report.teardown.removed);
        }
        assert!(exec.installer().list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_skip_step_counts_toward_plan() {
        let tmp = TempDir::new().unwrap();
        let yaml = r#"
tests: 3
steps:
  - run: [-c, "exit 0"]
    label: noop
  - skip: { count: 2, reason: not on this platform }
"#;
        let def = ScenarioDefinition::from_yaml(yaml, "skips").unwrap();
        let report = executor(&tmp).execute(&def).await;
        assert!(report.passed(), "{}", report.render_tap());
        assert!(report.render_tap().contains("ok 3 # SKIP not on this platform"));
    }
}
