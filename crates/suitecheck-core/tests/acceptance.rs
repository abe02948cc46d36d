//! End-to-end scenario runs against a fake engine.
//!
//! The fake engine is a shell script that understands `validate <instance>`:
//! it reads the instance's `flow.cylc` from `$SUITECHECK_RUN_DIR` and, if
//! the file mixes old and new graph sections, prints a two-line diagnostic
//! on stderr and exits 1.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use suitecheck_core::scenario::{ScenarioDefinition, ScenarioExecutor, ScenarioOutcome};
use suitecheck_core::{Engine, SuiteInstaller};
use tempfile::TempDir;

const FAKE_ENGINE: &str = r#"#!/bin/sh
cmd="$1"; shift
case "$cmd" in
  validate)
    flow="$SUITECHECK_RUN_DIR/$1/flow.cylc"
    if [ ! -f "$flow" ]; then
      echo "WorkflowFilesError: no flow.cylc in $1" >&2
      exit 1
    fi
    if grep -q '\[\[dependencies\]\]' "$flow" && grep -q '\[\[graph\]\]' "$flow"; then
      printf '%s\n%s\n' 'Conflicting syntax: pre-8 "[scheduling][dependencies][X]graph"' 'vs 8 "[scheduling][graph]X"' >&2
      exit 1
    fi
    echo "Valid for cylc-8"
    ;;
  *)
    echo "unknown command $cmd" >&2
    exit 2
    ;;
esac
"#;

const CONFLICTING_FLOW: &str = r#"[scheduling]
    [[dependencies]]
        [[[R1]]]
            graph = foo
    [[graph]]
        R1 = bar
[runtime]
    [[foo, bar]]
"#;

const SCENARIO: &str = r#"
tests: 2
suite: conflicting
steps:
  - run: [validate]
    label: validate
    expect_exit: 1
  - grep: |-
      Conflicting syntax: pre-8 "[scheduling][dependencies][X]graph"\
      vs 8 "[scheduling][graph]X"
    in: validate.stderr
"#;

struct Fixture {
    _tmp: TempDir,
    executor: ScenarioExecutor,
    artifacts: PathBuf,
}

fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let engine_path = tmp.path().join("fake-engine");
    std::fs::write(&engine_path, FAKE_ENGINE).unwrap();
    std::fs::set_permissions(&engine_path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let templates = tmp.path().join("templates");
    write(&templates.join("conflicting").join("flow.cylc"), CONFLICTING_FLOW);
    write(
        &templates.join("valid").join("flow.cylc"),
        "[scheduling]\n    [[graph]]\n        R1 = foo\n",
    );

    let run_dir = tmp.path().join("run");
    let artifacts = tmp.path().join("artifacts");
    let executor = ScenarioExecutor::new(
        Engine::new(engine_path.to_string_lossy().to_string(), &run_dir),
        SuiteInstaller::new(&templates, &run_dir),
        &artifacts,
    );
    Fixture {
        _tmp: tmp,
        executor,
        artifacts,
    }
}

fn write(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

#[tokio::test]
async fn test_conflicting_syntax_scenario_passes() {
    let fx = fixture();
    let def = ScenarioDefinition::from_yaml(SCENARIO, "02-conflicting-syntax").unwrap();

    let report = fx.executor.execute(&def).await;
    let tap = report.render_tap();

    assert!(tap.starts_with("1..2\n"), "{}", tap);
    assert!(tap.contains("ok 1 - 02-conflicting-syntax-validate\n"), "{}", tap);
    assert!(tap.contains("ok 2 - 02-conflicting-syntax-grep-validate.stderr\n"), "{}", tap);
    assert!(!tap.contains("not ok"), "{}", tap);
    assert_eq!(report.exit_code(), 0);

    // Captured streams survive teardown; the instance does not.
    let stderr = std::fs::read_to_string(report.artifacts_dir.join("validate.stderr")).unwrap();
    assert!(stderr.starts_with("Conflicting syntax"));
    assert!(report.artifacts_dir.starts_with(&fx.artifacts));
    assert!(report.teardown.removed);
    assert!(fx.executor.installer().list().unwrap().is_empty());
}

#[tokio::test]
async fn test_altered_diagnostic_fails_and_still_purges() {
    let fx = fixture();
    let altered = SCENARIO.replace("pre-8", "pre-9");
    let def = ScenarioDefinition::from_yaml(&altered, "02-conflicting-syntax").unwrap();

    let report = fx.executor.execute(&def).await;
    let tap = report.render_tap();

    assert!(tap.contains("ok 1 - 02-conflicting-syntax-validate\n"), "{}", tap);
    assert!(tap.contains("not ok 2 - 02-conflicting-syntax-grep-validate.stderr\n"), "{}", tap);
    assert_eq!(report.outcome, ScenarioOutcome::AssertionFailures { failed: 1 });
    assert_ne!(report.exit_code(), 0);
    assert!(report.teardown.attempted);
    assert!(report.teardown.error.is_none());
    assert!(fx.executor.installer().list().unwrap().is_empty());
}

#[tokio::test]
async fn test_valid_flow_has_empty_stderr() {
    let fx = fixture();
    let yaml = r#"
tests: 3
suite: valid
steps:
  - run: [validate]
  - empty: validate.stderr
  - equals: Valid for cylc-8
    in: validate.stdout
"#;
    let def = ScenarioDefinition::from_yaml(yaml, "01-valid").unwrap();
    let report = fx.executor.execute(&def).await;
    assert!(report.passed(), "{}", report.render_tap());
}

#[tokio::test]
async fn test_missing_template_is_plan_mismatch() {
    let fx = fixture();
    let yaml = SCENARIO.replace("suite: conflicting", "suite: no-such-template");
    let def = ScenarioDefinition::from_yaml(&yaml, "03-missing").unwrap();

    let report = fx.executor.execute(&def).await;
    assert!(report.install_error.is_some());
    assert_eq!(report.executed, 0);
    assert!(matches!(report.outcome, ScenarioOutcome::PlanMismatch { planned: 2, .. }));
    assert_eq!(report.exit_code(), 2);
    assert!(report.render_tap().contains("# harness error: planned 2 assertions but ran 0"));
}

#[tokio::test]
async fn test_under_declared_plan_is_harness_failure() {
    let fx = fixture();
    let yaml = SCENARIO.replace("tests: 2", "tests: 3");
    let def = ScenarioDefinition::from_yaml(&yaml, "04-plan").unwrap();
    let report = fx.executor.execute(&def).await;
    assert_eq!(report.executed, 2);
    assert_eq!(report.exit_code(), 2);
}
