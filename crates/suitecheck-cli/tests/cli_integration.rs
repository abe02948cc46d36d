//! Integration tests for the suitecheck binary.
//!
//! Each test runs the real binary in a temporary directory with the
//! engine, runtime root and templates pointed at test fixtures.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

const FAKE_ENGINE: &str = r#"#!/bin/sh
[ "$1" = validate ] || exit 2
if grep -q broken "$SUITECHECK_RUN_DIR/$2/flow.cylc"; then
  echo "IllegalItemError: broken" >&2
  exit 1
fi
echo valid
"#;

fn setup() -> TempDir {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    let engine = root.join("engine");
    std::fs::write(&engine, FAKE_ENGINE).unwrap();
    std::fs::set_permissions(&engine, std::fs::Permissions::from_mode(0o755)).unwrap();

    std::fs::create_dir_all(root.join("templates/broken")).unwrap();
    std::fs::write(root.join("templates/broken/flow.cylc"), "broken\n").unwrap();
    std::fs::create_dir_all(root.join("scenarios")).unwrap();
    std::fs::write(
        root.join("scenarios/01-broken.yaml"),
        r#"
tests: 2
suite: broken
steps:
  - run: [validate]
    expect_exit: 1
  - grep: "IllegalItemError: broken"
    in: validate.stderr
"#,
    )
    .unwrap();
    std::fs::write(
        root.join("ci.yaml"),
        r#"
name: test
matrix:
  os: [linux, mac]
  runtime: ["3.9"]
gates:
  style_os: linux
commands:
  style: 'true'
  unit: 'true'
"#,
    )
    .unwrap();
    tmp
}

fn suitecheck(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_suitecheck"))
        .args(args)
        .current_dir(dir)
        .env("SUITECHECK_ENGINE", dir.join("engine"))
        .env("SUITECHECK_RUN_DIR", dir.join("run"))
        .env("SUITECHECK_TEMPLATES", dir.join("templates"))
        .env("SUITECHECK_ARTIFACTS", dir.join("artifacts"))
        .env_remove("SUITECHECK_CONFIG")
        .env_remove("SUITECHECK_JOBS")
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run suitecheck")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).to_string()
}

#[test]
fn test_scenario_run_prints_tap() {
    let tmp = setup();
    let out = suitecheck(tmp.path(), &["scenario", "run", "scenarios", "--jobs", "2"]);
    let text = stdout(&out);
    assert_eq!(out.status.code(), Some(0), "{}", text);
    assert!(text.starts_with("1..2\n"), "{}", text);
    assert!(text.contains("ok 1 - 01-broken-validate"), "{}", text);
    assert!(text.contains("ok 2 - 01-broken-grep-validate.stderr"), "{}", text);
    assert_eq!(std::fs::read_dir(tmp.path().join("run")).unwrap().count(), 0);
}

#[test]
fn test_scenario_run_json_and_failure_exit_code() {
    let tmp = setup();
    std::fs::write(
        tmp.path().join("scenarios/02-wrong.yaml"),
        "tests: 1\nsuite: broken\nsteps:\n  - run: [validate]\n",
    )
    .unwrap();
    let out = suitecheck(
        tmp.path(),
        &["scenario", "run", "scenarios/02-wrong.yaml", "--format", "json"],
    );
    assert_eq!(out.status.code(), Some(1));
    let reports: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(reports[0]["name"], "02-wrong");
    assert_eq!(reports[0]["outcome"]["kind"], "assertion_failures");
}

#[test]
fn test_unparseable_scenario_is_harness_failure() {
    let tmp = setup();
    std::fs::write(tmp.path().join("scenarios/bad.yaml"), "steps: [[[").unwrap();
    let out = suitecheck(tmp.path(), &["scenario", "run", "scenarios"]);
    assert_eq!(out.status.code(), Some(2));

    let text = stdout(&out);
    assert!(text.starts_with("1..2\n# Subtest: 01-broken\n    1..2\n"), "{}", text);
    assert_eq!(text.lines().filter(|l| l.starts_with("1..")).count(), 1, "{}", text);
    assert!(text.contains("\nok 1 - 01-broken\n"), "{}", text);
    assert!(text.contains("\nnot ok 2 - bad\n"), "{}", text);
}

#[test]
fn test_scenario_check() {
    let tmp = setup();
    let out = suitecheck(tmp.path(), &["scenario", "check", "scenarios"]);
    assert_eq!(out.status.code(), Some(0), "{}", stdout(&out));

    std::fs::write(
        tmp.path().join("scenarios/03-miscount.yaml"),
        "tests: 5\nsteps:\n  - run: [validate]\n",
    )
    .unwrap();
    let out = suitecheck(tmp.path(), &["scenario", "check", "scenarios"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stdout(&out).contains("declares 5 tests"));
}

#[test]
fn test_suite_install_list_purge() {
    let tmp = setup();
    let out = suitecheck(tmp.path(), &["suite", "install", "broken", "--name", "by-hand"]);
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(stdout(&out).trim(), "by-hand");
    assert!(tmp.path().join("run/by-hand/flow.cylc").is_file());

    let out = suitecheck(tmp.path(), &["suite", "install", "broken", "--name", "by-hand"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("Error:"));

    let out = suitecheck(tmp.path(), &["suite", "list"]);
    assert!(stdout(&out).contains("by-hand"));

    for _ in 0..2 {
        let out = suitecheck(tmp.path(), &["suite", "purge", "by-hand"]);
        assert_eq!(out.status.code(), Some(0));
    }
    assert!(!tmp.path().join("run/by-hand").exists());
}

#[test]
fn test_dotenv_feeds_env_fallbacks() {
    let tmp = setup();
    let from_dotenv = tmp.path().join("from-dotenv");
    std::fs::write(
        tmp.path().join(".env"),
        format!("SUITECHECK_RUN_DIR={}\n", from_dotenv.display()),
    )
    .unwrap();

    let out = Command::new(env!("CARGO_BIN_EXE_suitecheck"))
        .args(["suite", "list"])
        .current_dir(tmp.path())
        .env("SUITECHECK_TEMPLATES", tmp.path().join("templates"))
        .env_remove("SUITECHECK_RUN_DIR")
        .env_remove("SUITECHECK_CONFIG")
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run suitecheck");
    assert_eq!(out.status.code(), Some(0));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(
        stderr.contains(&format!("No suite instances under {}", from_dotenv.display())),
        "{}",
        stderr
    );
}

#[test]
fn test_pipeline_plan_json() {
    let tmp = setup();
    let out = suitecheck(tmp.path(), &["pipeline", "plan", "--config", "ci.yaml", "--format", "json"]);
    assert_eq!(out.status.code(), Some(0));
    let plan: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(plan["fail_fast"], false);
    let jobs = plan["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 2);
    let kinds = |i: usize| -> Vec<String> {
        jobs[i]["stages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["kind"].as_str().unwrap().to_string())
            .collect()
    };
    assert!(kinds(0).contains(&"style".to_string()));
    assert!(!kinds(1).contains(&"style".to_string()));
}

#[test]
fn test_pipeline_render_to_file() {
    let tmp = setup();
    let out = suitecheck(
        tmp.path(),
        &["pipeline", "render", "--config", "ci.yaml", "-o", "workflow.yml"],
    );
    assert_eq!(out.status.code(), Some(0));
    let text = std::fs::read_to_string(tmp.path().join("workflow.yml")).unwrap();
    assert!(text.contains("fail-fast: false"));
    assert!(text.contains("cancel-in-progress: true"));
}

#[test]
fn test_pipeline_run_single_os() {
    let tmp = setup();
    let out = Command::new(env!("CARGO_BIN_EXE_suitecheck"))
        .args([
            "pipeline", "run", "--config", "ci.yaml", "--ref", "master", "--os", "linux",
        ])
        .current_dir(tmp.path())
        .env("CODECOV_TOKEN", "token")
        .output()
        .unwrap();
    let text = stdout(&out);
    assert_eq!(out.status.code(), Some(0), "{}", text);
    assert!(text.starts_with("1..1\n"), "{}", text);
    assert!(text.contains("ok 1 - linux-3.9"), "{}", text);
}

#[test]
fn test_pipeline_run_untriggered_branch() {
    let tmp = setup();
    let out = suitecheck(
        tmp.path(),
        &["pipeline", "run", "--config", "ci.yaml", "--ref", "feature/x"],
    );
    assert_eq!(out.status.code(), Some(0));
    assert!(out.stdout.is_empty());
}
