//! Bounded worker pool for running many scenarios in one process.
//!
//! At most `jobs` scenarios execute at once. Each one derives its own
//! instance name, so concurrent scenarios never share runtime state and no
//! ordering between them is assumed. Reports come back in input order.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::scenario::executor::ScenarioExecutor;
use crate::scenario::report::ScenarioReport;
use crate::scenario::schema::ScenarioDefinition;

pub async fn run_all(
    executor: &ScenarioExecutor,
    scenarios: Vec<ScenarioDefinition>,
    jobs: usize,
) -> Vec<ScenarioReport> {
    let permits = Arc::new(Semaphore::new(jobs.max(1)));
    let mut set = JoinSet::new();
    let mut reports: Vec<Option<ScenarioReport>> = vec![None; scenarios.len()];
    let identities: Vec<(String, usize)> = scenarios.iter().map(|s| (s.name.clone(), s.tests)).collect();

    for (index, def) in scenarios.into_iter().enumerate() {
        let executor = executor.clone();
        let permits = permits.clone();
        set.spawn(async move {
            let _permit = permits.acquire_owned().await;
            (index, executor.execute(&def).await)
        });
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, report)) => reports[index] = Some(report),
            Err(e) => tracing::error!("[ScenarioPool] Worker failed: {}", e),
        }
    }

    reports
        .into_iter()
        .zip(identities)
        .map(|(report, (name, planned))| {
            report.unwrap_or_else(|| ScenarioReport::aborted(&name, planned, "scenario worker crashed"))
        })
        .collect()
}

/// Highest exit code among the reports (0 when empty).
pub fn overall_exit_code(reports: &[ScenarioReport]) -> i32 {
    reports.iter().map(ScenarioReport::exit_code).max().unwrap_or(0)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::suite::SuiteInstaller;
    use std::collections::HashSet;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_parallel_scenarios_are_isolated() {
        let tmp = TempDir::new().unwrap();
        let template = tmp.path().join("templates").join("basic");
        std::fs::create_dir_all(&template).unwrap();
        std::fs::write(template.join("flow.cylc"), "[scheduling]\n").unwrap();
        let run_dir = tmp.path().join("run");
        let executor = ScenarioExecutor::new(
            Engine::new("sh", &run_dir),
            SuiteInstaller::new(tmp.path().join("templates"), &run_dir),
            tmp.path().join("artifacts"),
        );

        // Six copies of one scenario, three at a time: each must get its own
        // instance directory and find its own marker there.
        let yaml = r#"
tests: 2
suite: basic
steps:
  - run:
      - -c
      - 'touch "$SUITECHECK_RUN_DIR/$0/marker"; sleep 0.2; ls "$SUITECHECK_RUN_DIR/$0"'
      - "{instance}"
    label: mark
  - grep: marker
    in: mark.stdout
"#;
        let scenarios: Vec<ScenarioDefinition> = (0..6)
            .map(|_| ScenarioDefinition::from_yaml(yaml, "same-name").unwrap())
            .collect();

        let reports = run_all(&executor, scenarios, 3).await;
        assert_eq!(reports.len(), 6);
        assert!(reports.iter().all(ScenarioReport::passed));
        let instances: HashSet<_> = reports.iter().map(|r| r.instance.clone()).collect();
        assert_eq!(instances.len(), 6);
        assert_eq!(overall_exit_code(&reports), 0);
        assert!(executor.installer().list().unwrap().is_empty());
    }

    #[test]
    fn test_overall_exit_code() {
        let a = ScenarioReport::aborted("a", 1, "x");
        assert_eq!(overall_exit_code(&[a]), 2);
        assert_eq!(overall_exit_code(&[]), 0);
    }
}
