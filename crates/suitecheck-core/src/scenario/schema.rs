//! YAML schema types for acceptance scenarios.
//!
//! A scenario file declares its assertion count up front and lists the steps
//! that produce those assertions:
//!
//! ```yaml
//! tests: 2
//! suite: conflicting        # template directory to install
//!
//! steps:
//!   - run: [validate, -v]   # instance name is appended
//!     label: validate
//!     expect_exit: 1
//!
//!   - grep: |-
//!       Conflicting syntax: pre-8 "[scheduling][dependencies][X]graph"\
//!       vs 8 "[scheduling][graph]X"
//!     in: validate.stderr
//! ```
//!
//! Every step except `skip` produces exactly one assertion; `skip` produces
//! `count`. The scenario's base name is the file stem.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};
use crate::tap::PatternKind;

/// Placeholder replaced by the instance name in `run` arguments.
pub const INSTANCE_PLACEHOLDER: &str = "{instance}";

/// Top-level scenario definition loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioDefinition {
    /// Base name used in TAP descriptions and instance names. Taken from
    /// the file stem when loaded from disk.
    #[serde(default)]
    pub name: String,

    /// Optional human description
    #[serde(default)]
    pub description: Option<String>,

    /// Declared number of assertions (the plan)
    pub tests: usize,

    /// Template to install before any engine invocation
    #[serde(default)]
    pub suite: Option<String>,

    /// Ordered list of steps
    #[serde(default)]
    pub steps: Vec<ScenarioStep>,
}

/// A single step. The variant is chosen by which key is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScenarioStep {
    /// Invoke the engine and assert on its exit code
    Run {
        run: Vec<String>,
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        expect_exit: i32,
        #[serde(default)]
        name: Option<String>,
    },
    /// Assert a pattern is present in a captured stream
    Grep {
        grep: String,
        #[serde(rename = "in")]
        artifact: String,
        #[serde(default)]
        regex: bool,
        #[serde(default)]
        name: Option<String>,
    },
    /// Assert a pattern is absent from a captured stream
    Absent {
        absent: String,
        #[serde(rename = "in")]
        artifact: String,
        #[serde(default)]
        regex: bool,
        #[serde(default)]
        name: Option<String>,
    },
    /// Assert a captured stream equals the given text
    Equals {
        equals: String,
        #[serde(rename = "in")]
        artifact: String,
        #[serde(default)]
        name: Option<String>,
    },
    /// Assert a captured stream is empty
    Empty {
        empty: String,
        #[serde(default)]
        name: Option<String>,
    },
    /// Record skipped assertions
    Skip { skip: SkipSpec },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkipSpec {
    #[serde(default = "default_skip_count")]
    pub count: usize,
    pub reason: String,
}

fn default_skip_count() -> usize {
    1
}

fn pattern_kind(regex: bool) -> PatternKind {
    if regex {
        PatternKind::Regex
    } else {
        PatternKind::Literal
    }
}

impl ScenarioStep {
    /// Label under which a `run` step's streams are captured.
    pub fn run_label(&self) -> Option<String> {
        match self {
            ScenarioStep::Run { run, label, .. } => Some(
                label
                    .clone()
                    .or_else(|| run.first().cloned())
                    .unwrap_or_else(|| "run".to_string()),
            ),
            _ => None,
        }
    }

    /// Artifact this step reads, if any.
    pub fn artifact(&self) -> Option<&str> {
        match self {
            ScenarioStep::Grep { artifact, .. }
            | ScenarioStep::Absent { artifact, .. }
            | ScenarioStep::Equals { artifact, .. } => Some(artifact),
            ScenarioStep::Empty { empty, .. } => Some(empty),
            _ => None,
        }
    }

    pub fn pattern_kind(&self) -> PatternKind {
        match self {
            ScenarioStep::Grep { regex, .. } | ScenarioStep::Absent { regex, .. } => {
                pattern_kind(*regex)
            }
            _ => PatternKind::Literal,
        }
    }

    /// How many assertions this step records.
    pub fn assertion_count(&self) -> usize {
        match self {
            ScenarioStep::Skip { skip } => skip.count,
            _ => 1,
        }
    }

    /// TAP description for this step within scenario `base`.
    pub fn description(&self, base: &str) -> String {
        let explicit = match self {
            ScenarioStep::Run { name, .. }
            | ScenarioStep::Grep { name, .. }
            | ScenarioStep::Absent { name, .. }
            | ScenarioStep::Equals { name, .. }
            | ScenarioStep::Empty { name, .. } => name.as_ref(),
            ScenarioStep::Skip { .. } => None,
        };
        if let Some(name) = explicit {
            return format!("{}-{}", base, name);
        }
        match self {
            ScenarioStep::Run { .. } => {
                format!("{}-{}", base, self.run_label().unwrap_or_default())
            }
            ScenarioStep::Grep { artifact, .. } => format!("{}-grep-{}", base, artifact),
            ScenarioStep::Absent { artifact, .. } => format!("{}-absent-{}", base, artifact),
            ScenarioStep::Equals { artifact, .. } => format!("{}-cmp-{}", base, artifact),
            ScenarioStep::Empty { empty, .. } => format!("{}-empty-{}", base, empty),
            ScenarioStep::Skip { skip } => format!("{}-skip ({})", base, skip.reason),
        }
    }
}

/// Substitute `{instance}` in run arguments, appending the instance name when
/// no argument mentions it.
pub fn resolve_run_args(args: &[String], instance: Option<&str>) -> Vec<String> {
    let Some(instance) = instance else {
        return args.to_vec();
    };
    if args.iter().any(|a| a.contains(INSTANCE_PLACEHOLDER)) {
        args.iter()
            .map(|a| a.replace(INSTANCE_PLACEHOLDER, instance))
            .collect()
    } else {
        let mut resolved = args.to_vec();
        resolved.push(instance.to_string());
        resolved
    }
}

impl ScenarioDefinition {
    /// Parse a scenario from YAML. `base_name` fills in an empty `name`.
    pub fn from_yaml(yaml: &str, base_name: &str) -> HarnessResult<Self> {
        let mut def: ScenarioDefinition = serde_yaml::from_str(yaml)
            .map_err(|e| HarnessError::Parse(format!("Failed to parse scenario YAML: {}", e)))?;
        if def.name.trim().is_empty() {
            def.name = base_name.to_string();
        }
        Ok(def)
    }

    /// Load a scenario file; the base name is the file stem.
    pub fn from_file(path: &Path) -> HarnessResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Parse(format!("Failed to read scenario '{}': {}", path.display(), e))
        })?;
        let base = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "scenario".to_string());
        Self::from_yaml(&content, &base).map_err(|e| match e {
            HarnessError::Parse(msg) => HarnessError::Parse(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Assertions the steps will record if every step runs.
    pub fn step_assertions(&self) -> usize {
        self.steps.iter().map(ScenarioStep::assertion_count).sum()
    }

    /// Static checks: run labels are unique, artifacts refer to an earlier
    /// run step, run steps need `suite` only when they use `{instance}`.
    ///
    /// A plan that disagrees with the step count is reported as a problem
    /// here but is not fatal at run time; the runner flags it as a
    /// harness-contract failure instead.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut labels: HashSet<String> = HashSet::new();

        for (i, step) in self.steps.iter().enumerate() {
            let n = i + 1;
            if let Some(label) = step.run_label() {
                if label.contains('/') || label.is_empty() {
                    problems.push(format!("step {}: invalid label '{}'", n, label));
                }
                if !labels.insert(label.clone()) {
                    problems.push(format!(
                        "step {}: duplicate run label '{}' (set an explicit label)",
                        n, label
                    ));
                }
                if let ScenarioStep::Run { run, .. } = step {
                    if self.suite.is_none() && run.iter().any(|a| a.contains(INSTANCE_PLACEHOLDER)) {
                        problems.push(format!(
                            "step {}: uses {} but the scenario installs no suite",
                            n, INSTANCE_PLACEHOLDER
                        ));
                    }
                }
            }
            if let Some(artifact) = step.artifact() {
                let label = artifact
                    .strip_suffix(".stdout")
                    .or_else(|| artifact.strip_suffix(".stderr"));
                match label {
                    Some(label) if labels.contains(label) => {}
                    Some(label) => problems.push(format!(
                        "step {}: '{}' refers to run label '{}' which has not run yet",
                        n, artifact, label
                    )),
                    None => problems.push(format!(
                        "step {}: artifact '{}' must end in .stdout or .stderr",
                        n, artifact
                    )),
                }
            }
        }

        let expected = self.step_assertions();
        if expected != self.tests {
            problems.push(format!(
                "declares {} tests but its steps record {}",
                self.tests, expected
            ));
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFLICTING: &str = r#"
tests: 2
suite: conflicting
steps:
  - run: [validate, -v]
    expect_exit: 1
  - grep: |-
      Conflicting syntax: pre-8 "[scheduling][dependencies][X]graph"\
      vs 8 "[scheduling][graph]X"
    in: validate.stderr
"#;

    #[test]
    fn test_parse_minimal_scenario() {
        let def = ScenarioDefinition::from_yaml(CONFLICTING, "02-conflicting").unwrap();
        assert_eq!(def.name, "02-conflicting");
        assert_eq!(def.tests, 2);
        assert_eq!(def.suite.as_deref(), Some("conflicting"));
        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.steps[0].run_label().as_deref(), Some("validate"));
        assert_eq!(def.steps[1].artifact(), Some("validate.stderr"));
        assert!(def.validate().is_empty(), "{:?}", def.validate());
    }

    #[test]
    fn test_block_scalar_keeps_continuation() {
        let def = ScenarioDefinition::from_yaml(CONFLICTING, "x").unwrap();
        match &def.steps[1] {
            ScenarioStep::Grep { grep, .. } => {
                assert!(grep.contains("graph\"\\\nvs 8"), "{:?}", grep);
            }
            other => panic!("expected grep step, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_all_step_kinds() {
        let yaml = r#"
tests: 6
steps:
  - run: [validate, "{instance}", --strict]
    label: strict
  - absent: "Traceback"
    in: strict.stderr
    regex: true
  - equals: "Valid"
    in: strict.stdout
    name: valid-message
  - empty: strict.stderr
  - skip:
      count: 2
      reason: needs a display
"#;
        let def = ScenarioDefinition::from_yaml(yaml, "kinds").unwrap();
        assert_eq!(def.step_assertions(), 6);
        assert!(matches!(def.steps[1], ScenarioStep::Absent { regex: true, .. }));
        assert_eq!(def.steps[2].description("kinds"), "kinds-valid-message");
        assert_eq!(def.steps[3].description("kinds"), "kinds-empty-strict.stderr");
        // {instance} without a suite is flagged.
        assert_eq!(def.validate().len(), 1);
    }

    #[test]
    fn test_validate_reports_problems() {
        let yaml = r#"
tests: 3
steps:
  - grep: "x"
    in: later.stderr
  - run: [validate]
  - run: [validate]
  - grep: "y"
    in: validate.log
"#;
        let problems = ScenarioDefinition::from_yaml(yaml, "bad").unwrap().validate();
        assert!(problems.iter().any(|p| p.contains("has not run yet")));
        assert!(problems.iter().any(|p| p.contains("duplicate run label")));
        assert!(problems.iter().any(|p| p.contains("must end in")));
        assert!(problems.iter().any(|p| p.contains("declares 3 tests")));
    }

    #[test]
    fn test_resolve_run_args() {
        let args = vec!["validate".to_string(), "-v".to_string()];
        assert_eq!(resolve_run_args(&args, Some("x-1")), vec!["validate", "-v", "x-1"]);
        let args = vec!["validate".to_string(), "{instance}//flow".to_string()];
        assert_eq!(resolve_run_args(&args, Some("x-1")), vec!["validate", "x-1//flow"]);
        assert_eq!(resolve_run_args(&args, None), args);
    }

    #[test]
    fn test_missing_tests_is_parse_error() {
        let err = ScenarioDefinition::from_yaml("steps: []\n", "x").unwrap_err();
        assert!(matches!(err, HarnessError::Parse(_)));
    }
}
