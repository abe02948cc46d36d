//! Harness configuration: `suitecheck.yaml` plus environment overrides.
//!
//! ```yaml
//! engine: cylc
//! engine_args: []
//! run_dir: /tmp/suitecheck-run
//! templates_dir: tests/templates
//! artifacts_dir: suitecheck-artifacts
//! jobs: 4
//! invocation_timeout_secs: 300
//! ```
//!
//! Every field is optional. Resolution order: explicit overrides (CLI flags,
//! which already fold in `SUITECHECK_*` env vars), then the file, then
//! defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::Engine;
use crate::error::{HarnessError, HarnessResult};
use crate::suite::SuiteInstaller;

pub const DEFAULT_CONFIG_FILE: &str = "suitecheck.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Engine binary
    pub engine: String,
    /// Arguments placed before every engine invocation
    pub engine_args: Vec<String>,
    /// Isolated runtime root for installed instances
    pub run_dir: PathBuf,
    /// Directory holding fixture templates (one sub-directory each)
    pub templates_dir: PathBuf,
    /// Where captured streams and reports are written
    pub artifacts_dir: PathBuf,
    /// Parallel scenario workers
    pub jobs: usize,
    pub invocation_timeout_secs: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            engine: "cylc".to_string(),
            engine_args: Vec::new(),
            run_dir: default_run_dir(),
            templates_dir: PathBuf::from("tests/templates"),
            artifacts_dir: PathBuf::from("suitecheck-artifacts"),
            jobs: default_jobs(),
            invocation_timeout_secs: 300,
        }
    }
}

fn default_run_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("suitecheck")
        .join("run")
}

fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Values supplied on the command line (or their env-var fallbacks).
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub engine: Option<String>,
    pub run_dir: Option<PathBuf>,
    pub templates_dir: Option<PathBuf>,
    pub artifacts_dir: Option<PathBuf>,
    pub jobs: Option<usize>,
}

impl HarnessConfig {
    pub fn from_yaml(yaml: &str) -> HarnessResult<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| HarnessError::Config(format!("Failed to parse config YAML: {}", e)))
    }

    pub fn from_file(path: &Path) -> HarnessResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("Failed to read config '{}': {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Load `path` if given (must exist), else `suitecheck.yaml` if present,
    /// else defaults; then apply overrides.
    pub fn load(path: Option<&Path>, overrides: ConfigOverrides) -> HarnessResult<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(engine) = overrides.engine {
            self.engine = engine;
        }
        if let Some(run_dir) = overrides.run_dir {
            self.run_dir = run_dir;
        }
        if let Some(templates_dir) = overrides.templates_dir {
            self.templates_dir = templates_dir;
        }
        if let Some(artifacts_dir) = overrides.artifacts_dir {
            self.artifacts_dir = artifacts_dir;
        }
        if let Some(jobs) = overrides.jobs {
            self.jobs = jobs;
        }
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if self.engine.trim().is_empty() {
            return Err(HarnessError::Config("engine must not be empty".to_string()));
        }
        if self.jobs == 0 {
            return Err(HarnessError::Config("jobs must be at least 1".to_string()));
        }
        if self.invocation_timeout_secs == 0 {
            return Err(HarnessError::Config(
                "invocation_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn installer(&self) -> SuiteInstaller {
        SuiteInstaller::new(&self.templates_dir, &self.run_dir)
    }

    pub fn engine(&self) -> Engine {
        Engine::new(&self.engine, &self.run_dir)
            .with_prefix_args(self.engine_args.clone())
            .with_timeout(Duration::from_secs(self.invocation_timeout_secs))
    }
}

/// Load `.env.local` then `.env` from the current directory. Variables that
/// are already set are left alone.
pub fn load_dotenv() -> Vec<&'static str> {
    let mut loaded = Vec::new();
    for filename in [".env.local", ".env"] {
        let Ok(content) = std::fs::read_to_string(Path::new(filename)) else {
            continue;
        };
        for (key, value) in parse_dotenv(&content) {
            if std::env::var(&key).is_err() {
                std::env::set_var(&key, &value);
            }
        }
        loaded.push(filename);
    }
    loaded
}

fn parse_dotenv(content: &str) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let mut value = value.trim();
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = &value[1..value.len() - 1];
        }
        vars.push((key.trim().to_string(), value.to_string()));
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = HarnessConfig::from_yaml("engine: my-engine\njobs: 2\n").unwrap();
        assert_eq!(config.engine, "my-engine");
        assert_eq!(config.jobs, 2);
        assert_eq!(config.invocation_timeout_secs, 300);
        assert_eq!(config.templates_dir, PathBuf::from("tests/templates"));
    }

    #[test]
    fn test_overrides_win() {
        let mut config = HarnessConfig::from_yaml("engine: from-file\n").unwrap();
        config.apply(ConfigOverrides {
            engine: Some("from-flag".to_string()),
            run_dir: Some(PathBuf::from("/tmp/x")),
            ..Default::default()
        });
        assert_eq!(config.engine, "from-flag");
        assert_eq!(config.run_dir, PathBuf::from("/tmp/x"));
    }

    #[test]
    fn test_zero_jobs_rejected() {
        let config = HarnessConfig::from_yaml("jobs: 0\n").unwrap();
        assert!(matches!(config.validate(), Err(HarnessError::Config(_))));
    }

    #[test]
    fn test_unknown_field_is_ignored_but_bad_type_is_error() {
        assert!(HarnessConfig::from_yaml("colour: blue\n").is_ok());
        assert!(HarnessConfig::from_yaml("jobs: many\n").is_err());
    }

    #[test]
    fn test_parse_dotenv() {
        let vars = parse_dotenv("# comment\nA=1\nB = \"two words\"\n\nC='x'\nnot a pair\n");
        assert_eq!(
            vars,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "two words".to_string()),
                ("C".to_string(), "x".to_string()),
            ]
        );
    }
}
