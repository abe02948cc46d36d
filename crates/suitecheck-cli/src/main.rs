//! suitecheck CLI: acceptance scenarios and CI matrix pipelines for a
//! workflow-engine command line.
//!
//! All behaviour lives in suitecheck-core; this binary only parses
//! arguments, resolves configuration and prints results.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use suitecheck_core::config::{load_dotenv, ConfigOverrides, HarnessConfig};

/// suitecheck: workflow-engine acceptance harness
#[derive(Parser)]
#[command(name = "suitecheck", version, about = "suitecheck: workflow-engine acceptance harness")]
pub struct Cli {
    /// Harness config file (defaults to ./suitecheck.yaml when present)
    #[arg(long = "harness-config", global = true, env = "SUITECHECK_CONFIG")]
    harness_config: Option<PathBuf>,

    /// Engine binary to invoke
    #[arg(long, global = true, env = "SUITECHECK_ENGINE")]
    engine: Option<String>,

    /// Isolated runtime root for installed suites
    #[arg(long, global = true, env = "SUITECHECK_RUN_DIR")]
    run_dir: Option<PathBuf>,

    /// Directory of suite templates
    #[arg(long, global = true, env = "SUITECHECK_TEMPLATES")]
    templates: Option<PathBuf>,

    /// Where captured streams are written
    #[arg(long, global = true, env = "SUITECHECK_ARTIFACTS")]
    artifacts_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run or check acceptance scenarios
    Scenario {
        #[command(subcommand)]
        action: ScenarioAction,
    },

    /// Install, purge and list suite instances
    Suite {
        #[command(subcommand)]
        action: SuiteAction,
    },

    /// Plan, render or run a CI matrix pipeline
    Pipeline {
        #[command(subcommand)]
        action: PipelineAction,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ReportFormat {
    Tap,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum PlanFormat {
    Json,
    Yaml,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum EventKind {
    Push,
    PullRequest,
    WorkflowDispatch,
}

#[derive(Subcommand)]
enum ScenarioAction {
    /// Run scenario files (directories are searched recursively)
    Run {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Parallel scenario workers
        #[arg(long, short = 'j', env = "SUITECHECK_JOBS")]
        jobs: Option<usize>,
        #[arg(long, value_enum, default_value = "tap")]
        format: ReportFormat,
    },
    /// Parse and statically check scenario files without running them
    Check {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

#[derive(Subcommand)]
enum SuiteAction {
    /// Install a template as a new instance
    Install {
        template: String,
        /// Instance name (default: template name plus a random suffix)
        #[arg(long)]
        name: Option<String>,
    },
    /// Remove an instance; succeeds if it is already gone
    Purge { name: String },
    /// List installed instances
    List,
}

#[derive(Subcommand)]
enum PipelineAction {
    /// Print the expanded job matrix
    Plan {
        #[arg(long = "config", short = 'c')]
        pipeline: PathBuf,
        #[arg(long, value_enum, default_value = "yaml")]
        format: PlanFormat,
    },
    /// Render the pipeline as a GitHub Actions workflow
    Render {
        #[arg(long = "config", short = 'c')]
        pipeline: PathBuf,
        /// Write to a file instead of stdout
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
    /// Run the pipeline locally
    Run {
        #[arg(long = "config", short = 'c')]
        pipeline: PathBuf,
        /// Branch name, or pull request number for pull_request events
        #[arg(long = "ref")]
        reference: String,
        #[arg(long, value_enum, default_value = "push")]
        event: EventKind,
        /// The pull request comes from a fork (no upload token)
        #[arg(long)]
        fork: bool,
        /// Only run jobs for this OS
        #[arg(long)]
        os: Option<String>,
        /// Working directory for run state and artifacts
        #[arg(long, default_value = "suitecheck-pipeline")]
        work_dir: PathBuf,
        /// Maximum concurrent jobs
        #[arg(long)]
        max_parallel: Option<usize>,
        #[arg(long, value_enum, default_value = "tap")]
        format: ReportFormat,
    },
}

#[tokio::main]
async fn main() {
    // Before parsing: clap reads the SUITECHECK_* fallbacks from the
    // environment.
    let dotenv_files = load_dotenv();
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries TAP and reports.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "suitecheck_core=warn,suitecheck_cli=info".into()),
        )
        .init();

    for file in dotenv_files {
        tracing::info!("[Config] Loaded environment from '{}'", file);
    }

    let result = match cli.command {
        Commands::Scenario { action } => match action {
            ScenarioAction::Run {
                paths,
                jobs,
                format,
            } => match resolve_config(
                cli.harness_config.as_deref(),
                ConfigOverrides {
                    engine: cli.engine,
                    run_dir: cli.run_dir,
                    templates_dir: cli.templates,
                    artifacts_dir: cli.artifacts_dir,
                    jobs,
                },
            ) {
                Ok(config) => commands::scenario::run(&config, &paths, format).await,
                Err(e) => Err(e),
            },
            ScenarioAction::Check { paths } => commands::scenario::check(&paths),
        },

        Commands::Suite { action } => {
            match resolve_config(
                cli.harness_config.as_deref(),
                ConfigOverrides {
                    engine: cli.engine,
                    run_dir: cli.run_dir,
                    templates_dir: cli.templates,
                    artifacts_dir: cli.artifacts_dir,
                    jobs: None,
                },
            ) {
                Ok(config) => match action {
                    SuiteAction::Install { template, name } => {
                        commands::suite::install(&config, &template, name.as_deref())
                    }
                    SuiteAction::Purge { name } => commands::suite::purge(&config, &name),
                    SuiteAction::List => commands::suite::list(&config),
                },
                Err(e) => Err(e),
            }
        }

        Commands::Pipeline { action } => match action {
            PipelineAction::Plan { pipeline, format } => commands::pipeline::plan(&pipeline, format),
            PipelineAction::Render { pipeline, output } => {
                commands::pipeline::render(&pipeline, output.as_deref())
            }
            PipelineAction::Run {
                pipeline,
                reference,
                event,
                fork,
                os,
                work_dir,
                max_parallel,
                format,
            } => {
                commands::pipeline::run(commands::pipeline::RunOptions {
                    pipeline: &pipeline,
                    reference: &reference,
                    event,
                    fork,
                    os: os.as_deref(),
                    work_dir: &work_dir,
                    max_parallel,
                    format,
                })
                .await
            }
        },
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn resolve_config(
    path: Option<&std::path::Path>,
    overrides: ConfigOverrides,
) -> Result<HarnessConfig, String> {
    HarnessConfig::load(path, overrides).map_err(|e| e.to_string())
}
