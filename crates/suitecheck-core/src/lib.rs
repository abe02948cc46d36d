//! suitecheck core: acceptance-test harness for a workflow-engine CLI.
//!
//! This crate holds everything the `suitecheck` binary does, without any CLI
//! dependency:
//!
//! - `tap`: per-scenario assertion counter and multi-line pattern matching
//! - `suite`: install fixture templates as isolated instances, purge them
//! - `engine`: invoke the engine binary and capture its streams
//! - `scenario`: YAML scenarios, the install/assert/teardown runner, and a
//!   bounded worker pool
//! - `pipeline`: CI matrix planning and a local pipeline runner with
//!   timeouts, cancellation, artifacts and coverage aggregation

pub mod config;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod scenario;
pub mod suite;
pub mod tap;

// Convenience re-exports
pub use config::HarnessConfig;
pub use engine::{Engine, InvocationResult};
pub use error::{HarnessError, HarnessResult};
pub use scenario::{ScenarioDefinition, ScenarioExecutor, ScenarioReport};
pub use suite::{SuiteGuard, SuiteInstaller, SuiteInstance};
