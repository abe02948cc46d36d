//! Acceptance scenarios: YAML-driven install / invoke / assert / purge runs.
//!
//! ```text
//! scenario.yaml ──► ScenarioDefinition ──► ScenarioExecutor
//!                                               │
//!                      templates/<suite>/ ──► SuiteGuard (install … purge)
//!                                               │
//!                                         Engine (validate …)
//!                                               │
//!                                 TapRecorder ──► ScenarioReport
//! ```

pub mod context;
pub mod discovery;
pub mod executor;
pub mod pool;
pub mod report;
pub mod schema;

pub use context::{ScenarioContext, ScenarioPhase};
pub use discovery::discover;
pub use executor::ScenarioExecutor;
pub use pool::{overall_exit_code, run_all};
pub use report::{render_tap_stream, ScenarioOutcome, ScenarioReport, TeardownReport};
pub use schema::{ScenarioDefinition, ScenarioStep};
