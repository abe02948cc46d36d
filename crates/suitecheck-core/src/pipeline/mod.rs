//! CI pipeline: matrix planning, a local runner, and workflow rendering.
//!
//! ```text
//! ci.yaml ──► PipelineConfig ──► plan_jobs() ──► Pipeline (MatrixJob × Stage)
//!                    │                                │
//!                    └──► to_workflow_yaml()          └──► PipelineRunner
//!                                                           │  RunRegistry (supersession)
//!                                                           │  ArtifactStore (write-once)
//!                                                           └─► Aggregation (coverage)
//! ```

pub mod artifacts;
pub mod concurrency;
pub mod coverage;
pub mod matrix;
pub mod render;
pub mod runner;
pub mod schema;

pub use artifacts::{ArtifactMeta, ArtifactStore};
pub use concurrency::{RunHandle, RunRegistry};
pub use coverage::{AggregateReport, CoverageReport, CoverageSink, DirectorySink, UploadOutcome};
pub use matrix::{expand_matrix, plan_jobs, Gate, MatrixJob, Pipeline, Stage, StageKind};
pub use render::to_workflow_yaml;
pub use runner::{JobReport, PipelineReport, PipelineRunner, StageStatus};
pub use schema::{concurrency_key, PipelineConfig, TriggerEvent};
