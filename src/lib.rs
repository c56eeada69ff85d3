//! mlpipe - Orchestrator for a staged ML training pipeline
//!
//! Runs a fixed chain of stages (download, cleaning, data checks, split,
//! training, model testing) in canonical order. Each stage is an external
//! program or a reusable component; stages exchange data only through
//! versioned artifacts in a tracker, addressed as `name:tag`.
//!
//! # Architecture
//!
//! - The stage table is data: each stage declares its runner, its
//!   command-line slots and the artifacts it produces
//! - Parameters come from one nested YAML configuration, looked up by
//!   dotted key when a stage is assembled
//! - Every run shares one run group and is recorded in an append-only log
//! - The first failing stage stops the run
//!
//! # Modules
//!
//! - `adapters`: Stage runners (local processes, mlflow components)
//! - `config`: Pipeline configuration and engine settings
//! - `core`: Orchestration logic (stages, executor, run log)
//! - `domain`: Data structures (Event, Run, ArtifactRef)
//! - `tracking`: Artifact tracker interface and the local store
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run every auto-runnable stage
//! mlpipe run
//!
//! # Run a subset with overrides
//! mlpipe run --steps download,basic_cleaning etl.min_price=20
//!
//! # Promote a model and test it
//! mlpipe promote random_forest_export 3 prod
//! mlpipe run --steps test_regression_model
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod tracking;

// Re-export main types at crate root for convenience
pub use config::{PipelineConfig, Settings};
pub use crate::core::{Orchestrator, OrchestratorError};
pub use domain::{ArtifactRef, ArtifactTag, Event, EventType, Run, RunState};
