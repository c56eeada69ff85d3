//! Core orchestration logic.
//!
//! This module contains:
//! - Stages: the stage table and step selection
//! - Executor: turns a stage plus configuration into an invocation
//! - Resolver: artifact resolution and publishing for one run group
//! - Workspace: scoped temporary directory for one run
//! - EventStore: append-only run log
//! - Orchestrator: main execution engine

pub mod error;
pub mod event_store;
pub mod executor;
pub mod orchestrator;
pub mod resolver;
pub mod stages;
pub mod workspace;

// Re-export commonly used types
pub use error::{OrchestratorError, StageFailure};
pub use event_store::EventStore;
pub use executor::{InputRef, Parameter, ResolvedInput, StageExecutor, StageResult};
pub use orchestrator::{load_run, recent_runs, Orchestrator};
pub use resolver::ArtifactResolver;
pub use stages::{select_steps, ArgSource, ArtifactName, Stage, StageArg, StageRunner, StageTable, ALL_STEPS};
pub use workspace::Workspace;
