//! Domain types for the mlpipe orchestrator.
//!
//! This module contains the core data structures:
//! - Artifact: references (`name:tag`), descriptors and resolved handles
//! - Events: records appended to a run's log
//! - Run: run-group identity and invocation state

pub mod artifact;
pub mod events;
pub mod run;

// Re-export commonly used types
pub use artifact::{ArtifactDescriptor, ArtifactHandle, ArtifactRef, ArtifactRefError, ArtifactTag};
pub use events::{Event, EventType, StepStatus};
pub use run::{Run, RunGroup, RunState};
