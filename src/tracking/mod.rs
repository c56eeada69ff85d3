//! Experiment-tracking / artifact-store interface.
//!
//! The orchestrator never defines artifact content. It only names artifacts,
//! asks the tracker to record them, and resolves `name:tag` references
//! through it. `LocalArtifactStore` is the filesystem implementation used by
//! the CLI.

pub mod local;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ArtifactDescriptor, ArtifactHandle, ArtifactRef, ArtifactTag, RunGroup};

pub use local::LocalArtifactStore;

/// Errors reported by a tracker
#[derive(Debug, Error)]
pub enum TrackingError {
    /// No artifact with that name exists in the project
    #[error("artifact '{name}' does not exist in project '{project}'")]
    UnknownArtifact { project: String, name: String },

    /// The artifact exists but nothing carries the requested tag
    #[error("no version of '{name}' is tagged '{tag}'")]
    UnknownTag { name: String, tag: ArtifactTag },

    /// The requested tag cannot be assigned by promotion
    #[error("tag '{0}' cannot be assigned by promotion (use reference or prod)")]
    NotPromotable(ArtifactTag),

    /// Source file for a publish is missing or unreadable
    #[error("cannot read artifact source '{path}': {source}")]
    Source {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Artifact name or manifest content is invalid
    #[error("invalid artifact: {0}")]
    Invalid(String),

    /// Storage I/O failure
    #[error("artifact store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest (de)serialization failure
    #[error("artifact manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Tracking collaborator
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Human-readable tracker name
    fn name(&self) -> &str;

    /// Record `source` as a new version of `descriptor.name`.
    ///
    /// Returns only once the version is durably recorded and resolvable
    /// as `name:latest`.
    async fn publish(
        &self,
        group: &RunGroup,
        descriptor: &ArtifactDescriptor,
        source: &Path,
    ) -> Result<ArtifactHandle, TrackingError>;

    /// Resolve a reference within the group's project
    async fn resolve(
        &self,
        group: &RunGroup,
        reference: &ArtifactRef,
    ) -> Result<ArtifactHandle, TrackingError>;

    /// Assign a lifecycle tag to an existing version
    async fn promote(
        &self,
        project: &str,
        name: &str,
        version: u32,
        tag: ArtifactTag,
    ) -> Result<ArtifactHandle, TrackingError>;

    /// Environment a stage process needs to reach this tracker
    fn client_env(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}
