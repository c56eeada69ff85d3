//! Artifact reference resolution.
//!
//! Thin layer over the tracker that binds the run group and maps tracker
//! errors into orchestration errors. Publish completes before it returns,
//! so a later stage can resolve what an earlier one published.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, instrument};

use super::error::{OrchestratorError, StageFailure};
use crate::domain::{ArtifactDescriptor, ArtifactHandle, ArtifactRef, RunGroup};
use crate::tracking::Tracker;

/// Resolves and publishes artifacts on behalf of one run group
#[derive(Clone)]
pub struct ArtifactResolver {
    tracker: Arc<dyn Tracker>,
    group: RunGroup,
}

impl ArtifactResolver {
    pub fn new(tracker: Arc<dyn Tracker>, group: RunGroup) -> Self {
        Self { tracker, group }
    }

    /// Run group every call is made under
    pub fn group(&self) -> &RunGroup {
        &self.group
    }

    /// Environment a stage process needs to reach the tracker
    pub fn client_env(&self) -> Vec<(String, String)> {
        self.tracker.client_env()
    }

    /// Resolve `name:tag` to a recorded version
    #[instrument(skip(self, reference), fields(reference = %reference))]
    pub async fn resolve(&self, reference: &ArtifactRef) -> Result<ArtifactHandle, OrchestratorError> {
        let handle = self
            .tracker
            .resolve(&self.group, reference)
            .await
            .map_err(|source| OrchestratorError::ArtifactResolution {
                reference: reference.to_string(),
                source,
            })?;

        debug!(version = handle.version, path = %handle.path.display(), "Resolved");
        Ok(handle)
    }

    /// Publish `source` as a new version for `stage`; returns once recorded
    #[instrument(skip(self, descriptor, source), fields(artifact = %descriptor.name))]
    pub async fn publish(
        &self,
        stage: &str,
        descriptor: &ArtifactDescriptor,
        source: &Path,
    ) -> Result<ArtifactHandle, OrchestratorError> {
        self.tracker
            .publish(&self.group, descriptor, source)
            .await
            .map_err(|e| OrchestratorError::StageExecution {
                stage: stage.to_string(),
                failure: StageFailure::Publish(e),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::{LocalArtifactStore, TrackingError};
    use tempfile::TempDir;

    fn resolver(temp: &TempDir) -> ArtifactResolver {
        let store = LocalArtifactStore::new(temp.path().join("store"));
        ArtifactResolver::new(Arc::new(store), RunGroup::new("nyc_airbnb", "development"))
    }

    #[tokio::test]
    async fn test_resolve_succeeds_only_after_publish() {
        let temp = TempDir::new().unwrap();
        let resolver = resolver(&temp);
        let reference = ArtifactRef::latest("sample.csv").unwrap();

        let err = resolver.resolve(&reference).await.unwrap_err();
        match err {
            OrchestratorError::ArtifactResolution { reference, source } => {
                assert_eq!(reference, "sample.csv:latest");
                assert!(matches!(source, TrackingError::UnknownArtifact { .. }));
            }
            other => panic!("Expected ArtifactResolution, got {:?}", other),
        }

        let source = temp.path().join("sample.csv");
        std::fs::write(&source, "id,price\n").unwrap();
        let descriptor = ArtifactDescriptor::new("sample.csv", "raw_data", "Raw data from local file");
        let published = resolver.publish("download", &descriptor, &source).await.unwrap();

        let resolved = resolver.resolve(&reference).await.unwrap();
        assert_eq!(resolved.version, published.version);
        assert_eq!(resolved.run_group, *resolver.group());
    }

    #[tokio::test]
    async fn test_publish_failure_is_stage_failure() {
        let temp = TempDir::new().unwrap();
        let resolver = resolver(&temp);
        let descriptor = ArtifactDescriptor::new("sample.csv", "raw_data", "d");

        let err = resolver
            .publish("download", &descriptor, &temp.path().join("missing.csv"))
            .await
            .unwrap_err();
        assert_eq!(err.failed_stage(), Some("download"));
    }
}
