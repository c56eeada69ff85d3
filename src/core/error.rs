//! Error types for orchestration.
//!
//! Every variant is fatal to the whole invocation: there are no retries and
//! no partial-success semantics.

use thiserror::Error;

use crate::tracking::TrackingError;

/// Errors that stop an orchestrator run
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The step directive names a stage that is not in the table
    #[error("unknown stage '{name}' (known stages: {known})")]
    UnknownStage { name: String, known: String },

    /// A required configuration key is missing or malformed
    #[error("configuration error at '{key}': {reason}")]
    Configuration { key: String, reason: String },

    /// The tracker could not resolve an input reference
    #[error("failed to resolve artifact '{reference}': {source}")]
    ArtifactResolution {
        reference: String,
        #[source]
        source: TrackingError,
    },

    /// A stage exited abnormally
    #[error("stage '{stage}' failed: {failure}")]
    StageExecution { stage: String, failure: StageFailure },

    /// The run was cancelled (Ctrl-C) while stages were executing
    #[error("run interrupted")]
    Interrupted,

    /// The scoped workspace could not be created, written or removed
    #[error("workspace error: {0}")]
    Workspace(#[source] std::io::Error),

    /// The run log could not be written
    #[error("run log error: {0:#}")]
    EventLog(#[source] anyhow::Error),
}

impl OrchestratorError {
    /// Build a configuration error
    pub fn config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Name of the stage that failed, if this is a stage failure
    pub fn failed_stage(&self) -> Option<&str> {
        match self {
            Self::StageExecution { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

/// How a stage failed
#[derive(Debug, Error)]
pub enum StageFailure {
    /// The process (or delegated run) exited non-zero
    #[error("exited with code {code}")]
    Exit { code: i32, stderr_tail: String },

    /// The process was killed before it could report an exit code
    #[error("terminated without an exit code")]
    Terminated { stderr_tail: String },

    /// The process could not be started
    #[error("could not be launched: {0}")]
    Launch(String),

    /// The stage's own artifact could not be published
    #[error("publish failed: {0}")]
    Publish(#[source] TrackingError),
}

impl StageFailure {
    /// Exit code, when the stage reported one
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exit { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Captured stderr lines, when there are any
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::Exit { stderr_tail, .. } | Self::Terminated { stderr_tail }
                if !stderr_tail.is_empty() =>
            {
                Some(stderr_tail)
            }
            _ => None,
        }
    }
}
