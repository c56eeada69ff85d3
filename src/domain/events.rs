//! Events recorded in a run's append-only log.
//!
//! The log is the history of one invocation; `Run::from_events` rebuilds the
//! run state from it for `status` and `runs`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::run::RunGroup;

/// A single event in the append-only run log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Run group of the invocation
    pub run_group: RunGroup,

    /// Stage name (if applicable)
    pub step_id: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary
    pub payload_summary: String,

    /// Current status of the stage/run
    pub status: StepStatus,

    /// Active stages, only set on `RunStarted`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<String>,

    /// Artifact involved, as `name:tag` or `name:vN`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,

    /// Time taken in milliseconds (for finished stages)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: Uuid,
        run_group: RunGroup,
        step_id: Option<String>,
        event_type: EventType,
        payload_summary: String,
        status: StepStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            run_group,
            step_id,
            event_type,
            payload_summary,
            status,
            steps: Vec::new(),
            artifact: None,
            duration_ms: None,
            error: None,
        }
    }

    /// The first event of every run
    pub fn run_started(run_id: Uuid, run_group: RunGroup, steps: Vec<String>) -> Self {
        let summary = format!("Run started for {} with stages [{}]", run_group, steps.join(", "));
        let mut event = Self::new(
            run_id,
            run_group,
            None,
            EventType::RunStarted,
            summary,
            StepStatus::Running,
        );
        event.steps = steps;
        event
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new run has started
    RunStarted,

    /// Every active stage completed
    RunCompleted,

    /// The run stopped on the first failure
    RunFailed,

    /// A stage has started execution
    StepStarted,

    /// A stage completed successfully
    StepCompleted,

    /// A stage failed
    StepFailed,

    /// An input reference was resolved by the tracker
    ArtifactResolved,

    /// An artifact version was durably published
    ArtifactPublished,
}

/// Status of a stage or run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet started
    Pending,

    /// Currently executing
    Running,

    /// Completed successfully
    Completed,

    /// Failed (with error)
    Failed,
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}
