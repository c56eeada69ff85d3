//! Run state, run-group identity, and reconstruction from events.
//!
//! A Run represents a single orchestrator invocation. Every run belongs to a
//! RunGroup so that all stages of one invocation can be compared later.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{Event, EventType, StepStatus};

/// Environment variable carrying the project identifier to stage processes
pub const PROJECT_ENV: &str = "WANDB_PROJECT";

/// Environment variable carrying the run-group identifier to stage processes
pub const RUN_GROUP_ENV: &str = "WANDB_RUN_GROUP";

/// Project + experiment identity shared by every stage of one invocation.
///
/// Established once before the first stage and never changed afterwards.
/// It is passed explicitly to every publish, resolve and stage invocation;
/// child processes receive it through their own environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunGroup {
    /// Project identifier (`main.project_name`)
    pub project: String,

    /// Experiment / group identifier (`main.experiment_name`)
    pub group: String,
}

impl RunGroup {
    pub fn new(project: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            group: group.into(),
        }
    }

    /// Environment entries for a child process of this run group
    pub fn env(&self) -> Vec<(String, String)> {
        vec![
            (PROJECT_ENV.to_string(), self.project.clone()),
            (RUN_GROUP_ENV.to_string(), self.group.clone()),
        ]
    }
}

impl fmt::Display for RunGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.group)
    }
}

/// An orchestrator invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Run group shared by all stages
    pub group: RunGroup,

    /// Active stages in execution order
    pub steps: Vec<String>,

    /// Current state of the run
    pub state: RunState,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run finished (if applicable)
    pub completed_at: Option<DateTime<Utc>>,

    /// Number of stages that completed
    pub completed_steps: usize,

    /// Status of each stage (stage name -> status)
    pub step_statuses: HashMap<String, StepStatus>,

    /// Artifact versions published during the run, as `name:vN`
    pub published: Vec<String>,
}

impl Run {
    /// Create a new run for the given active stages
    pub fn new(id: Uuid, group: RunGroup, steps: Vec<String>) -> Self {
        let step_statuses = steps
            .iter()
            .map(|s| (s.clone(), StepStatus::Pending))
            .collect();

        Self {
            id,
            group,
            steps,
            state: RunState::Running,
            started_at: Utc::now(),
            completed_at: None,
            completed_steps: 0,
            step_statuses,
            published: Vec::new(),
        }
    }

    /// Reconstruct run state from a sequence of events.
    ///
    /// The first event must be `RunStarted`; it carries the step list.
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first = events.first()?;
        if first.event_type != EventType::RunStarted {
            return None;
        }

        let mut run = Self::new(first.run_id, first.run_group.clone(), first.steps.clone());
        run.started_at = first.timestamp;

        for event in &events[1..] {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::RunStarted => {
                self.state = RunState::Running;
                self.started_at = event.timestamp;
            }
            EventType::RunCompleted => {
                self.state = RunState::Completed;
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunFailed => {
                self.state = RunState::Failed {
                    error: event.error.clone().unwrap_or_default(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::StepStarted => {
                if let Some(ref step_id) = event.step_id {
                    self.step_statuses
                        .insert(step_id.clone(), StepStatus::Running);
                }
            }
            EventType::StepCompleted => {
                if let Some(ref step_id) = event.step_id {
                    self.step_statuses
                        .insert(step_id.clone(), StepStatus::Completed);
                    self.completed_steps += 1;
                }
            }
            EventType::StepFailed => {
                if let Some(ref step_id) = event.step_id {
                    self.step_statuses
                        .insert(step_id.clone(), StepStatus::Failed);
                }
            }
            EventType::ArtifactPublished => {
                if let Some(ref artifact) = event.artifact {
                    self.published.push(artifact.clone());
                }
            }
            EventType::ArtifactResolved => {}
        }
    }

    /// Check if the run is still in progress
    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running)
    }

    /// Check if a specific stage completed
    pub fn is_step_completed(&self, step_name: &str) -> bool {
        self.step_statuses
            .get(step_name)
            .map(|s| *s == StepStatus::Completed)
            .unwrap_or(false)
    }

    /// Status of a stage, `Pending` if unknown
    pub fn step_status(&self, step_name: &str) -> StepStatus {
        self.step_statuses
            .get(step_name)
            .copied()
            .unwrap_or_default()
    }
}

/// State of an orchestrator run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// Currently executing
    Running,

    /// Every active stage completed
    Completed,

    /// A stage (or the setup) failed
    Failed { error: String },
}

impl Default for RunState {
    fn default() -> Self {
        Self::Running
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Completed => f.write_str("completed"),
            Self::Failed { .. } => f.write_str("failed"),
        }
    }
}
