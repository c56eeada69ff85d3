//! Main orchestrator for pipeline execution.
//!
//! Selects the active stages, runs them strictly in canonical order under
//! one run group, and records every step in the run log. The first failure
//! stops the run: no later stage starts, and the error is returned to the
//! caller after the log and workspace are settled.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{Adapter, MlflowAdapter, ProcessAdapter};
use crate::config::{PipelineConfig, Settings};
use crate::domain::{Event, EventType, Run, RunGroup, StepStatus};
use crate::tracking::{LocalArtifactStore, Tracker};

use super::error::OrchestratorError;
use super::event_store::EventStore;
use super::executor::StageExecutor;
use super::resolver::ArtifactResolver;
use super::stages::{select_steps, Stage, StageTable};
use super::workspace::Workspace;

/// Main pipeline orchestrator
pub struct Orchestrator {
    config: PipelineConfig,
    settings: Settings,
    table: StageTable,
    tracker: Arc<dyn Tracker>,

    /// Runs stages backed by their own program
    process_adapter: Arc<dyn Adapter>,

    /// Runs reusable components
    component_adapter: Arc<dyn Adapter>,
}

impl Orchestrator {
    /// Create an orchestrator over the canonical stage table, the local
    /// artifact store and the default adapters
    pub fn new(config: PipelineConfig, settings: Settings) -> Self {
        let tracker = Arc::new(LocalArtifactStore::new(settings.store_dir.clone()));
        Self {
            config,
            settings,
            table: StageTable::canonical(),
            tracker,
            process_adapter: Arc::new(ProcessAdapter::new()),
            component_adapter: Arc::new(MlflowAdapter::new()),
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn Tracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_process_adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.process_adapter = adapter;
        self
    }

    pub fn with_component_adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.component_adapter = adapter;
        self
    }

    pub fn with_stage_table(mut self, table: StageTable) -> Self {
        self.table = table;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn table(&self) -> &StageTable {
        &self.table
    }

    pub fn tracker(&self) -> &Arc<dyn Tracker> {
        &self.tracker
    }

    /// Execute the stages selected by `main.steps`, stopping at Ctrl-C.
    pub async fn run(&self) -> Result<Run, OrchestratorError> {
        self.run_until(ctrl_c()).await
    }

    /// Execute the selected stages unless `shutdown` resolves first.
    ///
    /// Unknown stage names and an invalid table are rejected before any run
    /// log or workspace exists. On shutdown the stage in flight is dropped,
    /// which kills its child process, and the run is logged as interrupted.
    #[instrument(skip(self, shutdown))]
    pub async fn run_until<F>(&self, shutdown: F) -> Result<Run, OrchestratorError>
    where
        F: Future<Output = ()>,
    {
        self.table
            .validate()
            .map_err(|e| OrchestratorError::config("stages", format!("{:#}", e)))?;

        let main = self.config.main()?;
        let active = select_steps(&main.steps, &self.table)?;
        let steps: Vec<String> = active.iter().map(|s| s.name.to_string()).collect();

        let run_id = Uuid::new_v4();
        let group = RunGroup::new(main.project_name, main.experiment_name);
        info!(%run_id, group = %group, steps = ?steps, "Starting pipeline run");

        let store = EventStore::open_in(&self.settings.runs_dir(), run_id)
            .await
            .map_err(OrchestratorError::EventLog)?;

        let mut run = Run::new(run_id, group.clone(), steps.clone());
        record(&store, &mut run, Event::run_started(run_id, group.clone(), steps)).await?;

        let workspace = match Workspace::create() {
            Ok(workspace) => workspace,
            Err(e) => return fail_run(&store, &mut run, e).await,
        };

        let resolver = ArtifactResolver::new(Arc::clone(&self.tracker), group);
        let executor = StageExecutor::new(
            &self.config,
            &workspace,
            &resolver,
            self.process_adapter.as_ref(),
            self.component_adapter.as_ref(),
        );

        let outcome = tokio::select! {
            result = run_stages(&store, &mut run, &executor, &active) => result,
            _ = shutdown => Err(OrchestratorError::Interrupted),
        };

        if let Err(e) = outcome {
            drop(workspace);
            if matches!(e, OrchestratorError::Interrupted) {
                warn!(run_id = %run.id, "Run interrupted");
                abandon_running_steps(&store, &mut run).await;
            }
            return fail_run(&store, &mut run, e).await;
        }

        if let Err(e) = workspace.close() {
            return fail_run(&store, &mut run, e).await;
        }

        let summary = format!("Run completed: {} stage(s)", run.completed_steps);
        let event = run_event(&run, EventType::RunCompleted, summary, StepStatus::Completed);
        record(&store, &mut run, event).await?;

        info!(run_id = %run.id, "Run completed successfully");
        Ok(run)
    }

    /// Get status of a run by ID
    pub async fn get_run_status(&self, run_id: Uuid) -> Result<Run> {
        load_run(&self.settings.runs_dir(), run_id).await
    }

    /// List recent runs, most recent first
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        recent_runs(&self.settings.runs_dir(), limit).await
    }
}

/// Rebuild a run from its log under `runs_dir`
pub async fn load_run(runs_dir: &Path, run_id: Uuid) -> Result<Run> {
    let store = EventStore::open_existing(runs_dir, run_id).await?;
    let events = store.replay().await?;

    if events.is_empty() {
        anyhow::bail!("Run {} has an empty log", run_id);
    }

    Run::from_events(&events).context("Failed to reconstruct run state")
}

/// Up to `limit` runs under `runs_dir`, most recent first
pub async fn recent_runs(runs_dir: &Path, limit: usize) -> Result<Vec<Run>> {
    let run_ids = EventStore::list_runs(runs_dir).await?;
    let mut runs = Vec::new();

    for run_id in run_ids {
        match load_run(runs_dir, run_id).await {
            Ok(run) => runs.push(run),
            Err(e) => warn!(%run_id, error = %e, "Skipping unreadable run log"),
        }
    }

    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    runs.truncate(limit);

    Ok(runs)
}

/// Resolves on Ctrl-C; never resolves if the handler cannot be installed
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

/// Run the active stages in order, stopping at the first failure
async fn run_stages(
    store: &EventStore,
    run: &mut Run,
    executor: &StageExecutor<'_>,
    stages: &[&Stage],
) -> Result<(), OrchestratorError> {
    for stage in stages {
        run_stage(store, run, executor, stage).await?;
    }
    Ok(())
}

/// Mark stages left running by a cancelled stage future as failed
async fn abandon_running_steps(store: &EventStore, run: &mut Run) {
    let running: Vec<String> = run
        .steps
        .iter()
        .filter(|step| run.step_status(step) == StepStatus::Running)
        .cloned()
        .collect();

    for step in running {
        let event = Event::new(
            run.id,
            run.group.clone(),
            Some(step.clone()),
            EventType::StepFailed,
            format!("Stage '{}' interrupted", step),
            StepStatus::Failed,
        )
        .with_error(OrchestratorError::Interrupted.to_string());
        if let Err(log_err) = record(store, run, event).await {
            warn!(error = %log_err, "Failed to record interrupted stage");
        }
    }
}

/// Run one stage: resolve, assemble, execute, publish, and log each step
async fn run_stage(
    store: &EventStore,
    run: &mut Run,
    executor: &StageExecutor<'_>,
    stage: &Stage,
) -> Result<(), OrchestratorError> {
    info!(stage = stage.name, "Stage started");
    let started = step_event(
        run,
        stage,
        EventType::StepStarted,
        format!("Stage '{}' started", stage.name),
        StepStatus::Running,
    );
    record(store, run, started).await?;

    match execute_stage(store, run, executor, stage).await {
        Ok(duration_ms) => {
            let completed = step_event(
                run,
                stage,
                EventType::StepCompleted,
                format!("Stage '{}' completed in {}ms", stage.name, duration_ms),
                StepStatus::Completed,
            )
            .with_duration(duration_ms);
            record(store, run, completed).await?;

            info!(stage = stage.name, duration_ms, "Stage completed");
            Ok(())
        }
        Err(e) => {
            error!(stage = stage.name, error = %e, "Stage failed");

            let failed = step_event(
                run,
                stage,
                EventType::StepFailed,
                format!("Stage '{}' failed", stage.name),
                StepStatus::Failed,
            )
            .with_error(e.to_string());
            if let Err(log_err) = record(store, run, failed).await {
                warn!(error = %log_err, "Failed to record stage failure");
            }
            Err(e)
        }
    }
}

async fn execute_stage(
    store: &EventStore,
    run: &mut Run,
    executor: &StageExecutor<'_>,
    stage: &Stage,
) -> Result<u64, OrchestratorError> {
    let references = executor.input_references(stage)?;
    let params = executor.assemble_parameters(stage)?;
    let inputs = executor.resolve_inputs(references).await?;

    for input in &inputs {
        let event = step_event(
            run,
            stage,
            EventType::ArtifactResolved,
            format!("--{} {} -> v{}", input.flag, input.reference, input.handle.version),
            StepStatus::Running,
        )
        .with_artifact(input.handle.pinned().to_string());
        record(store, run, event).await?;
    }

    let result = executor.execute(stage, &inputs, &params).await?;

    for handle in &result.published {
        let pinned = handle.pinned().to_string();
        info!(stage = stage.name, artifact = %pinned, "Artifact published");

        let event = step_event(
            run,
            stage,
            EventType::ArtifactPublished,
            format!("Published {} ({} bytes)", pinned, handle.size_bytes),
            StepStatus::Running,
        )
        .with_artifact(pinned);
        record(store, run, event).await?;
    }

    Ok(result.duration_ms)
}

/// Close the run as failed and hand the error back
async fn fail_run(
    store: &EventStore,
    run: &mut Run,
    error: OrchestratorError,
) -> Result<Run, OrchestratorError> {
    error!(run_id = %run.id, error = %error, "Run failed");

    let event = run_event(
        run,
        EventType::RunFailed,
        format!("Run failed: {}", error),
        StepStatus::Failed,
    )
    .with_error(error.to_string());
    if let Err(log_err) = record(store, run, event).await {
        warn!(error = %log_err, "Failed to record run failure");
    }

    Err(error)
}

/// Append to the log, then fold the event into the in-memory run
async fn record(store: &EventStore, run: &mut Run, event: Event) -> Result<(), OrchestratorError> {
    store
        .append(&event)
        .await
        .map_err(OrchestratorError::EventLog)?;
    run.apply_event(&event);
    Ok(())
}

fn run_event(run: &Run, event_type: EventType, summary: String, status: StepStatus) -> Event {
    Event::new(run.id, run.group.clone(), None, event_type, summary, status)
}

fn step_event(
    run: &Run,
    stage: &Stage,
    event_type: EventType,
    summary: String,
    status: StepStatus,
) -> Event {
    Event::new(
        run.id,
        run.group.clone(),
        Some(stage.name.to_string()),
        event_type,
        summary,
        status,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RunState;
    use tempfile::TempDir;

    fn orchestrator(temp: &TempDir, steps: &str) -> Orchestrator {
        let yaml = format!(
            "main:\n  project_name: nyc_airbnb\n  experiment_name: development\n  steps: \"{}\"\netl:\n  sample: sample1.csv\n",
            steps
        );
        let config = PipelineConfig::from_yaml(&yaml, temp.path()).unwrap();
        Orchestrator::new(config, Settings::with_home(temp.path().join("home")))
    }

    #[test]
    fn test_default_adapters() {
        let temp = TempDir::new().unwrap();
        let orchestrator = orchestrator(&temp, "all");
        assert_eq!(orchestrator.process_adapter.name(), "process");
        assert_eq!(orchestrator.component_adapter.name(), "mlflow");
        assert_eq!(orchestrator.tracker().name(), "local");
    }

    #[tokio::test]
    async fn test_unknown_stage_leaves_no_run_log() {
        let temp = TempDir::new().unwrap();
        let orchestrator = orchestrator(&temp, "download,bogus");

        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownStage { .. }));
        assert!(orchestrator.list_runs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_table_leaves_no_run_log() {
        use crate::core::{ArtifactName, StageRunner};
        use crate::domain::ArtifactTag;

        let temp = TempDir::new().unwrap();
        let table = StageTable::new(vec![
            Stage::new(
                "train",
                StageRunner::Component {
                    component: "train",
                    entry_point: "main",
                },
            )
            .input("trainval", ArtifactName::Fixed("trainval_data"), ArtifactTag::Latest),
            Stage::new(
                "split",
                StageRunner::Component {
                    component: "split",
                    entry_point: "main",
                },
            )
            .produces(ArtifactName::Fixed("trainval_data")),
        ]);
        let orchestrator = orchestrator(&temp, "all").with_stage_table(table);
        assert_eq!(orchestrator.table().names(), vec!["train", "split"]);

        let err = orchestrator.run().await.unwrap_err();
        match err {
            OrchestratorError::Configuration { key, .. } => assert_eq!(key, "stages"),
            other => panic!("Expected Configuration, got {:?}", other),
        }
        assert!(orchestrator.list_runs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_download_run_is_logged() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("data")).unwrap();
        std::fs::write(temp.path().join("data/sample1.csv"), "id,price\n1,100\n").unwrap();

        let orchestrator = orchestrator(&temp, "download");
        let run = orchestrator.run().await.unwrap();
        assert_eq!(run.state, RunState::Completed);
        assert_eq!(run.published, vec!["sample1.csv:v0"]);

        let status = orchestrator.get_run_status(run.id).await.unwrap();
        assert_eq!(status.state, RunState::Completed);
        assert_eq!(status.steps, vec!["download"]);
        assert!(status.is_step_completed("download"));
        assert_eq!(status.published, run.published);
    }

    #[tokio::test]
    async fn test_failed_run_is_logged() {
        let temp = TempDir::new().unwrap();
        let orchestrator = orchestrator(&temp, "download");

        // data/sample1.csv does not exist
        let err = orchestrator.run().await.unwrap_err();
        assert_eq!(err.failed_stage(), Some("download"));

        let runs = orchestrator.list_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!(matches!(runs[0].state, RunState::Failed { .. }));
        assert_eq!(runs[0].step_status("download"), StepStatus::Failed);
    }
}
