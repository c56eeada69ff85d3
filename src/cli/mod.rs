//! Command-line interface for mlpipe.
//!
//! Provides commands for running the pipeline, listing stages, inspecting
//! configuration, checking run status, and managing artifact versions.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::config::{PipelineConfig, Settings};
use crate::core::{load_run, recent_runs, Orchestrator, OrchestratorError, StageTable};
use crate::domain::{ArtifactTag, Run, RunState};
use crate::tracking::{LocalArtifactStore, Tracker};

/// mlpipe - Orchestrator for a staged ML training pipeline
#[derive(Parser, Debug)]
#[command(name = "mlpipe")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline stages selected by main.steps
    Run {
        /// Config file (default: config.yaml in the current directory or a parent)
        #[arg(short, long, env = "MLPIPE_CONFIG")]
        config: Option<PathBuf>,

        /// Comma-separated stages to run, or "all" (overrides main.steps)
        #[arg(short, long)]
        steps: Option<String>,

        /// Config overrides as key.path=value
        overrides: Vec<String>,
    },

    /// List the pipeline stages in canonical order
    Steps,

    /// Show the effective configuration and engine paths
    Config {
        /// Config file (default: config.yaml in the current directory or a parent)
        #[arg(short, long, env = "MLPIPE_CONFIG")]
        config: Option<PathBuf>,

        /// Config overrides as key.path=value
        overrides: Vec<String>,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List the versions of an artifact in the local store
    Artifacts {
        /// Artifact name
        name: String,

        /// Project (default: main.project_name)
        #[arg(short, long)]
        project: Option<String>,

        /// Config file used to find the project and store
        #[arg(short, long, env = "MLPIPE_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Tag an artifact version as reference or prod
    Promote {
        /// Artifact name
        name: String,

        /// Version number (3 or v3)
        version: String,

        /// Tag to assign (reference or prod)
        tag: ArtifactTag,

        /// Project (default: main.project_name)
        #[arg(short, long)]
        project: Option<String>,

        /// Config file used to find the project and store
        #[arg(short, long, env = "MLPIPE_CONFIG")]
        config: Option<PathBuf>,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                config,
                steps,
                overrides,
            } => run_pipeline(config.as_deref(), steps, &overrides).await,
            Commands::Steps => {
                list_steps();
                Ok(())
            }
            Commands::Config { config, overrides } => show_config(config.as_deref(), &overrides),
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Status { run_id } => show_status(&run_id).await,
            Commands::Artifacts {
                name,
                project,
                config,
            } => list_artifacts(&name, project, config.as_deref()).await,
            Commands::Promote {
                name,
                version,
                tag,
                project,
                config,
            } => promote(&name, &version, tag, project, config.as_deref()).await,
        }
    }
}

/// Load the pipeline config and apply `--steps` and `key=value` overrides
fn load_config(path: Option<&Path>, steps: Option<String>, overrides: &[String]) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load(path)?;
    for assignment in overrides {
        config.apply_override(assignment)?;
    }
    if let Some(steps) = steps {
        config.set("main.steps", steps.into())?;
    }
    Ok(config)
}

/// Run the pipeline
async fn run_pipeline(path: Option<&Path>, steps: Option<String>, overrides: &[String]) -> Result<()> {
    let config = load_config(path, steps, overrides)?;
    let settings = Settings::resolve(Some(&config))?;

    let orchestrator = Orchestrator::new(config, settings);
    match orchestrator.run().await {
        Ok(run) => {
            eprintln!(
                "\n[Run {} completed: {} stage(s)]",
                run.id, run.completed_steps
            );
            for artifact in &run.published {
                eprintln!("  published {}", artifact);
            }
            Ok(())
        }
        Err(OrchestratorError::Interrupted) => {
            eprintln!("\n[Run interrupted]");
            std::process::exit(130);
        }
        Err(e) => {
            report_failure(&e);
            std::process::exit(1);
        }
    }
}

fn report_failure(error: &OrchestratorError) {
    eprintln!("\n[Run failed: {}]", error);
    if let OrchestratorError::StageExecution { failure, .. } = error {
        if let Some(diagnostics) = failure.diagnostics() {
            eprintln!("\nLast stderr lines:");
            for line in diagnostics.lines() {
                eprintln!("  {}", line);
            }
        }
    }
}

/// Print the stage table
fn list_steps() {
    let table = StageTable::canonical();
    for stage in table.stages() {
        let marker = if stage.auto_run { " " } else { "*" };
        println!("{}{}", marker, stage.summary());
    }
    println!("\n* runs only when named explicitly");
}

/// Show the effective configuration
fn show_config(path: Option<&Path>, overrides: &[String]) -> Result<()> {
    let config = load_config(path, None, overrides)?;
    let settings = Settings::resolve(Some(&config))?;

    println!(
        "Config file:  {}",
        config
            .source()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none)".to_string())
    );
    println!("Project root: {}", config.project_root().display());
    println!("Home:         {}", settings.home.display());
    println!("Runs:         {}", settings.runs_dir().display());
    println!("Artifacts:    {}", settings.store_dir.display());
    println!();
    print!(
        "{}",
        serde_yaml::to_string(config.tree()).context("Failed to render config")?
    );

    Ok(())
}

/// Show the status of a run
async fn show_status(run_id_str: &str) -> Result<()> {
    let run_id = Uuid::parse_str(run_id_str)
        .with_context(|| format!("Invalid run ID: {}", run_id_str))?;

    let settings = Settings::resolve(None)?;
    let run = load_run(&settings.runs_dir(), run_id).await?;

    println!("Run ID: {}", run.id);
    println!("Group: {}", run.group);
    println!("State: {}", run.state);
    println!("Started: {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }
    println!("\nStages:");
    for step in &run.steps {
        println!("  {}: {:?}", step, run.step_status(step));
    }
    if !run.published.is_empty() {
        println!("\nPublished:");
        for artifact in &run.published {
            println!("  {}", artifact);
        }
    }

    Ok(())
}

/// List recent runs
async fn list_runs(limit: usize) -> Result<()> {
    let settings = Settings::resolve(None)?;
    let runs = recent_runs(&settings.runs_dir(), limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<30} {:<10} {:<6}", "RUN ID", "GROUP", "STATE", "STAGES");
    println!("{}", "-".repeat(86));

    for run in runs {
        println!(
            "{:<38} {:<30} {:<10} {:<6}",
            run.id,
            run.group.to_string(),
            state_label(&run),
            format!("{}/{}", run.completed_steps, run.steps.len())
        );
    }

    Ok(())
}

fn state_label(run: &Run) -> &'static str {
    match run.state {
        RunState::Running => "running",
        RunState::Completed => "completed",
        RunState::Failed { .. } => "failed",
    }
}

/// Project and store for artifact commands
fn artifact_context(
    project: Option<String>,
    path: Option<&Path>,
) -> Result<(String, LocalArtifactStore)> {
    // An explicit config must load; a discovered one is optional
    let config = match path {
        Some(path) => Some(PipelineConfig::from_file(path)?),
        None => PipelineConfig::load(None).ok(),
    };
    let settings = Settings::resolve(config.as_ref())?;

    let project = match project {
        Some(project) => project,
        None => config
            .as_ref()
            .context("No config found; pass --project")?
            .text("main.project_name")?,
    };

    Ok((project, LocalArtifactStore::new(settings.store_dir)))
}

/// List artifact versions
async fn list_artifacts(name: &str, project: Option<String>, path: Option<&Path>) -> Result<()> {
    let (project, store) = artifact_context(project, path)?;
    let versions = store.versions(&project, name).await?;

    println!("{:<8} {:<20} {:<10} {:<18} {:<25}", "VERSION", "TAGS", "SIZE", "DIGEST", "CREATED");
    println!("{}", "-".repeat(85));

    for (handle, tags) in versions {
        let tags: Vec<String> = tags.iter().map(ToString::to_string).collect();
        println!(
            "{:<8} {:<20} {:<10} {:<18} {:<25}",
            format!("v{}", handle.version),
            tags.join(","),
            handle.size_bytes,
            &handle.digest[..handle.digest.len().min(16)],
            handle.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// Parse `3` or `v3`
fn parse_version(raw: &str) -> Result<u32> {
    raw.strip_prefix('v')
        .unwrap_or(raw)
        .parse()
        .with_context(|| format!("Invalid version '{}'", raw))
}

/// Assign a lifecycle tag
async fn promote(
    name: &str,
    version: &str,
    tag: ArtifactTag,
    project: Option<String>,
    path: Option<&Path>,
) -> Result<()> {
    let version = parse_version(version)?;
    let (project, store) = artifact_context(project, path)?;

    let handle = store.promote(&project, name, version, tag).await?;
    println!("{}:v{} is now {}:{}", handle.name, handle.version, handle.name, tag);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_overrides() {
        let cli = Cli::try_parse_from([
            "mlpipe",
            "run",
            "--steps",
            "download,basic_cleaning",
            "etl.min_price=20",
            "modeling.random_forest.max_depth=10",
        ])
        .unwrap();

        match cli.command {
            Commands::Run {
                steps, overrides, ..
            } => {
                assert_eq!(steps.as_deref(), Some("download,basic_cleaning"));
                assert_eq!(
                    overrides,
                    vec!["etl.min_price=20", "modeling.random_forest.max_depth=10"]
                );
            }
            other => panic!("Expected Run, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_promote() {
        let cli = Cli::try_parse_from(["mlpipe", "promote", "random_forest_export", "v2", "prod"])
            .unwrap();
        match cli.command {
            Commands::Promote { name, version, tag, .. } => {
                assert_eq!(name, "random_forest_export");
                assert_eq!(parse_version(&version).unwrap(), 2);
                assert_eq!(tag, ArtifactTag::Prod);
            }
            other => panic!("Expected Promote, got {:?}", other),
        }

        assert!(Cli::try_parse_from(["mlpipe", "promote", "x", "1", "stable"]).is_err());
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("3").unwrap(), 3);
        assert_eq!(parse_version("v12").unwrap(), 12);
        assert!(parse_version("latest").is_err());
    }

    #[test]
    fn test_load_config_applies_steps_last() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(
            &path,
            "main:\n  project_name: p\n  experiment_name: e\n  steps: all\n",
        )
        .unwrap();

        let config = load_config(
            Some(&path),
            Some("download".to_string()),
            &["main.steps=data_split".to_string()],
        )
        .unwrap();
        assert_eq!(config.text("main.steps").unwrap(), "download");
    }
}
