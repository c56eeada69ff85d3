//! Stage definitions and step selection.
//!
//! The pipeline is a fixed, hand-ordered chain. Each stage declares its
//! runner, its command-line slots (artifact inputs, configuration values and
//! configuration blobs, in argument order) and the artifact names it
//! produces. Configuration-driven names and values are looked up when the
//! stage is assembled, not when the table is built.

use std::collections::HashSet;

use anyhow::Result;

use super::error::OrchestratorError;
use crate::config::{PipelineConfig, ValueKind};
use crate::domain::{ArtifactRef, ArtifactTag};

/// Sentinel directive selecting every auto-runnable stage
pub const ALL_STEPS: &str = "all";

/// Name of an artifact, either fixed or read from a config key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactName {
    Fixed(&'static str),
    Config(&'static str),
}

impl ArtifactName {
    /// Concrete name under the given configuration
    pub fn resolve(&self, config: &PipelineConfig) -> Result<String, OrchestratorError> {
        match self {
            Self::Fixed(name) => Ok(name.to_string()),
            Self::Config(key) => config.text(key),
        }
    }

    /// Build a reference under the given configuration
    pub fn reference(
        &self,
        tag: ArtifactTag,
        config: &PipelineConfig,
    ) -> Result<ArtifactRef, OrchestratorError> {
        let name = self.resolve(config)?;
        ArtifactRef::new(name, tag).map_err(|e| match self {
            Self::Config(key) => OrchestratorError::config(*key, e.to_string()),
            Self::Fixed(name) => OrchestratorError::config(*name, e.to_string()),
        })
    }

    /// Human-readable form for listings (`<etl.sample>` for config names)
    pub fn describe(&self) -> String {
        match self {
            Self::Fixed(name) => name.to_string(),
            Self::Config(key) => format!("<{}>", key),
        }
    }
}

/// Where the value of one `--flag value` pair comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgSource {
    /// A `name:tag` reference, resolved through the tracker
    Input { name: ArtifactName, tag: ArtifactTag },

    /// A scalar configuration value
    Config { key: &'static str, kind: ValueKind },

    /// A configuration section serialized to a workspace file; the value is
    /// the file's absolute path
    ConfigFile {
        key: &'static str,
        file_name: &'static str,
    },
}

/// One `--flag value` slot of a stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageArg {
    pub flag: &'static str,
    pub source: ArgSource,
}

/// How a stage is executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageRunner {
    /// External process run in `<project_root>/<source_dir>`
    Process {
        program: &'static str,
        fixed_args: &'static [&'static str],
        source_dir: &'static str,
    },

    /// Reusable component run by the pipeline-step runner
    /// (`<main.components_repository>/<component>`)
    Component {
        component: &'static str,
        entry_point: &'static str,
    },

    /// A local file under `<project_root>/<data_dir>` published directly
    Upload {
        data_dir: &'static str,
        artifact_type: &'static str,
        description: &'static str,
    },
}

impl StageRunner {
    fn kind(&self) -> &'static str {
        match self {
            Self::Process { .. } => "process",
            Self::Component { .. } => "component",
            Self::Upload { .. } => "upload",
        }
    }
}

/// A named unit of work in the chain
#[derive(Debug, Clone)]
pub struct Stage {
    /// Unique stage name
    pub name: &'static str,

    /// Position in the canonical chain
    pub ordinal: usize,

    /// How the stage runs
    pub runner: StageRunner,

    /// Argument slots, in command-line order
    pub args: Vec<StageArg>,

    /// Artifact names this stage publishes
    pub outputs: Vec<ArtifactName>,

    /// Whether `all` includes this stage
    pub auto_run: bool,
}

impl Stage {
    pub fn new(name: &'static str, runner: StageRunner) -> Self {
        Self {
            name,
            ordinal: 0,
            runner,
            args: Vec::new(),
            outputs: Vec::new(),
            auto_run: true,
        }
    }

    /// Add an artifact input slot
    pub fn input(mut self, flag: &'static str, name: ArtifactName, tag: ArtifactTag) -> Self {
        self.args.push(StageArg {
            flag,
            source: ArgSource::Input { name, tag },
        });
        self
    }

    /// Add a scalar configuration slot
    pub fn param(mut self, flag: &'static str, key: &'static str, kind: ValueKind) -> Self {
        self.args.push(StageArg {
            flag,
            source: ArgSource::Config { key, kind },
        });
        self
    }

    /// Add a slot whose value is a workspace file holding a config section
    pub fn config_file(mut self, flag: &'static str, key: &'static str, file_name: &'static str) -> Self {
        self.args.push(StageArg {
            flag,
            source: ArgSource::ConfigFile { key, file_name },
        });
        self
    }

    /// Declare a published artifact
    pub fn produces(mut self, name: ArtifactName) -> Self {
        self.outputs.push(name);
        self
    }

    /// Exclude from `all`; the stage runs only when named explicitly
    pub fn manual_only(mut self) -> Self {
        self.auto_run = false;
        self
    }

    /// Input slots, in argument order
    pub fn inputs(&self) -> impl Iterator<Item = (&'static str, ArtifactName, ArtifactTag)> + '_ {
        self.args.iter().filter_map(|arg| match arg.source {
            ArgSource::Input { name, tag } => Some((arg.flag, name, tag)),
            _ => None,
        })
    }

    /// One-line summary for listings
    pub fn summary(&self) -> String {
        let inputs: Vec<String> = self
            .inputs()
            .map(|(_, name, tag)| format!("{}:{}", name.describe(), tag))
            .collect();
        let outputs: Vec<String> = self.outputs.iter().map(ArtifactName::describe).collect();

        format!(
            "{} [{}] in: {} out: {}",
            self.name,
            self.runner.kind(),
            if inputs.is_empty() { "-".to_string() } else { inputs.join(", ") },
            if outputs.is_empty() { "-".to_string() } else { outputs.join(", ") },
        )
    }
}

/// The ordered stage table
#[derive(Debug, Clone)]
pub struct StageTable {
    stages: Vec<Stage>,
}

impl StageTable {
    /// Build a table; ordinals follow the given order
    pub fn new(stages: Vec<Stage>) -> Self {
        let stages = stages
            .into_iter()
            .enumerate()
            .map(|(ordinal, mut stage)| {
                stage.ordinal = ordinal;
                stage
            })
            .collect();
        Self { stages }
    }

    /// The canonical ML pipeline chain
    pub fn canonical() -> Self {
        use ArtifactName::{Config, Fixed};
        use ArtifactTag::{Latest, Prod, Reference};
        use ValueKind::{Integer, Number, Text};

        Self::new(vec![
            Stage::new(
                "download",
                StageRunner::Upload {
                    data_dir: "data",
                    artifact_type: "raw_data",
                    description: "Raw data from local file",
                },
            )
            .produces(Config("etl.sample")),
            Stage::new(
                "basic_cleaning",
                StageRunner::Process {
                    program: "python",
                    fixed_args: &["run.py"],
                    source_dir: "src/basic_cleaning",
                },
            )
            .input("input_artifact", Config("etl.sample"), Latest)
            .param("output_artifact", "etl.output_artifact", Text)
            .param("output_type", "etl.output_type", Text)
            .param("output_description", "etl.output_description", Text)
            .param("min_price", "etl.min_price", Number)
            .param("max_price", "etl.max_price", Number)
            .produces(Config("etl.output_artifact")),
            Stage::new(
                "data_check",
                StageRunner::Process {
                    program: "pytest",
                    fixed_args: &[".", "-vv"],
                    source_dir: "src/data_check",
                },
            )
            .input("csv", Config("etl.output_artifact"), Latest)
            .input("ref", Config("etl.output_artifact"), Reference)
            .param("kl_threshold", "data_check.kl_threshold", Number)
            .param("min_price", "etl.min_price", Number)
            .param("max_price", "etl.max_price", Number),
            Stage::new(
                "data_split",
                StageRunner::Component {
                    component: "train_val_test_split",
                    entry_point: "main",
                },
            )
            .input("input", Config("etl.output_artifact"), Latest)
            .param("test_size", "modeling.test_size", Number)
            .param("random_seed", "modeling.random_seed", Integer)
            .param("stratify_by", "modeling.stratify_by", Text)
            .produces(Fixed("trainval_data"))
            .produces(Fixed("test_data")),
            Stage::new(
                "train_random_forest",
                StageRunner::Process {
                    program: "python",
                    fixed_args: &["run.py"],
                    source_dir: "src/train_random_forest",
                },
            )
            .input("trainval_artifact", Fixed("trainval_data"), Latest)
            .param("val_size", "modeling.val_size", Number)
            .param("random_seed", "modeling.random_seed", Integer)
            .param("stratify_by", "modeling.stratify_by", Text)
            .config_file("rf_config", "modeling.random_forest", "rf_config.json")
            .param("max_tfidf_features", "modeling.max_tfidf_features", Integer)
            .param("output_artifact", "modeling.output_artifact", Text)
            .produces(Config("modeling.output_artifact")),
            // Needs a model promoted to `prod` first, so `all` never runs it.
            Stage::new(
                "test_regression_model",
                StageRunner::Component {
                    component: "test_regression_model",
                    entry_point: "main",
                },
            )
            .input("mlflow_model", Config("modeling.output_artifact"), Prod)
            .input("test_dataset", Fixed("test_data"), Latest)
            .manual_only(),
        ])
    }

    /// All stages in canonical order
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Get a stage by name
    pub fn get(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Stage names in canonical order
    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name).collect()
    }

    /// Check the table's fixed order against its declared data flow.
    ///
    /// Every `latest` input must be produced by a strictly earlier stage.
    /// Other tags are assigned outside the chain (promotion, pinning) and
    /// are not checked.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.name.is_empty() {
                anyhow::bail!("Stage {} has an empty name", stage.ordinal);
            }
            if !seen.insert(stage.name) {
                anyhow::bail!("Duplicate stage name '{}'", stage.name);
            }
        }

        for (i, stage) in self.stages.iter().enumerate() {
            for (flag, name, tag) in stage.inputs() {
                if tag != ArtifactTag::Latest {
                    continue;
                }

                let producer = self.stages.iter().position(|s| s.outputs.contains(&name));
                match producer {
                    Some(idx) if idx >= i => {
                        anyhow::bail!(
                            "Stage '{}' input --{} reads {} which is produced by later stage '{}'",
                            stage.name,
                            flag,
                            name.describe(),
                            self.stages[idx].name
                        );
                    }
                    None => {
                        anyhow::bail!(
                            "Stage '{}' input --{} reads {} which no stage produces",
                            stage.name,
                            flag,
                            name.describe()
                        );
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }
}

/// Compute the active stages for a step directive.
///
/// `all` selects every auto-runnable stage. Otherwise the directive is a
/// comma-separated list of stage names; the result keeps canonical order
/// whatever the token order.
pub fn select_steps<'t>(
    directive: &str,
    table: &'t StageTable,
) -> Result<Vec<&'t Stage>, OrchestratorError> {
    let directive = directive.trim();

    if directive == ALL_STEPS {
        return Ok(table.stages().iter().filter(|s| s.auto_run).collect());
    }

    let mut requested = HashSet::new();
    for token in directive.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if table.get(token).is_none() {
            return Err(OrchestratorError::UnknownStage {
                name: token.to_string(),
                known: table.names().join(", "),
            });
        }
        requested.insert(token);
    }

    if requested.is_empty() {
        return Err(OrchestratorError::config(
            "main.steps",
            format!("'{}' selects no stages", directive),
        ));
    }

    Ok(table
        .stages()
        .iter()
        .filter(|s| requested.contains(s.name))
        .collect())
}
