//! Stage execution.
//!
//! Turns a stage definition plus configuration into a concrete invocation:
//! input references are built from config, scalar parameters are rendered,
//! configuration blobs are written into the workspace, inputs are resolved
//! through the tracker, and the invocation is handed to the matching adapter.

use std::time::Instant;

use tracing::{info, instrument};

use super::error::OrchestratorError;
use super::resolver::ArtifactResolver;
use super::stages::{ArgSource, Stage, StageRunner};
use super::workspace::Workspace;
use crate::adapters::{Adapter, Invocation, InvocationTarget};
use crate::config::PipelineConfig;
use crate::domain::{ArtifactDescriptor, ArtifactHandle, ArtifactRef};

/// An input reference, positioned in the stage's argument list
#[derive(Debug, Clone)]
pub struct InputRef {
    pub position: usize,
    pub flag: &'static str,
    pub reference: ArtifactRef,
}

/// An input reference the tracker has resolved
#[derive(Debug, Clone)]
pub struct ResolvedInput {
    pub position: usize,
    pub flag: &'static str,
    pub reference: ArtifactRef,
    pub handle: ArtifactHandle,
}

/// A rendered parameter, positioned in the stage's argument list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub position: usize,
    pub flag: &'static str,
    pub value: String,
}

/// Outcome of a completed stage
#[derive(Debug, Clone)]
pub struct StageResult {
    pub stage: &'static str,
    pub duration_ms: u64,

    /// Exit code, for stages run by an adapter
    pub exit_code: Option<i32>,

    /// Versions the orchestrator published for this stage
    pub published: Vec<ArtifactHandle>,
}

/// Executes stages for one run
pub struct StageExecutor<'a> {
    config: &'a PipelineConfig,
    workspace: &'a Workspace,
    resolver: &'a ArtifactResolver,
    process_adapter: &'a dyn Adapter,
    component_adapter: &'a dyn Adapter,
}

impl<'a> StageExecutor<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        workspace: &'a Workspace,
        resolver: &'a ArtifactResolver,
        process_adapter: &'a dyn Adapter,
        component_adapter: &'a dyn Adapter,
    ) -> Self {
        Self {
            config,
            workspace,
            resolver,
            process_adapter,
            component_adapter,
        }
    }

    /// Build the stage's `name:tag` input references from configuration
    pub fn input_references(&self, stage: &Stage) -> Result<Vec<InputRef>, OrchestratorError> {
        stage
            .args
            .iter()
            .enumerate()
            .filter_map(|(position, arg)| match arg.source {
                ArgSource::Input { name, tag } => Some((position, arg.flag, name, tag)),
                _ => None,
            })
            .map(|(position, flag, name, tag)| -> Result<InputRef, OrchestratorError> {
                Ok(InputRef {
                    position,
                    flag,
                    reference: name.reference(tag, self.config)?,
                })
            })
            .collect()
    }

    /// Render the stage's parameters from configuration.
    ///
    /// Blob parameters are written to the workspace here; their value is the
    /// file's absolute path.
    pub fn assemble_parameters(&self, stage: &Stage) -> Result<Vec<Parameter>, OrchestratorError> {
        let mut params = Vec::new();

        for (position, arg) in stage.args.iter().enumerate() {
            let value = match arg.source {
                ArgSource::Input { .. } => continue,
                ArgSource::Config { key, kind } => self.config.scalar(key, kind)?,
                ArgSource::ConfigFile { key, file_name } => {
                    let section = self.config.object(key)?;
                    let path = self.workspace.materialize_json(file_name, section)?;
                    path.display().to_string()
                }
            };

            params.push(Parameter {
                position,
                flag: arg.flag,
                value,
            });
        }

        Ok(params)
    }

    /// Resolve every input through the tracker, in argument order
    pub async fn resolve_inputs(
        &self,
        inputs: Vec<InputRef>,
    ) -> Result<Vec<ResolvedInput>, OrchestratorError> {
        let mut resolved = Vec::with_capacity(inputs.len());
        for input in inputs {
            let handle = self.resolver.resolve(&input.reference).await?;
            resolved.push(ResolvedInput {
                position: input.position,
                flag: input.flag,
                reference: input.reference,
                handle,
            });
        }
        Ok(resolved)
    }

    /// Merge inputs and parameters into the stage's invocation
    pub fn build_invocation(
        &self,
        stage: &Stage,
        inputs: &[ResolvedInput],
        params: &[Parameter],
    ) -> Result<Invocation, OrchestratorError> {
        let target = match &stage.runner {
            StageRunner::Process {
                program,
                fixed_args,
                source_dir,
            } => InvocationTarget::Process {
                program: program.to_string(),
                fixed_args: fixed_args.iter().map(|a| a.to_string()).collect(),
                working_dir: self.config.project_root().join(source_dir),
            },
            StageRunner::Component {
                component,
                entry_point,
            } => {
                let repository = self.config.text("main.components_repository")?;
                InvocationTarget::Component {
                    uri: format!("{}/{}", repository.trim_end_matches('/'), component),
                    entry_point: entry_point.to_string(),
                }
            }
            StageRunner::Upload { .. } => {
                return Err(OrchestratorError::config(
                    stage.name,
                    "upload stages are published, not invoked",
                ));
            }
        };

        // Inputs pass their canonical `name:tag` form, like every other value
        let mut positioned: Vec<(usize, String, String)> = inputs
            .iter()
            .map(|i| (i.position, i.flag.to_string(), i.reference.to_string()))
            .chain(
                params
                    .iter()
                    .map(|p| (p.position, p.flag.to_string(), p.value.clone())),
            )
            .collect();
        positioned.sort_by_key(|(position, _, _)| *position);

        let mut env = self.resolver.group().env();
        env.extend(self.resolver.client_env());

        Ok(Invocation {
            stage: stage.name.to_string(),
            target,
            params: positioned
                .into_iter()
                .map(|(_, flag, value)| (flag, value))
                .collect(),
            env,
        })
    }

    /// Run the stage with already resolved inputs and rendered parameters.
    ///
    /// Blocks until the stage finishes. Upload stages publish their file and
    /// return once the new version is recorded.
    #[instrument(skip(self, stage, inputs, params), fields(stage = stage.name))]
    pub async fn execute(
        &self,
        stage: &Stage,
        inputs: &[ResolvedInput],
        params: &[Parameter],
    ) -> Result<StageResult, OrchestratorError> {
        let started = Instant::now();

        if let StageRunner::Upload {
            data_dir,
            artifact_type,
            description,
        } = &stage.runner
        {
            let mut published = Vec::new();
            for output in &stage.outputs {
                let name = output.resolve(self.config)?;
                let source = self.config.project_root().join(data_dir).join(&name);
                let descriptor = ArtifactDescriptor::new(name, *artifact_type, *description);
                published.push(self.resolver.publish(stage.name, &descriptor, &source).await?);
            }

            return Ok(StageResult {
                stage: stage.name,
                duration_ms: started.elapsed().as_millis() as u64,
                exit_code: None,
                published,
            });
        }

        let invocation = self.build_invocation(stage, inputs, params)?;
        let adapter = match stage.runner {
            StageRunner::Component { .. } => self.component_adapter,
            _ => self.process_adapter,
        };

        info!(adapter = adapter.name(), args = ?invocation.command_args(), "Invoking stage");

        let output = adapter
            .execute(&invocation)
            .await
            .map_err(|failure| OrchestratorError::StageExecution {
                stage: stage.name.to_string(),
                failure,
            })?;

        Ok(StageResult {
            stage: stage.name,
            duration_ms: started.elapsed().as_millis() as u64,
            exit_code: Some(output.exit_code),
            published: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::adapters::AdapterOutput;
    use crate::core::error::StageFailure;
    use crate::core::stages::StageTable;
    use crate::domain::RunGroup;
    use crate::tracking::LocalArtifactStore;

    const CONFIG_YAML: &str = r#"
main:
  project_name: nyc_airbnb
  experiment_name: development
  steps: all
  components_repository: "https://example.com/components#components/"
etl:
  sample: "sample1.csv"
  min_price: 10
  max_price: 350
  output_artifact: "clean_sample.csv"
  output_type: "clean_sample"
  output_description: "Data with outliers and null values removed"
modeling:
  test_size: 0.2
  val_size: 0.2
  random_seed: 42
  stratify_by: "neighbourhood_group"
  max_tfidf_features: 5
  output_artifact: "random_forest_export"
  random_forest:
    n_estimators: 100
    max_depth: 15
"#;

    /// Records every invocation and succeeds
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Invocation>>,
    }

    #[async_trait]
    impl Adapter for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn execute(&self, invocation: &Invocation) -> Result<AdapterOutput, StageFailure> {
            self.seen.lock().unwrap().push(invocation.clone());
            Ok(AdapterOutput::default())
        }
    }

    struct Fixture {
        temp: TempDir,
        config: PipelineConfig,
        workspace: Workspace,
        resolver: ArtifactResolver,
        recorder: Recorder,
        table: StageTable,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let config = PipelineConfig::from_yaml(CONFIG_YAML, temp.path()).unwrap();
            let store = LocalArtifactStore::new(temp.path().join("store"));
            let resolver =
                ArtifactResolver::new(Arc::new(store), RunGroup::new("nyc_airbnb", "development"));
            Self {
                temp,
                config,
                workspace: Workspace::create().unwrap(),
                resolver,
                recorder: Recorder::default(),
                table: StageTable::canonical(),
            }
        }

        fn executor(&self) -> StageExecutor<'_> {
            StageExecutor::new(
                &self.config,
                &self.workspace,
                &self.resolver,
                &self.recorder,
                &self.recorder,
            )
        }

        fn stage(&self, name: &str) -> &Stage {
            self.table.get(name).unwrap()
        }
    }

    #[test]
    fn test_input_references_follow_config() {
        let fixture = Fixture::new();
        let refs = fixture
            .executor()
            .input_references(fixture.stage("data_check"))
            .unwrap();

        let rendered: Vec<(usize, &str, String)> = refs
            .iter()
            .map(|r| (r.position, r.flag, r.reference.to_string()))
            .collect();
        assert_eq!(
            rendered,
            vec![
                (0, "csv", "clean_sample.csv:latest".to_string()),
                (1, "ref", "clean_sample.csv:reference".to_string()),
            ]
        );
    }

    #[test]
    fn test_assemble_basic_cleaning() {
        let fixture = Fixture::new();
        let params = fixture
            .executor()
            .assemble_parameters(fixture.stage("basic_cleaning"))
            .unwrap();

        let values: Vec<(&str, &str)> = params.iter().map(|p| (p.flag, p.value.as_str())).collect();
        assert_eq!(
            values,
            vec![
                ("output_artifact", "clean_sample.csv"),
                ("output_type", "clean_sample"),
                ("output_description", "Data with outliers and null values removed"),
                ("min_price", "10"),
                ("max_price", "350"),
            ]
        );
    }

    #[test]
    fn test_missing_key_fails_only_the_stage_that_needs_it() {
        let fixture = Fixture::new();
        // data_check.kl_threshold is absent from the fixture
        let err = fixture
            .executor()
            .assemble_parameters(fixture.stage("data_check"))
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Configuration { ref key, .. } if key == "data_check.kl_threshold"
        ));

        assert!(fixture
            .executor()
            .assemble_parameters(fixture.stage("data_split"))
            .is_ok());
    }

    #[test]
    fn test_rf_config_is_materialized_in_workspace() {
        let fixture = Fixture::new();
        let params = fixture
            .executor()
            .assemble_parameters(fixture.stage("train_random_forest"))
            .unwrap();

        let rf = params.iter().find(|p| p.flag == "rf_config").unwrap();
        let path = std::path::Path::new(&rf.value);
        assert!(path.is_absolute());
        assert!(path.starts_with(fixture.workspace.path()));

        let content: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(content, serde_json::json!({"n_estimators": 100, "max_depth": 15}));
    }

    #[tokio::test]
    async fn test_component_invocation() {
        let fixture = Fixture::new();
        let executor = fixture.executor();
        let stage = fixture.stage("data_split");

        // Publish the cleaned sample so the input resolves
        let source = fixture.temp.path().join("clean.csv");
        std::fs::write(&source, "id,price\n1,100\n").unwrap();
        fixture
            .resolver
            .publish(
                "basic_cleaning",
                &ArtifactDescriptor::new("clean_sample.csv", "clean_sample", "d"),
                &source,
            )
            .await
            .unwrap();

        let inputs = executor
            .resolve_inputs(executor.input_references(stage).unwrap())
            .await
            .unwrap();
        let params = executor.assemble_parameters(stage).unwrap();
        let result = executor.execute(stage, &inputs, &params).await.unwrap();
        assert_eq!(result.exit_code, Some(0));

        let seen = fixture.recorder.seen.lock().unwrap();
        let invocation = &seen[0];
        assert_eq!(
            invocation.target,
            InvocationTarget::Component {
                uri: "https://example.com/components#components/train_val_test_split".to_string(),
                entry_point: "main".to_string(),
            }
        );
        let flags: Vec<&str> = invocation.params.iter().map(|(f, _)| f.as_str()).collect();
        assert_eq!(flags, vec!["input", "test_size", "random_seed", "stratify_by"]);
        assert_eq!(invocation.param("input"), Some("clean_sample.csv:latest"));
        assert!(invocation
            .env
            .contains(&("WANDB_RUN_GROUP".to_string(), "development".to_string())));
    }

    #[tokio::test]
    async fn test_process_invocation_runs_in_source_dir() {
        let fixture = Fixture::new();
        let executor = fixture.executor();
        let stage = fixture.stage("basic_cleaning");

        let params = executor.assemble_parameters(stage).unwrap();
        let invocation = executor.build_invocation(stage, &[], &params).unwrap();

        match invocation.target {
            InvocationTarget::Process {
                program,
                working_dir,
                ..
            } => {
                assert_eq!(program, "python");
                assert_eq!(working_dir, fixture.temp.path().join("src/basic_cleaning"));
            }
            other => panic!("Expected a process target, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upload_publishes_sample() {
        let fixture = Fixture::new();
        let data_dir = fixture.temp.path().join("data");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(data_dir.join("sample1.csv"), "id,price\n1,100\n").unwrap();

        let stage = fixture.stage("download");
        let result = fixture.executor().execute(stage, &[], &[]).await.unwrap();

        assert_eq!(result.exit_code, None);
        assert_eq!(result.published.len(), 1);
        assert_eq!(result.published[0].name, "sample1.csv");
        assert_eq!(result.published[0].artifact_type, "raw_data");
        assert!(fixture.recorder.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_of_missing_file_fails_the_stage() {
        let fixture = Fixture::new();
        let stage = fixture.stage("download");
        let err = fixture.executor().execute(stage, &[], &[]).await.unwrap_err();
        assert_eq!(err.failed_stage(), Some("download"));
    }
}
