//! MLflow adapter for reusable pipeline components.
//!
//! Delegates to the `mlflow run` CLI:
//! `mlflow run <uri> -e <entry_point> -P key=value ...`. A failed run is
//! reported exactly like a failed stage process.

use async_trait::async_trait;
use tokio::process::Command;

use super::process::run_command;
use super::{Adapter, AdapterOutput, Invocation, InvocationTarget};
use crate::core::StageFailure;

/// Adapter for component-backed stages
#[derive(Debug, Clone)]
pub struct MlflowAdapter {
    /// Path to the mlflow binary (default: "mlflow")
    binary_path: String,
}

impl Default for MlflowAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MlflowAdapter {
    pub fn new() -> Self {
        Self::with_binary_path("mlflow")
    }

    /// Create an adapter with a custom binary path
    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    /// Arguments passed to the mlflow binary; `-P` pairs are sorted by name
    pub fn run_args(invocation: &Invocation) -> Option<Vec<String>> {
        let InvocationTarget::Component { uri, entry_point } = &invocation.target else {
            return None;
        };

        let mut args = vec![
            "run".to_string(),
            uri.clone(),
            "-e".to_string(),
            entry_point.clone(),
        ];
        for (key, value) in invocation.parameter_map() {
            args.push("-P".to_string());
            args.push(format!("{}={}", key, value));
        }
        Some(args)
    }
}

#[async_trait]
impl Adapter for MlflowAdapter {
    fn name(&self) -> &str {
        "mlflow"
    }

    async fn execute(&self, invocation: &Invocation) -> Result<AdapterOutput, StageFailure> {
        let args = Self::run_args(invocation).ok_or_else(|| {
            StageFailure::Launch(format!(
                "stage '{}' is not a component stage",
                invocation.stage
            ))
        })?;

        let mut command = Command::new(&self.binary_path);
        command
            .args(args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        run_command(&invocation.stage, &self.binary_path, command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_invocation() -> Invocation {
        Invocation {
            stage: "data_split".to_string(),
            target: InvocationTarget::Component {
                uri: "https://github.com/org/repo#components/train_val_test_split".to_string(),
                entry_point: "main".to_string(),
            },
            params: vec![
                ("input".to_string(), "clean_sample.csv:latest".to_string()),
                ("test_size".to_string(), "0.2".to_string()),
                ("random_seed".to_string(), "42".to_string()),
            ],
            env: Vec::new(),
        }
    }

    #[test]
    fn test_run_args() {
        let args = MlflowAdapter::run_args(&split_invocation()).unwrap();
        assert_eq!(
            args,
            vec![
                "run",
                "https://github.com/org/repo#components/train_val_test_split",
                "-e",
                "main",
                "-P",
                "input=clean_sample.csv:latest",
                "-P",
                "random_seed=42",
                "-P",
                "test_size=0.2"
            ]
        );
    }

    #[tokio::test]
    async fn test_process_target_rejected() {
        let mut invocation = split_invocation();
        invocation.target = InvocationTarget::Process {
            program: "python".to_string(),
            fixed_args: Vec::new(),
            working_dir: std::path::PathBuf::from("."),
        };

        assert!(MlflowAdapter::run_args(&invocation).is_none());
        let err = MlflowAdapter::new().execute(&invocation).await.unwrap_err();
        assert!(matches!(err, StageFailure::Launch(_)));
    }

    #[test]
    fn test_custom_binary_path() {
        let adapter = MlflowAdapter::with_binary_path("/opt/conda/bin/mlflow");
        assert_eq!(adapter.binary_path, "/opt/conda/bin/mlflow");
        assert_eq!(adapter.name(), "mlflow");
    }
}
