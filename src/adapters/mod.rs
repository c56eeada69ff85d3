//! Adapter interfaces for stage runners.
//!
//! An adapter takes a fully assembled `Invocation` and blocks until the
//! stage finishes. `ProcessAdapter` runs a stage's own program; the
//! `MlflowAdapter` hands reusable components to `mlflow run`.

pub mod mlflow;
pub mod process;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::core::StageFailure;

// Re-export the concrete adapters
pub use mlflow::MlflowAdapter;
pub use process::ProcessAdapter;

/// What to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationTarget {
    /// A program started in the stage's source directory
    Process {
        program: String,
        fixed_args: Vec<String>,
        working_dir: PathBuf,
    },

    /// A component run by the pipeline-step runner
    Component { uri: String, entry_point: String },
}

/// A stage invocation, ready to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Stage name
    pub stage: String,

    /// What to run
    pub target: InvocationTarget,

    /// Ordered `(flag, value)` pairs
    pub params: Vec<(String, String)>,

    /// Extra environment for the child (run group, tracker client)
    pub env: Vec<(String, String)>,
}

impl Invocation {
    /// Command-line arguments after the program: fixed args, then
    /// `--flag value` for every parameter in order
    pub fn command_args(&self) -> Vec<String> {
        let mut args = match &self.target {
            InvocationTarget::Process { fixed_args, .. } => fixed_args.clone(),
            InvocationTarget::Component { .. } => Vec::new(),
        };

        for (flag, value) in &self.params {
            args.push(format!("--{}", flag));
            args.push(value.clone());
        }
        args
    }

    /// Parameters as a named map
    pub fn parameter_map(&self) -> BTreeMap<String, String> {
        self.params.iter().cloned().collect()
    }

    /// Value passed for a flag, if any
    pub fn param(&self, flag: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(f, _)| f == flag)
            .map(|(_, v)| v.as_str())
    }
}

/// Outcome of a successful stage run
#[derive(Debug, Clone, Default)]
pub struct AdapterOutput {
    /// Exit code reported by the stage (0 unless the runner says otherwise)
    pub exit_code: i32,

    /// Wall-clock time spent in the stage
    pub duration_ms: u64,
}

/// Trait for stage runners
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Human-readable adapter name
    fn name(&self) -> &str;

    /// Run the invocation to completion
    async fn execute(&self, invocation: &Invocation) -> Result<AdapterOutput, StageFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation() -> Invocation {
        Invocation {
            stage: "basic_cleaning".to_string(),
            target: InvocationTarget::Process {
                program: "python".to_string(),
                fixed_args: vec!["run.py".to_string()],
                working_dir: PathBuf::from("/project/src/basic_cleaning"),
            },
            params: vec![
                ("input_artifact".to_string(), "sample.csv:latest".to_string()),
                ("min_price".to_string(), "10".to_string()),
            ],
            env: Vec::new(),
        }
    }

    #[test]
    fn test_command_args() {
        assert_eq!(
            invocation().command_args(),
            vec![
                "run.py",
                "--input_artifact",
                "sample.csv:latest",
                "--min_price",
                "10"
            ]
        );
    }

    #[test]
    fn test_parameter_map() {
        let map = invocation().parameter_map();
        assert_eq!(map.get("min_price").map(String::as_str), Some("10"));
        assert_eq!(invocation().param("input_artifact"), Some("sample.csv:latest"));
        assert_eq!(invocation().param("max_price"), None);
    }
}
