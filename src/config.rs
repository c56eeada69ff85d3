//! Configuration for mlpipe.
//!
//! Two kinds of configuration live here:
//!
//! - The pipeline configuration: a nested YAML document (`config.yaml`)
//!   with `main`, `etl`, `data_check` and `modeling` sections. It is loaded
//!   once, patched with `key.path=value` overrides, and read-only afterwards.
//!   Stage parameters are looked up by dotted key when a stage is assembled,
//!   so a missing or malformed key only fails the stage that needs it.
//! - Engine settings: where run logs and the local artifact store live.
//!
//! Sources for engine settings (highest priority first):
//! 1. Environment variables (MLPIPE_HOME, MLPIPE_ARTIFACT_STORE)
//! 2. `tracking.store_dir` in the pipeline config (relative to the project root)
//! 3. Defaults (~/.mlpipe)
//!
//! Config file discovery:
//! - Searches the current directory and parents for `config.yaml`
//! - The directory holding the config file is the project root; stage source
//!   directories and `data/` resolve against it

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use crate::core::OrchestratorError;

/// Default pipeline config file name
pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// Environment variable overriding the engine home directory
pub const HOME_ENV: &str = "MLPIPE_HOME";

/// Environment variable overriding the artifact store directory
pub const STORE_ENV: &str = "MLPIPE_ARTIFACT_STORE";

/// How a scalar configuration value must look
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Any scalar; rendered verbatim
    Text,

    /// Integer or floating point number
    Number,

    /// Whole number
    Integer,
}

/// The `main` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MainSettings {
    pub project_name: String,
    pub experiment_name: String,
    pub steps: String,
}

/// Loaded pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Parsed document
    tree: Value,

    /// Directory stage paths resolve against
    project_root: PathBuf,

    /// Path to config file (if loaded from one)
    source: Option<PathBuf>,
}

impl PipelineConfig {
    /// Wrap an already-parsed document
    pub fn from_value(tree: Value, project_root: impl Into<PathBuf>) -> Self {
        Self {
            tree,
            project_root: project_root.into(),
            source: None,
        }
    }

    /// Parse configuration from YAML content
    pub fn from_yaml(content: &str, project_root: impl Into<PathBuf>) -> Result<Self> {
        let tree: Value = serde_yaml::from_str(content).context("Failed to parse config YAML")?;
        if !tree.is_object() {
            anyhow::bail!("Config document must be a mapping at the top level");
        }
        Ok(Self::from_value(tree, project_root))
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let absolute = std::path::absolute(path)
            .with_context(|| format!("Failed to resolve config path: {}", path.display()))?;
        let project_root = absolute
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut config = Self::from_yaml(&content, project_root)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.source = Some(absolute);
        Ok(config)
    }

    /// Load the given file, or discover `config.yaml` from the current directory upward
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let path = find_config_file().with_context(|| {
                    format!(
                        "No {} found in the current directory or its parents (use --config)",
                        CONFIG_FILE_NAME
                    )
                })?;
                Self::from_file(&path)
            }
        }
    }

    /// Directory stage sources and data resolve against
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Path of the loaded file, if any
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// The full document
    pub fn tree(&self) -> &Value {
        &self.tree
    }

    /// Apply a `key.path=value` override; the value is parsed as a YAML scalar
    pub fn apply_override(&mut self, assignment: &str) -> Result<()> {
        let (key, raw) = assignment
            .split_once('=')
            .with_context(|| format!("Override '{}' is not of the form key=value", assignment))?;

        let key = key.trim();
        let value = if raw.is_empty() {
            Value::String(String::new())
        } else {
            serde_yaml::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
        };

        self.set(key, value)
            .with_context(|| format!("Failed to apply override '{}'", assignment))
    }

    /// Set a value at a dotted key, creating intermediate sections
    pub fn set(&mut self, key: &str, value: Value) -> Result<()> {
        let segments: Vec<&str> = key.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            anyhow::bail!("Invalid config key '{}'", key);
        }

        let (last, parents) = segments
            .split_last()
            .context("Config key cannot be empty")?;

        let mut node = &mut self.tree;
        for segment in parents {
            let map = node
                .as_object_mut()
                .with_context(|| format!("Cannot set '{}': '{}' is not a section", key, segment))?;
            node = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }

        let map = node
            .as_object_mut()
            .with_context(|| format!("Cannot set '{}': parent is not a section", key))?;
        map.insert(last.to_string(), value);
        Ok(())
    }

    /// Look up a dotted key
    pub fn get(&self, key: &str) -> Option<&Value> {
        key.split('.')
            .try_fold(&self.tree, |node, segment| node.as_object()?.get(segment))
    }

    fn require(&self, key: &str) -> Result<&Value, OrchestratorError> {
        match self.get(key) {
            None | Some(Value::Null) => Err(OrchestratorError::config(key, "missing required key")),
            Some(value) => Ok(value),
        }
    }

    /// A scalar rendered as a command-line string, checked against `kind`
    pub fn scalar(&self, key: &str, kind: ValueKind) -> Result<String, OrchestratorError> {
        let value = self.require(key)?;
        match kind {
            ValueKind::Text => render_text(key, value),
            ValueKind::Number => render_number(key, value),
            ValueKind::Integer => render_integer(key, value),
        }
    }

    /// A string-ish scalar
    pub fn text(&self, key: &str) -> Result<String, OrchestratorError> {
        self.scalar(key, ValueKind::Text)
    }

    /// A nested section, returned verbatim
    pub fn object(&self, key: &str) -> Result<&Map<String, Value>, OrchestratorError> {
        self.require(key)?
            .as_object()
            .ok_or_else(|| OrchestratorError::config(key, "expected a mapping"))
    }

    /// The `main` section: run identity and step directive
    pub fn main(&self) -> Result<MainSettings, OrchestratorError> {
        Ok(MainSettings {
            project_name: self.text("main.project_name")?,
            experiment_name: self.text("main.experiment_name")?,
            steps: self.text("main.steps")?,
        })
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Object(_) => "a mapping".to_string(),
        Value::Array(_) => "a list".to_string(),
        other => other.to_string(),
    }
}

fn render_text(key: &str, value: &Value) -> Result<String, OrchestratorError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(true) => Ok("True".to_string()),
        Value::Bool(false) => Ok("False".to_string()),
        other => Err(OrchestratorError::config(
            key,
            format!("expected a scalar, found {}", describe(other)),
        )),
    }
}

fn render_number(key: &str, value: &Value) -> Result<String, OrchestratorError> {
    match value {
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) if s.trim().parse::<f64>().is_ok_and(f64::is_finite) => {
            Ok(s.trim().to_string())
        }
        other => Err(OrchestratorError::config(
            key,
            format!("expected a number, found {}", describe(other)),
        )),
    }
}

fn render_integer(key: &str, value: &Value) -> Result<String, OrchestratorError> {
    match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
        Value::String(s) if s.trim().parse::<i64>().is_ok() => Ok(s.trim().to_string()),
        other => Err(OrchestratorError::config(
            key,
            format!("expected an integer, found {}", describe(other)),
        )),
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_FILE_NAME);
        if config_path.is_file() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Resolve a path that may be relative to a base directory
pub fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Engine settings: where mlpipe keeps its own state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Engine home (run logs live under `runs/`)
    pub home: PathBuf,

    /// Root of the local artifact store
    pub store_dir: PathBuf,
}

impl Settings {
    /// Settings rooted at an explicit home directory
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            store_dir: home.join("artifacts"),
            home,
        }
    }

    /// Resolve settings from the environment, the pipeline config and defaults
    pub fn resolve(config: Option<&PipelineConfig>) -> Result<Self> {
        let home = match std::env::var(HOME_ENV) {
            Ok(env_home) => PathBuf::from(env_home),
            Err(_) => dirs::home_dir()
                .context("Failed to determine home directory")?
                .join(".mlpipe"),
        };

        let mut settings = Self::with_home(home);

        if let Ok(env_store) = std::env::var(STORE_ENV) {
            settings.store_dir = PathBuf::from(env_store);
        } else if let Some(config) = config {
            if let Some(Value::String(dir)) = config.get("tracking.store_dir") {
                settings.store_dir = resolve_path(config.project_root(), dir);
            }
        }

        Ok(settings)
    }

    /// Directory holding one sub-directory per run
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }
}
