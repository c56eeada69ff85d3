//! Artifact references, descriptors and handles.
//!
//! Artifacts are the only thing stages share: one stage publishes a named,
//! versioned object to the tracker and a later stage resolves it by
//! `name:tag`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::run::RunGroup;

/// Lifecycle label attached to an artifact version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactTag {
    /// Most recently published version
    Latest,

    /// Pinned baseline used for comparison
    Reference,

    /// Explicitly promoted for production use
    Prod,

    /// An explicit version number (`v0`, `v1`, ...)
    Version(u32),
}

impl ArtifactTag {
    /// Whether an operator may assign this tag with `promote`
    pub fn is_promotable(&self) -> bool {
        matches!(self, Self::Reference | Self::Prod)
    }
}

impl fmt::Display for ArtifactTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Reference => f.write_str("reference"),
            Self::Prod => f.write_str("prod"),
            Self::Version(v) => write!(f, "v{}", v),
        }
    }
}

impl FromStr for ArtifactTag {
    type Err = ArtifactRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "latest" => Ok(Self::Latest),
            "reference" => Ok(Self::Reference),
            "prod" => Ok(Self::Prod),
            other => other
                .strip_prefix('v')
                .and_then(|n| n.parse::<u32>().ok())
                .map(Self::Version)
                .ok_or_else(|| ArtifactRefError::UnknownTag(other.to_string())),
        }
    }
}

/// Errors raised while constructing artifact references
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtifactRefError {
    #[error("unknown artifact tag '{0}' (expected latest, reference, prod or vN)")]
    UnknownTag(String),

    #[error("invalid artifact name '{0}'")]
    InvalidName(String),

    #[error("artifact reference '{0}' is not of the form name:tag")]
    Malformed(String),
}

/// Validate an artifact name.
///
/// Names end up as directory names in the artifact store, so path
/// separators, `..` and the tag separator are rejected.
pub fn validate_name(name: &str) -> Result<(), ArtifactRefError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', ':'])
        || name.chars().any(char::is_control);

    if bad {
        return Err(ArtifactRefError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// A `name:tag` reference to an artifact version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactRef {
    pub name: String,
    pub tag: ArtifactTag,
}

impl ArtifactRef {
    /// Create a reference, validating the name
    pub fn new(name: impl Into<String>, tag: ArtifactTag) -> Result<Self, ArtifactRefError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self { name, tag })
    }

    /// Shorthand for `name:latest`
    pub fn latest(name: impl Into<String>) -> Result<Self, ArtifactRefError> {
        Self::new(name, ArtifactTag::Latest)
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

impl FromStr for ArtifactRef {
    type Err = ArtifactRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, tag) = s
            .rsplit_once(':')
            .ok_or_else(|| ArtifactRefError::Malformed(s.to_string()))?;
        Self::new(name, tag.parse()?)
    }
}

impl TryFrom<String> for ArtifactRef {
    type Error = ArtifactRefError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ArtifactRef> for String {
    fn from(r: ArtifactRef) -> Self {
        r.to_string()
    }
}

/// What a publisher says about a new artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    /// Artifact name (e.g. "sample.csv")
    pub name: String,

    /// Artifact type (e.g. "raw_data")
    pub artifact_type: String,

    /// Human-readable description
    pub description: String,
}

impl ArtifactDescriptor {
    pub fn new(
        name: impl Into<String>,
        artifact_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            artifact_type: artifact_type.into(),
            description: description.into(),
        }
    }
}

/// A resolved, durably recorded artifact version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactHandle {
    /// Artifact name
    pub name: String,

    /// Version number (`v{version}`)
    pub version: u32,

    /// Artifact type
    pub artifact_type: String,

    /// Human-readable description
    pub description: String,

    /// Hex SHA-256 of the stored file
    pub digest: String,

    /// Size in bytes
    pub size_bytes: u64,

    /// Where the stored file lives
    pub path: PathBuf,

    /// Run group this version was published under
    pub run_group: RunGroup,

    /// When the version was published
    pub created_at: DateTime<Utc>,
}

impl ArtifactHandle {
    /// The fully pinned reference for this version
    pub fn pinned(&self) -> ArtifactRef {
        ArtifactRef {
            name: self.name.clone(),
            tag: ArtifactTag::Version(self.version),
        }
    }
}
