//! Filesystem artifact store.
//!
//! Layout:
//!
//! ```text
//! <root>/<project>/<name>/manifest.json
//! <root>/<project>/<name>/v0/<file>
//! <root>/<project>/<name>/v1/<file>
//! ```
//!
//! The manifest lists every version and maps tags (`latest`, `reference`,
//! `prod`) to version numbers. Writers hold an exclusive lock on
//! `<name>/.lock`; the manifest is replaced atomically (temp file + rename)
//! after the version file has been synced, so a reader never sees a tag
//! pointing at a half-written version.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{Tracker, TrackingError};
use crate::config::STORE_ENV;
use crate::domain::artifact::validate_name;
use crate::domain::{ArtifactDescriptor, ArtifactHandle, ArtifactRef, ArtifactTag, RunGroup};

const MANIFEST_FILE: &str = "manifest.json";
const LOCK_FILE: &str = ".lock";

/// One published version, as recorded in the manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VersionRecord {
    version: u32,
    artifact_type: String,
    description: String,
    file_name: String,
    digest: String,
    size_bytes: u64,
    run_group: RunGroup,
    created_at: DateTime<Utc>,
}

/// Per-artifact manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Manifest {
    name: String,
    versions: Vec<VersionRecord>,
    /// tag -> version
    aliases: BTreeMap<String, u32>,
}

impl Manifest {
    fn record(&self, version: u32) -> Option<&VersionRecord> {
        self.versions.iter().find(|v| v.version == version)
    }

    fn next_version(&self) -> u32 {
        self.versions.last().map(|v| v.version + 1).unwrap_or(0)
    }
}

/// Artifact store rooted at a local directory
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    /// Create a store rooted at `root` (created lazily on first publish)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn artifact_dir(&self, project: &str, name: &str) -> Result<PathBuf, TrackingError> {
        validate_name(project).map_err(|e| TrackingError::Invalid(e.to_string()))?;
        validate_name(name).map_err(|e| TrackingError::Invalid(e.to_string()))?;
        Ok(self.root.join(project).join(name))
    }

    /// Every version of an artifact, oldest first, with the tags pointing at it
    pub async fn versions(
        &self,
        project: &str,
        name: &str,
    ) -> Result<Vec<(ArtifactHandle, Vec<ArtifactTag>)>, TrackingError> {
        let dir = self.artifact_dir(project, name)?;
        let project = project.to_string();
        let name = name.to_string();

        blocking(move || {
            let manifest = load_manifest(&dir)?.ok_or_else(|| TrackingError::UnknownArtifact {
                project,
                name,
            })?;

            let listed: Vec<(ArtifactHandle, Vec<ArtifactTag>)> = manifest
                .versions
                .iter()
                .map(|record| {
                    let tags: Vec<ArtifactTag> = manifest
                        .aliases
                        .iter()
                        .filter(|(_, v)| **v == record.version)
                        .filter_map(|(tag, _)| tag.parse().ok())
                        .collect();
                    (to_handle(&dir, &manifest.name, record), tags)
                })
                .collect();
            Ok(listed)
        })
        .await
    }
}

#[async_trait]
impl Tracker for LocalArtifactStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn publish(
        &self,
        group: &RunGroup,
        descriptor: &ArtifactDescriptor,
        source: &Path,
    ) -> Result<ArtifactHandle, TrackingError> {
        let dir = self.artifact_dir(&group.project, &descriptor.name)?;
        let group = group.clone();
        let descriptor = descriptor.clone();
        let source = source.to_path_buf();

        let handle = blocking(move || publish_blocking(&dir, &group, &descriptor, &source)).await?;

        info!(
            artifact = %handle.name,
            version = handle.version,
            digest = %handle.digest,
            "Artifact published"
        );
        Ok(handle)
    }

    async fn resolve(
        &self,
        group: &RunGroup,
        reference: &ArtifactRef,
    ) -> Result<ArtifactHandle, TrackingError> {
        let dir = self.artifact_dir(&group.project, &reference.name)?;
        let project = group.project.clone();
        let reference = reference.clone();

        blocking(move || {
            let manifest = {
                let _lock = lock(&dir, false)?;
                load_manifest(&dir)?
            }
            .ok_or_else(|| TrackingError::UnknownArtifact {
                project,
                name: reference.name.clone(),
            })?;

            let version = match reference.tag {
                ArtifactTag::Version(v) => Some(v),
                tag => manifest.aliases.get(&tag.to_string()).copied(),
            };

            let record = version
                .and_then(|v| manifest.record(v))
                .ok_or_else(|| TrackingError::UnknownTag {
                    name: reference.name.clone(),
                    tag: reference.tag,
                })?;

            debug!(reference = %reference, version = record.version, "Artifact resolved");
            Ok(to_handle(&dir, &manifest.name, record))
        })
        .await
    }

    async fn promote(
        &self,
        project: &str,
        name: &str,
        version: u32,
        tag: ArtifactTag,
    ) -> Result<ArtifactHandle, TrackingError> {
        if !tag.is_promotable() {
            return Err(TrackingError::NotPromotable(tag));
        }

        let dir = self.artifact_dir(project, name)?;
        let project = project.to_string();
        let name = name.to_string();

        blocking(move || {
            let _lock = lock(&dir, true)?;
            let mut manifest = load_manifest(&dir)?.ok_or_else(|| TrackingError::UnknownArtifact {
                project,
                name: name.clone(),
            })?;

            let handle = manifest
                .record(version)
                .map(|record| to_handle(&dir, &manifest.name, record))
                .ok_or_else(|| TrackingError::UnknownTag {
                    name: name.clone(),
                    tag: ArtifactTag::Version(version),
                })?;

            manifest.aliases.insert(tag.to_string(), version);
            write_manifest(&dir, &manifest)?;

            info!(artifact = %name, version, %tag, "Artifact promoted");
            Ok(handle)
        })
        .await
    }

    fn client_env(&self) -> Vec<(String, String)> {
        vec![(STORE_ENV.to_string(), self.root.display().to_string())]
    }
}

/// Run filesystem work off the async runtime
async fn blocking<T, F>(f: F) -> Result<T, TrackingError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, TrackingError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TrackingError::Io(std::io::Error::other(e)))?
}

fn publish_blocking(
    dir: &Path,
    group: &RunGroup,
    descriptor: &ArtifactDescriptor,
    source: &Path,
) -> Result<ArtifactHandle, TrackingError> {
    let source_err = |e: std::io::Error| TrackingError::Source {
        path: source.display().to_string(),
        source: e,
    };

    let metadata = fs::metadata(source).map_err(source_err)?;
    if !metadata.is_file() {
        return Err(TrackingError::Source {
            path: source.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
        });
    }

    let file_name = source
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TrackingError::Invalid(format!("bad file name: {}", source.display())))?
        .to_string();

    fs::create_dir_all(dir)?;
    let _lock = lock(dir, true)?;

    let mut manifest = load_manifest(dir)?.unwrap_or_else(|| Manifest {
        name: descriptor.name.clone(),
        ..Default::default()
    });

    let version = manifest.next_version();
    let version_dir = dir.join(format!("v{}", version));
    fs::create_dir_all(&version_dir)?;

    let (digest, size_bytes) =
        copy_with_digest(source, &version_dir.join(&file_name)).map_err(source_err)?;

    let record = VersionRecord {
        version,
        artifact_type: descriptor.artifact_type.clone(),
        description: descriptor.description.clone(),
        file_name,
        digest,
        size_bytes,
        run_group: group.clone(),
        created_at: Utc::now(),
    };

    manifest.versions.push(record.clone());
    manifest
        .aliases
        .insert(ArtifactTag::Latest.to_string(), version);
    write_manifest(dir, &manifest)?;

    Ok(to_handle(dir, &manifest.name, &record))
}

/// Copy `from` to `to`, syncing the copy, and return (sha256 hex, bytes)
fn copy_with_digest(from: &Path, to: &Path) -> std::io::Result<(String, u64)> {
    let mut reader = BufReader::new(File::open(from)?);
    let out = File::create(to)?;
    let mut writer = BufWriter::new(&out);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }

    writer.flush()?;
    drop(writer);
    out.sync_all()?;

    Ok((hex::encode(hasher.finalize()), total))
}

struct LockGuard(File);

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

fn lock(dir: &Path, exclusive: bool) -> Result<Option<LockGuard>, TrackingError> {
    if !dir.exists() {
        return Ok(None);
    }

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(dir.join(LOCK_FILE))?;

    if exclusive {
        FileExt::lock_exclusive(&file)?;
    } else {
        FileExt::lock_shared(&file)?;
    }
    Ok(Some(LockGuard(file)))
}

fn load_manifest(dir: &Path) -> Result<Option<Manifest>, TrackingError> {
    let path = dir.join(MANIFEST_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

fn write_manifest(dir: &Path, manifest: &Manifest) -> Result<(), TrackingError> {
    let tmp = dir.join(format!("{}.tmp", MANIFEST_FILE));
    {
        let mut file = File::create(&tmp)?;
        file.write_all(serde_json::to_string_pretty(manifest)?.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dir.join(MANIFEST_FILE))?;
    Ok(())
}

fn to_handle(dir: &Path, name: &str, record: &VersionRecord) -> ArtifactHandle {
    ArtifactHandle {
        name: name.to_string(),
        version: record.version,
        artifact_type: record.artifact_type.clone(),
        description: record.description.clone(),
        digest: record.digest.clone(),
        size_bytes: record.size_bytes,
        path: dir
            .join(format!("v{}", record.version))
            .join(&record.file_name),
        run_group: record.run_group.clone(),
        created_at: record.created_at,
    }
}
