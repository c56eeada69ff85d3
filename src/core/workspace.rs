//! Scoped workspace for one orchestrator invocation.
//!
//! Transient files (serialized stage configuration) go here. The directory
//! is removed when the workspace is closed or dropped, which covers normal
//! completion, stage failure and a cancelled run future alike.

use std::io;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use serde_json::ser::Formatter;
use tempfile::TempDir;
use tracing::debug;

use super::error::OrchestratorError;

/// Temporary directory bound to a single run
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create a fresh workspace under the system temp directory
    pub fn create() -> Result<Self, OrchestratorError> {
        let dir = tempfile::Builder::new()
            .prefix("mlpipe-")
            .tempdir()
            .map_err(OrchestratorError::Workspace)?;

        debug!(path = %dir.path().display(), "Workspace created");
        Ok(Self { dir })
    }

    /// Absolute path of the workspace
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `value` as JSON to `file_name` inside the workspace and return
    /// the file's absolute path.
    ///
    /// `file_name` must be a single plain path component.
    pub fn materialize_json<T: Serialize + ?Sized>(
        &self,
        file_name: &str,
        value: &T,
    ) -> Result<PathBuf, OrchestratorError> {
        let mut components = Path::new(file_name).components();
        let confined = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !confined {
            return Err(OrchestratorError::Workspace(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("'{}' is not a plain file name", file_name),
            )));
        }

        let mut serializer = serde_json::Serializer::with_formatter(Vec::new(), SpacedFormatter);
        value
            .serialize(&mut serializer)
            .map_err(|e| OrchestratorError::Workspace(e.into()))?;
        let json = serializer.into_inner();
        let path = self.dir.path().join(file_name);
        std::fs::write(&path, json).map_err(OrchestratorError::Workspace)?;

        debug!(path = %path.display(), "Materialized workspace file");
        Ok(path)
    }

    /// Remove the workspace, reporting cleanup errors
    pub fn close(self) -> Result<(), OrchestratorError> {
        let path = self.dir.path().to_path_buf();
        self.dir.close().map_err(OrchestratorError::Workspace)?;
        debug!(path = %path.display(), "Workspace removed");
        Ok(())
    }
}

/// Single-line JSON with `", "` and `": "` separators, the layout stage
/// scripts get from Python's `json.dump`
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}
