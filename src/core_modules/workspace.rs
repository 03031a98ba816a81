// THEORY:
// The `workspace` module owns every byte a request writes to disk. A `Workspace` is a
// request-scoped temporary directory holding the materialized inputs and any
// intermediate artifacts, plus a pointer to one result slot that lives *outside* that
// directory so it survives cleanup.
//
// Key architectural principles:
// 1.  **Scoped Acquisition**: A `Workspace` is created at request start and consumed by
//     `cleanup()`. Because `cleanup` takes `self`, it cannot run twice; because `Drop`
//     falls back to deleting the directory, it cannot be skipped either, not even when
//     the request unwinds from a panic.
// 2.  **Everything Is Local**: Inputs arrive as opaque references (files elsewhere on
//     disk, or content handles already held in memory). `resolve` copies each one into
//     the workspace so later stages only ever see plain local files that nobody else
//     can change or delete underneath them.
// 3.  **Results Escape**: `create_result_slot` hands out a fresh path under the
//     configured result directory. The workspace never deletes it.

use crate::config::{ResultFormat, StitchConfig};
use crate::error::StitchError;
use log::{debug, warn};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const REQUESTS_DIR: &str = "requests";

/// An opaque, resolvable reference to one input image.
#[derive(Clone, PartialEq, Eq)]
pub enum ImageRef {
    /// A file that already exists on a local or mounted filesystem.
    Path(PathBuf),
    /// Content already fetched into memory, e.g. from a content provider or a socket.
    Memory { name: String, bytes: Arc<[u8]> },
}

impl ImageRef {
    pub fn memory(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        ImageRef::Memory {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    /// Name used in logs and error messages.
    pub fn name(&self) -> String {
        match self {
            ImageRef::Path(path) => path.display().to_string(),
            ImageRef::Memory { name, .. } => name.clone(),
        }
    }
}

impl fmt::Debug for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRef::Path(path) => f.debug_tuple("Path").field(path).finish(),
            ImageRef::Memory { name, bytes } => f
                .debug_struct("Memory")
                .field("name", name)
                .field("len", &bytes.len())
                .finish(),
        }
    }
}

impl From<PathBuf> for ImageRef {
    fn from(path: PathBuf) -> Self {
        ImageRef::Path(path)
    }
}

impl From<&Path> for ImageRef {
    fn from(path: &Path) -> Self {
        ImageRef::Path(path.to_path_buf())
    }
}

/// An input copied into the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInput {
    /// Name of the original reference.
    pub reference: String,
    /// The materialized copy inside the workspace.
    pub path: PathBuf,
}

/// Creates request workspaces under one root directory.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    requests_dir: PathBuf,
    result_dir: PathBuf,
    result_format: ResultFormat,
}

impl WorkspaceManager {
    pub fn new(config: &StitchConfig) -> Self {
        Self {
            requests_dir: config.workspace_root.join(REQUESTS_DIR),
            result_dir: config.result_dir.clone(),
            result_format: config.result_format,
        }
    }

    /// Allocates a fresh, empty workspace for request `request_id`.
    pub fn create(&self, request_id: u64) -> Result<Workspace, StitchError> {
        fs::create_dir_all(&self.requests_dir).map_err(|e| {
            StitchError::workspace(
                format!("failed to create workspace root {:?}", self.requests_dir),
                e,
            )
        })?;

        let dir = tempfile::Builder::new()
            .prefix(&format!("request-{request_id}-"))
            .tempdir_in(&self.requests_dir)
            .map_err(|e| StitchError::workspace("failed to create request workspace", e))?;
        debug!("Created workspace {:?}", dir.path());

        Ok(Workspace {
            dir: Some(dir),
            inputs: Vec::new(),
            result_dir: self.result_dir.clone(),
            result_format: self.result_format,
        })
    }

    /// Every file or directory currently left under the workspace root.
    /// Zero whenever no request is running.
    pub fn leftover_entries(&self) -> Vec<PathBuf> {
        match fs::read_dir(&self.requests_dir) {
            Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn result_dir(&self) -> &Path {
        &self.result_dir
    }
}

/// The temporary files of one request, plus its result slot.
pub struct Workspace {
    /// `None` only after cleanup has started.
    dir: Option<TempDir>,
    inputs: Vec<LocalInput>,
    result_dir: PathBuf,
    result_format: ResultFormat,
}

impl Workspace {
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(|d| d.path())
    }

    fn dir_path(&self) -> Result<&Path, StitchError> {
        self.path().ok_or_else(|| StitchError::unexpected("workspace used after cleanup"))
    }

    /// Copies every reference into the workspace, preserving order and duplicates.
    /// Fails on the first reference that cannot be read.
    pub fn resolve(&mut self, references: &[ImageRef]) -> Result<Vec<LocalInput>, StitchError> {
        let dir = self.dir_path()?.to_path_buf();
        let mut resolved = Vec::with_capacity(references.len());

        for (index, reference) in references.iter().enumerate() {
            let target = dir.join(format!("input-{index:03}"));
            let name = reference.name();

            match reference {
                ImageRef::Path(source) => {
                    fs::copy(source, &target).map_err(|e| {
                        StitchError::workspace(format!("failed to read input {name}"), e)
                    })?;
                }
                ImageRef::Memory { bytes, .. } => {
                    fs::write(&target, bytes).map_err(|e| {
                        StitchError::workspace(format!("failed to materialize input {name}"), e)
                    })?;
                }
            }

            let input = LocalInput {
                reference: name,
                path: target,
            };
            self.inputs.push(input.clone());
            resolved.push(input);
        }

        Ok(resolved)
    }

    /// A path inside the workspace for an intermediate artifact. Removed by cleanup.
    pub fn scratch_path(&self, name: &str) -> Result<PathBuf, StitchError> {
        Ok(self.dir_path()?.join(name))
    }

    /// Allocates the location the composite will be written to.
    pub fn create_result_slot(&self) -> Result<PathBuf, StitchError> {
        fs::create_dir_all(&self.result_dir).map_err(|e| {
            StitchError::workspace(
                format!("failed to create result directory {:?}", self.result_dir),
                e,
            )
        })?;

        let name = format!(
            "result_{}.{}",
            uuid::Uuid::new_v4().simple(),
            self.result_format.extension()
        );
        Ok(self.result_dir.join(name))
    }

    pub fn result_format(&self) -> ResultFormat {
        self.result_format
    }

    pub fn inputs(&self) -> &[LocalInput] {
        &self.inputs
    }

    /// Deletes every temporary file of the request.
    pub fn cleanup(mut self) -> Result<(), StitchError> {
        match self.dir.take() {
            Some(dir) => {
                let path = dir.path().to_path_buf();
                dir.close().map_err(|e| {
                    StitchError::workspace(format!("failed to clean up workspace {path:?}"), e)
                })?;
                debug!("Cleaned up workspace {path:?}");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        // Reached only when `cleanup` was skipped, e.g. by a panic mid-request.
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!("Failed to remove abandoned workspace {path:?}: {e}");
            } else {
                warn!("Removed abandoned workspace {path:?}");
            }
        }
    }
}
