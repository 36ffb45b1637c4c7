use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::mcp::NativeTool;

#[derive(Debug, Error)]
pub enum DeleteError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("access outside the working directory is not allowed: {0}")]
    OutsideWorkingDir(String),

    #[error("refusing to delete the working directory itself")]
    WorkingDirectory,

    #[error("file not found: '{0}'")]
    FileNotFound(String),

    #[error("directory not found: '{0}'")]
    DirectoryNotFound(String),

    #[error("'{0}' is a directory, use safe_delete_directory instead")]
    IsDirectory(String),

    #[error("'{0}' is a file, use safe_delete_file instead")]
    IsFile(String),

    #[error("directory '{0}' is not empty, use recursive=true to delete it with its contents")]
    NotEmpty(String),

    #[error("permission denied deleting '{0}'")]
    PermissionDenied(String),

    #[error("failed to delete '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Resolve `relative` inside `root` without touching the target itself.
///
/// `root` must already be canonical. The path is normalised lexically, then
/// the nearest existing ancestor is canonicalised so symlinked parents cannot
/// lead outside `root`.
pub fn resolve_in_working_dir(root: &Path, relative: &str) -> Result<PathBuf, DeleteError> {
    let trimmed = relative.trim();
    if trimmed.is_empty() || trimmed.contains('\0') {
        return Err(DeleteError::InvalidPath(relative.to_string()));
    }

    let mut normalized = PathBuf::new();
    for component in root.join(trimmed).components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(DeleteError::OutsideWorkingDir(relative.to_string()));
                }
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }

    if !normalized.starts_with(root) {
        return Err(DeleteError::OutsideWorkingDir(relative.to_string()));
    }
    if normalized == root {
        return Ok(normalized);
    }

    let mut ancestor = normalized.parent();
    while let Some(dir) = ancestor {
        if let Ok(real) = std::fs::canonicalize(dir) {
            if !real.starts_with(root) {
                return Err(DeleteError::OutsideWorkingDir(relative.to_string()));
            }
            break;
        }
        ancestor = dir.parent();
    }

    Ok(normalized)
}

fn map_io(path: &str, e: std::io::Error) -> DeleteError {
    match e.kind() {
        ErrorKind::PermissionDenied => DeleteError::PermissionDenied(path.to_string()),
        ErrorKind::DirectoryNotEmpty => DeleteError::NotEmpty(path.to_string()),
        _ => DeleteError::Io {
            path: path.to_string(),
            source: e,
        },
    }
}

fn canonical_root(working_dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::canonicalize(working_dir)
}

#[derive(Debug, Deserialize)]
struct DeleteFileArgs {
    file_path: String,
}

/// Deletes a single file inside the working directory.
#[derive(Debug, Clone)]
pub struct SafeDeleteFileTool {
    root: PathBuf,
}

impl SafeDeleteFileTool {
    pub fn new(working_dir: &Path) -> std::io::Result<Self> {
        Ok(Self {
            root: canonical_root(working_dir)?,
        })
    }

    pub async fn delete(&self, file_path: &str) -> Result<String, DeleteError> {
        let target = resolve_in_working_dir(&self.root, file_path)?;
        if target == self.root {
            return Err(DeleteError::WorkingDirectory);
        }

        let meta = match tokio::fs::symlink_metadata(&target).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(DeleteError::FileNotFound(file_path.to_string()));
            }
            Err(e) => return Err(map_io(file_path, e)),
        };
        if meta.is_dir() {
            return Err(DeleteError::IsDirectory(file_path.to_string()));
        }

        tokio::fs::remove_file(&target)
            .await
            .map_err(|e| map_io(file_path, e))?;

        tracing::info!(name: "tool.delete.file", path = %target.display(), "Deleted file");
        Ok(format!("SUCCESS: file '{file_path}' deleted"))
    }
}

#[async_trait]
impl NativeTool for SafeDeleteFileTool {
    fn name(&self) -> &str {
        "safe_delete_file"
    }

    fn description(&self) -> &str {
        "Safely delete a file inside the working directory. Takes a path relative to the working directory."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path of the file to delete, relative to the working directory"
                }
            },
            "required": ["file_path"]
        })
    }

    async fn call(&self, args: Value) -> anyhow::Result<Value> {
        let args: DeleteFileArgs = serde_json::from_value(args)?;
        Ok(Value::String(self.delete(&args.file_path).await?))
    }
}

#[derive(Debug, Deserialize)]
struct DeleteDirectoryArgs {
    dir_path: String,
    #[serde(default)]
    recursive: bool,
}

/// Deletes a directory inside the working directory, optionally with its contents.
#[derive(Debug, Clone)]
pub struct SafeDeleteDirectoryTool {
    root: PathBuf,
}

impl SafeDeleteDirectoryTool {
    pub fn new(working_dir: &Path) -> std::io::Result<Self> {
        Ok(Self {
            root: canonical_root(working_dir)?,
        })
    }

    pub async fn delete(&self, dir_path: &str, recursive: bool) -> Result<String, DeleteError> {
        let target = resolve_in_working_dir(&self.root, dir_path)?;
        if target == self.root {
            return Err(DeleteError::WorkingDirectory);
        }

        let meta = match tokio::fs::symlink_metadata(&target).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(DeleteError::DirectoryNotFound(dir_path.to_string()));
            }
            Err(e) => return Err(map_io(dir_path, e)),
        };
        if !meta.is_dir() {
            return Err(DeleteError::IsFile(dir_path.to_string()));
        }

        if recursive {
            tokio::fs::remove_dir_all(&target)
                .await
                .map_err(|e| map_io(dir_path, e))?;
            tracing::info!(name: "tool.delete.directory", path = %target.display(), recursive, "Deleted directory");
            Ok(format!(
                "SUCCESS: directory '{dir_path}' and all of its contents deleted"
            ))
        } else {
            tokio::fs::remove_dir(&target)
                .await
                .map_err(|e| map_io(dir_path, e))?;
            tracing::info!(name: "tool.delete.directory", path = %target.display(), recursive, "Deleted directory");
            Ok(format!("SUCCESS: empty directory '{dir_path}' deleted"))
        }
    }
}

#[async_trait]
impl NativeTool for SafeDeleteDirectoryTool {
    fn name(&self) -> &str {
        "safe_delete_directory"
    }

    fn description(&self) -> &str {
        "Safely delete a directory inside the working directory. Set recursive=true to delete a non-empty directory."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "dir_path": {
                    "type": "string",
                    "description": "Path of the directory to delete, relative to the working directory"
                },
                "recursive": {
                    "type": "boolean",
                    "description": "Delete the directory with all of its contents"
                }
            },
            "required": ["dir_path"]
        })
    }

    async fn call(&self, args: Value) -> anyhow::Result<Value> {
        let args: DeleteDirectoryArgs = serde_json::from_value(args)?;
        Ok(Value::String(
            self.delete(&args.dir_path, args.recursive).await?,
        ))
    }
}
