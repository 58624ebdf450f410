//! File operations requested by clients, confined to the working directory

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("Path is empty")]
    EmptyPath,
    #[error("Path must be relative to the working directory: {0}")]
    Absolute(String),
    #[error("Path escapes the working directory: {0}")]
    Escapes(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Resolve a client-supplied relative path under `root`.
///
/// Only normal components (and `.`) are accepted.
pub fn resolve_within(root: &Path, relative: &str) -> Result<PathBuf, WorkspaceError> {
    let trimmed = relative.trim();
    if trimmed.is_empty() {
        return Err(WorkspaceError::EmptyPath);
    }

    let normalized = trimmed.replace('\\', "/");
    let candidate = Path::new(&normalized);
    let mut resolved = root.to_path_buf();

    for component in candidate.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err(WorkspaceError::Escapes(relative.to_string())),
            Component::RootDir | Component::Prefix(_) => {
                return Err(WorkspaceError::Absolute(relative.to_string()))
            }
        }
    }

    if resolved == root {
        return Err(WorkspaceError::EmptyPath);
    }
    Ok(resolved)
}

/// Create a directory (and any missing parents) under `root`
pub async fn create_dir(root: &Path, relative: &str) -> Result<PathBuf, WorkspaceError> {
    let path = resolve_within(root, relative)?;
    tokio::fs::create_dir_all(&path).await?;
    tracing::info!("Created directory {:?}", path);
    Ok(path)
}

/// Write `content` to a file under `root`, creating parent directories
pub async fn write_file(root: &Path, relative: &str, content: &str) -> Result<PathBuf, WorkspaceError> {
    let path = resolve_within(root, relative)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, content).await?;
    tracing::info!("Wrote {} bytes to {:?}", content.len(), path);
    Ok(path)
}
