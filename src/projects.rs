//! Project persistence
//!
//! One pretty-printed JSON document per project under the data directory.
//! Last write wins; there is no locking or history.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid project id: {0:?}")]
    InvalidId(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Project metadata record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMeta {
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub current_stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copilot_instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_complete: Option<bool>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

/// Everything the UI saves for a project. The stage blobs are opaque here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectState {
    pub project: ProjectMeta,
    #[serde(default)]
    pub vision: Option<Value>,
    #[serde(default)]
    pub user_profile: Option<Value>,
    #[serde(default)]
    pub success_metrics: Option<Value>,
    #[serde(default)]
    pub prd: Option<Value>,
    #[serde(default)]
    pub tasks: Vec<Value>,
    #[serde(default)]
    pub project_config: Option<Value>,
    #[serde(default)]
    pub prd_features: Vec<Value>,
    #[serde(default)]
    pub research_apps: Vec<Value>,
    #[serde(default)]
    pub research_synthesis: Vec<Value>,
    #[serde(default)]
    pub saved_at: String,
    #[serde(default)]
    pub version: String,
}

/// Ids become file names, so keep them to a safe alphabet
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// JSON-file project store
#[derive(Debug, Clone)]
pub struct ProjectStore {
    dir: PathBuf,
}

impl ProjectStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_id(id) {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    /// Save a project, replacing any previous document with the same id
    pub fn save(&self, state: &ProjectState) -> Result<PathBuf, StoreError> {
        let path = self.path_for(&state.project.id)?;
        fs::create_dir_all(&self.dir)?;
        let data = serde_json::to_string_pretty(state)?;
        fs::write(&path, data)?;
        tracing::info!("Saved project {}", state.project.id);
        Ok(path)
    }

    /// Load a project. Missing and unreadable documents are both `None`.
    pub fn load(&self, id: &str) -> Result<Option<ProjectState>, StoreError> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Ok(None);
        }

        let parsed = fs::read_to_string(&path)
            .map_err(StoreError::from)
            .and_then(|data| serde_json::from_str(&data).map_err(StoreError::from));
        match parsed {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                tracing::error!("Error loading project {}: {}", id, e);
                Ok(None)
            }
        }
    }

    /// Ids of all stored projects, sorted. Files whose stem is not a valid id
    /// could never be loaded, so they are left out.
    pub fn list(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::error!("Error listing projects: {}", e);
                }
                return Vec::new();
            }
        };

        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    return None;
                }
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .filter(|s| is_valid_id(s))
                    .map(|s| s.to_string())
            })
            .collect();
        ids.sort();
        ids
    }
}
