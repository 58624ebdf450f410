//! TaskMaster sync
//!
//! Finds the TaskMaster `tasks.json` under the working directory, converts it
//! into Orbit tasks and emits the full list whenever its text changes.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse tasks.json: {0}")]
    Parse(#[from] serde_json::Error),
}

/// TaskMaster ids are numbers in practice but strings show up in hand-edited files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskId {
    Number(i64),
    Text(String),
}

impl Default for TaskId {
    fn default() -> Self {
        TaskId::Text(String::new())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskId::Number(n) => write!(f, "{}", n),
            TaskId::Text(s) => f.write_str(s),
        }
    }
}

/// A task as stored by TaskMaster.
///
/// Hand-edited files put all sorts of values in these fields, so every one
/// of them reads leniently: a value of the wrong JSON type counts as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TaskMasterTask {
    #[serde(deserialize_with = "lenient_id")]
    pub id: TaskId,
    #[serde(deserialize_with = "lenient_text")]
    pub title: String,
    #[serde(deserialize_with = "lenient_string")]
    pub description: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub status: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub priority: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub details: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub test_strategy: Option<String>,
    #[serde(deserialize_with = "lenient_list")]
    pub dependencies: Vec<Value>,
    #[serde(deserialize_with = "lenient_list")]
    pub subtasks: Vec<Value>,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        _ => None,
    })
}

fn lenient_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_string(deserializer)?.unwrap_or_default())
}

fn lenient_list<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items,
        _ => Vec::new(),
    })
}

fn lenient_id<'de, D>(deserializer: D) -> Result<TaskId, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => match n.as_i64() {
            Some(n) => TaskId::Number(n),
            None => TaskId::Text(n.to_string()),
        },
        Value::String(s) => TaskId::Text(s),
        Value::Null => TaskId::default(),
        other => TaskId::Text(other.to_string()),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

/// Orbit's own task representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrbitTask {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    /// 1 (highest) to 5 (lowest)
    pub priority: u8,
    pub order_index: usize,
    pub acceptance_criteria: String,
    pub notes: String,
}

pub fn map_status(status: Option<&str>) -> TaskStatus {
    match status {
        Some("in-progress") => TaskStatus::InProgress,
        Some("done") => TaskStatus::Completed,
        _ => TaskStatus::Pending,
    }
}

pub fn map_priority(priority: Option<&str>) -> u8 {
    match priority {
        Some("high") => 1,
        Some("low") => 5,
        _ => 3,
    }
}

/// Convert one TaskMaster task at position `index` of its source list
pub fn to_orbit_task(task: &TaskMasterTask, index: usize, id_prefix: &str) -> OrbitTask {
    let mut notes = format!("TaskMaster ID: {}", task.id);
    if let Some(details) = task.details.as_deref().filter(|d| !d.is_empty()) {
        notes.push_str("\n\n");
        notes.push_str(details);
    }

    OrbitTask {
        id: format!("{}-{}", id_prefix, task.id),
        title: task.title.clone(),
        description: task.description.clone().unwrap_or_default(),
        status: map_status(task.status.as_deref()),
        priority: map_priority(task.priority.as_deref()),
        order_index: index,
        acceptance_criteria: task.test_strategy.clone().unwrap_or_default(),
        notes,
    }
}

pub fn to_orbit_tasks(tasks: &[TaskMasterTask], id_prefix: &str) -> Vec<OrbitTask> {
    tasks
        .iter()
        .enumerate()
        .map(|(index, task)| to_orbit_task(task, index, id_prefix))
        .collect()
}

/// Parse the text of a tasks file.
///
/// Accepts a bare array, `{ "tasks": [...] }`, or the tagged layout
/// `{ "master": { "tasks": [...] } }`. Any other object, or a `tasks` value
/// that is not an array, yields no tasks. Every array element becomes a task.
pub fn parse_tasks_file(content: &str) -> Result<Vec<TaskMasterTask>, SyncError> {
    let value: Value = serde_json::from_str(content)?;

    let tasks = match value {
        Value::Array(_) => value,
        Value::Object(mut map) => {
            if let Some(tasks) = map.remove("tasks") {
                tasks
            } else {
                let tag = if map.contains_key("master") {
                    map.remove("master")
                } else {
                    map.into_iter()
                        .map(|(_, v)| v)
                        .find(|v| v.get("tasks").map(|t| t.is_array()).unwrap_or(false))
                };
                match tag.and_then(|mut t| t.get_mut("tasks").map(Value::take)) {
                    Some(tasks) => tasks,
                    None => return Ok(Vec::new()),
                }
            }
        }
        other => {
            return Err(SyncError::Parse(serde::de::Error::custom(format!(
                "expected an array or object, found {}",
                json_kind(&other)
            ))))
        }
    };

    let Value::Array(items) = tasks else {
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .map(|item| serde_json::from_value(item).unwrap_or_default())
        .collect())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Events produced by the synchronizer
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    TasksUpdated(Vec<OrbitTask>),
    Error(String),
}

/// Keeps the in-app task list in step with TaskMaster's tasks.json
pub struct TaskMasterSync {
    project_path: Option<PathBuf>,
    /// Text of the last file we emitted; identical reads are suppressed
    last_content: String,
    candidates: Vec<PathBuf>,
    id_prefix: String,
    events: mpsc::UnboundedSender<SyncEvent>,
}

impl TaskMasterSync {
    /// Create a synchronizer checking `candidates` (relative paths) in order
    pub fn new(
        candidates: Vec<PathBuf>,
        id_prefix: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                project_path: None,
                last_content: String::new(),
                candidates,
                id_prefix: id_prefix.into(),
                events,
            },
            rx,
        )
    }

    pub fn set_project_path(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        tracing::info!("TaskMaster project path set to {:?}", path);
        self.project_path = Some(path);
    }

    pub fn project_path(&self) -> Option<&Path> {
        self.project_path.as_deref()
    }

    /// First candidate tasks file that exists under the project path
    pub async fn locate(&self) -> Option<PathBuf> {
        let root = self.project_path.as_ref()?;
        for candidate in &self.candidates {
            let path = root.join(candidate);
            if tokio::fs::metadata(&path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false)
            {
                return Some(path);
            }
        }
        None
    }

    /// Read the tasks file if there is one and emit the task list if it changed
    pub async fn check_and_sync(&mut self) {
        let Some(path) = self.locate().await else {
            tracing::debug!("No TaskMaster tasks file found");
            return;
        };

        match self.read_and_convert(&path).await {
            Ok(Some(tasks)) => {
                tracing::info!("Broadcasting {} TaskMaster tasks", tasks.len());
                let _ = self.events.send(SyncEvent::TasksUpdated(tasks));
            }
            Ok(None) => {
                tracing::debug!("TaskMaster tasks file unchanged");
            }
            Err(e) => {
                tracing::warn!("TaskMaster sync failed: {}", e);
                let _ = self.events.send(SyncEvent::Error(e.to_string()));
            }
        }
    }

    async fn read_and_convert(&mut self, path: &Path) -> Result<Option<Vec<OrbitTask>>, SyncError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| SyncError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        if content == self.last_content {
            return Ok(None);
        }

        let tasks = parse_tasks_file(&content)?;
        // Only remember text that parsed, so a fixed file is picked up again
        self.last_content = content;
        Ok(Some(to_orbit_tasks(&tasks, &self.id_prefix)))
    }

    /// Does `relative_path` look like one of the tasks files?
    pub fn is_task_file(&self, relative_path: &str) -> bool {
        let normalized = relative_path.replace('\\', "/");
        let path = Path::new(&normalized);
        let Some(file_name) = path.file_name() else {
            return false;
        };
        let first = first_component(path);

        self.candidates.iter().any(|candidate| {
            candidate.file_name() == Some(file_name) && first_component(candidate) == first
        })
    }

    /// Sync if a watcher-reported path is a tasks file. Returns whether it was.
    pub async fn handle_file_change(&mut self, relative_path: &str) -> bool {
        if !self.is_task_file(relative_path) {
            return false;
        }
        tracing::info!("Detected TaskMaster change: {}", relative_path);
        self.check_and_sync().await;
        true
    }
}

fn first_component(path: &Path) -> Option<&std::ffi::OsStr> {
    path.components().find_map(|c| match c {
        Component::Normal(name) => Some(name),
        _ => None,
    })
}
