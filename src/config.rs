//! Server configuration
//!
//! `Settings` are fixed for the life of the process (port, shell, paths).
//! `ServerConfig` is the mutable record of the active working directory that
//! the hub owns and every service reads when it (re)starts.

use crate::platform;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Default HTTP/WebSocket port
pub const DEFAULT_PORT: u16 = 3001;

/// Default terminal geometry
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Quiet window before a burst of writes to one file is reported
pub const DEFAULT_QUIET_WINDOW_MS: u64 = 100;

/// Prefix applied to TaskMaster ids so they never collide with native tasks
pub const DEFAULT_TASK_ID_PREFIX: &str = "taskmaster";

/// Task file locations relative to the working directory, checked in order
pub fn default_task_files() -> Vec<PathBuf> {
    vec![
        PathBuf::from(".taskmaster").join("tasks").join("tasks.json"),
        PathBuf::from("tasks").join("tasks.json"),
    ]
}

/// Mutable, process-wide configuration record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub working_directory: PathBuf,
    pub watch_enabled: bool,
}

pub type SharedConfig = Arc<RwLock<ServerConfig>>;

/// Process settings, resolved once at startup
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub working_directory: PathBuf,
    pub watch_enabled: bool,
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
    pub quiet_window: Duration,
    pub task_files: Vec<PathBuf>,
    pub task_id_prefix: String,
    pub ignore_globs: Vec<String>,
    pub data_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            working_directory: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            watch_enabled: true,
            shell: platform::default_shell(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            quiet_window: Duration::from_millis(DEFAULT_QUIET_WINDOW_MS),
            task_files: default_task_files(),
            task_id_prefix: DEFAULT_TASK_ID_PREFIX.to_string(),
            ignore_globs: Vec::new(),
            data_dir: platform::config_dir().join("projects"),
        }
    }
}

/// Partial settings, as read from `~/.orbit/config.json` or the command line.
/// Every field is optional; set fields override the layer below.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SettingsOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub working_directory: Option<PathBuf>,
    pub watch_enabled: Option<bool>,
    pub shell: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub quiet_window_ms: Option<u64>,
    pub task_files: Option<Vec<PathBuf>>,
    pub task_id_prefix: Option<String>,
    pub ignore_globs: Option<Vec<String>>,
    pub data_dir: Option<PathBuf>,
}

impl Settings {
    /// Apply a layer of overrides on top of these settings
    pub fn apply(mut self, overrides: SettingsOverrides) -> Self {
        if let Some(host) = overrides.host {
            self.host = host;
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(dir) = overrides.working_directory {
            self.working_directory = dir;
        }
        if let Some(watch) = overrides.watch_enabled {
            self.watch_enabled = watch;
        }
        if let Some(shell) = overrides.shell.filter(|s| !s.trim().is_empty()) {
            self.shell = shell;
        }
        if let Some(cols) = overrides.cols.filter(|c| *c > 0) {
            self.cols = cols;
        }
        if let Some(rows) = overrides.rows.filter(|r| *r > 0) {
            self.rows = rows;
        }
        if let Some(ms) = overrides.quiet_window_ms {
            self.quiet_window = Duration::from_millis(ms);
        }
        if let Some(files) = overrides.task_files.filter(|f| !f.is_empty()) {
            self.task_files = files;
        }
        if let Some(prefix) = overrides.task_id_prefix {
            self.task_id_prefix = prefix;
        }
        if let Some(globs) = overrides.ignore_globs {
            self.ignore_globs.extend(globs);
        }
        if let Some(dir) = overrides.data_dir {
            self.data_dir = dir;
        }
        self
    }

    /// Initial mutable config derived from these settings
    pub fn initial_config(&self) -> ServerConfig {
        ServerConfig {
            working_directory: self.working_directory.clone(),
            watch_enabled: self.watch_enabled,
        }
    }
}

/// Path of the optional settings file
pub fn settings_file() -> PathBuf {
    platform::config_dir().join("config.json")
}

/// Load settings overrides from a JSON file.
///
/// A missing file is not an error; a malformed one is logged and ignored.
pub fn load_settings_file(path: &Path) -> SettingsOverrides {
    if !path.exists() {
        return SettingsOverrides::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(overrides) => overrides,
            Err(e) => {
                tracing::warn!("Ignoring malformed settings file {:?}: {}", path, e);
                SettingsOverrides::default()
            }
        },
        Err(e) => {
            tracing::warn!("Failed to read settings file {:?}: {}", path, e);
            SettingsOverrides::default()
        }
    }
}

/// Everything the hub and HTTP layer need, passed explicitly
#[derive(Clone)]
pub struct SessionContext {
    pub settings: Arc<Settings>,
    pub config: SharedConfig,
}

impl SessionContext {
    pub fn new(settings: Settings) -> Self {
        let config = Arc::new(RwLock::new(settings.initial_config()));
        Self {
            settings: Arc::new(settings),
            config,
        }
    }

    /// Snapshot of the current config
    pub async fn config(&self) -> ServerConfig {
        self.config.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.cols, 80);
        assert_eq!(settings.rows, 24);
        assert!(settings.watch_enabled);
        assert_eq!(settings.task_files.len(), 2);
        assert!(settings.task_files[0].ends_with(".taskmaster/tasks/tasks.json"));
    }

    #[test]
    fn test_overrides_layering() {
        let file = SettingsOverrides {
            port: Some(4000),
            shell: Some("/bin/zsh".to_string()),
            ignore_globs: Some(vec!["**/*.tmp".to_string()]),
            ..Default::default()
        };
        let cli = SettingsOverrides {
            port: Some(5000),
            watch_enabled: Some(false),
            shell: Some("  ".to_string()),
            ..Default::default()
        };

        let settings = Settings::default().apply(file).apply(cli);
        assert_eq!(settings.port, 5000);
        assert!(!settings.watch_enabled);
        // Blank shell does not clobber the file setting
        assert_eq!(settings.shell, "/bin/zsh");
        assert_eq!(settings.ignore_globs, vec!["**/*.tmp".to_string()]);
    }

    #[test]
    fn test_server_config_serialization() {
        let config = ServerConfig {
            working_directory: PathBuf::from("/tmp/project"),
            watch_enabled: true,
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["workingDirectory"], "/tmp/project");
        assert_eq!(json["watchEnabled"], true);
    }

    #[test]
    fn test_load_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        assert!(load_settings_file(&path).port.is_none());

        std::fs::write(&path, r#"{"port": 3999, "quiet_window_ms": 250}"#).unwrap();
        let overrides = load_settings_file(&path);
        assert_eq!(overrides.port, Some(3999));
        assert_eq!(overrides.quiet_window_ms, Some(250));

        std::fs::write(&path, "not json").unwrap();
        assert!(load_settings_file(&path).port.is_none());
    }

    #[tokio::test]
    async fn test_session_context_snapshot() {
        let settings = Settings {
            working_directory: PathBuf::from("/srv/app"),
            watch_enabled: false,
            ..Settings::default()
        };
        let ctx = SessionContext::new(settings);
        let config = ctx.config().await;
        assert_eq!(config.working_directory, PathBuf::from("/srv/app"));
        assert!(!config.watch_enabled);
    }
}
