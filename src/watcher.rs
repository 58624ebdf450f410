//! Working directory watcher
//!
//! Watches the working directory recursively and reports coalesced
//! add/change/remove events relative to the watched root. Raw notify events
//! are debounced per path: each event pushes that path's deadline out by the
//! quiet window and the merged event is emitted once the deadline passes.

use crate::platform;
use crate::protocol::FileEventKind;
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Cannot watch {0}: not a directory")]
    NotADirectory(PathBuf),
    #[error("Invalid ignore pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("File watcher error: {0}")]
    Notify(#[from] notify::Error),
}

/// Directories whose contents never produce events
const IGNORED_DIRS: &[&str] = &[".git", "node_modules", "dist", "build", "target"];

/// Lockfiles and OS metadata
const IGNORED_FILES: &[&str] = &[
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "Cargo.lock",
    ".DS_Store",
    "Thumbs.db",
];

const IGNORED_EXTENSIONS: &[&str] = &["log"];

/// Built-in ignore set plus optional user globs
#[derive(Debug, Default)]
pub struct IgnoreRules {
    extra: Vec<glob::Pattern>,
}

impl IgnoreRules {
    pub fn new(extra_globs: &[String]) -> Result<Self, WatchError> {
        let extra = extra_globs
            .iter()
            .map(|pattern| {
                glob::Pattern::new(pattern).map_err(|source| WatchError::Pattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { extra })
    }

    /// Is this path (relative to the watched root) ignored?
    pub fn is_ignored(&self, relative: &Path) -> bool {
        let names: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect();
        let Some((file_name, parents)) = names.split_last() else {
            return false;
        };

        if parents.iter().any(|p| IGNORED_DIRS.contains(&p.as_ref())) {
            return true;
        }
        if IGNORED_FILES.contains(&file_name.as_ref()) {
            return true;
        }
        if let Some(ext) = relative.extension().and_then(|e| e.to_str()) {
            if IGNORED_EXTENSIONS.contains(&ext) {
                return true;
            }
        }

        if self.extra.is_empty() {
            return false;
        }
        let joined = names.join("/");
        self.extra.iter().any(|p| p.matches(&joined))
    }
}

/// Events produced by the watcher
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Changed {
        generation: u64,
        kind: FileEventKind,
        path: String,
    },
    Error {
        generation: u64,
        message: String,
    },
}

impl WatchEvent {
    pub fn generation(&self) -> u64 {
        match self {
            WatchEvent::Changed { generation, .. } | WatchEvent::Error { generation, .. } => {
                *generation
            }
        }
    }
}

/// Combine a pending event for a path with a newer one.
/// `None` means the two cancel out (created and removed inside the window).
pub fn merge_kinds(previous: FileEventKind, next: FileEventKind) -> Option<FileEventKind> {
    use FileEventKind::*;
    match (previous, next) {
        (Add, Change) => Some(Add),
        (Add, Remove) => None,
        (Remove, Add) | (Remove, Change) => Some(Change),
        (_, next) => Some(next),
    }
}

/// Translate a raw notify event into per-path change kinds.
/// Access and metadata-only events, and folder events, are dropped.
pub fn classify(event: &Event) -> Vec<(PathBuf, FileEventKind)> {
    let each = |kind: FileEventKind| {
        event
            .paths
            .iter()
            .map(|p| (p.clone(), kind))
            .collect::<Vec<_>>()
    };

    match &event.kind {
        EventKind::Create(CreateKind::Folder) => Vec::new(),
        EventKind::Create(_) => each(FileEventKind::Add),
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => each(FileEventKind::Remove),
            RenameMode::To => each(FileEventKind::Add),
            RenameMode::Both if event.paths.len() == 2 => vec![
                (event.paths[0].clone(), FileEventKind::Remove),
                (event.paths[1].clone(), FileEventKind::Add),
            ],
            _ => event
                .paths
                .iter()
                .map(|p| {
                    let kind = if p.exists() {
                        FileEventKind::Add
                    } else {
                        FileEventKind::Remove
                    };
                    (p.clone(), kind)
                })
                .collect(),
        },
        EventKind::Modify(_) => each(FileEventKind::Change),
        EventKind::Remove(RemoveKind::Folder) => Vec::new(),
        EventKind::Remove(_) => each(FileEventKind::Remove),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

struct Pending {
    kind: FileEventKind,
    deadline: Instant,
}

struct WatchHandle {
    generation: u64,
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The single working-directory watcher
pub struct FileWatcher {
    handle: Option<WatchHandle>,
    watch_path: Option<PathBuf>,
    rules: Arc<IgnoreRules>,
    quiet_window: Duration,
    generation: u64,
    events: mpsc::UnboundedSender<WatchEvent>,
}

impl FileWatcher {
    pub fn new(
        rules: IgnoreRules,
        quiet_window: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<WatchEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                handle: None,
                watch_path: None,
                rules: Arc::new(rules),
                quiet_window,
                generation: 0,
                events,
            },
            rx,
        )
    }

    pub fn is_watching(&self) -> bool {
        self.handle.is_some()
    }

    pub fn watch_path(&self) -> Option<&Path> {
        self.watch_path.as_deref()
    }

    /// Watch `path` recursively, replacing any previous watch.
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, path: &Path) -> Result<(), WatchError> {
        if self.handle.is_some() {
            self.stop();
        }

        let root = std::fs::canonicalize(path)
            .ok()
            .filter(|p| p.is_dir())
            .ok_or_else(|| WatchError::NotADirectory(path.to_path_buf()))?;

        self.generation += 1;
        let generation = self.generation;

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        let task = tokio::spawn(debounce_loop(
            root.clone(),
            self.rules.clone(),
            self.quiet_window,
            generation,
            raw_rx,
            self.events.clone(),
        ));

        tracing::info!("Watching {:?} for changes", root);
        self.watch_path = Some(path.to_path_buf());
        self.handle = Some(WatchHandle {
            generation,
            _watcher: watcher,
            task,
        });
        Ok(())
    }

    /// Release the watch. Idempotent.
    pub fn stop(&mut self) {
        if self.handle.take().is_some() {
            tracing::info!("Stopped watching {:?}", self.watch_path);
        }
        self.watch_path = None;
    }

    /// Is an event from the current watch?
    pub fn accepts(&self, event: &WatchEvent) -> bool {
        self.handle
            .as_ref()
            .map(|h| h.generation == event.generation())
            .unwrap_or(false)
    }
}

async fn debounce_loop(
    root: PathBuf,
    rules: Arc<IgnoreRules>,
    quiet_window: Duration,
    generation: u64,
    mut raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    events: mpsc::UnboundedSender<WatchEvent>,
) {
    let mut pending: HashMap<PathBuf, Pending> = HashMap::new();

    loop {
        let next_deadline = pending.values().map(|p| p.deadline).min();
        let sleep_until = next_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            raw = raw_rx.recv() => match raw {
                Some(Ok(event)) => {
                    let deadline = Instant::now() + quiet_window;
                    for (path, kind) in classify(&event) {
                        let Ok(relative) = path.strip_prefix(&root) else {
                            continue;
                        };
                        if relative.as_os_str().is_empty() || rules.is_ignored(relative) {
                            continue;
                        }
                        record(&mut pending, path, kind, deadline);
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!("File watcher error: {}", e);
                    let _ = events.send(WatchEvent::Error {
                        generation,
                        message: format!("File watcher error: {}", e),
                    });
                }
                None => break,
            },
            _ = tokio::time::sleep_until(sleep_until), if next_deadline.is_some() => {
                flush_due(&root, &mut pending, generation, &events).await;
            }
        }
    }
}

fn record(pending: &mut HashMap<PathBuf, Pending>, path: PathBuf, kind: FileEventKind, deadline: Instant) {
    match pending.remove(&path) {
        Some(previous) => {
            if let Some(kind) = merge_kinds(previous.kind, kind) {
                pending.insert(path, Pending { kind, deadline });
            }
        }
        None => {
            pending.insert(path, Pending { kind, deadline });
        }
    }
}

async fn flush_due(
    root: &Path,
    pending: &mut HashMap<PathBuf, Pending>,
    generation: u64,
    events: &mpsc::UnboundedSender<WatchEvent>,
) {
    let now = Instant::now();
    let due: Vec<PathBuf> = pending
        .iter()
        .filter(|(_, p)| p.deadline <= now)
        .map(|(path, _)| path.clone())
        .collect();

    for path in due {
        let Some(Pending { kind, .. }) = pending.remove(&path) else {
            continue;
        };

        if kind != FileEventKind::Remove {
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_dir() => continue,
                Ok(_) => {}
                // Gone again before the window closed
                Err(_) => continue,
            }
        }

        let relative = platform::relative_display(root, &path);
        tracing::debug!("File {:?}: {}", kind, relative);
        let _ = events.send(WatchEvent::Changed {
            generation,
            kind,
            path: relative,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_ignores() {
        let rules = IgnoreRules::default();
        assert!(rules.is_ignored(Path::new(".git/HEAD")));
        assert!(rules.is_ignored(Path::new("web/node_modules/react/index.js")));
        assert!(rules.is_ignored(Path::new("dist/bundle.js")));
        assert!(rules.is_ignored(Path::new("packages/app/build/out.css")));
        assert!(rules.is_ignored(Path::new("server.log")));
        assert!(rules.is_ignored(Path::new("logs/debug.log")));
        assert!(rules.is_ignored(Path::new("package-lock.json")));
        assert!(rules.is_ignored(Path::new("sub/.DS_Store")));

        assert!(!rules.is_ignored(Path::new("src/index.ts")));
        assert!(!rules.is_ignored(Path::new(".taskmaster/tasks/tasks.json")));
        assert!(!rules.is_ignored(Path::new("scripts/build")));
        assert!(!rules.is_ignored(Path::new("")));
    }

    #[test]
    fn test_extra_ignore_globs() {
        let rules = IgnoreRules::new(&["**/*.tmp".to_string(), "coverage/**".to_string()]).unwrap();
        assert!(rules.is_ignored(Path::new("a/b/c.tmp")));
        assert!(rules.is_ignored(Path::new("coverage/lcov.info")));
        assert!(!rules.is_ignored(Path::new("src/lib.rs")));

        assert!(IgnoreRules::new(&["[".to_string()]).is_err());
    }

    #[test]
    fn test_merge_kinds() {
        use FileEventKind::*;
        assert_eq!(merge_kinds(Add, Change), Some(Add));
        assert_eq!(merge_kinds(Change, Change), Some(Change));
        assert_eq!(merge_kinds(Add, Remove), None);
        assert_eq!(merge_kinds(Remove, Add), Some(Change));
        assert_eq!(merge_kinds(Change, Remove), Some(Remove));
    }

    #[test]
    fn test_classify() {
        let path = PathBuf::from("/w/a.txt");
        let create = Event::new(EventKind::Create(CreateKind::File)).add_path(path.clone());
        assert_eq!(classify(&create), vec![(path.clone(), FileEventKind::Add)]);

        let write = Event::new(EventKind::Modify(ModifyKind::Data(
            notify::event::DataChange::Content,
        )))
        .add_path(path.clone());
        assert_eq!(classify(&write), vec![(path.clone(), FileEventKind::Change)]);

        let rename = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(path.clone())
            .add_path(PathBuf::from("/w/b.txt"));
        assert_eq!(
            classify(&rename),
            vec![
                (path.clone(), FileEventKind::Remove),
                (PathBuf::from("/w/b.txt"), FileEventKind::Add)
            ]
        );

        let folder = Event::new(EventKind::Create(CreateKind::Folder)).add_path(path.clone());
        assert!(classify(&folder).is_empty());

        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any)).add_path(path);
        assert!(classify(&access).is_empty());
    }

    async fn next_change(rx: &mut mpsc::UnboundedReceiver<WatchEvent>, within: Duration) -> Option<(FileEventKind, String)> {
        match tokio::time::timeout(within, rx.recv()).await {
            Ok(Some(WatchEvent::Changed { kind, path, .. })) => Some((kind, path)),
            Ok(Some(WatchEvent::Error { message, .. })) => panic!("watch error: {}", message),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_burst_of_writes_coalesces() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("existing.txt"), "before").unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules")).unwrap();

        let (mut watcher, mut rx) =
            FileWatcher::new(IgnoreRules::default(), Duration::from_millis(100));
        watcher.start(dir.path()).unwrap();
        assert!(watcher.is_watching());

        // Initial scan is silent
        assert!(next_change(&mut rx, Duration::from_millis(300)).await.is_none());

        let file = dir.path().join("notes.md");
        for i in 0..5 {
            std::fs::write(&file, format!("draft {}", i)).unwrap();
        }
        std::fs::write(dir.path().join("node_modules").join("pkg.js"), "x").unwrap();

        let first = next_change(&mut rx, Duration::from_secs(5)).await;
        assert_eq!(first, Some((FileEventKind::Add, "notes.md".to_string())));
        assert!(next_change(&mut rx, Duration::from_millis(500)).await.is_none());

        std::fs::write(&file, "final").unwrap();
        let second = next_change(&mut rx, Duration::from_secs(5)).await;
        assert_eq!(second, Some((FileEventKind::Change, "notes.md".to_string())));

        std::fs::remove_file(&file).unwrap();
        let third = next_change(&mut rx, Duration::from_secs(5)).await;
        assert_eq!(third, Some((FileEventKind::Remove, "notes.md".to_string())));
    }

    #[tokio::test]
    async fn test_stop_and_restart() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let (mut watcher, mut rx) =
            FileWatcher::new(IgnoreRules::default(), Duration::from_millis(50));

        watcher.start(dir.path()).unwrap();
        let stale = WatchEvent::Changed {
            generation: 1,
            kind: FileEventKind::Add,
            path: "x".to_string(),
        };
        assert!(watcher.accepts(&stale));

        // Restart replaces the previous watch
        watcher.start(other.path()).unwrap();
        assert!(!watcher.accepts(&stale));
        assert_eq!(watcher.watch_path(), Some(other.path()));

        std::fs::write(dir.path().join("old.txt"), "x").unwrap();
        std::fs::write(other.path().join("new.txt"), "x").unwrap();
        let change = next_change(&mut rx, Duration::from_secs(5)).await;
        assert_eq!(change, Some((FileEventKind::Add, "new.txt".to_string())));

        watcher.stop();
        watcher.stop();
        assert!(!watcher.is_watching());
        assert!(watcher.watch_path().is_none());
    }

    #[tokio::test]
    async fn test_start_on_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (mut watcher, _rx) = FileWatcher::new(IgnoreRules::default(), Duration::from_millis(50));
        let err = watcher.start(&dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, WatchError::NotADirectory(_)));
        assert!(!watcher.is_watching());
    }
}
