//! Connection hub
//!
//! A single actor task owns the client registry, the configuration writes
//! and the one set of services (terminal, watcher, task sync). Connection
//! tasks and the HTTP layer talk to it through `HubHandle`; service event
//! streams are polled by the same loop, so every state change is serialized.
//!
//! Services are created when the first client connects and torn down when
//! the last one leaves.

use crate::config::{ServerConfig, SessionContext};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::pty::{PtyConfig, PtyEvent, PtySession};
use crate::taskmaster::{SyncEvent, TaskMasterSync};
use crate::watcher::{FileWatcher, IgnoreRules, WatchEvent};
use crate::workspace;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Connection ids increase monotonically, so the smallest id is the
/// longest-connected client.
pub type ClientId = u64;

pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("Hub is not running")]
    Closed,
    #[error("{0}")]
    Rejected(String),
}

pub enum HubCommand {
    Connect {
        id: ClientId,
        tx: ClientSender,
    },
    Disconnect {
        id: ClientId,
    },
    /// Raw text frame from a client
    Inbound {
        id: ClientId,
        text: String,
    },
    /// Working directory change from the HTTP surface
    SetWorkingDirectory {
        path: PathBuf,
        reply: oneshot::Sender<Result<ServerConfig, String>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Cloneable entry point to the hub
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
    next_id: Arc<AtomicU64>,
}

impl HubHandle {
    pub fn next_connection_id(&self) -> ClientId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn connect(&self, id: ClientId, tx: ClientSender) -> Result<(), HubError> {
        self.send(HubCommand::Connect { id, tx })
    }

    pub fn disconnect(&self, id: ClientId) {
        let _ = self.send(HubCommand::Disconnect { id });
    }

    pub fn inbound(&self, id: ClientId, text: String) -> Result<(), HubError> {
        self.send(HubCommand::Inbound { id, text })
    }

    pub async fn set_working_directory(&self, path: PathBuf) -> Result<ServerConfig, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::SetWorkingDirectory { path, reply })?;
        rx.await
            .map_err(|_| HubError::Closed)?
            .map_err(HubError::Rejected)
    }

    /// Tear everything down and wait for the hub to finish
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.send(HubCommand::Shutdown { done }).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, command: HubCommand) -> Result<(), HubError> {
        self.tx.send(command).map_err(|_| HubError::Closed)
    }
}

struct Services {
    pty: PtySession,
    pty_rx: mpsc::UnboundedReceiver<PtyEvent>,
    watcher: FileWatcher,
    watch_rx: mpsc::UnboundedReceiver<WatchEvent>,
    sync: TaskMasterSync,
    sync_rx: mpsc::UnboundedReceiver<SyncEvent>,
}

impl Services {
    fn stop(&mut self) {
        self.pty.stop();
        self.watcher.stop();
    }
}

enum Step {
    Command(HubCommand),
    Pty(PtyEvent),
    Watch(WatchEvent),
    Sync(SyncEvent),
    Closed,
}

pub struct Hub {
    ctx: SessionContext,
    commands: mpsc::UnboundedReceiver<HubCommand>,
    clients: BTreeMap<ClientId, ClientSender>,
    services: Option<Services>,
    terminal_owner: Option<ClientId>,
}

/// Start the hub actor
pub fn spawn(ctx: SessionContext) -> (HubHandle, JoinHandle<()>) {
    let (tx, commands) = mpsc::unbounded_channel();
    let hub = Hub {
        ctx,
        commands,
        clients: BTreeMap::new(),
        services: None,
        terminal_owner: None,
    };
    let handle = HubHandle {
        tx,
        next_id: Arc::new(AtomicU64::new(1)),
    };
    (handle, tokio::spawn(hub.run()))
}

async fn next_service_event(services: &mut Option<Services>) -> Step {
    let Some(services) = services.as_mut() else {
        return std::future::pending().await;
    };
    tokio::select! {
        Some(event) = services.pty_rx.recv() => Step::Pty(event),
        Some(event) = services.watch_rx.recv() => Step::Watch(event),
        Some(event) = services.sync_rx.recv() => Step::Sync(event),
        else => std::future::pending().await,
    }
}

impl Hub {
    async fn run(mut self) {
        tracing::info!("Hub started");
        loop {
            let step = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => Step::Closed,
                },
                step = next_service_event(&mut self.services) => step,
            };

            match step {
                Step::Command(HubCommand::Shutdown { done }) => {
                    self.shutdown();
                    let _ = done.send(());
                    break;
                }
                Step::Command(command) => self.handle_command(command).await,
                Step::Pty(event) => self.handle_pty_event(event),
                Step::Watch(event) => self.handle_watch_event(event).await,
                Step::Sync(event) => self.handle_sync_event(event),
                Step::Closed => {
                    self.shutdown();
                    break;
                }
            }
        }
        tracing::info!("Hub stopped");
    }

    async fn handle_command(&mut self, command: HubCommand) {
        match command {
            HubCommand::Connect { id, tx } => self.handle_connect(id, tx).await,
            HubCommand::Disconnect { id } => self.handle_disconnect(id),
            HubCommand::Inbound { id, text } => self.handle_inbound(id, &text).await,
            HubCommand::SetWorkingDirectory { path, reply } => {
                let result = self.apply_working_directory(path).await;
                if let Ok(config) = &result {
                    self.broadcast(ServerMessage::WorkingDir {
                        path: config.working_directory.display().to_string(),
                    });
                }
                let _ = reply.send(result);
            }
            HubCommand::Shutdown { done } => {
                self.shutdown();
                let _ = done.send(());
            }
        }
    }

    async fn handle_connect(&mut self, id: ClientId, tx: ClientSender) {
        let config = self.ctx.config().await;
        tracing::info!("Client {} connected ({} total)", id, self.clients.len() + 1);

        let _ = tx.send(ServerMessage::ConnectionStatus { connected: true });
        let _ = tx.send(ServerMessage::WorkingDir {
            path: config.working_directory.display().to_string(),
        });
        self.clients.insert(id, tx);

        if self.services.is_none() {
            self.terminal_owner = Some(id);
            self.start_services(&config).await;
        } else if self.terminal_owner.is_none() {
            self.terminal_owner = Some(id);
        }
    }

    fn handle_disconnect(&mut self, id: ClientId) {
        if self.clients.remove(&id).is_none() {
            return;
        }
        tracing::info!("Client {} disconnected ({} remaining)", id, self.clients.len());

        if self.clients.is_empty() {
            self.stop_services();
            return;
        }

        if self.terminal_owner == Some(id) {
            self.terminal_owner = self.clients.keys().next().copied();
            tracing::info!("Terminal output now goes to client {:?}", self.terminal_owner);
        }
    }

    async fn start_services(&mut self, config: &ServerConfig) {
        let settings = self.ctx.settings.clone();
        tracing::info!("Starting services in {:?}", config.working_directory);

        let (mut pty, pty_rx) = PtySession::new(
            PtyConfig {
                shell: settings.shell.clone(),
                cols: settings.cols,
                rows: settings.rows,
            },
            &config.working_directory,
        );

        let rules = IgnoreRules::new(&settings.ignore_globs).unwrap_or_else(|e| {
            tracing::warn!("{}; using built-in ignore rules only", e);
            IgnoreRules::default()
        });
        let (watcher, watch_rx) = FileWatcher::new(rules, settings.quiet_window);
        let (mut sync, sync_rx) =
            TaskMasterSync::new(settings.task_files.clone(), settings.task_id_prefix.clone());
        sync.set_project_path(&config.working_directory);

        pty.start();

        self.services = Some(Services {
            pty,
            pty_rx,
            watcher,
            watch_rx,
            sync,
            sync_rx,
        });

        if config.watch_enabled {
            self.start_watching(&config.working_directory);
            self.resync().await;
        }
    }

    /// (Re)start the watcher on `path`. A failure is reported to every client.
    fn start_watching(&mut self, path: &Path) {
        let Some(services) = self.services.as_mut() else {
            return;
        };

        if let Err(e) = services.watcher.start(path) {
            tracing::error!("Failed to watch {:?}: {}", path, e);
            let message = ServerMessage::error(e.to_string());
            self.broadcast(message);
        }
    }

    async fn resync(&mut self) {
        if let Some(services) = self.services.as_mut() {
            services.sync.check_and_sync().await;
        }
    }

    fn stop_services(&mut self) {
        if let Some(mut services) = self.services.take() {
            tracing::info!("No clients left, stopping services");
            services.stop();
        }
        self.terminal_owner = None;
    }

    fn shutdown(&mut self) {
        self.stop_services();
        // Dropping the senders ends every connection's writer
        self.clients.clear();
    }

    async fn handle_inbound(&mut self, id: ClientId, text: &str) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Invalid message from client {}: {}", id, e);
                self.send_to(id, ServerMessage::error("Invalid message format"));
                return;
            }
        };

        match message {
            ClientMessage::TerminalInput { data } => {
                let Some(services) = self.services.as_mut() else {
                    return;
                };
                if !services.pty.is_running() {
                    tracing::info!("Restarting terminal for client {}", id);
                    services.pty.start();
                    self.terminal_owner = Some(id);
                }
                services.pty.write(data);
            }
            ClientMessage::TerminalResize { cols, rows } => {
                if let Some(services) = &self.services {
                    services.pty.resize(cols, rows);
                }
            }
            ClientMessage::SetWorkingDir { path } => {
                match self.apply_working_directory(PathBuf::from(&path)).await {
                    Ok(config) => self.send_to(
                        id,
                        ServerMessage::WorkingDir {
                            path: config.working_directory.display().to_string(),
                        },
                    ),
                    Err(message) => self.send_to(id, ServerMessage::error(message)),
                }
            }
            ClientMessage::GetWorkingDir => {
                let config = self.ctx.config().await;
                self.send_to(
                    id,
                    ServerMessage::WorkingDir {
                        path: config.working_directory.display().to_string(),
                    },
                );
            }
            ClientMessage::CreateDir { relative_path } => {
                let root = self.ctx.config().await.working_directory;
                let reply = match workspace::create_dir(&root, &relative_path).await {
                    Ok(_) => ServerMessage::write_ok(relative_path),
                    Err(e) => {
                        tracing::warn!("createDir {} failed: {}", relative_path, e);
                        ServerMessage::write_failed(relative_path, e.to_string())
                    }
                };
                self.send_to(id, reply);
            }
            ClientMessage::WriteFile {
                relative_path,
                content,
            } => {
                let root = self.ctx.config().await.working_directory;
                let reply = match workspace::write_file(&root, &relative_path, &content).await {
                    Ok(_) => ServerMessage::write_ok(relative_path),
                    Err(e) => {
                        tracing::warn!("writeFile {} failed: {}", relative_path, e);
                        ServerMessage::write_failed(relative_path, e.to_string())
                    }
                };
                self.send_to(id, reply);
            }
        }
    }

    /// Switch the working directory: config, shell `cd`, watcher and sync
    async fn apply_working_directory(&mut self, path: PathBuf) -> Result<ServerConfig, String> {
        let is_dir = tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(format!("Directory does not exist: {}", path.display()));
        }

        let updated = {
            let mut config = self.ctx.config.write().await;
            config.working_directory = path.clone();
            config.clone()
        };
        tracing::info!("Working directory set to {:?}", path);

        if let Some(services) = self.services.as_mut() {
            services.pty.set_working_directory(&path);
            services.sync.set_project_path(&path);
            if updated.watch_enabled {
                self.start_watching(&path);
            }
            self.resync().await;
        }
        Ok(updated)
    }

    fn handle_pty_event(&mut self, event: PtyEvent) {
        let Some(services) = self.services.as_mut() else {
            return;
        };

        if let PtyEvent::Exit { generation, code } = event {
            if !services.pty.handle_exit(generation) {
                tracing::debug!("Dropping exit from stale terminal {}", generation);
                return;
            }
            self.send_to_owner(ServerMessage::TerminalExit { code });
            if let Some(code) = code.filter(|c| *c != 0) {
                self.send_to_owner(ServerMessage::error(format!(
                    "Terminal exited with code {}",
                    code
                )));
            }
            return;
        }

        if !services.pty.accepts(&event) {
            return;
        }
        let message = match event {
            PtyEvent::Ready { .. } => ServerMessage::TerminalReady,
            PtyEvent::Output { data, .. } => ServerMessage::TerminalOutput { data },
            PtyEvent::Error { message, .. } => ServerMessage::error(message),
            PtyEvent::Exit { .. } => return,
        };
        self.send_to_owner(message);
    }

    async fn handle_watch_event(&mut self, event: WatchEvent) {
        let Some(services) = self.services.as_ref() else {
            return;
        };
        if !services.watcher.accepts(&event) {
            return;
        }

        match event {
            WatchEvent::Changed { kind, path, .. } => {
                self.broadcast(ServerMessage::FileChanged {
                    path: path.clone(),
                    event: kind,
                });
                if let Some(services) = self.services.as_mut() {
                    services.sync.handle_file_change(&path).await;
                }
            }
            WatchEvent::Error { message, .. } => self.broadcast(ServerMessage::error(message)),
        }
    }

    fn handle_sync_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::TasksUpdated(tasks) => self.broadcast(ServerMessage::TasksUpdated { tasks }),
            SyncEvent::Error(message) => self.broadcast(ServerMessage::error(message)),
        }
    }

    fn send_to(&self, id: ClientId, message: ServerMessage) {
        if let Some(tx) = self.clients.get(&id) {
            let _ = tx.send(message);
        }
    }

    fn send_to_owner(&self, message: ServerMessage) {
        if let Some(owner) = self.terminal_owner {
            self.send_to(owner, message);
        }
    }

    fn broadcast(&self, message: ServerMessage) {
        for tx in self.clients.values() {
            let _ = tx.send(message.clone());
        }
    }
}
