// PTY module - Manages the interactive shell in a pseudo-terminal

use crate::platform;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("PTY error: {0}")]
    Pty(String),
}

/// Events produced by the terminal session.
///
/// Every event carries the generation of the spawn that produced it so
/// late events from a stopped shell can be told apart.
#[derive(Debug, Clone, PartialEq)]
pub enum PtyEvent {
    Ready { generation: u64 },
    Output { generation: u64, data: String },
    Exit { generation: u64, code: Option<i32> },
    Error { generation: u64, message: String },
}

impl PtyEvent {
    pub fn generation(&self) -> u64 {
        match self {
            PtyEvent::Ready { generation }
            | PtyEvent::Output { generation, .. }
            | PtyEvent::Exit { generation, .. }
            | PtyEvent::Error { generation, .. } => *generation,
        }
    }
}

/// Shell and geometry used for every spawn
#[derive(Debug, Clone)]
pub struct PtyConfig {
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
}

struct PtyHandle {
    generation: u64,
    master: Box<dyn MasterPty + Send>,
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

/// The single terminal session
pub struct PtySession {
    config: PtyConfig,
    working_directory: PathBuf,
    handle: Option<PtyHandle>,
    generation: u64,
    events: mpsc::UnboundedSender<PtyEvent>,
}

impl PtySession {
    pub fn new(
        config: PtyConfig,
        working_directory: impl Into<PathBuf>,
    ) -> (Self, mpsc::UnboundedReceiver<PtyEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                working_directory: working_directory.into(),
                handle: None,
                generation: 0,
                events,
            },
            rx,
        )
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    /// Spawn the shell. No-op if one is already running; failures are
    /// reported as an `Error` event rather than returned.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            tracing::info!("Terminal already running, ignoring start");
            return;
        }

        self.generation += 1;
        let generation = self.generation;

        match self.spawn(generation) {
            Ok(handle) => {
                tracing::info!(
                    "Started {} in {:?} ({}x{})",
                    self.config.shell,
                    self.working_directory,
                    self.config.cols,
                    self.config.rows
                );
                self.handle = Some(handle);
            }
            Err(e) => {
                tracing::error!("Failed to spawn terminal: {}", e);
                let _ = self.events.send(PtyEvent::Error {
                    generation,
                    message: format!("Failed to start terminal: {}", e),
                });
            }
        }
    }

    fn spawn(&self, generation: u64) -> Result<PtyHandle, PtyError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: self.config.rows,
                cols: self.config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Pty(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&self.config.shell);
        cmd.cwd(&self.working_directory);
        cmd.env("TERM", "xterm-256color");

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Pty(e.to_string()))?;

        // Drop the slave - we communicate through the master
        drop(pair.slave);

        let mut killer = child.clone_killer();
        let master = pair.master;
        let io = master
            .try_clone_reader()
            .and_then(|reader| master.take_writer().map(|writer| (reader, writer)));
        let (reader, writer) = match io {
            Ok(io) => io,
            Err(e) => {
                let _ = killer.kill();
                return Err(PtyError::Pty(e.to_string()));
            }
        };

        // Ready goes out before any output can
        let _ = self.events.send(PtyEvent::Ready { generation });

        let (input_tx, input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        std::thread::spawn(move || write_loop(writer, input_rx));

        let events = self.events.clone();
        std::thread::spawn(move || {
            read_loop(reader, generation, &events);

            let code = match child.wait() {
                Ok(status) => Some(status.exit_code() as i32),
                Err(e) => {
                    tracing::warn!("Failed to wait for terminal process: {}", e);
                    None
                }
            };
            tracing::info!("Terminal process exited with code {:?}", code);
            let _ = events.send(PtyEvent::Exit { generation, code });
        });

        Ok(PtyHandle {
            generation,
            master,
            input_tx,
            killer,
        })
    }

    /// Send raw input to the shell. Warns and does nothing when not running.
    pub fn write(&self, data: impl AsRef<[u8]>) {
        match &self.handle {
            Some(handle) => {
                if handle.input_tx.send(data.as_ref().to_vec()).is_err() {
                    tracing::warn!("Terminal input channel closed");
                }
            }
            None => tracing::warn!("Terminal not running, dropping input"),
        }
    }

    /// Apply new geometry. Rejections from the terminal driver are logged only.
    pub fn resize(&self, cols: u16, rows: u16) {
        let Some(handle) = &self.handle else {
            return;
        };
        if cols == 0 || rows == 0 {
            tracing::warn!("Ignoring invalid terminal size {}x{}", cols, rows);
            return;
        }

        match handle.master.resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }) {
            Ok(()) => tracing::debug!("Resized terminal to {}x{}", cols, rows),
            Err(e) => tracing::warn!("Failed to resize terminal to {}x{}: {}", cols, rows, e),
        }
    }

    /// Remember the directory for future spawns and `cd` the running shell
    /// into it, keeping its scrollback.
    pub fn set_working_directory(&mut self, path: impl Into<PathBuf>) {
        self.working_directory = path.into();
        if self.handle.is_some() {
            self.write(platform::cd_command(&self.working_directory));
        }
    }

    /// Kill the shell and forget it. Idempotent.
    pub fn stop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            if let Err(e) = handle.killer.kill() {
                tracing::debug!("Kill terminal process: {}", e);
            }
            tracing::info!("Terminal stopped");
        }
    }

    /// Should an event from the stream still be acted on?
    pub fn accepts(&self, event: &PtyEvent) -> bool {
        let generation = event.generation();
        match event {
            // Spawn failures leave no handle behind
            PtyEvent::Error { .. } => generation == self.generation,
            _ => self
                .handle
                .as_ref()
                .map(|h| h.generation == generation)
                .unwrap_or(false),
        }
    }

    /// Clear the handle when the current shell exits. Returns false for an
    /// exit from a shell that was already stopped or replaced.
    pub fn handle_exit(&mut self, generation: u64) -> bool {
        match &self.handle {
            Some(handle) if handle.generation == generation => {
                self.handle = None;
                true
            }
            _ => false,
        }
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn write_loop(mut writer: Box<dyn Write + Send>, mut input_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = input_rx.blocking_recv() {
        if let Err(e) = writer.write_all(&bytes).and_then(|_| writer.flush()) {
            tracing::warn!("Failed to write to terminal: {}", e);
            break;
        }
    }
}

fn read_loop(
    mut reader: Box<dyn Read + Send>,
    generation: u64,
    events: &mpsc::UnboundedSender<PtyEvent>,
) {
    let mut decoder = Utf8Decoder::default();
    let mut buffer = [0u8; 4096];

    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break, // EOF
            Ok(n) => {
                let data = decoder.decode(&buffer[..n]);
                if !data.is_empty()
                    && events.send(PtyEvent::Output { generation, data }).is_err()
                {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO once the child is gone
                tracing::debug!("Terminal read ended: {}", e);
                break;
            }
        }
    }

    let rest = decoder.finish();
    if !rest.is_empty() {
        let _ = events.send(PtyEvent::Output {
            generation,
            data: rest,
        });
    }
}

/// Incremental UTF-8 decoder that holds back a multi-byte sequence split
/// across reads.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Incomplete sequence at the end; wait for more bytes
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }

        out
    }

    /// Flush whatever is left at end of stream
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_utf8_decoder_split_sequence() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "héllo ✓".as_bytes();
        // Split inside the two-byte 'é'
        let first = decoder.decode(&bytes[..2]);
        assert_eq!(first, "h");
        let second = decoder.decode(&bytes[2..bytes.len() - 1]);
        assert_eq!(second, "éllo ");
        let third = decoder.decode(&bytes[bytes.len() - 1..]);
        assert_eq!(third, "✓");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_utf8_decoder_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        let out = decoder.decode(&[b'a', 0xff, b'b']);
        assert_eq!(out, "a\u{fffd}b");

        let out = decoder.decode(&[0xe2, 0x9c]);
        assert_eq!(out, "");
        assert_eq!(decoder.finish(), "\u{fffd}");
    }

    #[test]
    fn test_event_generation() {
        let event = PtyEvent::Output {
            generation: 4,
            data: "x".to_string(),
        };
        assert_eq!(event.generation(), 4);
    }

    #[test]
    fn test_idle_session_is_inert() {
        let config = PtyConfig {
            shell: "/bin/sh".to_string(),
            cols: 80,
            rows: 24,
        };
        let (mut session, mut rx) = PtySession::new(config, std::env::temp_dir());
        assert!(!session.is_running());

        session.write("echo hi\n");
        session.resize(100, 30);
        session.set_working_directory("/tmp");
        session.stop();
        session.stop();

        assert_eq!(session.working_directory(), Path::new("/tmp"));
        assert!(rx.try_recv().is_err());
        assert!(!session.handle_exit(1));
    }

    #[cfg(unix)]
    fn sh_session() -> (PtySession, mpsc::UnboundedReceiver<PtyEvent>) {
        let config = PtyConfig {
            shell: "/bin/sh".to_string(),
            cols: 80,
            rows: 24,
        };
        PtySession::new(config, std::env::temp_dir())
    }

    #[cfg(unix)]
    async fn wait_for_output(rx: &mut mpsc::UnboundedReceiver<PtyEvent>, needle: &str) -> bool {
        let mut seen = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            if let PtyEvent::Output { data, .. } = event {
                seen.push_str(&data);
                if seen.contains(needle) {
                    return true;
                }
            }
        }
        false
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (mut session, mut rx) = sh_session();
        session.start();
        session.start();
        assert!(session.is_running());

        assert_eq!(rx.recv().await, Some(PtyEvent::Ready { generation: 1 }));

        session.write("echo orbit-$((40+2))\n");
        assert!(wait_for_output(&mut rx, "orbit-42").await);

        // No second Ready from the repeated start
        session.stop();
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            assert!(!matches!(event, PtyEvent::Ready { .. }));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_clears_handle() {
        let (mut session, mut rx) = sh_session();
        session.start();
        session.write("exit 3\n");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        let mut exit = None;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            if let PtyEvent::Exit { generation, code } = event {
                exit = Some((generation, code));
                break;
            }
        }

        let (generation, code) = exit.expect("terminal should exit");
        assert_eq!(code, Some(3));
        assert!(session.handle_exit(generation));
        assert!(!session.is_running());
        // Second report of the same exit is stale
        assert!(!session.handle_exit(generation));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stale_events_rejected_after_stop() {
        let (mut session, _rx) = sh_session();
        session.start();
        let output = PtyEvent::Output {
            generation: 1,
            data: "x".to_string(),
        };
        assert!(session.accepts(&output));

        session.stop();
        assert!(!session.accepts(&output));
        assert!(!session.accepts(&PtyEvent::Exit {
            generation: 1,
            code: Some(0)
        }));
        assert!(!session.handle_exit(1));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_shell_reports_error() {
        let config = PtyConfig {
            shell: "/nonexistent/orbit-shell".to_string(),
            cols: 80,
            rows: 24,
        };
        let (mut session, mut rx) = PtySession::new(config, std::env::temp_dir());
        session.start();
        assert!(!session.is_running());

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let PtyEvent::Error { generation, message } = &event else {
            panic!("expected an error event, got {:?}", event);
        };
        assert_eq!(*generation, 1);
        assert!(message.starts_with("Failed to start terminal"));
        assert!(session.accepts(&event));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_zero_resize_keeps_session_running() {
        let (mut session, mut rx) = sh_session();
        session.start();
        assert_eq!(rx.recv().await, Some(PtyEvent::Ready { generation: 1 }));

        session.resize(0, 0);
        session.resize(120, 0);
        assert!(session.is_running());

        session.write("echo orbit-$((40+2))\n");
        assert!(wait_for_output(&mut rx, "orbit-42").await);
        session.stop();
    }

    #[test]
    fn test_spawn_errors_accepted_for_latest_attempt_only() {
        let config = PtyConfig {
            shell: "/bin/sh".to_string(),
            cols: 80,
            rows: 24,
        };
        let (session, _rx) = PtySession::new(config, std::env::temp_dir());
        let current = PtyEvent::Error {
            generation: 0,
            message: "boom".to_string(),
        };
        let stale = PtyEvent::Error {
            generation: 7,
            message: "boom".to_string(),
        };
        assert!(session.accepts(&current));
        assert!(!session.accepts(&stale));
    }
}
