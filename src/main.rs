//! orbit-server - terminal, file watching and TaskMaster sync for Orbit
//!
//! Usage:
//!   orbit-server                      # Serve the current directory on port 3001
//!   orbit-server -d ~/code/app        # Serve another directory
//!   orbit-server --port 4000 --no-watch
//!   orbit-server --help               # Show help

use clap::Parser;
use colored::Colorize;
use orbit_server::config::{self, Settings, SettingsOverrides};
use orbit_server::watcher::IgnoreRules;
use orbit_server::Server;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "orbit-server")]
#[command(version)]
#[command(about = "Local companion server for the Orbit desktop app", long_about = None)]
struct Cli {
    /// Port for WebSocket and HTTP
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Address to bind
    #[arg(long)]
    host: Option<String>,

    /// Working directory (defaults to the current directory)
    #[arg(short = 'd', long = "dir", env = "ORBIT_WORKING_DIR")]
    working_directory: Option<PathBuf>,

    /// Disable the file watcher and TaskMaster sync
    #[arg(long)]
    no_watch: bool,

    /// Shell to run in the terminal
    #[arg(long, env = "ORBIT_SHELL")]
    shell: Option<String>,

    /// Initial terminal columns
    #[arg(long)]
    cols: Option<u16>,

    /// Initial terminal rows
    #[arg(long)]
    rows: Option<u16>,

    /// Quiet window for file change coalescing, in milliseconds
    #[arg(long = "quiet-ms")]
    quiet_window_ms: Option<u64>,

    /// TaskMaster file location relative to the working directory (repeatable, checked in order)
    #[arg(long = "task-file")]
    task_files: Vec<PathBuf>,

    /// Extra glob of paths the watcher ignores (repeatable)
    #[arg(long = "ignore")]
    ignore_globs: Vec<String>,

    /// Directory for saved projects
    #[arg(long, env = "ORBIT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Settings file (defaults to ~/.orbit/config.json)
    #[arg(long = "config")]
    settings_file: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            host: self.host.clone(),
            port: self.port,
            working_directory: self.working_directory.clone(),
            watch_enabled: self.no_watch.then_some(false),
            shell: self.shell.clone(),
            cols: self.cols,
            rows: self.rows,
            quiet_window_ms: self.quiet_window_ms,
            task_files: (!self.task_files.is_empty()).then(|| self.task_files.clone()),
            task_id_prefix: None,
            ignore_globs: (!self.ignore_globs.is_empty()).then(|| self.ignore_globs.clone()),
            data_dir: self.data_dir.clone(),
        }
    }
}

/// Layer defaults, the settings file and the command line
fn resolve_settings(cli: &Cli) -> Result<Settings, String> {
    let file = cli
        .settings_file
        .clone()
        .unwrap_or_else(config::settings_file);
    let mut settings = Settings::default()
        .apply(config::load_settings_file(&file))
        .apply(cli.overrides());

    settings.working_directory = std::fs::canonicalize(&settings.working_directory)
        .ok()
        .filter(|p| p.is_dir())
        .ok_or_else(|| {
            format!(
                "Working directory does not exist: {}",
                settings.working_directory.display()
            )
        })?;

    IgnoreRules::new(&settings.ignore_globs).map_err(|e| e.to_string())?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("orbit_server=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let settings = match resolve_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}: {}", "Configuration error".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    let working_directory = settings.working_directory.clone();
    let server = match Server::bind(settings).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("{}: {}", "Server error".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    if let Ok(addr) = server.local_addr() {
        println!("{} Orbit server on {}", "▶".green(), addr.to_string().cyan());
        println!("  WebSocket: ws://{}", addr);
        println!("  Health:    http://{}/health", addr);
        println!("  Directory: {}", working_directory.display().to_string().dimmed());
    }

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "Server error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
