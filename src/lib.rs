//! Orbit server - local companion for the Orbit desktop app
//!
//! One long-lived process that exposes an interactive terminal, watches the
//! working directory and keeps TaskMaster's task file in sync with the app,
//! shared by every WebSocket client that connects.

pub mod config;
pub mod http;
pub mod hub;
pub mod platform;
pub mod projects;
pub mod protocol;
pub mod pty;
pub mod server;
pub mod taskmaster;
pub mod watcher;
pub mod workspace;

pub use config::Settings;
pub use server::Server;
