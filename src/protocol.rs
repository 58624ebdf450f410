//! WebSocket protocol messages
//!
//! JSON objects discriminated by a `type` field, compatible with the Orbit
//! desktop UI.

use crate::taskmaster::OrbitTask;
use serde::{Deserialize, Serialize};

/// Messages sent from the UI to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Raw keystrokes for the terminal
    #[serde(rename = "terminal:input")]
    TerminalInput { data: String },
    /// Terminal viewport changed
    #[serde(rename = "terminal:resize")]
    TerminalResize { cols: u16, rows: u16 },
    #[serde(rename = "config:setWorkingDir")]
    SetWorkingDir { path: String },
    #[serde(rename = "config:getWorkingDir")]
    GetWorkingDir,
    /// Create a directory relative to the working directory
    #[serde(rename = "config:createDir", rename_all = "camelCase")]
    CreateDir { relative_path: String },
    /// Write a file relative to the working directory
    #[serde(rename = "config:writeFile", rename_all = "camelCase")]
    WriteFile {
        relative_path: String,
        content: String,
    },
}

/// Kind of a coalesced filesystem change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEventKind {
    Add,
    Change,
    #[serde(rename = "unlink")]
    Remove,
}

/// Assistant bridge state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssistantStatus {
    Initializing,
    Ready,
    Error,
}

/// Messages sent from the server to the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Sent once on connect
    #[serde(rename = "connection:status")]
    ConnectionStatus { connected: bool },
    #[serde(rename = "config:workingDir")]
    WorkingDir { path: String },
    /// Result of createDir / writeFile
    #[serde(rename = "config:writeResult")]
    WriteResult {
        success: bool,
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "terminal:ready")]
    TerminalReady,
    #[serde(rename = "terminal:output")]
    TerminalOutput { data: String },
    #[serde(rename = "terminal:exit")]
    TerminalExit { code: Option<i32> },
    #[serde(rename = "file:changed")]
    FileChanged { path: String, event: FileEventKind },
    /// Full task list after a TaskMaster sync
    #[serde(rename = "tasks:updated")]
    TasksUpdated { tasks: Vec<OrbitTask> },
    #[serde(rename = "gemini:status")]
    GeminiStatus { status: AssistantStatus },
    #[serde(rename = "gemini:response")]
    GeminiResponse { response: String },
    #[serde(rename = "gemini:error")]
    GeminiError { error: String },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn write_ok(path: impl Into<String>) -> Self {
        ServerMessage::WriteResult {
            success: true,
            path: path.into(),
            error: None,
        }
    }

    pub fn write_failed(path: impl Into<String>, error: impl Into<String>) -> Self {
        ServerMessage::WriteResult {
            success: false,
            path: path.into(),
            error: Some(error.into()),
        }
    }

    /// Encode for the wire
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!("Failed to serialize server message: {}", e);
            r#"{"type":"error","message":"Internal serialization error"}"#.to_string()
        })
    }
}
