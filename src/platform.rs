//! Cross-platform utilities for the Orbit server
//!
//! This module provides platform-agnostic functions for:
//! - Home and config directory paths
//! - Default shell detection
//! - Shell-specific directory change commands
//!
//! Supports Linux, macOS, and Windows.

use std::path::{Path, PathBuf};

/// Get the user's home directory in a cross-platform way.
pub fn home_dir() -> Option<PathBuf> {
    dirs_next::home_dir()
}

/// Get the Orbit config directory.
///
/// Returns:
/// - Linux/macOS: `~/.orbit`
/// - Windows: `%USERPROFILE%\.orbit`
pub fn config_dir() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".orbit")
}

/// Get the default shell for the current platform.
///
/// Returns:
/// - Unix (Linux/macOS): `$SHELL` environment variable, or `/bin/sh` as fallback
/// - Windows: PowerShell if available, otherwise `COMSPEC` (typically cmd.exe)
pub fn default_shell() -> String {
    #[cfg(unix)]
    {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }

    #[cfg(windows)]
    {
        let powershell =
            PathBuf::from(r"C:\Windows\System32\WindowsPowerShell\v1.0\powershell.exe");
        if powershell.exists() {
            return powershell.to_string_lossy().to_string();
        }
        if let Ok(comspec) = std::env::var("COMSPEC") {
            return comspec;
        }
        "cmd.exe".to_string()
    }

    #[cfg(not(any(unix, windows)))]
    {
        "sh".to_string()
    }
}

/// Build the line typed into the shell to switch directories.
///
/// Windows shells submit on CR, everything else on LF.
pub fn cd_command(path: &Path) -> String {
    let path = path.display();
    if cfg!(windows) {
        format!("cd \"{}\"\r", path)
    } else {
        format!("cd \"{}\"\n", path)
    }
}

/// Render a path relative to `root` with forward slashes, the form clients see.
pub fn relative_display(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
