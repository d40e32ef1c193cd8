//! Platform-specific logging directory resolution.

use directories::ProjectDirs;
use std::path::PathBuf;

/// Returns the platform-appropriate directory for log files.
///
/// | Platform | Directory |
/// |----------|-----------|
/// | Linux | `$XDG_STATE_HOME/camrec/logs` or `~/.local/state/camrec/logs` |
/// | macOS | `~/Library/Logs/camrec` |
/// | Windows | `%LOCALAPPDATA%\camrec\camrec\logs` |
///
/// Returns `None` when no home directory can be determined.
pub fn log_dir() -> Option<PathBuf> {
    let base = ProjectDirs::from("", "", "camrec")?;

    #[cfg(target_os = "linux")]
    {
        Some(
            base.state_dir()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| base.data_local_dir().join("state"))
                .join("logs"),
        )
    }

    #[cfg(target_os = "macos")]
    {
        // data_local_dir is ~/Library/Application Support/camrec; logs live in ~/Library/Logs.
        let library = base
            .data_local_dir()
            .parent()
            .and_then(|p| p.parent())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| base.data_local_dir().to_path_buf());
        Some(library.join("Logs").join("camrec"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Some(base.data_local_dir().join("logs"))
    }
}

/// Ensures the log directory exists, creating it if necessary.
///
/// Returns the directory on success.
pub fn ensure_log_dir() -> Result<PathBuf, std::io::Error> {
    let dir = log_dir().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "could not determine log directory",
        )
    })?;
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// File name prefix for the rolling CLI log (`camrec.2026-03-01.log`).
pub const LOG_FILE_PREFIX: &str = "camrec";

/// File name suffix for the rolling CLI log.
pub const LOG_FILE_SUFFIX: &str = "log";
