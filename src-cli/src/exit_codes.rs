//! Exit codes for the CLI.
//!
//! These codes enable scripting integration by providing structured
//! feedback about operation results.

use camrec_service::RecordingError;

/// Exit codes for CLI operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Operation completed successfully
    Success = 0,
    /// General/unspecified error
    GeneralError = 1,
    /// Invalid command-line arguments
    InvalidArguments = 2,
    /// The camera could not be opened or configured
    DeviceFailed = 3,
    /// Recording failed to start
    RecordingFailedToStart = 4,
    /// Recording failed during capture or while closing the file
    RecordingFailedDuringCapture = 5,
    /// The configuration file could not be written
    ConfigError = 6,
}

impl ExitCode {
    /// Convert to i32 for process exit.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Exit code for an error raised while connecting or starting.
    pub fn for_start_error(error: &RecordingError) -> Self {
        match error {
            RecordingError::Device(_) => ExitCode::DeviceFailed,
            RecordingError::InvalidDuration(_) => ExitCode::InvalidArguments,
            _ => ExitCode::RecordingFailedToStart,
        }
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitCode::Success => write!(f, "success"),
            ExitCode::GeneralError => write!(f, "general error"),
            ExitCode::InvalidArguments => write!(f, "invalid arguments"),
            ExitCode::DeviceFailed => write!(f, "device failed"),
            ExitCode::RecordingFailedToStart => write!(f, "recording failed to start"),
            ExitCode::RecordingFailedDuringCapture => write!(f, "recording failed during capture"),
            ExitCode::ConfigError => write!(f, "config error"),
        }
    }
}
