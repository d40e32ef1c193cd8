//! Locating and verifying the ffmpeg binary.
//!
//! Both the camera backend and the video writer drive ffmpeg through
//! `ffmpeg-sidecar`. The binary is resolved the way `ffmpeg-sidecar` does it
//! (next to the executable, then `PATH`).

use ffmpeg_sidecar::command::FfmpegCommand;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Outcome of the first availability check, shared by every later caller.
static FFMPEG_READY: OnceLock<Result<(), String>> = OnceLock::new();

/// Resolve the path to the ffmpeg binary.
pub fn ffmpeg_path() -> PathBuf {
    ffmpeg_sidecar::paths::ffmpeg_path()
}

/// Create a new `FfmpegCommand` using the resolved ffmpeg path.
pub fn new_ffmpeg_command() -> FfmpegCommand {
    FfmpegCommand::new_with_path(ffmpeg_path())
}

/// Ensure ffmpeg can be executed.
///
/// Runs `ffmpeg -version` once per process. On Linux a missing binary is
/// downloaded with `ffmpeg-sidecar` as a last resort.
pub fn ensure_ffmpeg() -> Result<(), String> {
    FFMPEG_READY.get_or_init(check_ffmpeg).clone()
}

fn check_ffmpeg() -> Result<(), String> {
    let ffmpeg = ffmpeg_path();
    debug!("Resolved ffmpeg path: {}", ffmpeg.display());

    match Command::new(&ffmpeg)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => {
            debug!("ffmpeg binary verified");
            Ok(())
        }
        Ok(status) => Err(format!(
            "ffmpeg at {} exited with status: {}",
            ffmpeg.display(),
            status
        )),
        Err(e) => {
            warn!("ffmpeg not found at {}: {}", ffmpeg.display(), e);
            #[cfg(target_os = "linux")]
            {
                tracing::info!("Attempting ffmpeg auto-download");
                ffmpeg_sidecar::download::auto_download()
                    .map_err(|e| format!("ffmpeg not found and auto-download failed: {}", e))
            }
            #[cfg(not(target_os = "linux"))]
            {
                Err(format!(
                    "ffmpeg not found at {}. Install ffmpeg or place it next to the camrec binary.",
                    ffmpeg.display()
                ))
            }
        }
    }
}

/// Last non-empty line of ffmpeg's stderr, which is where it puts the fatal error.
pub(crate) fn last_error_line(stderr: &str) -> Option<&str> {
    stderr.lines().map(str::trim).filter(|l| !l.is_empty()).last()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_error_line_skips_trailing_blank_lines() {
        let stderr = "frame=  10\n[mp4 @ 0x1] Could not open output\n\n  \n";
        assert_eq!(
            last_error_line(stderr),
            Some("[mp4 @ 0x1] Could not open output")
        );
        assert_eq!(last_error_line("\n\n"), None);
    }
}
