//! Video writer piping raw grayscale frames into ffmpeg.

use super::{OutputTarget, VideoWriter, WriterFactory};
use crate::error::FileError;
use crate::ffmpeg::{ensure_ffmpeg, last_error_line, new_ffmpeg_command};
use crate::frame::Frame;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Fixed quantizer for MPEG-4 Part 2 (2 is best, 31 is worst).
const MPEG4_QUALITY: &str = "5";

/// Opens [`FfmpegWriter`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegWriterFactory;

impl FfmpegWriterFactory {
    pub fn new() -> Self {
        Self
    }
}

impl WriterFactory for FfmpegWriterFactory {
    fn open(&self, target: &OutputTarget) -> Result<Box<dyn VideoWriter>, FileError> {
        let open_error = |reason: String| FileError::Open {
            path: target.path.clone(),
            reason,
        };

        if target.shape.is_empty() {
            return Err(open_error(format!("invalid frame size {}", target.shape)));
        }
        if !target.frame_rate.is_finite() || target.frame_rate <= 0.0 {
            return Err(open_error(format!("invalid frame rate {}", target.frame_rate)));
        }
        check_writable(&target.path).map_err(open_error)?;
        ensure_ffmpeg().map_err(FileError::FfmpegUnavailable)?;

        FfmpegWriter::start(target).map(|w| Box::new(w) as Box<dyn VideoWriter>)
    }
}

/// The output directory must exist and the file must be creatable.
fn check_writable(path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.is_dir() {
            return Err(format!("directory {} does not exist", parent.display()));
        }
    }
    File::create(path).map(|_| ()).map_err(|e| e.to_string())
}

/// Arguments for encoding `target` from raw gray frames on stdin.
fn encode_args(target: &OutputTarget) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        // Input: raw 8-bit gray frames from stdin
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "gray".into(),
        "-s".into(),
        target.shape.to_string(),
        "-r".into(),
        format!("{}", target.frame_rate),
        "-i".into(),
        "-".into(),
    ];

    // yuv420p needs even dimensions
    if target.shape.width % 2 != 0 || target.shape.height % 2 != 0 {
        args.push("-vf".into());
        args.push("pad=ceil(iw/2)*2:ceil(ih/2)*2".into());
    }

    args.extend([
        "-c:v".into(),
        "mpeg4".into(),
        "-vtag".into(),
        target.codec.fourcc().into(),
        "-q:v".into(),
        MPEG4_QUALITY.into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-y".into(),
        target.path.to_string_lossy().to_string(),
    ]);
    args
}

/// A running ffmpeg process encoding one output file.
pub struct FfmpegWriter {
    path: PathBuf,
    stdin: Option<ChildStdin>,
    child: Option<Child>,
    stderr: Arc<Mutex<String>>,
    stderr_reader: Option<JoinHandle<()>>,
    buffer: Vec<u8>,
}

impl FfmpegWriter {
    fn start(target: &OutputTarget) -> Result<Self, FileError> {
        let args = encode_args(target);
        debug!("Spawning ffmpeg encoder: {}", args.join(" "));

        let mut command = new_ffmpeg_command();
        command.args(&args);

        let inner_command = command.as_inner_mut();
        inner_command.stdin(Stdio::piped());
        inner_command.stdout(Stdio::null());
        inner_command.stderr(Stdio::piped());

        let mut child = inner_command.spawn().map_err(|e| FileError::Open {
            path: target.path.clone(),
            reason: format!("failed to start ffmpeg: {}", e),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| FileError::Open {
            path: target.path.clone(),
            reason: "failed to get ffmpeg stdin".to_string(),
        })?;

        let stderr = Arc::new(Mutex::new(String::new()));
        let stderr_reader = child.stderr.take().and_then(|pipe| {
            let sink = Arc::clone(&stderr);
            std::thread::Builder::new()
                .name("camrec-ffmpeg-stderr".to_string())
                .spawn(move || {
                    for line in BufReader::new(pipe).lines().map_while(Result::ok) {
                        debug!("[ffmpeg] {}", line);
                        let mut buf = sink.lock().unwrap_or_else(|e| e.into_inner());
                        buf.push_str(&line);
                        buf.push('\n');
                    }
                })
                .map_err(|e| warn!("Failed to spawn ffmpeg stderr reader: {}", e))
                .ok()
        });

        Ok(Self {
            path: target.path.clone(),
            stdin: Some(stdin),
            child: Some(child),
            stderr,
            stderr_reader,
            buffer: Vec::with_capacity(target.shape.pixel_count()),
        })
    }

    fn stderr_tail(&self) -> Option<String> {
        let stderr = self.stderr.lock().unwrap_or_else(|e| e.into_inner());
        last_error_line(&stderr).map(str::to_string)
    }
}

impl VideoWriter for FfmpegWriter {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), FileError> {
        let stdin = self.stdin.as_mut().ok_or_else(|| FileError::Write {
            path: self.path.clone(),
            reason: "encoder already finished".to_string(),
        })?;

        let result = match frame.as_bytes() {
            Some(bytes) => stdin.write_all(bytes),
            None => {
                self.buffer.clear();
                self.buffer.extend(frame.pixels().iter().copied());
                stdin.write_all(&self.buffer)
            }
        };

        result.map_err(|e| {
            let reason = self
                .stderr_tail()
                .map(|tail| format!("{} ({})", e, tail))
                .unwrap_or_else(|| e.to_string());
            FileError::Write {
                path: self.path.clone(),
                reason,
            }
        })
    }

    fn finish(mut self: Box<Self>) -> Result<(), FileError> {
        // Closing stdin signals end of input.
        drop(self.stdin.take());

        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait().map_err(|e| FileError::Finish {
            path: self.path.clone(),
            reason: format!("ffmpeg process error: {}", e),
        })?;
        if let Some(reader) = self.stderr_reader.take() {
            let _ = reader.join();
        }

        if !status.success() {
            let reason = self
                .stderr_tail()
                .unwrap_or_else(|| format!("ffmpeg exited with code {:?}", status.code()));
            return Err(FileError::Finish {
                path: self.path.clone(),
                reason,
            });
        }

        debug!("Finalized {}", self.path.display());
        Ok(())
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
