//! Platform camera access through an ffmpeg child process.
//!
//! ffmpeg reads the camera (`v4l2` on Linux, `avfoundation` on macOS) and
//! writes packed `rgb24` frames to stdout, which `ffmpeg-sidecar` splits into
//! frames for us. Gamma and brightness go through ffmpeg's `eq` filter, so
//! changing any property restarts the child with new arguments.

use super::{CaptureBackend, CaptureDevice, DeviceProperty, PixelFormat, RawFrame};
use crate::error::DeviceError;
use crate::ffmpeg::{ensure_ffmpeg, new_ffmpeg_command};
use camrec_common::CaptureConfig;
use ffmpeg_sidecar::child::FfmpegChild;
use ffmpeg_sidecar::event::FfmpegEvent;
use ffmpeg_sidecar::iter::FfmpegIterator;
use tracing::{debug, info, warn};

/// Camera backend that spawns ffmpeg per open device.
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> Self {
        Self
    }
}

impl CaptureBackend for FfmpegBackend {
    fn open(&self, config: &CaptureConfig) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        ensure_ffmpeg().map_err(DeviceError::FfmpegUnavailable)?;

        let settings = DeviceSettings::from_config(config);
        // Reject unsupported platforms before spawning anything.
        input_args(&settings)?;

        let mut device = FfmpegDevice {
            settings,
            stream: None,
            reported: None,
        };
        device.spawn().map_err(|reason| DeviceError::Open {
            index: config.device_index,
            reason,
        })?;
        Ok(Box::new(device))
    }

    fn name(&self) -> &'static str {
        "ffmpeg"
    }
}

/// Requested camera parameters, turned into ffmpeg arguments on every spawn.
#[derive(Debug, Clone, PartialEq)]
struct DeviceSettings {
    index: u32,
    fps: f64,
    width: u32,
    height: u32,
    gamma: f64,
    brightness: f64,
}

impl DeviceSettings {
    fn from_config(config: &CaptureConfig) -> Self {
        Self {
            index: config.device_index,
            fps: config.target_frame_rate,
            width: config.shape.width,
            height: config.shape.height,
            gamma: config.gamma,
            brightness: config.brightness,
        }
    }

    fn set(&mut self, property: DeviceProperty, value: f64) {
        match property {
            DeviceProperty::Gamma => self.gamma = value,
            DeviceProperty::Brightness => self.brightness = value,
            DeviceProperty::FrameWidth => self.width = value as u32,
            DeviceProperty::FrameHeight => self.height = value as u32,
            DeviceProperty::FrameRate => self.fps = value,
        }
    }
}

/// What the input stream turned out to be.
#[derive(Debug, Clone, Copy)]
struct ReportedStream {
    width: u32,
    height: u32,
    fps: f64,
}

struct RunningStream {
    child: FfmpegChild,
    events: FfmpegIterator,
}

/// A camera opened through ffmpeg.
pub struct FfmpegDevice {
    settings: DeviceSettings,
    stream: Option<RunningStream>,
    reported: Option<ReportedStream>,
}

impl FfmpegDevice {
    /// Start ffmpeg with the current settings and wait until it reports the
    /// input stream.
    fn spawn(&mut self) -> Result<(), String> {
        let mut args = input_args(&self.settings).map_err(|e| e.to_string())?;
        if let Some(filter) = eq_filter(&self.settings) {
            args.push("-vf".to_string());
            args.push(filter);
        }
        args.extend(
            ["-an", "-f", "rawvideo", "-pix_fmt", "rgb24", "-"]
                .iter()
                .map(|s| s.to_string()),
        );
        debug!("Spawning ffmpeg camera reader: {}", args.join(" "));

        let mut command = new_ffmpeg_command();
        command.args(&args);
        let mut child = command
            .spawn()
            .map_err(|e| format!("failed to start ffmpeg: {}", e))?;
        let mut events = child
            .iter()
            .map_err(|e| format!("failed to read ffmpeg output: {}", e))?;

        let mut last_error = None;
        let reported = loop {
            match events.next() {
                Some(FfmpegEvent::ParsedInputStream(stream)) => {
                    if let Some(video) = stream.video_data() {
                        break ReportedStream {
                            width: video.width,
                            height: video.height,
                            fps: video.fps as f64,
                        };
                    }
                }
                Some(FfmpegEvent::Error(message)) => last_error = Some(message),
                Some(FfmpegEvent::Done) | None => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(last_error
                        .unwrap_or_else(|| "ffmpeg exited before reporting a video stream".into()));
                }
                Some(_) => {}
            }
        };

        if reported.fps <= 0.0 {
            warn!(
                "Camera did not report a frame rate, assuming requested {} fps",
                self.settings.fps
            );
        }
        info!(
            "Camera {} streaming {}x{} @ {} fps",
            self.settings.index, reported.width, reported.height, reported.fps
        );

        self.reported = Some(reported);
        self.stream = Some(RunningStream { child, events });
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.child.kill() {
                debug!("ffmpeg already exited: {}", e);
            }
            let _ = stream.child.wait();
        }
    }
}

impl CaptureDevice for FfmpegDevice {
    fn read_frame(&mut self) -> Result<RawFrame, DeviceError> {
        let stream = self.stream.as_mut().ok_or(DeviceError::Released)?;

        let mut last_error = None;
        for event in stream.events.by_ref() {
            match event {
                FfmpegEvent::OutputFrame(frame) => {
                    return Ok(RawFrame::packed(
                        frame.width,
                        frame.height,
                        PixelFormat::Rgb24,
                        frame.data,
                    ));
                }
                FfmpegEvent::Error(message) => {
                    debug!("ffmpeg: {}", message);
                    last_error = Some(message);
                }
                FfmpegEvent::Done => break,
                _ => {}
            }
        }

        Err(DeviceError::Read(
            last_error.unwrap_or_else(|| "camera stream ended".to_string()),
        ))
    }

    fn get(&self, property: DeviceProperty) -> Result<f64, DeviceError> {
        let reported = self.reported.ok_or(DeviceError::Released)?;
        Ok(match property {
            DeviceProperty::Gamma => self.settings.gamma,
            DeviceProperty::Brightness => self.settings.brightness,
            DeviceProperty::FrameWidth => reported.width as f64,
            DeviceProperty::FrameHeight => reported.height as f64,
            DeviceProperty::FrameRate if reported.fps > 0.0 => reported.fps,
            DeviceProperty::FrameRate => self.settings.fps,
        })
    }

    fn set(&mut self, property: DeviceProperty, value: f64) -> Result<(), DeviceError> {
        self.set_many(&[(property, value)])
    }

    fn set_many(&mut self, values: &[(DeviceProperty, f64)]) -> Result<(), DeviceError> {
        if self.stream.is_none() {
            return Err(DeviceError::Released);
        }

        let previous = self.settings.clone();
        for &(property, value) in values {
            self.settings.set(property, value);
        }
        if self.settings == previous {
            return Ok(());
        }

        self.shutdown();
        if let Err(reason) = self.spawn() {
            let (property, value) = values
                .first()
                .map(|&(p, v)| (p.to_string(), v))
                .unwrap_or_default();
            warn!("Camera rejected new settings, restoring previous: {}", reason);
            self.settings = previous;
            if let Err(e) = self.spawn() {
                warn!("Failed to restart camera with previous settings: {}", e);
            }
            return Err(DeviceError::Property {
                property,
                value,
                reason,
            });
        }
        Ok(())
    }

    fn release(&mut self) {
        self.shutdown();
        self.reported = None;
    }

    fn description(&self) -> String {
        format!("ffmpeg camera {}", self.settings.index)
    }
}

impl Drop for FfmpegDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(target_os = "linux")]
fn input_args(settings: &DeviceSettings) -> Result<Vec<String>, DeviceError> {
    Ok(vec![
        "-f".into(),
        "v4l2".into(),
        "-framerate".into(),
        format_rate(settings.fps),
        "-video_size".into(),
        format!("{}x{}", settings.width, settings.height),
        "-i".into(),
        format!("/dev/video{}", settings.index),
    ])
}

#[cfg(target_os = "macos")]
fn input_args(settings: &DeviceSettings) -> Result<Vec<String>, DeviceError> {
    Ok(vec![
        "-f".into(),
        "avfoundation".into(),
        "-framerate".into(),
        format_rate(settings.fps),
        "-video_size".into(),
        format!("{}x{}", settings.width, settings.height),
        "-i".into(),
        format!("{}:none", settings.index),
    ])
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn input_args(_settings: &DeviceSettings) -> Result<Vec<String>, DeviceError> {
    Err(DeviceError::Unsupported)
}

fn format_rate(fps: f64) -> String {
    if fps.fract() == 0.0 {
        format!("{}", fps as u64)
    } else {
        format!("{:.3}", fps)
    }
}

/// `eq` filter for gamma and brightness, or `None` when both are neutral.
///
/// Brightness is an offset in 8-bit levels and maps onto `eq`'s `[-1, 1]` range.
fn eq_filter(settings: &DeviceSettings) -> Option<String> {
    if settings.gamma == 1.0 && settings.brightness == 0.0 {
        return None;
    }
    let gamma = settings.gamma.clamp(0.1, 10.0);
    let brightness = (settings.brightness / 255.0).clamp(-1.0, 1.0);
    Some(format!("eq=gamma={:.3}:brightness={:.3}", gamma, brightness))
}
