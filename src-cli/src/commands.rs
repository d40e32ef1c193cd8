//! CLI command implementations.

use crate::colors;
use crate::exit_codes::ExitCode;
use crate::{CaptureArgs, ConfigAction, RecordOptions};
use camrec_common::config::{config_path, load_config, output_dir, save_config_to, AppConfig};
use camrec_common::{CaptureConfig, RecordingState, Shape, StopReason};
use camrec_service::capture::get_backend;
use camrec_service::encoder::generate_output_path;
use camrec_service::{
    save_png, CaptureBackend, EncoderReport, FfmpegWriterFactory, LatestFrame,
    RecordingCoordinator, RecordingError, RecordingOptions, SessionEvent, StateError,
    SyntheticBackend,
};
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// How long `snapshot` waits for the first frame.
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the encoder when tearing down after an interrupted run.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

fn new_coordinator(config: &AppConfig, synthetic: bool) -> RecordingCoordinator {
    let backend: Arc<dyn CaptureBackend> = if synthetic {
        Arc::new(SyntheticBackend::new())
    } else {
        get_backend()
    };
    RecordingCoordinator::new(
        backend,
        Arc::new(FfmpegWriterFactory::new()),
        RecordingOptions::from_defaults(&config.recording),
    )
}

/// Connect with the configured defaults, then apply the command-line overrides.
fn connect(
    coordinator: &RecordingCoordinator,
    config: &AppConfig,
    args: &CaptureArgs,
) -> Result<CaptureConfig, RecordingError> {
    let mut requested = config.capture.to_capture_config();
    if let Some(device) = args.device {
        requested.device_index = device;
    }
    coordinator.connect(&requested)?;

    if let Some(fps) = args.fps {
        coordinator.set_frame_rate(fps)?;
    }
    if let Some(gamma) = args.gamma {
        coordinator.set_gamma(gamma)?;
    }
    if let Some(brightness) = args.brightness {
        coordinator.set_brightness(brightness)?;
    }
    if let (Some(width), Some(height)) = (args.width, args.height) {
        coordinator.set_shape(Shape::new(width, height))?;
    }

    let effective = coordinator
        .config()
        .ok_or(RecordingError::State(StateError::NotConnected))?;
    debug!(?effective, "Camera configured");
    Ok(effective)
}

/// `<output dir>/recording_<timestamp>.mp4`, creating the directory.
fn default_output_path(config: &AppConfig) -> Result<PathBuf, String> {
    let dir = output_dir(config).ok_or_else(|| "could not determine output directory".to_string())?;
    std::fs::create_dir_all(&dir)
        .map_err(|e| format!("failed to create {}: {}", dir.display(), e))?;
    Ok(generate_output_path(&dir))
}

/// Ctrl+C handler body. The flag covers an interrupt that lands before the
/// session has started.
fn on_interrupt(interrupted: &AtomicBool, coordinator: &Weak<RecordingCoordinator>) {
    interrupted.store(true, Ordering::SeqCst);
    if let Some(coordinator) = coordinator.upgrade() {
        info!("Received Ctrl+C");
        if let Err(e) = coordinator.stop_recording() {
            debug!("Stop on Ctrl+C ignored: {}", e);
        }
    }
}

/// Stop a just-started session if Ctrl+C arrived while it was starting.
fn stop_if_interrupted(coordinator: &RecordingCoordinator, interrupted: &AtomicBool) {
    if interrupted.load(Ordering::SeqCst) {
        info!("Interrupted during start, stopping");
        if let Err(e) = coordinator.stop_recording() {
            debug!("Stop after interrupt ignored: {}", e);
        }
    }
}

fn print_error(quiet: bool, msg: &str) {
    if !quiet {
        eprintln!("{}", colors::error(msg));
    }
}

/// Record the camera until the deadline or Ctrl+C.
pub fn record(options: RecordOptions, json: bool, quiet: bool, synthetic: bool) -> ExitCode {
    let config = load_config();
    let coordinator = Arc::new(new_coordinator(&config, synthetic));

    let effective = match connect(&coordinator, &config, &options.capture) {
        Ok(effective) => effective,
        Err(e) => {
            print_error(quiet, &e.to_string());
            return ExitCode::for_start_error(&e);
        }
    };

    let requested_path = match options.output {
        Some(path) => PathBuf::from(path),
        None => match default_output_path(&config) {
            Ok(path) => path,
            Err(e) => {
                print_error(quiet, &e);
                return ExitCode::RecordingFailedToStart;
            }
        },
    };
    let duration_secs = options.duration.unwrap_or(config.recording.duration_secs);

    // Installed before the session starts so the writer is never killed mid-stream.
    // The handler only holds a weak reference so the coordinator still drops normally.
    let interrupted = Arc::new(AtomicBool::new(false));
    let weak = Arc::downgrade(&coordinator);
    let flag = Arc::clone(&interrupted);
    if let Err(e) = ctrlc::set_handler(move || on_interrupt(&flag, &weak)) {
        warn!("Failed to install Ctrl+C handler: {}", e);
    }

    let mut events = coordinator.subscribe_events();
    let path = match coordinator.start_recording(&requested_path, duration_secs) {
        Ok(path) => path,
        Err(e) => {
            print_error(quiet, &e.to_string());
            return ExitCode::for_start_error(&e);
        }
    };
    stop_if_interrupted(&coordinator, &interrupted);

    if !quiet && !json {
        if path != requested_path {
            eprintln!(
                "{}",
                colors::warning(&format!(
                    "unsupported extension, writing {} instead",
                    path.display()
                ))
            );
        }
        println!(
            "{} {} {}",
            colors::recording("Recording"),
            colors::path(&path.display().to_string()),
            colors::dim(&format!(
                "({}s at {} fps, {})",
                duration_secs, effective.actual_frame_rate, effective.shape
            ))
        );
    }

    let mut stop_reason: Option<StopReason> = None;
    let mut elapsed = Duration::ZERO;
    let outcome = loop {
        match events.blocking_recv() {
            Ok(SessionEvent::Progress {
                elapsed: now,
                duration,
                ..
            }) => {
                if !quiet && !json {
                    print!(
                        "\r{} {} / {}",
                        colors::recording("Recording:"),
                        colors::elapsed_time(now),
                        colors::dim(&format!("{:.1}s", duration.as_secs_f64()))
                    );
                    std::io::stdout().flush().ok();
                }
            }
            Ok(SessionEvent::TimerStopped {
                reason,
                elapsed: total,
                ..
            }) => {
                stop_reason = Some(reason);
                elapsed = total;
                if !quiet && !json {
                    let msg = match reason {
                        StopReason::Deadline => "duration reached, closing file...",
                        StopReason::Manual => "stop requested, closing file...",
                    };
                    println!(
                        "\n{} {}",
                        colors::state(RecordingState::Finishing.as_str()),
                        colors::info(msg)
                    );
                }
            }
            Ok(SessionEvent::RecordingStopped {
                report,
                frames_enqueued,
                ..
            }) => break Some((report, frames_enqueued)),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "Event receiver lagged"),
            Err(RecvError::Closed) => break None,
        }
    };

    coordinator.shutdown(SHUTDOWN_TIMEOUT);

    let Some((report, frames_enqueued)) = outcome else {
        print_error(quiet, "recording ended without a result");
        return ExitCode::RecordingFailedDuringCapture;
    };

    if json {
        let status = if report.is_success() {
            "recording_stopped"
        } else {
            "recording_failed"
        };
        println!(
            "{}",
            json!({
                "status": status,
                "file_path": report.path,
                "codec": report.codec,
                "frame_rate": effective.actual_frame_rate,
                "width": effective.shape.width,
                "height": effective.shape.height,
                "frames_enqueued": frames_enqueued,
                "frames_written": report.frames_written,
                "frames_rejected": report.frames_rejected,
                "frames_dropped": report.frames_dropped,
                "stop_reason": stop_reason,
                "elapsed_secs": elapsed.as_secs_f64(),
                "error": report.error,
            })
        );
    } else if !quiet {
        print_report(&report, frames_enqueued);
    }

    if report.is_success() {
        ExitCode::Success
    } else {
        ExitCode::RecordingFailedDuringCapture
    }
}

fn print_report(report: &EncoderReport, frames_enqueued: u64) {
    match &report.error {
        None => println!(
            "{} {}",
            colors::success("Recording saved:"),
            colors::path(&report.path.display().to_string())
        ),
        Some(error) => eprintln!(
            "{}",
            colors::error(&format!("{}: {}", report.path.display(), error))
        ),
    }
    println!(
        "  {} frames written ({} enqueued, {})",
        colors::number(&report.frames_written.to_string()),
        frames_enqueued,
        report.codec
    );
    if report.frames_rejected > 0 {
        println!(
            "  {}",
            colors::warning(&format!(
                "{} frames rejected for size mismatch",
                report.frames_rejected
            ))
        );
    }
    if report.frames_dropped > 0 {
        println!(
            "  {}",
            colors::warning(&format!("{} frames dropped after a write error", report.frames_dropped))
        );
    }
}

/// Open the camera and print the settings it accepted.
pub fn probe(args: &CaptureArgs, json: bool, quiet: bool, synthetic: bool) -> ExitCode {
    let config = load_config();
    let coordinator = new_coordinator(&config, synthetic);

    let effective = match connect(&coordinator, &config, args) {
        Ok(effective) => effective,
        Err(e) => {
            print_error(quiet, &e.to_string());
            return ExitCode::for_start_error(&e);
        }
    };
    let backend = coordinator
        .source()
        .map(|source| source.backend_name())
        .unwrap_or("unknown");
    coordinator.shutdown(SHUTDOWN_TIMEOUT);

    if json {
        println!(
            "{}",
            json!({
                "backend": backend,
                "device_index": effective.device_index,
                "target_frame_rate": effective.target_frame_rate,
                "actual_frame_rate": effective.actual_frame_rate,
                "gamma": effective.gamma,
                "brightness": effective.brightness,
                "width": effective.shape.width,
                "height": effective.shape.height,
            })
        );
        return ExitCode::Success;
    }

    let rows = [
        ("backend", backend.to_string()),
        ("device", effective.device_index.to_string()),
        ("target fps", effective.target_frame_rate.to_string()),
        ("actual fps", effective.actual_frame_rate.to_string()),
        ("gamma", effective.gamma.to_string()),
        ("brightness", effective.brightness.to_string()),
        ("size", effective.shape.to_string()),
    ];
    let width = rows.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
    for (name, value) in rows {
        println!(
            "{}  {}",
            colors::pad_left(name, width, colors::header),
            colors::number(&value)
        );
    }
    if effective.actual_frame_rate != effective.target_frame_rate && !quiet {
        eprintln!(
            "{}",
            colors::warning("device did not accept the requested frame rate")
        );
    }
    ExitCode::Success
}

/// Save one frame from the camera as PNG.
pub fn snapshot(
    output: &str,
    args: &CaptureArgs,
    json: bool,
    quiet: bool,
    synthetic: bool,
) -> ExitCode {
    let config = load_config();
    let coordinator = new_coordinator(&config, synthetic);

    if let Err(e) = connect(&coordinator, &config, args) {
        print_error(quiet, &e.to_string());
        return ExitCode::for_start_error(&e);
    }

    let latest = LatestFrame::new();
    let subscription = match coordinator.subscribe_frames(latest.callback()) {
        Ok(id) => id,
        Err(e) => {
            print_error(quiet, &e.to_string());
            return ExitCode::DeviceFailed;
        }
    };
    let frame = latest.wait_for_frame(None, SNAPSHOT_TIMEOUT);
    coordinator.unsubscribe_frames(subscription);
    coordinator.shutdown(SHUTDOWN_TIMEOUT);

    let Some(frame) = frame else {
        print_error(
            quiet,
            &format!("no frame received within {}s", SNAPSHOT_TIMEOUT.as_secs()),
        );
        return ExitCode::DeviceFailed;
    };

    let path = Path::new(output);
    if let Err(e) = save_png(&frame, path) {
        print_error(quiet, &e.to_string());
        return ExitCode::GeneralError;
    }

    if json {
        println!(
            "{}",
            json!({
                "status": "saved",
                "file_path": path,
                "width": frame.width(),
                "height": frame.height(),
                "sequence": frame.sequence(),
            })
        );
    } else if !quiet {
        println!(
            "{} {} {}",
            colors::success("Snapshot saved:"),
            colors::path(&path.display().to_string()),
            colors::dim(&format!("({}x{})", frame.width(), frame.height()))
        );
    }
    ExitCode::Success
}

/// `config show | path | init`.
pub fn config(action: ConfigAction, json: bool, quiet: bool) -> ExitCode {
    match action {
        ConfigAction::Show => {
            let config = load_config();
            match serde_json::to_string_pretty(&config) {
                Ok(text) => {
                    println!("{}", text);
                    ExitCode::Success
                }
                Err(e) => {
                    print_error(quiet, &e.to_string());
                    ExitCode::GeneralError
                }
            }
        }
        ConfigAction::Path => match config_path() {
            Ok(path) => {
                if json {
                    println!("{}", json!({ "path": path, "exists": path.exists() }));
                } else {
                    println!("{}", path.display());
                }
                ExitCode::Success
            }
            Err(e) => {
                print_error(quiet, &e.to_string());
                ExitCode::ConfigError
            }
        },
        ConfigAction::Init { force } => init_config(force, json, quiet),
    }
}

fn init_config(force: bool, json: bool, quiet: bool) -> ExitCode {
    let path = match config_path() {
        Ok(path) => path,
        Err(e) => {
            print_error(quiet, &e.to_string());
            return ExitCode::ConfigError;
        }
    };
    if path.exists() && !force {
        print_error(
            quiet,
            &format!("{} already exists (use --force to overwrite)", path.display()),
        );
        return ExitCode::ConfigError;
    }

    match save_config_to(&AppConfig::default(), &path) {
        Ok(()) => {
            if json {
                println!("{}", json!({ "status": "created", "path": path }));
            } else if !quiet {
                println!(
                    "{} {}",
                    colors::success("Wrote default config:"),
                    colors::path(&path.display().to_string())
                );
            }
            ExitCode::Success
        }
        Err(e) => {
            print_error(quiet, &e.to_string());
            ExitCode::ConfigError
        }
    }
}

/// Show version information.
pub fn version(json: bool) {
    let version = env!("CARGO_PKG_VERSION");
    if json {
        println!("{}", json!({ "version": version }));
    } else {
        println!("{} {}", colors::bold("camrec"), version);
    }
}
