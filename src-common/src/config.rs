//! Configuration management for camrec.
//!
//! Handles loading and saving user configuration to platform-standard config directories:
//! - Linux: `~/.config/camrec/config.json`
//! - macOS: `~/Library/Application Support/camrec/config.json`
//! - Windows: `%APPDATA%\camrec\config.json`

use crate::types::{CaptureConfig, Shape};
use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Error type for configuration persistence.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine config directory")]
    NoConfigDir,
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Camera defaults applied on connect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureDefaults {
    /// Device index to open
    #[serde(default)]
    pub device_index: u32,
    /// Requested frame rate
    #[serde(default = "default_frame_rate")]
    pub frame_rate: f64,
    /// Gamma correction
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    /// Brightness offset
    #[serde(default)]
    pub brightness: f64,
    /// Frame width in pixels
    #[serde(default = "default_width")]
    pub width: u32,
    /// Frame height in pixels
    #[serde(default = "default_height")]
    pub height: u32,
}

fn default_frame_rate() -> f64 {
    30.0
}

fn default_gamma() -> f64 {
    1.0
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

impl Default for CaptureDefaults {
    fn default() -> Self {
        Self {
            device_index: 0,
            frame_rate: default_frame_rate(),
            gamma: default_gamma(),
            brightness: 0.0,
            width: default_width(),
            height: default_height(),
        }
    }
}

impl CaptureDefaults {
    /// Requested capture parameters; the actual rate starts equal to the target
    /// until the device reports otherwise.
    pub fn to_capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            device_index: self.device_index,
            target_frame_rate: self.frame_rate,
            actual_frame_rate: self.frame_rate,
            gamma: self.gamma,
            brightness: self.brightness,
            shape: Shape::new(self.width, self.height),
        }
    }
}

/// Recording session defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordingDefaults {
    /// Session duration when none is given
    #[serde(default = "default_duration_secs")]
    pub duration_secs: f64,
    /// Encoder queue capacity in frames. `None` means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,
    /// Session timer poll interval
    #[serde(default = "default_tick_ms")]
    pub timer_tick_ms: u64,
    /// Emit a progress notification every this many timer ticks
    #[serde(default = "default_progress_every")]
    pub progress_every_ticks: u32,
}

fn default_duration_secs() -> f64 {
    10.0
}

fn default_tick_ms() -> u64 {
    10
}

fn default_progress_every() -> u32 {
    10
}

impl Default for RecordingDefaults {
    fn default() -> Self {
        Self {
            duration_secs: default_duration_secs(),
            queue_capacity: None,
            timer_tick_ms: default_tick_ms(),
            progress_every_ticks: default_progress_every(),
        }
    }
}

/// Output-related configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct OutputConfig {
    /// Custom output directory. If None, uses system default (Videos folder).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AppConfig {
    /// Camera settings group.
    #[serde(default)]
    pub capture: CaptureDefaults,
    /// Recording settings group.
    #[serde(default)]
    pub recording: RecordingDefaults,
    /// Output settings group.
    #[serde(default)]
    pub output: OutputConfig,
}

/// Get the path to the config file.
pub fn config_path() -> Result<PathBuf, ConfigError> {
    let proj_dirs = ProjectDirs::from("", "", "camrec").ok_or(ConfigError::NoConfigDir)?;
    Ok(proj_dirs.config_dir().join("config.json"))
}

/// Load configuration from the platform config directory.
/// Returns default config if the file doesn't exist or is invalid.
pub fn load_config() -> AppConfig {
    match config_path() {
        Ok(path) => load_config_from(&path),
        Err(e) => {
            warn!("Failed to get config path: {}", e);
            AppConfig::default()
        }
    }
}

/// Load configuration from an explicit path, falling back to defaults.
pub fn load_config_from(path: &Path) -> AppConfig {
    if !path.exists() {
        debug!("No config file at {:?}, using defaults", path);
        return AppConfig::default();
    }

    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!("Failed to read config file {:?}: {}. Using defaults.", path, e);
            return AppConfig::default();
        }
    };

    match serde_json::from_str::<AppConfig>(&contents) {
        Ok(config) => {
            info!("Loaded config from {:?}", path);
            config
        }
        Err(e) => {
            warn!("Failed to parse config file {:?}: {}. Using defaults.", path, e);
            AppConfig::default()
        }
    }
}

/// Save configuration to the platform config directory.
pub fn save_config(config: &AppConfig) -> Result<PathBuf, ConfigError> {
    let path = config_path()?;
    save_config_to(config, &path)?;
    Ok(path)
}

/// Save configuration to an explicit path, creating parent directories.
pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    info!("Saved config to {:?}", path);
    Ok(())
}

/// Get the default output directory: `<Videos>/camrec`, or `<home>/camrec`
/// when the platform has no Videos folder.
pub fn default_output_dir() -> Option<PathBuf> {
    let user_dirs = UserDirs::new()?;
    let base = user_dirs
        .video_dir()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| user_dirs.home_dir().to_path_buf());
    Some(base.join("camrec"))
}

/// Resolve the output directory from config, falling back to the platform default.
pub fn output_dir(config: &AppConfig) -> Option<PathBuf> {
    match &config.output.directory {
        Some(dir) if !dir.trim().is_empty() => Some(PathBuf::from(dir)),
        _ => default_output_dir(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config_from(&dir.path().join("absent.json"));
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"capture":{"frame_rate":60.0},"recording":{"queue_capacity":120}}"#)
            .unwrap();

        let config = load_config_from(&path);
        assert_eq!(config.capture.frame_rate, 60.0);
        assert_eq!(config.capture.width, 640);
        assert_eq!(config.recording.queue_capacity, Some(120));
        assert_eq!(config.recording.timer_tick_ms, 10);
        assert!(config.output.directory.is_none());
    }

    #[test]
    fn invalid_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_config_from(&path), AppConfig::default());
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = AppConfig::default();
        config.capture.gamma = 2.2;
        config.output.directory = Some("/tmp/clips".to_string());
        save_config_to(&config, &path).unwrap();

        assert_eq!(load_config_from(&path), config);
    }

    #[test]
    fn output_dir_prefers_configured_directory() {
        let mut config = AppConfig::default();
        config.output.directory = Some("/data/videos".to_string());
        assert_eq!(output_dir(&config), Some(PathBuf::from("/data/videos")));
    }

    #[test]
    fn capture_defaults_convert_to_config() {
        let defaults = CaptureDefaults {
            frame_rate: 15.0,
            width: 320,
            height: 240,
            ..CaptureDefaults::default()
        };
        let config = defaults.to_capture_config();
        assert_eq!(config.shape, Shape::new(320, 240));
        assert_eq!(config.target_frame_rate, 15.0);
        assert_eq!(config.actual_frame_rate, 15.0);
    }
}
