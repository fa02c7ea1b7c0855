//! Application configuration loaded from TOML.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::controller::ControllerOptions;
use crate::settings::{
    CameraSettings, CaptureSettings, PreviewGeometry, RecordingSettings, TimelapseSettings,
};

/// Error loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// File attempted.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Preview section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreviewConfig {
    /// Whether the preview starts visible.
    pub enabled: bool,
    /// Left edge in screen pixels.
    pub x: i32,
    /// Top edge in screen pixels.
    pub y: i32,
    /// Width in screen pixels.
    pub width: u32,
    /// Height in screen pixels.
    pub height: u32,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        let geometry = PreviewGeometry::default();
        Self {
            enabled: true,
            x: geometry.x,
            y: geometry.y,
            width: geometry.width,
            height: geometry.height,
        }
    }
}

impl PreviewConfig {
    /// Window placement.
    pub const fn geometry(&self) -> PreviewGeometry {
        PreviewGeometry {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
        }
    }
}

/// Top-level configuration file.
///
/// ```toml
/// device = 0
/// video_width = 1024
/// video_height = 768
///
/// [preview]
/// enabled = true
/// width = 640
/// height = 480
///
/// [timelapse]
/// step_ms = 5000
/// limit = { frames = 120 }
///
/// [recording]
/// output = "video.raw"
/// frames = 300
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// V4L2 device index (`/dev/videoN`).
    pub device: u32,
    /// Number of mmap buffers requested from the driver.
    pub buffer_count: u32,
    /// Live video width in pixels.
    pub video_width: u32,
    /// Live video height in pixels.
    pub video_height: u32,
    /// Preview window.
    pub preview: PreviewConfig,
    /// Image settings.
    pub camera: CameraSettings,
    /// Still capture settings.
    pub capture: CaptureSettings,
    /// Timelapse settings.
    pub timelapse: TimelapseSettings,
    /// Raw video recording, disabled when absent.
    pub recording: Option<RecordingSettings>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device: 0,
            buffer_count: 4,
            video_width: 1024,
            video_height: 768,
            preview: PreviewConfig::default(),
            camera: CameraSettings::default(),
            capture: CaptureSettings::default(),
            timelapse: TimelapseSettings::default(),
            recording: None,
        }
    }
}

impl AppConfig {
    /// Read, parse and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn nonzero(name: &str, width: u32, height: u32) -> Result<(), ConfigError> {
            if width == 0 || height == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} size must be non-zero, got {width}x{height}"
                )));
            }
            Ok(())
        }

        nonzero("video", self.video_width, self.video_height)?;
        nonzero("capture", self.capture.width, self.capture.height)?;
        nonzero("timelapse", self.timelapse.width, self.timelapse.height)?;
        nonzero("preview", self.preview.width, self.preview.height)?;

        if self.buffer_count == 0 {
            return Err(ConfigError::Invalid("buffer_count must be at least 1".to_owned()));
        }
        if self.timelapse.step.is_zero() {
            return Err(ConfigError::Invalid("timelapse step_ms must be positive".to_owned()));
        }
        if !self.camera.zoom.is_valid() {
            return Err(ConfigError::Invalid(format!(
                "zoom {} with pan {},{} leaves the frame",
                self.camera.zoom.zoom, self.camera.zoom.pan_h, self.camera.zoom.pan_v
            )));
        }
        if !(-1.0..=1.0).contains(&self.camera.brightness) {
            return Err(ConfigError::Invalid(format!(
                "brightness {} outside -1.0..=1.0",
                self.camera.brightness
            )));
        }
        if let Some(recording) = &self.recording {
            if recording.frames == 0 {
                return Err(ConfigError::Invalid(
                    "recording frames must be at least 1".to_owned(),
                ));
            }
        }
        Ok(())
    }
}

impl From<&AppConfig> for ControllerOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            video_width: config.video_width,
            video_height: config.video_height,
            preview: config.preview.enabled,
            preview_geometry: config.preview.geometry(),
            camera: config.camera.clone(),
            capture: config.capture.clone(),
            timelapse: config.timelapse.clone(),
            recording: config.recording.clone(),
        }
    }
}
