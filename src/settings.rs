//! Camera, capture and timelapse settings shared by the controller and its front ends.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Output encoding for still images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageFormat {
    /// JPEG (`.jpg`).
    #[default]
    #[serde(rename = "jpg", alias = "jpeg")]
    Jpeg,
    /// PNG (`.png`).
    #[serde(rename = "png")]
    Png,
}

impl ImageFormat {
    /// File extension without the dot.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
        }
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Exposure profile understood by libcamera-apps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposureMode {
    /// Default profile.
    #[default]
    Normal,
    /// Shorter exposures for moving subjects.
    Sport,
    /// Short exposure.
    Short,
    /// Long exposure.
    Long,
    /// Tuning-file defined profile.
    Custom,
}

impl ExposureMode {
    /// Name as written to libcamera-app config files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Sport => "sport",
            Self::Short => "short",
            Self::Long => "long",
            Self::Custom => "custom",
        }
    }
}

/// Metering mode understood by libcamera-apps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeteringMode {
    /// Centre-weighted.
    #[default]
    Centre,
    /// Spot.
    Spot,
    /// Whole-frame average.
    Average,
    /// Matrix.
    Matrix,
    /// Tuning-file defined mode.
    Custom,
}

impl MeteringMode {
    /// Name as written to libcamera-app config files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Centre => "centre",
            Self::Spot => "spot",
            Self::Average => "average",
            Self::Matrix => "matrix",
            Self::Custom => "custom",
        }
    }
}

/// Image flips applied by the sensor pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transform {
    /// Mirror left/right.
    pub hflip: bool,
    /// Mirror top/bottom.
    pub vflip: bool,
}

/// Normalized sensor crop rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Roi {
    /// Left edge, 0.0 to 1.0.
    pub x: f64,
    /// Top edge, 0.0 to 1.0.
    pub y: f64,
    /// Width, 0.0 to 1.0.
    pub width: f64,
    /// Height, 0.0 to 1.0.
    pub height: f64,
}

impl Default for Roi {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 1.0,
            height: 1.0,
        }
    }
}

/// Zoom factor plus pan offsets relative to the frame centre.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ZoomPan {
    /// Fraction of the sensor kept, 1.0 shows the full frame.
    pub zoom: f64,
    /// Horizontal offset of the crop centre.
    pub pan_h: f64,
    /// Vertical offset of the crop centre.
    pub pan_v: f64,
}

impl Default for ZoomPan {
    fn default() -> Self {
        Self {
            zoom: 1.0,
            pan_h: 0.0,
            pan_v: 0.0,
        }
    }
}

impl ZoomPan {
    /// Crop rectangle for this zoom/pan.
    #[must_use]
    pub fn roi(&self) -> Roi {
        let margin = (1.0 - self.zoom) / 2.0;
        Roi {
            x: self.pan_h + margin,
            y: self.pan_v + margin,
            width: self.zoom,
            height: self.zoom,
        }
    }

    /// Whether the crop stays within the sensor.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let margin = (1.0 - self.zoom) / 2.0;
        self.zoom > 0.0
            && self.zoom <= 1.0
            && self.pan_h.abs() <= margin + f64::EPSILON
            && self.pan_v.abs() <= margin + f64::EPSILON
    }
}

/// Image tuning applied to the live video configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CameraSettings {
    /// Mirror left/right.
    pub hflip: bool,
    /// Mirror top/bottom.
    pub vflip: bool,
    /// Brightness, -1.0 to 1.0.
    pub brightness: f64,
    /// Contrast multiplier.
    pub contrast: f64,
    /// Saturation multiplier.
    pub saturation: f64,
    /// Sharpness multiplier.
    pub sharpness: f64,
    /// Exposure compensation in stops.
    pub ev: f64,
    /// Exposure profile.
    pub exposure: ExposureMode,
    /// Metering mode.
    pub metering: MeteringMode,
    /// Fixed analog gain, 0.0 for automatic.
    pub analog_gain: f64,
    /// Zoom and pan.
    pub zoom: ZoomPan,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            hflip: false,
            vflip: false,
            brightness: 0.0,
            contrast: 1.0,
            saturation: 1.0,
            sharpness: 1.0,
            ev: 0.0,
            exposure: ExposureMode::default(),
            metering: MeteringMode::default(),
            analog_gain: 0.0,
            zoom: ZoomPan::default(),
        }
    }
}

impl CameraSettings {
    /// Flip transform for these settings.
    #[must_use]
    pub const fn transform(&self) -> Transform {
        Transform {
            hflip: self.hflip,
            vflip: self.vflip,
        }
    }
}

/// Preview window placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreviewGeometry {
    /// Left edge in screen pixels.
    pub x: i32,
    /// Top edge in screen pixels.
    pub y: i32,
    /// Width in screen pixels.
    pub width: u32,
    /// Height in screen pixels.
    pub height: u32,
}

impl Default for PreviewGeometry {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            width: 640,
            height: 480,
        }
    }
}

fn default_folder() -> PathBuf {
    dirs::picture_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Still capture settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureSettings {
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Output encoding.
    pub format: ImageFormat,
    /// Destination folder.
    pub folder: PathBuf,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            format: ImageFormat::Jpeg,
            folder: default_folder(),
        }
    }
}

/// How long a timelapse runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelapseLimit {
    /// Stop after this many captures.
    Frames(u32),
    /// Stop after this much time, expressed in captures of one step each.
    #[serde(with = "duration_ms")]
    Duration(Duration),
}

/// Timelapse settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimelapseSettings {
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Output encoding.
    pub format: ImageFormat,
    /// Destination folder.
    pub folder: PathBuf,
    /// Interval between captures.
    #[serde(rename = "step_ms", with = "duration_ms")]
    pub step: Duration,
    /// When the run ends.
    pub limit: TimelapseLimit,
}

impl Default for TimelapseSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            format: ImageFormat::Jpeg,
            folder: default_folder(),
            step: Duration::from_secs(10),
            limit: TimelapseLimit::Frames(10),
        }
    }
}

impl TimelapseSettings {
    /// Number of captures in a run.
    #[must_use]
    pub fn frame_limit(&self) -> u32 {
        match self.limit {
            TimelapseLimit::Frames(count) => count,
            TimelapseLimit::Duration(total) => {
                let step = self.step.as_millis().max(1);
                u32::try_from(total.as_millis() / step).unwrap_or(u32::MAX)
            }
        }
    }
}

/// Raw video recording through the frame buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordingSettings {
    /// Output file, `-` for stdout.
    pub output: PathBuf,
    /// Number of frames to record.
    pub frames: u32,
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
