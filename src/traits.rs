//! Core traits and types for the camera pipeline abstraction.

use std::time::Duration;

use thiserror::Error;

use crate::pipeline::PipelineState;
use crate::settings::{ExposureMode, MeteringMode, PreviewGeometry, Roi, Transform};

/// Pixel format representation (e.g., YUYV, MJPG, RGB3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
    /// BGR3 pixel format (24-bit BGR).
    pub const BGR3: Self = Self::new(b"BGR3");
    /// YU12 pixel format (planar YUV 4:2:0).
    pub const YU12: Self = Self::new(b"YU12");
}

impl std::fmt::Display for FourCC {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Layout of the frames produced by a configured stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride).
    pub stride: u32,
    /// Total frame size in bytes.
    pub size: u32,
}

impl StreamInfo {
    /// Create a stream description with a tightly packed stride for `fourcc`.
    #[must_use]
    pub fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        let (stride, size) = if fourcc == FourCC::RGB3 || fourcc == FourCC::BGR3 {
            (width * 3, width * 3 * height)
        } else if fourcc == FourCC::YU12 {
            (width, width * height * 3 / 2)
        } else {
            // YUYV, and the upper bound for compressed formats
            (width * 2, width * 2 * height)
        };
        Self {
            width,
            height,
            fourcc,
            stride,
            size,
        }
    }
}

/// Metadata for a captured frame.
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Actual bytes used in the frame buffer.
    pub bytes_used: u32,
}

/// A captured video or still frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw frame data.
    pub data: Vec<u8>,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

/// Which kind of stream the pipeline is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Continuous video for preview and encoding.
    Video,
    /// One-shot still image stream.
    Still,
}

/// Flags for still-stream configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StillFlags {
    /// Native still format (suitable for JPEG output).
    Default,
    /// Packed BGR output, required for PNG encoding.
    Bgr,
}

/// Options applied when configuring a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoOptions {
    /// Output width in pixels.
    pub width: u32,
    /// Output height in pixels.
    pub height: u32,
    /// Horizontal/vertical flip.
    pub transform: Transform,
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
    /// Sensor crop (zoom/pan), normalized to the full frame.
    pub roi: Roi,
    /// Preview window placement.
    pub preview: PreviewGeometry,
}

/// Event delivered by the camera pipeline.
#[derive(Debug, Clone)]
pub enum CameraEvent {
    /// The pipeline has been asked to shut down.
    Quit,
    /// A completed request carrying a frame from the configured stream.
    FrameReady(Frame),
    /// An event kind the controller does not understand.
    Unrecognised(String),
}

/// Error type for camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// Device with given index was not found.
    #[error("Device {0} not found")]
    DeviceNotFound(u32),
    /// Failed to open device.
    #[error("Failed to open device: {0}")]
    DeviceOpenFailed(String),
    /// Error during streaming operation.
    #[error("Stream error: {0}")]
    StreamError(String),
    /// A lifecycle call was made from a state that does not permit it.
    #[error("Illegal pipeline transition: {op} while {state}")]
    InvalidTransition {
        /// Operation attempted.
        op: &'static str,
        /// State the pipeline was in.
        state: PipelineState,
    },
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// Abstraction over the camera device and its encoder.
///
/// Implementations are driven exclusively through [`crate::pipeline::Pipeline`],
/// which enforces the legal call order.
pub trait CameraBackend {
    /// Acquire the camera. The preview surface, if any, is bound here.
    fn open(&mut self, preview: bool) -> Result<()>;

    /// Release the camera.
    fn close(&mut self) -> Result<()>;

    /// Configure the video stream. Returns the layout chosen by the driver.
    fn configure_video(&mut self, options: &VideoOptions) -> Result<StreamInfo>;

    /// Configure the still stream. Returns the layout chosen by the driver.
    fn configure_still(&mut self, flags: StillFlags, options: &VideoOptions) -> Result<StreamInfo>;

    /// Start delivering frames.
    fn start_camera(&mut self) -> Result<()>;

    /// Stop delivering frames.
    fn stop_camera(&mut self) -> Result<()>;

    /// Start the video encoder.
    fn start_encoder(&mut self) -> Result<()>;

    /// Stop the video encoder.
    fn stop_encoder(&mut self) -> Result<()>;

    /// Release stream resources so the camera can be reconfigured.
    fn teardown(&mut self) -> Result<()>;

    /// Block until the next pipeline event.
    fn wait_for_event(&mut self) -> Result<CameraEvent>;

    /// Encode a video frame, returning the encoded payload.
    fn encode_buffer(&mut self, frame: &Frame) -> Result<Vec<u8>>;

    /// Display a video frame on the preview surface.
    fn show_preview(&mut self, frame: &Frame) -> Result<()>;
}
