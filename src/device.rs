//! V4L2 camera backend using the v4l crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};
use v4l::buffer::Type;
use v4l::control::{Control, Description, Value};
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::Capture;
use v4l::Device;

use crate::traits::{
    CameraBackend, CameraError, CameraEvent, FourCC, Frame, FrameMetadata, Result, StillFlags,
    StreamInfo, VideoOptions,
};

const CID_BRIGHTNESS: u32 = 0x0098_0900;
const CID_CONTRAST: u32 = 0x0098_0901;
const CID_SATURATION: u32 = 0x0098_0902;
const CID_HFLIP: u32 = 0x0098_0914;
const CID_VFLIP: u32 = 0x0098_0915;
const CID_SHARPNESS: u32 = 0x0098_091b;

/// Device capabilities information.
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming.
    pub can_stream: bool,
}

/// Camera backend over a V4L2 capture node.
///
/// Video and still streams share the node and differ only in the negotiated
/// format. There is no hardware encoder or preview surface: encoding hands
/// back the raw frame, and preview is a no-op.
pub struct V4L2Backend {
    index: usize,
    buffer_count: u32,
    device: Option<Device>,
    capabilities: Option<DeviceCapabilities>,
    stream: Option<Stream<'static>>,
    info: Option<StreamInfo>,
    quit: Arc<AtomicBool>,
}

impl V4L2Backend {
    /// Backend for `/dev/video{index}` using `buffer_count` mmap buffers.
    pub fn new(index: u32, buffer_count: u32) -> Self {
        Self {
            index: index as usize,
            buffer_count: buffer_count.max(1),
            device: None,
            capabilities: None,
            stream: None,
            info: None,
            quit: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Capabilities of the open device.
    pub const fn capabilities(&self) -> Option<&DeviceCapabilities> {
        self.capabilities.as_ref()
    }

    /// Flag that makes the next [`CameraBackend::wait_for_event`] return quit.
    pub fn quit_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.quit)
    }

    fn device(&self) -> Result<&Device> {
        self.device
            .as_ref()
            .ok_or_else(|| CameraError::StreamError("device not open".to_owned()))
    }

    fn negotiate(&mut self, width: u32, height: u32, fourcc: FourCC) -> Result<StreamInfo> {
        let device = self.device()?;
        let mut fmt = device
            .format()
            .map_err(|err| CameraError::StreamError(err.to_string()))?;
        fmt.width = width;
        fmt.height = height;
        fmt.fourcc = fourcc.into();

        let fmt = device
            .set_format(&fmt)
            .map_err(|err| CameraError::StreamError(err.to_string()))?;
        let info = StreamInfo {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.fourcc),
            stride: fmt.stride,
            size: fmt.size,
        };
        if info.width != width || info.height != height || info.fourcc != fourcc {
            debug!(
                requested = %format_args!("{width}x{height} {fourcc}"),
                actual = %format_args!("{}x{} {}", info.width, info.height, info.fourcc),
                "driver adjusted format"
            );
        }
        self.info = Some(info.clone());
        Ok(info)
    }

    fn apply_controls(&self, options: &VideoOptions) -> Result<()> {
        let device = self.device()?;
        let descriptions = match device.query_controls() {
            Ok(descriptions) => descriptions,
            Err(err) => {
                warn!(%err, "cannot query controls, image settings not applied");
                return Ok(());
            }
        };

        let scaled = [
            (CID_BRIGHTNESS, (options.brightness + 1.0) / 2.0),
            (CID_CONTRAST, options.contrast / 2.0),
            (CID_SATURATION, options.saturation / 2.0),
            (CID_SHARPNESS, options.sharpness / 2.0),
        ];
        for (id, position) in scaled {
            if let Some(desc) = descriptions.iter().find(|desc| desc.id == id) {
                set_control(device, desc, Value::Integer(scale(desc, position)));
            }
        }

        let flips = [
            (CID_HFLIP, options.transform.hflip),
            (CID_VFLIP, options.transform.vflip),
        ];
        for (id, on) in flips {
            if let Some(desc) = descriptions.iter().find(|desc| desc.id == id) {
                set_control(device, desc, Value::Boolean(on));
            }
        }

        if options.roi != crate::settings::Roi::default() {
            debug!(roi = ?options.roi, "sensor crop unsupported on this node");
        }
        trace!(
            ev = options.ev,
            exposure = options.exposure.as_str(),
            metering = options.metering.as_str(),
            analog_gain = options.analog_gain,
            "auto exposure left to the driver"
        );
        Ok(())
    }
}

/// Map `position` in `0.0..=1.0` onto the control's range.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn scale(desc: &Description, position: f64) -> i64 {
    let span = (desc.maximum - desc.minimum) as f64;
    desc.minimum + (span * position.clamp(0.0, 1.0)).round() as i64
}

fn set_control(device: &Device, desc: &Description, value: Value) {
    trace!(control = %desc.name, "setting control");
    if let Err(err) = device.set_control(Control { id: desc.id, value }) {
        warn!(control = %desc.name, %err, "control rejected");
    }
}

impl CameraBackend for V4L2Backend {
    fn open(&mut self, preview: bool) -> Result<()> {
        let device = Device::new(self.index).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                CameraError::DeviceNotFound(u32::try_from(self.index).unwrap_or(u32::MAX))
            } else {
                CameraError::DeviceOpenFailed(err.to_string())
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|err| CameraError::DeviceOpenFailed(err.to_string()))?;

        let capabilities = DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(v4l::capability::Flags::STREAMING),
        };
        if !capabilities.can_capture || !capabilities.can_stream {
            return Err(CameraError::DeviceOpenFailed(format!(
                "{} cannot stream video capture",
                capabilities.card
            )));
        }

        debug!(
            card = %capabilities.card,
            driver = %capabilities.driver,
            preview,
            "camera opened"
        );
        self.device = Some(device);
        self.capabilities = Some(capabilities);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.stream = None;
        self.info = None;
        self.device = None;
        Ok(())
    }

    fn configure_video(&mut self, options: &VideoOptions) -> Result<StreamInfo> {
        let info = self.negotiate(options.width, options.height, FourCC::YUYV)?;
        self.apply_controls(options)?;
        Ok(info)
    }

    fn configure_still(&mut self, flags: StillFlags, options: &VideoOptions) -> Result<StreamInfo> {
        let fourcc = match flags {
            StillFlags::Default => FourCC::MJPG,
            StillFlags::Bgr => FourCC::BGR3,
        };
        let info = self.negotiate(options.width, options.height, fourcc)?;
        self.apply_controls(options)?;
        Ok(info)
    }

    fn start_camera(&mut self) -> Result<()> {
        let stream = Stream::with_buffers(self.device()?, Type::VideoCapture, self.buffer_count)
            .map_err(|err| CameraError::StreamError(err.to_string()))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn stop_camera(&mut self) -> Result<()> {
        // Dropping the stream issues STREAMOFF and releases the buffers.
        self.stream = None;
        Ok(())
    }

    fn start_encoder(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop_encoder(&mut self) -> Result<()> {
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        self.info = None;
        Ok(())
    }

    fn wait_for_event(&mut self) -> Result<CameraEvent> {
        if self.quit.load(Ordering::Relaxed) {
            return Ok(CameraEvent::Quit);
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CameraError::StreamError("camera not started".to_owned()))?;
        let (buf, meta) = stream
            .next()
            .map_err(|err| CameraError::StreamError(err.to_string()))?;

        // V4L2 timestamps are non-negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = meta.timestamp.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);

        let used = (meta.bytesused as usize).min(buf.len());
        let data = buf.get(..used).unwrap_or(buf).to_vec();

        Ok(CameraEvent::FrameReady(Frame {
            data,
            metadata: FrameMetadata {
                sequence: meta.sequence,
                timestamp: Duration::new(secs, nanos),
                bytes_used: meta.bytesused,
            },
        }))
    }

    fn encode_buffer(&mut self, frame: &Frame) -> Result<Vec<u8>> {
        let info = self
            .info
            .as_ref()
            .ok_or_else(|| CameraError::StreamError("stream not configured".to_owned()))?;
        // Raw frames go out at the negotiated size so every record has the same length.
        let mut payload = frame.data.clone();
        payload.resize(info.size as usize, 0);
        Ok(payload)
    }

    fn show_preview(&mut self, frame: &Frame) -> Result<()> {
        trace!(sequence = frame.metadata.sequence, "preview frame");
        Ok(())
    }
}
