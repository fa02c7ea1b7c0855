//! Mock backend and clock for testing without hardware.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, TimeZone};

use crate::clock::Clock;
use crate::save::{ImageEncoder, SaveError};
use crate::settings::ImageFormat;
use crate::traits::{
    CameraBackend, CameraError, CameraEvent, FourCC, Frame, FrameMetadata, Result, StillFlags,
    StreamInfo, VideoOptions,
};

/// One call made on the mock backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    /// `open`, with the preview flag.
    Open(bool),
    /// `close`.
    Close,
    /// `configure_video`, with the options passed.
    ConfigureVideo(VideoOptions),
    /// `configure_still`, with the flags and options passed.
    ConfigureStill(StillFlags, VideoOptions),
    /// `start_camera`.
    StartCamera,
    /// `stop_camera`.
    StopCamera,
    /// `start_encoder`.
    StartEncoder,
    /// `stop_encoder`.
    StopEncoder,
    /// `teardown`.
    Teardown,
    /// `encode_buffer`, with the frame sequence number.
    Encode(u32),
    /// `show_preview`, with the frame sequence number.
    Preview(u32),
}

/// Shared, inspectable log of backend calls.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn push(&self, call: Call) {
        self.0.lock().expect("call log lock").push(call);
    }

    /// Copy of every call so far.
    pub fn snapshot(&self) -> Vec<Call> {
        self.0.lock().expect("call log lock").clone()
    }

    /// Forget recorded calls.
    pub fn clear(&self) {
        self.0.lock().expect("call log lock").clear();
    }

    /// Number of recorded calls matching `pred`.
    pub fn count<F: Fn(&Call) -> bool>(&self, pred: F) -> usize {
        self.0.lock().expect("call log lock").iter().filter(|call| pred(call)).count()
    }
}

/// Manually advanced clock.
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: Instant,
    base_local: DateTime<Local>,
    offset: Arc<Mutex<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    /// Clock starting at a fixed local time.
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            base_local: Local
                .with_ymd_and_hms(2024, 3, 7, 14, 5, 9)
                .single()
                .expect("unambiguous local time"),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock().expect("clock lock") += by;
    }

    fn offset(&self) -> Duration {
        *self.offset.lock().expect("clock lock")
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.offset()
    }

    fn local_now(&self) -> DateTime<Local> {
        self.base_local + chrono::Duration::from_std(self.offset()).expect("offset in range")
    }
}

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

/// Mock camera backend producing YUYV video and YUYV or BGR stills.
pub struct MockBackend {
    calls: CallLog,
    injected: VecDeque<CameraEvent>,
    info: Option<StreamInfo>,
    streaming: bool,
    pattern: TestPattern,
    sequence: u32,
    clock: Option<ManualClock>,
    frame_interval: Duration,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Create a new mock backend with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: CallLog::default(),
            injected: VecDeque::new(),
            info: None,
            streaming: false,
            pattern: TestPattern::ColorBars,
            sequence: 0,
            clock: None,
            frame_interval: Duration::from_millis(33),
        }
    }

    /// Advance `clock` by `interval` on every event.
    #[must_use]
    pub fn with_clock(mut self, clock: ManualClock, interval: Duration) -> Self {
        self.clock = Some(clock);
        self.frame_interval = interval;
        self
    }

    /// Set the test pattern for frame generation.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Log of calls made on this backend.
    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }

    /// Queue an event to be returned before generated frames.
    pub fn inject(&mut self, event: CameraEvent) {
        self.injected.push_back(event);
    }

    fn configure(&mut self, options: &VideoOptions, fourcc: FourCC) -> StreamInfo {
        let info = StreamInfo::new(options.width, options.height, fourcc);
        self.info = Some(info.clone());
        info
    }
}

impl CameraBackend for MockBackend {
    fn open(&mut self, preview: bool) -> Result<()> {
        self.calls.push(Call::Open(preview));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.calls.push(Call::Close);
        Ok(())
    }

    fn configure_video(&mut self, options: &VideoOptions) -> Result<StreamInfo> {
        self.calls.push(Call::ConfigureVideo(options.clone()));
        Ok(self.configure(options, FourCC::YUYV))
    }

    fn configure_still(&mut self, flags: StillFlags, options: &VideoOptions) -> Result<StreamInfo> {
        self.calls.push(Call::ConfigureStill(flags, options.clone()));
        let fourcc = match flags {
            StillFlags::Default => FourCC::YUYV,
            StillFlags::Bgr => FourCC::BGR3,
        };
        Ok(self.configure(options, fourcc))
    }

    fn start_camera(&mut self) -> Result<()> {
        self.calls.push(Call::StartCamera);
        self.streaming = true;
        Ok(())
    }

    fn stop_camera(&mut self) -> Result<()> {
        self.calls.push(Call::StopCamera);
        self.streaming = false;
        Ok(())
    }

    fn start_encoder(&mut self) -> Result<()> {
        self.calls.push(Call::StartEncoder);
        Ok(())
    }

    fn stop_encoder(&mut self) -> Result<()> {
        self.calls.push(Call::StopEncoder);
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        self.calls.push(Call::Teardown);
        self.info = None;
        Ok(())
    }

    fn wait_for_event(&mut self) -> Result<CameraEvent> {
        if let Some(clock) = &self.clock {
            clock.advance(self.frame_interval);
        }
        if let Some(event) = self.injected.pop_front() {
            return Ok(event);
        }

        let info = match (&self.info, self.streaming) {
            (Some(info), true) => info,
            _ => return Err(CameraError::StreamError("mock not streaming".to_owned())),
        };
        let data = generate_test_frame(info, self.pattern);

        let seq = self.sequence;
        self.sequence += 1;

        Ok(CameraEvent::FrameReady(Frame {
            data,
            metadata: FrameMetadata {
                sequence: seq,
                timestamp: Duration::from_millis(u64::from(seq) * 33), // ~30fps
                bytes_used: info.size,
            },
        }))
    }

    fn encode_buffer(&mut self, frame: &Frame) -> Result<Vec<u8>> {
        self.calls.push(Call::Encode(frame.metadata.sequence));
        Ok(frame.data.clone())
    }

    fn show_preview(&mut self, frame: &Frame) -> Result<()> {
        self.calls.push(Call::Preview(frame.metadata.sequence));
        Ok(())
    }
}

/// One image handed to the [`RecordingEncoder`].
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedImage {
    /// Destination path.
    pub path: std::path::PathBuf,
    /// Requested format.
    pub format: ImageFormat,
    /// Image width.
    pub width: u32,
    /// Image height.
    pub height: u32,
}

/// Image encoder that records requests instead of writing files.
#[derive(Debug, Clone, Default)]
pub struct RecordingEncoder {
    images: Arc<Mutex<Vec<EncodedImage>>>,
    fail: bool,
}

impl RecordingEncoder {
    /// Encoder that rejects every image.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Images received so far.
    pub fn images(&self) -> Vec<EncodedImage> {
        self.images.lock().expect("encoder lock").clone()
    }
}

impl ImageEncoder for RecordingEncoder {
    fn encode(
        &self,
        _pixels: &[u8],
        info: &StreamInfo,
        _metadata: &FrameMetadata,
        path: &std::path::Path,
        format: ImageFormat,
    ) -> std::result::Result<(), SaveError> {
        if self.fail {
            return Err(SaveError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::other("disk full"),
            });
        }
        self.images.lock().expect("encoder lock").push(EncodedImage {
            path: path.to_path_buf(),
            format,
            width: info.width,
            height: info.height,
        });
        Ok(())
    }
}

/// Generate test frame data based on pattern, laid out as `info` describes.
fn generate_test_frame(info: &StreamInfo, pattern: TestPattern) -> Vec<u8> {
    let mut data = vec![0u8; info.size as usize];

    if info.fourcc == FourCC::BGR3 || info.fourcc == FourCC::RGB3 {
        generate_packed_rgb(&mut data, info, pattern);
        return data;
    }

    match pattern {
        TestPattern::ColorBars => {
            generate_color_bars(&mut data, info.width, info.height);
        }
        TestPattern::Gradient => {
            generate_gradient(&mut data, info.width, info.height);
        }
        TestPattern::Solid(y, u, v) => {
            generate_solid(&mut data, y, u, v);
        }
    }

    data
}

/// Generate YUYV color bars pattern.
fn generate_color_bars(data: &mut [u8], width: u32, height: u32) {
    // White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
    let bars: [(u8, u8, u8); 8] = [
        (235, 128, 128),
        (210, 16, 146),
        (170, 166, 16),
        (145, 54, 34),
        (106, 202, 222),
        (81, 90, 240),
        (41, 240, 110),
        (16, 128, 128),
    ];

    let bar_width = (width / 8).max(1);

    for y in 0..height {
        for x in (0..width).step_by(2) {
            let bar_idx = (x / bar_width).min(7) as usize;
            let (y_val, u_val, v_val) = bars[bar_idx];

            let offset = ((y * width + x) * 2) as usize;
            if offset + 3 < data.len() {
                data[offset] = y_val;
                data[offset + 1] = u_val;
                data[offset + 2] = y_val;
                data[offset + 3] = v_val;
            }
        }
    }
}

/// Generate YUYV horizontal gradient pattern.
fn generate_gradient(data: &mut [u8], width: u32, height: u32) {
    for y in 0..height {
        for x in (0..width).step_by(2) {
            #[allow(clippy::cast_possible_truncation)]
            let y_val = ((x * 255) / width) as u8;
            let offset = ((y * width + x) * 2) as usize;

            if offset + 3 < data.len() {
                data[offset] = y_val;
                data[offset + 1] = 128;
                data[offset + 2] = y_val;
                data[offset + 3] = 128;
            }
        }
    }
}

/// Generate a packed 24-bit frame: a grey ramp, or the luma of a solid pattern.
fn generate_packed_rgb(data: &mut [u8], info: &StreamInfo, pattern: TestPattern) {
    let stride = info.stride as usize;
    if stride == 0 {
        return;
    }
    for row in data.chunks_exact_mut(stride) {
        for (x, px) in row.chunks_exact_mut(3).enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let level = match pattern {
                TestPattern::Solid(y, _, _) => y,
                TestPattern::ColorBars | TestPattern::Gradient => {
                    ((x * 255) / info.width.max(1) as usize) as u8
                }
            };
            px.fill(level);
        }
    }
}

/// Generate solid color YUYV frame.
fn generate_solid(data: &mut [u8], y: u8, u: u8, v: u8) {
    for quad in data.chunks_exact_mut(4) {
        quad.copy_from_slice(&[y, u, y, v]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(width: u32, height: u32) -> VideoOptions {
        VideoOptions {
            width,
            height,
            transform: crate::settings::Transform::default(),
            brightness: 0.0,
            contrast: 1.0,
            saturation: 1.0,
            sharpness: 1.0,
            ev: 0.0,
            exposure: crate::settings::ExposureMode::Normal,
            metering: crate::settings::MeteringMode::Centre,
            analog_gain: 0.0,
            roi: crate::settings::Roi::default(),
            preview: crate::settings::PreviewGeometry::default(),
        }
    }

    #[test]
    fn test_mock_stream_capture() {
        let mut backend = MockBackend::new();
        backend.configure_video(&options(64, 48)).expect("configure failed");
        backend.start_camera().expect("start failed");

        let CameraEvent::FrameReady(frame1) = backend.wait_for_event().expect("wait failed") else {
            unreachable!("expected a frame");
        };
        assert_eq!(frame1.metadata.sequence, 0);
        assert_eq!(frame1.data.len(), 64 * 48 * 2);

        let CameraEvent::FrameReady(frame2) = backend.wait_for_event().expect("wait failed") else {
            unreachable!("expected a frame");
        };
        assert_eq!(frame2.metadata.sequence, 1);
    }

    #[test]
    fn test_injected_events_come_first() {
        let mut backend = MockBackend::new();
        backend.inject(CameraEvent::Quit);
        assert!(matches!(
            backend.wait_for_event().expect("wait failed"),
            CameraEvent::Quit
        ));
        assert!(backend.wait_for_event().is_err());
    }

    #[test]
    fn test_clock_advances_per_event() {
        let clock = ManualClock::new();
        let start = clock.now();
        let mut backend =
            MockBackend::new().with_clock(clock.clone(), Duration::from_millis(100));
        backend.inject(CameraEvent::Quit);
        backend.wait_for_event().expect("wait failed");
        assert_eq!(clock.now() - start, Duration::from_millis(100));
    }

    #[test]
    fn test_bgr_still_frame_is_packed() {
        let mut backend = MockBackend::new().with_pattern(TestPattern::Solid(90, 0, 0));
        backend
            .configure_still(StillFlags::Bgr, &options(32, 8))
            .expect("configure failed");
        backend.start_camera().expect("start failed");

        let CameraEvent::FrameReady(frame) = backend.wait_for_event().expect("wait failed") else {
            unreachable!("expected a frame");
        };
        assert_eq!(frame.data.len(), 32 * 8 * 3);
        assert_eq!(frame.metadata.bytes_used, 32 * 8 * 3);
        assert!(frame.data.iter().all(|&byte| byte == 90));
    }

    #[test]
    fn test_color_bars_pattern() {
        let info = StreamInfo::new(640, 480, FourCC::YUYV);
        let data = generate_test_frame(&info, TestPattern::ColorBars);

        assert_eq!(data.len(), (640 * 480 * 2) as usize);
        // First bar should be white (Y=235)
        assert_eq!(data[0], 235);
    }

    #[test]
    fn test_gradient_pattern() {
        let info = StreamInfo::new(640, 480, FourCC::YUYV);
        let data = generate_test_frame(&info, TestPattern::Gradient);

        assert!(data[0] < 10);
        let last_row_start = (479 * 640 * 2) as usize;
        assert!(data[last_row_start + 638 * 2] > 200);
    }

    #[test]
    fn test_solid_pattern() {
        let info = StreamInfo::new(64, 64, FourCC::YUYV);
        let data = generate_test_frame(&info, TestPattern::Solid(128, 64, 192));

        assert_eq!(data[0], 128);
        assert_eq!(data[2], 128);
        assert_eq!(data[1], 64);
        assert_eq!(data[3], 192);
    }
}
