//! The master loop arbitrating between preview, still capture and timelapse.
//!
//! [`ModeController`] owns the camera [`Pipeline`] and serially drives every
//! lifecycle call. Each camera event runs one iteration of [`ModeController::step`]:
//! pending commands are folded into the control state, then at most one
//! structural transition is serviced in priority order
//!
//! 1. still capture request,
//! 2. settings change,
//! 3. timelapse trigger,
//!
//! falling back to encoding and previewing the video frame. A still frame
//! arriving while a capture is in flight is saved and the pipeline returns to
//! video. A preview visibility change is applied last, with a full
//! close/reopen of the camera.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::control::{
    Command, ControlState, ControllerLink, StatusEvent, TimelapseEnd, TimelapseSummary,
};
use crate::frame_buffer::{FrameBuffer, FrameBufferError};
use crate::pipeline::Pipeline;
use crate::save::{
    generate_filename, save_still, CaptureOrigin, ImageCrateEncoder, ImageEncoder, SaveTarget,
};
use crate::settings::{
    CameraSettings, CaptureSettings, ImageFormat, PreviewGeometry, RecordingSettings,
    TimelapseSettings,
};
use crate::traits::{CameraBackend, CameraError, CameraEvent, Frame, StillFlags, VideoOptions};

/// Error that ends the master loop.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The camera pipeline failed or was driven out of order.
    #[error(transparent)]
    Camera(#[from] CameraError),
    /// The pipeline produced an event kind the loop does not understand.
    #[error("unrecognised camera event: {0}")]
    ProtocolViolation(String),
}

/// Whether the loop should keep running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    /// Wait for the next event.
    Continue,
    /// The pipeline asked to quit.
    Quit,
}

/// Initial settings for the controller.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Live video width in pixels.
    pub video_width: u32,
    /// Live video height in pixels.
    pub video_height: u32,
    /// Whether the preview starts visible.
    pub preview: bool,
    /// Preview window placement.
    pub preview_geometry: PreviewGeometry,
    /// Initial image settings.
    pub camera: CameraSettings,
    /// Initial still capture settings.
    pub capture: CaptureSettings,
    /// Initial timelapse settings.
    pub timelapse: TimelapseSettings,
    /// Raw video recording, if any.
    pub recording: Option<RecordingSettings>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            video_width: 1024,
            video_height: 768,
            preview: true,
            preview_geometry: PreviewGeometry::default(),
            camera: CameraSettings::default(),
            capture: CaptureSettings::default(),
            timelapse: TimelapseSettings::default(),
            recording: None,
        }
    }
}

/// Runtime state of an armed timelapse.
#[derive(Debug, Clone, Copy)]
struct ActiveTimelapse {
    started: Instant,
    last_trigger: Instant,
    step: Duration,
    frame_limit: u32,
    frames_captured: u32,
}

impl ActiveTimelapse {
    fn arm(settings: &TimelapseSettings, now: Instant) -> Self {
        Self {
            started: now,
            last_trigger: now,
            step: settings.step,
            frame_limit: settings.frame_limit(),
            frames_captured: 0,
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_trigger) >= self.step
    }

    const fn summary(&self, reason: TimelapseEnd) -> TimelapseSummary {
        TimelapseSummary {
            frames_captured: self.frames_captured,
            frame_limit: self.frame_limit,
            reason,
        }
    }
}

/// The camera master loop.
pub struct ModeController<B> {
    pipeline: Pipeline<B>,
    link: ControllerLink,
    state: ControlState,
    video_width: u32,
    video_height: u32,
    preview_geometry: PreviewGeometry,
    timelapse: Option<ActiveTimelapse>,
    in_flight: Option<SaveTarget>,
    recording: Option<RecordingSettings>,
    output: Option<FrameBuffer>,
    encoder: Box<dyn ImageEncoder>,
    clock: Box<dyn Clock>,
}

impl<B: CameraBackend> ModeController<B> {
    /// Create a controller over a closed pipeline.
    pub fn new(pipeline: Pipeline<B>, link: ControllerLink, options: ControllerOptions) -> Self {
        Self {
            pipeline,
            link,
            state: ControlState::new(
                options.camera,
                options.capture,
                options.timelapse,
                options.preview,
            ),
            video_width: options.video_width,
            video_height: options.video_height,
            preview_geometry: options.preview_geometry,
            timelapse: None,
            in_flight: None,
            recording: options.recording,
            output: None,
            encoder: Box::new(ImageCrateEncoder),
            clock: Box::new(SystemClock),
        }
    }

    /// Use a different image encoder for still captures.
    #[must_use]
    pub fn with_encoder<E: ImageEncoder + 'static>(mut self, encoder: E) -> Self {
        self.encoder = Box::new(encoder);
        self
    }

    /// Use a different time source.
    #[must_use]
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// The camera pipeline.
    pub const fn pipeline(&self) -> &Pipeline<B> {
        &self.pipeline
    }

    /// Requests and settings as last applied.
    pub const fn control_state(&self) -> &ControlState {
        &self.state
    }

    /// Whether a timelapse run is armed.
    pub const fn timelapse_active(&self) -> bool {
        self.timelapse.is_some()
    }

    /// Whether a still capture is waiting for its frame.
    pub const fn capture_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Whether raw video is being recorded.
    pub const fn recording(&self) -> bool {
        self.output.is_some()
    }

    /// Start, loop until the pipeline quits, then shut down.
    pub fn run(mut self) -> Result<(), ControllerError> {
        self.start()?;
        loop {
            match self.step() {
                Ok(LoopStatus::Continue) => {}
                Ok(LoopStatus::Quit) => break,
                Err(err) => {
                    error!(%err, "camera loop aborted");
                    if let Err(close_err) = self.shutdown() {
                        warn!(%close_err, "camera not closed cleanly");
                    }
                    return Err(err);
                }
            }
        }
        self.shutdown()
    }

    /// Open the camera and start streaming video.
    pub fn start(&mut self) -> Result<(), ControllerError> {
        let preview = self.state.preview_requested;
        info!(
            width = self.video_width,
            height = self.video_height,
            preview,
            "starting camera"
        );
        self.pipeline.open(preview)?;
        self.start_video()?;
        self.open_recording();
        Ok(())
    }

    /// Flush any recording and walk the pipeline back to closed.
    pub fn shutdown(&mut self) -> Result<(), ControllerError> {
        self.stop_recording();
        self.pipeline.shutdown()?;
        info!("camera closed");
        Ok(())
    }

    /// Run one iteration: wait for an event and act on it.
    pub fn step(&mut self) -> Result<LoopStatus, ControllerError> {
        let frame = match self.pipeline.wait_for_event()? {
            CameraEvent::Quit => {
                info!("quit requested");
                return Ok(LoopStatus::Quit);
            }
            CameraEvent::Unrecognised(kind) => {
                return Err(ControllerError::ProtocolViolation(kind));
            }
            CameraEvent::FrameReady(frame) => frame,
        };

        self.drain_commands();
        let trigger = self.update_timelapse();

        match self.in_flight.take() {
            None => self.service_video_frame(&frame, trigger)?,
            Some(target) => self.complete_still(&frame, &target)?,
        }

        // The preview surface is bound at open time, so a change needs a full reopen.
        // Deferred while a still capture waits for its frame.
        if self.in_flight.is_none() && self.state.preview_requested != self.pipeline.preview_open()
        {
            self.change_preview()?;
        }

        Ok(LoopStatus::Continue)
    }

    fn drain_commands(&mut self) {
        let mut armed = self.timelapse.is_some();
        while let Some(command) = self.link.try_command() {
            if command == Command::CancelTimelapse && armed {
                // A request later in this batch starts a fresh run.
                self.end_timelapse(TimelapseEnd::Cancelled);
                armed = false;
            }
            self.state.apply(command, armed);
        }
    }

    /// Arm, complete or poll the timelapse. Returns whether a capture is due.
    fn update_timelapse(&mut self) -> bool {
        let now = self.clock.now();

        if self.state.timelapse_requested && self.timelapse.is_none() {
            let armed = ActiveTimelapse::arm(&self.state.timelapse, now);
            info!(
                step_ms = armed.step.as_millis(),
                frames = armed.frame_limit,
                "timelapse armed"
            );
            self.timelapse = Some(armed);
        }

        let Some(active) = self.timelapse else {
            return false;
        };

        if !self.state.timelapse_requested {
            self.end_timelapse(TimelapseEnd::Cancelled);
            return false;
        }
        if active.frames_captured >= active.frame_limit {
            self.end_timelapse(TimelapseEnd::LimitReached);
            return false;
        }

        active.is_due(now)
    }

    fn end_timelapse(&mut self, reason: TimelapseEnd) {
        let Some(active) = self.timelapse.take() else {
            return;
        };
        match reason {
            TimelapseEnd::LimitReached => {
                info!(frames = active.frames_captured, "timelapse frame count reached");
            }
            TimelapseEnd::Cancelled => info!(frames = active.frames_captured, "timelapse stopped"),
        }
        debug!(
            elapsed_ms = self
                .clock
                .now()
                .saturating_duration_since(active.started)
                .as_millis(),
            "timelapse ended"
        );
        self.state.timelapse_requested = false;
        self.link
            .notify(StatusEvent::TimelapseComplete(active.summary(reason)));
    }

    fn service_video_frame(&mut self, frame: &Frame, trigger: bool) -> Result<(), ControllerError> {
        if self.state.capture_requested {
            info!("still capture requested");
            self.switch_to_still(CaptureOrigin::Still)?;
        } else if self.state.settings_dirty {
            info!("applying camera settings");
            self.change_settings()?;
            self.state.settings_dirty = false;
        } else if trigger {
            info!("timelapse triggered");
            if let Some(active) = self.timelapse.as_mut() {
                active.last_trigger = self.clock.now();
            }
            self.switch_to_still(CaptureOrigin::Timelapse)?;
        } else {
            let payload = self.pipeline.encode_buffer(frame)?;
            self.record(&payload);
            self.pipeline.show_preview(frame)?;
        }
        Ok(())
    }

    fn video_options(&self) -> VideoOptions {
        let camera = &self.state.camera;
        VideoOptions {
            width: self.video_width,
            height: self.video_height,
            transform: camera.transform(),
            brightness: camera.brightness,
            contrast: camera.contrast,
            saturation: camera.saturation,
            sharpness: camera.sharpness,
            ev: camera.ev,
            exposure: camera.exposure,
            metering: camera.metering,
            analog_gain: camera.analog_gain,
            roi: camera.zoom.roi(),
            preview: self.preview_geometry,
        }
    }

    fn start_video(&mut self) -> Result<(), ControllerError> {
        let options = self.video_options();
        self.pipeline.configure_video(&options)?;
        self.pipeline.start_encoder()?;
        self.pipeline.start_camera()?;
        Ok(())
    }

    fn stop_video(&mut self) -> Result<(), ControllerError> {
        self.pipeline.stop_camera()?;
        self.pipeline.stop_encoder()?;
        self.pipeline.teardown()?;
        Ok(())
    }

    fn switch_to_still(&mut self, origin: CaptureOrigin) -> Result<(), ControllerError> {
        let (width, height, format, folder): (u32, u32, ImageFormat, PathBuf) = match origin {
            CaptureOrigin::Still => {
                let capture = &self.state.capture;
                (capture.width, capture.height, capture.format, capture.folder.clone())
            }
            CaptureOrigin::Timelapse => {
                let timelapse = &self.state.timelapse;
                (
                    timelapse.width,
                    timelapse.height,
                    timelapse.format,
                    timelapse.folder.clone(),
                )
            }
        };

        self.stop_video()?;
        let mut options = self.video_options();
        options.width = width;
        options.height = height;
        let flags = match format {
            ImageFormat::Png => StillFlags::Bgr,
            ImageFormat::Jpeg => StillFlags::Default,
        };
        self.pipeline.configure_still(flags, &options)?;
        self.pipeline.start_camera()?;

        self.in_flight = Some(SaveTarget {
            origin,
            format,
            folder,
        });
        Ok(())
    }

    fn complete_still(&mut self, frame: &Frame, target: &SaveTarget) -> Result<(), ControllerError> {
        match target.origin {
            CaptureOrigin::Still => self.state.capture_requested = false,
            CaptureOrigin::Timelapse => {
                if let Some(active) = self.timelapse.as_mut() {
                    active.frames_captured += 1;
                    info!(
                        frame = active.frames_captured,
                        of = active.frame_limit,
                        "timelapse capture"
                    );
                }
            }
        }

        self.pipeline.stop_camera()?;
        self.save(frame, target);
        self.pipeline.teardown()?;
        // Zoom/pan and all image settings are re-applied on return to video.
        self.start_video()
    }

    fn save(&self, frame: &Frame, target: &SaveTarget) {
        let Some(info) = self.pipeline.stream_info() else {
            warn!("still frame without stream layout, not saved");
            return;
        };
        let path = generate_filename(&target.folder, target.format, &self.clock.local_now());
        match save_still(self.encoder.as_ref(), frame, info, &path, target.format) {
            Ok(()) => {
                info!(path = %path.display(), origin = ?target.origin, "image saved");
                self.link.notify(StatusEvent::ImageSaved {
                    path,
                    origin: target.origin,
                });
            }
            Err(err) => {
                warn!(%err, path = %path.display(), origin = ?target.origin, "image save failed");
                self.link.notify(StatusEvent::SaveFailed {
                    path,
                    origin: target.origin,
                    reason: err.to_string(),
                });
            }
        }
    }

    fn change_settings(&mut self) -> Result<(), ControllerError> {
        self.stop_video()?;
        self.start_video()
    }

    fn change_preview(&mut self) -> Result<(), ControllerError> {
        let preview = self.state.preview_requested;
        info!(preview, "reopening camera for preview change");
        self.stop_video()?;
        self.pipeline.close()?;
        self.pipeline.open(preview)?;
        self.start_video()
    }

    fn open_recording(&mut self) {
        let Some(recording) = &self.recording else {
            return;
        };
        let Some(frame_size) = self.pipeline.stream_info().map(|info| info.size as usize) else {
            return;
        };
        match FrameBuffer::open_path(&recording.output, frame_size, recording.frames as usize) {
            Ok(buffer) => {
                info!(
                    output = %recording.output.display(),
                    frames = recording.frames,
                    "recording started"
                );
                self.output = Some(buffer);
            }
            Err(err) => warn!(%err, "recording disabled"),
        }
    }

    fn record(&mut self, payload: &[u8]) {
        let Some(output) = self.output.as_mut() else {
            return;
        };
        match output.output_buffer(payload) {
            Ok(()) if output.is_full() => self.stop_recording(),
            Ok(()) => {}
            Err(err @ FrameBufferError::FrameSize { .. }) => {
                warn!(%err, "frame dropped from recording");
            }
            Err(err) => {
                error!(%err, "recording failed");
                self.stop_recording();
            }
        }
    }

    fn stop_recording(&mut self) {
        let Some(output) = self.output.take() else {
            return;
        };
        match output.close() {
            Ok(stats) => {
                info!(frames = stats.frames_written, "recording finished");
                self.link.notify(StatusEvent::RecordingStopped(stats));
            }
            Err(err) => error!(%err, "recording did not flush"),
        }
    }
}
