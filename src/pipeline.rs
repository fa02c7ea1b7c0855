//! Camera pipeline lifecycle as an explicit state machine.
//!
//! [`Pipeline`] wraps a [`CameraBackend`] and only forwards a lifecycle call
//! when the current state permits it. Illegal calls fail with
//! [`CameraError::InvalidTransition`] and leave the state untouched.
//!
//! ```text
//! Closed -open-> Opened -configure-> Configured -start_camera-> Streaming
//!    ^             |  ^                 |   ^                     |
//!    +----close----+  +----teardown-----+   +-----stop_camera-----+
//! ```

use std::fmt;

use tracing::{debug, trace};

use crate::traits::{
    CameraBackend, CameraError, CameraEvent, Frame, Result, StillFlags, StreamInfo, StreamKind,
    VideoOptions,
};

/// Lifecycle state of the camera pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Camera not acquired.
    Closed,
    /// Camera acquired, no stream configured.
    Opened,
    /// Stream configured but not delivering frames.
    Configured {
        /// Configured stream.
        kind: StreamKind,
        /// Whether the video encoder is running.
        encoder_running: bool,
    },
    /// Stream delivering frames.
    Streaming {
        /// Configured stream.
        kind: StreamKind,
        /// Whether the video encoder is running.
        encoder_running: bool,
    },
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Opened => f.write_str("opened"),
            Self::Configured {
                kind,
                encoder_running,
            } => write!(f, "configured ({kind:?}, encoder running: {encoder_running})"),
            Self::Streaming {
                kind,
                encoder_running,
            } => write!(f, "streaming ({kind:?}, encoder running: {encoder_running})"),
        }
    }
}

/// Camera pipeline driven by the mode controller.
pub struct Pipeline<B> {
    backend: B,
    state: PipelineState,
    stream_info: Option<StreamInfo>,
    preview_open: bool,
}

impl<B: CameraBackend> Pipeline<B> {
    /// Wrap a closed backend.
    pub const fn new(backend: B) -> Self {
        Self {
            backend,
            state: PipelineState::Closed,
            stream_info: None,
            preview_open: false,
        }
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> PipelineState {
        self.state
    }

    /// Kind of the configured stream, if any.
    pub const fn current_stream_kind(&self) -> Option<StreamKind> {
        match self.state {
            PipelineState::Configured { kind, .. } | PipelineState::Streaming { kind, .. } => {
                Some(kind)
            }
            PipelineState::Closed | PipelineState::Opened => None,
        }
    }

    /// Layout of the configured stream.
    pub const fn stream_info(&self) -> Option<&StreamInfo> {
        self.stream_info.as_ref()
    }

    /// Whether the camera was opened with a preview surface.
    pub const fn preview_open(&self) -> bool {
        self.preview_open
    }

    /// Borrow the backend.
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    const fn illegal(&self, op: &'static str) -> CameraError {
        CameraError::InvalidTransition {
            op,
            state: self.state,
        }
    }

    fn transition(&mut self, op: &'static str, next: PipelineState) {
        trace!(op, from = %self.state, to = %next, "pipeline transition");
        self.state = next;
    }

    /// Acquire the camera, binding the preview surface when `preview` is set.
    pub fn open(&mut self, preview: bool) -> Result<()> {
        if self.state != PipelineState::Closed {
            return Err(self.illegal("open"));
        }
        self.backend.open(preview)?;
        self.preview_open = preview;
        self.transition("open", PipelineState::Opened);
        Ok(())
    }

    /// Release the camera.
    pub fn close(&mut self) -> Result<()> {
        if self.state != PipelineState::Opened {
            return Err(self.illegal("close"));
        }
        self.backend.close()?;
        self.preview_open = false;
        self.transition("close", PipelineState::Closed);
        Ok(())
    }

    /// Configure the video stream.
    pub fn configure_video(&mut self, options: &VideoOptions) -> Result<()> {
        if self.state != PipelineState::Opened {
            return Err(self.illegal("configure_video"));
        }
        let info = self.backend.configure_video(options)?;
        debug!(
            width = info.width,
            height = info.height,
            fourcc = %info.fourcc,
            "video stream configured"
        );
        self.stream_info = Some(info);
        self.transition(
            "configure_video",
            PipelineState::Configured {
                kind: StreamKind::Video,
                encoder_running: false,
            },
        );
        Ok(())
    }

    /// Configure the still stream.
    pub fn configure_still(&mut self, flags: StillFlags, options: &VideoOptions) -> Result<()> {
        if self.state != PipelineState::Opened {
            return Err(self.illegal("configure_still"));
        }
        let info = self.backend.configure_still(flags, options)?;
        debug!(
            width = info.width,
            height = info.height,
            fourcc = %info.fourcc,
            ?flags,
            "still stream configured"
        );
        self.stream_info = Some(info);
        self.transition(
            "configure_still",
            PipelineState::Configured {
                kind: StreamKind::Still,
                encoder_running: false,
            },
        );
        Ok(())
    }

    /// Start the video encoder.
    pub fn start_encoder(&mut self) -> Result<()> {
        if self.state
            != (PipelineState::Configured {
                kind: StreamKind::Video,
                encoder_running: false,
            })
        {
            return Err(self.illegal("start_encoder"));
        }
        self.backend.start_encoder()?;
        self.transition(
            "start_encoder",
            PipelineState::Configured {
                kind: StreamKind::Video,
                encoder_running: true,
            },
        );
        Ok(())
    }

    /// Stop the video encoder.
    pub fn stop_encoder(&mut self) -> Result<()> {
        let PipelineState::Configured {
            kind,
            encoder_running: true,
        } = self.state
        else {
            return Err(self.illegal("stop_encoder"));
        };
        self.backend.stop_encoder()?;
        self.transition(
            "stop_encoder",
            PipelineState::Configured {
                kind,
                encoder_running: false,
            },
        );
        Ok(())
    }

    /// Start delivering frames.
    pub fn start_camera(&mut self) -> Result<()> {
        let PipelineState::Configured {
            kind,
            encoder_running,
        } = self.state
        else {
            return Err(self.illegal("start_camera"));
        };
        self.backend.start_camera()?;
        self.transition(
            "start_camera",
            PipelineState::Streaming {
                kind,
                encoder_running,
            },
        );
        Ok(())
    }

    /// Stop delivering frames.
    pub fn stop_camera(&mut self) -> Result<()> {
        let PipelineState::Streaming {
            kind,
            encoder_running,
        } = self.state
        else {
            return Err(self.illegal("stop_camera"));
        };
        self.backend.stop_camera()?;
        self.transition(
            "stop_camera",
            PipelineState::Configured {
                kind,
                encoder_running,
            },
        );
        Ok(())
    }

    /// Release the stream configuration. The encoder must be stopped.
    pub fn teardown(&mut self) -> Result<()> {
        if !matches!(
            self.state,
            PipelineState::Configured {
                encoder_running: false,
                ..
            }
        ) {
            return Err(self.illegal("teardown"));
        }
        self.backend.teardown()?;
        self.stream_info = None;
        self.transition("teardown", PipelineState::Opened);
        Ok(())
    }

    /// Block until the next pipeline event.
    pub fn wait_for_event(&mut self) -> Result<CameraEvent> {
        if !matches!(self.state, PipelineState::Streaming { .. }) {
            return Err(self.illegal("wait_for_event"));
        }
        self.backend.wait_for_event()
    }

    /// Encode a video frame.
    pub fn encode_buffer(&mut self, frame: &Frame) -> Result<Vec<u8>> {
        if self.state
            != (PipelineState::Streaming {
                kind: StreamKind::Video,
                encoder_running: true,
            })
        {
            return Err(self.illegal("encode_buffer"));
        }
        self.backend.encode_buffer(frame)
    }

    /// Show a video frame on the preview surface.
    pub fn show_preview(&mut self, frame: &Frame) -> Result<()> {
        if !matches!(
            self.state,
            PipelineState::Streaming {
                kind: StreamKind::Video,
                ..
            }
        ) {
            return Err(self.illegal("show_preview"));
        }
        self.backend.show_preview(frame)
    }

    /// Walk the pipeline back to [`PipelineState::Closed`] from any state.
    pub fn shutdown(&mut self) -> Result<()> {
        if matches!(self.state, PipelineState::Streaming { .. }) {
            self.stop_camera()?;
        }
        if matches!(
            self.state,
            PipelineState::Configured {
                encoder_running: true,
                ..
            }
        ) {
            self.stop_encoder()?;
        }
        if matches!(self.state, PipelineState::Configured { .. }) {
            self.teardown()?;
        }
        if self.state == PipelineState::Opened {
            self.close()?;
        }
        Ok(())
    }
}
