//! Command and status channels between a front end and the mode controller.
//!
//! The front end holds a [`ControlHandle`] and fires typed [`Command`]s without
//! waiting for them to be honored. The controller drains its [`ControllerLink`]
//! once per camera event, folding commands into its private [`ControlState`],
//! and reports back through [`StatusEvent`]s.

use std::path::PathBuf;

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use thiserror::Error;
use tracing::debug;

use crate::frame_buffer::FrameBufferStats;
use crate::save::CaptureOrigin;
use crate::settings::{CameraSettings, CaptureSettings, TimelapseSettings};

/// Request sent from a front end to the mode controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Take one still image with the current capture settings.
    RequestCapture,
    /// Replace the still capture settings.
    ConfigureCapture(CaptureSettings),
    /// Start a timelapse run. Ignored while a run is active.
    RequestTimelapse(TimelapseSettings),
    /// Withdraw the timelapse request, ending any active run.
    CancelTimelapse,
    /// Re-apply image settings to the live video stream.
    UpdateSettings(CameraSettings),
    /// Show or hide the preview surface.
    SetPreview(bool),
}

/// Why a timelapse run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelapseEnd {
    /// The configured number of captures was taken.
    LimitReached,
    /// The request was withdrawn.
    Cancelled,
}

/// Outcome of a timelapse run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelapseSummary {
    /// Captures taken during the run.
    pub frames_captured: u32,
    /// Captures the run was configured for.
    pub frame_limit: u32,
    /// Why the run ended.
    pub reason: TimelapseEnd,
}

/// Notification sent from the mode controller to a front end.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    /// A timelapse run finished.
    TimelapseComplete(TimelapseSummary),
    /// A still image was written.
    ImageSaved {
        /// File written.
        path: PathBuf,
        /// What triggered the capture.
        origin: CaptureOrigin,
    },
    /// A still image could not be written.
    SaveFailed {
        /// File that could not be written.
        path: PathBuf,
        /// What triggered the capture.
        origin: CaptureOrigin,
        /// Human readable cause.
        reason: String,
    },
    /// Video recording ended and its buffer was flushed.
    RecordingStopped(FrameBufferStats),
}

/// Error returned when a command cannot be queued.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    /// The command queue is full; the controller is behind.
    #[error("command queue full")]
    Full,
    /// The controller has stopped.
    #[error("controller disconnected")]
    Disconnected,
}

/// Front-end side of the control channel.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    commands: Sender<Command>,
    status: Receiver<StatusEvent>,
}

/// Controller side of the control channel.
#[derive(Debug)]
pub struct ControllerLink {
    commands: Receiver<Command>,
    status: Sender<StatusEvent>,
}

/// Create a control channel holding up to `capacity` pending commands.
pub fn control_channel(capacity: usize) -> (ControlHandle, ControllerLink) {
    let (command_tx, command_rx) = crossbeam_channel::bounded(capacity);
    let (status_tx, status_rx) = crossbeam_channel::unbounded();
    (
        ControlHandle {
            commands: command_tx,
            status: status_rx,
        },
        ControllerLink {
            commands: command_rx,
            status: status_tx,
        },
    )
}

impl ControlHandle {
    /// Queue a command without waiting for it to be honored.
    pub fn send(&self, command: Command) -> Result<(), ControlError> {
        self.commands.try_send(command).map_err(|err| match err {
            TrySendError::Full(_) => ControlError::Full,
            TrySendError::Disconnected(_) => ControlError::Disconnected,
        })
    }

    /// Request a still capture.
    pub fn request_capture(&self) -> Result<(), ControlError> {
        self.send(Command::RequestCapture)
    }

    /// Replace the still capture settings.
    pub fn configure_capture(&self, settings: CaptureSettings) -> Result<(), ControlError> {
        self.send(Command::ConfigureCapture(settings))
    }

    /// Request a timelapse run.
    pub fn request_timelapse(&self, settings: TimelapseSettings) -> Result<(), ControlError> {
        self.send(Command::RequestTimelapse(settings))
    }

    /// Withdraw the timelapse request.
    pub fn cancel_timelapse(&self) -> Result<(), ControlError> {
        self.send(Command::CancelTimelapse)
    }

    /// Push new image settings.
    pub fn update_settings(&self, settings: CameraSettings) -> Result<(), ControlError> {
        self.send(Command::UpdateSettings(settings))
    }

    /// Show or hide the preview.
    pub fn set_preview(&self, visible: bool) -> Result<(), ControlError> {
        self.send(Command::SetPreview(visible))
    }

    /// Next pending status event, if any.
    pub fn try_status(&self) -> Option<StatusEvent> {
        self.status.try_recv().ok()
    }

    /// Receiver for status events, for a dedicated listener thread.
    pub fn status_receiver(&self) -> Receiver<StatusEvent> {
        self.status.clone()
    }
}

impl ControllerLink {
    /// Next queued command, if any.
    pub(crate) fn try_command(&self) -> Option<Command> {
        match self.commands.try_recv() {
            Ok(command) => Some(command),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Report a status event. Dropped silently when no front end listens.
    pub(crate) fn notify(&self, event: StatusEvent) {
        if self.status.send(event).is_err() {
            debug!("status event dropped, no listener");
        }
    }
}

/// Requests and settings as last seen by the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlState {
    /// A still capture is pending.
    pub capture_requested: bool,
    /// A timelapse run is requested (armed or about to be).
    pub timelapse_requested: bool,
    /// Image settings changed since last applied.
    pub settings_dirty: bool,
    /// Desired preview visibility.
    pub preview_requested: bool,
    /// Image settings.
    pub camera: CameraSettings,
    /// Still capture settings.
    pub capture: CaptureSettings,
    /// Timelapse settings for the next run.
    pub timelapse: TimelapseSettings,
}

impl ControlState {
    /// Initial state with nothing pending.
    pub fn new(
        camera: CameraSettings,
        capture: CaptureSettings,
        timelapse: TimelapseSettings,
        preview: bool,
    ) -> Self {
        Self {
            capture_requested: false,
            timelapse_requested: false,
            settings_dirty: false,
            preview_requested: preview,
            camera,
            capture,
            timelapse,
        }
    }

    /// Fold one command into the state.
    ///
    /// `timelapse_active` tells whether a run is currently armed; a new
    /// timelapse request is ignored until that run ends.
    pub fn apply(&mut self, command: Command, timelapse_active: bool) {
        debug!(?command, "applying command");
        match command {
            Command::RequestCapture => self.capture_requested = true,
            Command::ConfigureCapture(settings) => self.capture = settings,
            Command::RequestTimelapse(settings) => {
                if timelapse_active || self.timelapse_requested {
                    debug!("timelapse already requested, ignoring");
                } else {
                    self.timelapse = settings;
                    self.timelapse_requested = true;
                }
            }
            Command::CancelTimelapse => self.timelapse_requested = false,
            Command::UpdateSettings(settings) => {
                self.camera = settings;
                self.settings_dirty = true;
            }
            Command::SetPreview(visible) => self.preview_requested = visible,
        }
    }
}
