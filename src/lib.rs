//! Pi-Cam-Control: camera mode controller for Raspberry Pi
//!
//! This library arbitrates a single camera between live preview, one-shot
//! still capture and timelapse capture, and streams raw video frames to disk
//! through a fixed-size buffer drained by a writer thread. Hardware access sits
//! behind the [`CameraBackend`] trait, enabling both production use with V4L2
//! devices and testing with a mock backend.

pub mod clock;
pub mod config;
pub mod control;
pub mod controller;
pub mod device;
pub mod export;
pub mod frame_buffer;
pub mod pipeline;
pub mod save;
pub mod settings;
pub mod traits;

#[cfg(test)]
pub mod mock;

pub use config::AppConfig;
pub use control::{control_channel, Command, ControlHandle, StatusEvent};
pub use controller::{ControllerError, ControllerOptions, ModeController};
pub use device::V4L2Backend;
pub use frame_buffer::{FrameBuffer, FrameBufferError, FrameBufferStats};
pub use pipeline::{Pipeline, PipelineState};
pub use traits::{CameraBackend, CameraError, CameraEvent, FourCC, Frame, FrameMetadata};
