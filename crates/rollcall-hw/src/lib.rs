//! rollcall-hw: camera capture for the rollcall daemon.
//!
//! V4L2 device access plus the [`FrameSource`] boundary that capture
//! sessions are written against.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CameraStream, FrameSource, PixelFormat};
pub use frame::{crop, Frame, FrameError};
