//! remembr-hw: Camera capture for the recognition loop.
//!
//! Provides V4L2-based camera access, RGB frame conversion, and a
//! thread-backed [`FrameSource`] that never blocks the async runtime.

pub mod camera;
pub mod capture;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, LiveStream, PixelFormat};
pub use capture::{spawn_capture, CaptureHandle, FrameSource};
pub use frame::Frame;
