//! V4L2 camera access via the `v4l` crate.

use crate::frame::{self, Frame};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 1280;
const REQUESTED_HEIGHT: u32 = 720;

/// Buffers queued with the driver. Also the number of stale frames a
/// [`LiveStream::latest`] call discards.
const STREAM_BUFFERS: u32 = 2;

/// Upper bound on waiting for the driver to fill a buffer.
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(2);

const EBUSY: i32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel formats we can turn into RGB, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Motion-JPEG (one compressed JPEG per buffer; most USB webcams).
    Mjpeg,
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    Grey,
}

impl PixelFormat {
    const PREFERENCE: [PixelFormat; 3] = [PixelFormat::Mjpeg, PixelFormat::Yuyv, PixelFormat::Grey];

    fn fourcc(self) -> FourCC {
        match self {
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv => FourCC::new(b"YUYV"),
            PixelFormat::Grey => FourCC::new(b"GREY"),
        }
    }
}

/// An opened, format-negotiated capture device.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a capture device by path (e.g., "/dev/video0") and negotiate a format.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| match e.raw_os_error() {
            Some(EBUSY) => CameraError::DeviceBusy,
            _ => CameraError::DeviceNotFound(format!("{device_path}: {e}")),
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let (width, height, pixel_format) = negotiate(&device)?;
        tracing::info!(
            device = device_path,
            card = %caps.card,
            width,
            height,
            format = ?pixel_format,
            "camera opened"
        );

        Ok(Self {
            device,
            width,
            height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Start streaming. The stream borrows the camera for its lifetime.
    pub fn stream(&self) -> Result<LiveStream<'_>, CameraError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        stream.set_timeout(DEQUEUE_TIMEOUT);
        Ok(LiveStream {
            camera: self,
            stream,
        })
    }

    fn to_rgb(&self, buf: &[u8]) -> Result<(Vec<u8>, u32, u32), CameraError> {
        let (w, h) = (self.width, self.height);
        let converted = match self.pixel_format {
            PixelFormat::Mjpeg => frame::mjpeg_to_rgb(buf),
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, w, h).map(|rgb| (rgb, w, h)),
            PixelFormat::Grey => frame::grey_to_rgb(buf, w, h).map(|rgb| (rgb, w, h)),
        };
        converted.map_err(|e| {
            CameraError::CaptureFailed(format!("{:?} conversion failed: {e}", self.pixel_format))
        })
    }

    /// Capture-capable V4L2 nodes among `/dev/video0..15`.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card,
                        driver: caps.driver,
                        bus: caps.bus,
                    })
            })
            .collect()
    }
}

/// Try each supported format at the requested size; accept the first the driver keeps.
fn negotiate(device: &Device) -> Result<(u32, u32, PixelFormat), CameraError> {
    let mut fmt = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;

    for wanted in PixelFormat::PREFERENCE {
        fmt.fourcc = wanted.fourcc();
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;
        match device.set_format(&fmt) {
            Ok(got) if got.fourcc == wanted.fourcc() => return Ok((got.width, got.height, wanted)),
            Ok(got) => tracing::debug!(wanted = ?wanted, got = ?got.fourcc, "format not accepted"),
            Err(e) => tracing::debug!(wanted = ?wanted, error = %e, "set_format failed"),
        }
    }

    Err(CameraError::FormatNegotiationFailed(
        "device accepts none of MJPG, YUYV, GREY".into(),
    ))
}

/// A running capture stream.
pub struct LiveStream<'a> {
    camera: &'a Camera,
    stream: MmapStream<'a>,
}

impl LiveStream<'_> {
    /// Dequeue the next frame the driver delivers.
    pub fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self.stream.next().map_err(dequeue_failed)?;

        // Some drivers leave bytesused at zero for uncompressed formats.
        let used = match meta.bytesused as usize {
            0 => buf.len(),
            n => n.min(buf.len()),
        };
        let sequence = meta.sequence;
        let (data, width, height) = self.camera.to_rgb(&buf[..used])?;

        Ok(Frame {
            data,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
        })
    }

    /// The current view, skipping buffers that filled up while nobody was reading.
    pub fn latest(&mut self) -> Result<Frame, CameraError> {
        for _ in 0..STREAM_BUFFERS {
            self.stream.next().map_err(dequeue_failed)?;
        }
        self.next_frame()
    }
}

fn dequeue_failed(e: std::io::Error) -> CameraError {
    CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}"))
}
