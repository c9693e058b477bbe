//! Live capture source: owns the camera on a dedicated thread.

use crate::camera::{Camera, CameraError, LiveStream};
use crate::frame::Frame;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

/// Anything that can hand over the current still image of a live feed.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// The latest frame, or `None` when no usable frame is available right now.
    async fn grab(&self) -> Option<Frame>;
}

struct GrabRequest {
    reply: oneshot::Sender<Option<Frame>>,
}

/// Clone-safe handle to the capture thread.
#[derive(Clone)]
pub struct CaptureHandle {
    tx: mpsc::Sender<GrabRequest>,
}

#[async_trait]
impl FrameSource for CaptureHandle {
    async fn grab(&self) -> Option<Frame> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(GrabRequest { reply }).await.is_err() {
            tracing::warn!("capture thread has exited");
            return None;
        }
        rx.await.ok().flatten()
    }
}

/// Open the camera and spawn its capture thread.
///
/// Fails fast if the device cannot be opened or streamed. Dark frames and
/// capture errors are reported to callers as "no frame available".
pub fn spawn_capture(device_path: &str, warmup_frames: usize) -> Result<CaptureHandle, CameraError> {
    let camera = Camera::open(device_path)?;
    let (tx, mut rx) = mpsc::channel::<GrabRequest>(2);
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();

    std::thread::Builder::new()
        .name("remembr-capture".into())
        .spawn(move || {
            let mut stream = match camera.stream() {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            if warmup_frames > 0 {
                tracing::info!(count = warmup_frames, "discarding warmup frames");
                for _ in 0..warmup_frames {
                    let _ = stream.next_frame();
                }
            }
            let _ = ready_tx.send(Ok(()));

            tracing::info!(device = %camera.device_path, "capture thread started");
            while let Some(req) = rx.blocking_recv() {
                let _ = req.reply.send(grab_usable(&mut stream));
            }
            tracing::info!("capture thread exiting");
        })
        .map_err(|e| CameraError::CaptureFailed(format!("failed to spawn capture thread: {e}")))?;

    ready_rx
        .recv()
        .map_err(|_| CameraError::CaptureFailed("capture thread exited during startup".into()))??;

    Ok(CaptureHandle { tx })
}

fn grab_usable(stream: &mut LiveStream<'_>) -> Option<Frame> {
    match stream.latest() {
        Ok(frame) if frame.is_dark() => {
            tracing::debug!(seq = frame.sequence, "skipping dark frame");
            None
        }
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::warn!(error = %e, "frame capture failed");
            None
        }
    }
}
