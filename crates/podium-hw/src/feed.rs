//! Background capture thread publishing the latest decoded frame.
//!
//! When the thread exits for any reason the published frame is cleared and
//! the channel closes, so readers never see a frozen frame as live.

use crate::camera::{Camera, CameraError};
use podium_core::{Frame, VideoSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::watch;

/// Capture errors in a row before the thread gives up.
const MAX_CONSECUTIVE_ERRORS: u32 = 25;
const ERROR_BACKOFF: Duration = Duration::from_millis(40);
/// How long `stop` waits for a thread blocked in a dequeue.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

type LatestFrame = Option<Arc<Frame>>;

/// Owns the capture thread. Dropping it stops capture.
pub struct CameraFeed {
    latest: watch::Receiver<LatestFrame>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    /// Disconnects when the capture thread exits.
    exited: mpsc::Receiver<()>,
    pub width: u32,
    pub height: u32,
}

impl CameraFeed {
    /// Open the camera and start streaming, failing fast on either step, then
    /// capture on a dedicated thread.
    pub fn start(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        let camera = Camera::open(device_path, width, height)?;
        let (width, height) = (camera.width, camera.height);
        let (tx, latest) = watch::channel::<LatestFrame>(None);
        let stop = Arc::new(AtomicBool::new(false));
        let (started_tx, started_rx) = mpsc::sync_channel::<Result<(), CameraError>>(1);
        let (exit_guard, exited) = mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("podium-capture".into())
            .spawn({
                let stop = Arc::clone(&stop);
                move || {
                    let _exit_guard = exit_guard;
                    capture_loop(camera, tx, stop, started_tx);
                }
            })
            .map_err(|e| CameraError::CaptureFailed(format!("failed to spawn capture thread: {e}")))?;

        match started_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(CameraError::CaptureFailed("capture thread exited during startup".into()));
            }
        }

        Ok(Self {
            latest,
            stop,
            thread: Some(thread),
            exited,
            width,
            height,
        })
    }

    /// A [`VideoSource`] reading this feed.
    pub fn source(&self) -> FeedSource {
        FeedSource {
            latest: self.latest.clone(),
        }
    }

    /// Signal the thread and wait a bounded time for it. A thread stuck in a
    /// stalled dequeue is detached.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if !join_bounded(thread, &self.exited, STOP_TIMEOUT) {
                tracing::warn!(timeout = ?STOP_TIMEOUT, "capture thread did not stop; detaching");
            }
        }
    }

    /// [`stop`](Self::stop) on the blocking pool, for async callers.
    pub async fn shutdown(mut self) {
        if let Err(e) = tokio::task::spawn_blocking(move || self.stop()).await {
            tracing::error!(error = %e, "capture shutdown task failed");
        }
    }
}

impl Drop for CameraFeed {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Join `thread` if it exits within `timeout`. Returns false if it was left running.
fn join_bounded(thread: JoinHandle<()>, exited: &mpsc::Receiver<()>, timeout: Duration) -> bool {
    match exited.recv_timeout(timeout) {
        Err(RecvTimeoutError::Timeout) => false,
        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
            if thread.join().is_err() {
                tracing::error!("capture thread panicked");
            }
            true
        }
    }
}

fn capture_loop(
    camera: Camera,
    tx: watch::Sender<LatestFrame>,
    stop: Arc<AtomicBool>,
    started: mpsc::SyncSender<Result<(), CameraError>>,
) {
    tracing::info!(device = %camera.device_path, "capture thread started");
    let mut session = match camera.stream() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "could not start capture stream");
            let _ = started.send(Err(e));
            return;
        }
    };
    let _ = started.send(Ok(()));

    let mut errors = 0u32;
    while !stop.load(Ordering::SeqCst) {
        match session.next_frame() {
            Ok(frame) => {
                errors = 0;
                tracing::trace!(seq = frame.sequence, "frame captured");
                tx.send_replace(Some(Arc::new(frame)));
            }
            Err(e) => {
                errors += 1;
                tracing::warn!(error = %e, consecutive = errors, "frame capture failed");
                if errors >= MAX_CONSECUTIVE_ERRORS {
                    tracing::error!("too many capture failures; stopping capture");
                    break;
                }
                std::thread::sleep(ERROR_BACKOFF);
            }
        }
    }
    tx.send_replace(None);
    tracing::info!("capture thread exiting");
}

/// Reads the most recent frame published by a [`CameraFeed`].
#[derive(Clone)]
pub struct FeedSource {
    latest: watch::Receiver<LatestFrame>,
}

impl FeedSource {
    /// A source fed by an arbitrary channel, e.g. for replaying frames.
    pub fn from_channel(latest: watch::Receiver<LatestFrame>) -> Self {
        Self { latest }
    }
}

impl VideoSource for FeedSource {
    fn frame_available(&self) -> bool {
        !self.is_closed() && self.latest.borrow().is_some()
    }

    fn current_frame(&self) -> Option<Arc<Frame>> {
        if self.is_closed() {
            return None;
        }
        self.latest.borrow().clone()
    }

    fn is_closed(&self) -> bool {
        self.latest.has_changed().is_err()
    }
}
