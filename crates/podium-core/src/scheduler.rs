//! Detection loop scheduler.
//!
//! [`DetectionLoop`] is the state machine (idle → backend-pending → running →
//! stopped) and owns every write to the published verdict and overlay.
//! [`spawn`] drives it from a tokio task: refresh ticks, enablement changes,
//! negotiation and detection completions are all handled on that one task.
//!
//! The estimator is moved into each detection job and handed back with the
//! outcome, so at most one call is ever in flight. Disabling bumps the session
//! generation; outcomes from an older generation are dropped unapplied.

use crate::backend::{BackendState, BackendStatus, FaceEstimator};
use crate::classifier::{primary_face, Classifier, DisplayOrientation};
use crate::detector::DetectorError;
use crate::geometry::{compute_sweet_spot, SweetSpot};
use crate::negotiator::{NegotiationError, Negotiator, ReadyBackend};
use crate::overlay::{Caption, OverlayRenderer};
use crate::types::{BoundingBox, Frame, FramingVerdict};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;

pub const DEFAULT_REFRESH_HZ: u32 = 30;
/// Consecutive detection failures before the degraded notice is raised.
pub const DEGRADED_FAILURE_THRESHOLD: u32 = 3;
pub const DEGRADED_NOTICE: &str = "Face detection is failing repeatedly; guidance may be unreliable";
pub const DETECTOR_LOST_NOTICE: &str = "Face detector stopped responding; guidance halted";
pub const SOURCE_CLOSED_NOTICE: &str = "Camera feed ended; guidance halted";

/// Decoded-frame provider. Implementations must be cheap to poll.
pub trait VideoSource: Send + 'static {
    /// At least one decoded frame is available.
    fn frame_available(&self) -> bool;
    /// Latest decoded frame, if any.
    fn current_frame(&self) -> Option<Arc<Frame>>;
    /// The source has ended and will never deliver another frame.
    fn is_closed(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoopState {
    Idle,
    BackendPending,
    Running,
    Stopped,
}

impl LoopState {
    pub fn is_active(self) -> bool {
        matches!(self, LoopState::BackendPending | LoopState::Running)
    }
}

/// Everything the host needs to render guidance for the latest tick.
#[derive(Debug, Clone, Serialize)]
pub struct GuidanceSnapshot {
    pub verdict: FramingVerdict,
    pub caption: Caption,
    pub loop_state: LoopState,
    pub backend: BackendState,
    pub compatibility_mode: bool,
    pub face: Option<BoundingBox>,
    pub sweet_spot: Option<SweetSpot>,
    pub notice: Option<String>,
    pub frames_analyzed: u64,
    #[serde(skip)]
    pub overlay: Option<Arc<RgbaImage>>,
}

impl GuidanceSnapshot {
    fn idle() -> Self {
        let verdict = FramingVerdict::disabled();
        Self {
            caption: Caption::new(&verdict, BackendState::Uninitialized),
            verdict,
            loop_state: LoopState::Idle,
            backend: BackendState::Uninitialized,
            compatibility_mode: false,
            face: None,
            sweet_spot: None,
            notice: None,
            frames_analyzed: 0,
            overlay: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub refresh_hz: u32,
    pub orientation: DisplayOrientation,
    /// Initial value of the guidance enablement flag.
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            refresh_hz: DEFAULT_REFRESH_HZ,
            orientation: DisplayOrientation::default(),
            enabled: true,
        }
    }
}

impl SchedulerConfig {
    pub fn refresh_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.refresh_hz.max(1)))
    }
}

/// One detection call, carrying the estimator by value.
pub struct DetectionJob {
    generation: u64,
    frame: Arc<Frame>,
    estimator: Box<dyn FaceEstimator>,
}

impl DetectionJob {
    /// Run the (blocking) detection. Panics inside the estimator become
    /// errors so the estimator always comes back.
    pub fn run(mut self) -> DetectionOutcome {
        let estimator = &mut self.estimator;
        let frame = &self.frame;
        let result = panic::catch_unwind(AssertUnwindSafe(|| estimator.estimate_faces(frame)))
            .unwrap_or_else(|_| Err(DetectorError::InferenceFailed("estimator panicked".into())));
        DetectionOutcome {
            generation: self.generation,
            frame_size: (self.frame.width, self.frame.height),
            estimator: self.estimator,
            result,
        }
    }
}

pub struct DetectionOutcome {
    generation: u64,
    frame_size: (u32, u32),
    estimator: Box<dyn FaceEstimator>,
    result: Result<Vec<BoundingBox>, DetectorError>,
}

struct FrameGeometry {
    size: (u32, u32),
    sweet_spot: SweetSpot,
}

/// The guidance state machine. Single writer of the published snapshot.
pub struct DetectionLoop<V> {
    source: V,
    classifier: Classifier,
    state: LoopState,
    backend: BackendState,
    estimator: Option<Box<dyn FaceEstimator>>,
    in_flight: bool,
    detector_lost: bool,
    source_closed: bool,
    generation: u64,
    geometry: Option<FrameGeometry>,
    renderer: Option<OverlayRenderer>,
    failures: u32,
    frames_analyzed: u64,
    snapshot: watch::Sender<GuidanceSnapshot>,
}

impl<V: VideoSource> DetectionLoop<V> {
    pub fn new(source: V, orientation: DisplayOrientation) -> Self {
        let (snapshot, _rx) = watch::channel(GuidanceSnapshot::idle());
        Self {
            source,
            classifier: Classifier::new(orientation),
            state: LoopState::Idle,
            backend: BackendState::Uninitialized,
            estimator: None,
            in_flight: false,
            detector_lost: false,
            source_closed: false,
            generation: 0,
            geometry: None,
            renderer: None,
            failures: 0,
            frames_analyzed: 0,
            snapshot,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<GuidanceSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> GuidanceSnapshot {
        self.snapshot.borrow().clone()
    }

    /// React to the host's enablement flag.
    pub fn set_enabled(&mut self, enabled: bool) {
        match (enabled, self.state) {
            (true, LoopState::Idle | LoopState::Stopped) => {
                self.generation += 1;
                self.state = LoopState::BackendPending;
                tracing::info!(generation = self.generation, "framing guidance enabled");
                self.promote();
                if self.state == LoopState::BackendPending {
                    self.publish_pending();
                }
            }
            (false, LoopState::BackendPending | LoopState::Running) => self.stop(),
            _ => {}
        }
    }

    /// Cancel the session: drop pending work, clear the overlay, reset the verdict.
    pub fn stop(&mut self) {
        self.generation += 1;
        self.state = LoopState::Stopped;
        self.failures = 0;
        if let Some(renderer) = self.renderer.as_mut() {
            renderer.clear();
        }
        tracing::info!(generation = self.generation, "framing guidance stopped");
        self.publish(FramingVerdict::disabled(), None);
    }

    pub fn backend_ready(&mut self, ready: ReadyBackend) {
        self.backend = ready.state();
        self.estimator = Some(ready.estimator);
        self.promote();
        if self.state == LoopState::BackendPending {
            self.publish_pending();
        }
    }

    pub fn backend_failed(&mut self, error: &NegotiationError) {
        tracing::warn!(%error, "guidance backend unavailable");
        self.backend = BackendState::Failed;
        if self.state == LoopState::BackendPending {
            self.publish_pending();
        }
    }

    fn promote(&mut self) {
        if self.state == LoopState::BackendPending && self.backend.is_ready() {
            self.state = LoopState::Running;
            tracing::info!(backend = ?self.backend, "detection loop running");
            self.publish(FramingVerdict::loading(), None);
        }
    }

    /// Handle one refresh tick. Returns a job when a detection should start.
    pub fn on_tick(&mut self) -> Option<DetectionJob> {
        match self.state {
            LoopState::Idle | LoopState::Stopped => None,
            LoopState::BackendPending => {
                self.publish_pending();
                None
            }
            LoopState::Running => {
                if self.source.is_closed() {
                    self.on_source_closed();
                    return None;
                }
                if self.in_flight || !self.source.frame_available() {
                    return None;
                }
                let Some(frame) = self.source.current_frame() else {
                    tracing::trace!("no decoded frame yet");
                    return None;
                };
                let estimator = self.estimator.take()?;
                self.in_flight = true;
                Some(DetectionJob {
                    generation: self.generation,
                    frame,
                    estimator,
                })
            }
        }
    }

    /// Apply a finished detection, unless the session it belongs to is gone.
    pub fn on_outcome(&mut self, outcome: DetectionOutcome) {
        self.in_flight = false;
        self.estimator = Some(outcome.estimator);

        if outcome.generation != self.generation || self.state != LoopState::Running {
            tracing::debug!(
                job = outcome.generation,
                current = self.generation,
                "discarding stale detection result"
            );
            return;
        }

        let (width, height) = outcome.frame_size;
        let spot = self.geometry_for(width, height);
        self.frames_analyzed += 1;

        let (verdict, face) = match outcome.result {
            Ok(faces) => {
                self.failures = 0;
                let face = primary_face(&faces).cloned();
                (self.classifier.classify_faces(&faces, &spot), face)
            }
            Err(e) => {
                self.failures += 1;
                tracing::warn!(error = %e, consecutive = self.failures, "detection call failed");
                (FramingVerdict::no_face(), None)
            }
        };
        tracing::debug!(message = %verdict.message, severity = verdict.severity.as_str(), "framing verdict");

        let renderer = self
            .renderer
            .get_or_insert_with(|| OverlayRenderer::new(width, height));
        renderer.resize(width, height);
        renderer.render(&verdict, face.as_ref(), &spot);
        self.publish(verdict, face);
    }

    /// The detection task vanished (runtime shutdown); the estimator is gone.
    pub fn on_lost_job(&mut self, error: JoinError) {
        tracing::error!(%error, "detection task lost");
        self.in_flight = false;
        self.detector_lost = true;
        if self.state == LoopState::Running {
            self.publish(FramingVerdict::no_face(), None);
        }
    }

    fn on_source_closed(&mut self) {
        if self.source_closed {
            return;
        }
        tracing::error!("video source closed; no further detections");
        self.source_closed = true;
        if let Some(renderer) = self.renderer.as_mut() {
            renderer.clear();
        }
        self.publish(FramingVerdict::no_face(), None);
    }

    fn geometry_for(&mut self, width: u32, height: u32) -> SweetSpot {
        match &self.geometry {
            Some(g) if g.size == (width, height) => g.sweet_spot,
            _ => {
                let sweet_spot = compute_sweet_spot(width, height);
                tracing::info!(width, height, ?sweet_spot, "frame geometry established");
                self.geometry = Some(FrameGeometry {
                    size: (width, height),
                    sweet_spot,
                });
                sweet_spot
            }
        }
    }

    fn publish_pending(&mut self) {
        let verdict = if self.backend == BackendState::Failed {
            FramingVerdict::unavailable()
        } else {
            FramingVerdict::loading()
        };
        if let Some(renderer) = self.renderer.as_mut() {
            renderer.clear();
        }
        self.publish(verdict, None);
    }

    fn publish(&mut self, verdict: FramingVerdict, face: Option<BoundingBox>) {
        let notice = if self.detector_lost {
            Some(DETECTOR_LOST_NOTICE.to_string())
        } else if self.source_closed {
            Some(SOURCE_CLOSED_NOTICE.to_string())
        } else if self.failures >= DEGRADED_FAILURE_THRESHOLD {
            Some(DEGRADED_NOTICE.to_string())
        } else {
            None
        };
        let snapshot = GuidanceSnapshot {
            caption: Caption::new(&verdict, self.backend),
            verdict,
            loop_state: self.state,
            backend: self.backend,
            compatibility_mode: self.backend.is_compatibility_mode(),
            face,
            sweet_spot: self.geometry.as_ref().map(|g| g.sweet_spot),
            notice,
            frames_analyzed: self.frames_analyzed,
            overlay: self.renderer.as_ref().map(OverlayRenderer::snapshot),
        };
        self.snapshot.send_replace(snapshot);
    }
}

/// Cloneable host-side control: enablement flag and published state.
#[derive(Clone)]
pub struct GuidanceControl {
    enabled: Arc<watch::Sender<bool>>,
    snapshots: watch::Receiver<GuidanceSnapshot>,
    backend: watch::Receiver<BackendState>,
}

impl GuidanceControl {
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.send_if_modified(|current| {
            let changed = *current != enabled;
            *current = enabled;
            changed
        });
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    pub fn snapshot(&self) -> GuidanceSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GuidanceSnapshot> {
        self.snapshots.clone()
    }

    pub fn backend_state(&self) -> BackendState {
        *self.backend.borrow()
    }

    /// Changes to the enablement flag and backend state, for hosts that
    /// push property updates instead of polling.
    pub fn property_changes(&self) -> PropertyWatch {
        PropertyWatch {
            enabled: self.enabled.subscribe(),
            backend: Some(self.backend.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuidanceProperty {
    Enabled,
    Backend,
}

pub struct PropertyWatch {
    enabled: watch::Receiver<bool>,
    backend: Option<watch::Receiver<BackendState>>,
}

impl PropertyWatch {
    /// Next property change. `None` once every [`GuidanceControl`] is gone.
    pub async fn next(&mut self) -> Option<GuidanceProperty> {
        let PropertyWatch { enabled, backend } = self;
        loop {
            let backend_open = backend.is_some();
            tokio::select! {
                changed = enabled.changed() => {
                    return changed.ok().map(|()| GuidanceProperty::Enabled);
                }
                changed = backend_changed(backend), if backend_open => {
                    match changed {
                        Ok(()) => return Some(GuidanceProperty::Backend),
                        // negotiation task ended; the state is final
                        Err(_) => *backend = None,
                    }
                }
            }
        }
    }
}

async fn backend_changed(
    backend: &mut Option<watch::Receiver<BackendState>>,
) -> Result<(), watch::error::RecvError> {
    match backend {
        Some(rx) => rx.changed().await,
        None => std::future::pending().await,
    }
}

/// Owner of a running detection loop. One per guidance session.
pub struct DetectionLoopHandle {
    control: GuidanceControl,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl DetectionLoopHandle {
    pub fn control(&self) -> GuidanceControl {
        self.control.clone()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.control.set_enabled(enabled);
    }

    pub fn snapshot(&self) -> GuidanceSnapshot {
        self.control.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<GuidanceSnapshot> {
        self.control.subscribe()
    }

    /// Tear down the session and wait for the loop task to finish. The final
    /// published snapshot is the cleared, disabled state.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "detection loop task failed");
        }
    }
}

/// Start negotiation and the detection loop on the current tokio runtime.
pub fn spawn<V: VideoSource>(source: V, negotiator: Negotiator, config: SchedulerConfig) -> DetectionLoopHandle {
    let core = DetectionLoop::new(source, config.orientation);
    let status = BackendStatus::new();
    let (enabled_tx, enabled_rx) = watch::channel(config.enabled);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let control = GuidanceControl {
        enabled: Arc::new(enabled_tx),
        snapshots: core.subscribe(),
        backend: status.subscribe(),
    };

    let task = tokio::spawn(drive(
        core,
        negotiator,
        status,
        enabled_rx,
        shutdown_rx,
        config.refresh_period(),
    ));

    DetectionLoopHandle {
        control,
        shutdown: shutdown_tx,
        task,
    }
}

async fn drive<V: VideoSource>(
    mut core: DetectionLoop<V>,
    negotiator: Negotiator,
    status: BackendStatus,
    mut enabled: watch::Receiver<bool>,
    mut shutdown: oneshot::Receiver<()>,
    period: Duration,
) {
    let negotiation = negotiator.initialize(&status);
    tokio::pin!(negotiation);
    let mut negotiating = true;

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut in_flight: Option<JoinHandle<DetectionOutcome>> = None;

    let initial = *enabled.borrow_and_update();
    core.set_enabled(initial);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = enabled.changed() => {
                if changed.is_err() {
                    break;
                }
                let on = *enabled.borrow_and_update();
                core.set_enabled(on);
            }
            result = &mut negotiation, if negotiating => {
                negotiating = false;
                match result {
                    Ok(ready) => core.backend_ready(ready),
                    Err(e) => core.backend_failed(&e),
                }
            }
            joined = join_in_flight(&mut in_flight), if in_flight.is_some() => {
                in_flight = None;
                match joined {
                    Ok(outcome) => core.on_outcome(outcome),
                    Err(e) => core.on_lost_job(e),
                }
            }
            _ = ticker.tick(), if in_flight.is_none() => {
                if let Some(job) = core.on_tick() {
                    in_flight = Some(tokio::task::spawn_blocking(move || job.run()));
                }
            }
        }
    }

    // A detection still running is left to finish on the blocking pool; its
    // outcome is never applied.
    core.stop();
    tracing::info!("detection loop exited");
}

async fn join_in_flight(
    slot: &mut Option<JoinHandle<DetectionOutcome>>,
) -> Result<DetectionOutcome, JoinError> {
    match slot {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendFactory, BackendTier, LibraryProbe};
    use crate::negotiator::RetryPolicy;
    use crate::types::Severity;
    use crate::overlay::GUIDE_COLOR;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::timeout;

    const W: u32 = 1280;
    const H: u32 = 720;

    /// Shared handle: clones see frame swaps and closure.
    #[derive(Clone)]
    struct StaticSource {
        frame: Arc<Mutex<Option<Arc<Frame>>>>,
        closed: Arc<AtomicBool>,
    }

    impl StaticSource {
        fn with(frame: Option<Frame>) -> Self {
            Self {
                frame: Arc::new(Mutex::new(frame.map(Arc::new))),
                closed: Arc::new(AtomicBool::new(false)),
            }
        }

        fn live() -> Self {
            Self::with(Some(Frame::blank(W, H)))
        }

        fn empty() -> Self {
            Self::with(None)
        }

        fn set_frame(&self, frame: Frame) {
            *self.frame.lock().unwrap() = Some(Arc::new(frame));
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    impl VideoSource for StaticSource {
        fn frame_available(&self) -> bool {
            self.frame.lock().unwrap().is_some()
        }

        fn current_frame(&self) -> Option<Arc<Frame>> {
            self.frame.lock().unwrap().clone()
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[derive(Clone)]
    enum Script {
        Sweet,
        Nothing,
        Fail,
    }

    struct FakeEstimator {
        script: Script,
        calls: Arc<AtomicUsize>,
    }

    impl FaceEstimator for FakeEstimator {
        fn estimate_faces(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script {
                Script::Sweet => {
                    let s = compute_sweet_spot(frame.width, frame.height);
                    Ok(vec![BoundingBox::new(s.x, s.y, s.width, s.height)])
                }
                Script::Nothing => Ok(Vec::new()),
                Script::Fail => Err(DetectorError::InferenceFailed("device lost".into())),
            }
        }
    }

    fn ready(script: Script, calls: &Arc<AtomicUsize>) -> ReadyBackend {
        ReadyBackend {
            tier: BackendTier::Accelerated,
            estimator: Box::new(FakeEstimator {
                script,
                calls: Arc::clone(calls),
            }),
        }
    }

    struct Probe(Arc<AtomicBool>);

    impl LibraryProbe for Probe {
        fn libraries_available(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct Factory {
        accelerated_ok: bool,
        script: Script,
        calls: Arc<AtomicUsize>,
    }

    impl BackendFactory for Factory {
        fn create(&self, tier: BackendTier) -> Result<Box<dyn FaceEstimator>, DetectorError> {
            if tier == BackendTier::Accelerated && !self.accelerated_ok {
                return Err(DetectorError::InferenceFailed("no CUDA".into()));
            }
            Ok(Box::new(FakeEstimator {
                script: self.script.clone(),
                calls: Arc::clone(&self.calls),
            }))
        }
    }

    fn negotiator(available: &Arc<AtomicBool>, accelerated_ok: bool, script: Script, calls: &Arc<AtomicUsize>) -> Negotiator {
        Negotiator::new(
            Arc::new(Probe(Arc::clone(available))),
            Arc::new(Factory {
                accelerated_ok,
                script,
                calls: Arc::clone(calls),
            }),
        )
        .with_policy(RetryPolicy {
            attempts: 200,
            interval: Duration::from_millis(5),
        })
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            refresh_hz: 500,
            ..SchedulerConfig::default()
        }
    }

    async fn wait_for(
        rx: &mut watch::Receiver<GuidanceSnapshot>,
        pred: impl Fn(&GuidanceSnapshot) -> bool,
    ) -> GuidanceSnapshot {
        timeout(Duration::from_secs(5), rx.wait_for(|s| pred(s)))
            .await
            .expect("timed out waiting for snapshot")
            .expect("loop dropped")
            .clone()
    }

    // --- state machine, driven by hand ---

    #[test]
    fn test_starts_idle_and_disabled() {
        let core = DetectionLoop::new(StaticSource::live(), DisplayOrientation::Mirrored);
        assert_eq!(core.state(), LoopState::Idle);
        assert!(core.snapshot().verdict.is_disabled());
    }

    #[test]
    fn test_pending_until_backend_ready() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut core = DetectionLoop::new(StaticSource::live(), DisplayOrientation::Mirrored);
        core.set_enabled(true);
        assert_eq!(core.state(), LoopState::BackendPending);
        assert!(core.on_tick().is_none());
        assert_eq!(core.snapshot().verdict, FramingVerdict::loading());

        core.backend_ready(ready(Script::Sweet, &calls));
        assert_eq!(core.state(), LoopState::Running);
        let snap = core.snapshot();
        assert_eq!(snap.loop_state, LoopState::Running);
        assert_eq!(snap.backend, BackendState::ReadyAccelerated);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reenable_with_ready_backend_publishes_running() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut core = DetectionLoop::new(StaticSource::empty(), DisplayOrientation::Mirrored);
        core.backend_ready(ready(Script::Sweet, &calls));
        core.set_enabled(true);
        assert_eq!(core.snapshot().loop_state, LoopState::Running);
        core.set_enabled(false);
        assert_eq!(core.snapshot().loop_state, LoopState::Stopped);
        core.set_enabled(true);
        assert_eq!(core.snapshot().loop_state, LoopState::Running);
    }

    #[test]
    fn test_failed_backend_stays_pending_with_message() {
        let mut core = DetectionLoop::new(StaticSource::live(), DisplayOrientation::Mirrored);
        core.set_enabled(true);
        core.backend_failed(&NegotiationError::LibrariesUnavailable { attempts: 10 });
        assert_eq!(core.state(), LoopState::BackendPending);
        assert!(core.on_tick().is_none());
        let snap = core.snapshot();
        assert_eq!(snap.verdict, FramingVerdict::unavailable());
        assert_eq!(snap.backend, BackendState::Failed);
    }

    #[test]
    fn test_running_tick_classifies_and_renders() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut core = DetectionLoop::new(StaticSource::live(), DisplayOrientation::Mirrored);
        core.backend_ready(ready(Script::Sweet, &calls));
        core.set_enabled(true);

        let job = core.on_tick().expect("job");
        core.on_outcome(job.run());

        let snap = core.snapshot();
        assert_eq!(snap.verdict, FramingVerdict::perfect());
        assert_eq!(snap.loop_state, LoopState::Running);
        assert_eq!(snap.frames_analyzed, 1);
        let spot = snap.sweet_spot.unwrap();
        assert!((spot.x - 416.0).abs() < 1e-3 && (spot.width - 448.0).abs() < 1e-3);
        let overlay = snap.overlay.unwrap();
        assert_eq!(overlay.dimensions(), (W, H));
        assert_eq!(overlay.get_pixel(416, 180).0, Severity::Good.color());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_geometry_follows_frame_size_change() {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = StaticSource::live();
        let mut core = DetectionLoop::new(source.clone(), DisplayOrientation::Mirrored);
        core.backend_ready(ready(Script::Sweet, &calls));
        core.set_enabled(true);

        let job = core.on_tick().unwrap();
        core.on_outcome(job.run());
        let snap = core.snapshot();
        let spot = snap.sweet_spot.unwrap();
        assert!((spot.x - 416.0).abs() < 1e-3 && (spot.width - 448.0).abs() < 1e-3);
        assert_eq!(snap.overlay.unwrap().dimensions(), (W, H));

        source.set_frame(Frame::blank(640, 480));
        let job = core.on_tick().unwrap();
        core.on_outcome(job.run());
        let snap = core.snapshot();
        let spot = snap.sweet_spot.unwrap();
        assert_eq!(spot, compute_sweet_spot(640, 480));
        assert!((spot.x - 208.0).abs() < 1e-3 && (spot.y - 120.0).abs() < 1e-3);
        assert_eq!(snap.verdict, FramingVerdict::perfect());
        let overlay = snap.overlay.unwrap();
        assert_eq!(overlay.dimensions(), (640, 480));
        assert_eq!(overlay.get_pixel(208, 120).0, Severity::Good.color());
    }

    #[test]
    fn test_no_face_overlay_draws_guide_only() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut core = DetectionLoop::new(StaticSource::live(), DisplayOrientation::Mirrored);
        core.backend_ready(ready(Script::Nothing, &calls));
        core.set_enabled(true);
        let job = core.on_tick().unwrap();
        core.on_outcome(job.run());

        let snap = core.snapshot();
        assert!(snap.verdict.show_guide);
        assert!(snap.face.is_none());
        let overlay = snap.overlay.unwrap();
        assert_eq!(*overlay.get_pixel(416, 180), GUIDE_COLOR);
        assert!(overlay.pixels().all(|p| p.0[3] == 0 || *p == GUIDE_COLOR));
    }

    #[test]
    fn test_closed_source_halts_with_notice() {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = StaticSource::live();
        let mut core = DetectionLoop::new(source.clone(), DisplayOrientation::Mirrored);
        core.backend_ready(ready(Script::Sweet, &calls));
        core.set_enabled(true);
        let job = core.on_tick().unwrap();
        core.on_outcome(job.run());
        assert_eq!(core.snapshot().verdict, FramingVerdict::perfect());

        // the last frame is still present but the source has ended
        source.close();
        assert!(core.on_tick().is_none());
        assert!(core.on_tick().is_none());
        let snap = core.snapshot();
        assert_eq!(snap.verdict, FramingVerdict::no_face());
        assert_eq!(snap.notice.as_deref(), Some(SOURCE_CLOSED_NOTICE));
        assert!(snap.face.is_none());
        assert!(snap.overlay.unwrap().pixels().all(|p| p.0[3] == 0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_single_job_in_flight() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut core = DetectionLoop::new(StaticSource::live(), DisplayOrientation::Mirrored);
        core.backend_ready(ready(Script::Sweet, &calls));
        core.set_enabled(true);

        let job = core.on_tick().expect("first job");
        assert!(core.on_tick().is_none(), "second job while first in flight");
        core.on_outcome(job.run());
        assert!(core.on_tick().is_some(), "re-armed after outcome");
    }

    #[test]
    fn test_no_frame_skips_tick() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut core = DetectionLoop::new(StaticSource::empty(), DisplayOrientation::Mirrored);
        core.backend_ready(ready(Script::Sweet, &calls));
        core.set_enabled(true);
        assert!(core.on_tick().is_none());
        assert!(core.on_tick().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stale_outcome_discarded_after_disable() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut core = DetectionLoop::new(StaticSource::live(), DisplayOrientation::Mirrored);
        core.backend_ready(ready(Script::Sweet, &calls));
        core.set_enabled(true);
        let first = core.on_tick().unwrap();
        core.on_outcome(first.run());

        let job = core.on_tick().unwrap();
        core.set_enabled(false);
        core.on_outcome(job.run());

        let snap = core.snapshot();
        assert_eq!(core.state(), LoopState::Stopped);
        assert!(snap.verdict.is_disabled());
        assert!(snap.face.is_none());
        let overlay = snap.overlay.unwrap();
        assert!(overlay.pixels().all(|p| p.0[3] == 0), "overlay not cleared");

        // estimator came back: re-enabling resumes detection
        core.set_enabled(true);
        assert_eq!(core.state(), LoopState::Running);
        assert!(core.on_tick().is_some());
    }

    #[test]
    fn test_outcome_from_previous_session_discarded_after_reenable() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut core = DetectionLoop::new(StaticSource::live(), DisplayOrientation::Mirrored);
        core.backend_ready(ready(Script::Sweet, &calls));
        core.set_enabled(true);
        let job = core.on_tick().unwrap();
        core.set_enabled(false);
        core.set_enabled(true);
        core.on_outcome(job.run());
        assert_eq!(core.snapshot().frames_analyzed, 0);
    }

    #[test]
    fn test_consecutive_failures_raise_notice() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut core = DetectionLoop::new(StaticSource::live(), DisplayOrientation::Mirrored);
        core.backend_ready(ready(Script::Fail, &calls));
        core.set_enabled(true);

        for i in 1..=DEGRADED_FAILURE_THRESHOLD {
            let job = core.on_tick().unwrap();
            core.on_outcome(job.run());
            let snap = core.snapshot();
            assert_eq!(snap.verdict, FramingVerdict::no_face());
            assert_eq!(snap.notice.is_some(), i >= DEGRADED_FAILURE_THRESHOLD, "after {i} failures");
        }
        assert_eq!(core.state(), LoopState::Running);
    }

    #[test]
    fn test_panicking_estimator_is_recovered() {
        struct Explodes;
        impl FaceEstimator for Explodes {
            fn estimate_faces(&mut self, _frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
                panic!("boom");
            }
        }

        let mut core = DetectionLoop::new(StaticSource::live(), DisplayOrientation::Mirrored);
        core.backend_ready(ReadyBackend {
            tier: BackendTier::Fallback,
            estimator: Box::new(Explodes),
        });
        core.set_enabled(true);
        let job = core.on_tick().unwrap();
        core.on_outcome(job.run());
        assert_eq!(core.snapshot().verdict, FramingVerdict::no_face());
        assert!(core.on_tick().is_some());
    }

    #[test]
    fn test_no_face_verdict() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut core = DetectionLoop::new(StaticSource::live(), DisplayOrientation::Mirrored);
        core.backend_ready(ready(Script::Nothing, &calls));
        core.set_enabled(true);
        let job = core.on_tick().unwrap();
        core.on_outcome(job.run());
        let snap = core.snapshot();
        assert_eq!(snap.verdict, FramingVerdict::no_face());
        assert!(snap.notice.is_none());
    }

    // --- full loop on the runtime ---

    #[tokio::test]
    async fn test_property_watch_reports_changes() {
        let (enabled_tx, _enabled_rx) = watch::channel(true);
        let status = BackendStatus::new();
        let (_snap_tx, snap_rx) = watch::channel(GuidanceSnapshot::idle());
        let control = GuidanceControl {
            enabled: Arc::new(enabled_tx),
            snapshots: snap_rx,
            backend: status.subscribe(),
        };
        let mut changes = control.property_changes();
        let soon = Duration::from_secs(1);

        control.set_enabled(false);
        assert_eq!(timeout(soon, changes.next()).await.unwrap(), Some(GuidanceProperty::Enabled));

        status.advance(BackendState::ReadyFallback);
        assert_eq!(timeout(soon, changes.next()).await.unwrap(), Some(GuidanceProperty::Backend));

        // same value again is not a change
        control.set_enabled(false);
        drop(status);
        assert!(timeout(Duration::from_millis(50), changes.next()).await.is_err());

        drop(control);
        assert_eq!(timeout(soon, changes.next()).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_loop_reaches_perfect_on_fallback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let available = Arc::new(AtomicBool::new(true));
        let handle = spawn(
            StaticSource::live(),
            negotiator(&available, false, Script::Sweet, &calls),
            fast_config(),
        );
        let mut rx = handle.subscribe();
        let snap = wait_for(&mut rx, |s| s.verdict == FramingVerdict::perfect()).await;
        assert_eq!(snap.backend, BackendState::ReadyFallback);
        assert!(snap.compatibility_mode);
        assert_eq!(snap.caption.secondary, Some(crate::overlay::COMPATIBILITY_LABEL));
        assert_eq!(handle.control().backend_state(), BackendState::ReadyFallback);
        handle.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_loading_verdict_while_libraries_missing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let available = Arc::new(AtomicBool::new(false));
        let handle = spawn(
            StaticSource::live(),
            negotiator(&available, true, Script::Sweet, &calls),
            fast_config(),
        );
        let mut rx = handle.subscribe();
        let snap = wait_for(&mut rx, |s| s.loop_state == LoopState::BackendPending).await;
        assert_eq!(snap.verdict, FramingVerdict::loading());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // libraries show up late: negotiation succeeds within its budget
        available.store(true, Ordering::SeqCst);
        let snap = wait_for(&mut rx, |s| s.verdict == FramingVerdict::perfect()).await;
        assert_eq!(snap.backend, BackendState::ReadyAccelerated);
        assert!(!snap.compatibility_mode);
        handle.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unavailable_backend_never_runs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let available = Arc::new(AtomicBool::new(false));
        let negotiator = negotiator(&available, true, Script::Sweet, &calls).with_policy(RetryPolicy {
            attempts: 2,
            interval: Duration::from_millis(1),
        });
        let handle = spawn(StaticSource::live(), negotiator, fast_config());
        let mut rx = handle.subscribe();
        let snap = wait_for(&mut rx, |s| s.verdict == FramingVerdict::unavailable()).await;
        assert_eq!(snap.backend, BackendState::Failed);
        assert_eq!(snap.loop_state, LoopState::BackendPending);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        handle.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disable_stops_detection_and_clears() {
        let calls = Arc::new(AtomicUsize::new(0));
        let available = Arc::new(AtomicBool::new(true));
        let handle = spawn(
            StaticSource::live(),
            negotiator(&available, true, Script::Sweet, &calls),
            fast_config(),
        );
        let mut rx = handle.subscribe();
        wait_for(&mut rx, |s| s.verdict == FramingVerdict::perfect()).await;

        handle.set_enabled(false);
        let snap = wait_for(&mut rx, |s| s.loop_state == LoopState::Stopped).await;
        assert!(snap.verdict.is_disabled());
        assert!(snap.overlay.unwrap().pixels().all(|p| p.0[3] == 0));

        // allow a possibly in-flight call to land, then verify no new calls
        tokio::time::sleep(Duration::from_millis(50)).await;
        let settled = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), settled);
        assert!(handle.snapshot().verdict.is_disabled());

        handle.set_enabled(true);
        wait_for(&mut rx, |s| s.verdict == FramingVerdict::perfect()).await;
        handle.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_publishes_disabled_state() {
        let calls = Arc::new(AtomicUsize::new(0));
        let available = Arc::new(AtomicBool::new(true));
        let handle = spawn(
            StaticSource::live(),
            negotiator(&available, true, Script::Sweet, &calls),
            fast_config(),
        );
        let mut rx = handle.subscribe();
        wait_for(&mut rx, |s| s.loop_state == LoopState::Running).await;
        handle.shutdown().await;
        let last = rx.borrow().clone();
        assert_eq!(last.loop_state, LoopState::Stopped);
        assert!(last.verdict.is_disabled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_starts_idle_when_disabled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let available = Arc::new(AtomicBool::new(true));
        let handle = spawn(
            StaticSource::live(),
            negotiator(&available, true, Script::Sweet, &calls),
            SchedulerConfig {
                enabled: false,
                ..fast_config()
            },
        );
        // negotiation still completes in the background
        let mut backend = handle.control().backend.clone();
        timeout(Duration::from_secs(5), backend.wait_for(|b| b.is_ready()))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let snap = handle.snapshot();
        assert_eq!(snap.loop_state, LoopState::Idle);
        assert!(snap.verdict.is_disabled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        handle.shutdown().await;
    }
}
