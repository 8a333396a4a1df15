// Perception loop: turns per-frame detections into throttled classifications

use crate::emotion::{Classifier, InferenceScheduler};
use crate::error::Result;
use crate::models::{DetectionResult, EmotionEvent, EmotionScore, Frame, PixelRegion};
use crate::publisher::EventSink;
use crate::region::RegionExtractor;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A detected face, for drawing its bounding box
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FaceOverlay {
    pub region: PixelRegion,
    pub detection_confidence: f32,
}

/// The top classification for one face
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EmotionOverlay {
    pub score: EmotionScore,
    pub region: PixelRegion,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RenderEvent {
    /// The detector found no face in the frame
    NoFace,
    /// Faces found in the frame, in detector order
    Faces(Vec<FaceOverlay>),
    /// A classification result to draw next to its face
    Emotion(EmotionOverlay),
}

/// Receives what should be drawn over the video. Implementations must not
/// block. They may query or stop the loop that calls them.
pub trait RenderSink: Send + Sync {
    fn render(&self, event: RenderEvent);
}

/// A frame and the detector's output for it
#[derive(Clone, Debug)]
pub struct DetectionBatch {
    pub frame: Frame,
    pub detections: DetectionResult,
}

/// What the loop did with one detection callback
#[derive(Debug, Default)]
pub struct FrameOutcome {
    /// Pixel regions of the faces, in detector order
    pub regions: Vec<PixelRegion>,
    /// Classification launched for this frame, if any
    pub classification: Option<JoinHandle<()>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
}

thread_local! {
    /// Set while this thread is inside the render and event sinks
    static DELIVERING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as delivering until dropped
struct DeliveryMark {
    previous: bool,
}

impl DeliveryMark {
    fn enter() -> Self {
        Self {
            previous: DELIVERING.with(|d| d.replace(true)),
        }
    }
}

impl Drop for DeliveryMark {
    fn drop(&mut self) {
        DELIVERING.with(|d| d.set(self.previous));
    }
}

/// Running flag and epoch, changed only while holding `gate`.
///
/// Delivery holds the gate across the sink calls, so a `stop` from another
/// thread waits until the result is out. A sink calling back into the loop
/// already holds the gate and proceeds without taking it again.
#[derive(Debug, Default)]
struct RunState {
    gate: Mutex<()>,
    running: AtomicBool,
    /// Bumped on every start and stop; results from another epoch are stale
    epoch: AtomicU64,
}

impl RunState {
    fn sequenced<R>(&self, f: impl FnOnce() -> R) -> R {
        if DELIVERING.with(Cell::get) {
            return f();
        }
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    fn state(&self) -> LoopState {
        if self.running.load(Ordering::SeqCst) {
            LoopState::Running
        } else {
            LoopState::Idle
        }
    }

    /// The current epoch, if running
    fn running_epoch(&self) -> Option<u64> {
        self.sequenced(|| {
            self.running
                .load(Ordering::SeqCst)
                .then(|| self.epoch.load(Ordering::SeqCst))
        })
    }
}

/// Everything a finished classification needs to report its result
struct Outlet {
    run: RunState,
    renderer: Arc<dyn RenderSink>,
    events: Arc<dyn EventSink>,
    device_id: Option<String>,
}

impl Outlet {
    /// Renders and publishes `score` unless the loop was stopped or
    /// restarted since `epoch`.
    fn deliver(&self, epoch: u64, score: EmotionScore, region: PixelRegion) {
        let run = &self.run;
        run.sequenced(|| {
            let current = run.epoch.load(Ordering::SeqCst);
            if !run.running.load(Ordering::SeqCst) || current != epoch {
                debug!("Discarding {} result that arrived after stop", score.emotion);
                return;
            }
            let _mark = DeliveryMark::enter();
            self.renderer
                .render(RenderEvent::Emotion(EmotionOverlay { score, region }));
            self.events.emit(EmotionEvent::new(
                self.device_id.clone(),
                score.emotion,
                score.probability,
                Some(region),
            ));
        });
    }
}

/// Orchestrates region extraction, classification, rendering and event
/// publishing for a stream of detection results.
pub struct PerceptionLoop<C> {
    extractor: RegionExtractor,
    scheduler: InferenceScheduler<C>,
    outlet: Arc<Outlet>,
}

impl<C: Classifier> PerceptionLoop<C> {
    pub fn new(
        scheduler: InferenceScheduler<C>,
        renderer: Arc<dyn RenderSink>,
        events: Arc<dyn EventSink>,
        device_id: Option<String>,
    ) -> Self {
        Self {
            extractor: RegionExtractor::new(),
            scheduler,
            outlet: Arc::new(Outlet {
                run: RunState::default(),
                renderer,
                events,
                device_id,
            }),
        }
    }

    pub fn state(&self) -> LoopState {
        self.outlet.run.state()
    }

    /// Enters `Running`. Fails, leaving the loop idle, if the classifier
    /// cannot serve requests.
    pub fn start(&self) -> Result<()> {
        self.scheduler.classifier().ensure_ready()?;
        let run = &self.outlet.run;
        run.sequenced(|| {
            if run.running.load(Ordering::SeqCst) {
                warn!("Perception loop already running");
                return;
            }
            run.epoch.fetch_add(1, Ordering::SeqCst);
            run.running.store(true, Ordering::SeqCst);
            info!("Perception loop started");
        });
        Ok(())
    }

    /// Returns to `Idle`. Results of classifications still in flight are
    /// discarded when they arrive.
    pub fn stop(&self) {
        let run = &self.outlet.run;
        run.sequenced(|| {
            if !run.running.load(Ordering::SeqCst) {
                return;
            }
            run.running.store(false, Ordering::SeqCst);
            run.epoch.fetch_add(1, Ordering::SeqCst);
            info!("Perception loop stopped");
        });
    }

    /// Handles the detector's output for one frame.
    ///
    /// Face boxes are rendered immediately. The first face that passes the
    /// throttle is classified on a spawned task, so this returns without
    /// waiting for the classifier. Without a tokio runtime on the calling
    /// thread no classification is started.
    pub fn on_detections(&self, frame: &Frame, detections: &DetectionResult) -> FrameOutcome {
        let Some(epoch) = self.outlet.run.running_epoch() else {
            return FrameOutcome::default();
        };

        if detections.is_empty() {
            self.outlet.renderer.render(RenderEvent::NoFace);
            return FrameOutcome::default();
        }

        let overlays: Vec<FaceOverlay> = detections
            .faces
            .iter()
            .map(|face| FaceOverlay {
                region: PixelRegion::from_face_box(face, frame.width, frame.height),
                detection_confidence: face.confidence,
            })
            .collect();
        let regions: Vec<PixelRegion> = overlays.iter().map(|o| o.region).collect();
        self.outlet.renderer.render(RenderEvent::Faces(overlays));

        let classification = self.classify_first_eligible(epoch, frame, &regions);
        FrameOutcome {
            regions,
            classification,
        }
    }

    /// Extracts faces in detector order and classifies the first one the
    /// throttle lets through. Faces that fail extraction leave the window
    /// untouched.
    fn classify_first_eligible(
        &self,
        epoch: u64,
        frame: &Frame,
        regions: &[PixelRegion],
    ) -> Option<JoinHandle<()>> {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("Cannot classify outside an async runtime: {}", e);
                return None;
            }
        };

        for region in regions {
            if region.is_degenerate() || !self.scheduler.is_open(Instant::now()) {
                continue;
            }
            let sample = match self.extractor.extract_region(region, frame) {
                Ok(Some(sample)) => sample,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to extract face region: {}", e);
                    continue;
                }
            };
            let Some(permit) = self.scheduler.try_acquire(Instant::now()) else {
                continue;
            };

            let outlet = Arc::clone(&self.outlet);
            let region = *region;
            return Some(runtime.spawn(async move {
                match permit.classify(sample).await {
                    Ok(distribution) => outlet.deliver(epoch, distribution.top(), region),
                    Err(e) => warn!("No emotion for face at {:?}: {}", region, e),
                }
            }));
        }
        None
    }

    /// Processes batches from `frames` until the channel closes. Batches
    /// received while idle are ignored.
    pub async fn run(&self, mut frames: mpsc::Receiver<DetectionBatch>) {
        while let Some(batch) = frames.recv().await {
            let _ = self.on_detections(&batch.frame, &batch.detections);
        }
        debug!("Detection channel closed");
    }
}
