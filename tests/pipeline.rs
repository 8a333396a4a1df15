// End-to-end runs of the perception loop with scripted collaborators

use async_trait::async_trait;
use fer_pipeline::emotion::{Classifier, InferenceScheduler};
use fer_pipeline::error::Result;
use fer_pipeline::models::{DetectionResult, Emotion, EmotionEvent, FaceBox, Frame, PixelRegion};
use fer_pipeline::perception::{
    DetectionBatch, LoopState, PerceptionLoop, RenderEvent, RenderSink,
};
use fer_pipeline::publisher::EventSink;
use fer_pipeline::region::NormalizedSample;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// Returns fixed logits, optionally holding each call until released
struct ScriptedClassifier {
    logits: Vec<f32>,
    calls: Arc<AtomicUsize>,
    gate: Option<Arc<Notify>>,
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, _sample: NormalizedSample) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(self.logits.clone())
    }
}

#[derive(Default)]
struct RecordingRenderer(Mutex<Vec<RenderEvent>>);

impl RecordingRenderer {
    fn events(&self) -> Vec<RenderEvent> {
        self.0.lock().unwrap().clone()
    }

    fn emotions(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, RenderEvent::Emotion(_)))
            .count()
    }
}

impl RenderSink for RecordingRenderer {
    fn render(&self, event: RenderEvent) {
        self.0.lock().unwrap().push(event);
    }
}

#[derive(Default)]
struct RecordingSink(Mutex<Vec<EmotionEvent>>);

impl RecordingSink {
    fn events(&self) -> Vec<EmotionEvent> {
        self.0.lock().unwrap().clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: EmotionEvent) {
        self.0.lock().unwrap().push(event);
    }
}

struct Harness {
    perception: PerceptionLoop<ScriptedClassifier>,
    renderer: Arc<RecordingRenderer>,
    sink: Arc<RecordingSink>,
    calls: Arc<AtomicUsize>,
}

fn harness(logits: Vec<f32>, gate: Option<Arc<Notify>>) -> Harness {
    let calls = Arc::new(AtomicUsize::new(0));
    let renderer = Arc::new(RecordingRenderer::default());
    let sink = Arc::new(RecordingSink::default());
    let classifier = ScriptedClassifier {
        logits,
        calls: calls.clone(),
        gate,
    };
    let perception = PerceptionLoop::new(
        InferenceScheduler::new(classifier),
        renderer.clone(),
        sink.clone(),
        Some("fer_client_0123456789abcdef".to_string()),
    );
    Harness {
        perception,
        renderer,
        sink,
        calls,
    }
}

fn angry_logits() -> Vec<f32> {
    vec![5.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
}

fn centered_face() -> DetectionResult {
    DetectionResult::new(vec![FaceBox::new(0.5, 0.5, 0.3, 0.3)])
}

#[tokio::test]
async fn test_single_face_is_classified_and_published() {
    let h = harness(angry_logits(), None);
    h.perception.start().unwrap();

    let frame = Frame::filled(640, 480, [120, 90, 60]);
    let outcome = h.perception.on_detections(&frame, &centered_face());
    assert_eq!(outcome.regions.len(), 1);
    outcome
        .classification
        .expect("first face should be classified")
        .await
        .unwrap();

    assert_eq!(h.calls.load(Ordering::SeqCst), 1);

    let rendered = h.renderer.events();
    assert!(matches!(&rendered[0], RenderEvent::Faces(faces) if faces.len() == 1));
    let overlay = match &rendered[1] {
        RenderEvent::Emotion(overlay) => *overlay,
        other => panic!("expected an emotion overlay, got {other:?}"),
    };
    assert_eq!(overlay.score.emotion, Emotion::Angry);
    assert!(overlay.score.probability > 0.9);

    let events = h.sink.events();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.emotion, Emotion::Angry);
    assert!(event.confidence > 0.9);
    assert_eq!(
        event.device_id.as_deref(),
        Some("fer_client_0123456789abcdef")
    );
    let region = event.region.expect("event carries the face region");
    assert_eq!((region.w, region.h), (192, 144));
    assert!(region.x + region.w <= 640 && region.y + region.h <= 480);
}

#[tokio::test]
async fn test_frame_without_faces_renders_no_face() {
    let h = harness(angry_logits(), None);
    h.perception.start().unwrap();

    let frame = Frame::filled(640, 480, [0, 0, 0]);
    let outcome = h.perception.on_detections(&frame, &DetectionResult::empty());

    assert!(outcome.regions.is_empty());
    assert!(outcome.classification.is_none());
    assert_eq!(h.renderer.events(), vec![RenderEvent::NoFace]);
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    assert!(h.sink.events().is_empty());
}

#[tokio::test]
async fn test_result_arriving_after_stop_is_discarded() {
    let gate = Arc::new(Notify::new());
    let h = harness(angry_logits(), Some(gate.clone()));
    h.perception.start().unwrap();

    let frame = Frame::filled(640, 480, [200, 200, 200]);
    let outcome = h.perception.on_detections(&frame, &centered_face());
    let pending = outcome.classification.expect("classification started");

    h.perception.stop();
    assert_eq!(h.perception.state(), LoopState::Idle);
    gate.notify_one();
    pending.await.unwrap();

    assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.renderer.emotions(), 0);
    assert!(h.sink.events().is_empty());
}

#[tokio::test]
async fn test_result_from_previous_run_is_discarded_after_restart() {
    let gate = Arc::new(Notify::new());
    let h = harness(angry_logits(), Some(gate.clone()));
    h.perception.start().unwrap();

    let frame = Frame::filled(640, 480, [10, 20, 30]);
    let pending = h
        .perception
        .on_detections(&frame, &centered_face())
        .classification
        .expect("classification started");

    h.perception.stop();
    h.perception.start().unwrap();
    gate.notify_one();
    pending.await.unwrap();

    assert_eq!(h.renderer.emotions(), 0);
    assert!(h.sink.events().is_empty());
}

#[tokio::test]
async fn test_only_one_face_classified_per_window() {
    let h = harness(angry_logits(), None);
    h.perception.start().unwrap();

    let frame = Frame::filled(640, 480, [80, 80, 80]);
    let detections = DetectionResult::new(vec![
        FaceBox::new(0.25, 0.5, 0.2, 0.3),
        FaceBox::new(0.75, 0.5, 0.2, 0.3),
    ]);
    let outcome = h.perception.on_detections(&frame, &detections);
    assert_eq!(outcome.regions.len(), 2);
    outcome.classification.unwrap().await.unwrap();

    // Still inside the window: boxes are drawn, nothing is classified
    let again = h.perception.on_detections(&frame, &detections);
    assert!(again.classification.is_none());

    assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.sink.events().len(), 1);
    let faces_rendered = h
        .renderer
        .events()
        .iter()
        .filter(|e| matches!(e, RenderEvent::Faces(f) if f.len() == 2))
        .count();
    assert_eq!(faces_rendered, 2);
}

#[tokio::test]
async fn test_degenerate_face_is_drawn_but_not_classified() {
    let h = harness(angry_logits(), None);
    h.perception.start().unwrap();

    let frame = Frame::filled(640, 480, [80, 80, 80]);
    // Entirely right of the frame
    let detections = DetectionResult::new(vec![FaceBox::new(1.5, 0.5, 0.2, 0.2)]);
    let outcome = h.perception.on_detections(&frame, &detections);

    assert_eq!(outcome.regions.len(), 1);
    assert!(outcome.regions[0].is_degenerate());
    assert!(outcome.classification.is_none());
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);

    // The skipped face did not use up the window
    let next = h.perception.on_detections(&frame, &centered_face());
    next.classification.unwrap().await.unwrap();
    assert_eq!(h.sink.events().len(), 1);
}

#[tokio::test]
async fn test_run_consumes_batches_until_channel_closes() {
    let h = harness(angry_logits(), None);
    h.perception.start().unwrap();

    let (tx, rx) = mpsc::channel(2);
    tx.send(DetectionBatch {
        frame: Frame::filled(640, 480, [50, 60, 70]),
        detections: centered_face(),
    })
    .await
    .unwrap();
    drop(tx);

    h.perception.run(rx).await;

    // The classification runs on its own task; give it a moment to land
    tokio::time::timeout(Duration::from_secs(2), async {
        while h.sink.events().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("event published");

    let events = h.sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].region,
        Some(PixelRegion::from_face_box(&centered_face().faces[0], 640, 480))
    );
}

/// Stops the loop that feeds it as soon as an emotion arrives
#[derive(Default)]
struct StopOnEmotion {
    perception: OnceLock<Arc<PerceptionLoop<ScriptedClassifier>>>,
    seen_state: Mutex<Option<LoopState>>,
}

impl RenderSink for StopOnEmotion {
    fn render(&self, event: RenderEvent) {
        if let (RenderEvent::Emotion(_), Some(perception)) = (event, self.perception.get()) {
            *self.seen_state.lock().unwrap() = Some(perception.state());
            perception.stop();
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sink_may_stop_the_loop_from_a_callback() {
    let renderer = Arc::new(StopOnEmotion::default());
    let sink = Arc::new(RecordingSink::default());
    let classifier = ScriptedClassifier {
        logits: angry_logits(),
        calls: Arc::new(AtomicUsize::new(0)),
        gate: None,
    };
    let perception = Arc::new(PerceptionLoop::new(
        InferenceScheduler::new(classifier),
        renderer.clone(),
        sink.clone(),
        None,
    ));
    assert!(renderer.perception.set(perception.clone()).is_ok());
    perception.start().unwrap();

    let frame = Frame::filled(640, 480, [120, 90, 60]);
    let pending = perception
        .on_detections(&frame, &centered_face())
        .classification
        .expect("classification started");

    tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("delivery finished without deadlock")
        .unwrap();

    assert_eq!(*renderer.seen_state.lock().unwrap(), Some(LoopState::Running));
    assert_eq!(perception.state(), LoopState::Idle);
    // The result being delivered when stop was requested still goes out
    assert_eq!(sink.events().len(), 1);

    // Once stopped, new detections are ignored
    let outcome = perception.on_detections(&frame, &centered_face());
    assert!(outcome.classification.is_none());
}
