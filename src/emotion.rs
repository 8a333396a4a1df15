// Emotion classification: classifier boundary, throttling and output normalization

use crate::error::{FerError, Result};
use crate::models::{Emotion, EmotionScore};
use crate::region::NormalizedSample;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Minimum spacing between classifier invocations
pub const DEFAULT_PREDICTION_INTERVAL: Duration = Duration::from_millis(300);

/// Raw outputs whose sum is this close to 1.0 are already probabilities
const PROBABILITY_SUM_TOLERANCE: f32 = 0.01;

/// An emotion model seen as an opaque async function from a sample to a
/// raw score vector of length 7.
#[async_trait]
pub trait Classifier: Send + Sync + 'static {
    /// Runs the model. The sample is consumed and released when the call
    /// returns, whatever the outcome.
    async fn classify(&self, sample: NormalizedSample) -> Result<Vec<f32>>;

    /// Reports whether the model can serve requests. Called once before the
    /// perception loop starts.
    fn ensure_ready(&self) -> Result<()> {
        Ok(())
    }
}

/// A model with a synchronous calling convention
pub trait BlockingClassifier: Send + 'static {
    fn classify_blocking(&mut self, sample: &NormalizedSample) -> Result<Vec<f32>>;
}

/// Runs a [`BlockingClassifier`] on tokio's blocking pool so it can sit
/// behind the async [`Classifier`] interface.
pub struct OffloadedClassifier<B> {
    inner: Arc<Mutex<B>>,
}

impl<B: BlockingClassifier> OffloadedClassifier<B> {
    pub fn new(classifier: B) -> Self {
        Self {
            inner: Arc::new(Mutex::new(classifier)),
        }
    }
}

#[async_trait]
impl<B: BlockingClassifier> Classifier for OffloadedClassifier<B> {
    async fn classify(&self, sample: NormalizedSample) -> Result<Vec<f32>> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut classifier = inner.lock().unwrap_or_else(PoisonError::into_inner);
            classifier.classify_blocking(&sample)
        })
        .await
        .map_err(|e| FerError::Classification(format!("Classifier task failed: {e}")))?
    }
}

/// Probabilities over all seven labels, sorted from most to least likely
#[derive(Clone, Debug, PartialEq)]
pub struct EmotionDistribution {
    scores: Vec<EmotionScore>,
}

impl EmotionDistribution {
    /// Normalizes a raw classifier output.
    ///
    /// Values in [0, 1] already summing to 1.0 (within 0.01) are taken as
    /// probabilities; anything else is treated as logits and passed through
    /// softmax.
    pub fn from_model_output(raw: &[f32]) -> Result<Self> {
        if raw.len() != Emotion::ALL.len() {
            return Err(FerError::InvalidModelOutput {
                expected: Emotion::ALL.len(),
                actual: raw.len(),
            });
        }
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(FerError::Classification(format!(
                "Classifier returned non-finite scores: {raw:?}"
            )));
        }

        let sum: f32 = raw.iter().sum();
        let in_unit_range = raw.iter().all(|v| (0.0..=1.0).contains(v));
        let probabilities = if in_unit_range && (sum - 1.0).abs() <= PROBABILITY_SUM_TOLERANCE {
            raw.to_vec()
        } else {
            softmax(raw)
        };

        let mut scores: Vec<EmotionScore> = Emotion::ALL
            .iter()
            .zip(probabilities)
            .map(|(&emotion, probability)| EmotionScore::new(emotion, probability))
            .collect();
        scores.sort_by(|a, b| b.probability.total_cmp(&a.probability));

        Ok(Self { scores })
    }

    /// The most likely label
    pub fn top(&self) -> EmotionScore {
        self.scores[0]
    }

    pub fn scores(&self) -> &[EmotionScore] {
        &self.scores
    }

    pub fn probability_of(&self, emotion: Emotion) -> f32 {
        self.scores
            .iter()
            .find(|s| s.emotion == emotion)
            .map(|s| s.probability)
            .unwrap_or(0.0)
    }
}

/// Numerically stable softmax: the maximum is subtracted before
/// exponentiating.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max_logit).exp()).collect();
    let exp_sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / exp_sum).collect()
}

#[derive(Debug, Default)]
struct ThrottleGate {
    last_invocation: Option<Instant>,
    in_flight: bool,
}

/// Rate-limits classifier invocations and owns the classifier.
///
/// One throttle window is shared by every face the scheduler sees, so in a
/// multi-face frame only one face is classified per window.
pub struct InferenceScheduler<C> {
    classifier: Arc<C>,
    gate: Arc<Mutex<ThrottleGate>>,
    interval: Duration,
}

impl<C: Classifier> InferenceScheduler<C> {
    pub fn new(classifier: C) -> Self {
        Self::with_interval(classifier, DEFAULT_PREDICTION_INTERVAL)
    }

    pub fn with_interval(classifier: C, interval: Duration) -> Self {
        Self {
            classifier: Arc::new(classifier),
            gate: Arc::new(Mutex::new(ThrottleGate::default())),
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn classifier(&self) -> &C {
        &self.classifier
    }

    /// Whether [`InferenceScheduler::try_acquire`] would currently succeed.
    /// Claims nothing.
    pub fn is_open(&self, now: Instant) -> bool {
        let gate = lock_gate(&self.gate);
        !gate.in_flight
            && gate
                .last_invocation
                .map_or(true, |last| now.saturating_duration_since(last) >= self.interval)
    }

    /// Claims the next invocation slot if the throttle window has elapsed
    /// and no classification is in flight. Check and update happen under one
    /// lock.
    pub fn try_acquire(&self, now: Instant) -> Option<InferencePermit<C>> {
        let mut gate = lock_gate(&self.gate);
        if gate.in_flight {
            debug!("Classification already in flight, skipping");
            return None;
        }
        if let Some(last) = gate.last_invocation {
            if now.saturating_duration_since(last) < self.interval {
                return None;
            }
        }
        gate.last_invocation = Some(now);
        gate.in_flight = true;

        Some(InferencePermit {
            classifier: Arc::clone(&self.classifier),
            gate: Arc::clone(&self.gate),
        })
    }

    /// Classifies `sample` unless throttled.
    ///
    /// Returns `Ok(None)` without touching the classifier when the previous
    /// invocation was less than one interval ago.
    pub async fn maybe_classify(
        &self,
        sample: NormalizedSample,
        now: Instant,
    ) -> Result<Option<EmotionDistribution>> {
        match self.try_acquire(now) {
            Some(permit) => permit.classify(sample).await.map(Some),
            None => Ok(None),
        }
    }
}

/// The right to run one classification. Dropping it, whether after a
/// result, an error or cancellation, frees the in-flight slot.
pub struct InferencePermit<C> {
    classifier: Arc<C>,
    gate: Arc<Mutex<ThrottleGate>>,
}

impl<C: Classifier> InferencePermit<C> {
    pub async fn classify(self, sample: NormalizedSample) -> Result<EmotionDistribution> {
        let raw = self.classifier.classify(sample).await.map_err(|e| {
            warn!("Emotion classification failed: {}", e);
            e
        })?;
        EmotionDistribution::from_model_output(&raw)
    }
}

impl<C> Drop for InferencePermit<C> {
    fn drop(&mut self) {
        lock_gate(&self.gate).in_flight = false;
    }
}

fn lock_gate(gate: &Mutex<ThrottleGate>) -> MutexGuard<'_, ThrottleGate> {
    gate.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FaceBox, Frame};
    use crate::region::RegionExtractor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedClassifier {
        output: Vec<f32>,
        calls: AtomicUsize,
    }

    impl FixedClassifier {
        fn new(output: Vec<f32>) -> Self {
            Self {
                output,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Classifier for FixedClassifier {
        async fn classify(&self, _sample: NormalizedSample) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.output.clone())
        }
    }

    struct FailingClassifier;

    #[async_trait]
    impl Classifier for FailingClassifier {
        async fn classify(&self, _sample: NormalizedSample) -> Result<Vec<f32>> {
            Err(FerError::Classification("model crashed".to_string()))
        }
    }

    struct CountingBlocking(usize);

    impl BlockingClassifier for CountingBlocking {
        fn classify_blocking(&mut self, _sample: &NormalizedSample) -> Result<Vec<f32>> {
            self.0 += 1;
            Ok(vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0])
        }
    }

    fn sample() -> NormalizedSample {
        let frame = Frame::filled(64, 64, [128, 128, 128]);
        RegionExtractor::new()
            .extract(&FaceBox::new(0.5, 0.5, 0.5, 0.5), &frame)
            .unwrap()
            .unwrap()
    }

    fn assert_normalized(dist: &EmotionDistribution) {
        let sum: f32 = dist.scores().iter().map(|s| s.probability).sum();
        assert!((sum - 1.0).abs() <= 0.01, "sum = {sum}");
        assert!(dist
            .scores()
            .windows(2)
            .all(|w| w[0].probability >= w[1].probability));
        for emotion in Emotion::ALL {
            assert_eq!(
                dist.scores().iter().filter(|s| s.emotion == emotion).count(),
                1
            );
        }
    }

    #[test]
    fn test_logits_are_softmaxed_and_sorted() {
        let dist = EmotionDistribution::from_model_output(&[0.1, -2.0, 3.0, 7.5, 0.0, 1.0, -0.3])
            .unwrap();
        assert_normalized(&dist);
        assert_eq!(dist.top().emotion, Emotion::Happy);
    }

    #[test]
    fn test_probabilities_pass_through() {
        let raw = [0.05, 0.05, 0.1, 0.2, 0.4, 0.1, 0.1];
        let dist = EmotionDistribution::from_model_output(&raw).unwrap();
        assert_eq!(dist.top().emotion, Emotion::Neutral);
        assert!((dist.probability_of(Emotion::Neutral) - 0.4).abs() < 1e-6);
        assert_normalized(&dist);
    }

    #[test]
    fn test_logits_summing_to_one_are_softmaxed() {
        let raw = [3.0, -2.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let dist = EmotionDistribution::from_model_output(&raw).unwrap();
        assert_normalized(&dist);
        assert_eq!(dist.top().emotion, Emotion::Angry);
        assert!(dist.top().probability < 1.0);
        assert!(dist.scores().iter().all(|s| (0.0..=1.0).contains(&s.probability)));
    }

    #[test]
    fn test_arbitrary_outputs_normalize() {
        let vectors: [[f32; 7]; 5] = [
            [0.0; 7],
            [1000.0, 999.0, -1000.0, 0.0, 5.0, 5.0, 5.0],
            [-50.0, -51.0, -52.0, -53.0, -54.0, -55.0, -56.0],
            [0.9, 0.9, 0.9, 0.9, 0.9, 0.9, 0.9],
            [88.0, 89.0, 90.0, 0.0, 0.0, 0.0, 0.0],
        ];
        for raw in vectors {
            assert_normalized(&EmotionDistribution::from_model_output(&raw).unwrap());
        }
    }

    #[test]
    fn test_softmax_shift_invariance() {
        let logits = [1.0, 2.0, -0.5, 0.0, 3.25, -4.0, 0.5];
        let base = softmax(&logits);
        for c in [-100.0f32, -1.5, 0.0, 42.0, 500.0] {
            let shifted: Vec<f32> = logits.iter().map(|v| v + c).collect();
            for (a, b) in base.iter().zip(softmax(&shifted)) {
                assert!((a - b).abs() < 1e-5, "shift {c}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn test_wrong_length_is_rejected() {
        let err = EmotionDistribution::from_model_output(&[0.5, 0.5]).unwrap_err();
        assert!(matches!(
            err,
            FerError::InvalidModelOutput {
                expected: 7,
                actual: 2
            }
        ));
    }

    #[test]
    fn test_non_finite_output_is_rejected() {
        let raw = [f32::NAN, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        assert!(EmotionDistribution::from_model_output(&raw).is_err());
    }

    #[tokio::test]
    async fn test_throttle_window() {
        let scheduler = InferenceScheduler::new(FixedClassifier::new(vec![5.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]));
        let t0 = Instant::now();

        let first = scheduler.maybe_classify(sample(), t0).await.unwrap();
        assert_eq!(first.unwrap().top().emotion, Emotion::Angry);

        let second = scheduler
            .maybe_classify(sample(), t0 + Duration::from_millis(299))
            .await
            .unwrap();
        assert!(second.is_none());

        let third = scheduler
            .maybe_classify(sample(), t0 + Duration::from_millis(300))
            .await
            .unwrap();
        assert!(third.is_some());
        assert_eq!(scheduler.classifier().calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_single_permit_in_flight() {
        let scheduler = InferenceScheduler::new(FixedClassifier::new(vec![0.0; 7]));
        let t0 = Instant::now();
        let permit = scheduler.try_acquire(t0).unwrap();
        assert!(scheduler.try_acquire(t0 + Duration::from_secs(5)).is_none());
        drop(permit);
        assert!(scheduler.try_acquire(t0 + Duration::from_secs(5)).is_some());
    }

    #[test]
    fn test_is_open_claims_nothing() {
        let scheduler = InferenceScheduler::new(FixedClassifier::new(vec![0.0; 7]));
        let t0 = Instant::now();
        assert!(scheduler.is_open(t0));
        assert!(scheduler.is_open(t0));

        let permit = scheduler.try_acquire(t0).unwrap();
        assert!(!scheduler.is_open(t0 + Duration::from_secs(1)));
        drop(permit);
        assert!(!scheduler.is_open(t0 + Duration::from_millis(299)));
        assert!(scheduler.is_open(t0 + Duration::from_millis(300)));
    }

    #[tokio::test]
    async fn test_failure_does_not_extend_window() {
        let scheduler = InferenceScheduler::new(FailingClassifier);
        let t0 = Instant::now();
        let result = scheduler.maybe_classify(sample(), t0).await;
        assert!(matches!(result, Err(FerError::Classification(_))));

        // The in-flight slot is released and the next window opens on time
        let retry = scheduler
            .maybe_classify(sample(), t0 + Duration::from_millis(300))
            .await;
        assert!(retry.is_err());
        assert!(scheduler
            .maybe_classify(sample(), t0 + Duration::from_millis(350))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_blocking_classifier_is_offloaded() {
        let scheduler = InferenceScheduler::new(OffloadedClassifier::new(CountingBlocking(0)));
        let dist = scheduler
            .maybe_classify(sample(), Instant::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dist.top().emotion, Emotion::Happy);
        assert_eq!(
            scheduler
                .classifier()
                .inner
                .lock()
                .unwrap()
                .0,
            1
        );
    }
}
