// Library exports for the facial emotion recognition pipeline

#[cfg(feature = "camera")]
pub mod camera;
pub mod config;
pub mod detector;
pub mod emotion;
pub mod error;
pub mod identity;
pub mod models;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod perception;
pub mod publisher;
pub mod region;

pub use emotion::{Classifier, EmotionDistribution, InferenceScheduler};
pub use error::{FerError, Result};
pub use models::{DetectionResult, Emotion, EmotionEvent, FaceBox, Frame, PixelRegion};
pub use perception::{PerceptionLoop, RenderEvent, RenderSink};
pub use publisher::{EventPublisher, EventSink};
pub use region::{NormalizedSample, RegionExtractor};
