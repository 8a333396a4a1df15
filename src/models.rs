// Core data models for the emotion recognition pipeline

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Represents a single video frame with RGB data
#[derive(Clone, Debug)]
pub struct Frame {
    /// Raw RGB pixel data (width * height * 3 bytes)
    pub data: Vec<u8>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
}

impl Frame {
    /// Creates a new Frame with the given parameters
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
        }
    }

    /// Creates a frame filled with a single RGB color
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self::new(data, width, height)
    }
}

/// The closed set of expressions the classifier distinguishes.
///
/// Declaration order matches the classifier's output vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Emotion {
    Angry,
    Disgust,
    Fear,
    Happy,
    Neutral,
    Sad,
    Surprise,
}

impl Emotion {
    /// Every label, positionally aligned with the model output
    pub const ALL: [Emotion; 7] = [
        Emotion::Angry,
        Emotion::Disgust,
        Emotion::Fear,
        Emotion::Happy,
        Emotion::Neutral,
        Emotion::Sad,
        Emotion::Surprise,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Emotion::Angry => "Angry",
            Emotion::Disgust => "Disgust",
            Emotion::Fear => "Fear",
            Emotion::Happy => "Happy",
            Emotion::Neutral => "Neutral",
            Emotion::Sad => "Sad",
            Emotion::Surprise => "Surprise",
        }
    }
}

impl std::fmt::Display for Emotion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A single label with its probability
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EmotionScore {
    pub emotion: Emotion,
    /// Probability (0.0 to 1.0)
    pub probability: f32,
}

impl EmotionScore {
    pub fn new(emotion: Emotion, probability: f32) -> Self {
        Self {
            emotion,
            probability,
        }
    }

    /// Returns the probability as a percentage (0-100)
    pub fn confidence_percent(&self) -> u8 {
        (self.probability.clamp(0.0, 1.0) * 100.0).round() as u8
    }
}

impl std::fmt::Display for EmotionScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}% confidence)", self.emotion, self.confidence_percent())
    }
}

/// A detected face in relative frame coordinates.
///
/// Spatial fields are fractions of the frame dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x_center_rel: f32,
    pub y_center_rel: f32,
    pub width_rel: f32,
    pub height_rel: f32,
    pub confidence: f32,
}

impl FaceBox {
    pub fn new(x_center_rel: f32, y_center_rel: f32, width_rel: f32, height_rel: f32) -> Self {
        Self {
            x_center_rel,
            y_center_rel,
            width_rel,
            height_rel,
            confidence: 1.0,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }
}

/// Faces found in one video frame, in detector order
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionResult {
    pub faces: Vec<FaceBox>,
}

impl DetectionResult {
    pub fn new(faces: Vec<FaceBox>) -> Self {
        Self { faces }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }
}

/// Face rectangle in pixel coordinates, clamped to the frame
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRegion {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl PixelRegion {
    /// Converts a relative face box into a pixel rectangle inside a
    /// `frame_width` x `frame_height` frame.
    ///
    /// The result always satisfies `x + w <= frame_width` and
    /// `y + h <= frame_height`; a box that falls outside the frame yields a
    /// zero-sized region.
    pub fn from_face_box(face: &FaceBox, frame_width: u32, frame_height: u32) -> Self {
        let fw = f64::from(frame_width);
        let fh = f64::from(frame_height);

        let w = f64::from(face.width_rel) * fw;
        let h = f64::from(face.height_rel) * fh;
        let x = f64::from(face.x_center_rel) * fw - w / 2.0;
        let y = f64::from(face.y_center_rel) * fh - h / 2.0;

        if ![x, y, w, h].iter().all(|v| v.is_finite()) {
            return Self::default();
        }

        let sx = x.floor().clamp(0.0, fw);
        let sy = y.floor().clamp(0.0, fh);
        let sw = w.min(fw - sx).max(0.0).round();
        let sh = h.min(fh - sy).max(0.0).round();

        Self {
            x: sx as u32,
            y: sy as u32,
            w: sw as u32,
            h: sh as u32,
        }
    }

    /// True when the region has no area to sample from
    pub fn is_degenerate(&self) -> bool {
        self.w == 0 || self.h == 0
    }
}

/// One accepted classification, as handed to the broker
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EmotionEvent {
    #[serde(rename = "user_id")]
    pub device_id: Option<String>,
    pub emotion: Emotion,
    pub confidence: f32,
    #[serde(rename = "bbox")]
    pub region: Option<PixelRegion>,
    #[serde(rename = "ts")]
    pub timestamp: String,
}

impl EmotionEvent {
    /// Creates an event stamped with the current UTC time
    pub fn new(
        device_id: Option<String>,
        emotion: Emotion,
        confidence: f32,
        region: Option<PixelRegion>,
    ) -> Self {
        Self {
            device_id,
            emotion,
            confidence,
            region,
            timestamp: iso_timestamp(),
        }
    }
}

/// Current UTC time with millisecond precision and a `Z` suffix
pub fn iso_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
