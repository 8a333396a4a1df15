// Face detection boundary and an OpenCV Haar cascade implementation

use crate::error::Result;
use crate::models::{DetectionResult, Frame};

/// Produces face boxes for a frame
pub trait FaceDetector {
    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult>;
}

#[cfg(feature = "opencv")]
pub use haar::HaarCascadeDetector;

#[cfg(feature = "opencv")]
mod haar {
    use super::FaceDetector;
    use crate::error::{FerError, Result};
    use crate::models::{DetectionResult, FaceBox, Frame};
    use opencv::core::{Mat, Rect, Size, Vector};
    use opencv::imgproc;
    use opencv::objdetect::CascadeClassifier;
    use opencv::prelude::*;
    use std::path::Path;
    use tracing::error;

    /// Face detector using OpenCV Haar Cascade
    pub struct HaarCascadeDetector {
        classifier: CascadeClassifier,
    }

    impl HaarCascadeDetector {
        /// Creates a new detector by loading the Haar Cascade classifier
        pub fn new<P: AsRef<Path>>(cascade_path: P) -> Result<Self> {
            let cascade_path = cascade_path.as_ref().to_string_lossy();
            let classifier = CascadeClassifier::new(&cascade_path).map_err(|e| {
                error!("Failed to load Haar Cascade: {}", e);
                FerError::ModelLoad(format!("Haar Cascade load failed: {e}"))
            })?;

            if classifier.empty()? {
                return Err(FerError::ModelLoad(
                    "Haar Cascade classifier is empty".to_string(),
                ));
            }

            Ok(Self { classifier })
        }
    }

    impl FaceDetector for HaarCascadeDetector {
        fn detect(&mut self, frame: &Frame) -> Result<DetectionResult> {
            let mat = Mat::from_slice(&frame.data)
                .map_err(|e| FerError::FaceDetection(format!("Failed to create Mat: {e}")))?;
            let mat = mat
                .reshape(3, frame.height as i32)
                .map_err(|e| FerError::FaceDetection(format!("Failed to reshape Mat: {e}")))?;

            let mut gray = Mat::default();
            imgproc::cvt_color(
                &mat,
                &mut gray,
                imgproc::COLOR_RGB2GRAY,
                0,
                opencv::core::AlgorithmHint::ALGO_HINT_DEFAULT,
            )
            .map_err(|e| {
                FerError::FaceDetection(format!("Failed to convert to grayscale: {e}"))
            })?;

            let mut faces = Vector::<Rect>::new();
            self.classifier
                .detect_multi_scale(
                    &gray,
                    &mut faces,
                    1.1,               // scale factor
                    5,                 // min neighbors
                    0,                 // flags
                    Size::new(40, 40), // min size
                    Size::new(0, 0),   // no max size
                )
                .map_err(|e| FerError::FaceDetection(format!("Face detection failed: {e}")))?;

            // Haar cascades give no score; every hit counts as certain
            let (fw, fh) = (frame.width as f32, frame.height as f32);
            let boxes = faces
                .iter()
                .map(|r| {
                    FaceBox::new(
                        (r.x as f32 + r.width as f32 / 2.0) / fw,
                        (r.y as f32 + r.height as f32 / 2.0) / fh,
                        r.width as f32 / fw,
                        r.height as f32 / fh,
                    )
                })
                .collect();

            Ok(DetectionResult::new(boxes))
        }
    }
}
