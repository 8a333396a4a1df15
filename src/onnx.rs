// ONNX Runtime backed emotion classifier

use crate::config::InputLayout;
use crate::emotion::BlockingClassifier;
use crate::error::{FerError, Result};
use crate::models::Emotion;
use crate::region::NormalizedSample;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use std::path::Path;
use tracing::{error, info};

/// Emotion classifier using ONNX Runtime.
///
/// Expects a single `[1, 96, 96, 3]` (or `[1, 3, 96, 96]`) float input and a
/// first output holding seven scores in [`Emotion::ALL`] order, either logits
/// or probabilities.
pub struct OnnxClassifier {
    session: Session,
    layout: InputLayout,
}

impl OnnxClassifier {
    /// Creates a new OnnxClassifier by loading the ONNX model
    pub fn new<P: AsRef<Path>>(model_path: P, layout: InputLayout) -> Result<Self> {
        let model_path = model_path.as_ref();
        let session = Session::builder()
            .map_err(|e| FerError::ModelLoad(format!("Failed to create session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| FerError::ModelLoad(format!("Failed to set optimization level: {e}")))?
            .commit_from_file(model_path)
            .map_err(|e| {
                error!("Failed to load ONNX model: {}", e);
                FerError::ModelLoad(format!(
                    "ONNX model load failed ({}): {e}",
                    model_path.display()
                ))
            })?;

        info!("Loaded emotion model from {}", model_path.display());
        Ok(Self { session, layout })
    }
}

impl BlockingClassifier for OnnxClassifier {
    fn classify_blocking(&mut self, sample: &NormalizedSample) -> Result<Vec<f32>> {
        let input_array = match self.layout {
            InputLayout::Nhwc => sample.tensor().clone(),
            InputLayout::Nchw => sample.to_nchw(),
        };

        let input_tensor = Value::from_array(input_array).map_err(|e| {
            FerError::OnnxRuntime(format!("Failed to create input tensor: {e}"))
        })?;

        // Run inference; input and output tensors are released on return
        let outputs = self.session.run(ort::inputs![input_tensor]).map_err(|e| {
            error!("ONNX inference failed: {}", e);
            FerError::Classification(format!("Inference failed: {e}"))
        })?;

        // Extract output scores - get first output
        let (_, output_value) = outputs
            .iter()
            .next()
            .ok_or_else(|| FerError::Classification("No output from model".to_string()))?;

        let (_, scores) = output_value.try_extract_tensor::<f32>().map_err(|e| {
            FerError::OnnxRuntime(format!("Failed to extract output tensor: {e}"))
        })?;

        if scores.len() != Emotion::ALL.len() {
            return Err(FerError::InvalidModelOutput {
                expected: Emotion::ALL.len(),
                actual: scores.len(),
            });
        }
        Ok(scores.to_vec())
    }
}
