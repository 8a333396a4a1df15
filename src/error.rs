// Error types for the emotion recognition pipeline

use thiserror::Error;

/// Main error type for the pipeline
#[derive(Debug, Error)]
pub enum FerError {
    #[error("Camera initialization failed: {0}")]
    CameraInit(String),

    #[error("Frame processing failed: {0}")]
    FrameProcessing(String),

    #[error("Model loading failed: {0}")]
    ModelLoad(String),

    #[error("Face detection failed: {0}")]
    FaceDetection(String),

    #[error("Classification failed: {0}")]
    Classification(String),

    #[error("Classifier returned {actual} values, expected {expected}")]
    InvalidModelOutput { expected: usize, actual: usize },

    #[error("ONNX Runtime error: {0}")]
    OnnxRuntime(String),

    #[error("OpenCV error: {0}")]
    OpenCV(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image decoding error: {0}")]
    ImageDecode(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, FerError>;

// Conversion from nokhwa errors
#[cfg(feature = "camera")]
impl From<nokhwa::NokhwaError> for FerError {
    fn from(err: nokhwa::NokhwaError) -> Self {
        match err {
            nokhwa::NokhwaError::OpenDeviceError(device, error) => {
                FerError::CameraInit(format!("Device {device}: {error}"))
            }
            nokhwa::NokhwaError::GetPropertyError { property, error } => {
                FerError::CameraInit(format!("Property {property}: {error}"))
            }
            _ => FerError::CameraInit(err.to_string()),
        }
    }
}

// Conversion from OpenCV errors
#[cfg(feature = "opencv")]
impl From<opencv::Error> for FerError {
    fn from(err: opencv::Error) -> Self {
        FerError::OpenCV(err.to_string())
    }
}

// Conversion from ONNX Runtime errors
#[cfg(feature = "onnx")]
impl From<ort::Error> for FerError {
    fn from(err: ort::Error) -> Self {
        FerError::OnnxRuntime(err.to_string())
    }
}

impl From<rumqttc::ClientError> for FerError {
    fn from(err: rumqttc::ClientError) -> Self {
        FerError::Broker(err.to_string())
    }
}
