// Camera module for webcam capture

use crate::config::CameraConfig;
use crate::error::{FerError, Result};
use crate::models::Frame;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution};
use nokhwa::Camera;
use tracing::{error, info};

/// Owns the capture device and hands out decoded RGB frames
pub struct CameraManager {
    camera: Camera,
}

impl CameraManager {
    /// Opens the configured camera, falling back to the next index (some
    /// systems start at 1).
    pub fn new(config: &CameraConfig) -> Result<Self> {
        let requested_format = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
            CameraFormat::new(
                Resolution::new(config.width, config.height),
                FrameFormat::YUYV,
                config.fps,
            ),
        ));

        let mut camera = Self::try_open_camera(config.index, requested_format)
            .or_else(|_| Self::try_open_camera(config.index + 1, requested_format))
            .map_err(|e| {
                error!("Failed to initialize camera: {}", e);
                FerError::CameraInit(format!(
                    "Could not open camera {}. Make sure it is connected, not in use, \
                     and camera permissions are granted. Error: {e}",
                    config.index
                ))
            })?;

        camera.open_stream()?;
        info!("Opened camera: {}", camera.info().human_name());

        Ok(Self { camera })
    }

    /// Helper to try opening a camera at a specific index
    fn try_open_camera(index: u32, requested_format: RequestedFormat) -> Result<Camera> {
        Camera::new(CameraIndex::Index(index), requested_format)
            .map_err(|e| FerError::CameraInit(e.to_string()))
    }

    /// Returns the current camera resolution
    pub fn resolution(&self) -> (u32, u32) {
        let res = self.camera.resolution();
        (res.width(), res.height())
    }

    /// Grabs and decodes the next frame (blocking)
    pub fn get_current_frame(&mut self) -> Result<Frame> {
        let frame_data = self.camera.frame().map_err(|e| {
            FerError::FrameProcessing(format!("Failed to capture frame: {e}"))
        })?;

        let buffer = frame_data.decode_image::<RgbFormat>().map_err(|e| {
            FerError::FrameProcessing(format!("Failed to decode frame: {e}"))
        })?;

        let (width, height) = (buffer.width(), buffer.height());
        Ok(Frame::new(buffer.into_raw(), width, height))
    }
}

impl Drop for CameraManager {
    fn drop(&mut self) {
        if let Err(e) = self.camera.stop_stream() {
            error!("Error stopping camera stream: {}", e);
        }
    }
}
