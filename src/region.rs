// Face region extraction and normalization for classifier input

use crate::error::{FerError, Result};
use crate::models::{FaceBox, Frame, PixelRegion};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgb, RgbImage};
use ndarray::{Array4, Axis};

/// Side length of the square classifier input
pub const TARGET_SIZE: usize = 96;

/// A 96x96 RGB face crop scaled to [0, 1], laid out as `[1, H, W, C]`
#[derive(Clone, Debug)]
pub struct NormalizedSample {
    tensor: Array4<f32>,
}

impl NormalizedSample {
    fn new(tensor: Array4<f32>) -> Self {
        Self { tensor }
    }

    /// Builds a sample from an existing NHWC tensor. The shape must be
    /// `[1, 96, 96, 3]`.
    pub fn from_tensor(tensor: Array4<f32>) -> Result<Self> {
        if tensor.shape() != [1, TARGET_SIZE, TARGET_SIZE, 3] {
            return Err(FerError::FrameProcessing(format!(
                "Sample tensor has shape {:?}, expected [1, {TARGET_SIZE}, {TARGET_SIZE}, 3]",
                tensor.shape()
            )));
        }
        Ok(Self::new(tensor))
    }

    /// Borrow the NHWC tensor
    pub fn tensor(&self) -> &Array4<f32> {
        &self.tensor
    }

    /// Consume the sample, yielding its NHWC tensor
    pub fn into_tensor(self) -> Array4<f32> {
        self.tensor
    }

    /// Channels-first copy (`[1, C, H, W]`) for models that expect NCHW
    pub fn to_nchw(&self) -> Array4<f32> {
        self.tensor
            .view()
            .permuted_axes([0, 3, 1, 2])
            .as_standard_layout()
            .into_owned()
    }

    /// Mean value of one channel, mostly useful for diagnostics
    pub fn channel_mean(&self, channel: usize) -> f32 {
        self.tensor
            .index_axis(Axis(3), channel)
            .mean()
            .unwrap_or(0.0)
    }
}

/// Crops detected faces out of frames and resamples them to the fixed
/// classifier input size.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegionExtractor;

impl RegionExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extracts the face described by `face` from `frame`.
    ///
    /// Returns `Ok(None)` when the clamped region has no area. A frame whose
    /// buffer does not match its declared dimensions is an error.
    pub fn extract(&self, face: &FaceBox, frame: &Frame) -> Result<Option<NormalizedSample>> {
        let region = PixelRegion::from_face_box(face, frame.width, frame.height);
        self.extract_region(&region, frame)
    }

    /// Resamples an already computed pixel region of `frame`
    pub fn extract_region(
        &self,
        region: &PixelRegion,
        frame: &Frame,
    ) -> Result<Option<NormalizedSample>> {
        if region.is_degenerate() {
            return Ok(None);
        }

        let view = ImageBuffer::<Rgb<u8>, &[u8]>::from_raw(
            frame.width,
            frame.height,
            frame.data.as_slice(),
        )
        .ok_or_else(|| {
            FerError::FrameProcessing(format!(
                "Frame buffer holds {} bytes, too small for {}x{} RGB",
                frame.data.len(),
                frame.width,
                frame.height
            ))
        })?;

        if region.x + region.w > frame.width || region.y + region.h > frame.height {
            return Err(FerError::FrameProcessing(format!(
                "Region {region:?} exceeds {}x{} frame",
                frame.width, frame.height
            )));
        }

        // Aspect ratio is not preserved; the classifier expects a square input
        let crop = RgbImage::from_fn(region.w, region.h, |x, y| {
            *view.get_pixel(region.x + x, region.y + y)
        });
        let resized = imageops::resize(
            &crop,
            TARGET_SIZE as u32,
            TARGET_SIZE as u32,
            FilterType::Triangle,
        );

        let tensor = Array4::from_shape_fn((1, TARGET_SIZE, TARGET_SIZE, 3), |(_, y, x, c)| {
            f32::from(resized.get_pixel(x as u32, y as u32)[c]) / 255.0
        });

        Ok(Some(NormalizedSample::new(tensor)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_shape_is_fixed() {
        let extractor = RegionExtractor::new();
        let frame = Frame::filled(640, 480, [10, 20, 30]);
        for face in [
            FaceBox::new(0.5, 0.5, 0.3, 0.3),
            FaceBox::new(0.1, 0.9, 0.05, 0.4),
            FaceBox::new(0.5, 0.5, 1.0, 1.0),
        ] {
            let sample = extractor.extract(&face, &frame).unwrap().unwrap();
            assert_eq!(sample.tensor().shape(), &[1, 96, 96, 3]);
        }
    }

    #[test]
    fn test_uniform_frame_keeps_color() {
        let extractor = RegionExtractor::new();
        let frame = Frame::filled(320, 240, [255, 0, 51]);
        let sample = extractor
            .extract(&FaceBox::new(0.4, 0.6, 0.2, 0.5), &frame)
            .unwrap()
            .unwrap();
        assert!((sample.channel_mean(0) - 1.0).abs() < 1e-5);
        assert!(sample.channel_mean(1).abs() < 1e-5);
        assert!((sample.channel_mean(2) - 0.2).abs() < 1e-5);
        assert!(sample.tensor().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_degenerate_region_yields_no_sample() {
        let extractor = RegionExtractor::new();
        let frame = Frame::filled(640, 480, [0, 0, 0]);
        let off_frame = FaceBox::new(1.4, 0.5, 0.2, 0.2);
        assert!(extractor.extract(&off_frame, &frame).unwrap().is_none());
        let zero_width = FaceBox::new(0.5, 0.5, 0.0, 0.2);
        assert!(extractor.extract(&zero_width, &frame).unwrap().is_none());
    }

    #[test]
    fn test_short_buffer_is_an_error() {
        let extractor = RegionExtractor::new();
        let frame = Frame::new(vec![0; 10], 640, 480);
        let result = extractor.extract(&FaceBox::new(0.5, 0.5, 0.3, 0.3), &frame);
        assert!(matches!(result, Err(FerError::FrameProcessing(_))));
    }

    #[test]
    fn test_left_half_maps_to_left_of_sample() {
        // Left half white, right half black
        let (w, h) = (100u32, 50u32);
        let mut data = Vec::with_capacity((w * h * 3) as usize);
        for _y in 0..h {
            for x in 0..w {
                let v = if x < w / 2 { 255 } else { 0 };
                data.extend_from_slice(&[v, v, v]);
            }
        }
        let frame = Frame::new(data, w, h);
        let sample = RegionExtractor::new()
            .extract(&FaceBox::new(0.5, 0.5, 1.0, 1.0), &frame)
            .unwrap()
            .unwrap();
        let t = sample.tensor();
        assert!(t[[0, 48, 2, 0]] > 0.99);
        assert!(t[[0, 48, 93, 0]] < 0.01);
    }

    #[test]
    fn test_nchw_layout() {
        let frame = Frame::filled(64, 64, [255, 0, 0]);
        let sample = RegionExtractor::new()
            .extract(&FaceBox::new(0.5, 0.5, 0.5, 0.5), &frame)
            .unwrap()
            .unwrap();
        let chw = sample.to_nchw();
        assert_eq!(chw.shape(), &[1, 3, 96, 96]);
        assert!((chw[[0, 0, 10, 10]] - 1.0).abs() < 1e-5);
        assert!(chw[[0, 1, 10, 10]].abs() < 1e-5);
    }
}
