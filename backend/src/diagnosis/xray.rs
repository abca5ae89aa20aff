use image::imageops::{self, FilterType};
use ndarray::Array4;

use super::error::InferenceError;

pub const XRAY_SIZE: u32 = 224;
pub const CHANNEL_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const CHANNEL_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Turns an uploaded chest X-ray into the `[1, 3, 224, 224]` input of the vision branch.
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    size: u32,
    mean: [f32; 3],
    std: [f32; 3],
}

impl Default for ImagePreprocessor {
    fn default() -> Self {
        Self {
            size: XRAY_SIZE,
            mean: CHANNEL_MEAN,
            std: CHANNEL_STD,
        }
    }
}

impl ImagePreprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preprocess(&self, bytes: &[u8]) -> Result<Array4<f32>, InferenceError> {
        if bytes.is_empty() {
            return Err(InferenceError::InvalidImage("empty upload".to_string()));
        }
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| InferenceError::InvalidImage(e.to_string()))?;

        // Alpha is dropped and grayscale replicated, no compositing.
        let rgb = decoded.to_rgb8();
        // Direct resize, aspect ratio is not preserved.
        let resized = imageops::resize(&rgb, self.size, self.size, FilterType::Triangle);

        let side = self.size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                let value = pixel[c] as f32 / 255.0;
                tensor[[0, c, y as usize, x as usize]] = (value - self.mean[c]) / self.std[c];
            }
        }

        log::debug!(
            "X-ray preprocessed: {}x{} -> {}x{}",
            decoded.width(),
            decoded.height(),
            self.size,
            self.size
        );
        Ok(tensor)
    }
}
