//! Bitmap to backbone input tensor.
//!
//! The step order is fixed: byte tensor, optional antialiased resize on the
//! byte data, rescale to `[0, 1]`, then per-channel ImageNet normalization.
//! Resizing after the float conversion gives slightly different numbers than
//! the statistics the backbone was trained against.

use image::{imageops::FilterType, RgbImage};
use ndarray::{Array, Array4};
use serde::{Deserialize, Serialize};

use crate::error::RequestError;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Preprocessing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreprocessConfig {
    /// Target square resolution, or `None` to keep the native size.
    pub resize: Option<u32>,
}

impl PreprocessConfig {
    pub fn square(size: u32) -> Self {
        Self { resize: Some(size) }
    }

    pub fn native() -> Self {
        Self { resize: None }
    }
}

#[derive(Debug, Clone)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> PreprocessConfig {
        self.config
    }

    /// Produce a `[1, 3, H, W]` normalized tensor.
    pub fn run(&self, img: &RgbImage) -> Result<Array4<f32>, RequestError> {
        if img.width() == 0 || img.height() == 0 {
            return Err(RequestError::Preprocess("image has zero area".into()));
        }
        let resized;
        let src = match self.config.resize {
            Some(0) => return Err(RequestError::Preprocess("target size must be positive".into())),
            Some(size) if img.dimensions() != (size, size) => {
                // Triangle widens its support when downscaling, i.e. antialiased bilinear.
                resized = image::imageops::resize(img, size, size, FilterType::Triangle);
                &resized
            }
            _ => img,
        };

        let (w, h) = (src.width() as usize, src.height() as usize);
        let mut arr: Array4<f32> = Array::zeros((1, 3, h, w));
        for (x, y, p) in src.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                let v = p[c] as f32 / 255.0;
                arr[[0, c, y, x]] = (v - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
            }
        }
        Ok(arr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    const EPS: f32 = 1e-5;

    fn assert_plane(arr: &Array4<f32>, c: usize, expected: f32) {
        for v in arr.slice(ndarray::s![0, c, .., ..]).iter() {
            assert!((v - expected).abs() < EPS, "channel {c}: {v} != {expected}");
        }
    }

    #[test]
    fn red_square_matches_imagenet_constants() {
        let img = RgbImage::from_pixel(224, 224, Rgb([255, 0, 0]));
        let arr = Preprocessor::new(PreprocessConfig::square(224)).run(&img).unwrap();
        assert_eq!(arr.shape(), &[1, 3, 224, 224]);
        assert_plane(&arr, 0, (1.0 - 0.485) / 0.229);
        assert_plane(&arr, 1, (0.0 - 0.456) / 0.224);
        assert_plane(&arr, 2, (0.0 - 0.406) / 0.225);
    }

    #[test]
    fn downscaled_uniform_image_stays_uniform() {
        let img = RgbImage::from_pixel(300, 200, Rgb([255, 0, 0]));
        let arr = Preprocessor::new(PreprocessConfig::square(224)).run(&img).unwrap();
        assert_eq!(arr.shape(), &[1, 3, 224, 224]);
        assert_plane(&arr, 0, (1.0 - 0.485) / 0.229);
        assert_plane(&arr, 2, (0.0 - 0.406) / 0.225);
    }

    #[test]
    fn native_resolution_is_kept_without_target() {
        let img = RgbImage::from_pixel(17, 9, Rgb([0, 255, 0]));
        let arr = Preprocessor::new(PreprocessConfig::native()).run(&img).unwrap();
        assert_eq!(arr.shape(), &[1, 3, 9, 17]);
        assert_plane(&arr, 1, (1.0 - 0.456) / 0.224);
    }

    #[test]
    fn layout_is_channel_row_column() {
        let mut img = RgbImage::new(3, 2);
        img.put_pixel(2, 1, Rgb([255, 255, 255]));
        let arr = Preprocessor::new(PreprocessConfig::native()).run(&img).unwrap();
        assert!((arr[[0, 0, 1, 2]] - (1.0 - 0.485) / 0.229).abs() < EPS);
        assert!((arr[[0, 0, 0, 0]] - (0.0 - 0.485) / 0.229).abs() < EPS);
    }

    #[test]
    fn deterministic() {
        let img = RgbImage::from_fn(64, 48, |x, y| Rgb([(x * 3) as u8, (y * 5) as u8, (x ^ y) as u8]));
        let pre = Preprocessor::new(PreprocessConfig::square(32));
        assert_eq!(pre.run(&img).unwrap(), pre.run(&img).unwrap());
    }

    #[test]
    fn rejects_degenerate_inputs() {
        let pre = Preprocessor::new(PreprocessConfig::square(0));
        let img = RgbImage::from_pixel(2, 2, Rgb([0, 0, 0]));
        assert!(matches!(pre.run(&img), Err(RequestError::Preprocess(_))));

        let empty = RgbImage::new(0, 0);
        let pre = Preprocessor::new(PreprocessConfig::square(8));
        assert!(matches!(pre.run(&empty), Err(RequestError::Preprocess(_))));
    }
}
