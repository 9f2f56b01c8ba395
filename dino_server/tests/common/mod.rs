#![allow(dead_code)]

pub mod onnx;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dino_server::backbone::Backbone;
use dino_server::error::{ConfigError, ModelError};
use dino_server::image_io::encode_png_base64;
use dino_server::model::{EmbeddingMeanModel, ScoreModel};
use dino_server::service::ModelFactory;
use image::{DynamicImage, Rgb, RgbImage};
use ndarray::{Array2, Array4, Axis};

/// Pooled embedding = per-channel mean of the input tensor.
pub struct ChannelMeanBackbone;

impl Backbone for ChannelMeanBackbone {
    fn pooled_embedding(&self, input: Array4<f32>) -> Result<Array2<f32>, ModelError> {
        input
            .mean_axis(Axis(3))
            .and_then(|a| a.mean_axis(Axis(2)))
            .ok_or_else(|| ModelError::Shape("empty input".into()))
    }
}

pub struct PanickingBackbone;

impl Backbone for PanickingBackbone {
    fn pooled_embedding(&self, _input: Array4<f32>) -> Result<Array2<f32>, ModelError> {
        panic!("device lost")
    }
}

/// Factory that counts builds and can be told to fail.
pub struct StubFactory {
    pub builds: AtomicUsize,
    pub fail_first: usize,
    pub delay: Duration,
    pub backbone: fn() -> Arc<dyn Backbone>,
}

impl StubFactory {
    pub fn new() -> Self {
        Self {
            builds: AtomicUsize::new(0),
            fail_first: 0,
            delay: Duration::ZERO,
            backbone: || Arc::new(ChannelMeanBackbone),
        }
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelFactory for StubFactory {
    async fn build(&self) -> Result<Arc<dyn ScoreModel>, ConfigError> {
        let n = self.builds.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if n < self.fail_first {
            return Err(ConfigError::MissingR2Settings(vec!["R2_ACCOUNT_ID"]));
        }
        Ok(Arc::new(EmbeddingMeanModel::new((self.backbone)())))
    }
}

pub fn red_png_base64(size: u32) -> String {
    let img = RgbImage::from_pixel(size, size, Rgb([255, 0, 0]));
    encode_png_base64(&DynamicImage::ImageRgb8(img)).unwrap()
}

/// Mean over the three normalized planes of a pure red image.
pub fn red_channel_mean() -> f32 {
    let r = (1.0 - 0.485) / 0.229;
    let g = (0.0 - 0.456) / 0.224;
    let b = (0.0 - 0.406) / 0.225;
    (r + g + b) / 3.0
}
