//! Scoring models: a backbone plus the reduction to one scalar per image.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{Device as CandleDevice, Tensor};
use chrono::Local;
use clap::ValueEnum;
use ndarray::Array4;
use serde::{Deserialize, Serialize};

use crate::backbone::Backbone;
use crate::error::{ConfigError, ModelError};
use crate::head::{FinetuneWeights, ScoreHead};

/// Deployment flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Variant {
    /// Mean of the pooled embedding.
    #[default]
    EmbeddingMean,
    /// Fine-tuned backbone with the scoring head.
    Finetuned,
}

impl Variant {
    pub fn result_key(self) -> &'static str {
        match self {
            Variant::EmbeddingMean => "avg_pooling_vector",
            Variant::Finetuned => "score",
        }
    }

    pub fn default_resize(self) -> u32 {
        match self {
            Variant::EmbeddingMean => 512,
            Variant::Finetuned => 224,
        }
    }
}

/// Maps one preprocessed image to one scalar.
pub trait ScoreModel: Send + Sync {
    /// JSON key of the scalar in a success response.
    fn result_key(&self) -> &'static str;

    fn score(&self, input: Array4<f32>) -> Result<f32, ModelError>;
}

fn finite(v: f32) -> Result<f32, ModelError> {
    if v.is_finite() {
        Ok(v)
    } else {
        Err(ModelError::NonFinite(v))
    }
}

/// Variant A: the pooled embedding collapsed to its arithmetic mean.
pub struct EmbeddingMeanModel {
    backbone: Arc<dyn Backbone>,
}

impl EmbeddingMeanModel {
    pub fn new(backbone: Arc<dyn Backbone>) -> Self {
        Self { backbone }
    }
}

impl ScoreModel for EmbeddingMeanModel {
    fn result_key(&self) -> &'static str {
        Variant::EmbeddingMean.result_key()
    }

    fn score(&self, input: Array4<f32>) -> Result<f32, ModelError> {
        let pooled = self.backbone.pooled_embedding(input)?;
        let mean = pooled
            .mean()
            .ok_or_else(|| ModelError::Shape("backbone returned an empty embedding".into()))?;
        finite(mean)
    }
}

/// Variant B: fine-tuned backbone followed by [`ScoreHead`].
///
/// The backbone must already carry the `last_layer` and `norm` parameters of
/// `weights` (see [`FinetuneWeights::initializer_overrides`]).
pub struct FineTunedModel {
    backbone: Arc<dyn Backbone>,
    head: ScoreHead,
    weights: FinetuneWeights,
}

impl FineTunedModel {
    pub fn new(
        backbone: Arc<dyn Backbone>,
        weights: FinetuneWeights,
        embedding_dim: Option<usize>,
    ) -> Result<Self, ConfigError> {
        let head = ScoreHead::from_state(&weights.proj, embedding_dim)?;
        Ok(Self {
            backbone,
            head,
            weights,
        })
    }

    /// Scores for a whole batch.
    pub fn forward(&self, input: Array4<f32>) -> Result<Vec<f32>, ModelError> {
        let pooled = self.backbone.pooled_embedding(input)?;
        let (rows, dim) = pooled.dim();
        if dim != self.head.dim() {
            return Err(ModelError::Shape(format!(
                "embedding has {dim} features, head expects {}",
                self.head.dim()
            )));
        }
        let data: Vec<f32> = pooled.iter().copied().collect();
        let embedding = Tensor::from_vec(data, (rows, dim), &CandleDevice::Cpu)?;
        Ok(self.head.forward(&embedding)?.to_vec1::<f32>()?)
    }

    /// Persist the replaced submodules into `parent/ft_weights_<timestamp>`.
    pub fn save_finetune_weights(&self, parent: &Path) -> Result<PathBuf, ConfigError> {
        let bundle = FinetuneWeights {
            proj: self.head.state_dict(),
            ..self.weights.clone()
        };
        bundle.save(parent, Local::now())
    }
}

impl ScoreModel for FineTunedModel {
    fn result_key(&self) -> &'static str {
        Variant::Finetuned.result_key()
    }

    fn score(&self, input: Array4<f32>) -> Result<f32, ModelError> {
        let scores = self.forward(input)?;
        match scores.as_slice() {
            [one] => finite(*one),
            other => Err(ModelError::Shape(format!("expected one score, got {}", other.len()))),
        }
    }
}
