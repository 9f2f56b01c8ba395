//! Fine-tune head and the weight bundle that configures it.
//!
//! A fine-tuned model is the frozen backbone with three submodules replaced
//! from disk: the scoring head (`proj.pt`), the last transformer block
//! (`layer_-1.pt`) and the final norm (`norm.pt`). Every other backbone
//! parameter keeps its pretrained value.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device as CandleDevice, Tensor};
use candle_nn::{Dropout, Linear, Module, VarBuilder};
use chrono::{DateTime, Local};
use ndarray::{ArrayD, IxDyn};
use tracing::info;

use crate::backbone::InitializerOverride;
use crate::error::ConfigError;
use crate::fetch::WeightFetcher;

pub const PROJ_FILE: &str = "proj.pt";
pub const LAST_LAYER_FILE: &str = "layer_-1.pt";
pub const NORM_FILE: &str = "norm.pt";
pub const WEIGHT_FILES: [&str; 3] = [PROJ_FILE, LAST_LAYER_FILE, NORM_FILE];

const DROPOUT: f32 = 0.5;
const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";

pub type StateDict = HashMap<String, Tensor>;

/// dropout → linear(D, 2D) → dropout → GELU → linear(2D, 1)
///
/// Parameter names follow the sequential layout: `1.*` and `4.*`.
#[derive(Debug)]
pub struct ScoreHead {
    drop_in: Dropout,
    expand: Linear,
    drop_hidden: Dropout,
    reduce: Linear,
    dim: usize,
}

impl ScoreHead {
    pub fn from_state(state: &StateDict, expected_dim: Option<usize>) -> Result<Self, ConfigError> {
        let w1 = state
            .get("1.weight")
            .ok_or_else(|| ConfigError::Head("`1.weight` missing from projection state".into()))?;
        let dim = match w1.dims() {
            [out, d] if *out == 2 * *d => *d,
            other => {
                return Err(ConfigError::Head(format!(
                    "`1.weight` has shape {other:?}, expected [2D, D]"
                )))
            }
        };
        if let Some(expected) = expected_dim {
            if expected != dim {
                return Err(ConfigError::Head(format!(
                    "projection expects embedding dim {dim}, backbone is configured for {expected}"
                )));
            }
        }

        let vb = VarBuilder::from_tensors(state.clone(), DType::F32, &CandleDevice::Cpu);
        let head_err = |e: candle_core::Error| ConfigError::Head(e.to_string());
        let expand = candle_nn::linear(dim, 2 * dim, vb.pp("1")).map_err(head_err)?;
        let reduce = candle_nn::linear(2 * dim, 1, vb.pp("4")).map_err(head_err)?;
        Ok(Self {
            drop_in: Dropout::new(DROPOUT),
            expand,
            drop_hidden: Dropout::new(DROPOUT),
            reduce,
            dim,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// `[B, D]` embeddings to `[B]` scores. Dropout is inert outside training.
    pub fn forward(&self, embedding: &Tensor) -> candle_core::Result<Tensor> {
        let xs = self.drop_in.forward(embedding, false)?;
        let xs = self.expand.forward(&xs)?;
        let xs = self.drop_hidden.forward(&xs, false)?;
        let xs = xs.gelu_erf()?;
        self.reduce.forward(&xs)?.squeeze(1)
    }

    pub fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        for (idx, layer) in [("1", &self.expand), ("4", &self.reduce)] {
            state.insert(format!("{idx}.weight"), layer.weight().clone());
            if let Some(bias) = layer.bias() {
                state.insert(format!("{idx}.bias"), bias.clone());
            }
        }
        state
    }
}

/// The three state dicts of a fine-tune, always materialized on the CPU.
#[derive(Debug, Clone)]
pub struct FinetuneWeights {
    pub proj: StateDict,
    pub last_layer: StateDict,
    pub norm: StateDict,
}

impl FinetuneWeights {
    /// ONNX initializer overrides for the replaced backbone submodules.
    pub fn initializer_overrides(
        &self,
        last_layer_prefix: &str,
        norm_prefix: &str,
    ) -> Result<Vec<InitializerOverride>, ConfigError> {
        let mut out = Vec::with_capacity(self.last_layer.len() + self.norm.len());
        for (prefix, state) in [(last_layer_prefix, &self.last_layer), (norm_prefix, &self.norm)] {
            let mut keys: Vec<&String> = state.keys().collect();
            keys.sort();
            for key in keys {
                out.push(InitializerOverride {
                    name: format!("{prefix}.{key}"),
                    value: to_ndarray(&state[key]).map_err(|e| ConfigError::Head(format!("{key}: {e}")))?,
                });
            }
        }
        Ok(out)
    }

    /// Write the bundle into a fresh `ft_weights_<timestamp>` directory under `parent`.
    pub fn save(&self, parent: &Path, at: DateTime<Local>) -> Result<PathBuf, ConfigError> {
        let dir = parent.join(timestamped_dir_name(&at));
        std::fs::create_dir_all(&dir).map_err(|e| ConfigError::io(&dir, e))?;
        for (file, state) in [(PROJ_FILE, &self.proj), (LAST_LAYER_FILE, &self.last_layer), (NORM_FILE, &self.norm)] {
            let path = dir.join(file);
            candle_core::safetensors::save(state, &path)
                .map_err(|source| ConfigError::WeightFile { path: path.clone(), source })?;
        }
        info!("saved fine-tune weights to {}", dir.display());
        Ok(dir)
    }
}

pub fn timestamped_dir_name(at: &DateTime<Local>) -> String {
    format!("ft_weights_{}", at.format("%Y%m%d_%H%M%S"))
}

fn to_ndarray(t: &Tensor) -> candle_core::Result<ArrayD<f32>> {
    let shape = t.dims().to_vec();
    let data = t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|e| candle_core::Error::Msg(e.to_string()))
}

/// Read a state dict from a `torch.save` archive or a safetensors file.
pub fn read_state_dict(path: &Path) -> Result<StateDict, ConfigError> {
    let mut magic = [0u8; 4];
    let is_zip = std::fs::File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map(|_| &magic == ZIP_MAGIC)
        .map_err(|e| ConfigError::io(path, e))?;

    let wrap = |source: candle_core::Error| ConfigError::WeightFile {
        path: path.to_path_buf(),
        source,
    };
    let raw: StateDict = if is_zip {
        candle_core::pickle::read_all(path).map_err(wrap)?.into_iter().collect()
    } else {
        candle_core::safetensors::load(path, &CandleDevice::Cpu).map_err(wrap)?
    };
    raw.into_iter()
        .map(|(k, t)| -> Result<(String, Tensor), ConfigError> { Ok((k, t.to_dtype(DType::F32).map_err(wrap)?)) })
        .collect()
}

/// Load the bundle from `dir`, fetching it first when the directory is absent.
///
/// The fetcher is called at most once. A file still missing afterwards is a
/// configuration error.
pub async fn load_finetune_weights(dir: &Path, fetcher: &dyn WeightFetcher) -> Result<FinetuneWeights, ConfigError> {
    if !dir.exists() {
        info!("folder '{}' not found, downloading weights", dir.display());
        fetcher.fetch(dir).await?;
    }

    for file in WEIGHT_FILES {
        let path = dir.join(file);
        if !path.is_file() {
            return Err(ConfigError::MissingWeightFile(path));
        }
    }

    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<FinetuneWeights, ConfigError> {
        Ok(FinetuneWeights {
            proj: read_state_dict(&dir.join(PROJ_FILE))?,
            last_layer: read_state_dict(&dir.join(LAST_LAYER_FILE))?,
            norm: read_state_dict(&dir.join(NORM_FILE))?,
        })
    })
    .await
    .map_err(|e| ConfigError::Task(e.to_string()))?
}
