//! Pretrained backbone: an ONNX export of DINOv3 run through ONNX Runtime.
//!
//! The rest of the crate only sees the [`Backbone`] trait: a normalized
//! `[B, 3, H, W]` tensor goes in, one pooled embedding row per image comes out.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use clap::ValueEnum;
use ndarray::{Array2, Array4, ArrayD, Ix2};
use ort::session::{builder::GraphOptimizationLevel, builder::SessionBuilder, Session};
use ort::value::{DynValue, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ConfigError, ModelError};
use crate::graph::GraphInitializers;

pub const DEFAULT_MODEL_REPO: &str = "onnx-community/dinov3-vits16-pretrain-lvd1689m-ONNX";
pub const DEFAULT_MODEL_FILE: &str = "onnx/model.onnx";

/// Produces pooled embeddings from normalized image tensors.
pub trait Backbone: Send + Sync {
    fn pooled_embedding(&self, input: Array4<f32>) -> Result<Array2<f32>, ModelError>;
}

/// Requested compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceChoice {
    /// CUDA when the provider is compiled in and usable, CPU otherwise.
    #[default]
    Auto,
    Cpu,
    Cuda,
}

/// Resolved compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    Cuda { device_id: i32 },
}

impl DeviceChoice {
    pub fn resolve(self) -> Device {
        match self {
            DeviceChoice::Cpu => Device::Cpu,
            DeviceChoice::Cuda => Device::Cuda { device_id: 0 },
            DeviceChoice::Auto if cuda_available() => Device::Cuda { device_id: 0 },
            DeviceChoice::Auto => Device::Cpu,
        }
    }
}

#[cfg(feature = "cuda")]
fn cuda_available() -> bool {
    use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
    CUDAExecutionProvider::default().is_available().unwrap_or(false)
}

#[cfg(not(feature = "cuda"))]
fn cuda_available() -> bool {
    false
}

/// Where the ONNX file comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackboneSource {
    Local(PathBuf),
    Hub { repo: String, file: String },
}

impl BackboneSource {
    /// Local path of the ONNX file, downloading it into the hub cache when needed.
    ///
    /// Blocking: performs network IO for [`BackboneSource::Hub`].
    pub fn resolve(&self) -> Result<PathBuf, ConfigError> {
        match self {
            BackboneSource::Local(path) => Ok(path.clone()),
            BackboneSource::Hub { repo, file } => {
                info!("resolving backbone {repo}/{file} through the hub cache");
                let api = hf_hub::api::sync::Api::new().map_err(|e| ConfigError::Hub(e.to_string()))?;
                api.model(repo.clone())
                    .get(file)
                    .map_err(|e| ConfigError::Hub(format!("{repo}/{file}: {e}")))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackboneOptions {
    pub source: BackboneSource,
    pub device: Device,
    pub input_name: String,
    pub output_name: String,
}

/// A named parameter tensor that replaces the exported value of the same name.
#[derive(Debug, Clone)]
pub struct InitializerOverride {
    pub name: String,
    pub value: ArrayD<f32>,
}

pub struct OnnxBackbone {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
}

impl OnnxBackbone {
    /// Build the session. Blocking.
    ///
    /// Every override must land on an initializer of the graph; see
    /// [`GraphInitializers::resolve`].
    pub fn load(options: &BackboneOptions, overrides: &[InitializerOverride]) -> Result<Self, ConfigError> {
        let path = options.source.resolve()?;
        let overrides = if overrides.is_empty() {
            Vec::new()
        } else {
            GraphInitializers::read(&path)?.resolve(overrides)?
        };
        let session = build_session(&path, options.device, &overrides)
            .map_err(|source| ConfigError::Backbone { path: path.clone(), source })?;
        info!(
            "backbone loaded from {} on {:?} ({} overridden parameters)",
            path.display(),
            options.device,
            overrides.len()
        );
        Ok(Self {
            session: Mutex::new(session),
            input_name: options.input_name.clone(),
            output_name: options.output_name.clone(),
        })
    }
}

fn build_session(path: &Path, device: Device, overrides: &[InitializerOverride]) -> Result<Session, ort::Error> {
    // CPU-friendly runtime tuning
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    let intra: usize = std::cmp::max(1, cpus / 2);
    let inter: usize = 1;

    let mut builder = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(intra)?
        .with_inter_threads(inter)?
        .with_memory_pattern(true)?
        .with_config_entry("session.set_denormal_as_zero", "1")?;
    builder = with_device(builder, device)?;
    for o in overrides {
        debug!("overriding initializer {} {:?}", o.name, o.value.shape());
        let value: DynValue = Tensor::from_array(o.value.clone())?.into_dyn();
        builder = builder.with_initializer(o.name.as_str(), Arc::new(value))?;
    }
    builder.commit_from_file(path)
}

/// Takes the lock even if an earlier run panicked while holding it.
fn lock_session<T>(session: &Mutex<T>) -> MutexGuard<'_, T> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(feature = "cuda")]
fn with_device(builder: SessionBuilder, device: Device) -> Result<SessionBuilder, ort::Error> {
    use ort::execution_providers::{CPUExecutionProvider, CUDAExecutionProvider};
    match device {
        Device::Cpu => Ok(builder),
        Device::Cuda { device_id } => builder.with_execution_providers([
            CUDAExecutionProvider::default().with_device_id(device_id).build(),
            CPUExecutionProvider::default().build(),
        ]),
    }
}

#[cfg(not(feature = "cuda"))]
fn with_device(builder: SessionBuilder, device: Device) -> Result<SessionBuilder, ort::Error> {
    if let Device::Cuda { .. } = device {
        tracing::warn!("built without the `cuda` feature; running the backbone on CPU");
    }
    Ok(builder)
}

impl Backbone for OnnxBackbone {
    fn pooled_embedding(&self, input: Array4<f32>) -> Result<Array2<f32>, ModelError> {
        let batch = input.shape()[0];
        let t_image = Tensor::from_array(input)?;
        let mut guard = lock_session(&self.session);
        let outs = guard.run(ort::inputs![self.input_name.as_str() => t_image])?;
        let pooled = outs
            .get(self.output_name.as_str())
            .ok_or_else(|| ModelError::MissingOutput(self.output_name.clone()))?
            .try_extract_array::<f32>()?;
        let pooled = pooled.into_dimensionality::<Ix2>()?.to_owned();
        if pooled.nrows() != batch {
            return Err(ModelError::Shape(format!(
                "backbone returned {} rows for a batch of {batch}",
                pooled.nrows()
            )));
        }
        Ok(pooled)
    }
}
