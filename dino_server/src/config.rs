//! Command line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};

use crate::backbone::{BackboneOptions, BackboneSource, DeviceChoice, DEFAULT_MODEL_FILE, DEFAULT_MODEL_REPO};
use crate::fetch::R2Settings;
use crate::model::Variant;
use crate::preprocess::PreprocessConfig;
use crate::service::{FinetuneOptions, InferenceService, OnnxModelFactory};

#[derive(Debug, Parser)]
#[command(name = "dino_server", version)]
#[command(about = "DINOv3 inference handler with an optional fine-tuned scoring head")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the handler over HTTP.
    Serve(ServeArgs),
    /// Run the handler once on a local image and print the response.
    Invoke(InvokeArgs),
    /// Download the fine-tune weight bundle from R2.
    FetchWeights(FetchArgs),
    /// Download the backbone ONNX file into the local hub cache.
    CacheModel(CacheModelArgs),
    /// Load the fine-tune bundle and write a timestamped copy of it.
    ExportWeights(ExportArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ModelArgs {
    #[arg(long, env = "DINO_VARIANT", value_enum, default_value_t = Variant::EmbeddingMean)]
    pub variant: Variant,

    #[arg(long, env = "DINO_DEVICE", value_enum, default_value_t = DeviceChoice::Auto)]
    pub device: DeviceChoice,

    /// Local ONNX file. When unset the backbone is resolved through the hub cache.
    #[arg(long, env = "DINO_MODEL_PATH")]
    pub model_path: Option<PathBuf>,

    #[arg(long, env = "DINO_MODEL_REPO", default_value = DEFAULT_MODEL_REPO)]
    pub model_repo: String,

    #[arg(long, env = "DINO_MODEL_FILE", default_value = DEFAULT_MODEL_FILE)]
    pub model_file: String,

    #[arg(long, env = "DINO_INPUT_NAME", default_value = "pixel_values")]
    pub input_name: String,

    #[arg(long, env = "DINO_OUTPUT_NAME", default_value = "pooler_output")]
    pub output_name: String,

    /// Square input resolution. Defaults to 512 for embedding-mean and 224 for finetuned.
    #[arg(long, env = "DINO_RESIZE", conflicts_with = "no_resize")]
    pub resize: Option<u32>,

    /// Feed images at their native resolution.
    #[arg(long)]
    pub no_resize: bool,

    #[arg(long, env = "DINO_WEIGHTS_DIR", default_value = "./weights")]
    pub weights_dir: PathBuf,

    /// Initializer prefix of the last transformer block in the ONNX graph.
    #[arg(long, env = "DINO_LAST_LAYER_PREFIX", default_value = "layer.11")]
    pub last_layer_prefix: String,

    #[arg(long, env = "DINO_NORM_PREFIX", default_value = "norm")]
    pub norm_prefix: String,

    /// Expected pooled embedding width; checked against the head weights.
    #[arg(long, env = "DINO_EMBEDDING_DIM")]
    pub embedding_dim: Option<usize>,

    #[command(flatten)]
    pub r2: R2Settings,
}

impl ModelArgs {
    pub fn preprocess_config(&self) -> PreprocessConfig {
        if self.no_resize {
            PreprocessConfig::native()
        } else {
            PreprocessConfig::square(self.resize.unwrap_or_else(|| self.variant.default_resize()))
        }
    }

    pub fn backbone_source(&self) -> BackboneSource {
        match &self.model_path {
            Some(path) => BackboneSource::Local(path.clone()),
            None => BackboneSource::Hub {
                repo: self.model_repo.clone(),
                file: self.model_file.clone(),
            },
        }
    }

    pub fn backbone_options(&self) -> BackboneOptions {
        BackboneOptions {
            source: self.backbone_source(),
            device: self.device.resolve(),
            input_name: self.input_name.clone(),
            output_name: self.output_name.clone(),
        }
    }

    pub fn finetune_options(&self) -> FinetuneOptions {
        FinetuneOptions {
            weights_dir: self.weights_dir.clone(),
            last_layer_prefix: self.last_layer_prefix.clone(),
            norm_prefix: self.norm_prefix.clone(),
            embedding_dim: self.embedding_dim,
        }
    }

    pub fn factory(&self) -> OnnxModelFactory {
        OnnxModelFactory {
            variant: self.variant,
            backbone: self.backbone_options(),
            finetune: self.finetune_options(),
            fetcher: Arc::new(self.r2.clone()),
        }
    }

    pub fn service(&self) -> InferenceService {
        InferenceService::new(Arc::new(self.factory()), self.preprocess_config())
    }
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    #[arg(long, env = "DINO_BIND", default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,

    /// Defer model construction to the first request.
    #[arg(long)]
    pub lazy: bool,
}

#[derive(Debug, Clone, Args)]
pub struct InvokeArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Image file to send.
    #[arg(long, required_unless_present = "red_square", conflicts_with = "red_square")]
    pub image: Option<PathBuf>,

    /// Send a generated 224x224 red JPEG instead of a file.
    #[arg(long)]
    pub red_square: bool,
}

#[derive(Debug, Clone, Args)]
pub struct FetchArgs {
    #[arg(long, env = "DINO_WEIGHTS_DIR", default_value = "./weights")]
    pub dir: PathBuf,

    #[command(flatten)]
    pub r2: R2Settings,
}

#[derive(Debug, Clone, Args)]
pub struct CacheModelArgs {
    #[arg(long, env = "DINO_MODEL_REPO", default_value = DEFAULT_MODEL_REPO)]
    pub model_repo: String,

    #[arg(long, env = "DINO_MODEL_FILE", default_value = DEFAULT_MODEL_FILE)]
    pub model_file: String,
}

#[derive(Debug, Clone, Args)]
pub struct ExportArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Parent directory of the new `ft_weights_<timestamp>` folder.
    #[arg(long, default_value = ".")]
    pub out: PathBuf,
}
