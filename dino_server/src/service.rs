//! Request handler and the model singleton it owns.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{error, info, info_span, warn, Instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::backbone::{BackboneOptions, OnnxBackbone};
use crate::error::{ConfigError, RequestError};
use crate::fetch::WeightFetcher;
use crate::head::load_finetune_weights;
use crate::image_io::decode_base64_image;
use crate::model::{EmbeddingMeanModel, FineTunedModel, ScoreModel, Variant};
use crate::preprocess::{PreprocessConfig, Preprocessor};
use crate::shared::{HandlerResponse, InferenceRequest};

/// Builds the model on first use.
#[async_trait]
pub trait ModelFactory: Send + Sync {
    async fn build(&self) -> Result<Arc<dyn ScoreModel>, ConfigError>;
}

/// Where the fine-tune bundle lives and how it maps onto the backbone graph.
#[derive(Debug, Clone)]
pub struct FinetuneOptions {
    pub weights_dir: PathBuf,
    /// Initializer name prefix of the last transformer block, e.g. `layer.11`.
    pub last_layer_prefix: String,
    pub norm_prefix: String,
    pub embedding_dim: Option<usize>,
}

pub struct OnnxModelFactory {
    pub variant: Variant,
    pub backbone: BackboneOptions,
    pub finetune: FinetuneOptions,
    pub fetcher: Arc<dyn WeightFetcher>,
}

impl OnnxModelFactory {
    pub async fn build_embedding_mean(&self) -> Result<EmbeddingMeanModel, ConfigError> {
        let options = self.backbone.clone();
        let backbone = spawn_load(move || OnnxBackbone::load(&options, &[])).await?;
        Ok(EmbeddingMeanModel::new(Arc::new(backbone)))
    }

    pub async fn build_finetuned(&self) -> Result<FineTunedModel, ConfigError> {
        let ft = &self.finetune;
        let weights = load_finetune_weights(&ft.weights_dir, self.fetcher.as_ref()).await?;
        let overrides = weights.initializer_overrides(&ft.last_layer_prefix, &ft.norm_prefix)?;
        let options = self.backbone.clone();
        let backbone = spawn_load(move || OnnxBackbone::load(&options, &overrides)).await?;
        FineTunedModel::new(Arc::new(backbone), weights, ft.embedding_dim)
    }
}

async fn spawn_load<T, F>(f: F) -> Result<T, ConfigError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ConfigError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ConfigError::Task(e.to_string()))?
}

#[async_trait]
impl ModelFactory for OnnxModelFactory {
    async fn build(&self) -> Result<Arc<dyn ScoreModel>, ConfigError> {
        let model: Arc<dyn ScoreModel> = match self.variant {
            Variant::EmbeddingMean => Arc::new(self.build_embedding_mean().await?),
            Variant::Finetuned => Arc::new(self.build_finetuned().await?),
        };
        Ok(model)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Uninitialized,
    Ready,
}

/// Successful handler result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scored {
    pub key: &'static str,
    pub value: f32,
}

impl From<Result<Scored, RequestError>> for HandlerResponse {
    fn from(result: Result<Scored, RequestError>) -> Self {
        match result {
            Ok(s) => HandlerResponse::Success {
                key: s.key,
                value: f64::from(s.value),
            },
            Err(e) => HandlerResponse::error(e.to_string()),
        }
    }
}

/// Initialize-once inference service.
///
/// The model is built at most once per service, either by an explicit
/// [`initialize`](Self::initialize) at startup or by the first request.
/// Concurrent first requests wait on the same construction. A failed
/// construction leaves the service uninitialized.
pub struct InferenceService {
    factory: Arc<dyn ModelFactory>,
    preprocessor: Preprocessor,
    model: OnceCell<Arc<dyn ScoreModel>>,
}

impl InferenceService {
    pub fn new(factory: Arc<dyn ModelFactory>, preprocess: PreprocessConfig) -> Self {
        Self {
            factory,
            preprocessor: Preprocessor::new(preprocess),
            model: OnceCell::new(),
        }
    }

    pub fn state(&self) -> ServiceState {
        if self.model.initialized() {
            ServiceState::Ready
        } else {
            ServiceState::Uninitialized
        }
    }

    pub async fn initialize(&self) -> Result<Arc<dyn ScoreModel>, ConfigError> {
        self.model
            .get_or_try_init(|| async {
                info!("initializing model");
                let model = self.factory.build().await.inspect_err(|e| {
                    error!("model initialization failed: {e}");
                })?;
                info!("model ready");
                Ok::<_, ConfigError>(model)
            })
            .await
            .cloned()
    }

    /// Run one request. Never panics; every failure is returned as a value.
    pub async fn run(&self, request: InferenceRequest) -> Result<Scored, RequestError> {
        let request_id = Uuid::new_v4();
        let result = self
            .run_inner(request)
            .instrument(info_span!("handler", %request_id))
            .await;
        match &result {
            Ok(s) => info!(%request_id, "{} = {}", s.key, s.value),
            Err(e) => warn!(%request_id, "request failed: {e}"),
        }
        result
    }

    async fn run_inner(&self, request: InferenceRequest) -> Result<Scored, RequestError> {
        let image = request
            .input
            .image
            .filter(|s| !s.trim().is_empty())
            .ok_or(RequestError::MissingImage)?;
        let model = self.initialize().await?;
        let preprocessor = self.preprocessor.clone();

        tokio::task::spawn_blocking(move || -> Result<Scored, RequestError> {
            let img = decode_base64_image(&image)?;
            let input = preprocessor.run(&img)?;
            let value = model.score(input)?;
            Ok(Scored {
                key: model.result_key(),
                value,
            })
        })
        .await
        .map_err(|e| RequestError::WorkerPanicked(join_error_message(e)))?
    }

    /// Host-facing entry point: the response payload for one event.
    pub async fn handle(&self, request: InferenceRequest) -> HandlerResponse {
        self.run(request).await.into()
    }
}

fn join_error_message(e: tokio::task::JoinError) -> String {
    if e.is_panic() {
        panic_message(e.into_panic())
    } else {
        e.to_string()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
