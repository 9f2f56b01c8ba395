use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use utoipa::ToSchema;

use crate::model::Variant;
use crate::service::ServiceState;

/// Event body as sent by the serverless host.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct InferenceRequest {
    /// Handler input. Treated as empty when absent.
    #[serde(default)]
    pub input: InferenceInput,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct InferenceInput {
    /// Base64-encoded PNG or JPEG image data.
    #[schema(example = "<base64 PNG/JPEG data>")]
    pub image: Option<String>,
}

impl InferenceRequest {
    pub fn with_image(image: impl Into<String>) -> Self {
        Self {
            input: InferenceInput {
                image: Some(image.into()),
            },
        }
    }
}

/// Handler output: either one scalar under a variant-specific key or an error message.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerResponse {
    Success { key: &'static str, value: f64 },
    Error { error: String },
}

impl HandlerResponse {
    pub fn error(msg: impl Into<String>) -> Self {
        HandlerResponse::Error { error: msg.into() }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, HandlerResponse::Error { .. })
    }
}

impl Serialize for HandlerResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        match self {
            HandlerResponse::Success { key, value } => map.serialize_entry(key, value)?,
            HandlerResponse::Error { error } => map.serialize_entry("error", error)?,
        }
        map.end()
    }
}

/// Success payload of the embedding-mean variant.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EmbeddingMeanResponse {
    /// Mean of the pooled DINOv3 embedding.
    #[schema(example = 0.0123)]
    pub avg_pooling_vector: f64,
}

/// Success payload of the fine-tuned variant.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ScoreResponse {
    /// Output of the fine-tune head.
    #[schema(example = 63.5)]
    pub score: f64,
}

/// Success payload of either variant.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum SuccessResponse {
    EmbeddingMean(EmbeddingMeanResponse),
    Score(ScoreResponse),
}

/// Error payload.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Human-readable diagnostic.
    #[schema(example = "No image provided. Please provide 'image' in base64 format.")]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub state: ServiceState,
    #[schema(value_type = String, example = "embedding-mean")]
    pub variant: Variant,
}
