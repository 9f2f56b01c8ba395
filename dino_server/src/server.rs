//! HTTP shim standing in for the serverless host's dispatch.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::error::RequestError;
use crate::model::Variant;
use crate::service::{InferenceService, ServiceState};
use crate::shared::{
    EmbeddingMeanResponse, ErrorResponse, HandlerResponse, HealthResponse, InferenceInput, InferenceRequest,
    ScoreResponse, SuccessResponse,
};

const BODY_LIMIT: usize = 50 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<InferenceService>,
    pub variant: Variant,
}

#[derive(OpenApi)]
#[openapi(
    paths(handler, health),
    components(schemas(
        InferenceRequest,
        InferenceInput,
        EmbeddingMeanResponse,
        ScoreResponse,
        SuccessResponse,
        ErrorResponse,
        HealthResponse,
        ServiceState
    ))
)]
pub struct ApiDoc;

#[utoipa::path(
    post,
    path = "/api/handler",
    tag = "Inference",
    summary = "Score one base64-encoded image",
    description = r#"Request body: `{"input": {"image": "<base64 PNG/JPEG>"}}`.
The response carries exactly one key: `avg_pooling_vector` (embedding-mean variant),
`score` (finetuned variant) or `error`. The same endpoint is mounted at `/runsync`."#,
    request_body = InferenceRequest,
    responses(
        (status = 200, description = "Scalar result under the variant's key", body = SuccessResponse),
        (status = 400, description = "Missing or undecodable image", body = ErrorResponse),
        (status = 500, description = "Model failure", body = ErrorResponse)
    )
)]
async fn handler(
    State(state): State<AppState>,
    payload: Result<Json<InferenceRequest>, JsonRejection>,
) -> (StatusCode, Json<HandlerResponse>) {
    let result = match payload {
        Ok(Json(req)) => state.service.run(req).await,
        Err(rejection) => Err(RequestError::InvalidBody(rejection.body_text())),
    };
    let code = match &result {
        Ok(_) => StatusCode::OK,
        Err(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, Json(result.into()))
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    summary = "Model lifecycle state",
    responses(
        (status = 200, description = "Current state", body = HealthResponse)
    )
)]
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        state: state.service.state(),
        variant: state.variant,
    })
}

/// Routes, docs and middleware. Metrics are added by the binary.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/api/handler", post(handler))
        .route("/runsync", post(handler))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
