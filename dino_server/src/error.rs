//! Error taxonomy.
//!
//! [`RequestError`] is localized to a single request and always ends up in an
//! error payload. [`ConfigError`] describes initialization problems that may
//! abort startup.

use std::path::PathBuf;

use thiserror::Error;

/// Failure inside the backbone or the scoring head.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("onnx runtime: {0}")]
    Ort(#[from] ort::Error),
    #[error("tensor: {0}")]
    Candle(#[from] candle_core::Error),
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("backbone output `{0}` missing from session outputs")]
    MissingOutput(String),
    #[error("model produced a non-finite value ({0})")]
    NonFinite(f32),
}

impl From<ndarray::ShapeError> for ModelError {
    fn from(e: ndarray::ShapeError) -> Self {
        ModelError::Shape(e.to_string())
    }
}

/// Configuration or initialization failure. Not recoverable per request.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("R2 settings not provided; set {}", .0.join(", "))]
    MissingR2Settings(Vec<&'static str>),
    #[error("no objects found in bucket '{bucket}' with prefix '{prefix}'")]
    NoRemoteObjects { bucket: String, prefix: String },
    #[error("object store: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} doesn't exist")]
    MissingWeightFile(PathBuf),
    #[error("failed to read weights from {path}: {source}")]
    WeightFile {
        path: PathBuf,
        #[source]
        source: candle_core::Error,
    },
    #[error("invalid fine-tune head: {0}")]
    Head(String),
    #[error("backbone load failed for {path}: {source}")]
    Backbone {
        path: PathBuf,
        #[source]
        source: ort::Error,
    },
    #[error("cannot read ONNX graph {path}: {message}")]
    Graph { path: PathBuf, message: String },
    #[error("{} has no initializer for {}", .path.display(), .names.join(", "))]
    UnmatchedInitializers { path: PathBuf, names: Vec<String> },
    #[error("model hub: {0}")]
    Hub(String),
    #[error("initialization task failed: {0}")]
    Task(String),
}

impl ConfigError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConfigError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Everything that can go wrong while serving one request.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("No image provided. Please provide 'image' in base64 format.")]
    MissingImage,
    #[error("invalid request body: {0}")]
    InvalidBody(String),
    #[error("invalid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("invalid image: {0}")]
    InvalidImage(#[from] image::ImageError),
    #[error("preprocess error: {0}")]
    Preprocess(String),
    #[error("inference failed: {0}")]
    Model(#[from] ModelError),
    #[error("model initialization failed: {0}")]
    Initialization(#[from] ConfigError),
    #[error("inference worker panicked: {0}")]
    WorkerPanicked(String),
}

impl RequestError {
    /// Whether the failure was caused by the request content rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RequestError::MissingImage
                | RequestError::InvalidBody(_)
                | RequestError::InvalidBase64(_)
                | RequestError::InvalidImage(_)
                | RequestError::Preprocess(_)
        )
    }
}
