//! DINOv3 behind a serverless-style inference handler.
//!
//! A request carries one base64 image. The handler decodes it, normalizes it
//! with ImageNet statistics, runs the pretrained backbone and reduces the
//! result to a single scalar: the mean of the pooled embedding, or the output
//! of a fine-tuned scoring head. Any failure becomes an `{"error": ...}`
//! payload; only configuration problems at initialization are fatal.

pub mod backbone;
pub mod config;
pub mod error;
pub mod fetch;
pub mod graph;
pub mod head;
pub mod image_io;
pub mod model;
pub mod preprocess;
pub mod server;
pub mod service;
pub mod shared;

pub use error::{ConfigError, ModelError, RequestError};
pub use service::{InferenceService, ServiceState};
pub use shared::{HandlerResponse, InferenceRequest};
