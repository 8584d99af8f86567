//! Inference client seam: one prompt in, one text reply out.
//!
//! Implementations make exactly one call per `infer` and never retry; retry
//! policy belongs to the caller.

pub mod http_client;
pub mod scripted;

use async_trait::async_trait;

use crate::error::InferenceError;

pub use http_client::{HttpInferenceClient, InferenceSettings};
pub use scripted::ScriptedInferenceClient;

#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn infer(&self, prompt: &str) -> Result<String, InferenceError>;
}
