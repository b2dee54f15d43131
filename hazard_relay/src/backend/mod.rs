mod claude;
mod gemini;

pub use claude::ClaudeBackend;
pub use gemini::GeminiBackend;

use crate::config::{BackendKind, Config, ConfigurationError};
use crate::frame::Frame;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub(crate) const JPEG_MIME_TYPE: &str = "image/jpeg";

#[derive(Error, Debug)]
pub enum InferenceError {
    /// The upstream call failed, timed out or returned a non-success status.
    #[error("Provider error: {0}")]
    Provider(String),
    /// The upstream answered successfully but the content broke the contract.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl InferenceError {
    pub fn kind(&self) -> &'static str {
        match self {
            InferenceError::Provider(_) => "provider",
            InferenceError::Protocol(_) => "protocol",
        }
    }

    /// The request URL is stripped; it can carry the provider key.
    pub(crate) fn from_transport(provider: &str, err: reqwest::Error) -> Self {
        let err = err.without_url();
        if err.is_timeout() {
            InferenceError::Provider(format!("{} request timed out", provider))
        } else {
            InferenceError::Provider(format!("{} request failed: {}", provider, err))
        }
    }
}

/// A remote vision model able to describe a frame and judge whether it shows
/// a hazard.
#[async_trait]
pub trait InferenceBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn describe(&self, frame: &Frame, prompt: &str) -> Result<String, InferenceError>;

    async fn classify_hazard(&self, frame: &Frame, prompt: &str) -> Result<bool, InferenceError>;
}

/// Maps a classifier answer onto a verdict. Only `yes` and `no` are accepted,
/// ignoring case and surrounding whitespace.
pub fn parse_hazard_verdict(answer: &str) -> Result<bool, InferenceError> {
    match answer.trim().to_lowercase().as_str() {
        "yes" => Ok(true),
        "no" => Ok(false),
        other => Err(InferenceError::Protocol(format!(
            "Unexpected response from model: '{}'",
            other
        ))),
    }
}

pub(crate) fn http_client(
    backend: &'static str,
    timeout_ms: u64,
) -> Result<reqwest::Client, ConfigurationError> {
    reqwest::Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
        .map_err(|source| ConfigurationError::HttpClient { backend, source })
}

pub fn build_backend(
    kind: BackendKind,
    config: &Config,
) -> Result<Arc<dyn InferenceBackend>, ConfigurationError> {
    let backend: Arc<dyn InferenceBackend> = match kind {
        BackendKind::Claude => Arc::new(ClaudeBackend::new(&config.claude)?),
        BackendKind::Gemini => Arc::new(GeminiBackend::new(&config.gemini)?),
    };
    tracing::info!(kind = kind.as_str(), "Initialized {} inference backend", backend.name());
    Ok(backend)
}
