//! Provider access: raw backends, credential pools, and the rotating client.
//!
//! * [`LlmBackend`] is one HTTP API (Gemini, DeepSeek) that knows how to turn
//!   an [`LlmRequest`] plus one API key into text, and how to classify its
//!   failures into a [`ProviderError`].
//! * [`CredentialPool`] is the round-robin key list for one provider.
//! * [`KeyRotationClient`] combines them with the retry, rotation and
//!   circuit-breaker rules. Stages only ever talk to the client.

pub mod client;
pub mod credentials;
pub mod deepseek;
pub mod gemini;

pub use client::{CallOptions, ClientSettings, KeyRotationClient};
pub use credentials::{Credential, CredentialPool};
pub use deepseek::DeepSeekBackend;
pub use gemini::GeminiBackend;

use crate::cancel::Cancelled;
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Token ceiling for newer models (Gemini 2.5 and later).
pub const LARGE_MODEL_TOKEN_CEILING: u32 = 32_768;
/// Token ceiling for every other model.
pub const DEFAULT_TOKEN_CEILING: u32 = 8_192;

/// The provider family a model name routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Provider {
    Gemini,
    DeepSeek,
}

impl Provider {
    /// `deepseek*` models go to DeepSeek; everything else to Gemini.
    pub fn for_model(model: &str) -> Self {
        if model.trim().to_ascii_lowercase().starts_with("deepseek") {
            Provider::DeepSeek
        } else {
            Provider::Gemini
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Gemini => f.write_str("gemini"),
            Provider::DeepSeek => f.write_str("deepseek"),
        }
    }
}

/// Maximum output tokens the model accepts.
pub fn token_ceiling(model: &str) -> u32 {
    let m = model.to_ascii_lowercase();
    let version = m
        .strip_prefix("models/")
        .unwrap_or(&m)
        .strip_prefix("gemini-")
        .and_then(|rest| {
            let end = rest
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .unwrap_or(rest.len());
            rest[..end].parse::<f32>().ok()
        });
    match version {
        Some(v) if v >= 2.5 => LARGE_MODEL_TOKEN_CEILING,
        _ => DEFAULT_TOKEN_CEILING,
    }
}

/// `min(requested, ceiling)`; never above the model's ceiling.
pub fn clamp_max_tokens(model: &str, requested: u32) -> u32 {
    requested.min(token_ceiling(model))
}

/// A document attached to a request.
#[derive(Debug, Clone)]
pub struct DocumentPayload {
    pub path: PathBuf,
    pub mime_type: &'static str,
    pub bytes: Arc<Vec<u8>>,
}

/// One provider call, independent of the key used to send it.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub system_prompt: Option<String>,
    pub text: String,
    pub document: Option<DocumentPayload>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Failure of a single provider call, classified for the retry rules.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    /// HTTP 429 or a quota marker. Back off, then rotate.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// HTTP 401/403, or a leaked/invalid key. Rotate immediately.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Gateway timeout class or transport failure. Short backoff.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Malformed request, safety block, empty answer. Not retried.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("cancelled")]
    Cancelled,
}

impl From<Cancelled> for ProviderError {
    fn from(_: Cancelled) -> Self {
        ProviderError::Cancelled
    }
}

impl ProviderError {
    /// The same error with `redact` applied to its message.
    pub fn map_message(self, redact: impl Fn(&str) -> String) -> Self {
        match self {
            ProviderError::RateLimited(m) => ProviderError::RateLimited(redact(&m)),
            ProviderError::Auth(m) => ProviderError::Auth(redact(&m)),
            ProviderError::Timeout(m) => ProviderError::Timeout(redact(&m)),
            ProviderError::Rejected(m) => ProviderError::Rejected(redact(&m)),
            ProviderError::Cancelled => ProviderError::Cancelled,
        }
    }
}

/// Map an HTTP status and response body onto a [`ProviderError`].
pub fn classify_status(status: u16, body: &str) -> ProviderError {
    let lower = body.to_ascii_lowercase();
    let snippet: String = body.chars().take(500).collect();
    let msg = format!("HTTP {status}: {snippet}");

    if status == 429 || lower.contains("resource_exhausted") || lower.contains("quota") {
        ProviderError::RateLimited(msg)
    } else if status == 401
        || status == 403
        || lower.contains("leaked")
        || lower.contains("api_key_invalid")
        || lower.contains("api key not valid")
        || lower.contains("permission_denied")
    {
        ProviderError::Auth(msg)
    } else if matches!(status, 408 | 500 | 502 | 503 | 504) {
        ProviderError::Timeout(msg)
    } else {
        ProviderError::Rejected(msg)
    }
}

/// Map a transport failure (no HTTP status) onto a [`ProviderError`].
pub fn classify_transport(err: &reqwest::Error) -> ProviderError {
    match err.status() {
        Some(status) => classify_status(status.as_u16(), &err.to_string()),
        None => ProviderError::Timeout(err.to_string()),
    }
}

/// One provider HTTP API.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Whether the API takes a PDF attachment. When `false` the client sends
    /// the document's extracted text instead.
    fn accepts_documents(&self) -> bool;

    /// Issue one request with one key. No retries happen here.
    async fn generate(&self, api_key: &str, request: &LlmRequest) -> Result<String, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceilings_by_generation() {
        assert_eq!(token_ceiling("gemini-2.5-pro"), 32_768);
        assert_eq!(token_ceiling("models/gemini-3-flash"), 32_768);
        assert_eq!(token_ceiling("gemini-2.0-flash"), 8_192);
        assert_eq!(token_ceiling("gemini-1.5-pro-latest"), 8_192);
        assert_eq!(token_ceiling("deepseek-chat"), 8_192);
    }

    #[test]
    fn clamp_never_exceeds_ceiling() {
        assert_eq!(clamp_max_tokens("gemini-2.0-flash", 65_536), 8_192);
        assert_eq!(clamp_max_tokens("gemini-2.5-flash", 65_536), 32_768);
        assert_eq!(clamp_max_tokens("gemini-2.5-flash", 1_000), 1_000);
    }

    #[test]
    fn provider_routing() {
        assert_eq!(Provider::for_model("DeepSeek-Reasoner"), Provider::DeepSeek);
        assert_eq!(Provider::for_model("gemini-2.5-pro"), Provider::Gemini);
    }

    #[test]
    fn status_classification() {
        assert!(matches!(classify_status(429, ""), ProviderError::RateLimited(_)));
        assert!(matches!(
            classify_status(400, r#"{"status":"RESOURCE_EXHAUSTED"}"#),
            ProviderError::RateLimited(_)
        ));
        assert!(matches!(classify_status(403, "forbidden"), ProviderError::Auth(_)));
        assert!(matches!(
            classify_status(400, "Your API key was reported as leaked"),
            ProviderError::Auth(_)
        ));
        assert!(matches!(classify_status(504, ""), ProviderError::Timeout(_)));
        assert!(matches!(classify_status(400, "bad field"), ProviderError::Rejected(_)));
    }
}
