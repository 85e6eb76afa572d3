//! Google Gemini `generateContent` backend.
//!
//! PDFs are sent inline as base64 `inlineData` parts, so one request carries
//! both the document and the prompt. The key travels as a `key=` query
//! parameter; errors built from request URLs are redacted by the client
//! before they are logged.

use super::{classify_status, classify_transport, LlmBackend, LlmRequest, ProviderError};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiBackend {
    http: reqwest::Client,
    base_url: String,
}

impl GeminiBackend {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Self::with_base_url(DEFAULT_BASE_URL, timeout)
    }

    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part<'a> {
    Text { text: &'a str },
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: &'static str,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

fn build_body(request: &LlmRequest) -> GenerateRequest<'_> {
    let mut parts = Vec::with_capacity(2);
    if let Some(doc) = &request.document {
        parts.push(Part::Inline {
            inline_data: InlineData {
                mime_type: doc.mime_type,
                data: STANDARD.encode(doc.bytes.as_slice()),
            },
        });
    }
    parts.push(Part::Text {
        text: &request.text,
    });

    GenerateRequest {
        contents: vec![Content {
            role: Some("user"),
            parts,
        }],
        system_instruction: request.system_prompt.as_deref().map(|s| Content {
            role: None,
            parts: vec![Part::Text { text: s }],
        }),
        generation_config: GenerationConfig {
            temperature: request.temperature,
            max_output_tokens: request.max_tokens,
        },
    }
}

fn read_response(body: GenerateResponse) -> Result<String, ProviderError> {
    if let Some(reason) = body.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(ProviderError::Rejected(format!("prompt blocked: {reason}")));
    }
    let candidate = body
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Rejected("response has no candidates".into()))?;
    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        let reason = candidate.finish_reason.unwrap_or_else(|| "UNKNOWN".into());
        return Err(ProviderError::Rejected(format!(
            "empty response (finish reason {reason})"
        )));
    }
    if candidate.finish_reason.as_deref() == Some("MAX_TOKENS") {
        debug!("Gemini response stopped at the token limit; JSON may be truncated");
    }
    Ok(text)
}

#[async_trait]
impl LlmBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    fn accepts_documents(&self) -> bool {
        true
    }

    async fn generate(&self, api_key: &str, request: &LlmRequest) -> Result<String, ProviderError> {
        let model = request.model.trim_start_matches("models/");
        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, model);
        let body = build_body(request);

        let response = self
            .http
            .post(&url)
            .query(&[("key", api_key)])
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| classify_transport(&e))?;
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &text));
        }
        let parsed: GenerateResponse = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Rejected(format!("unreadable response body: {e}")))?;
        read_response(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::DocumentPayload;
    use std::sync::Arc;

    fn request(doc: bool) -> LlmRequest {
        LlmRequest {
            model: "gemini-2.5-pro".into(),
            system_prompt: Some("be terse".into()),
            text: "extract".into(),
            document: doc.then(|| DocumentPayload {
                path: "a.pdf".into(),
                mime_type: "application/pdf",
                bytes: Arc::new(b"%PDF-1.4".to_vec()),
            }),
            temperature: 0.7,
            max_tokens: 100,
        }
    }

    #[test]
    fn body_uses_camel_case_and_inline_pdf() {
        let req = request(true);
        let v = serde_json::to_value(build_body(&req)).unwrap();
        assert_eq!(v["generationConfig"]["maxOutputTokens"], 100);
        assert_eq!(v["systemInstruction"]["parts"][0]["text"], "be terse");
        let parts = v["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts[0]["inlineData"]["mimeType"], "application/pdf");
        assert_eq!(parts[0]["inlineData"]["data"], STANDARD.encode(b"%PDF-1.4"));
        assert_eq!(parts[1]["text"], "extract");
    }

    #[test]
    fn text_only_body_has_one_part() {
        let req = request(false);
        let v = serde_json::to_value(build_body(&req)).unwrap();
        assert_eq!(v["contents"][0]["parts"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn response_text_is_concatenated() {
        let body: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"{\"a\":"},{"text":"1}"}]},"finishReason":"STOP"}]}"#,
        )
        .unwrap();
        assert_eq!(read_response(body).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn safety_block_is_rejected() {
        let body: GenerateResponse =
            serde_json::from_str(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).unwrap();
        assert!(matches!(read_response(body), Err(ProviderError::Rejected(m)) if m.contains("SAFETY")));
    }
}
