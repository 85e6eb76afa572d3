//! DeepSeek backend (OpenAI-compatible chat completions).
//!
//! The API takes no file attachments; the client substitutes the document's
//! extracted text before a request reaches this backend.

use super::{classify_status, classify_transport, LlmBackend, LlmRequest, ProviderError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.deepseek.com";

pub struct DeepSeekBackend {
    http: reqwest::Client,
    base_url: String,
}

impl DeepSeekBackend {
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

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

fn build_body(request: &LlmRequest) -> ChatRequest<'_> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = request.system_prompt.as_deref() {
        messages.push(Message {
            role: "system",
            content: system,
        });
    }
    messages.push(Message {
        role: "user",
        content: &request.text,
    });
    ChatRequest {
        model: &request.model,
        messages,
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        stream: false,
    }
}

#[async_trait]
impl LlmBackend for DeepSeekBackend {
    fn name(&self) -> &str {
        "deepseek"
    }

    fn accepts_documents(&self) -> bool {
        false
    }

    async fn generate(&self, api_key: &str, request: &LlmRequest) -> Result<String, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(&build_body(request))
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| classify_transport(&e))?;
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &text));
        }
        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Rejected(format!("unreadable response body: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ProviderError::Rejected("empty response".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_comes_first() {
        let req = LlmRequest {
            model: "deepseek-chat".into(),
            system_prompt: Some("sys".into()),
            text: "user text".into(),
            document: None,
            temperature: 0.2,
            max_tokens: 8192,
        };
        let v = serde_json::to_value(build_body(&req)).unwrap();
        assert_eq!(v["messages"][0]["role"], "system");
        assert_eq!(v["messages"][1]["content"], "user text");
        assert_eq!(v["max_tokens"], 8192);
        assert_eq!(v["stream"], false);
    }
}
