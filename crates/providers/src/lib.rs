//! dlm_providers
//!
//! Provider transport + normalization ONLY.
//! No policy. No mediation. No audit. No retries.
//! Input MUST be a fully-resolved `QllmRequest` (the `qllm_remote` wire
//! contract from spec.md §6.2, post-`Mediator::before_tool`).
//!
//! Retargeted from `pie_providers::OpenAICompatProvider`: same `Provider`
//! trait shape and OpenAI-chat-completions wire adapter, but the outbound
//! body is built from `{request, source, format}` turned into a single
//! user-role chat message instead of a multi-field prompt.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// The resolved `qllm_remote` argument, ready to dispatch. `format` is kept
/// as a raw JSON value here rather than `dlm_schema::Format` so this crate
/// has no dependency on schema semantics — it only forwards bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QllmRequest {
    pub request: String,
    pub source: String,
    pub format: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMsg {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderReply {
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: Usage,
    /// Raw provider request id if present, for audit correlation by the caller.
    pub provider_request_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub raw_json: Value,
    pub normalized: ProviderReply,
}

#[async_trait]
pub trait Provider: Send + Sync {
    async fn dispatch(&self, req: &QllmRequest) -> Result<ProviderResponse, ProviderError>;
}

/// Renders a `QllmRequest` as the single user-role message sent to the
/// Q-LLM backend. The declared `format` is embedded as an explicit
/// instruction so the backend's free-text completion is steered toward the
/// shape `SchemaValidator` will check afterward.
fn to_chat_msg(req: &QllmRequest) -> ChatMsg {
    let content = format!(
        "{}\n\nRespond with a single JSON object matching this format (field: type): {}\nSource: {}",
        req.request, req.format, req.source
    );
    ChatMsg { role: "user".to_string(), content }
}

pub struct OpenAICompatProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAICompatProvider {
    pub fn new(base_url: String, api_key: Option<String>, model: String) -> Self {
        Self { client: Client::new(), base_url, api_key, model }
    }
}

#[derive(Debug, Serialize)]
struct OpenAICompatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMsg>,
    max_tokens: u64,
    temperature: f64,
}

#[async_trait]
impl Provider for OpenAICompatProvider {
    async fn dispatch(&self, req: &QllmRequest) -> Result<ProviderResponse, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let body = OpenAICompatRequest {
            model: &self.model,
            messages: vec![to_chat_msg(req)],
            max_tokens: 1024,
            temperature: 0.0,
        };

        let mut r = self.client.post(url).json(&body);
        if let Some(k) = &self.api_key {
            if !k.is_empty() {
                r = r.bearer_auth(k);
            }
        }
        let resp = r.send().await?;
        let raw: Value = resp.json().await?;

        let content = raw
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c0| c0.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProviderError::InvalidResponse("missing choices[0].message.content".into()))?
            .to_string();

        let finish_reason = raw
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c0| c0.get("finish_reason"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let input_tokens = raw.get("usage").and_then(|u| u.get("prompt_tokens")).and_then(|v| v.as_u64());
        let output_tokens = raw.get("usage").and_then(|u| u.get("completion_tokens")).and_then(|v| v.as_u64());

        let provider_request_id = raw.get("id").and_then(|v| v.as_str()).map(|s| s.to_string());

        Ok(ProviderResponse {
            raw_json: raw.clone(),
            normalized: ProviderReply {
                content,
                finish_reason,
                usage: Usage { input_tokens, output_tokens },
                provider_request_id,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_msg_embeds_request_format_and_source() {
        let req = QllmRequest {
            request: "Extract the weather".to_string(),
            source: "key:00000000-0000-4000-8000-000000000000".to_string(),
            format: serde_json::json!({ "temperature": "float" }),
        };
        let msg = to_chat_msg(&req);
        assert_eq!(msg.role, "user");
        assert!(msg.content.contains("Extract the weather"));
        assert!(msg.content.contains("temperature"));
    }
}
