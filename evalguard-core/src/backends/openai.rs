//! OpenAI-compatible model backend.
//!
//! Sends every text input of an example as one user message (inputs joined in
//! field-name order) and inline or on-disk images as data URLs. Decoding
//! parameters are copied into the request body verbatim.

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Instant;
use tracing::debug;

use crate::adapter::{GenerationRequest, ModelBackend, Options, optional_str, required_str};
use crate::error::BackendError;
use crate::types::{Example, Generation, Payload};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";

pub struct OpenAiBackend {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiBackend {
    pub fn new(model: impl Into<String>, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// Options: `model` (required), `base_url`, `api_key`, `api_key_env`.
    ///
    /// Local endpoints (localhost, 127.0.0.1) do not need an API key.
    pub fn from_options(options: &Options) -> Result<Self, String> {
        let model = required_str(options, "model")?;
        let base_url = optional_str(options, "base_url").unwrap_or(DEFAULT_BASE_URL);
        let key_env = optional_str(options, "api_key_env").unwrap_or(DEFAULT_API_KEY_ENV);
        let is_local = base_url.contains("localhost") || base_url.contains("127.0.0.1");

        let api_key = optional_str(options, "api_key")
            .map(str::to_string)
            .or_else(|| std::env::var(key_env).ok())
            .or_else(|| {
                if is_local {
                    debug!("No API key set for local endpoint; using dummy bearer token");
                    Some("local".to_string())
                } else {
                    None
                }
            })
            .ok_or_else(|| format!("env var '{key_env}' not set"))?;

        Ok(Self::new(model, base_url, api_key))
    }

    /// Build the chat completions request body for one example.
    fn request_body(
        &self,
        example: &Example,
        request: &GenerationRequest,
    ) -> Result<Value, BackendError> {
        let mut parts = Vec::new();
        let mut text = Vec::new();
        for (name, payload) in &example.inputs {
            match payload {
                Payload::Text { text: t } => text.push(t.as_str()),
                Payload::Image { media } => {
                    let bytes = media.bytes().map_err(|e| {
                        BackendError::permanent(format!("input '{name}' unreadable: {e}"))
                    })?;
                    let url = format!(
                        "data:{};base64,{}",
                        sniff_mime(&bytes),
                        base64::engine::general_purpose::STANDARD.encode(&bytes)
                    );
                    parts.push(json!({"type": "image_url", "image_url": {"url": url}}));
                }
                Payload::Video { .. } => {
                    return Err(BackendError::permanent(format!(
                        "input '{name}' is a video; chat completions accept text and images only"
                    )));
                }
            }
        }
        if text.is_empty() && parts.is_empty() {
            return Err(BackendError::permanent("example has no inputs"));
        }

        let content = if parts.is_empty() {
            json!(text.join("\n\n"))
        } else {
            if !text.is_empty() {
                parts.insert(0, json!({"type": "text", "text": text.join("\n\n")}));
            }
            Value::Array(parts)
        };

        let mut body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": content}],
            "stream": false,
        });
        for (key, value) in &request.decode_params {
            body[key.as_str()] = value.clone();
        }
        Ok(body)
    }

    /// Map a non-success HTTP status to the matching failure class.
    fn map_http_error(status: reqwest::StatusCode, retry_after: Option<u64>, body: &str) -> BackendError {
        match status.as_u16() {
            429 => BackendError::RateLimited {
                retry_after_secs: retry_after.unwrap_or(5),
            },
            408 => BackendError::transient(format!("HTTP 408: {body}")),
            s if s >= 500 => BackendError::transient(format!("Server error ({s}): {body}")),
            s => BackendError::permanent(format!("HTTP {s}: {body}")),
        }
    }

    fn parse_response(json: &Value, latency_ms: f64) -> Result<Generation, BackendError> {
        let content = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| BackendError::permanent("response has no message content"))?;
        let usage = |field: &str| {
            json.get("usage")
                .and_then(|u| u.get(field))
                .and_then(|v| v.as_u64())
                .map(|v| v as u32)
        };
        Ok(Generation {
            raw_output: content.to_string(),
            extracted_answer: Some(content.trim().to_string()),
            latency_ms,
            tokens_in: usage("prompt_tokens"),
            tokens_out: usage("completion_tokens"),
        })
    }
}

fn sniff_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"\x89PNG") {
        "image/png"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if bytes.starts_with(b"GIF8") {
        "image/gif"
    } else if bytes.len() > 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "application/octet-stream"
    }
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    fn identity(&self) -> String {
        format!("openai:{}", self.model)
    }

    async fn generate(
        &self,
        example: &Example,
        request: &GenerationRequest,
    ) -> Result<Generation, BackendError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(example, request)?;

        debug!(url = %url, model = %self.model, example_id = %example.id, "Sending chat completion request");
        let started = Instant::now();

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout { timeout_secs: 0 }
                } else {
                    BackendError::transient(format!("Request failed: {e}"))
                }
            })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let text = response
            .text()
            .await
            .map_err(|e| BackendError::transient(format!("Failed to read response body: {e}")))?;

        if !status.is_success() {
            return Err(Self::map_http_error(status, retry_after, &text));
        }

        let json: Value = serde_json::from_str(&text)
            .map_err(|e| BackendError::transient(format!("Invalid JSON: {e}")))?;
        Self::parse_response(&json, started.elapsed().as_secs_f64() * 1000.0)
    }
}
