//! Client for OpenAI-compatible chat-completions endpoints.
//!
//! Serves both text generation and image description. Many compatible
//! gateways return the text in a different place than `choices`, so the
//! response is read as loose JSON and normalized here.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use parley_chat::services::{GenerationParams, GenerationService, VisionService};
use parley_core::config::ProvidersConfig;
use parley_core::error::ParleyError;
use parley_core::types::PromptMessage;

const VISION_MAX_TOKENS: u32 = 1024;

/// OpenAI-compatible chat-completions client.
#[derive(Clone)]
pub struct OpenAiCompatibleClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    text_model: String,
    vision_model: String,
}

impl OpenAiCompatibleClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        text_model: impl Into<String>,
        vision_model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ParleyError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ParleyError::Provider(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            text_model: text_model.into(),
            vision_model: vision_model.into(),
        })
    }

    /// Build from config. The API key is read from the environment
    /// variable named by `api_key_env`; local gateways may run without one.
    pub fn from_config(config: &ProvidersConfig) -> Result<Self, ParleyError> {
        let api_key = env::var(&config.api_key_env).ok();
        if api_key.is_none() {
            warn!(
                env_var = %config.api_key_env,
                "No API key set; requests are sent unauthenticated"
            );
        }
        Self::new(
            &config.base_url,
            api_key,
            config.text_model.clone(),
            config.vision_model.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn complete(&self, body: &ChatCompletionRequest<'_>) -> Result<String, ParleyError> {
        let mut request = self.client.post(&self.endpoint).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ParleyError::Provider(format!("chat completion request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error body".to_string());
            return Err(map_http_error(status, &body_text));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ParleyError::Provider(format!("failed to parse response: {e}")))?;

        let text = normalize_response(&body)
            .ok_or_else(|| ParleyError::Provider("response contained no text".to_string()))?;
        debug!(
            model = body.get("model").and_then(serde_json::Value::as_str),
            chars = text.len(),
            "Completion received"
        );
        Ok(text)
    }
}

impl std::fmt::Debug for OpenAiCompatibleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleClient")
            .field("endpoint", &self.endpoint)
            .field("authenticated", &self.api_key.is_some())
            .field("text_model", &self.text_model)
            .field("vision_model", &self.vision_model)
            .finish()
    }
}

#[async_trait]
impl GenerationService for OpenAiCompatibleClient {
    async fn generate(
        &self,
        messages: &[PromptMessage],
        params: GenerationParams,
    ) -> Result<String, ParleyError> {
        let body = ChatCompletionRequest {
            model: &self.text_model,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: WireContent::Text(m.content.clone()),
                })
                .collect(),
            max_tokens: Some(params.max_tokens),
            temperature: Some(params.temperature),
        };
        self.complete(&body).await
    }
}

#[async_trait]
impl VisionService for OpenAiCompatibleClient {
    async fn describe(&self, image: &[u8], prompt: &str) -> Result<String, ParleyError> {
        if image.is_empty() {
            return Err(ParleyError::Provider("image is empty".to_string()));
        }
        let body = ChatCompletionRequest {
            model: &self.vision_model,
            messages: vec![vision_message(image, prompt)],
            max_tokens: Some(VISION_MAX_TOKENS),
            temperature: None,
        };
        self.complete(&body).await
    }
}

// =============================================================================
// Wire format
// =============================================================================

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: WireContent,
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

fn vision_message(image: &[u8], prompt: &str) -> WireMessage {
    let data_url = format!(
        "data:{};base64,{}",
        sniff_image_mime(image),
        BASE64_STANDARD.encode(image)
    );
    WireMessage {
        role: "user",
        content: WireContent::Parts(vec![
            ContentPart::Text {
                text: prompt.to_string(),
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl { url: data_url },
            },
        ]),
    }
}

/// MIME type from an image's magic bytes; JPEG when unrecognised.
pub fn sniff_image_mime(bytes: &[u8]) -> &'static str {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        [b'B', b'M', ..] => "image/bmp",
        _ => "image/jpeg",
    }
}

/// Pull the reply text out of a completion response.
///
/// Checked in order: `choices[0].message.content` (a string or a list of
/// text parts), `response`, `result.response`, `output_text`,
/// `description`, `text`. Blank text counts as missing.
pub fn normalize_response(body: &Value) -> Option<String> {
    let from_choices = body
        .pointer("/choices/0/message/content")
        .and_then(content_text);

    from_choices
        .or_else(|| body.get("response").and_then(content_text))
        .or_else(|| body.pointer("/result/response").and_then(content_text))
        .or_else(|| body.get("output_text").and_then(content_text))
        .or_else(|| body.get("description").and_then(content_text))
        .or_else(|| body.get("text").and_then(content_text))
}

fn content_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(s) => Some(s.as_str()),
                Value::Object(_) => part.get("text").and_then(Value::as_str),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => return None,
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn map_http_error(status: StatusCode, body: &str) -> ParleyError {
    let message = serde_json::from_str::<ErrorResponse>(body)
        .map(|wrapper| wrapper.error.message)
        .unwrap_or_else(|_| body.chars().take(500).collect());
    ParleyError::Provider(format!("HTTP {}: {}", status.as_u16(), message))
}
