//! Single-provider image classification over a forced tool call.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::providers::{Dialect, ProviderConfig};
use crate::models::label::NONE_LABEL;

const TOOL_NAME: &str = "classify_images";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const INSTRUCTIONS: &str = "Classify the following images based on the provided categories. \
Each image is preceded by its index number. Use NONE when no category fits.";

/// Classifies a list of image URLs with one provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClassificationClient: Send + Sync {
    /// Returns one label per image, in input order. Every label is one of
    /// `categories` or `"NONE"`.
    async fn classify(
        &self,
        images: &[String],
        categories: &[String],
        config: &ProviderConfig,
    ) -> Result<Vec<String>, ClassifyError>;
}

pub struct HttpClassificationClient {
    http: Client,
}

impl HttpClassificationClient {
    pub fn new(timeout: Duration) -> Result<Self, ClassifyError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClassifyError::Request {
                provider: "http".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self { http })
    }

    async fn send(
        &self,
        config: &ProviderConfig,
        url: String,
        body: Value,
    ) -> Result<Value, ClassifyError> {
        let provider = config.kind.to_string();
        let request = self.http.post(&url).json(&body);
        let request = match config.kind.dialect() {
            Dialect::OpenAiChat => request.bearer_auth(&config.api_key),
            Dialect::AnthropicMessages => request
                .header("x-api-key", &config.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
        };

        let response = request.send().await.map_err(|e| ClassifyError::Request {
            provider: provider.clone(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifyError::Status {
                provider,
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        response.json().await.map_err(|e| ClassifyError::Request {
            provider,
            message: format!("invalid response body: {e}"),
        })
    }
}

#[async_trait]
impl ClassificationClient for HttpClassificationClient {
    async fn classify(
        &self,
        images: &[String],
        categories: &[String],
        config: &ProviderConfig,
    ) -> Result<Vec<String>, ClassifyError> {
        if images.is_empty() {
            return Ok(Vec::new());
        }

        let labels = match config.kind.dialect() {
            Dialect::OpenAiChat => {
                let url = format!("{}/chat/completions", config.base_url);
                let response = self
                    .send(config, url, openai_request(&config.model, images, categories))
                    .await?;
                match openai_tool_arguments(&response) {
                    Some(arguments) => parse_classifications(&arguments, categories, images.len()),
                    None => {
                        tracing::warn!(provider = %config.kind, "No classify_images tool call in response");
                        vec![NONE_LABEL.to_string(); images.len()]
                    }
                }
            }
            Dialect::AnthropicMessages => {
                let url = format!("{}/messages", config.base_url);
                let response = self
                    .send(config, url, anthropic_request(&config.model, images, categories))
                    .await?;
                match anthropic_tool_input(&response) {
                    Some(input) => parse_classifications(input, categories, images.len()),
                    None => {
                        tracing::warn!(provider = %config.kind, "No classify_images tool_use block in response");
                        vec![NONE_LABEL.to_string(); images.len()]
                    }
                }
            }
        };

        Ok(labels)
    }
}

/// JSON schema of the tool arguments; `category` is constrained to the
/// caller's categories plus `NONE`.
pub fn tool_schema(categories: &[String]) -> Value {
    let mut allowed: Vec<&str> = categories.iter().map(String::as_str).collect();
    if !allowed.contains(&NONE_LABEL) {
        allowed.push(NONE_LABEL);
    }
    json!({
        "type": "object",
        "properties": {
            "classifications": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "index": {"type": "integer", "description": "Index of the image"},
                        "category": {"type": "string", "enum": allowed}
                    },
                    "required": ["index", "category"]
                }
            }
        },
        "required": ["classifications"]
    })
}

fn openai_request(model: &str, images: &[String], categories: &[String]) -> Value {
    let mut content = vec![json!({"type": "text", "text": INSTRUCTIONS})];
    for (index, url) in images.iter().enumerate() {
        content.push(json!({"type": "text", "text": format!("Image {index}:")}));
        content.push(json!({"type": "image_url", "image_url": {"url": url}}));
    }

    json!({
        "model": model,
        "messages": [{"role": "user", "content": content}],
        "tools": [{
            "type": "function",
            "function": {
                "name": TOOL_NAME,
                "description": "Record the category of every image",
                "parameters": tool_schema(categories)
            }
        }],
        "tool_choice": {"type": "function", "function": {"name": TOOL_NAME}},
        "temperature": 0
    })
}

fn anthropic_request(model: &str, images: &[String], categories: &[String]) -> Value {
    let mut content = vec![json!({"type": "text", "text": INSTRUCTIONS})];
    for (index, url) in images.iter().enumerate() {
        content.push(json!({"type": "text", "text": format!("Image {index}:")}));
        content.push(json!({"type": "image", "source": {"type": "url", "url": url}}));
    }

    json!({
        "model": model,
        "max_tokens": 1024,
        "messages": [{"role": "user", "content": content}],
        "tools": [{
            "name": TOOL_NAME,
            "description": "Record the category of every image",
            "input_schema": tool_schema(categories)
        }],
        "tool_choice": {"type": "tool", "name": TOOL_NAME}
    })
}

/// Decoded `arguments` of the first `classify_images` tool call.
fn openai_tool_arguments(response: &Value) -> Option<Value> {
    let call = response
        .pointer("/choices/0/message/tool_calls/0/function")?;
    if call.get("name")?.as_str()? != TOOL_NAME {
        return None;
    }
    match call.get("arguments")? {
        Value::String(raw) => serde_json::from_str(raw).ok(),
        other @ Value::Object(_) => Some(other.clone()),
        _ => None,
    }
}

fn anthropic_tool_input(response: &Value) -> Option<&Value> {
    response
        .get("content")?
        .as_array()?
        .iter()
        .find(|block| {
            block.get("type").and_then(Value::as_str) == Some("tool_use")
                && block.get("name").and_then(Value::as_str) == Some(TOOL_NAME)
        })?
        .get("input")
}

#[derive(Deserialize)]
struct ToolArguments {
    classifications: Vec<Classification>,
}

#[derive(Deserialize)]
struct Classification {
    index: i64,
    category: String,
}

/// Map tool arguments to one label per image.
///
/// Out-of-range indices are ignored, unknown categories become `NONE`, and
/// arguments that do not match the schema yield all `NONE`.
pub fn parse_classifications(
    arguments: &Value,
    categories: &[String],
    image_count: usize,
) -> Vec<String> {
    let mut labels = vec![NONE_LABEL.to_string(); image_count];

    let parsed = match ToolArguments::deserialize(arguments) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!(error = %e, "Malformed classification arguments");
            return labels;
        }
    };

    for Classification { index, category } in parsed.classifications {
        let Ok(slot) = usize::try_from(index) else {
            continue;
        };
        if slot < image_count && categories.contains(&category) {
            labels[slot] = category;
        }
    }
    labels
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassifyError {
    #[error("No AI provider credentials are configured")]
    NoProviders,

    #[error("{provider} request failed: {message}")]
    Request { provider: String, message: String },

    #[error("{provider} returned HTTP {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("All {attempted} providers failed; last error: {last_error}")]
    AllProvidersFailed { attempted: usize, last_error: String },
}
