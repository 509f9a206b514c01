use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::dispatch::registry::{ApiFormat, BackendConfig, ModelDescriptor};
use crate::dispatch::{GenerateRequest, Generation, TextGenerator};
use crate::error::ChorusError;

const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// Anthropic requires max_tokens on every request.
const ANTHROPIC_DEFAULT_MAX_TOKENS: u64 = 8192;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct HttpDispatch {
    client: Client,
}

#[derive(Deserialize)]
struct ChatCompletion {
    id: Option<String>,
    choices: Vec<Choice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    total_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct AnthropicMessage {
    id: Option<String>,
    content: Vec<AnthropicBlock>,
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

impl HttpDispatch {
    pub fn new() -> Result<Self, ChorusError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()?;

        Ok(Self { client })
    }

    /// Build the OpenAI chat completions body. Images become `image_url` content parts.
    pub fn openai_body(model: &str, req: &GenerateRequest) -> Value {
        let mut messages = Vec::new();
        if let Some(ref sys) = req.system_prompt {
            messages.push(json!({"role": "system", "content": sys}));
        }

        let content = match req.image {
            Some(ref image) => json!([
                {"type": "text", "text": req.prompt},
                {"type": "image_url", "image_url": {"url": image.data_url()}},
            ]),
            None => json!(req.prompt),
        };
        messages.push(json!({"role": "user", "content": content}));

        let mut body = json!({
            "model": model,
            "messages": messages,
        });
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if req.web_search {
            body["web_search_options"] = json!({});
        }
        body
    }

    /// Build the Anthropic Messages body. Images become base64 `image` blocks placed
    /// before the text block.
    pub fn anthropic_body(model: &str, req: &GenerateRequest) -> Value {
        let mut content = Vec::new();
        if let Some(ref image) = req.image {
            content.push(json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": image.media_type,
                    "data": image.base64,
                }
            }));
        }
        content.push(json!({"type": "text", "text": req.prompt}));

        let mut body = json!({
            "model": model,
            "max_tokens": req.max_tokens.unwrap_or(ANTHROPIC_DEFAULT_MAX_TOKENS),
            "messages": [{"role": "user", "content": content}],
        });
        if let Some(ref sys) = req.system_prompt {
            body["system"] = json!(sys);
        }
        if req.web_search {
            body["tools"] = json!([{
                "type": "web_search_20250305",
                "name": "web_search",
                "max_uses": 5,
            }]);
        }
        body
    }

    fn parse_openai(provider: &str, bytes: &[u8]) -> Result<Generation, ChorusError> {
        let completion: ChatCompletion = serde_json::from_slice(bytes)
            .map_err(|e| ChorusError::SchemaParse(format!("failed to parse response: {e}")))?;

        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ChorusError::Upstream {
                provider: provider.to_string(),
                message: "empty choices or null content".to_string(),
                status: None,
            })?;

        Ok(Generation {
            text,
            tokens: completion.usage.and_then(|u| u.total_tokens),
            request_id: completion.id,
        })
    }

    fn parse_anthropic(provider: &str, bytes: &[u8]) -> Result<Generation, ChorusError> {
        let message: AnthropicMessage = serde_json::from_slice(bytes)
            .map_err(|e| ChorusError::SchemaParse(format!("failed to parse response: {e}")))?;

        // Web search interleaves tool blocks with text blocks; keep the text only.
        let text: String = message
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");

        if text.is_empty() {
            return Err(ChorusError::Upstream {
                provider: provider.to_string(),
                message: "no text content in response".to_string(),
                status: None,
            });
        }

        let tokens = message.usage.and_then(|u| match (u.input_tokens, u.output_tokens) {
            (None, None) => None,
            (i, o) => Some(i.unwrap_or(0) + o.unwrap_or(0)),
        });

        Ok(Generation {
            text,
            tokens,
            request_id: message.id,
        })
    }
}

#[async_trait]
impl TextGenerator for HttpDispatch {
    async fn generate(
        &self,
        model: &ModelDescriptor,
        req: &GenerateRequest,
    ) -> Result<Generation, ChorusError> {
        let BackendConfig::Http {
            base_url,
            api_key,
            api_format,
        } = &model.backend
        else {
            return Err(ChorusError::Other(format!(
                "{} is a background model and cannot be invoked directly",
                model.id
            )));
        };
        let provider = model.provider.as_str();

        let request = match api_format {
            ApiFormat::OpenAi => self
                .client
                .post(base_url)
                .header("Authorization", format!("Bearer {api_key}"))
                .json(&Self::openai_body(&model.model_id, req)),
            ApiFormat::Anthropic => self
                .client
                .post(base_url)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&Self::anthropic_body(&model.model_id, req)),
        };

        let response = request.send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ChorusError::RateLimited {
                provider: provider.to_string(),
            });
        }

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ChorusError::AuthFailed {
                provider: provider.to_string(),
                message: format!("{status}"),
            });
        }

        // Catch-all for any non-success status. Cap error body reads to
        // MAX_RESPONSE_BYTES to prevent memory exhaustion.
        if !status.is_success() {
            let error_bytes = response.bytes().await.unwrap_or_default();
            let truncated = &error_bytes[..error_bytes.len().min(MAX_RESPONSE_BYTES)];
            let text = String::from_utf8_lossy(truncated);
            tracing::debug!(provider, status = status.as_u16(), body = %text, "upstream error body");
            return Err(ChorusError::Upstream {
                provider: provider.to_string(),
                message: format!("{status}: {text}"),
                status: Some(status.as_u16()),
            });
        }

        let bytes = response.bytes().await.map_err(|e| ChorusError::Upstream {
            provider: provider.to_string(),
            message: format!("failed to read response body: {e}"),
            status: None,
        })?;

        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(ChorusError::Upstream {
                provider: provider.to_string(),
                message: format!(
                    "response too large: {} bytes (max {})",
                    bytes.len(),
                    MAX_RESPONSE_BYTES
                ),
                status: None,
            });
        }

        match api_format {
            ApiFormat::OpenAi => Self::parse_openai(provider, &bytes),
            ApiFormat::Anthropic => Self::parse_anthropic(provider, &bytes),
        }
    }
}
