use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::dispatch::registry::{BackendConfig, JobApi, ModelDescriptor};
use crate::dispatch::{JobBackend, JobSnapshot, JobStatus};
use crate::error::ChorusError;
use crate::outcome::Citation;

/// Max response body size for poll responses (4MB, research can be large).
const MAX_POLL_RESPONSE_BYTES: usize = 4 * 1024 * 1024;

/// Single launch/poll HTTP round trips are bounded separately from the job deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Provider-specific request/response handling for background-job APIs.
pub trait AsyncPollApi: Send + Sync {
    /// Build the launch request. Returns (url, headers, body).
    fn build_launch_request(
        &self,
        prompt: &str,
        model: &str,
        api_key: &str,
    ) -> (String, Vec<(String, String)>, Value);

    /// Build the poll request. Returns (url, headers).
    fn build_poll_request(&self, job_id: &str, api_key: &str) -> (String, Vec<(String, String)>);

    /// Parse the launch response to extract job ID.
    fn parse_launch_response(&self, body: &[u8]) -> Result<String, ChorusError>;

    /// Parse the poll response into a status snapshot.
    fn parse_poll_response(&self, body: &[u8]) -> Result<JobSnapshot, ChorusError>;
}

// ---------------------------------------------------------------------------
// OpenAI Responses API (o3-deep-research, o4-mini-deep-research)
// ---------------------------------------------------------------------------

pub struct OpenAiResponsesApi;

impl OpenAiResponsesApi {
    /// Collect `output_text` content and `url_citation` annotations from message items.
    fn extract_output(v: &Value) -> (String, Vec<Citation>) {
        let mut texts = Vec::new();
        let mut citations = Vec::new();

        for item in v["output"].as_array().into_iter().flatten() {
            if item["type"] != "message" {
                continue;
            }
            for part in item["content"].as_array().into_iter().flatten() {
                if part["type"] != "output_text" {
                    continue;
                }
                if let Some(text) = part["text"].as_str() {
                    texts.push(text.to_string());
                }
                for ann in part["annotations"].as_array().into_iter().flatten() {
                    if ann["type"] == "url_citation"
                        && let Some(url) = ann["url"].as_str()
                    {
                        citations.push(Citation {
                            url: url.to_string(),
                            title: ann["title"].as_str().map(str::to_string),
                        });
                    }
                }
            }
        }

        // The convenience field wins when present; message parts are the fallback.
        let text = match v["output_text"].as_str() {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => texts.join("\n\n"),
        };
        (text, citations)
    }
}

impl AsyncPollApi for OpenAiResponsesApi {
    fn build_launch_request(
        &self,
        prompt: &str,
        model: &str,
        api_key: &str,
    ) -> (String, Vec<(String, String)>, Value) {
        let url = "https://api.openai.com/v1/responses".to_string();
        let headers = vec![
            ("Authorization".to_string(), format!("Bearer {api_key}")),
            ("Content-Type".to_string(), "application/json".to_string()),
        ];

        let body = serde_json::json!({
            "model": model,
            "input": [{"role": "user", "content": prompt}],
            "tools": [{"type": "web_search_preview"}],
            "background": true,
            "store": true,
        });

        (url, headers, body)
    }

    fn build_poll_request(&self, job_id: &str, api_key: &str) -> (String, Vec<(String, String)>) {
        let url = format!("https://api.openai.com/v1/responses/{job_id}");
        let headers = vec![("Authorization".to_string(), format!("Bearer {api_key}"))];
        (url, headers)
    }

    fn parse_launch_response(&self, body: &[u8]) -> Result<String, ChorusError> {
        let v: Value = serde_json::from_slice(body)
            .map_err(|e| ChorusError::SchemaParse(format!("OpenAI launch response: {e}")))?;
        v["id"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ChorusError::SchemaParse("OpenAI launch response missing 'id'".into()))
    }

    fn parse_poll_response(&self, body: &[u8]) -> Result<JobSnapshot, ChorusError> {
        let v: Value = serde_json::from_slice(body)
            .map_err(|e| ChorusError::SchemaParse(format!("OpenAI poll response: {e}")))?;

        match v["status"].as_str() {
            Some("queued") => Ok(JobSnapshot::pending(JobStatus::Queued)),
            Some("in_progress") => Ok(JobSnapshot::pending(JobStatus::InProgress)),
            Some("completed") => {
                let (text, citations) = Self::extract_output(&v);
                Ok(JobSnapshot {
                    status: JobStatus::Completed,
                    output: Some(text),
                    citations,
                    error: None,
                })
            }
            Some(status @ ("failed" | "incomplete")) => {
                let reason = v["error"]["message"]
                    .as_str()
                    .or_else(|| v["incomplete_details"]["reason"].as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("job {status}"));
                Ok(JobSnapshot {
                    error: Some(reason),
                    ..JobSnapshot::pending(JobStatus::Failed)
                })
            }
            Some("cancelled") => Ok(JobSnapshot {
                error: Some("job cancelled".to_string()),
                ..JobSnapshot::pending(JobStatus::Cancelled)
            }),
            Some(other) => Ok(JobSnapshot {
                error: Some(format!("unknown status: {other}")),
                ..JobSnapshot::pending(JobStatus::Failed)
            }),
            None => Err(ChorusError::SchemaParse(
                "OpenAI poll response missing 'status'".into(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Gemini Interactions API (deep-research-pro-preview-12-2025)
// ---------------------------------------------------------------------------

pub struct GeminiInteractionsApi;

impl GeminiInteractionsApi {
    fn extract_citations(v: &Value) -> Vec<Citation> {
        let mut citations = Vec::new();
        for output in v["outputs"].as_array().into_iter().flatten() {
            for ann in output["annotations"].as_array().into_iter().flatten() {
                let url = ann["url"].as_str().or_else(|| ann["source"].as_str());
                if let Some(url) = url {
                    citations.push(Citation {
                        url: url.to_string(),
                        title: ann["title"].as_str().map(str::to_string),
                    });
                }
            }
        }
        citations
    }
}

impl AsyncPollApi for GeminiInteractionsApi {
    fn build_launch_request(
        &self,
        prompt: &str,
        model: &str,
        api_key: &str,
    ) -> (String, Vec<(String, String)>, Value) {
        let url = "https://generativelanguage.googleapis.com/v1beta/interactions".to_string();
        let headers = vec![
            ("x-goog-api-key".to_string(), api_key.to_string()),
            ("Content-Type".to_string(), "application/json".to_string()),
        ];

        let body = serde_json::json!({
            "agent": model,
            "input": prompt,
            "background": true,
        });

        (url, headers, body)
    }

    fn build_poll_request(&self, job_id: &str, api_key: &str) -> (String, Vec<(String, String)>) {
        let url = format!("https://generativelanguage.googleapis.com/v1beta/interactions/{job_id}");
        let headers = vec![("x-goog-api-key".to_string(), api_key.to_string())];
        (url, headers)
    }

    fn parse_launch_response(&self, body: &[u8]) -> Result<String, ChorusError> {
        let v: Value = serde_json::from_slice(body)
            .map_err(|e| ChorusError::SchemaParse(format!("Gemini launch response: {e}")))?;
        // Gemini returns id like "interactions/abc123", keep the full value
        v["id"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ChorusError::SchemaParse("Gemini launch response missing 'id'".into()))
    }

    fn parse_poll_response(&self, body: &[u8]) -> Result<JobSnapshot, ChorusError> {
        let v: Value = serde_json::from_slice(body)
            .map_err(|e| ChorusError::SchemaParse(format!("Gemini poll response: {e}")))?;

        match v["status"].as_str() {
            Some("queued" | "pending") => Ok(JobSnapshot::pending(JobStatus::Queued)),
            Some("in_progress") => Ok(JobSnapshot::pending(JobStatus::InProgress)),
            Some("completed") => {
                // Result is in outputs array, last item's text field
                let text = v["outputs"]
                    .as_array()
                    .and_then(|arr| arr.last())
                    .and_then(|item| item["text"].as_str())
                    .unwrap_or("")
                    .to_string();
                Ok(JobSnapshot {
                    status: JobStatus::Completed,
                    output: Some(text),
                    citations: Self::extract_citations(&v),
                    error: None,
                })
            }
            Some(status @ ("failed" | "cancelled")) => {
                let msg = v["error"]
                    .as_str()
                    .or_else(|| v["error"]["message"].as_str())
                    .unwrap_or(status)
                    .to_string();
                let job_status = if status == "failed" {
                    JobStatus::Failed
                } else {
                    JobStatus::Cancelled
                };
                Ok(JobSnapshot {
                    error: Some(msg),
                    ..JobSnapshot::pending(job_status)
                })
            }
            Some(other) => Ok(JobSnapshot {
                error: Some(format!("unknown status: {other}")),
                ..JobSnapshot::pending(JobStatus::Failed)
            }),
            None => Err(ChorusError::SchemaParse(
                "Gemini poll response missing 'status'".into(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP job backend
// ---------------------------------------------------------------------------

pub struct HttpJobBackend {
    client: Client,
}

impl HttpJobBackend {
    pub fn new() -> Result<Self, ChorusError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    pub fn api_for(api: &JobApi) -> Box<dyn AsyncPollApi> {
        match api {
            JobApi::OpenAiResponses => Box::new(OpenAiResponsesApi),
            JobApi::GeminiInteractions => Box::new(GeminiInteractionsApi),
        }
    }

    fn background_config(model: &ModelDescriptor) -> Result<(&JobApi, &str), ChorusError> {
        match &model.backend {
            BackendConfig::Background { api, api_key } => Ok((api, api_key)),
            BackendConfig::Http { .. } => Err(ChorusError::Other(format!(
                "{} is not a background model",
                model.id
            ))),
        }
    }

    fn check_status(
        provider: &str,
        status: reqwest::StatusCode,
        what: &str,
    ) -> Result<(), ChorusError> {
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ChorusError::AuthFailed {
                provider: provider.to_string(),
                message: format!("{what} HTTP {status}"),
            });
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ChorusError::RateLimited {
                provider: provider.to_string(),
            });
        }
        if !status.is_success() {
            return Err(ChorusError::Upstream {
                provider: provider.to_string(),
                message: format!("{what} failed with HTTP {status}"),
                status: Some(status.as_u16()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl JobBackend for HttpJobBackend {
    async fn submit(&self, model: &ModelDescriptor, prompt: &str) -> Result<String, ChorusError> {
        let (api, api_key) = Self::background_config(model)?;
        let api = Self::api_for(api);

        let (url, headers, body) = api.build_launch_request(prompt, &model.model_id, api_key);
        let mut req = self.client.post(&url);
        for (k, v) in &headers {
            req = req.header(k, v);
        }

        let resp = req.json(&body).send().await?;
        Self::check_status(&model.provider, resp.status(), "launch")?;

        let bytes = resp.bytes().await?;
        let job_id = api.parse_launch_response(&bytes)?;

        tracing::info!(
            provider = model.provider,
            model = model.id,
            job_id = job_id,
            "background job launched"
        );
        Ok(job_id)
    }

    async fn poll(&self, model: &ModelDescriptor, job_id: &str) -> Result<JobSnapshot, ChorusError> {
        let (api, api_key) = Self::background_config(model)?;
        let api = Self::api_for(api);

        let (url, headers) = api.build_poll_request(job_id, api_key);
        let mut req = self.client.get(&url);
        for (k, v) in &headers {
            req = req.header(k, v);
        }

        let resp = req.send().await.map_err(|e| ChorusError::PollFailed {
            provider: model.provider.clone(),
            job_id: job_id.to_string(),
            message: e.to_string(),
        })?;

        match Self::check_status(&model.provider, resp.status(), "poll") {
            Ok(()) => {}
            Err(e @ (ChorusError::AuthFailed { .. } | ChorusError::RateLimited { .. })) => {
                return Err(e);
            }
            Err(e) => {
                return Err(ChorusError::PollFailed {
                    provider: model.provider.clone(),
                    job_id: job_id.to_string(),
                    message: e.to_string(),
                });
            }
        }

        let body = resp.bytes().await.map_err(|e| ChorusError::PollFailed {
            provider: model.provider.clone(),
            job_id: job_id.to_string(),
            message: format!("failed to read poll body: {e}"),
        })?;

        if body.len() > MAX_POLL_RESPONSE_BYTES {
            return Err(ChorusError::Upstream {
                provider: model.provider.clone(),
                message: format!("poll response too large: {} bytes", body.len()),
                status: None,
            });
        }

        api.parse_poll_response(&body)
    }
}
