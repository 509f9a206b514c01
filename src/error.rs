use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChorusError {
    #[error("model not found: {model}")]
    ModelNotFound {
        model: String,
        suggestions: Vec<String>,
    },

    #[error("none of the requested models could be resolved: {}", requested.join(", "))]
    NoModels { requested: Vec<String> },

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("upstream error from {provider}: {message}")]
    Upstream {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    #[error("auth failed for {provider}: {message}")]
    AuthFailed { provider: String, message: String },

    #[error("schema parse error: {0}")]
    SchemaParse(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("image error: {0}")]
    Image(String),

    #[error("context error: {0}")]
    Context(String),

    #[error("async job failed for {provider}: {message}")]
    AsyncJobFailed { provider: String, message: String },

    #[error("poll failed for {provider} job {job_id}: {message}")]
    PollFailed {
        provider: String,
        job_id: String,
        message: String,
    },

    #[error("failed to write live document {path}: {source}")]
    Document {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to persist results to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl ChorusError {
    /// Extract provider name from structured error variants.
    /// Returns None for variants that don't carry provider context.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::RateLimited { provider } => Some(provider),
            Self::Upstream { provider, .. } => Some(provider),
            Self::AuthFailed { provider, .. } => Some(provider),
            Self::AsyncJobFailed { provider, .. } => Some(provider),
            Self::PollFailed { provider, .. } => Some(provider),
            _ => None,
        }
    }

    /// Machine-readable reason code recorded on failed outcomes.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::RateLimited { .. } => "rate_limited",
            Self::AuthFailed { .. } => "auth_failed",
            Self::ModelNotFound { .. } => "model_not_found",
            Self::SchemaParse(_) => "parse_error",
            Self::AsyncJobFailed { .. } => "job_failed",
            Self::PollFailed { .. } => "poll_failed",
            Self::Upstream { .. } | Self::Request(_) => "upstream",
            _ => "error",
        }
    }

    /// True for the errors that only the process boundary should see: nothing
    /// observable was produced, or the run was misconfigured.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NoModels { .. }
                | Self::Document { .. }
                | Self::Persist { .. }
                | Self::Config(_)
                | Self::Image(_)
        )
    }

    /// Produce a sanitized error message safe for the live document and result files.
    /// Does not leak internal URLs, connection details, or upstream error bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::ModelNotFound { model, suggestions } => {
                if suggestions.is_empty() {
                    format!("model not found: {model}")
                } else {
                    format!(
                        "model not found: {model}. Did you mean: {}?",
                        suggestions.join(", ")
                    )
                }
            }
            Self::Timeout(ms) => format!("request timed out after {ms}ms"),
            Self::RateLimited { provider } => {
                format!("rate limited by {provider}, try again shortly")
            }
            Self::Upstream {
                provider,
                status: Some(status),
                ..
            } => format!("upstream error from {provider} (HTTP {status})"),
            Self::Upstream {
                provider, message, ..
            } => format!("upstream error from {provider}: {message}"),
            Self::AuthFailed { provider, message } => {
                format!("authentication failed for {provider}: {message}")
            }
            Self::SchemaParse(_) => "failed to parse provider response".to_string(),
            Self::Request(e) if e.is_connect() => "could not connect to provider".to_string(),
            Self::Request(_) => "request to provider failed".to_string(),
            Self::AsyncJobFailed { provider, message } => {
                format!("deep research job failed for {provider}: {message}")
            }
            Self::PollFailed { provider, .. } => {
                format!("failed to check research status for {provider}")
            }
            other => other.to_string(),
        }
    }
}
