use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ChorusError;

/// Terminal status of one model's query.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Error,
    Timeout,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}

/// A source referenced by a model response.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Citation {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Deduplicate citations by URL. The first-seen entry (and its title) wins and
/// first-seen order is kept.
pub fn dedupe_citations(citations: Vec<Citation>) -> Vec<Citation> {
    let mut seen = HashSet::new();
    citations
        .into_iter()
        .filter(|c| !c.url.is_empty() && seen.insert(c.url.clone()))
        .collect()
}

/// Result of querying one model. Created once per model per query.
///
/// Built only through [`QueryOutcome::success`], [`QueryOutcome::error`],
/// [`QueryOutcome::timeout`] or [`QueryOutcome::from_error`], which keep the
/// status/response/error fields consistent.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct QueryOutcome {
    pub model: String,
    pub provider: String,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
}

impl QueryOutcome {
    pub fn success(model: &str, provider: &str, response: String, latency_ms: u64) -> Self {
        Self {
            model: model.to_string(),
            provider: provider.to_string(),
            status: OutcomeStatus::Success,
            response: Some(response),
            error: None,
            reason: None,
            latency_ms: Some(latency_ms),
            tokens: None,
            request_id: None,
            citations: Vec::new(),
        }
    }

    pub fn error(model: &str, provider: &str, message: String, reason: &str) -> Self {
        Self {
            model: model.to_string(),
            provider: provider.to_string(),
            status: OutcomeStatus::Error,
            response: None,
            error: Some(message),
            reason: Some(reason.to_string()),
            latency_ms: None,
            tokens: None,
            request_id: None,
            citations: Vec::new(),
        }
    }

    pub fn timeout(model: &str, provider: &str, latency_ms: u64) -> Self {
        Self {
            model: model.to_string(),
            provider: provider.to_string(),
            status: OutcomeStatus::Timeout,
            response: None,
            error: Some(ChorusError::Timeout(latency_ms).user_message()),
            reason: Some("timeout".to_string()),
            latency_ms: Some(latency_ms),
            tokens: None,
            request_id: None,
            citations: Vec::new(),
        }
    }

    /// Normalize a capability error. Timeouts map to `Timeout`, everything else to `Error`.
    pub fn from_error(model: &str, provider: &str, err: &ChorusError, latency_ms: u64) -> Self {
        if let ChorusError::Timeout(_) = err {
            return Self::timeout(model, provider, latency_ms);
        }
        Self::error(model, provider, err.user_message(), err.reason()).with_latency(latency_ms)
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_tokens(mut self, tokens: Option<u64>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_citations(mut self, citations: Vec<Citation>) -> Self {
        self.citations = dedupe_citations(citations);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}
