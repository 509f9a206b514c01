use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Serialize;

use crate::config::Config;
use crate::error::ChorusError;

/// Default poll interval for background jobs that don't configure one.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

/// Discriminant for background-job (async-poll) APIs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobApi {
    OpenAiResponses,
    GeminiInteractions,
}

/// API format for HTTP backends.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ApiFormat {
    /// OpenAI-compatible chat completions (default for most providers).
    #[default]
    OpenAi,
    /// Anthropic Messages API (different headers and content blocks).
    Anthropic,
}

/// Backend-specific configuration. Prevents invalid states
/// (e.g., a background entry with a chat completions URL).
#[derive(Clone)]
pub enum BackendConfig {
    Http {
        base_url: String,
        api_key: String,
        api_format: ApiFormat,
    },
    Background {
        api: JobApi,
        api_key: String,
    },
}

/// Scheduling and display group of a requested model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Quick,
    Slow,
    Background,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Slow => "slow",
            Self::Background => "background",
        }
    }

    pub fn is_sync(&self) -> bool {
        !matches!(self, Self::Background)
    }
}

/// Capability metadata for one model. Immutable once the registry is built.
#[derive(Clone)]
pub struct ModelDescriptor {
    /// Registry key used on the command line and in presets.
    pub id: String,
    /// Model name sent to the provider API.
    pub model_id: String,
    pub provider: String,
    pub backend: BackendConfig,
    pub vision: bool,
    pub slow: bool,
    /// Per-call timeout; for background models the max-wait budget of the job.
    pub timeout_secs: u64,
    /// Background models only.
    pub poll_interval_secs: Option<u64>,
}

impl ModelDescriptor {
    pub fn http(id: &str, provider: &str, base_url: &str, api_key: &str, api_format: ApiFormat) -> Self {
        Self {
            id: id.to_string(),
            model_id: id.to_string(),
            provider: provider.to_string(),
            backend: BackendConfig::Http {
                base_url: base_url.to_string(),
                api_key: api_key.to_string(),
                api_format,
            },
            vision: false,
            slow: false,
            timeout_secs: 120,
            poll_interval_secs: None,
        }
    }

    pub fn background(id: &str, provider: &str, api: JobApi, api_key: &str) -> Self {
        Self {
            id: id.to_string(),
            model_id: id.to_string(),
            provider: provider.to_string(),
            backend: BackendConfig::Background {
                api,
                api_key: api_key.to_string(),
            },
            vision: false,
            slow: true,
            timeout_secs: 30 * 60,
            poll_interval_secs: Some(DEFAULT_POLL_INTERVAL_SECS),
        }
    }

    pub fn with_model_id(mut self, model_id: &str) -> Self {
        self.model_id = model_id.to_string();
        self
    }

    pub fn with_vision(mut self, vision: bool) -> Self {
        self.vision = vision;
        self
    }

    pub fn with_slow(mut self, slow: bool) -> Self {
        self.slow = slow;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_poll_interval_secs(mut self, secs: u64) -> Self {
        self.poll_interval_secs = Some(secs);
        self
    }

    pub fn is_background(&self) -> bool {
        matches!(self.backend, BackendConfig::Background { .. })
    }

    pub fn tier(&self) -> Tier {
        if self.is_background() {
            Tier::Background
        } else if self.slow {
            Tier::Slow
        } else {
            Tier::Quick
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(
            self.poll_interval_secs
                .unwrap_or(DEFAULT_POLL_INTERVAL_SECS)
                .max(1),
        )
    }

    /// Returns the backend type as a string for display purposes.
    pub fn backend_name(&self) -> &'static str {
        match &self.backend {
            BackendConfig::Http {
                api_format: ApiFormat::OpenAi,
                ..
            } => "openai-chat",
            BackendConfig::Http {
                api_format: ApiFormat::Anthropic,
                ..
            } => "anthropic-messages",
            BackendConfig::Background {
                api: JobApi::OpenAiResponses,
                ..
            } => "openai-responses",
            BackendConfig::Background {
                api: JobApi::GeminiInteractions,
                ..
            } => "gemini-interactions",
        }
    }
}

impl std::fmt::Debug for ModelDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("ModelDescriptor");
        s.field("id", &self.id)
            .field("model_id", &self.model_id)
            .field("provider", &self.provider);

        match &self.backend {
            BackendConfig::Http {
                base_url,
                api_format,
                ..
            } => {
                s.field("backend", &"http")
                    .field("base_url", base_url)
                    .field("api_format", api_format)
                    .field("api_key", &"[REDACTED]");
            }
            BackendConfig::Background { api, .. } => {
                s.field("backend", &"background")
                    .field("api", api)
                    .field("api_key", &"[REDACTED]");
            }
        }

        s.field("vision", &self.vision)
            .field("slow", &self.slow)
            .field("timeout_secs", &self.timeout_secs)
            .field("poll_interval_secs", &self.poll_interval_secs);

        s.finish()
    }
}

/// Requested models split into the ones the registry knows and the ones it doesn't.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Known models, deduplicated, in request order.
    pub resolved: Vec<ModelDescriptor>,
    pub unresolved: Vec<String>,
}

/// Immutable model table. Built once per process and shared by `Arc`.
pub struct Registry {
    models: HashMap<String, ModelDescriptor>,
    presets: HashMap<String, Vec<String>>,
}

impl Registry {
    pub fn new(models: impl IntoIterator<Item = ModelDescriptor>) -> Self {
        Self {
            models: models.into_iter().map(|m| (m.id.clone(), m)).collect(),
            presets: HashMap::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            models: config.models.clone(),
            presets: config.presets.clone(),
        }
    }

    pub fn with_presets(mut self, presets: HashMap<String, Vec<String>>) -> Self {
        self.presets = presets;
        self
    }

    pub fn describe(&self, model: &str) -> Option<&ModelDescriptor> {
        self.models.get(model)
    }

    /// Like [`Registry::describe`], with suggestions attached when the id is unknown.
    pub fn lookup(&self, model: &str) -> Result<&ModelDescriptor, ChorusError> {
        self.models.get(model).ok_or_else(|| ChorusError::ModelNotFound {
            model: model.to_string(),
            suggestions: self.suggest_models(model),
        })
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// All descriptors sorted by id.
    pub fn list(&self) -> Vec<&ModelDescriptor> {
        let mut all: Vec<&ModelDescriptor> = self.models.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn preset(&self, name: &str) -> Option<&[String]> {
        self.presets.get(name).map(Vec::as_slice)
    }

    /// Preset names sorted alphabetically with their model lists.
    pub fn presets(&self) -> Vec<(&String, &Vec<String>)> {
        let mut all: Vec<_> = self.presets.iter().collect();
        all.sort_by(|a, b| a.0.cmp(b.0));
        all
    }

    /// Suggest similar model names for a failed lookup (substring match).
    /// Sorted alphabetically, capped at 5 to keep warnings readable.
    pub fn suggest_models(&self, query: &str) -> Vec<String> {
        let q = query.trim().to_lowercase();
        if q.is_empty() {
            return vec![];
        }
        let mut suggestions: Vec<String> = self
            .models
            .keys()
            .filter(|k| {
                let k_lower = k.to_lowercase();
                k_lower.contains(&q) || q.contains(&k_lower)
            })
            .cloned()
            .collect();
        suggestions.sort();
        suggestions.truncate(5);
        suggestions
    }

    /// Resolve requested ids against the registry. Unknown ids are warned about and
    /// reported back, never fatal here.
    pub fn resolve(&self, requested: &[String]) -> Resolution {
        let mut seen = HashSet::new();
        let mut resolution = Resolution::default();

        for model in requested {
            let model = model.trim();
            if model.is_empty() {
                continue;
            }
            if !seen.insert(model.to_string()) {
                tracing::warn!(model, "model requested more than once, querying it once");
                continue;
            }
            match self.lookup(model) {
                Ok(descriptor) => resolution.resolved.push(descriptor.clone()),
                Err(e) => {
                    tracing::warn!(model, "{}, skipping", e.user_message());
                    resolution.unresolved.push(model.to_string());
                }
            }
        }

        resolution
    }
}
