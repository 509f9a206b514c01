use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::dispatch::registry::{ApiFormat, JobApi, ModelDescriptor};
use crate::error::ChorusError;
use crate::synthesis::SynthesisDepth;

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const XAI_CHAT_URL: &str = "https://api.x.ai/v1/chat/completions";
const GEMINI_CHAT_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions";
const OPENROUTER_CHAT_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Config file looked up in the working directory when `CHORUS_CONFIG` is unset.
pub const DEFAULT_CONFIG_FILE: &str = "chorus.toml";

/// Run-wide defaults. Every field can be overridden from the `[defaults]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Timeout for quick models when the caller gives none. Unset keeps each model's own.
    pub timeout_secs: Option<u64>,
    pub output: PathBuf,
    pub results_dir: PathBuf,
    pub synthesis_model: String,
    pub synthesis_depth: SynthesisDepth,
    pub render_interval_ms: u64,
    /// Prompts longer than this many characters go to a secondary file.
    pub long_prompt_threshold: usize,
    /// Preset used when neither models nor a preset are given.
    pub preset: String,
}

impl Defaults {
    /// Quick-model timeout for a run: the caller's value, else `timeout_secs`.
    pub fn quick_timeout(&self, requested_secs: Option<u64>) -> Option<Duration> {
        requested_secs.or(self.timeout_secs).map(Duration::from_secs)
    }
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            output: PathBuf::from("chorus-output.md"),
            results_dir: PathBuf::from(".chorus/runs"),
            synthesis_model: "gpt-4.1".to_string(),
            synthesis_depth: SynthesisDepth::Executive,
            render_interval_ms: 500,
            long_prompt_threshold: 1000,
            preset: "default".to_string(),
        }
    }
}

/// `[models.<id>]` table: overrides for a built-in model, or a custom
/// OpenAI-compatible model when `base_url` is set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModelOverride {
    pub timeout_secs: Option<u64>,
    pub slow: Option<bool>,
    pub vision: Option<bool>,
    pub poll_interval_secs: Option<u64>,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model_id: Option<String>,
    pub provider: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    defaults: Defaults,
    presets: HashMap<String, Vec<String>>,
    models: HashMap<String, ModelOverride>,
}

#[derive(Debug, Default)]
pub struct Config {
    pub models: HashMap<String, ModelDescriptor>,
    pub presets: HashMap<String, Vec<String>>,
    pub defaults: Defaults,
}

impl Config {
    /// Built-in models for every provider with a key in the environment, then the
    /// optional TOML file on top.
    pub fn load() -> Result<Self, ChorusError> {
        let mut config = Self::from_env();

        let path = env::var("CHORUS_CONFIG")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                let local = PathBuf::from(DEFAULT_CONFIG_FILE);
                local.exists().then_some(local)
            });

        if let Some(path) = path {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| ChorusError::Config(format!("{}: {e}", path.display())))?;
            config.apply_toml(&raw, &path)?;
            tracing::info!(path = %path.display(), "loaded config file");
        }

        if config.models.is_empty() {
            tracing::error!("no models configured, set at least one provider API key");
        }

        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut models = HashMap::new();
        let mut add = |m: ModelDescriptor| {
            models.insert(m.id.clone(), m);
        };

        if let Ok(key) = env::var("OPENAI_API_KEY") {
            add(ModelDescriptor::http("gpt-4.1", "openai", OPENAI_CHAT_URL, &key, ApiFormat::OpenAi)
                .with_vision(true)
                .with_timeout_secs(120));
            add(ModelDescriptor::http("o3", "openai", OPENAI_CHAT_URL, &key, ApiFormat::OpenAi)
                .with_vision(true)
                .with_slow(true)
                .with_timeout_secs(600));
            add(ModelDescriptor::background(
                "o3-deep-research",
                "openai",
                JobApi::OpenAiResponses,
                &key,
            )
            .with_timeout_secs(60 * 60));
            add(ModelDescriptor::background(
                "o4-mini-deep-research",
                "openai",
                JobApi::OpenAiResponses,
                &key,
            )
            .with_timeout_secs(30 * 60));
        } else {
            tracing::warn!("OPENAI_API_KEY not set, openai models unavailable");
        }

        if let Ok(key) = env::var("ANTHROPIC_API_KEY") {
            add(ModelDescriptor::http(
                "claude-sonnet-4",
                "anthropic",
                ANTHROPIC_MESSAGES_URL,
                &key,
                ApiFormat::Anthropic,
            )
            .with_model_id("claude-sonnet-4-20250514")
            .with_vision(true)
            .with_timeout_secs(180));
            add(ModelDescriptor::http(
                "claude-opus-4",
                "anthropic",
                ANTHROPIC_MESSAGES_URL,
                &key,
                ApiFormat::Anthropic,
            )
            .with_model_id("claude-opus-4-20250514")
            .with_vision(true)
            .with_slow(true)
            .with_timeout_secs(600));
        } else {
            tracing::warn!("ANTHROPIC_API_KEY not set, claude models unavailable");
        }

        if let Ok(key) = env::var("XAI_API_KEY") {
            add(ModelDescriptor::http("grok-3-mini", "xai", XAI_CHAT_URL, &key, ApiFormat::OpenAi)
                .with_timeout_secs(120));
            add(ModelDescriptor::http("grok-4", "xai", XAI_CHAT_URL, &key, ApiFormat::OpenAi)
                .with_model_id("grok-4-0709")
                .with_vision(true)
                .with_slow(true)
                .with_timeout_secs(600));
        } else {
            tracing::warn!("XAI_API_KEY not set, grok models unavailable");
        }

        if let Ok(key) = env::var("GOOGLE_API_KEY") {
            add(ModelDescriptor::http(
                "gemini-2.5-flash",
                "google",
                GEMINI_CHAT_URL,
                &key,
                ApiFormat::OpenAi,
            )
            .with_vision(true)
            .with_timeout_secs(120));
            add(ModelDescriptor::http(
                "gemini-2.5-pro",
                "google",
                GEMINI_CHAT_URL,
                &key,
                ApiFormat::OpenAi,
            )
            .with_vision(true)
            .with_slow(true)
            .with_timeout_secs(600));
            add(ModelDescriptor::background(
                "deep-research-pro",
                "gemini-api",
                JobApi::GeminiInteractions,
                &key,
            )
            .with_model_id("deep-research-pro-preview-12-2025")
            .with_timeout_secs(60 * 60)
            .with_poll_interval_secs(30));
        } else {
            tracing::warn!("GOOGLE_API_KEY not set, gemini models unavailable");
        }

        if let Ok(key) = env::var("OPENROUTER_API_KEY") {
            add(ModelDescriptor::http(
                "kimi-k2",
                "openrouter",
                OPENROUTER_CHAT_URL,
                &key,
                ApiFormat::OpenAi,
            )
            .with_model_id("moonshotai/kimi-k2")
            .with_timeout_secs(180));
            add(ModelDescriptor::http(
                "deepseek-r1",
                "openrouter",
                OPENROUTER_CHAT_URL,
                &key,
                ApiFormat::OpenAi,
            )
            .with_model_id("deepseek/deepseek-r1")
            .with_slow(true)
            .with_timeout_secs(600));
        } else {
            tracing::warn!("OPENROUTER_API_KEY not set, openrouter models unavailable");
        }

        let presets = builtin_presets(&models);

        Config {
            models,
            presets,
            defaults: Defaults::default(),
        }
    }

    /// Merge a TOML config document into this config.
    pub fn apply_toml(&mut self, raw: &str, path: &Path) -> Result<(), ChorusError> {
        let file: ConfigFile = toml::from_str(raw)
            .map_err(|e| ChorusError::Config(format!("{}: {e}", path.display())))?;

        self.defaults = file.defaults;
        self.presets.extend(file.presets);

        for (id, over) in file.models {
            if let Some(ref base_url) = over.base_url {
                let key_var = over.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY");
                let Ok(key) = env::var(key_var) else {
                    tracing::warn!(model = id, key_var, "API key variable not set, skipping custom model");
                    continue;
                };
                let provider = over.provider.as_deref().unwrap_or("custom");
                let mut descriptor =
                    ModelDescriptor::http(&id, provider, base_url, &key, ApiFormat::OpenAi);
                if let Some(ref model_id) = over.model_id {
                    descriptor = descriptor.with_model_id(model_id);
                }
                self.models.insert(id.clone(), apply_override(descriptor, &over));
                continue;
            }

            match self.models.remove(&id) {
                Some(existing) => {
                    self.models.insert(id, apply_override(existing, &over));
                }
                None => {
                    tracing::warn!(model = id, "override for a model that is not configured");
                }
            }
        }

        Ok(())
    }
}

fn apply_override(mut descriptor: ModelDescriptor, over: &ModelOverride) -> ModelDescriptor {
    if let Some(secs) = over.timeout_secs {
        descriptor.timeout_secs = secs;
    }
    if let Some(slow) = over.slow {
        descriptor.slow = slow;
    }
    if let Some(vision) = over.vision {
        descriptor.vision = vision;
    }
    if let Some(secs) = over.poll_interval_secs
        && descriptor.is_background()
    {
        descriptor.poll_interval_secs = Some(secs);
    }
    descriptor
}

/// Presets over whatever models are configured. Missing members are left in place
/// so the run reports them as unresolved.
fn builtin_presets(models: &HashMap<String, ModelDescriptor>) -> HashMap<String, Vec<String>> {
    let names = |ids: &[&str]| ids.iter().map(|s| s.to_string()).collect::<Vec<_>>();

    let mut all: Vec<String> = models
        .values()
        .filter(|m| !m.is_background())
        .map(|m| m.id.clone())
        .collect();
    all.sort();

    let mut presets = HashMap::new();
    presets.insert(
        "default".to_string(),
        names(&["gpt-4.1", "claude-sonnet-4", "gemini-2.5-flash", "grok-3-mini"]),
    );
    presets.insert(
        "fast".to_string(),
        names(&["gpt-4.1", "gemini-2.5-flash", "grok-3-mini"]),
    );
    presets.insert(
        "deep".to_string(),
        names(&["o3", "claude-opus-4", "gemini-2.5-pro", "o3-deep-research"]),
    );
    presets.insert("all".to_string(), all);
    presets
}
