mod common;

use std::path::Path;
use std::time::Duration;

use chorus::config::Config;
use chorus::dispatch::registry::{BackendConfig, Registry, Tier};
use chorus::error::ChorusError;
use chorus::orchestrator::QueryRequest;
use chorus::synthesis::SynthesisDepth;
use common::{background, quick};

fn base() -> Config {
    let mut config = Config::default();
    for m in [quick("gpt-4.1"), background("o3-deep-research")] {
        config.models.insert(m.id.clone(), m);
    }
    config
}

#[test]
fn defaults_apply_without_a_file() {
    let config = Config::default();
    assert_eq!(config.defaults.timeout_secs, None);
    assert_eq!(config.defaults.preset, "default");
    assert_eq!(config.defaults.synthesis_depth, SynthesisDepth::Executive);
    assert_eq!(config.defaults.long_prompt_threshold, 1000);
}

#[test]
fn toml_overrides_defaults_presets_and_models() {
    let mut config = base();
    let raw = r#"
        [defaults]
        synthesis_depth = "brief"
        render_interval_ms = 250
        output = "answers.md"

        [presets]
        research = ["gpt-4.1", "o3-deep-research"]

        [models."gpt-4.1"]
        timeout_secs = 45
        slow = true
        vision = true

        [models.o3-deep-research]
        poll_interval_secs = 30
    "#;

    config.apply_toml(raw, Path::new("chorus.toml")).unwrap();

    assert_eq!(config.defaults.synthesis_depth, SynthesisDepth::Brief);
    assert_eq!(config.defaults.render_interval_ms, 250);
    assert_eq!(config.defaults.output, Path::new("answers.md"));
    // unspecified keys keep their defaults
    assert_eq!(config.defaults.timeout_secs, None);

    let gpt = &config.models["gpt-4.1"];
    assert_eq!(gpt.timeout_secs, 45);
    assert_eq!(gpt.tier(), Tier::Slow);
    assert!(gpt.vision);
    assert_eq!(config.models["o3-deep-research"].poll_interval_secs, Some(30));

    let registry = Registry::from_config(&config);
    assert_eq!(
        registry.preset("research").map(<[String]>::to_vec),
        Some(vec!["gpt-4.1".to_string(), "o3-deep-research".to_string()])
    );
}

#[test]
fn custom_openai_compatible_model_is_registered() {
    // SAFETY: the variable name is unique to this test.
    unsafe { std::env::set_var("CHORUS_TEST_LOCAL_KEY", "local-key") };
    let mut config = base();
    let raw = r#"
        [defaults]
        timeout_secs = 90

        [models.local-llama]
        base_url = "http://localhost:11434/v1/chat/completions"
        api_key_env = "CHORUS_TEST_LOCAL_KEY"
        model_id = "llama3.1:70b"
        provider = "ollama"
    "#;

    config.apply_toml(raw, Path::new("chorus.toml")).unwrap();

    let m = &config.models["local-llama"];
    assert_eq!(m.model_id, "llama3.1:70b");
    assert_eq!(m.provider, "ollama");
    assert_eq!(m.timeout_secs, 120);
    assert_eq!(config.defaults.timeout_secs, Some(90));
    assert_eq!(m.tier(), Tier::Quick);
    match &m.backend {
        BackendConfig::Http { base_url, api_key, .. } => {
            assert_eq!(base_url, "http://localhost:11434/v1/chat/completions");
            assert_eq!(api_key, "local-key");
        }
        BackendConfig::Background { .. } => panic!("custom model must be an HTTP model"),
    }
}

#[test]
fn defaults_timeout_is_the_quick_model_fallback() {
    let mut config = base();
    assert_eq!(config.defaults.quick_timeout(None), None);
    assert_eq!(config.defaults.quick_timeout(Some(15)), Some(Duration::from_secs(15)));

    config
        .apply_toml("[defaults]\ntimeout_secs = 30\n", Path::new("chorus.toml"))
        .unwrap();

    assert_eq!(config.defaults.quick_timeout(None), Some(Duration::from_secs(30)));
    assert_eq!(
        config.defaults.quick_timeout(Some(15)),
        Some(Duration::from_secs(15)),
        "the command line wins"
    );

    let mut req = QueryRequest::new("q", vec!["gpt-4.1".to_string()]);
    req.default_timeout = config.defaults.quick_timeout(None);
    let registry = Registry::from_config(&config);
    let quick_model = registry.describe("gpt-4.1").unwrap();
    assert_eq!(req.timeout_for(quick_model), Duration::from_secs(30));
    let background_model = registry.describe("o3-deep-research").unwrap();
    assert_eq!(req.timeout_for(background_model), Duration::from_secs(1800));
}

#[test]
fn custom_model_without_its_key_is_skipped() {
    let mut config = base();
    let raw = r#"
        [models.orphan]
        base_url = "http://localhost:1/v1/chat/completions"
        api_key_env = "CHORUS_TEST_KEY_THAT_IS_NEVER_SET"
    "#;
    config.apply_toml(raw, Path::new("chorus.toml")).unwrap();
    assert!(!config.models.contains_key("orphan"));
}

#[test]
fn malformed_file_is_a_configuration_error() {
    let mut config = base();
    let err = config
        .apply_toml("[defaults\ntimeout_secs = ", Path::new("broken.toml"))
        .unwrap_err();
    assert!(matches!(err, ChorusError::Config(ref msg) if msg.contains("broken.toml")));
    assert!(err.is_fatal());
}
