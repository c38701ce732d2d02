/*!
 * Tests for application configuration functionality
 */

use chunkwise::app_config::{Config, LogLevel, ProviderConfig, TranslationProvider};
use chunkwise::translation::FailurePolicy;
use chunkwise::TemplateContext;
use crate::common;

/// Test default configuration values
#[test]
fn test_default_config_withNoParameters_shouldHaveCorrectDefaults() {
    let config = Config::default();

    assert_eq!(config.source_language, "en");
    assert_eq!(config.target_language, "fr");
    assert_eq!(config.translation.provider, TranslationProvider::Ollama);
    assert_eq!(config.log_level, LogLevel::Info);
    assert_eq!(config.engine.failure_policy, FailurePolicy::FailWhenStalled);

    let ollama = config
        .translation
        .get_active_provider_config()
        .expect("Ollama provider config should exist");
    assert_eq!(ollama.model, "llama3.2:3b");
    assert_eq!(ollama.endpoint, "http://localhost:11434");
}

/// Test provider settings fall back to the built-in defaults
#[test]
fn test_providerLookups_withMissingEntries_shouldFallBackToDefaults() {
    let mut config = Config::default();
    config.translation.provider = TranslationProvider::Anthropic;
    config.translation.available_providers.clear();

    assert_eq!(config.translation.get_model(), ProviderConfig::new(TranslationProvider::Anthropic).model);
    assert_eq!(config.translation.get_endpoint(), "https://api.anthropic.com");
    assert_eq!(config.translation.get_api_key(), "");
    assert_eq!(config.translation.get_rate_limit(), Some(45));
}

/// Test a custom provider entry wins over the defaults
#[test]
fn test_providerLookups_withCustomEntry_shouldUseIt() {
    let mut config = Config::default();
    if let Some(ollama) = config
        .translation
        .available_providers
        .iter_mut()
        .find(|p| p.provider_type == "ollama")
    {
        ollama.model = "qwen2.5:7b".to_string();
        ollama.timeout_secs = 0;
    }

    assert_eq!(config.translation.get_model(), "qwen2.5:7b");
    // Zero is not a usable timeout
    assert_eq!(config.translation.get_timeout_secs(), 120);
}

/// Test configuration validation
#[test]
fn test_config_validation_withVariousConfigs_shouldValidateCorrectly() {
    let mut config = Config::default();
    assert!(config.validate().is_ok());

    config.source_language = "zz1".to_string();
    assert!(config.validate().is_err());
    config.source_language = "en".to_string();

    config.translation.common.user_prompt = "Translate this".to_string();
    assert!(config.validate().is_err());
    config.translation.common.user_prompt = "Translate: {text}".to_string();
    assert!(config.validate().is_ok());

    config.engine.page_size = 0;
    assert!(config.validate().is_err());
}

/// Test loading a hand-written config file
#[test]
fn test_fromFile_withPartialJson_shouldFillDefaults() -> anyhow::Result<()> {
    let dir = common::create_temp_dir()?;
    let path = common::create_test_file(
        dir.path(),
        "conf.json",
        r#"{
            "source_language": "ja",
            "target_language": "en",
            "translation": {
                "provider": "mock",
                "common": { "user_prompt": "Please translate:\n{text}", "temperature": 0.1 }
            },
            "log_level": "debug"
        }"#,
    )?;

    let config = Config::from_file(&path)?;

    assert!(config.validate().is_ok());
    assert_eq!(config.log_level, LogLevel::Debug);
    assert_eq!(config.engine.chunk_size, 2000);
    assert_eq!(config.translation.common.retry_count, 3);

    let ctx = TemplateContext::from_config(&config);
    assert_eq!(ctx.source_language, "ja");
    assert_eq!(ctx.template.user, "Please translate:\n{text}");
    assert!((ctx.temperature - 0.1).abs() < f32::EPSILON);
    Ok(())
}

/// Test a malformed config file is reported
#[test]
fn test_fromFile_withInvalidJson_shouldFail() -> anyhow::Result<()> {
    let dir = common::create_temp_dir()?;
    let path = common::create_test_file(dir.path(), "conf.json", "{ not json")?;
    assert!(Config::from_file(&path).is_err());
    Ok(())
}
