/*!
 * Prompt templates for chunk translation.
 *
 * A run is started with a `TemplateContext`: the prompt pair plus the
 * language pair and sampling temperature. Rendering it for a chunk fills
 * the placeholders `{source_language}`, `{target_language}`, `{dictionary}`
 * and `{text}`.
 */

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::app_config::Config;
use crate::errors::{EngineError, EngineResult};
use crate::language_utils;
use crate::providers::PromptContext;
use crate::translation::dictionary::CustomDictionary;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{(source_language|target_language|dictionary|text)\}").expect("placeholder regex is valid")
});

/// System and user prompt pair with placeholders
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    /// System prompt template
    pub system: String,
    /// User prompt template; must contain `{text}`
    pub user: String,
}

impl PromptTemplate {
    /// Default system prompt for chunk translation.
    pub const DEFAULT_SYSTEM: &'static str = "You are a professional translator. Translate the text you are given \
from {source_language} to {target_language}. Preserve paragraph breaks, formatting and tone. \
Reply with the translation only.\n{dictionary}";

    /// Create a new prompt template.
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }

    /// Whether the template can render a chunk at all
    pub fn is_usable(&self) -> bool {
        !self.user.trim().is_empty() && self.user.contains("{text}")
    }

    fn mentions_dictionary(&self) -> bool {
        self.system.contains("{dictionary}") || self.user.contains("{dictionary}")
    }
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SYSTEM, "{text}")
    }
}

/// Everything a run needs to turn chunks into provider prompts
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateContext {
    pub template: PromptTemplate,
    /// Source language code
    pub source_language: String,
    /// Target language code
    pub target_language: String,
    pub temperature: f32,
}

impl TemplateContext {
    pub fn new(
        template: PromptTemplate,
        source_language: impl Into<String>,
        target_language: impl Into<String>,
    ) -> Self {
        Self {
            template,
            source_language: source_language.into(),
            target_language: target_language.into(),
            temperature: 0.3,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Build the context from the configured prompts and languages
    pub fn from_config(config: &Config) -> Self {
        let common = &config.translation.common;
        Self::new(
            PromptTemplate::new(&common.system_prompt, &common.user_prompt),
            &config.source_language,
            &config.target_language,
        )
        .with_temperature(common.temperature)
    }

    /// Reject contexts that cannot drive a run
    pub fn validate(&self) -> EngineResult<()> {
        if !self.template.is_usable() {
            return Err(EngineError::InvalidState(
                "no usable prompt template selected: the user prompt must contain {text}".to_string(),
            ));
        }
        if self.target_language.trim().is_empty() {
            return Err(EngineError::InvalidState("no target language selected".to_string()));
        }
        Ok(())
    }

    /// Display name of a language code, or the code itself when unknown
    fn language_name(code: &str) -> String {
        language_utils::get_language_name(code).unwrap_or_else(|_| code.trim().to_string())
    }

    /// Render the prompts for one chunk
    pub fn render(&self, chunk_text: &str, dictionary: &CustomDictionary, reference: Option<String>) -> PromptContext {
        let source_language = Self::language_name(&self.source_language);
        let target_language = Self::language_name(&self.target_language);
        let block = dictionary.render_block();

        // One pass, so substituted values are never scanned for placeholders
        let fill = |template: &str, text: Option<&str>| {
            PLACEHOLDER
                .replace_all(template, |caps: &Captures| match &caps[1] {
                    "source_language" => source_language.clone(),
                    "target_language" => target_language.clone(),
                    "dictionary" => block.clone(),
                    _ => text.unwrap_or(&caps[0]).to_string(),
                })
                .into_owned()
        };

        let system_prompt = fill(&self.template.system, None).trim_end().to_string();
        let mut user_prompt = fill(&self.template.user, Some(chunk_text));
        if !block.is_empty() && !self.template.mentions_dictionary() {
            user_prompt = format!("{}\n{}", block, user_prompt);
        }

        PromptContext {
            system_prompt,
            user_prompt,
            source_text: chunk_text.to_string(),
            source_language,
            target_language,
            temperature: self.temperature,
            reference,
        }
    }
}
