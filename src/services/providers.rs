use strum::{AsRefStr, Display, EnumIter, IntoEnumIterator};

use crate::config::AppConfig;

/// AI providers in fallback priority order (first is preferred).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum ProviderKind {
    OpenRouter,
    Gemini,
    OpenAi,
    Anthropic,
}

/// Request dialect a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `POST {base}/chat/completions` with function tools
    OpenAiChat,
    /// `POST {base}/messages` with `tool_use`
    AnthropicMessages,
}

impl ProviderKind {
    pub fn dialect(self) -> Dialect {
        match self {
            ProviderKind::Anthropic => Dialect::AnthropicMessages,
            _ => Dialect::OpenAiChat,
        }
    }
}

/// Everything needed to call one provider.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub model: String,
    pub api_key: String,
    pub base_url: String,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Picks provider configurations from whichever credentials are present.
#[derive(Debug, Clone, Default)]
pub struct ProviderSelector {
    configs: Vec<ProviderConfig>,
}

impl ProviderSelector {
    pub fn new(configs: Vec<ProviderConfig>) -> Self {
        Self { configs }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let configs = ProviderKind::iter()
            .filter_map(|kind| {
                let (key, model, base_url) = match kind {
                    ProviderKind::OpenRouter => (
                        &config.openrouter_api_key,
                        &config.openrouter_model,
                        &config.openrouter_base_url,
                    ),
                    ProviderKind::Gemini => (
                        &config.gemini_api_key,
                        &config.gemini_model,
                        &config.gemini_base_url,
                    ),
                    ProviderKind::OpenAi => (
                        &config.openai_api_key,
                        &config.openai_model,
                        &config.openai_base_url,
                    ),
                    ProviderKind::Anthropic => (
                        &config.anthropic_api_key,
                        &config.anthropic_model,
                        &config.anthropic_base_url,
                    ),
                };
                let api_key = key.as_deref().map(str::trim).filter(|k| !k.is_empty())?;
                Some(ProviderConfig {
                    kind,
                    model: model.clone(),
                    api_key: api_key.to_string(),
                    base_url: base_url.trim_end_matches('/').to_string(),
                })
            })
            .collect();
        Self { configs }
    }

    /// Configured providers, highest priority first.
    pub fn available_configs(&self) -> &[ProviderConfig] {
        &self.configs
    }

    pub fn primary_config(&self) -> Result<&ProviderConfig, NoCredentials> {
        self.configs.first().ok_or(NoCredentials)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("No AI provider credentials are configured")]
pub struct NoCredentials;
