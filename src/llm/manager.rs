//! LLM manager for provider credentials and HTTP client.
//!
//! The manager is intentionally simple — it holds API keys and an HTTP
//! client. Which model a turn uses is decided by the chat configuration,
//! not here.

use crate::config::LlmConfig;
use crate::error::LlmError;
use anyhow::Context as _;

// Default API endpoints per provider (used when no base_url is configured).
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const DEFAULT_DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com/v1/chat/completions";

/// Manages LLM provider credentials and the shared HTTP client.
pub struct LlmManager {
    config: LlmConfig,
    http_client: reqwest::Client,
}

impl LlmManager {
    /// Create a new LLM manager with the given configuration.
    pub fn new(config: LlmConfig) -> crate::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .with_context(|| "failed to build HTTP client")?;

        Ok(Self {
            config,
            http_client,
        })
    }

    /// Get the appropriate API key for a provider.
    pub fn get_api_key(&self, provider: &str) -> Result<String, LlmError> {
        match provider {
            "openai" => self
                .config
                .openai_key
                .clone()
                .ok_or_else(|| LlmError::MissingProviderKey("openai".into())),
            "openrouter" => self
                .config
                .openrouter_key
                .clone()
                .ok_or_else(|| LlmError::MissingProviderKey("openrouter".into())),
            "deepseek" => self
                .config
                .deepseek_key
                .clone()
                .ok_or_else(|| LlmError::MissingProviderKey("deepseek".into())),
            _ => Err(LlmError::UnknownProvider(provider.into())),
        }
    }

    /// Get the base URL for a provider, falling back to the default.
    pub fn get_base_url(&self, provider: &str) -> Result<&str, LlmError> {
        match provider {
            "openai" => Ok(self
                .config
                .openai_base_url
                .as_deref()
                .unwrap_or(DEFAULT_OPENAI_BASE_URL)),
            "openrouter" => Ok(self
                .config
                .openrouter_base_url
                .as_deref()
                .unwrap_or(DEFAULT_OPENROUTER_BASE_URL)),
            "deepseek" => Ok(self
                .config
                .deepseek_base_url
                .as_deref()
                .unwrap_or(DEFAULT_DEEPSEEK_BASE_URL)),
            _ => Err(LlmError::UnknownProvider(provider.into())),
        }
    }

    /// Get the HTTP client.
    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    /// Resolve a model name to provider and model components.
    /// Format: "provider/model-name" or just "model-name" (defaults to openai).
    pub fn resolve_model(&self, model_name: &str) -> (String, String) {
        match model_name.split_once('/') {
            Some((provider, model)) => (provider.to_string(), model.to_string()),
            None => ("openai".to_string(), model_name.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_provider_prefixed_models() {
        let manager = LlmManager::new(LlmConfig::default()).unwrap();
        assert_eq!(
            manager.resolve_model("deepseek/deepseek-chat"),
            ("deepseek".into(), "deepseek-chat".into())
        );
        assert_eq!(
            manager.resolve_model("gpt-4o"),
            ("openai".into(), "gpt-4o".into())
        );
    }

    #[test]
    fn missing_key_is_reported_per_provider() {
        let manager = LlmManager::new(LlmConfig::default()).unwrap();
        assert!(matches!(
            manager.get_api_key("openai"),
            Err(LlmError::MissingProviderKey(_))
        ));
        assert!(matches!(
            manager.get_api_key("nope"),
            Err(LlmError::UnknownProvider(_))
        ));
    }
}
