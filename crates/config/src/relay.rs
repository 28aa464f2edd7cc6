//! Relay configuration: endpoint mounting, moderation and upstream providers.

use std::time::Duration;

use duration_str::deserialize_duration;
use indexmap::IndexMap;
use secrecy::SecretString;
use serde::Deserialize;

/// Relay endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Whether the relay endpoints are mounted.
    pub enabled: bool,

    /// Path prefix for the chat, messages and image endpoints.
    pub path: String,

    /// Capacity of the per-request event channel between the stream
    /// reassembly loop and the client connection.
    pub stream_buffer: usize,

    /// Answer housekeeping prompts (conversation titles, summaries) locally
    /// instead of dispatching them upstream.
    pub background_tasks: bool,

    /// Content moderation applied before dispatch.
    pub moderation: ModerationConfig,

    /// Upstream providers keyed by name.
    pub providers: IndexMap<String, ProviderConfig>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/v1".to_string(),
            stream_buffer: 32,
            background_tasks: true,
            moderation: ModerationConfig::default(),
            providers: IndexMap::new(),
        }
    }
}

impl RelayConfig {
    /// Whether there are any providers configured.
    pub fn has_providers(&self) -> bool {
        !self.providers.is_empty()
    }
}

/// Keyword based moderation settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModerationConfig {
    pub enabled: bool,
    /// Terms matched case-insensitively against the request text.
    pub blocked_terms: Vec<String>,
}

/// Wire format spoken by an upstream provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderType {
    /// OpenAI-shaped chat completions API.
    Openai,
    /// Google Gemini / Vertex `generateContent` API.
    Gemini,
    /// Anthropic Messages API.
    Anthropic,
}

/// A single upstream provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub kind: ProviderType,

    /// Custom base URL. Defaults to the public endpoint of the provider type.
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub api_key: Option<SecretString>,

    /// Request timeout for upstream calls.
    #[serde(default = "default_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,

    /// Model ids, or model id prefixes, routed to this provider.
    #[serde(default)]
    pub models: Vec<String>,
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

impl ProviderConfig {
    /// Whether the given model id is routed to this provider.
    pub fn serves(&self, model: &str) -> bool {
        self.models.iter().any(|route| model == route || model.starts_with(route.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use insta::assert_debug_snapshot;

    use super::*;

    #[test]
    fn provider_defaults() {
        let config = indoc! {r#"
            type = "openai"
        "#};

        let config: ProviderConfig = toml::from_str(config).unwrap();

        assert_debug_snapshot!(&config, @r#"
        ProviderConfig {
            kind: Openai,
            base_url: None,
            api_key: None,
            timeout: 60s,
            models: [],
        }
        "#);
    }

    #[test]
    fn api_key_is_redacted() {
        let config = indoc! {r#"
            type = "openai"
            api_key = "sk-very-secret"
        "#};

        let config: ProviderConfig = toml::from_str(config).unwrap();
        let debug = format!("{config:?}");

        assert!(!debug.contains("sk-very-secret"));
    }

    #[test]
    fn unknown_provider_type_is_rejected() {
        let config = indoc! {r#"
            type = "bedrock"
        "#};

        let error = toml::from_str::<ProviderConfig>(config).unwrap_err();

        assert!(error.to_string().contains("unknown variant `bedrock`"));
    }

    #[test]
    fn model_routes_match_exact_ids_and_prefixes() {
        let config = indoc! {r#"
            type = "gemini"
            models = ["gemini-", "claude-3-5-sonnet"]
        "#};

        let config: ProviderConfig = toml::from_str(config).unwrap();

        assert!(config.serves("gemini-2.5-pro"));
        assert!(config.serves("claude-3-5-sonnet"));
        assert!(!config.serves("gpt-4o"));
    }
}
