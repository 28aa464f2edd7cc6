//! Upstream providers: where a model is served and how to talk to it.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use config::{ProviderConfig, ProviderType, RelayConfig};
use reqwest::{
    Client,
    header::{CONNECTION, CONTENT_TYPE, HeaderMap, HeaderValue},
};
use secrecy::{ExposeSecret, SecretString};

use crate::{
    error::{RelayError, RelayResult},
    stream::upstream::Framing,
    transformer::{ClaudeTransformer, GeminiTransformer, OpenAiTransformer, Transformer},
};

const DEFAULT_OPENAI_API_URL: &str = "https://api.openai.com/v1";
const DEFAULT_GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Resolves a model to the upstream that serves it.
///
/// Channel selection and failover are up to the implementation; the relay
/// dispatches to whatever upstream is returned and never retries.
#[async_trait]
pub trait ProviderRegistry: Send + Sync {
    async fn resolve(&self, model: &str) -> RelayResult<Arc<Upstream>>;
}

/// A live upstream: its wire format, address and credentials.
pub struct Upstream {
    name: String,
    kind: ProviderType,
    base_url: String,
    api_key: Option<SecretString>,
    client: Client,
}

impl Upstream {
    pub fn new(name: impl Into<String>, config: &ProviderConfig) -> RelayResult<Self> {
        let name = name.into();

        let client = client_builder(config.timeout).build().map_err(|e| {
            log::error!("Failed to create HTTP client for provider '{name}': {e}");
            RelayError::InternalError(None)
        })?;

        let base_url = config.base_url.clone().unwrap_or_else(|| {
            match config.kind {
                ProviderType::Openai => DEFAULT_OPENAI_API_URL,
                ProviderType::Gemini => DEFAULT_GEMINI_API_URL,
                ProviderType::Anthropic => DEFAULT_ANTHROPIC_API_URL,
            }
            .to_string()
        });

        Ok(Self {
            name,
            kind: config.kind,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ProviderType {
        self.kind
    }

    /// The transformer speaking this upstream's format.
    pub(crate) fn transformer(&self) -> &'static dyn Transformer {
        match self.kind {
            ProviderType::Openai => &OpenAiTransformer,
            ProviderType::Gemini => &GeminiTransformer,
            ProviderType::Anthropic => &ClaudeTransformer,
        }
    }

    pub(crate) fn framing(&self) -> Framing {
        match self.kind {
            ProviderType::Openai => Framing::Lines,
            ProviderType::Gemini | ProviderType::Anthropic => Framing::EventSource,
        }
    }

    pub(crate) fn chat_url(&self, model: &str, stream: bool) -> String {
        match (self.kind, stream) {
            (ProviderType::Openai, _) => format!("{}/chat/completions", self.base_url),
            (ProviderType::Gemini, false) => format!("{}/models/{model}:generateContent", self.base_url),
            (ProviderType::Gemini, true) => format!("{}/models/{model}:streamGenerateContent?alt=sse", self.base_url),
            (ProviderType::Anthropic, _) => format!("{}/messages", self.base_url),
        }
    }

    pub(crate) fn image_url(&self, model: &str) -> RelayResult<String> {
        match self.kind {
            ProviderType::Openai => Ok(format!("{}/images/generations", self.base_url)),
            ProviderType::Gemini => Ok(format!("{}/models/{model}:predict", self.base_url)),
            ProviderType::Anthropic => Err(RelayError::InvalidRequest(format!(
                "provider '{}' does not generate images",
                self.name
            ))),
        }
    }

    /// Posts a JSON body. Non-success statuses become errors carrying the
    /// upstream's message.
    pub(crate) async fn post(&self, url: &str, body: Vec<u8>) -> RelayResult<reqwest::Response> {
        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(body);

        if self.kind == ProviderType::Anthropic {
            request = request.header("anthropic-version", ANTHROPIC_VERSION);
        }

        if let Some(key) = &self.api_key {
            request = match self.kind {
                ProviderType::Openai => request.bearer_auth(key.expose_secret()),
                ProviderType::Gemini => request.header("x-goog-api-key", key.expose_secret()),
                ProviderType::Anthropic => request.header("x-api-key", key.expose_secret()),
            };
        }

        let response = request.send().await.map_err(|e| {
            log::error!("Failed to send request to provider '{}': {e}", self.name);
            RelayError::ConnectionError(format!("Failed to send request to {}: {e}", self.name))
        })?;

        let status = response.status();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            log::error!("Provider '{}' API error ({status}): {error_text}", self.name);

            return Err(RelayError::from_upstream_status(status.as_u16(), error_text));
        }

        Ok(response)
    }
}

/// Each upstream gets its own pooled client so request timeouts can differ.
fn client_builder(timeout: Duration) -> reqwest::ClientBuilder {
    let mut headers = HeaderMap::new();
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));

    Client::builder()
        .timeout(timeout)
        // short idle timeout so pooled connections follow upstream DNS changes
        .pool_idle_timeout(Some(Duration::from_secs(5)))
        .tcp_nodelay(true)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .default_headers(headers)
}

/// Routes models to the providers of the relay configuration, in declaration
/// order. The first provider with a matching route wins.
pub struct ConfigProviderRegistry {
    upstreams: Vec<(ProviderConfig, Arc<Upstream>)>,
}

impl ConfigProviderRegistry {
    pub fn new(config: &RelayConfig) -> RelayResult<Self> {
        let upstreams = config
            .providers
            .iter()
            .map(|(name, provider)| Ok((provider.clone(), Arc::new(Upstream::new(name, provider)?))))
            .collect::<RelayResult<Vec<_>>>()?;

        Ok(Self { upstreams })
    }
}

#[async_trait]
impl ProviderRegistry for ConfigProviderRegistry {
    async fn resolve(&self, model: &str) -> RelayResult<Arc<Upstream>> {
        let upstream = self
            .upstreams
            .iter()
            .find(|(provider, _)| provider.serves(model))
            .map(|(_, upstream)| upstream.clone())
            .ok_or_else(|| RelayError::ModelNotFound(model.to_string()))?;

        log::debug!("Model {model} is served by provider '{}'", upstream.name());

        Ok(upstream)
    }
}
