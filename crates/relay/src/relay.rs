//! The endpoint-level driver: owns the request lifecycle from the client body
//! to the final usage record.

mod chat;
mod claude;
mod image;

use std::sync::Arc;

use config::RelayConfig;
use serde::Deserialize;

use crate::{
    error::{RelayError, RelayResult, TransformError},
    moderation::{self, Moderator},
    provider::{ConfigProviderRegistry, ProviderRegistry},
    usage::{LogUsageSink, TiktokenEstimator, TokenEstimator, UsageRecord, UsageSink},
};

/// Shared state of the relay endpoints. Immutable after construction.
pub(crate) struct Relay {
    registry: Arc<dyn ProviderRegistry>,
    moderator: Box<dyn Moderator>,
    estimator: Arc<dyn TokenEstimator>,
    usage_sink: Arc<dyn UsageSink>,
    /// Capacity of the per-request channels between upstream, reassembly and client.
    stream_buffer: usize,
    /// Whether housekeeping prompts on the messages endpoint are answered locally.
    background_tasks: bool,
}

impl Relay {
    fn record_usage(&self, record: UsageRecord) {
        self.usage_sink.record(record);
    }
}

/// Assembles the relay from its configuration. The collaborators built from
/// the configuration can be replaced before the router is created.
pub struct RelayBuilder {
    path: String,
    relay: Relay,
}

impl RelayBuilder {
    pub fn new(config: &RelayConfig) -> RelayResult<Self> {
        let relay = Relay {
            registry: Arc::new(ConfigProviderRegistry::new(config)?),
            moderator: moderation::from_config(&config.moderation),
            estimator: Arc::new(TiktokenEstimator::new()?),
            usage_sink: Arc::new(LogUsageSink),
            stream_buffer: config.stream_buffer,
            background_tasks: config.background_tasks,
        };

        Ok(Self {
            path: config.path.clone(),
            relay,
        })
    }

    pub fn registry(mut self, registry: impl ProviderRegistry + 'static) -> Self {
        self.relay.registry = Arc::new(registry);
        self
    }

    pub fn moderator(mut self, moderator: impl Moderator + 'static) -> Self {
        self.relay.moderator = Box::new(moderator);
        self
    }

    pub fn estimator(mut self, estimator: impl TokenEstimator + 'static) -> Self {
        self.relay.estimator = Arc::new(estimator);
        self
    }

    pub fn usage_sink(mut self, usage_sink: impl UsageSink + 'static) -> Self {
        self.relay.usage_sink = Arc::new(usage_sink);
        self
    }

    pub(crate) fn build(self) -> (String, Relay) {
        (self.path, self.relay)
    }
}

/// Just enough of a client body to route it.
#[derive(Deserialize)]
struct ModelProbe {
    #[serde(default)]
    model: String,
}

fn probe_model(body: &[u8]) -> RelayResult<String> {
    let probe: ModelProbe =
        sonic_rs::from_slice(body).map_err(|e| TransformError::UnsupportedSourceFormat(e.to_string()))?;

    if probe.model.trim().is_empty() {
        return Err(RelayError::InvalidRequest("model is required".to_string()));
    }

    Ok(probe.model)
}
