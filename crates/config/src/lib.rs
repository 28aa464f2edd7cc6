//! Configuration for the relay gateway.

mod loader;
mod relay;
mod server;

use std::path::Path;

use serde::Deserialize;

pub use relay::{ModerationConfig, ProviderConfig, ProviderType, RelayConfig};
pub use server::{ServerConfig, TlsServerConfig};

/// Main configuration structure for the gateway.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// HTTP server configuration settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Relay endpoints and upstream providers.
    #[serde(default)]
    pub relay: RelayConfig,
}

impl Config {
    /// Load configuration from a TOML file, expanding `{{ env.NAME }}` placeholders
    /// and validating provider routes.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }
}
