//! HTTP server hosting the relay endpoints.

mod error;
pub mod logger;

use std::net::SocketAddr;

use axum::{Router, routing::get};
use axum_server::tls_rustls::RustlsConfig;
use config::Config;
use tokio::net::TcpListener;

pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;

pub struct ServeConfig {
    pub listen_address: SocketAddr,
    pub config: Config,
}

/// Builds the application router from the configuration.
pub fn app(config: &Config) -> Result<Router> {
    let mut app = Router::new().route("/health", get(health));

    if config.relay.enabled {
        if !config.relay.has_providers() {
            log::warn!("Relay is enabled but no providers are configured, every model will be rejected");
        }

        app = app.merge(relay::router(config).map_err(Error::Relay)?);
    }

    Ok(app)
}

pub async fn serve(ServeConfig { listen_address, config }: ServeConfig) -> crate::Result<()> {
    let app = app(&config)?;

    let listener = TcpListener::bind(listen_address).await.map_err(Error::Bind)?;

    match &config.server.tls {
        Some(tls_config) => {
            let rustls_config = RustlsConfig::from_pem_file(&tls_config.certificate, &tls_config.key)
                .await
                .map_err(|e| Error::Tls(e.to_string()))?;

            if config.relay.enabled {
                log::info!("Relay endpoints available at: https://{listen_address}{}", config.relay.path);
            }

            // axum-server takes a std listener
            let std_listener = listener.into_std().map_err(Error::Bind)?;

            axum_server::from_tcp_rustls(std_listener, rustls_config)
                .serve(app.into_make_service())
                .await
                .map_err(|e| Error::Server(std::io::Error::other(e)))?;
        }
        None => {
            if config.relay.enabled {
                log::info!("Relay endpoints available at: http://{listen_address}{}", config.relay.path);
            }

            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .map_err(Error::Server)?;
        }
    }

    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for the shutdown signal: {e}");
        return std::future::pending().await;
    }

    log::info!("Shutdown signal received, draining connections");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_can_be_disabled() {
        let mut config = Config::default();
        config.relay.enabled = false;

        assert!(app(&config).is_ok());
    }

    #[test]
    fn relay_mounts_without_providers() {
        assert!(app(&Config::default()).is_ok());
    }
}
