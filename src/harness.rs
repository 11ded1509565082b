use crate::config::HarnessConfig;
use crate::error::Error;
use crate::transport::tls_config::{load_tls_client_config, load_tls_server_config};
use crate::transport::{connect_secure, SecureConnector, SecureListener, SecureStream};
use ::config::Config;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Shared fixture for scenarios: settings plus the TLS configs built from
/// them, loaded once and reused for every listener and connection.
#[derive(Debug)]
pub struct Harness {
    config: HarnessConfig,
    server_config: Arc<rustls::ServerConfig>,
    connector: SecureConnector,
}

impl Harness {
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::from_harness_config(HarnessConfig::from_config(config)?)
    }

    /// Like [`new`](Self::new), preferring keys namespaced under `name`.
    pub fn new_named(config: &Config, name: &str) -> Result<Self, Error> {
        Self::from_harness_config(HarnessConfig::from_config_named(config, name)?)
    }

    pub fn from_harness_config(config: HarnessConfig) -> Result<Self, Error> {
        let server_config = load_tls_server_config(&config.tls_server_cert, &config.tls_server_key)?;
        let client_config = load_tls_client_config(&config.tls_ca_cert)?;
        let connector = SecureConnector::new(client_config, &config.tls_server_name)?;

        info!(
            cert = %config.tls_server_cert,
            server_name = %config.tls_server_name,
            "Loaded TLS configuration"
        );

        Ok(Self {
            config,
            server_config,
            connector,
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Binds a fresh listener on the configured bind address.
    pub fn listen(&self) -> Result<SecureListener, Error> {
        SecureListener::bind(self.config.bind_address, self.server_config.clone())
    }

    pub fn connector(&self) -> &SecureConnector {
        &self.connector
    }

    /// Connects to the local listener on `port`.
    pub fn connect(&self, port: u16, timeout: Option<Duration>) -> Result<SecureStream, Error> {
        connect_secure(&self.connector, port, timeout)
    }
}
