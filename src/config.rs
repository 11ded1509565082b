use crate::error::Error;
use ::config::Config;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Lower bound for `churn_connections`; fewer connections do not reproduce
/// the teardown race reliably.
pub const MIN_CHURN_CONNECTIONS: usize = 100;

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, config::ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, config::ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_u64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u64, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key))
}

pub(crate) fn get_namespaced_string(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<String, config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_string)
}

// Missing keys fall back to the default; present but malformed keys are errors.
fn optional<T>(result: Result<T, config::ConfigError>) -> Result<Option<T>, Error> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(config::ConfigError::NotFound(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn millis(config: &Config, name: &str, key: &str, default: u64) -> Result<Duration, Error> {
    let ms = optional(get_namespaced_u64(config, name, key))?.unwrap_or(default);
    Ok(Duration::from_millis(ms))
}

/// Settings for a harness run.
///
/// # Configuration Keys
///
/// Lookup follows `{name}.{key}` first, then `{key}`.
///
/// - `tls_server_cert`, `tls_server_key`: PEM files for the listener (required)
/// - `tls_ca_cert`: PEM file the client trusts (defaults to `tls_server_cert`)
/// - `tls_server_name`: SNI name the client sends (defaults to `localhost`)
/// - `bind_address`: listener address (defaults to `127.0.0.1:0`)
/// - `send_timeout_ms`: timeout of the large-send client (defaults to 100)
/// - `connect_timeout_ms`: bound for well-formed connects and server-side
///   handshakes (defaults to 10000)
/// - `ready_timeout_ms`: how long to wait for a role's readiness (defaults to 5000)
/// - `saturate_repeat`: repetitions of `b"hello"` in the saturating payload
///   (defaults to 100000000)
/// - `churn_connections`: raw connect/close cycles, at least 100 (defaults to 1000)
/// - `churn_clients`: concurrent churn roles (defaults to 4)
///
/// # Example
///
/// ```toml
/// tls_server_cert = "certs/server.crt"
/// tls_server_key = "certs/server.key"
///
/// [ci]
/// send_timeout_ms = 250
/// churn_connections = 200
/// ```
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub tls_server_cert: String,
    pub tls_server_key: String,
    pub tls_ca_cert: String,
    pub tls_server_name: String,
    pub bind_address: SocketAddr,
    pub send_timeout: Duration,
    pub connect_timeout: Duration,
    pub ready_timeout: Duration,
    pub saturate_repeat: usize,
    pub churn_connections: usize,
    pub churn_clients: usize,
}

impl HarnessConfig {
    /// Reads the harness settings from un-namespaced keys.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::from_config_named(config, "")
    }

    /// Reads the harness settings, preferring keys under `name`.
    pub fn from_config_named(config: &Config, name: &str) -> Result<Self, Error> {
        let tls_server_cert = get_namespaced_string(config, name, "tls_server_cert")?;
        let tls_server_key = get_namespaced_string(config, name, "tls_server_key")?;
        let tls_ca_cert = optional(get_namespaced_string(config, name, "tls_ca_cert"))?
            .unwrap_or_else(|| tls_server_cert.clone());
        let tls_server_name = optional(get_namespaced_string(config, name, "tls_server_name"))?
            .unwrap_or_else(|| "localhost".to_string());

        let bind_str = optional(get_namespaced_string(config, name, "bind_address"))?
            .unwrap_or_else(|| "127.0.0.1:0".to_string());
        let bind_address = bind_str
            .to_socket_addrs()
            .map_err(|_| Error::InvalidAddress(bind_str.clone()))?
            .next()
            .ok_or_else(|| Error::InvalidAddress(bind_str.clone()))?;

        let churn_connections = optional(get_namespaced_usize(config, name, "churn_connections"))?
            .unwrap_or(1000);
        if churn_connections < MIN_CHURN_CONNECTIONS {
            return Err(Error::InvalidConfigValue {
                key: "churn_connections".to_string(),
                reason: format!("must be at least {MIN_CHURN_CONNECTIONS}, got {churn_connections}"),
            });
        }

        let churn_clients =
            optional(get_namespaced_usize(config, name, "churn_clients"))?.unwrap_or(4);
        if churn_clients == 0 {
            return Err(Error::InvalidConfigValue {
                key: "churn_clients".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            tls_server_cert,
            tls_server_key,
            tls_ca_cert,
            tls_server_name,
            bind_address,
            send_timeout: millis(config, name, "send_timeout_ms", 100)?,
            connect_timeout: millis(config, name, "connect_timeout_ms", 10_000)?,
            ready_timeout: millis(config, name, "ready_timeout_ms", 5_000)?,
            saturate_repeat: optional(get_namespaced_usize(config, name, "saturate_repeat"))?
                .unwrap_or(100_000_000),
            churn_connections,
            churn_clients,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> config::builder::ConfigBuilder<config::builder::DefaultState> {
        Config::builder()
            .set_default("tls_server_cert", "cert.pem")
            .unwrap()
            .set_default("tls_server_key", "key.pem")
            .unwrap()
    }

    #[test]
    fn defaults_apply() {
        let config = base().build().unwrap();
        let harness = HarnessConfig::from_config(&config).unwrap();
        assert_eq!(harness.tls_ca_cert, "cert.pem");
        assert_eq!(harness.tls_server_name, "localhost");
        assert_eq!(harness.bind_address, "127.0.0.1:0".parse().unwrap());
        assert_eq!(harness.send_timeout, Duration::from_millis(100));
        assert_eq!(harness.saturate_repeat, 100_000_000);
        assert_eq!(harness.churn_connections, 1000);
        assert_eq!(harness.churn_clients, 4);
    }

    #[test]
    fn namespaced_keys_take_priority() {
        let config = base()
            .set_default("send_timeout_ms", 100)
            .unwrap()
            .set_default("ci.send_timeout_ms", 250)
            .unwrap()
            .build()
            .unwrap();
        let harness = HarnessConfig::from_config_named(&config, "ci").unwrap();
        assert_eq!(harness.send_timeout, Duration::from_millis(250));
        let harness = HarnessConfig::from_config_named(&config, "other").unwrap();
        assert_eq!(harness.send_timeout, Duration::from_millis(100));
    }

    #[test]
    fn missing_cert_is_an_error() {
        let config = Config::builder().build().unwrap();
        assert!(matches!(
            HarnessConfig::from_config(&config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn churn_below_minimum_is_rejected() {
        let config = base()
            .set_default("churn_connections", 10)
            .unwrap()
            .build()
            .unwrap();
        assert!(matches!(
            HarnessConfig::from_config(&config),
            Err(Error::InvalidConfigValue { .. })
        ));
    }
}
