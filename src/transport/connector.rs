use super::stream::SecureStream;
use super::{BlockingMode, Deadline};
use crate::error::Error;

use mio::net::TcpStream;
use rustls::pki_types::ServerName;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

/// Opens client-side TLS connections with a fixed trust store and SNI name.
#[derive(Clone)]
pub struct SecureConnector {
    config: Arc<rustls::ClientConfig>,
    server_name: ServerName<'static>,
}

impl SecureConnector {
    pub fn new(config: Arc<rustls::ClientConfig>, server_name: &str) -> Result<Self, Error> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| Error::TlsInvalidServerName(server_name.to_string()))?;
        Ok(Self {
            config,
            server_name,
        })
    }

    /// Connects to `addr` and completes the client-side handshake.
    ///
    /// `timeout` bounds the TCP connect and the handshake together; `None`
    /// waits indefinitely. The returned stream keeps the same setting as its
    /// [`BlockingMode`] (see [`BlockingMode::from_timeout`]).
    #[instrument(skip(self))]
    pub fn connect(
        &self,
        addr: SocketAddr,
        timeout: Option<Duration>,
    ) -> Result<SecureStream, Error> {
        let mode = BlockingMode::from_timeout(timeout);
        // A zero timeout still has to get through the handshake somehow.
        let deadline = match mode {
            BlockingMode::NonBlocking => Deadline::start(BlockingMode::Blocking),
            mode => Deadline::start(mode),
        };

        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        info!(peer_addr = %addr, "Initiating connection");

        let mut stream = SecureStream::client(
            stream,
            self.config.clone(),
            self.server_name.clone(),
            mode,
            addr,
        )?;
        stream.finish_connect(&deadline)?;
        stream.handshake(&deadline)?;
        Ok(stream)
    }
}

impl std::fmt::Debug for SecureConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureConnector")
            .field("server_name", &self.server_name)
            .finish()
    }
}

/// Connects to `127.0.0.1:port` with `connector`. See
/// [`SecureConnector::connect`].
pub fn connect_secure(
    connector: &SecureConnector,
    port: u16,
    timeout: Option<Duration>,
) -> Result<SecureStream, Error> {
    connector.connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port)), timeout)
}
