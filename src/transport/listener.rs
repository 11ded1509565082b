use super::stream::SecureStream;
use super::tls_config::load_tls_server_config;
use super::{wait_for_events, BlockingMode, Deadline};
use crate::error::Error;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const LISTENER: Token = Token(0);
const WAKE: Token = Token(1);
const EVENTS_CAPACITY: usize = 16;

/// A bound TCP listener whose accepted connections speak TLS.
///
/// [`accept`](Self::accept) waits for a connection according to the
/// listener's [`BlockingMode`] and then runs the server-side handshake under
/// the handshake timeout. Accepted streams start out in blocking mode.
///
/// Another thread can tear the listener down through a [`ListenerCloser`];
/// a pending accept then fails with [`Error::ListenerClosed`]. The socket
/// itself is released when the listener is dropped.
pub struct SecureListener {
    listener: TcpListener,
    config: Arc<rustls::ServerConfig>,
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    closed: Arc<AtomicBool>,
    local_addr: SocketAddr,
    mode: BlockingMode,
    handshake_timeout: Option<Duration>,
}

/// Closes a [`SecureListener`] from another thread.
#[derive(Clone)]
pub struct ListenerCloser {
    waker: Arc<Waker>,
    closed: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl ListenerCloser {
    /// Marks the listener closed and wakes a pending accept. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(local_addr = %self.local_addr, "Closing listener");
        if let Err(err) = self.waker.wake() {
            warn!(local_addr = %self.local_addr, ?err, "Failed to wake listener");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ListenerCloser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerCloser")
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SecureListener {
    /// Binds a listener. Port 0 picks an ephemeral port; see
    /// [`port`](Self::port) for the one chosen.
    pub fn bind(addr: SocketAddr, config: Arc<rustls::ServerConfig>) -> Result<Self, Error> {
        let mut listener =
            TcpListener::bind(addr).map_err(|source| Error::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE)?);

        info!(%local_addr, "Listening");

        Ok(Self {
            listener,
            config,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            waker,
            closed: Arc::new(AtomicBool::new(false)),
            local_addr,
            mode: BlockingMode::Blocking,
            handshake_timeout: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// How [`accept`](Self::accept) waits for an incoming connection.
    pub fn set_mode(&mut self, mode: BlockingMode) {
        self.mode = mode;
    }

    /// Bounds the server-side handshake of each accepted connection. `None`
    /// lets a silent client hold `accept` indefinitely.
    pub fn set_handshake_timeout(&mut self, timeout: Option<Duration>) {
        self.handshake_timeout = timeout;
    }

    pub fn closer(&self) -> ListenerCloser {
        ListenerCloser {
            waker: self.waker.clone(),
            closed: self.closed.clone(),
            local_addr: self.local_addr,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Accepts one connection and completes its handshake. Returns the
    /// stream and the peer address.
    ///
    /// A connection whose handshake fails is dropped and its error returned;
    /// the listener stays usable, so callers that serve many clients treat
    /// [`ErrorKind::Handshake`](crate::ErrorKind::Handshake) as "next".
    #[instrument(skip(self), fields(local_addr = %self.local_addr))]
    pub fn accept(&mut self) -> Result<(SecureStream, SocketAddr), Error> {
        let (stream, peer_addr) = self.accept_raw()?;
        info!(local_addr = %self.local_addr, %peer_addr, "Accepting connection");

        let handshake_mode = BlockingMode::from_timeout(self.handshake_timeout);
        let mut stream = SecureStream::server(stream, self.config.clone(), handshake_mode, peer_addr)?;
        stream.handshake(&Deadline::start(handshake_mode))?;
        stream.set_mode(BlockingMode::Blocking);
        Ok((stream, peer_addr))
    }

    /// Closes the listener. Same as dropping it.
    pub fn close(self) {}

    fn accept_raw(&mut self) -> Result<(TcpStream, SocketAddr), Error> {
        let deadline = Deadline::start(self.mode);
        loop {
            if self.is_closed() {
                return Err(Error::ListenerClosed);
            }

            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(%peer_addr, ?err, "Could not set TCP_NODELAY");
                    }
                    return Ok((stream, peer_addr));
                }
                Err(err) => match err.kind() {
                    ErrorKind::WouldBlock => {
                        self.poll.registry().reregister(
                            &mut self.listener,
                            LISTENER,
                            Interest::READABLE,
                        )?;
                        wait_for_events(&mut self.poll, &mut self.events, &deadline, "accept")?;
                    }
                    ErrorKind::Interrupted => continue,
                    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
                        warn!(?err, local_addr = %self.local_addr, "Transient accept error");
                        continue;
                    }
                    _ => {
                        warn!(?err, local_addr = %self.local_addr, "Error accepting connection");
                        return Err(err.into());
                    }
                },
            }
        }
    }
}

impl Drop for SecureListener {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        if let Err(err) = self.poll.registry().deregister(&mut self.listener) {
            debug!(?err, "Failed to deregister listener");
        }
        info!(local_addr = %self.local_addr, "Closed listener");
    }
}

impl std::fmt::Debug for SecureListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureListener")
            .field("local_addr", &self.local_addr)
            .field("mode", &self.mode)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Binds a TLS listener on `bind_address` with the given certificate and key.
pub fn create_secure_listener(
    bind_address: &str,
    cert_path: &str,
    key_path: &str,
) -> Result<SecureListener, Error> {
    let addr = bind_address
        .to_socket_addrs()
        .map_err(|_| Error::InvalidAddress(bind_address.to_string()))?
        .next()
        .ok_or_else(|| Error::InvalidAddress(bind_address.to_string()))?;
    let config = load_tls_server_config(cert_path, key_path)?;
    SecureListener::bind(addr, config)
}
