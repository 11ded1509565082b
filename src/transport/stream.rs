//! Established TLS connections.
//!
//! A [`SecureStream`] owns a non-blocking [`mio::net::TcpStream`] and the
//! rustls connection layered on it. Each public operation fixes a
//! [`Deadline`] from the stream's [`BlockingMode`] when it starts, then loops
//! over "try the socket, wait for readiness" until it completes, the deadline
//! runs out, or the mode forbids waiting at all.

use super::{wait_for_events, BlockingMode, Deadline};
use crate::error::Error;
use crate::payload::{Payload, WINDOW};

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use rustls::pki_types::ServerName;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

const STREAM: Token = Token(0);
const EVENTS_CAPACITY: usize = 8;

// Unread inbound bytes turn close() into a reset, so a closing stream reads
// and discards up to this many chunks first.
const CLOSE_DISCARD_CHUNKS: usize = 64;

// Internal enum for TLS connection type
pub(super) enum TlsConnection {
    Server(rustls::ServerConnection),
    Client(rustls::ClientConnection),
}

impl TlsConnection {
    fn read_tls(&mut self, stream: &mut TcpStream) -> Result<usize, io::Error> {
        match self {
            TlsConnection::Server(conn) => conn.read_tls(stream),
            TlsConnection::Client(conn) => conn.read_tls(stream),
        }
    }

    fn write_tls(&mut self, stream: &mut TcpStream) -> Result<usize, io::Error> {
        match self {
            TlsConnection::Server(conn) => conn.write_tls(stream),
            TlsConnection::Client(conn) => conn.write_tls(stream),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            TlsConnection::Server(conn) => conn.process_new_packets(),
            TlsConnection::Client(conn) => conn.process_new_packets(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            TlsConnection::Server(conn) => conn.wants_write(),
            TlsConnection::Client(conn) => conn.wants_write(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsConnection::Server(conn) => conn.writer(),
            TlsConnection::Client(conn) => conn.writer(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsConnection::Server(conn) => conn.reader(),
            TlsConnection::Client(conn) => conn.reader(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            TlsConnection::Server(conn) => conn.is_handshaking(),
            TlsConnection::Client(conn) => conn.is_handshaking(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            TlsConnection::Server(conn) => conn.send_close_notify(),
            TlsConnection::Client(conn) => conn.send_close_notify(),
        }
    }

    fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        match self {
            TlsConnection::Server(conn) => conn.protocol_version(),
            TlsConnection::Client(conn) => conn.protocol_version(),
        }
    }

    fn side(&self) -> &'static str {
        match self {
            TlsConnection::Server(_) => "server",
            TlsConnection::Client(_) => "client",
        }
    }
}

// Resets and aborts during the handshake mean the peer went away before the
// secure channel existed; they are handshake failures, not I/O failures.
fn handshake_io_error(err: io::Error) -> Error {
    match err.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => {
            Error::TlsHandshake(format!("peer closed connection during handshake: {err}"))
        }
        _ => err.into(),
    }
}

/// A TLS connection over a TCP stream it exclusively owns.
///
/// Created by [`SecureConnector::connect`](super::SecureConnector::connect)
/// or [`SecureListener::accept`](super::SecureListener::accept). Dropping
/// the stream closes it; use [`close`](Self::close) to observe close errors.
pub struct SecureStream {
    stream: TcpStream,
    tls_conn: TlsConnection,
    poll: Poll,
    events: Events,
    mode: BlockingMode,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    close_notify_queued: bool,
    closed: bool,
}

// ============================================================================
// Constructors
// ============================================================================

impl SecureStream {
    fn new(
        mut stream: TcpStream,
        tls_conn: TlsConnection,
        mode: BlockingMode,
        peer_addr: SocketAddr,
    ) -> Result<Self, Error> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut stream, STREAM, Interest::READABLE | Interest::WRITABLE)?;
        let local_addr = stream.local_addr()?;

        Ok(Self {
            stream,
            tls_conn,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            mode,
            local_addr,
            peer_addr,
            close_notify_queued: false,
            closed: false,
        })
    }

    pub(super) fn client(
        stream: TcpStream,
        config: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
        mode: BlockingMode,
        peer_addr: SocketAddr,
    ) -> Result<Self, Error> {
        let tls_conn = rustls::ClientConnection::new(config, server_name)
            .map_err(|e| Error::TlsClientConfigBuild(e.to_string()))?;
        Self::new(stream, TlsConnection::Client(tls_conn), mode, peer_addr)
    }

    pub(super) fn server(
        stream: TcpStream,
        config: Arc<rustls::ServerConfig>,
        mode: BlockingMode,
        peer_addr: SocketAddr,
    ) -> Result<Self, Error> {
        let tls_conn = rustls::ServerConnection::new(config)
            .map_err(|e| Error::TlsServerConfigBuild(e.to_string()))?;
        Self::new(stream, TlsConnection::Server(tls_conn), mode, peer_addr)
    }
}

// ============================================================================
// Settings
// ============================================================================

impl SecureStream {
    pub fn mode(&self) -> BlockingMode {
        self.mode
    }

    /// Changes how later operations behave. Operations already in progress
    /// keep the deadline they started with.
    pub fn set_mode(&mut self, mode: BlockingMode) {
        debug!(local_addr = %self.local_addr, peer_addr = %self.peer_addr, ?mode, "Blocking mode changed");
        self.mode = mode;
    }

    pub fn set_nonblocking(&mut self, nonblocking: bool) {
        self.set_mode(if nonblocking {
            BlockingMode::NonBlocking
        } else {
            BlockingMode::Blocking
        });
    }

    /// Same mapping as [`BlockingMode::from_timeout`].
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.set_mode(BlockingMode::from_timeout(timeout));
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        self.tls_conn.protocol_version()
    }
}

// ============================================================================
// Connection Establishment
// ============================================================================

impl SecureStream {
    // Completes a non-blocking TCP connect.
    pub(super) fn finish_connect(&mut self, deadline: &Deadline) -> Result<(), Error> {
        loop {
            if let Some(err) = self.stream.take_error()? {
                info!(local_addr = %self.local_addr, peer_addr = %self.peer_addr, ?err, "TCP connection failed");
                return Err(err.into());
            }
            match self.stream.peer_addr() {
                Ok(_) => {
                    info!(local_addr = %self.local_addr, peer_addr = %self.peer_addr, "TCP connection established");
                    return Ok(());
                }
                Err(err) if err.kind() == ErrorKind::NotConnected => {
                    self.wait(Interest::WRITABLE, deadline, "connect")?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub(super) fn handshake(&mut self, deadline: &Deadline) -> Result<(), Error> {
        let local_addr = self.local_addr;
        let peer_addr = self.peer_addr;
        let side = self.tls_conn.side();

        while self.tls_conn.is_handshaking() {
            while self.tls_conn.wants_write() {
                match self.tls_conn.write_tls(&mut self.stream) {
                    Ok(sz) => {
                        trace!(len = sz, %local_addr, %peer_addr, "Wrote handshake data to socket")
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {
                        self.wait(Interest::WRITABLE, deadline, "handshake")?;
                    }
                    Err(err) if err.kind() == ErrorKind::Interrupted => {}
                    Err(err) => return Err(handshake_io_error(err)),
                }
            }

            if !self.tls_conn.is_handshaking() {
                break;
            }

            match self.tls_conn.read_tls(&mut self.stream) {
                Ok(0) => {
                    warn!(side, %local_addr, %peer_addr, "Peer closed connection during handshake");
                    return Err(Error::TlsHandshake(
                        "peer closed connection during handshake".to_string(),
                    ));
                }
                Ok(sz) => {
                    trace!(len = sz, %local_addr, %peer_addr, "Read handshake data from socket");
                    if let Err(err) = self.tls_conn.process_new_packets() {
                        warn!(side, %local_addr, %peer_addr, ?err, "TLS handshake rejected");
                        // Give the peer the alert rustls queued, if the socket takes it.
                        let _ = self.drain_tls();
                        return Err(Error::TlsHandshake(err.to_string()));
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    self.wait(Interest::READABLE, deadline, "handshake")?;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(handshake_io_error(err)),
            }
        }

        // The last flight (client Finished, server tickets) may still be queued.
        self.flush_tls(deadline, "handshake").map_err(|err| match err {
            Error::Io(err) => handshake_io_error(err),
            other => other,
        })?;

        info!(
            side,
            %local_addr,
            %peer_addr,
            version = ?self.tls_conn.protocol_version(),
            "TLS handshake completed"
        );
        Ok(())
    }
}

// ============================================================================
// Data Operations
// ============================================================================

impl SecureStream {
    /// Sends some prefix of `buf` and returns its length.
    ///
    /// The bytes are handed to the TLS record layer, which holds a bounded
    /// amount of unsent records. In blocking mode the call returns once the
    /// records carrying those bytes reached the socket. Timed mode waits the
    /// same way, but when the deadline passes after the record layer took
    /// some bytes, the count is still returned and the records stay queued
    /// for the next send or `close`. In
    /// non-blocking mode it returns as soon as the record layer accepted
    /// anything, and fails with [`Error::WouldBlock`] when neither the record
    /// layer nor the socket can take more; it never reports success for bytes
    /// it did not accept.
    #[instrument(skip(self, buf), fields(len = buf.len()))]
    pub fn send(&mut self, buf: &[u8]) -> Result<usize, Error> {
        let deadline = Deadline::start(self.mode);
        self.send_with_deadline(buf, &deadline)
    }

    /// Sends all of `buf`. The whole call shares one deadline.
    #[instrument(skip(self, buf), fields(len = buf.len()))]
    pub fn send_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        let deadline = Deadline::start(self.mode);
        self.send_all_with_deadline(buf, &deadline).map_err(|(sent, err)| {
            debug!(sent, len = buf.len(), %err, "Send stopped early");
            err
        })
    }

    /// Streams a [`Payload`] window by window. The whole call shares one
    /// deadline.
    #[instrument(skip(self, payload), fields(len = payload.len()))]
    pub fn send_payload(&mut self, payload: &Payload) -> Result<(), Error> {
        let deadline = Deadline::start(self.mode);
        let mut window = Vec::with_capacity(WINDOW);
        let mut offset = 0;
        while offset < payload.len() {
            payload.window(offset, WINDOW, &mut window);
            if let Err((sent, err)) = self.send_all_with_deadline(&window, &deadline) {
                debug!(sent = offset + sent, len = payload.len(), %err, "Payload send stopped early");
                return Err(err);
            }
            offset += window.len();
        }
        debug!(len = payload.len(), "Sent payload");
        Ok(())
    }

    /// Receives into `buf`. `Ok(0)` means the peer closed cleanly
    /// (close_notify); a close without it is [`Error::UnexpectedEof`].
    #[instrument(skip(self, buf))]
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let deadline = Deadline::start(self.mode);
        self.recv_with_deadline(buf, &deadline)
    }

    /// Fills `buf` completely. The whole call shares one deadline.
    pub fn recv_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let deadline = Deadline::start(self.mode);
        let mut filled = 0;
        while filled < buf.len() {
            match self.recv_with_deadline(&mut buf[filled..], &deadline)? {
                0 => return Err(Error::UnexpectedEof),
                sz => filled += sz,
            }
        }
        Ok(())
    }

    /// Appends everything up to the peer's close to `out`.
    ///
    /// Each underlying receive gets its own deadline, so a timed stream
    /// fails only when the peer goes quiet for the whole timeout. Bytes
    /// received before an error stay in `out`.
    pub fn recv_to_end(&mut self, out: &mut Vec<u8>) -> Result<(), Error> {
        let mut chunk = vec![0u8; 16 * 1024];
        loop {
            match self.recv(&mut chunk)? {
                0 => return Ok(()),
                sz => out.extend_from_slice(&chunk[..sz]),
            }
        }
    }

    /// Sends close_notify and closes the socket.
    ///
    /// Pending records are flushed as far as the stream's [`BlockingMode`]
    /// allows; whatever is left when that runs out is dropped and the peer
    /// sees a truncated stream. Dropping the stream closes it without
    /// waiting at all.
    pub fn close(mut self) -> Result<(), Error> {
        self.queue_close_notify();
        let deadline = Deadline::start(self.mode);
        match self.flush_tls(&deadline, "close") {
            Ok(()) => {}
            Err(err @ (Error::WouldBlock { .. } | Error::Timeout { .. })) => {
                debug!(local_addr = %self.local_addr, peer_addr = %self.peer_addr, %err, "Closing with unsent records");
            }
            Err(err) => {
                let _ = self.shutdown();
                return Err(err);
            }
        }
        self.shutdown()
    }
}

// ============================================================================
// Internal Connection I/O
// ============================================================================

impl SecureStream {
    fn send_with_deadline(&mut self, buf: &[u8], deadline: &Deadline) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            // Zero means the record layer is at its buffer limit.
            let accepted = self.tls_conn.writer().write(buf)?;
            let drained = self.drain_tls()?;

            if accepted > 0 {
                trace!(len = accepted, local_addr = %self.local_addr, peer_addr = %self.peer_addr, "Wrote plaintext to TLS");
                // Accepted bytes are committed to the record layer and count as
                // sent even if the flush runs out of time.
                if deadline.may_wait() {
                    match self.flush_tls(deadline, "send") {
                        Ok(()) => {}
                        Err(err @ (Error::WouldBlock { .. } | Error::Timeout { .. })) => {
                            debug!(len = accepted, %err, "Sent bytes still queued in TLS");
                        }
                        Err(err) => return Err(err),
                    }
                }
                return Ok(accepted);
            }

            if drained == 0 {
                self.wait(Interest::WRITABLE, deadline, "send")?;
            }
        }
    }

    fn send_all_with_deadline(
        &mut self,
        buf: &[u8],
        deadline: &Deadline,
    ) -> Result<(), (usize, Error)> {
        let mut sent = 0;
        while sent < buf.len() {
            match self.send_with_deadline(&buf[sent..], deadline) {
                Ok(sz) => sent += sz,
                Err(err) => return Err((sent, err)),
            }
        }
        Ok(())
    }

    fn recv_with_deadline(&mut self, buf: &mut [u8], deadline: &Deadline) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        let local_addr = self.local_addr;
        let peer_addr = self.peer_addr;

        loop {
            match self.tls_conn.reader().read(buf) {
                Ok(sz) => {
                    if sz == 0 {
                        debug!(%local_addr, %peer_addr, "Peer sent close_notify");
                    } else {
                        trace!(len = sz, %local_addr, %peer_addr, "Read plaintext from TLS");
                    }
                    return Ok(sz);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                    debug!(%local_addr, %peer_addr, "Peer closed without close_notify");
                    return Err(Error::UnexpectedEof);
                }
                Err(err) => return Err(err.into()),
            }

            match self.tls_conn.read_tls(&mut self.stream) {
                Ok(0) => {
                    // The reader reports a clean or truncated close on the next pass.
                    debug!(%local_addr, %peer_addr, "Socket reached end of stream");
                }
                Ok(sz) => {
                    trace!(len = sz, %local_addr, %peer_addr, "Read encrypted data from socket");
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    self.wait(Interest::READABLE, deadline, "recv")?;
                    continue;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }

            if let Err(err) = self.tls_conn.process_new_packets() {
                let _ = self.drain_tls();
                return Err(err.into());
            }

            // Post-handshake messages may queue a response.
            if let Err(err) = self.drain_tls() {
                debug!(%local_addr, %peer_addr, %err, "Could not flush post-handshake response");
            }
        }
    }

    // Pushes queued records to the socket until it stops taking them.
    // Returns the number of bytes written.
    fn drain_tls(&mut self) -> Result<usize, Error> {
        let mut written = 0;
        while self.tls_conn.wants_write() {
            match self.tls_conn.write_tls(&mut self.stream) {
                Ok(0) => break,
                Ok(sz) => {
                    trace!(len = sz, local_addr = %self.local_addr, peer_addr = %self.peer_addr, "Wrote encrypted data to socket");
                    written += sz;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(written)
    }

    fn flush_tls(&mut self, deadline: &Deadline, operation: &'static str) -> Result<(), Error> {
        loop {
            self.drain_tls()?;
            if !self.tls_conn.wants_write() {
                return Ok(());
            }
            self.wait(Interest::WRITABLE, deadline, operation)?;
        }
    }

    fn wait(
        &mut self,
        interest: Interest,
        deadline: &Deadline,
        operation: &'static str,
    ) -> Result<(), Error> {
        // Re-arming with only the interest we need makes edge-triggered
        // readiness report the current state instead of a stale edge.
        deadline.remaining(operation)?;
        self.poll
            .registry()
            .reregister(&mut self.stream, STREAM, interest)?;
        wait_for_events(&mut self.poll, &mut self.events, deadline, operation)
    }

    fn queue_close_notify(&mut self) {
        if !self.close_notify_queued && !self.tls_conn.is_handshaking() {
            self.tls_conn.send_close_notify();
            self.close_notify_queued = true;
        }
    }

    fn shutdown(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.queue_close_notify();
        let flushed = self.drain_tls();

        if let Err(err) = self.stream.shutdown(Shutdown::Write) {
            if err.kind() != ErrorKind::NotConnected {
                debug!(local_addr = %self.local_addr, peer_addr = %self.peer_addr, ?err, "Error shutting down connection");
            }
        }

        let mut scratch = [0u8; 16 * 1024];
        for _ in 0..CLOSE_DISCARD_CHUNKS {
            match self.stream.read(&mut scratch) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }

        if let Err(err) = self.poll.registry().deregister(&mut self.stream) {
            debug!(?err, "Failed to deregister connection");
        }
        info!(local_addr = %self.local_addr, peer_addr = %self.peer_addr, "Closed connection");
        flushed.map(|_| ())
    }
}

impl Drop for SecureStream {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(local_addr = %self.local_addr, peer_addr = %self.peer_addr, %err, "Error closing connection");
        }
    }
}

impl std::fmt::Debug for SecureStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureStream")
            .field("side", &self.tls_conn.side())
            .field("mode", &self.mode)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}
