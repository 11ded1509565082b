use std::time::Duration;
use thiserror::Error;

/// The error type for tlsedge operations.
///
/// Covers socket and TLS failures, configuration problems, failures of
/// spawned roles and failed scenario assertions. Use [`Error::kind()`] to
/// classify an error instead of matching on variants; the kind is what the
/// [`oracle`](crate::oracle) reasons about.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(std::io::Error),

    /// A non-blocking operation could not complete without suspending.
    #[error("{operation} would block")]
    WouldBlock { operation: &'static str },

    /// A timed operation exceeded its deadline.
    #[error("{operation} timed out{}", .after.as_ref().map(|d| format!(" after {d:?}")).unwrap_or_default())]
    Timeout {
        operation: &'static str,
        /// The configured timeout, if known. Timeouts reported by the OS
        /// carry no duration.
        after: Option<Duration>,
    },

    /// The peer closed the connection without a TLS close_notify.
    #[error("Peer closed connection without close_notify")]
    UnexpectedEof,

    /// The listener could not bind its address. Fatal to a scenario.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    /// The provided socket address could not be parsed or resolved.
    #[error("Invalid socket address '{0}'")]
    InvalidAddress(String),

    /// The listener was torn down while an accept was pending.
    #[error("Listener closed")]
    ListenerClosed,

    /// Internal polling mechanism encountered an error.
    #[error("Poll error: {0}")]
    PollError(String),

    // ============================================================================
    // TLS Errors
    // ============================================================================

    /// Failed to load TLS certificate file from disk.
    #[error("Failed to load certificate from {path}: {source}")]
    TlsCertificateLoad {
        path: String,
        source: std::io::Error,
    },

    /// Failed to load TLS private key file from disk.
    #[error("Failed to load private key from {path}: {source}")]
    TlsKeyLoad {
        path: String,
        source: std::io::Error,
    },

    /// Certificate file format is invalid or unsupported.
    #[error("Invalid certificate format: {0}")]
    TlsInvalidCertificate(String),

    /// Private key file format is invalid or unsupported.
    #[error("Invalid private key format: {0}")]
    TlsInvalidKey(String),

    /// Server name for TLS SNI is invalid.
    #[error("Invalid server name '{0}'")]
    TlsInvalidServerName(String),

    /// TLS handshake failed during connection establishment.
    ///
    /// This includes the peer closing or resetting the connection before the
    /// handshake completed.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// TLS protocol error after the handshake completed.
    #[error("TLS protocol error: {0}")]
    TlsProtocol(#[from] rustls::Error),

    /// Failed to build TLS server configuration from provided settings.
    #[error("Failed to build TLS server config: {0}")]
    TlsServerConfigBuild(String),

    /// Failed to build TLS client configuration from provided settings.
    #[error("Failed to build TLS client config: {0}")]
    TlsClientConfigBuild(String),

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A configuration value is out of its accepted range.
    #[error("Invalid value for '{key}': {reason}")]
    InvalidConfigValue { key: String, reason: String },

    // ============================================================================
    // Role and Scenario Errors
    // ============================================================================

    /// A spawned role returned an error. Reported at the role's join point.
    #[error("Role '{name}' failed: {source}")]
    RoleFailed {
        name: String,
        #[source]
        source: Box<Error>,
    },

    /// A spawned role panicked. Reported at the role's join point.
    #[error("Role '{name}' panicked: {message}")]
    RolePanicked { name: String, message: String },

    /// A role finished without ever signalling readiness.
    #[error("Role '{name}' finished before signalling readiness")]
    RoleNotReady { name: String },

    /// A scenario observed an outcome other than the expected one.
    #[error("Scenario '{scenario}' failed: {reason}")]
    ScenarioFailed {
        scenario: &'static str,
        reason: String,
    },
}

/// Classification of an [`Error`], independent of platform or variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    WouldBlock,
    Timeout,
    /// Handshake never completed (peer closed, reset, or protocol mismatch).
    Handshake,
    /// Record-layer failure after the handshake.
    Protocol,
    UnexpectedEof,
    /// The peer reset or aborted an established connection.
    ConnectionReset,
    ConnectionRefused,
    ListenerClosed,
    /// Certificate, key, address or configuration problems.
    Setup,
    Role,
    Scenario,
    Io,
}

impl Error {
    /// Returns the kind of this error.
    ///
    /// Role failures are classified by the error they wrap, so a role that
    /// failed with a timeout has kind [`ErrorKind::Timeout`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(err) => match err.kind() {
                std::io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
                std::io::ErrorKind::UnexpectedEof => ErrorKind::UnexpectedEof,
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe => ErrorKind::ConnectionReset,
                _ => ErrorKind::Io,
            },
            Error::WouldBlock { .. } => ErrorKind::WouldBlock,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::UnexpectedEof => ErrorKind::UnexpectedEof,
            Error::ListenerClosed => ErrorKind::ListenerClosed,
            Error::PollError(_) => ErrorKind::Io,
            Error::TlsHandshake(_) => ErrorKind::Handshake,
            Error::TlsProtocol(_) => ErrorKind::Protocol,
            Error::Bind { .. }
            | Error::InvalidAddress(_)
            | Error::TlsCertificateLoad { .. }
            | Error::TlsKeyLoad { .. }
            | Error::TlsInvalidCertificate(_)
            | Error::TlsInvalidKey(_)
            | Error::TlsInvalidServerName(_)
            | Error::TlsServerConfigBuild(_)
            | Error::TlsClientConfigBuild(_)
            | Error::Config(_)
            | Error::InvalidConfigValue { .. } => ErrorKind::Setup,
            Error::RoleFailed { source, .. } => source.kind(),
            Error::RolePanicked { .. } | Error::RoleNotReady { .. } => ErrorKind::Role,
            Error::ScenarioFailed { .. } => ErrorKind::Scenario,
        }
    }

    pub(crate) fn timeout(operation: &'static str, after: Duration) -> Self {
        Error::Timeout {
            operation,
            after: Some(after),
        }
    }
}

// Platform-specific spellings of "would block" and "timed out" are folded into
// the shared variants here, so nothing above the transport sees them.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock => Error::WouldBlock { operation: "io" },
            std::io::ErrorKind::TimedOut => Error::Timeout {
                operation: "io",
                after: None,
            },
            _ => Error::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn io_errors_are_normalized() {
        let err: Error = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);

        let err: Error = io::Error::from(io::ErrorKind::TimedOut).into();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let err: Error = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert_eq!(err.kind(), ErrorKind::ConnectionRefused);

        let err: Error = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert_eq!(err.kind(), ErrorKind::ConnectionReset);

        let err: Error = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn role_failure_keeps_inner_kind() {
        let err = Error::RoleFailed {
            name: "acceptor".to_string(),
            source: Box::new(Error::timeout("recv", Duration::from_millis(5))),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("acceptor"));
        assert!(err.to_string().contains("timed out after"));
    }
}
