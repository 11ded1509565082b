//! TLS transport on top of non-blocking sockets.
//!
//! Every socket here is non-blocking at the OS level. Blocking and timed
//! behaviour is emulated per operation by waiting for readiness on a
//! [`mio::Poll`] with an optional deadline, which is what lets one thread
//! stall on a send while another keeps accepting and reading.
//!
//! - [`SecureListener`]: bound listener whose `accept` performs the
//!   server-side handshake
//! - [`SecureConnector`] / [`connect_secure`]: raw connect followed by the
//!   client-side handshake
//! - [`SecureStream`]: an established TLS connection with a [`BlockingMode`]

mod connector;
mod listener;
mod stream;
pub(crate) mod tls_config;

pub use connector::{connect_secure, SecureConnector};
pub use listener::{create_secure_listener, ListenerCloser, SecureListener};
pub use stream::SecureStream;

use crate::error::Error;
use mio::{Events, Poll};
use std::io::ErrorKind;
use std::time::{Duration, Instant};

/// How an endpoint behaves when an operation cannot complete right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingMode {
    /// Suspend the caller until the operation can complete.
    Blocking,
    /// Fail with [`Error::WouldBlock`] instead of suspending.
    NonBlocking,
    /// Suspend for at most the given duration, then fail with
    /// [`Error::Timeout`].
    Timeout(Duration),
}

impl BlockingMode {
    /// Maps an optional timeout the way socket timeouts usually work: `None`
    /// blocks, zero is non-blocking, anything else is timed.
    pub fn from_timeout(timeout: Option<Duration>) -> Self {
        match timeout {
            None => BlockingMode::Blocking,
            Some(d) if d.is_zero() => BlockingMode::NonBlocking,
            Some(d) => BlockingMode::Timeout(d),
        }
    }

    /// The timeout in effect, if any.
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            BlockingMode::Timeout(d) => Some(*d),
            _ => None,
        }
    }
}

impl Default for BlockingMode {
    fn default() -> Self {
        BlockingMode::Blocking
    }
}

// A deadline fixed when an operation starts. All waits within that operation
// draw from it, so retries after spurious wakeups do not extend it.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Deadline {
    Never,
    Immediate,
    At { at: Instant, timeout: Duration },
}

impl Deadline {
    pub(crate) fn start(mode: BlockingMode) -> Self {
        match mode {
            BlockingMode::Blocking => Deadline::Never,
            BlockingMode::NonBlocking => Deadline::Immediate,
            BlockingMode::Timeout(timeout) => Deadline::At {
                at: Instant::now() + timeout,
                timeout,
            },
        }
    }

    pub(crate) fn may_wait(&self) -> bool {
        !matches!(self, Deadline::Immediate)
    }

    // Time left to wait, or the error to report when no waiting is allowed.
    pub(crate) fn remaining(&self, operation: &'static str) -> Result<Option<Duration>, Error> {
        match *self {
            Deadline::Never => Ok(None),
            Deadline::Immediate => Err(Error::WouldBlock { operation }),
            Deadline::At { at, timeout } => {
                let left = at.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    Err(Error::timeout(operation, timeout))
                } else {
                    Ok(Some(left))
                }
            }
        }
    }
}

// Waits once for readiness events. Callers retry their operation afterwards
// and come back here on WouldBlock; the deadline turns the retry loop into a
// timeout.
pub(crate) fn wait_for_events(
    poll: &mut Poll,
    events: &mut Events,
    deadline: &Deadline,
    operation: &'static str,
) -> Result<(), Error> {
    let timeout = deadline.remaining(operation)?;
    match poll.poll(events, timeout) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::Interrupted => Ok(()),
        Err(err) => Err(Error::PollError(err.to_string())),
    }
}
