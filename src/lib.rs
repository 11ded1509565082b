//! tlsedge - edge-case harness for TLS stream sockets
//!
//! tlsedge drives a local TLS listener and concurrent peer roles through
//! conditions where socket semantics are easy to get wrong: a non-blocking
//! send into a saturated connection, a timed send larger than every buffer,
//! and handshakes racing connection churn and listener teardown. The
//! expected error for each condition comes from a single [`oracle`] keyed on
//! the endpoint's [`BlockingMode`].
//!
//! Settings are read with the `config` crate; see [`HarnessConfig`] for keys.

pub mod config;
pub(crate) mod error;
pub mod harness;
pub mod oracle;
pub mod payload;
pub mod role;
pub mod scenario;
pub(crate) mod transport;

// These are the intended public API
pub use crate::config::HarnessConfig;
pub use error::{Error, ErrorKind};
pub use harness::Harness;
pub use oracle::{expected_kind, Condition, ExpectedOutcome};
pub use payload::Payload;
pub use role::{Readiness, RoleHandle, RoleSet};
pub use scenario::{Scenario, ScenarioReport};
pub use transport::{
    connect_secure, create_secure_listener, BlockingMode, ListenerCloser, SecureConnector,
    SecureListener, SecureStream,
};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::config::HarnessConfig;
    pub use crate::error::{Error, ErrorKind};
    pub use crate::harness::Harness;
    pub use crate::oracle::{Condition, ExpectedOutcome};
    pub use crate::payload::Payload;
    pub use crate::scenario::{Scenario, ScenarioReport};
    pub use crate::transport::{BlockingMode, SecureListener, SecureStream};
}
