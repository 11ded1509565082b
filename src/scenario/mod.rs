//! The edge-case scenarios.
//!
//! Each scenario sets up a listener and peer roles through a [`Harness`],
//! provokes one condition, and checks the outcome through the
//! [`oracle`](crate::oracle). A scenario passes when `run` returns `Ok`; the
//! report carries what was observed on the way.
//!
//! - [`SaturateScenario`]: a non-blocking send into a peer that never reads
//! - [`LargeSendScenario`]: a timed send larger than the socket buffers
//! - [`HandshakeChurnScenario`]: handshakes racing raw connects and listener
//!   teardown

mod handshake_churn;
mod large_send;
mod saturate;

pub use handshake_churn::{ChurnReport, HandshakeChurnScenario};
pub use large_send::{LargeSendReport, LargeSendScenario};
pub use saturate::{SaturateReport, SaturateScenario};

use crate::error::Error;
use crate::harness::Harness;
use crate::transport::SecureStream;
use tracing::{error, info, warn};

/// One edge case, runnable against a [`Harness`].
pub trait Scenario: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, harness: &Harness) -> Result<ScenarioReport, Error>;
}

/// What a passing scenario observed.
#[derive(Debug, Clone)]
pub enum ScenarioReport {
    Saturate(SaturateReport),
    LargeSend(LargeSendReport),
    HandshakeChurn(ChurnReport),
}

/// Every scenario, in the order [`run_all`] runs them.
pub fn all() -> Vec<Box<dyn Scenario>> {
    vec![
        Box::new(SaturateScenario),
        Box::new(LargeSendScenario),
        Box::new(HandshakeChurnScenario),
    ]
}

pub fn by_name(name: &str) -> Option<Box<dyn Scenario>> {
    all().into_iter().find(|scenario| scenario.name() == name)
}

/// Runs `scenarios` one after another and returns each result by name.
pub fn run_scenarios(
    harness: &Harness,
    scenarios: &[Box<dyn Scenario>],
) -> Vec<(&'static str, Result<ScenarioReport, Error>)> {
    scenarios
        .iter()
        .map(|scenario| {
            let name = scenario.name();
            info!(scenario = name, "Running scenario");
            let result = scenario.run(harness);
            match &result {
                Ok(report) => info!(scenario = name, ?report, "Scenario passed"),
                Err(err) => error!(scenario = name, %err, "Scenario failed"),
            }
            (name, result)
        })
        .collect()
}

pub fn run_all(harness: &Harness) -> Vec<(&'static str, Result<ScenarioReport, Error>)> {
    run_scenarios(harness, &all())
}

// Combines the main flow's result with a role's. The main flow's error wins;
// when the main flow only failed because the role never became ready, the
// role's own failure explains more.
pub(crate) fn settle<T, R>(main: Result<T, Error>, role: Result<R, Error>) -> Result<(T, R), Error> {
    match (main, role) {
        (Ok(main), Ok(role)) => Ok((main, role)),
        (Err(Error::RoleNotReady { .. }), Err(role_err)) => Err(role_err),
        (Err(main_err), Err(role_err)) => {
            warn!(%role_err, "Role also failed");
            Err(main_err)
        }
        (Err(main_err), Ok(_)) => Err(main_err),
        (Ok(_), Err(role_err)) => Err(role_err),
    }
}

// Teardown never fails a scenario; problems are logged.
pub(crate) fn close_quietly(stream: Option<SecureStream>) {
    if let Some(stream) = stream {
        if let Err(err) = stream.close() {
            warn!(%err, "Error closing stream during teardown");
        }
    }
}
