use super::{close_quietly, settle, Scenario, ScenarioReport};
use crate::error::{Error, ErrorKind};
use crate::harness::Harness;
use crate::oracle::{Condition, ExpectedOutcome};
use crate::payload::Payload;
use crate::role;
use crate::transport::{BlockingMode, SecureStream};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const NAME: &str = "saturate";

/// Sends a payload far larger than any buffer over a non-blocking stream
/// whose peer never reads. The send has to stop with a would-block error
/// instead of suspending or claiming success.
#[derive(Debug, Clone, Copy, Default)]
pub struct SaturateScenario;

#[derive(Debug, Clone)]
pub struct SaturateReport {
    pub payload_len: usize,
    /// Time from the first send to the would-block error.
    pub elapsed: Duration,
    pub error_kind: ErrorKind,
    /// TLS version negotiated by the saturated connection.
    pub protocol_version: Option<rustls::ProtocolVersion>,
}

struct Saturated {
    client: SecureStream,
    outcome: Result<(), Error>,
    elapsed: Duration,
}

fn saturate(harness: &Harness, port: u16, payload: &Payload) -> Result<Saturated, Error> {
    let mut client = harness.connect(port, None)?;
    client.set_mode(BlockingMode::NonBlocking);

    debug!(len = payload.len(), "Saturating connection");
    let start = Instant::now();
    let outcome = client.send_payload(payload);
    Ok(Saturated {
        client,
        outcome,
        elapsed: start.elapsed(),
    })
}

impl Scenario for SaturateScenario {
    fn name(&self) -> &'static str {
        NAME
    }

    fn run(&self, harness: &Harness) -> Result<ScenarioReport, Error> {
        let config = harness.config();
        let payload = Payload::saturating(config.saturate_repeat);

        let mut listener = harness.listen()?;
        listener.set_handshake_timeout(Some(config.connect_timeout));
        let port = listener.port();
        let closer = listener.closer();

        // The acceptor hands the accepted stream back unread.
        let mut acceptor = role::spawn("saturate-acceptor", move |ready| {
            ready.signal();
            let (stream, peer_addr) = listener.accept()?;
            debug!(%peer_addr, "Holding accepted stream without reading");
            Ok(stream)
        })?;

        let main = acceptor
            .wait_ready(config.ready_timeout)
            .and_then(|()| saturate(harness, port, &payload));
        if main.is_err() {
            closer.close();
        }

        let (saturated, server) = settle(main, acceptor.join())?;
        let Saturated {
            client,
            outcome,
            elapsed,
        } = saturated;
        let protocol_version = client.protocol_version();
        close_quietly(Some(client));
        close_quietly(Some(server));

        let expected =
            ExpectedOutcome::for_condition(BlockingMode::NonBlocking, Condition::WouldNeedToBlock)
                .ok_or_else(|| Error::ScenarioFailed {
                    scenario: NAME,
                    reason: "no expected outcome for a non-blocking send".to_string(),
                })?;
        expected.check_result(NAME, &outcome)?;

        let error_kind = outcome.err().map_or(ErrorKind::WouldBlock, |err| err.kind());
        info!(len = payload.len(), ?elapsed, "Non-blocking send stopped with would-block");

        Ok(ScenarioReport::Saturate(SaturateReport {
            payload_len: payload.len(),
            elapsed,
            error_kind,
            protocol_version,
        }))
    }
}
